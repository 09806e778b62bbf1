use super::runner::{ClientError, CommandInvocation, CommandOutput, CommandRunner};
use crate::dispatcher::{MARKED_LINE, OPENED_LINE, RED_LIGHT_LINE, SAVED_LINE, updated_line};
use camino::{Utf8Path, Utf8PathBuf};

/// An entity as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub index: Option<usize>,
    pub name: String,
    pub type_code: Option<i32>,
}

/// Parse one `[i] name (Type: t)` line.
///
/// Returns `None` for lines that are not entity lines. An unparsable index or
/// type code is kept as `None` rather than rejecting the line.
pub fn parse_entity_line(line: &str) -> Option<EntityDescriptor> {
    let line = line.trim();
    let rest = line.strip_prefix('[')?;
    let (index, rest) = rest.split_once(']')?;
    let (name, type_part) = match rest.split_once("(Type:") {
        Some((name, type_part)) => (name, Some(type_part)),
        None => (rest, None),
    };

    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let type_code = type_part.and_then(|t| t.trim().trim_end_matches(')').trim().parse().ok());

    Some(EntityDescriptor {
        index: index.trim().parse().ok(),
        name: name.to_string(),
        type_code,
    })
}

/// Typed interface to the command dispatcher.
///
/// Success of each command is judged from its fixed success line, so a
/// dispatcher that exits 0 but never prints that line is still a failure.
/// The client remembers the document opened last and passes it along with
/// every session command.
pub struct BridgeClient<R: CommandRunner> {
    runner: R,
    current_file: Option<Utf8PathBuf>,
}

impl<R: CommandRunner> BridgeClient<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            current_file: None,
        }
    }

    /// Document of the last successful `open`.
    pub fn current_file(&self) -> Option<&Utf8Path> {
        self.current_file.as_deref()
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn into_runner(self) -> R {
        self.runner
    }

    async fn run(&mut self, invocation: CommandInvocation) -> Result<CommandOutput, ClientError> {
        self.runner.run(&invocation).await
    }

    fn session_invocation(&self, command: &str) -> Option<CommandInvocation> {
        match &self.current_file {
            Some(document) => {
                Some(CommandInvocation::new(command).document(Some(document.as_path())))
            }
            None => {
                tracing::error!("No EZD file is open; cannot run '{}'", command);
                None
            }
        }
    }

    /// Diagnostic text from the dispatcher.
    pub async fn info(&mut self) -> Result<String, ClientError> {
        let output = self.run(CommandInvocation::new("info")).await?;
        Ok(output.stdout)
    }

    /// Open `path` as the current document.
    pub async fn open(&mut self, path: &Utf8Path) -> Result<bool, ClientError> {
        if !path.exists() {
            tracing::error!("EZD file not found: {}", path);
            self.current_file = None;
            return Ok(false);
        }

        let output = self
            .run(CommandInvocation::new("open").arg(path.as_str()))
            .await?;

        if output.has_line(OPENED_LINE) {
            tracing::info!("Opened EZD file: {}", path);
            self.current_file = Some(path.to_path_buf());
            Ok(true)
        } else {
            tracing::error!(
                "Failed to open EZD file: {} (code {:?})",
                path,
                output.error_code()
            );
            self.current_file = None;
            Ok(false)
        }
    }

    /// Set the text of `entity` in the current document.
    pub async fn update_text(&mut self, entity: &str, text: &str) -> Result<bool, ClientError> {
        let Some(invocation) = self.session_invocation("update") else {
            return Ok(false);
        };

        let output = self.run(invocation.arg(entity).arg(text)).await?;
        let updated = output.has_line(&updated_line(entity));
        if updated {
            tracing::info!("Updated entity '{}' with text: {}", entity, text);
        } else {
            tracing::error!("Failed to update entity '{}'", entity);
        }
        Ok(updated)
    }

    /// Mark one entity, or everything when `entity` is `None`.
    pub async fn mark(&mut self, entity: Option<&str>) -> Result<bool, ClientError> {
        let Some(mut invocation) = self.session_invocation("mark") else {
            return Ok(false);
        };
        if let Some(entity) = entity {
            invocation = invocation.arg(entity);
        }

        let output = self.run(invocation).await?;
        let marked = output.has_line(MARKED_LINE);
        match (marked, entity) {
            (true, Some(name)) => tracing::info!("Marked entity: {}", name),
            (true, None) => tracing::info!("Marked all entities"),
            (false, _) => tracing::error!("Marking failed: {:?}", output.error_code()),
        }
        Ok(marked)
    }

    /// Point the red-light indicator at `(x, y)` in document coordinates.
    pub async fn red_light(&mut self, x: f64, y: f64) -> Result<bool, ClientError> {
        let Some(invocation) = self.session_invocation("red") else {
            return Ok(false);
        };

        let output = self
            .run(invocation.arg(x.to_string()).arg(y.to_string()))
            .await?;
        let positioned = output.has_line(RED_LIGHT_LINE);
        if positioned {
            tracing::info!("Red light positioned at X={}, Y={}", x, y);
        } else {
            tracing::error!("Failed to position red light");
        }
        Ok(positioned)
    }

    /// Entities of the current document, in library order.
    pub async fn list_entity_descriptors(&mut self) -> Result<Vec<EntityDescriptor>, ClientError> {
        let Some(invocation) = self.session_invocation("list") else {
            return Ok(Vec::new());
        };

        let output = self.run(invocation).await?;
        let entities: Vec<EntityDescriptor> =
            output.stdout.lines().filter_map(parse_entity_line).collect();
        tracing::info!("Found {} entities", entities.len());
        Ok(entities)
    }

    /// Entity names of the current document.
    pub async fn list_entities(&mut self) -> Result<Vec<String>, ClientError> {
        Ok(self
            .list_entity_descriptors()
            .await?
            .into_iter()
            .map(|entity| entity.name)
            .collect())
    }

    /// Save the current document to `path`.
    pub async fn save(&mut self, path: &Utf8Path) -> Result<bool, ClientError> {
        let Some(invocation) = self.session_invocation("save") else {
            return Ok(false);
        };

        let output = self.run(invocation.arg(path.as_str())).await?;
        let saved = output.has_line(SAVED_LINE);
        if saved {
            tracing::info!("Saved EZD file to: {}", path);
        } else {
            tracing::error!("Failed to save EZD file: {:?}", output.error_code());
        }
        Ok(saved)
    }
}
