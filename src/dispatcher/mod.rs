//! Command dispatcher - maps bridge commands onto marking library calls.
//!
//! The dispatcher owns the marking library and the single open [`Session`].
//! Each command writes human-readable status lines to the output; those lines
//! are the wire protocol read by [`crate::services::BridgeClient`], so their
//! wording is fixed:
//!
//! - each command ends with one fixed success line (the `*_LINE` constants)
//! - failure lines start with `ERROR:` and include the raw vendor code
//!
//! Other lines echo user input (paths, entity names, text) and carry no
//! meaning for success.
//!
//! When the dispatcher is dropped the library is closed, whatever happened
//! before. The `ezcad-bridge` binary relies on this to never leave the vendor
//! library half-open between processes.

pub mod command;
pub mod info;

pub use command::{Command, CommandError, USAGE};

use crate::ffi::{DocumentMode, MarkingLibrary, VendorStatus};
use camino::{Utf8Path, Utf8PathBuf};
use std::io::{self, Write};

pub const OPENED_LINE: &str = "File opened successfully.";
pub const MARKED_LINE: &str = "Marking completed successfully.";
pub const RED_LIGHT_LINE: &str = "Red light positioned successfully.";
pub const SAVED_LINE: &str = "File saved successfully.";

/// Success line of `update` for `entity`.
pub fn updated_line(entity: &str) -> String {
    format!("Entity '{entity}' updated successfully.")
}

/// The document currently open in the marking library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    document: Utf8PathBuf,
    entity_count: Option<i32>,
}

impl Session {
    pub fn document(&self) -> &Utf8Path {
        &self.document
    }

    /// Entity count read right after opening, if the library reported one.
    pub fn entity_count(&self) -> Option<i32> {
        self.entity_count
    }
}

/// How a command ended. Vendor codes are kept as a field, not only as prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Unknown command or missing arguments.
    Usage,
    /// Rejected before any foreign call (missing file, bad arguments, no session).
    Validation,
    /// A foreign call returned a non-zero status.
    Vendor(VendorStatus),
    /// The red-light call returned `false`.
    IndicatorRejected,
}

impl Outcome {
    /// Process exit code for the `ezcad-bridge` binary.
    ///
    /// `1` is reserved for unexpected faults caught at the top level.
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Usage => 2,
            Outcome::Validation => 3,
            Outcome::Vendor(_) | Outcome::IndicatorRejected => 4,
        }
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

/// Print a command parse failure, followed by usage where appropriate.
pub fn write_command_error<W: Write>(out: &mut W, error: &CommandError) -> io::Result<Outcome> {
    writeln!(out, "ERROR: {error}")?;
    if error.shows_usage() {
        writeln!(out)?;
        writeln!(out, "{USAGE}")?;
        Ok(Outcome::Usage)
    } else {
        Ok(Outcome::Validation)
    }
}

/// Executes bridge commands against a [`MarkingLibrary`], writing the text
/// protocol to `out`.
pub struct Dispatcher<L: MarkingLibrary, W: Write> {
    library: L,
    out: W,
    session: Option<Session>,
    library_path: Option<Utf8PathBuf>,
    fly_mark: bool,
    /// `initialize` was called since the last `close`, whatever it returned.
    initialized: bool,
    released: bool,
}

impl<L: MarkingLibrary, W: Write> Dispatcher<L, W> {
    pub fn new(library: L, out: W) -> Self {
        Self {
            library,
            out,
            session: None,
            library_path: None,
            fly_mark: false,
            initialized: false,
            released: false,
        }
    }

    /// Path reported by `info`.
    pub fn with_library_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    /// Fly-mark flag passed to mark-all. Defaults to `false`.
    pub fn with_fly_mark(mut self, fly_mark: bool) -> Self {
        self.fly_mark = fly_mark;
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn output_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Parse `args` and run the command; parse failures are reported on the
    /// output like any other failure.
    pub fn run<S: AsRef<str>>(&mut self, args: &[S]) -> io::Result<Outcome> {
        match Command::parse(args) {
            Ok(command) => self.execute(&command),
            Err(error) => {
                tracing::warn!("Rejected bridge arguments: {}", error);
                write_command_error(&mut self.out, &error)
            }
        }
    }

    /// Run `command`, first making sure `document` is the open document when
    /// the command needs a session.
    pub fn execute_with_document(
        &mut self,
        command: &Command,
        document: Option<&Utf8Path>,
    ) -> io::Result<Outcome> {
        if let Some(document) = document.filter(|_| command.requires_session()) {
            let outcome = self.ensure_document(document)?;
            if !outcome.is_success() {
                return Ok(outcome);
            }
        }
        self.execute(command)
    }

    pub fn execute(&mut self, command: &Command) -> io::Result<Outcome> {
        tracing::debug!("Dispatching bridge command: {}", command);

        if command.requires_session() && self.session.is_none() {
            writeln!(self.out, "ERROR: No EZD file is open. Run 'open <file.ezd>' first.")?;
            return Ok(Outcome::Validation);
        }

        let outcome = match command {
            Command::Info => {
                info::write_report(&mut self.out, self.library_path.as_deref())?;
                Outcome::Success
            }
            Command::Open { path } => self.open(path)?,
            Command::Mark { entity } => self.mark(entity.as_deref())?,
            Command::Update { entity, text } => self.update(entity, text)?,
            Command::List => self.list()?,
            Command::Red { x, y } => self.red(*x, *y)?,
            Command::Save { path } => self.save(path)?,
        };

        self.out.flush()?;
        tracing::debug!("Bridge command '{}' finished: {:?}", command.name(), outcome);
        Ok(outcome)
    }

    /// Open `document` unless it is already the open document.
    pub fn ensure_document(&mut self, document: &Utf8Path) -> io::Result<Outcome> {
        match &self.session {
            Some(session) if session.document.as_path() == document => Ok(Outcome::Success),
            _ => self.open(document),
        }
    }

    /// Close the marking library. Called from `Drop`; calling it earlier
    /// makes the drop a no-op.
    pub fn close(&mut self) -> VendorStatus {
        if let Some(session) = self.session.take() {
            tracing::info!("Closing session for {}", session.document);
        }
        let status = self.library.close();
        self.initialized = false;
        self.released = true;
        tracing::debug!("lmc1 close returned {}", status);
        status
    }

    fn open(&mut self, path: &Utf8Path) -> io::Result<Outcome> {
        writeln!(self.out, "Opening EZD file: {path}")?;

        if !path.exists() {
            writeln!(self.out, "ERROR: File not found: {path}")?;
            return Ok(Outcome::Validation);
        }

        self.session = None;
        if self.initialized {
            let status = self.library.close();
            self.initialized = false;
            tracing::debug!("Closed previous document before reopening: {}", status);
        }

        let status = self.library.initialize(path, DocumentMode::Open);
        self.initialized = true;
        self.released = false;
        if !status.is_success() {
            tracing::error!("Failed to open {}: vendor code {}", path, status);
            writeln!(self.out, "ERROR: Failed to open file. Error code: {status}")?;
            return Ok(Outcome::Vendor(status));
        }

        writeln!(self.out, "{OPENED_LINE}")?;

        let (count, status) = self.library.entity_count();
        let entity_count = if status.is_success() {
            writeln!(self.out, "Entity count: {count}")?;
            Some(count)
        } else {
            writeln!(
                self.out,
                "WARNING: Could not read entity count. Error code: {status}"
            )?;
            None
        };

        tracing::info!("Opened {} ({:?} entities)", path, entity_count);
        self.session = Some(Session {
            document: path.to_path_buf(),
            entity_count,
        });
        Ok(Outcome::Success)
    }

    fn mark(&mut self, entity: Option<&str>) -> io::Result<Outcome> {
        let status = match entity {
            Some(name) => {
                writeln!(self.out, "Marking entity: {name}")?;
                self.library.mark_entity(name)
            }
            None => {
                writeln!(self.out, "Marking all entities...")?;
                self.library.mark_all(self.fly_mark)
            }
        };

        if status.is_success() {
            writeln!(self.out, "{MARKED_LINE}")?;
            Ok(Outcome::Success)
        } else {
            writeln!(self.out, "ERROR: Marking failed. Error code: {status}")?;
            Ok(Outcome::Vendor(status))
        }
    }

    fn update(&mut self, entity: &str, text: &str) -> io::Result<Outcome> {
        writeln!(self.out, "Updating entity '{entity}' with text: {text}")?;

        // Type lookup doubles as the existence check; no set-text without it.
        let (entity_type, status) = self.library.entity_type(entity);
        if !status.is_success() {
            writeln!(
                self.out,
                "ERROR: Entity not found: {entity} (Error code: {status})"
            )?;
            return Ok(Outcome::Vendor(status));
        }
        tracing::debug!("Entity '{}' has type {}", entity, entity_type);

        let status = self.library.set_entity_text(entity, text);
        if !status.is_success() {
            writeln!(self.out, "ERROR: Failed to update text. Error code: {status}")?;
            return Ok(Outcome::Vendor(status));
        }

        writeln!(self.out, "{}", updated_line(entity))?;
        Ok(Outcome::Success)
    }

    fn list(&mut self) -> io::Result<Outcome> {
        let (count, status) = self.library.entity_count();
        if !status.is_success() {
            writeln!(
                self.out,
                "ERROR: Failed to get entity count. Error code: {status}"
            )?;
            return Ok(Outcome::Vendor(status));
        }
        writeln!(self.out, "Entity count: {count}")?;

        let mut listed = 0;
        for index in 0..count {
            let (name, status) = self.library.entity_name(index);
            if !status.is_success() {
                writeln!(
                    self.out,
                    "ERROR: Failed to get name of entity {index}. Error code: {status}"
                )?;
                continue;
            }

            let (entity_type, status) = self.library.entity_type(&name);
            if !status.is_success() {
                writeln!(
                    self.out,
                    "ERROR: Failed to get type of entity '{name}'. Error code: {status}"
                )?;
                continue;
            }

            writeln!(self.out, "[{index}] {name} (Type: {entity_type})")?;
            listed += 1;
        }

        writeln!(self.out, "Listed {listed} of {count} entities.")?;
        Ok(Outcome::Success)
    }

    fn red(&mut self, x: f64, y: f64) -> io::Result<Outcome> {
        writeln!(self.out, "Positioning red light pointer at: X={x}, Y={y}")?;

        if self.library.position_indicator(x, y, false) {
            writeln!(self.out, "{RED_LIGHT_LINE}")?;
            Ok(Outcome::Success)
        } else {
            writeln!(self.out, "ERROR: Failed to position red light.")?;
            Ok(Outcome::IndicatorRejected)
        }
    }

    fn save(&mut self, path: &Utf8Path) -> io::Result<Outcome> {
        writeln!(self.out, "Saving EZD file to: {path}")?;

        let status = self.library.save_to_file(path);
        if status.is_success() {
            writeln!(self.out, "{SAVED_LINE}")?;
            Ok(Outcome::Success)
        } else {
            writeln!(self.out, "ERROR: Failed to save file. Error code: {status}")?;
            Ok(Outcome::Vendor(status))
        }
    }
}

impl<L: MarkingLibrary, W: Write> Drop for Dispatcher<L, W> {
    fn drop(&mut self) {
        if !self.released {
            self.close();
        }
        let _ = self.out.flush();
    }
}
