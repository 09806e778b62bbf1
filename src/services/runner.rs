use crate::dispatcher::{self, Command, Dispatcher};
use crate::ffi::MarkingLibrary;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command as ProcessCommand;
use tokio::time::timeout;

/// `Error code: <n>` as printed by the dispatcher on vendor failures.
static ERROR_CODE_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"Error code:\s*(-?\d+)").expect("Invalid error code regex")
});

/// File name of the dispatcher binary.
pub const BRIDGE_EXE_NAME: &str = if cfg!(windows) {
    "ezcad-bridge.exe"
} else {
    "ezcad-bridge"
};

/// Errors raised while running a bridge command.
///
/// A command that ran but reported failure is not an error; it comes back as
/// a [`CommandOutput`] without the success phrase.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Bridge executable not found: {0}")]
    BridgeNotFound(String),

    #[error("Failed to run bridge command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bridge command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One dispatcher call: command name, positional arguments and the document
/// the command should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub document: Option<Utf8PathBuf>,
}

impl CommandInvocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            document: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn document(mut self, document: Option<&Utf8Path>) -> Self {
        self.document = document.map(Utf8Path::to_path_buf);
        self
    }

    /// Command name followed by its arguments.
    pub fn command_args(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Full argument vector for the `ezcad-bridge` binary.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(document) = &self.document {
            argv.push("--document".to_string());
            argv.push(document.to_string());
        }
        argv.extend(self.command_args());
        argv
    }
}

impl fmt::Display for CommandInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_args().join(" "))
    }
}

/// Captured result of one dispatcher call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether some stdout line is exactly `expected`, ignoring surrounding
    /// whitespace and ASCII case. Lines echoing user input never match a
    /// status line by accident.
    pub fn has_line(&self, expected: &str) -> bool {
        self.stdout
            .lines()
            .any(|line| line.trim().eq_ignore_ascii_case(expected))
    }

    /// Last vendor code printed on an `ERROR:` line, if any.
    pub fn error_code(&self) -> Option<i32> {
        self.stdout
            .lines()
            .filter(|line| line.trim_start().starts_with("ERROR:"))
            .filter_map(|line| ERROR_CODE_PATTERN.captures(line))
            .filter_map(|caps| caps[1].parse().ok())
            .last()
    }
}

/// Runs dispatcher commands. The client awaits each call before issuing the
/// next one.
#[async_trait]
pub trait CommandRunner: Send {
    async fn run(&mut self, invocation: &CommandInvocation) -> Result<CommandOutput, ClientError>;
}

#[async_trait]
impl<R: CommandRunner + ?Sized> CommandRunner for Box<R> {
    async fn run(&mut self, invocation: &CommandInvocation) -> Result<CommandOutput, ClientError> {
        (**self).run(invocation).await
    }
}

/// Launches `ezcad-bridge` once per command.
///
/// Every process is a fresh vendor session, so the invocation's document is
/// passed as `--document` and reopened by the dispatcher.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    executable: Utf8PathBuf,
    library: Option<Utf8PathBuf>,
    timeout: Option<Duration>,
}

impl SubprocessRunner {
    pub fn new(executable: impl Into<Utf8PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            library: None,
            timeout: None,
        }
    }

    /// Pass `--library` to every process.
    pub fn with_library(mut self, library: Option<Utf8PathBuf>) -> Self {
        self.library = library;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn executable(&self) -> &Utf8Path {
        &self.executable
    }

    fn process_args(&self, invocation: &CommandInvocation) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(library) = &self.library {
            args.push("--library".to_string());
            args.push(library.to_string());
        }
        args.extend(invocation.argv());
        args
    }
}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&mut self, invocation: &CommandInvocation) -> Result<CommandOutput, ClientError> {
        let args = self.process_args(invocation);
        tracing::debug!("Running bridge command: {} {}", self.executable, args.join(" "));

        let start = Instant::now();
        let child = ProcessCommand::new(self.executable.as_std_path())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClientError::Spawn {
                command: invocation.to_string(),
                source,
            })?;

        let output = match self.timeout {
            Some(limit) => timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    tracing::warn!("Bridge command '{}' timed out after {:?}", invocation, limit);
                    ClientError::Timeout {
                        command: invocation.to_string(),
                        timeout: limit,
                    }
                })??,
            None => child.wait_with_output().await?,
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        tracing::debug!(
            "Bridge command '{}' exited with code {} in {:.2}s",
            invocation,
            result.exit_code,
            start.elapsed().as_secs_f32()
        );
        if !result.stdout.is_empty() {
            tracing::debug!("Bridge output: {}", result.stdout.trim_end());
        }
        if !result.stderr.is_empty() {
            tracing::error!("Bridge error: {}", result.stderr.trim_end());
        }

        Ok(result)
    }
}

/// Runs commands against a [`Dispatcher`] living in this process.
///
/// The vendor session survives between commands, so text updates made by
/// `update` are still in the document when `mark` or `save` runs. Output is
/// the same text a subprocess would print.
pub struct InProcessRunner<L: MarkingLibrary + Send> {
    dispatcher: Dispatcher<L, Vec<u8>>,
}

impl<L: MarkingLibrary + Send> InProcessRunner<L> {
    pub fn new(dispatcher: Dispatcher<L, Vec<u8>>) -> Self {
        Self { dispatcher }
    }

    pub fn from_library(library: L) -> Self {
        Self::new(Dispatcher::new(library, Vec::new()))
    }

    pub fn dispatcher(&self) -> &Dispatcher<L, Vec<u8>> {
        &self.dispatcher
    }

    /// Give the dispatcher back; dropping it closes the vendor session.
    pub fn into_dispatcher(self) -> Dispatcher<L, Vec<u8>> {
        self.dispatcher
    }
}

#[async_trait]
impl<L: MarkingLibrary + Send> CommandRunner for InProcessRunner<L> {
    async fn run(&mut self, invocation: &CommandInvocation) -> Result<CommandOutput, ClientError> {
        tracing::debug!("Running in-process bridge command: {}", invocation);

        let outcome = match Command::parse(&invocation.command_args()) {
            Ok(command) => self
                .dispatcher
                .execute_with_document(&command, invocation.document.as_deref())?,
            Err(error) => dispatcher::write_command_error(self.dispatcher.output_mut(), &error)?,
        };

        let stdout = std::mem::take(self.dispatcher.output_mut());
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::new(),
            exit_code: i32::from(outcome.exit_code()),
        })
    }
}

/// Find the `ezcad-bridge` executable.
///
/// A configured path must exist. Otherwise the directory of the running
/// executable, its `bridge/` subdirectory and the working directory are
/// searched, in that order.
pub fn locate_bridge_executable(configured: Option<&Utf8Path>) -> Result<Utf8PathBuf, ClientError> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        tracing::error!("Bridge executable not found at: {}", path);
        return Err(ClientError::BridgeNotFound(path.to_string()));
    }

    let mut base_dirs = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
    {
        base_dirs.push(exe_dir);
    }
    if let Some(cwd) = std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
    {
        base_dirs.push(cwd);
    }

    let candidates = bridge_candidates(&base_dirs);
    match candidates.iter().find(|candidate| candidate.exists()) {
        Some(found) => {
            tracing::info!("Using bridge executable at: {}", found);
            if !library_beside(found) {
                tracing::warn!("MarkEzd.dll not found next to {}", found);
                tracing::warn!("The bridge may not function correctly without this DLL");
            }
            Ok(found.clone())
        }
        None => {
            tracing::error!("{} not found in standard locations", BRIDGE_EXE_NAME);
            Err(ClientError::BridgeNotFound(BRIDGE_EXE_NAME.to_string()))
        }
    }
}

/// Standard locations for the bridge executable under each base directory.
pub fn bridge_candidates(base_dirs: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    base_dirs
        .iter()
        .flat_map(|dir| [dir.join(BRIDGE_EXE_NAME), dir.join("bridge").join(BRIDGE_EXE_NAME)])
        .collect()
}

/// Whether `MarkEzd.dll` sits in the same directory as `bridge_exe`.
pub fn library_beside(bridge_exe: &Utf8Path) -> bool {
    bridge_exe
        .parent()
        .is_some_and(|dir| dir.join("MarkEzd.dll").exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_argv_with_document() {
        let invocation = CommandInvocation::new("update")
            .arg("Text1")
            .arg("Hello world")
            .document(Some(Utf8Path::new("C:/jobs/template.ezd")));

        assert_eq!(
            invocation.argv(),
            ["--document", "C:/jobs/template.ezd", "update", "Text1", "Hello world"]
        );
        assert_eq!(invocation.to_string(), "update Text1 Hello world");
    }

    #[test]
    fn test_subprocess_runner_prepends_library() {
        let runner = SubprocessRunner::new("ezcad-bridge")
            .with_library(Some(Utf8PathBuf::from("C:/EZCAD/MarkEzd.dll")));
        let args = runner.process_args(&CommandInvocation::new("list"));

        assert_eq!(args, ["--library", "C:/EZCAD/MarkEzd.dll", "list"]);
    }

    #[test]
    fn test_has_line_matches_whole_lines_only() {
        let output = CommandOutput {
            stdout: "Opening EZD file: File saved successfully.ezd\r\n  File opened SUCCESSFULLY.\r\n"
                .to_string(),
            ..Default::default()
        };
        assert!(output.has_line("File opened successfully."));
        assert!(!output.has_line("File saved successfully."));
    }

    #[test]
    fn test_error_code_from_error_line() {
        let output = CommandOutput {
            stdout: "Opening EZD file: a.ezd\nERROR: Failed to open file. Error code: -7\n"
                .to_string(),
            ..Default::default()
        };
        assert_eq!(output.error_code(), Some(-7));

        let clean = CommandOutput {
            stdout: "File saved successfully.\n".to_string(),
            ..Default::default()
        };
        assert_eq!(clean.error_code(), None);
    }

    #[test]
    fn test_bridge_candidates_order() {
        let candidates = bridge_candidates(&[Utf8PathBuf::from("/opt/ezcad")]);
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].ends_with(BRIDGE_EXE_NAME));
        assert!(candidates[1].as_str().contains("bridge"));
    }

    #[test]
    fn test_configured_bridge_must_exist() {
        let result = locate_bridge_executable(Some(Utf8Path::new("missing/ezcad-bridge.exe")));
        assert!(matches!(result, Err(ClientError::BridgeNotFound(_))));
    }

    #[tokio::test]
    async fn test_subprocess_runner_missing_executable() {
        let mut runner = SubprocessRunner::new("definitely-not-a-real-bridge-binary");
        let result = runner.run(&CommandInvocation::new("info")).await;
        assert!(matches!(result, Err(ClientError::Spawn { .. })));
    }
}
