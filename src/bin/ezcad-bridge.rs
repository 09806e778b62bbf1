//! Command dispatcher for the EZCAD marking library.
//!
//! Runs one command per process and prints the text protocol on stdout:
//!
//! ```text
//! ezcad-bridge [--library <dll>] [--document <ezd>] <command> [args...]
//! ```
//!
//! Logging goes to a rolling file only. The marking library is closed before
//! the process exits, including after a panic.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use ezcad_automation::dispatcher::{self, Command, Dispatcher, Outcome, info};
use ezcad_automation::ffi::MarkEzdLibrary;
use ezcad_automation::logging;
use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;

/// Exit code for faults outside the command protocol.
const FAULT_EXIT_CODE: u8 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "ezcad-bridge",
    version,
    about = "Run one EZCAD marking command against MarkEzd.dll"
)]
struct BridgeArgs {
    /// Path to MarkEzd.dll (default: next to this executable)
    #[arg(long)]
    library: Option<Utf8PathBuf>,

    /// Open this document before running a command that needs one
    #[arg(long)]
    document: Option<Utf8PathBuf>,

    /// Directory for log files
    #[arg(long, default_value = "logs")]
    log_dir: Utf8PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Command and its arguments (info, open, mark, update, list, red, save)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let args = BridgeArgs::parse();

    // Logging is best effort here; the protocol works without it.
    let _guard = match logging::setup_logging(&args.log_dir, "ezcad_bridge", args.debug) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e:#}");
            None
        }
    };

    tracing::info!(
        "ezcad-bridge v{} started: {:?}",
        ezcad_automation::VERSION,
        args.command
    );

    let command = match Command::parse(&args.command) {
        Ok(command) => command,
        Err(error) => {
            tracing::warn!("Rejected bridge arguments: {}", error);
            let mut out = io::stdout().lock();
            return match dispatcher::write_command_error(&mut out, &error) {
                Ok(outcome) => ExitCode::from(outcome.exit_code()),
                Err(_) => ExitCode::from(FAULT_EXIT_CODE),
            };
        }
    };

    let library_path = args.library.clone().or_else(default_library_path);

    if matches!(command, Command::Info) {
        let mut out = io::stdout().lock();
        return match info::write_report(&mut out, library_path.as_deref()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(_) => ExitCode::from(FAULT_EXIT_CODE),
        };
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        run(&command, args.document.as_deref(), library_path)
    }));

    match result {
        Ok(Ok(outcome)) => {
            tracing::info!("Command '{}' finished: {:?}", command.name(), outcome);
            ExitCode::from(outcome.exit_code())
        }
        Ok(Err(e)) => {
            tracing::error!("Command '{}' failed: {:#}", command.name(), e);
            report_fault(&format!("{e:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Command '{}' panicked: {}", command.name(), message);
            report_fault(&format!("Unexpected failure: {message}"))
        }
    }
}

/// Load the library and run `command`. The dispatcher is dropped, and the
/// library closed, before this returns or unwinds.
fn run(
    command: &Command,
    document: Option<&Utf8Path>,
    library_path: Option<Utf8PathBuf>,
) -> Result<Outcome> {
    let library_path =
        library_path.context("Could not determine the location of MarkEzd.dll; pass --library")?;

    let library = MarkEzdLibrary::load(&library_path)
        .with_context(|| format!("Failed to load marking library: {}", library_path))?;

    let mut dispatcher =
        Dispatcher::new(library, io::stdout().lock()).with_library_path(library_path);
    let outcome = dispatcher
        .execute_with_document(command, document)
        .context("Failed to write command output")?;
    Ok(outcome)
}

fn default_library_path() -> Option<Utf8PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = Utf8PathBuf::try_from(exe.parent()?.to_path_buf()).ok()?;
    Some(dir.join("MarkEzd.dll"))
}

fn report_fault(message: &str) -> ExitCode {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "ERROR: {message}");
    let _ = out.flush();
    ExitCode::from(FAULT_EXIT_CODE)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
