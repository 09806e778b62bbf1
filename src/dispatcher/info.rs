use camino::Utf8Path;
use std::env;
use std::io::{self, Write};

/// Print the bridge environment report for `info`.
///
/// Needs no session and no loaded library, so it also works when the
/// marking library is missing.
pub fn write_report<W: Write>(out: &mut W, library_path: Option<&Utf8Path>) -> io::Result<()> {
    writeln!(out, "EZCAD Bridge v{}", crate::VERSION)?;

    match env::current_exe() {
        Ok(exe) => writeln!(out, "Executable: {}", exe.display())?,
        Err(e) => writeln!(out, "Executable: unknown ({e})")?,
    }
    match env::current_dir() {
        Ok(dir) => writeln!(out, "Working directory: {}", dir.display())?,
        Err(e) => writeln!(out, "Working directory: unknown ({e})")?,
    }

    writeln!(
        out,
        "Operating system: {} ({})",
        env::consts::OS,
        env::consts::ARCH
    )?;
    writeln!(out, "Process is 64-bit: {}", cfg!(target_pointer_width = "64"))?;

    match library_path {
        Some(path) if path.exists() => writeln!(out, "Marking library: {path} (found)")?,
        Some(path) => writeln!(out, "Marking library: {path} (NOT FOUND)")?,
        None => writeln!(out, "Marking library: not configured")?,
    }

    Ok(())
}
