// EZCAD Automation - batch laser marking through the EZCAD MarkEzd library
//
// This is the library crate containing the foreign interface, the command
// dispatcher, and the client/batch services. Two binaries sit on top of it:
// `ezcad-bridge` (the dispatcher) and `ezcad-automation` (the front end).

pub mod config;
pub mod dispatcher;
pub mod ffi;
pub mod logging;
pub mod models;
pub mod services;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use dispatcher::{Command, Dispatcher, Outcome};
pub use ffi::{MarkEzdLibrary, MarkingLibrary, VendorStatus};
pub use models::{AutomationConfig, BatchRecord};
pub use services::{BatchProcessor, BatchStatistics, BridgeClient};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
