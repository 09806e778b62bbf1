//! Data models for EZCAD automation.
//!
//! - [`AutomationConfig`]: paths, run and monitoring settings loaded from `EZCAD Automation.yaml`
//! - [`Profile`]: a named, timestamped snapshot of an [`AutomationConfig`]
//! - [`BatchRecord`]: one row of batch data, entity name → replacement text

pub mod config;
pub mod record;

pub use config::{
    AutomationConfig, MonitoringSettings, PathSettings, Profile, ProfileMetadata, RunSettings,
    RunnerMode,
};
pub use record::BatchRecord;
