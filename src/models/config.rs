use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration from `EZCAD Automation.yaml`.
///
/// Every field has a default so a missing or partial file still loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub paths: PathSettings,
    pub settings: RunSettings,
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// `ezcad-bridge` executable. Empty means search the standard locations.
    pub bridge_exe: String,

    /// `MarkEzd.dll`, used by the in-process runner.
    pub markezd_dll: String,

    pub last_template_dir: String,

    pub last_data_dir: String,
}

/// How the client reaches the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerMode {
    /// One `ezcad-bridge` process per command.
    #[default]
    Subprocess,
    /// Dispatcher and marking library loaded into this process.
    InProcess,
}

impl RunnerMode {
    /// Mode for a run that edits one document over several bridge commands,
    /// such as a batch. A subprocess reopens the document from disk for
    /// every command, so text updates never reach the mark; such runs use
    /// the in-process runner whenever a marking library is known.
    pub fn for_session_run(self, library_known: bool) -> RunnerMode {
        if library_known {
            RunnerMode::InProcess
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub debug_mode: bool,

    pub log_dir: String,

    /// Seconds to wait for one bridge command; `0` waits forever.
    pub command_timeout: u64,

    pub runner: RunnerMode,

    /// Fly-mark flag for mark-all in the in-process runner.
    pub fly_mark: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            debug_mode: false,
            log_dir: default_log_dir(),
            command_timeout: 0,
            runner: RunnerMode::Subprocess,
            fly_mark: false,
        }
    }
}

/// Directory watching for the `watch` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub watch_directory: String,

    pub recursive: bool,

    /// Patterns of data files queued as batch jobs, e.g. `*.csv`.
    pub data_patterns: Vec<String>,

    /// Patterns of template files; a changed template becomes the template
    /// for later data jobs.
    pub template_patterns: Vec<String>,

    /// Events for the same file within this window are ignored.
    pub debounce_ms: u64,

    /// Template used by data jobs until a template file changes.
    pub template: String,

    /// Where data jobs save their result; empty means no save.
    pub output_dir: String,

    /// Finished jobs older than this are cleared from the queue.
    pub max_job_age_hours: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            watch_directory: String::new(),
            recursive: false,
            data_patterns: vec!["*.csv".to_string()],
            template_patterns: vec!["*.ezd".to_string()],
            debounce_ms: 2000,
            template: String::new(),
            output_dir: String::new(),
            max_job_age_hours: 24,
        }
    }
}

impl MonitoringSettings {
    pub fn watch_directory_path(&self) -> Option<Utf8PathBuf> {
        non_empty_path(&self.watch_directory)
    }

    pub fn template_path(&self) -> Option<Utf8PathBuf> {
        non_empty_path(&self.template)
    }

    pub fn output_dir_path(&self) -> Option<Utf8PathBuf> {
        non_empty_path(&self.output_dir)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn non_empty_path(value: &str) -> Option<Utf8PathBuf> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| Utf8PathBuf::from(trimmed))
}

impl AutomationConfig {
    pub fn bridge_exe_path(&self) -> Option<Utf8PathBuf> {
        non_empty_path(&self.paths.bridge_exe)
    }

    pub fn markezd_dll_path(&self) -> Option<Utf8PathBuf> {
        non_empty_path(&self.paths.markezd_dll)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.settings.command_timeout > 0)
            .then(|| Duration::from_secs(self.settings.command_timeout))
    }
}

/// A saved configuration profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub metadata: ProfileMetadata,
    pub config: AutomationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub profile_name: String,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AutomationConfig::default();
        assert_eq!(config.settings.log_dir, "logs");
        assert_eq!(config.settings.runner, RunnerMode::Subprocess);
        assert!(config.bridge_exe_path().is_none());
        assert!(config.command_timeout().is_none());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "settings:\n  runner: in-process\n  command_timeout: 30\n";
        let config: AutomationConfig = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(config.settings.runner, RunnerMode::InProcess);
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.settings.log_dir, "logs");
        assert!(config.paths.bridge_exe.is_empty());
    }

    #[test]
    fn test_session_runs_prefer_in_process() {
        assert_eq!(
            RunnerMode::Subprocess.for_session_run(true),
            RunnerMode::InProcess
        );
        assert_eq!(
            RunnerMode::Subprocess.for_session_run(false),
            RunnerMode::Subprocess
        );
        assert_eq!(
            RunnerMode::InProcess.for_session_run(false),
            RunnerMode::InProcess
        );
    }

    #[test]
    fn test_monitoring_defaults() {
        let yaml = "monitoring:\n  watch_directory: C:/incoming\n  recursive: true\n";
        let config: AutomationConfig = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(
            config.monitoring.watch_directory_path(),
            Some(Utf8PathBuf::from("C:/incoming"))
        );
        assert!(config.monitoring.recursive);
        assert_eq!(config.monitoring.data_patterns, ["*.csv"]);
        assert_eq!(config.monitoring.debounce(), Duration::from_secs(2));
        assert!(config.monitoring.template_path().is_none());
    }

    #[test]
    fn test_blank_paths_are_unset() {
        let mut config = AutomationConfig::default();
        config.paths.bridge_exe = "   ".to_string();
        config.paths.markezd_dll = "C:/EZCAD/MarkEzd.dll".to_string();

        assert!(config.bridge_exe_path().is_none());
        assert_eq!(
            config.markezd_dll_path(),
            Some(Utf8PathBuf::from("C:/EZCAD/MarkEzd.dll"))
        );
    }
}
