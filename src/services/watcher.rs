use super::queue::JobKind;
use crate::models::MonitoringSettings;
use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Invalid watch directory: {0}")]
    InvalidDirectory(String),

    #[error("Failed to watch {path}: {source}")]
    Notify {
        path: Utf8PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// How a watched file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
}

/// A matching file that changed, ready to become a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: Utf8PathBuf,
    pub kind: JobKind,
    pub change: ChangeKind,
}

/// File name patterns for data and template files.
///
/// `*.ext` matches by extension and any other pattern matches the end of the
/// file name, both ignoring ASCII case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatterns {
    data: Vec<String>,
    templates: Vec<String>,
}

impl FilePatterns {
    pub fn new<S: AsRef<str>>(data: &[S], templates: &[S]) -> Self {
        Self {
            data: data.iter().filter_map(|p| normalize_pattern(p.as_ref())).collect(),
            templates: templates
                .iter()
                .filter_map(|p| normalize_pattern(p.as_ref()))
                .collect(),
        }
    }

    pub fn from_settings(settings: &MonitoringSettings) -> Self {
        Self::new(
            settings.data_patterns.as_slice(),
            settings.template_patterns.as_slice(),
        )
    }

    /// Which kind of job a change of `path` produces, if any.
    pub fn classify(&self, path: &Utf8Path) -> Option<JobKind> {
        let name = path.file_name()?.to_ascii_lowercase();
        if self.templates.iter().any(|suffix| name.ends_with(suffix)) {
            Some(JobKind::Template)
        } else if self.data.iter().any(|suffix| name.ends_with(suffix)) {
            Some(JobKind::Data)
        } else {
            None
        }
    }
}

fn normalize_pattern(pattern: &str) -> Option<String> {
    let pattern = pattern.trim();
    let suffix = pattern.strip_prefix('*').unwrap_or(pattern);
    (!suffix.is_empty()).then(|| suffix.to_ascii_lowercase())
}

/// Drops repeated events for the same file inside a time window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_seen: HashMap<Utf8PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Whether an event for `path` at `now` should go through.
    pub fn accept(&mut self, path: &Utf8Path, now: Instant) -> bool {
        if let Some(last) = self.last_seen.get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_seen.insert(path.to_path_buf(), now);
        true
    }
}

/// Turns raw notify events into [`FileEvent`]s on a channel.
pub struct EventForwarder {
    patterns: FilePatterns,
    debouncer: Debouncer,
    sender: mpsc::Sender<FileEvent>,
}

impl EventForwarder {
    pub fn new(patterns: FilePatterns, debounce: Duration, sender: mpsc::Sender<FileEvent>) -> Self {
        Self {
            patterns,
            debouncer: Debouncer::new(debounce),
            sender,
        }
    }

    /// Filter `event` and collect the file events it produces.
    pub fn events_at(&mut self, event: &notify::Event, now: Instant) -> Vec<FileEvent> {
        let change = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Modify(_) => ChangeKind::Modified,
            _ => return Vec::new(),
        };

        let mut events = Vec::new();
        for path in &event.paths {
            let Ok(path) = Utf8PathBuf::try_from(path.clone()) else {
                tracing::warn!("Ignoring non UTF-8 path: {}", path.display());
                continue;
            };
            if path.is_dir() {
                continue;
            }
            let Some(kind) = self.patterns.classify(&path) else {
                continue;
            };
            if !self.debouncer.accept(&path, now) {
                tracing::debug!("Debounced change of {}", path);
                continue;
            }

            tracing::info!("File {:?}: {}", change, path);
            events.push(FileEvent { path, kind, change });
        }
        events
    }

    fn forward(&mut self, result: notify::Result<notify::Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("Directory watch error: {}", e);
                return;
            }
        };

        for file_event in self.events_at(&event, Instant::now()) {
            if self.sender.blocking_send(file_event).is_err() {
                tracing::warn!("Job feed closed; dropping file event");
                return;
            }
        }
    }
}

/// Keeps a directory watched until dropped.
pub struct DirectoryWatcher {
    directory: Utf8PathBuf,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Start watching `directory`, sending matching changes to `forwarder`'s
    /// channel from the watcher thread.
    pub fn start(
        directory: &Utf8Path,
        recursive: bool,
        mut forwarder: EventForwarder,
    ) -> Result<Self, WatchError> {
        if !directory.is_dir() {
            tracing::error!("Invalid watch directory: {}", directory);
            return Err(WatchError::InvalidDirectory(directory.to_string()));
        }

        let notify_error = |source: notify::Error| WatchError::Notify {
            path: directory.to_path_buf(),
            source,
        };
        let mut watcher = notify::recommended_watcher(move |result| forwarder.forward(result))
            .map_err(notify_error)?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(directory.as_std_path(), mode)
            .map_err(notify_error)?;

        tracing::info!(
            "Started watching directory: {} (recursive: {})",
            directory,
            recursive
        );
        Ok(Self {
            directory: directory.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        tracing::info!("Directory watcher stopped: {}", self.directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::path::PathBuf;

    fn patterns() -> FilePatterns {
        FilePatterns::new(&["*.csv", "orders.txt"], &["*.EZD"])
    }

    fn forwarder() -> (EventForwarder, mpsc::Receiver<FileEvent>) {
        let (sender, receiver) = mpsc::channel(8);
        (
            EventForwarder::new(patterns(), Duration::from_secs(2), sender),
            receiver,
        )
    }

    #[test]
    fn test_classify_by_pattern() {
        let patterns = patterns();
        assert_eq!(patterns.classify(Utf8Path::new("in/Parts.CSV")), Some(JobKind::Data));
        assert_eq!(patterns.classify(Utf8Path::new("in/new-orders.txt")), Some(JobKind::Data));
        assert_eq!(patterns.classify(Utf8Path::new("plate.ezd")), Some(JobKind::Template));
        assert_eq!(patterns.classify(Utf8Path::new("notes.txt")), None);
        assert_eq!(patterns.classify(Utf8Path::new("csv")), None);
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        let patterns = FilePatterns::new(&["", "*"], &["*.ezd"]);
        assert_eq!(patterns.classify(Utf8Path::new("data.csv")), None);
    }

    #[test]
    fn test_debouncer_window() {
        let mut debouncer = Debouncer::new(Duration::from_secs(2));
        let start = Instant::now();
        let path = Utf8Path::new("data.csv");

        assert!(debouncer.accept(path, start));
        assert!(!debouncer.accept(path, start + Duration::from_millis(1500)));
        assert!(debouncer.accept(Utf8Path::new("other.csv"), start));
        assert!(debouncer.accept(path, start + Duration::from_secs(3)));
    }

    #[test]
    fn test_forwarder_filters_and_debounces() {
        let (mut forwarder, _receiver) = forwarder();
        let now = Instant::now();

        let created = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("incoming/parts.csv"))
            .add_path(PathBuf::from("incoming/readme.md"));
        let events = forwarder.events_at(&created, now);
        assert_eq!(
            events,
            [FileEvent {
                path: Utf8PathBuf::from("incoming/parts.csv"),
                kind: JobKind::Data,
                change: ChangeKind::Created,
            }]
        );

        let modified = notify::Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("incoming/parts.csv"));
        assert!(forwarder.events_at(&modified, now + Duration::from_millis(100)).is_empty());

        let accessed = notify::Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("incoming/plate.ezd"));
        assert!(forwarder.events_at(&accessed, now).is_empty());
    }

    #[test]
    fn test_start_rejects_missing_directory() {
        let (forwarder, _receiver) = forwarder();
        let result = DirectoryWatcher::start(Utf8Path::new("no/such/dir"), false, forwarder);
        assert!(matches!(result, Err(WatchError::InvalidDirectory(_))));
    }
}
