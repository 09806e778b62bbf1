use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::{DateTime, Local};
use std::fmt;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Number of rotated log files kept per prefix.
pub const MAX_LOG_FILES: usize = 5;

/// Default capacity of the display queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// A log event as shown in the live display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Receiving end of the display queue.
pub struct LogQueue {
    pub receiver: mpsc::Receiver<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl LogQueue {
    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Publishes INFO-and-above events to a bounded channel.
///
/// Never blocks the logging thread: when the queue is full the record is
/// dropped and counted.
pub struct LogQueueLayer {
    sender: mpsc::Sender<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl LogQueueLayer {
    pub fn new(capacity: usize) -> (Self, LogQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Self {
                sender,
                dropped: Arc::clone(&dropped),
            },
            LogQueue { receiver, dropped },
        )
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl<S: Subscriber> Layer<S> for LogQueueLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::INFO {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: Local::now(),
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        };

        if self.sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn file_writer(log_dir: &Utf8Path, log_prefix: &str) -> Result<(NonBlocking, WorkerGuard)> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_prefix)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .with_context(|| format!("Failed to create log file in {}", log_dir))?;

    Ok(tracing_appender::non_blocking(file_appender))
}

fn env_filter(debug_mode: bool) -> EnvFilter {
    if debug_mode {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    }
}

/// Setup file-only logging with a rotating appender.
///
/// Used by `ezcad-bridge`, whose standard output carries the command
/// protocol and must stay free of log lines.
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(log_dir: &Utf8Path, log_prefix: &str, debug_mode: bool) -> Result<WorkerGuard> {
    let (non_blocking, guard) = file_writer(log_dir, log_prefix)?;

    tracing_subscriber::registry()
        .with(env_filter(debug_mode))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .context("Failed to install the logging subscriber")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}",
        log_dir,
        log_prefix,
        debug_mode
    );

    Ok(guard)
}

/// Setup rotating file logging plus the bounded display queue.
///
/// The file receives everything the filter lets through; the queue only
/// INFO and above.
pub fn setup_logging_with_queue(
    log_dir: &Utf8Path,
    log_prefix: &str,
    debug_mode: bool,
    queue_capacity: usize,
) -> Result<(WorkerGuard, LogQueue)> {
    let (non_blocking, guard) = file_writer(log_dir, log_prefix)?;
    let (queue_layer, queue) = LogQueueLayer::new(queue_capacity);

    tracing_subscriber::registry()
        .with(env_filter(debug_mode))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .with(queue_layer)
        .try_init()
        .context("Failed to install the logging subscriber")?;

    tracing::debug!(
        "Logging initialized: dir={}, prefix={}, debug={}, queue={}",
        log_dir,
        log_prefix,
        debug_mode,
        queue_capacity
    );

    Ok((guard, queue))
}

/// Background thread printing the display queue.
///
/// Dropping the handle (or calling [`LogDisplay::finish`]) prints every
/// record still queued and joins the thread. The queue's sender lives in the
/// global subscriber, so the thread would otherwise never see the channel
/// close.
pub struct LogDisplay {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LogDisplay {
    /// Drain the queue and stop the display thread.
    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                eprintln!("Log display thread panicked");
            }
        }
    }
}

impl Drop for LogDisplay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Print queued records to `out` on a background thread.
pub fn spawn_log_display<W>(queue: LogQueue, out: W) -> LogDisplay
where
    W: Write + Send + 'static,
{
    let (shutdown, shutdown_rx) = oneshot::channel();
    let handle = std::thread::Builder::new()
        .name("log-display".to_string())
        .spawn(move || display_records(queue, out, shutdown_rx));

    match handle {
        Ok(handle) => LogDisplay {
            shutdown: Some(shutdown),
            handle: Some(handle),
        },
        Err(e) => {
            eprintln!("Failed to start log display: {e}");
            LogDisplay {
                shutdown: None,
                handle: None,
            }
        }
    }
}

fn display_records<W: Write>(mut queue: LogQueue, mut out: W, mut shutdown: oneshot::Receiver<()>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start log display runtime: {e}");
            return;
        }
    };

    runtime.block_on(async {
        loop {
            tokio::select! {
                biased;
                record = queue.receiver.recv() => match record {
                    Some(record) => {
                        if writeln!(out, "{record}").is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                _ = &mut shutdown => break,
            }
        }

        while let Ok(record) = queue.receiver.try_recv() {
            if writeln!(out, "{record}").is_err() {
                return;
            }
        }
        let dropped = queue.dropped();
        if dropped > 0 {
            let _ = writeln!(out, "({dropped} log records were not displayed)");
        }
        let _ = out.flush();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;
    use tracing_subscriber::Registry;

    #[test]
    fn test_queue_layer_filters_below_info() {
        let (layer, mut queue) = LogQueueLayer::new(8);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("hidden");
            tracing::info!("Opened {}", "template.ezd");
            tracing::error!(code = 4, "Marking failed");
        });

        let first = queue.receiver.try_recv().unwrap();
        assert_eq!(first.level, Level::INFO);
        assert_eq!(first.message, "Opened template.ezd");

        let second = queue.receiver.try_recv().unwrap();
        assert_eq!(second.level, Level::ERROR);
        assert_eq!(second.message, "Marking failed code=4");

        assert!(queue.receiver.try_recv().is_err());
    }

    #[test]
    fn test_queue_layer_drops_when_full() {
        let (layer, mut queue) = LogQueueLayer::new(2);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            for i in 0..5 {
                tracing::warn!("record {}", i);
            }
        });

        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.receiver.try_recv().unwrap().message, "record 0");
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_display_prints_queued_records_on_finish() {
        let (layer, queue) = LogQueueLayer::new(16);
        let _default = tracing::subscriber::set_default(Registry::default().with(layer));

        tracing::info!("Processed 3/3 items");
        tracing::warn!("Errors: 0");

        let buffer = SharedBuffer::default();
        let display = spawn_log_display(queue, buffer.clone());
        tracing::info!("Duration: 0.50 seconds");
        display.finish();

        let printed = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" - INFO - Processed 3/3 items"));
        assert!(lines[2].ends_with(" - INFO - Duration: 0.50 seconds"));
    }

    #[test]
    fn test_record_display_format() {
        let record = LogRecord {
            timestamp: Local::now(),
            level: Level::WARN,
            target: "ezcad_automation".to_string(),
            message: "Entity not found in template: Barcode".to_string(),
        };
        let line = record.to_string();
        assert!(line.ends_with(" - WARN - Entity not found in template: Barcode"));
    }

    #[test]
    fn test_log_directory_created() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = Utf8PathBuf::try_from(temp_dir.path().join("logs")).unwrap();

        let (_writer, _guard) = file_writer(&log_dir, "test").unwrap();

        assert!(log_dir.exists());
    }
}
