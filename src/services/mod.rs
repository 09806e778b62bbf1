//! Services module - everything between the automation front end and the
//! command dispatcher.
//!
//! # Components
//!
//! - [`CommandRunner`]: runs one dispatcher command and captures its text.
//!   [`SubprocessRunner`] launches `ezcad-bridge` per command,
//!   [`InProcessRunner`] drives a [`crate::dispatcher::Dispatcher`] directly.
//! - [`BridgeClient`]: typed operations (`open`, `update_text`, `mark`, ...)
//!   whose success is read from the dispatcher's output.
//! - [`BatchProcessor`]: opens a template once and applies records to it,
//!   producing [`BatchStatistics`].
//! - [`load_records_csv`] / [`load_mappings`]: batch records from CSV data.
//! - [`DirectoryWatcher`]: turns file changes in a watched directory into
//!   [`FileEvent`]s, and [`JobQueue`] / [`JobWorker`] run them as jobs.
//!
//! All bridge calls are sequential. The client awaits each command before
//! issuing the next, and the vendor library is never touched from two places;
//! the job queue has a single worker for that reason.

pub mod batch;
pub mod client;
pub mod integration;
pub mod queue;
pub mod records;
pub mod runner;
pub mod watcher;

pub use batch::{BatchError, BatchProcessor, BatchStatistics, RecordOutcome, RecordStatus};
pub use client::{BridgeClient, EntityDescriptor, parse_entity_line};
pub use integration::{list_entities_in_template, test_integration};
pub use queue::{
    Job, JobError, JobId, JobKind, JobQueue, JobResult, JobStatus, JobWorker, feed_jobs,
};
pub use records::{EntityMappings, RecordError, load_mappings, load_records_csv};
pub use runner::{
    ClientError, CommandInvocation, CommandOutput, CommandRunner, InProcessRunner,
    SubprocessRunner, locate_bridge_executable,
};
pub use watcher::{
    ChangeKind, Debouncer, DirectoryWatcher, EventForwarder, FileEvent, FilePatterns, WatchError,
};
