//! Priority job queue fed by the directory watcher.
//!
//! File events arrive on an `mpsc` channel and become [`Job`]s in a
//! [`JobQueue`]. A single [`JobWorker`] takes the highest-priority pending job
//! (lowest number first, then oldest) and runs it through the
//! [`BatchProcessor`]. There is one worker because the marking library holds
//! one open document at a time.

use super::batch::{BatchError, BatchProcessor};
use super::records::{EntityMappings, RecordError, load_records_csv};
use super::runner::{ClientError, CommandRunner};
use super::watcher::FileEvent;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local, TimeDelta};
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, watch};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// A CSV file to mark against the current template.
    Data,
    /// An EZD file that becomes the template for later data jobs.
    Template,
}

impl JobKind {
    /// Template changes run before queued data so later rows use them.
    pub fn default_priority(self) -> u8 {
        match self {
            JobKind::Template => 0,
            JobKind::Data => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Batch {
        total: usize,
        success: usize,
        errors: usize,
    },
    Template {
        entities: usize,
    },
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobResult::Batch {
                total,
                success,
                errors,
            } => write!(f, "{success}/{total} marked, {errors} errors"),
            JobResult::Template { entities } => write!(f, "template with {entities} entities"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub path: Utf8PathBuf,
    pub kind: JobKind,
    /// Lower runs first.
    pub priority: u8,
    pub status: JobStatus,
    pub added_at: DateTime<Local>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("No template configured for data file: {0}")]
    NoTemplate(Utf8PathBuf),

    #[error("Failed to open template: {0}")]
    TemplateOpenFailed(Utf8PathBuf),

    #[error(transparent)]
    Records(#[from] RecordError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Default)]
struct QueueState {
    jobs: IndexMap<JobId, Job>,
    pending: BinaryHeap<Reverse<(u8, JobId)>>,
    next_id: JobId,
}

/// Shared handle to the job table and its pending heap.
#[derive(Clone, Default)]
pub struct JobQueue {
    state: Arc<Mutex<QueueState>>,
    ready: Arc<Notify>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_job(&self, path: impl Into<Utf8PathBuf>, kind: JobKind, priority: u8) -> JobId {
        let path = path.into();
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            tracing::info!("Added job {} to queue: {}", id, path);
            state.jobs.insert(
                id,
                Job {
                    id,
                    path,
                    kind,
                    priority,
                    status: JobStatus::Pending,
                    added_at: Local::now(),
                    started_at: None,
                    finished_at: None,
                    result: None,
                    error: None,
                },
            );
            // Ids grow with insertion, so equal priorities run oldest first
            state.pending.push(Reverse((priority, id)));
            id
        };
        self.ready.notify_one();
        id
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Every tracked job, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .count()
    }

    /// Cancel a job that has not started yet.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut state = self.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Canceled;
                job.finished_at = Some(Local::now());
                tracing::info!("Canceled job {}", id);
                true
            }
            _ => {
                tracing::warn!("Cannot cancel job {} - not found or not pending", id);
                false
            }
        }
    }

    /// Forget finished jobs that were added more than `max_age` ago.
    pub fn clear_finished(&self, max_age: TimeDelta) -> usize {
        self.clear_finished_before(Local::now() - max_age)
    }

    pub fn clear_finished_before(&self, cutoff: DateTime<Local>) -> usize {
        let mut state = self.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !(job.status.is_finished() && job.added_at < cutoff));
        let removed = before - state.jobs.len();
        tracing::info!("Cleared {} old finished jobs", removed);
        removed
    }

    /// Pop the next pending job and mark it running. Canceled entries left
    /// in the heap are skipped.
    pub fn take_next(&self) -> Option<Job> {
        let mut state = self.lock();
        while let Some(Reverse((_, id))) = state.pending.pop() {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == JobStatus::Pending {
                    job.status = JobStatus::Running;
                    job.started_at = Some(Local::now());
                    return Some(job.clone());
                }
            }
        }
        None
    }

    /// Wait until a pending job is available and take it.
    pub async fn next_job(&self) -> Job {
        loop {
            if let Some(job) = self.take_next() {
                return job;
            }
            self.ready.notified().await;
        }
    }

    /// Record how a running job ended.
    pub fn finish(&self, id: JobId, outcome: Result<JobResult, JobError>) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        job.finished_at = Some(Local::now());
        match outcome {
            Ok(result) => {
                tracing::info!("Completed job {}: {}", id, result);
                job.status = JobStatus::Completed;
                job.result = Some(result);
            }
            Err(e) => {
                tracing::error!("Failed job {}: {}", id, e);
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
            }
        }
    }
}

/// Turn file events into jobs until the channel closes.
pub async fn feed_jobs(queue: JobQueue, mut events: mpsc::Receiver<FileEvent>) {
    while let Some(event) = events.recv().await {
        let id = queue.add_job(event.path, event.kind, event.kind.default_priority());
        tracing::debug!("Created {:?} job {} from {:?} event", event.kind, id, event.change);
    }
    tracing::debug!("File event feed closed");
}

/// Runs queued jobs one at a time.
pub struct JobWorker<R: CommandRunner> {
    processor: BatchProcessor<R>,
    template: Option<Utf8PathBuf>,
    mappings: Option<EntityMappings>,
    output_dir: Option<Utf8PathBuf>,
}

impl<R: CommandRunner> JobWorker<R> {
    pub fn new(processor: BatchProcessor<R>) -> Self {
        Self {
            processor,
            template: None,
            mappings: None,
            output_dir: None,
        }
    }

    pub fn with_template(mut self, template: Option<Utf8PathBuf>) -> Self {
        self.template = template;
        self
    }

    pub fn with_mappings(mut self, mappings: Option<EntityMappings>) -> Self {
        self.mappings = mappings;
        self
    }

    /// Data jobs save `<output_dir>/<data file stem>.ezd`.
    pub fn with_output_dir(mut self, output_dir: Option<Utf8PathBuf>) -> Self {
        self.output_dir = output_dir;
        self
    }

    /// Template used by the next data job.
    pub fn template(&self) -> Option<&Utf8Path> {
        self.template.as_deref()
    }

    pub fn processor(&self) -> &BatchProcessor<R> {
        &self.processor
    }

    pub async fn run_job(&mut self, job: &Job) -> Result<JobResult, JobError> {
        tracing::info!("Processing job {} ({})", job.id, job.path);
        match job.kind {
            JobKind::Template => self.switch_template(&job.path).await,
            JobKind::Data => self.process_data(&job.path).await,
        }
    }

    async fn switch_template(&mut self, path: &Utf8Path) -> Result<JobResult, JobError> {
        let client = self.processor.client_mut();
        if !client.open(path).await? {
            return Err(JobError::TemplateOpenFailed(path.to_path_buf()));
        }
        let entities = client.list_entities().await?;

        tracing::info!("Using template {} for data jobs", path);
        self.template = Some(path.to_path_buf());
        Ok(JobResult::Template {
            entities: entities.len(),
        })
    }

    async fn process_data(&mut self, path: &Utf8Path) -> Result<JobResult, JobError> {
        let template = self
            .template
            .clone()
            .ok_or_else(|| JobError::NoTemplate(path.to_path_buf()))?;
        let records = load_records_csv(path, self.mappings.as_ref())?;
        let output = self
            .output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.ezd", path.file_stem().unwrap_or("output"))));

        let stats = self
            .processor
            .process(&template, &records, output.as_deref())
            .await?;
        Ok(JobResult::Batch {
            total: stats.total,
            success: stats.success,
            errors: stats.errors,
        })
    }

    /// Take jobs from `queue` until `shutdown` turns true. A running job is
    /// finished before the worker stops.
    pub async fn run(mut self, queue: JobQueue, mut shutdown: watch::Receiver<bool>) -> Self {
        tracing::info!("Job worker started");
        while !*shutdown.borrow() {
            let job = tokio::select! {
                job = queue.next_job() => job,
                _ = shutdown.changed() => break,
            };
            let outcome = self.run_job(&job).await;
            queue.finish(job.id, outcome);
        }
        tracing::info!("Job worker stopped");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::client::BridgeClient;
    use crate::services::runner::{CommandInvocation, CommandOutput};
    use crate::services::watcher::ChangeKind;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    /// Accepts every command on any existing document.
    #[derive(Default)]
    struct AcceptingRunner {
        commands: Vec<String>,
    }

    #[async_trait]
    impl CommandRunner for AcceptingRunner {
        async fn run(
            &mut self,
            invocation: &CommandInvocation,
        ) -> Result<CommandOutput, ClientError> {
            self.commands.push(invocation.command.clone());
            let stdout = match invocation.command.as_str() {
                "open" => "File opened successfully.\n".to_string(),
                "list" => "Entity count: 1\n[0] Serial (Type: 0)\n".to_string(),
                "update" => format!("Entity '{}' updated successfully.\n", invocation.args[0]),
                "mark" => "Marking completed successfully.\n".to_string(),
                "save" => "File saved successfully.\n".to_string(),
                _ => String::new(),
            };
            Ok(CommandOutput {
                stdout,
                ..Default::default()
            })
        }
    }

    fn worker() -> JobWorker<AcceptingRunner> {
        JobWorker::new(BatchProcessor::new(BridgeClient::new(
            AcceptingRunner::default(),
        )))
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::try_from(dir.path().join(name)).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_take_next_by_priority_then_age() {
        let queue = JobQueue::new();
        let first_data = queue.add_job("a.csv", JobKind::Data, 1);
        let second_data = queue.add_job("b.csv", JobKind::Data, 1);
        let template = queue.add_job("plate.ezd", JobKind::Template, 0);

        assert_eq!(queue.take_next().unwrap().id, template);
        assert_eq!(queue.take_next().unwrap().id, first_data);
        assert_eq!(queue.take_next().unwrap().id, second_data);
        assert!(queue.take_next().is_none());
        assert_eq!(queue.job(first_data).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_cancel_only_pending_jobs() {
        let queue = JobQueue::new();
        let running = queue.add_job("a.csv", JobKind::Data, 1);
        let pending = queue.add_job("b.csv", JobKind::Data, 1);
        queue.take_next();

        assert!(!queue.cancel(running));
        assert!(queue.cancel(pending));
        assert!(!queue.cancel(pending));
        assert!(!queue.cancel(99));
        assert!(queue.take_next().is_none());
        assert_eq!(queue.job(pending).unwrap().status, JobStatus::Canceled);
    }

    #[test]
    fn test_clear_finished_keeps_active_jobs() {
        let queue = JobQueue::new();
        let done = queue.add_job("a.csv", JobKind::Data, 1);
        let canceled = queue.add_job("b.csv", JobKind::Data, 1);
        let pending = queue.add_job("c.csv", JobKind::Data, 1);
        queue.take_next();
        queue.finish(done, Ok(JobResult::Template { entities: 0 }));
        queue.cancel(canceled);

        assert_eq!(queue.clear_finished(TimeDelta::hours(24)), 0);
        let removed = queue.clear_finished_before(Local::now() + TimeDelta::seconds(1));

        assert_eq!(removed, 2);
        assert_eq!(
            queue.jobs().iter().map(|job| job.id).collect::<Vec<_>>(),
            [pending]
        );
    }

    #[tokio::test]
    async fn test_feed_creates_jobs_with_default_priority() {
        let queue = JobQueue::new();
        let (sender, receiver) = mpsc::channel(4);
        sender
            .send(FileEvent {
                path: Utf8PathBuf::from("in/parts.csv"),
                kind: JobKind::Data,
                change: ChangeKind::Created,
            })
            .await
            .unwrap();
        sender
            .send(FileEvent {
                path: Utf8PathBuf::from("in/plate.ezd"),
                kind: JobKind::Template,
                change: ChangeKind::Modified,
            })
            .await
            .unwrap();
        drop(sender);

        feed_jobs(queue.clone(), receiver).await;

        let next = queue.next_job().await;
        assert_eq!(next.kind, JobKind::Template);
        assert_eq!(next.priority, 0);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_data_job_without_template_fails() {
        let dir = TempDir::new().unwrap();
        let data = write(&dir, "parts.csv", "Serial\n001\n");
        let queue = JobQueue::new();
        let id = queue.add_job(data, JobKind::Data, 1);

        let mut worker = worker();
        let job = queue.take_next().unwrap();
        queue.finish(id, worker.run_job(&job).await);

        let job = queue.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("No template"));
    }

    #[tokio::test]
    async fn test_template_job_then_data_job() {
        let dir = TempDir::new().unwrap();
        let template = write(&dir, "plate.ezd", "");
        let data = write(&dir, "parts.csv", "ID,Serial\nA,001\nB,002\n");
        let output_dir = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let queue = JobQueue::new();
        let data_job = queue.add_job(data.clone(), JobKind::Data, 1);
        let template_job = queue.add_job(template.clone(), JobKind::Template, 0);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = worker().with_output_dir(Some(output_dir));
        let handle = tokio::spawn(worker.run(queue.clone(), shutdown_rx));

        while queue
            .jobs()
            .iter()
            .any(|job| !job.status.is_finished())
        {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(true).unwrap();
        let worker = handle.await.unwrap();

        assert_eq!(worker.template(), Some(template.as_path()));
        assert_eq!(
            queue.job(template_job).unwrap().result,
            Some(JobResult::Template { entities: 1 })
        );
        assert_eq!(
            queue.job(data_job).unwrap().result,
            Some(JobResult::Batch {
                total: 2,
                success: 2,
                errors: 0
            })
        );
        let commands = &worker.processor().client().runner().commands;
        assert_eq!(commands.iter().filter(|c| *c == "save").count(), 1);
    }

    #[tokio::test]
    async fn test_worker_stops_when_idle() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker().run(JobQueue::new(), shutdown_rx));

        shutdown_tx.send(true).unwrap();
        let worker = handle.await.unwrap();
        assert!(worker.processor().client().runner().commands.is_empty());
    }
}
