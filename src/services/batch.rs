use super::client::BridgeClient;
use super::runner::{ClientError, CommandRunner};
use crate::models::BatchRecord;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Failures that abort a batch before any record is processed.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Template file not found: {0}")]
    TemplateNotFound(Utf8PathBuf),

    #[error("Failed to open template file: {0}")]
    TemplateOpenFailed(Utf8PathBuf),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Marked,
    /// At least one text update failed; the record was not marked.
    UpdateFailed,
    MarkFailed,
    /// The bridge could not be run for this record.
    Faulted(String),
}

impl RecordStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordStatus::Marked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub id: String,
    pub status: RecordStatus,
    pub failed_entities: Vec<String>,
    /// Record fields with no matching entity in the template.
    pub skipped_entities: Vec<String>,
}

/// Result of [`BatchProcessor::process`].
#[derive(Debug, Clone)]
pub struct BatchStatistics {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: Vec<RecordOutcome>,
    /// `None` when no output path was given.
    pub saved: Option<bool>,
}

impl BatchStatistics {
    fn start(total: usize) -> Self {
        let now = Utc::now();
        Self {
            total,
            success: 0,
            errors: 0,
            started_at: now,
            finished_at: now,
            records: Vec::with_capacity(total),
            saved: None,
        }
    }

    fn record(&mut self, outcome: RecordOutcome) {
        if outcome.status.is_success() {
            self.success += 1;
        } else {
            self.errors += 1;
        }
        self.records.push(outcome);
    }

    /// Wall-clock time between start and end, never negative.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Applies records to a template one at a time: update texts, then mark.
pub struct BatchProcessor<R: CommandRunner> {
    client: BridgeClient<R>,
}

impl<R: CommandRunner> BatchProcessor<R> {
    pub fn new(client: BridgeClient<R>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &BridgeClient<R> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut BridgeClient<R> {
        &mut self.client
    }

    pub fn into_client(self) -> BridgeClient<R> {
        self.client
    }

    /// Process `records` against `template`, saving to `output` at the end if
    /// given.
    ///
    /// Only template problems abort. Record failures are logged and counted,
    /// so `success + errors == total` always holds on return. Updates within a
    /// record do not short-circuit: every field is attempted and the record
    /// is marked only when all of them succeeded.
    pub async fn process(
        &mut self,
        template: &Utf8Path,
        records: &[BatchRecord],
        output: Option<&Utf8Path>,
    ) -> Result<BatchStatistics, BatchError> {
        if !template.exists() {
            tracing::error!("Template file not found: {}", template);
            return Err(BatchError::TemplateNotFound(template.to_path_buf()));
        }

        let mut stats = BatchStatistics::start(records.len());

        if !self.client.open(template).await? {
            return Err(BatchError::TemplateOpenFailed(template.to_path_buf()));
        }

        let available = self.client.list_entities().await?;
        tracing::info!("Available entities in template: {:?}", available);

        for (index, record) in records.iter().enumerate() {
            let id = record.display_id(index);
            tracing::info!("Processing item {}/{}: {}", index + 1, records.len(), id);

            let outcome = match self.process_record(record, &available).await {
                Ok((status, failed_entities, skipped_entities)) => RecordOutcome {
                    id,
                    status,
                    failed_entities,
                    skipped_entities,
                },
                Err(e) => {
                    tracing::error!("Error processing item {}: {}", index + 1, e);
                    RecordOutcome {
                        id,
                        status: RecordStatus::Faulted(e.to_string()),
                        failed_entities: Vec::new(),
                        skipped_entities: Vec::new(),
                    }
                }
            };
            stats.record(outcome);
        }

        if let Some(output) = output {
            let saved = match self.client.save(output).await {
                Ok(saved) => saved,
                Err(e) => {
                    tracing::error!("Failed to save {}: {}", output, e);
                    false
                }
            };
            stats.saved = Some(saved);
        }

        stats.finished_at = Utc::now();
        tracing::info!(
            "Batch finished: {}/{} succeeded, {} errors in {:.2}s",
            stats.success,
            stats.total,
            stats.errors,
            stats.duration().as_secs_f64()
        );
        Ok(stats)
    }

    async fn process_record(
        &mut self,
        record: &BatchRecord,
        available: &[String],
    ) -> Result<(RecordStatus, Vec<String>, Vec<String>), ClientError> {
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        for (entity, text) in &record.fields {
            if !available.iter().any(|name| name == entity) {
                tracing::warn!("Entity not found in template: {}", entity);
                skipped.push(entity.clone());
                continue;
            }
            if !self.client.update_text(entity, text).await? {
                tracing::error!("Failed to update entity: {}", entity);
                failed.push(entity.clone());
            }
        }

        if !failed.is_empty() {
            return Ok((RecordStatus::UpdateFailed, failed, skipped));
        }

        let status = if self.client.mark(None).await? {
            RecordStatus::Marked
        } else {
            tracing::error!("Failed to mark item");
            RecordStatus::MarkFailed
        };
        Ok((status, failed, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::runner::{CommandInvocation, CommandOutput};
    use async_trait::async_trait;
    use tempfile::NamedTempFile;

    /// Answers like a healthy dispatcher with entities `Serial` and `Date`,
    /// failing updates whose text is `BAD`.
    #[derive(Default)]
    struct TemplateRunner {
        calls: Vec<CommandInvocation>,
        fail_mark: bool,
    }

    #[async_trait]
    impl CommandRunner for TemplateRunner {
        async fn run(
            &mut self,
            invocation: &CommandInvocation,
        ) -> Result<CommandOutput, ClientError> {
            self.calls.push(invocation.clone());
            let stdout = match invocation.command.as_str() {
                "open" => "File opened successfully.\n".to_string(),
                "list" => "Entity count: 2\n[0] Serial (Type: 0)\n[1] Date (Type: 0)\n".to_string(),
                "update" if invocation.args.get(1).map(String::as_str) == Some("BAD") => {
                    "ERROR: Failed to update text. Error code: 1\n".to_string()
                }
                "update" => format!("Entity '{}' updated successfully.\n", invocation.args[0]),
                "mark" if self.fail_mark => "ERROR: Marking failed. Error code: 3\n".to_string(),
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

    fn template() -> (NamedTempFile, Utf8PathBuf) {
        let file = NamedTempFile::new().unwrap();
        let path = Utf8PathBuf::try_from(file.path().to_path_buf()).unwrap();
        (file, path)
    }

    fn count(runner: &TemplateRunner, command: &str) -> usize {
        runner.calls.iter().filter(|c| c.command == command).count()
    }

    #[tokio::test]
    async fn test_missing_template_aborts() {
        let mut processor = BatchProcessor::new(BridgeClient::new(TemplateRunner::default()));
        let result = processor
            .process(Utf8Path::new("missing.ezd"), &[BatchRecord::new()], None)
            .await;

        assert!(matches!(result, Err(BatchError::TemplateNotFound(_))));
        assert!(processor.client().runner().calls.is_empty());
    }

    #[tokio::test]
    async fn test_update_failure_skips_mark_but_tries_every_field() {
        let (_file, path) = template();
        let records = [
            BatchRecord::new()
                .with_id("A")
                .with_field("Serial", "BAD")
                .with_field("Date", "2024-01-01"),
            BatchRecord::new().with_field("Serial", "002"),
        ];

        let mut processor = BatchProcessor::new(BridgeClient::new(TemplateRunner::default()));
        let stats = processor.process(&path, &records, None).await.unwrap();

        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.records[0].status, RecordStatus::UpdateFailed);
        assert_eq!(stats.records[0].failed_entities, ["Serial"]);
        assert_eq!(stats.records[1].id, "Item 2");

        let runner = processor.client().runner();
        assert_eq!(count(runner, "update"), 3);
        assert_eq!(count(runner, "mark"), 1);
        assert_eq!(count(runner, "list"), 1);
        assert_eq!(stats.saved, None);
    }

    #[tokio::test]
    async fn test_unknown_entities_are_skipped() {
        let (_file, path) = template();
        let records = [BatchRecord::new()
            .with_field("Serial", "1")
            .with_field("Barcode", "X")];

        let mut processor = BatchProcessor::new(BridgeClient::new(TemplateRunner::default()));
        let stats = processor.process(&path, &records, None).await.unwrap();

        assert_eq!(stats.success, 1);
        assert_eq!(stats.records[0].skipped_entities, ["Barcode"]);
        assert_eq!(count(processor.client().runner(), "update"), 1);
    }

    #[tokio::test]
    async fn test_mark_failure_counts_as_error_and_saves_once() {
        let (_file, path) = template();
        let records = vec![BatchRecord::new().with_field("Serial", "1"); 3];
        let runner = TemplateRunner {
            fail_mark: true,
            ..Default::default()
        };

        let mut processor = BatchProcessor::new(BridgeClient::new(runner));
        let stats = processor
            .process(&path, &records, Some(Utf8Path::new("out.ezd")))
            .await
            .unwrap();

        assert_eq!(stats.success + stats.errors, stats.total);
        assert_eq!(stats.errors, 3);
        assert!(stats.records.iter().all(|r| r.status == RecordStatus::MarkFailed));
        assert_eq!(stats.saved, Some(true));
        assert_eq!(count(processor.client().runner(), "save"), 1);
        assert!(stats.finished_at >= stats.started_at);
    }

    #[test]
    fn test_duration_is_never_negative() {
        let mut stats = BatchStatistics::start(0);
        stats.finished_at = stats.started_at - chrono::Duration::seconds(5);
        assert_eq!(stats.duration(), Duration::ZERO);
    }
}
