//! Queue between ingestion and the downstream extraction pipeline.
//!
//! The sync pass only enqueues; a worker drains the queue, delivers each job
//! with its own retry policy and records the outcome on the attachment row.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::connectors::http::redact_response_body;
use crate::db::models::Provider;
use crate::db::Database;
use crate::status::IngestionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionJob {
    pub attachment_id: String,
    pub user_id: String,
    pub integration_id: String,
    pub provider: Provider,
    pub blob_key: String,
    pub file_name: String,
    pub mime_type: String,
}

#[async_trait(?Send)]
pub trait HandoffHandler {
    async fn deliver(&self, job: &ExtractionJob) -> Result<()>;
}

/// POSTs each job as JSON to the extraction service.
pub struct WebhookHandler {
    client: Client,
    url: String,
}

impl WebhookHandler {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait(?Send)]
impl HandoffHandler for WebhookHandler {
    async fn deliver(&self, job: &ExtractionJob) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(job)
            .send()
            .await
            .with_context(|| format!("post extraction job to {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "extraction webhook rejected job: status={} body={}",
                status,
                redact_response_body(&body)
            ));
        }
        Ok(())
    }
}

/// Used when no extraction endpoint is configured.
pub struct LogHandler;

#[async_trait(?Send)]
impl HandoffHandler for LogHandler {
    async fn deliver(&self, job: &ExtractionJob) -> Result<()> {
        info!(
            attachment_id = %job.attachment_id,
            user_id = %job.user_id,
            file_name = %job.file_name,
            "attachment ready for extraction"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }

    fn backoff_after(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Sending half, held by the sync engine.
#[derive(Debug, Clone)]
pub struct HandoffQueue {
    sender: UnboundedSender<ExtractionJob>,
}

impl HandoffQueue {
    pub fn submit(&self, job: ExtractionJob) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|_| anyhow!("extraction handoff worker has stopped"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct HandoffWorker<H> {
    receiver: UnboundedReceiver<ExtractionJob>,
    handler: H,
    policy: RetryPolicy,
}

pub fn channel<H: HandoffHandler>(handler: H, policy: RetryPolicy) -> (HandoffQueue, HandoffWorker<H>) {
    let (sender, receiver) = unbounded_channel();
    (
        HandoffQueue { sender },
        HandoffWorker {
            receiver,
            handler,
            policy,
        },
    )
}

impl<H: HandoffHandler> HandoffWorker<H> {
    /// Drains jobs until every [`HandoffQueue`] has been dropped.
    pub async fn run(mut self, db: &Database) -> HandoffReport {
        let mut report = HandoffReport::default();

        while let Some(job) = self.receiver.recv().await {
            let status = match self.deliver_with_retry(&job).await {
                Ok(()) => {
                    report.delivered += 1;
                    IngestionStatus::Processing
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        attachment_id = %job.attachment_id,
                        attempts = self.policy.max_attempts,
                        "extraction handoff failed: {error:#}"
                    );
                    IngestionStatus::Failed
                }
            };

            if let Err(error) = db.set_attachment_status(&job.attachment_id, status) {
                warn!(
                    attachment_id = %job.attachment_id,
                    %status,
                    "failed to record handoff status: {error}"
                );
            }
        }

        report
    }

    async fn deliver_with_retry(&self, job: &ExtractionJob) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.handler.deliver(job).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt >= self.policy.max_attempts => return Err(error),
                Err(error) => {
                    let wait = self.policy.backoff_after(attempt);
                    warn!(
                        attachment_id = %job.attachment_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "extraction handoff attempt failed: {error:#}"
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use uuid::Uuid;

    use super::{channel, ExtractionJob, HandoffHandler, RetryPolicy};
    use crate::db::models::{Attachment, Integration, IntegrationStatus, Provider};
    use crate::db::Database;
    use crate::status::IngestionStatus;

    struct FlakyHandler {
        failures_before_success: usize,
        calls: RefCell<usize>,
    }

    #[async_trait(?Send)]
    impl HandoffHandler for FlakyHandler {
        async fn deliver(&self, _job: &ExtractionJob) -> Result<()> {
            let mut calls = self.calls.borrow_mut();
            *calls += 1;
            if *calls <= self.failures_before_success {
                return Err(anyhow!("extraction service unavailable"));
            }
            Ok(())
        }
    }

    fn instant_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("invoice-sync-handoff-{}.db", Uuid::new_v4()))
    }

    fn seeded_attachment(db: &Database) -> Attachment {
        let mut integration = Integration::new("user-1", Provider::Gmail);
        integration.status = IntegrationStatus::Success;
        integration.access_token = Some("access".to_string());
        let integration = db.upsert_integration(&integration).expect("insert integration");

        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            user_id: "user-1".to_string(),
            integration_id: integration.id,
            provider: Provider::Gmail,
            provider_message_id: "msg-1".to_string(),
            part_key: "1".to_string(),
            file_name: "invoice.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 4,
            blob_key: "user-1/msg-1/1".to_string(),
            subject: None,
            sender: None,
            received_at: None,
            status: IngestionStatus::Pending,
            created_at: None,
        };
        db.insert_attachment(&attachment).expect("insert attachment");
        attachment
    }

    fn job_for(attachment: &Attachment) -> ExtractionJob {
        ExtractionJob {
            attachment_id: attachment.id.clone(),
            user_id: attachment.user_id.clone(),
            integration_id: attachment.integration_id.clone(),
            provider: attachment.provider,
            blob_key: attachment.blob_key.clone(),
            file_name: attachment.file_name.clone(),
            mime_type: attachment.mime_type.clone(),
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.backoff_after(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(10), Duration::from_secs(8));
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_marked_processing() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let attachment = seeded_attachment(&db);

        let (queue, worker) = channel(
            FlakyHandler {
                failures_before_success: 2,
                calls: RefCell::new(0),
            },
            instant_policy(3),
        );
        queue.submit(job_for(&attachment)).expect("submit");
        drop(queue);

        let report = worker.run(&db).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 0);
        let stored = db.get_attachment(&attachment.id).expect("get").expect("exists");
        assert_eq!(stored.status, IngestionStatus::Processing);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_attachment_failed() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let attachment = seeded_attachment(&db);

        let (queue, worker) = channel(
            FlakyHandler {
                failures_before_success: usize::MAX,
                calls: RefCell::new(0),
            },
            instant_policy(2),
        );
        queue.submit(job_for(&attachment)).expect("submit");
        drop(queue);

        let report = worker.run(&db).await;
        assert_eq!(report.failed, 1);
        let stored = db.get_attachment(&attachment.id).expect("get").expect("exists");
        assert_eq!(stored.status, IngestionStatus::Failed);
        let _ = std::fs::remove_file(path);
    }
}
