use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::blob::{BlobKey, BlobStore};
use crate::connectors::{is_invoice_bearing, CandidateAttachment, ProviderMessage};
use crate::db::models::{Attachment, Integration};
use crate::db::Database;
use crate::handoff::{ExtractionJob, HandoffQueue};
use crate::status::IngestionStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub stored: usize,
    pub duplicates: usize,
    pub unsupported: usize,
    /// Attachments that could not be persisted.
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestFailure {
    pub message_id: String,
    pub part_key: String,
    pub received_at: Option<DateTime<Utc>>,
    pub error: String,
}

impl fmt::Display for IngestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {} part {}: {}",
            self.message_id, self.part_key, self.error
        )
    }
}

impl IngestReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Persists provider attachments exactly once per
/// `(user, provider message id, part key)`.
pub struct AttachmentIngestor<'a> {
    db: &'a Database,
    blobs: &'a dyn BlobStore,
    handoff: Option<&'a HandoffQueue>,
}

impl<'a> AttachmentIngestor<'a> {
    pub fn new(db: &'a Database, blobs: &'a dyn BlobStore) -> Self {
        Self {
            db,
            blobs,
            handoff: None,
        }
    }

    pub fn with_handoff(mut self, handoff: Option<&'a HandoffQueue>) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn ingest(&self, integration: &Integration, messages: &[ProviderMessage]) -> IngestReport {
        let mut report = IngestReport::default();

        for message in messages {
            for candidate in &message.attachments {
                if !is_invoice_bearing(&candidate.mime_type, &candidate.file_name) {
                    report.unsupported += 1;
                    continue;
                }

                match self.store(integration, message, candidate) {
                    Ok(Some(attachment)) => {
                        report.stored += 1;
                        self.hand_off(&attachment);
                    }
                    Ok(None) => report.duplicates += 1,
                    Err(error) => {
                        warn!(
                            integration_id = %integration.id,
                            message_id = %message.id,
                            part_key = %candidate.part_key,
                            "failed to store attachment: {error:#}"
                        );
                        report.failures.push(IngestFailure {
                            message_id: message.id.clone(),
                            part_key: candidate.part_key.clone(),
                            received_at: message.received_at,
                            error: format!("{error:#}"),
                        });
                    }
                }
            }
        }

        debug!(
            integration_id = %integration.id,
            stored = report.stored,
            duplicates = report.duplicates,
            unsupported = report.unsupported,
            failures = report.failures.len(),
            "ingest finished"
        );
        report
    }

    /// Returns `None` when the attachment was already ingested.
    fn store(
        &self,
        integration: &Integration,
        message: &ProviderMessage,
        candidate: &CandidateAttachment,
    ) -> anyhow::Result<Option<Attachment>> {
        if self
            .db
            .attachment_exists(&integration.user_id, &message.id, &candidate.part_key)?
        {
            return Ok(None);
        }

        let key = BlobKey::attachment(&integration.user_id, &message.id, &candidate.part_key);
        self.blobs.put(&key, &candidate.content)?;

        let attachment = Attachment {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: integration.user_id.clone(),
            integration_id: integration.id.clone(),
            provider: integration.provider,
            provider_message_id: message.id.clone(),
            part_key: candidate.part_key.clone(),
            file_name: candidate.file_name.clone(),
            mime_type: candidate.mime_type.clone(),
            size_bytes: candidate.content.len() as i64,
            blob_key: key.as_str().to_string(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            received_at: message
                .received_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            status: IngestionStatus::Pending,
            created_at: None,
        };

        // A concurrent pass may have won the insert; the blob it wrote is the same bytes.
        if !self.db.insert_attachment(&attachment)? {
            return Ok(None);
        }
        Ok(Some(attachment))
    }

    fn hand_off(&self, attachment: &Attachment) {
        let Some(queue) = self.handoff else {
            return;
        };
        let job = ExtractionJob {
            attachment_id: attachment.id.clone(),
            user_id: attachment.user_id.clone(),
            integration_id: attachment.integration_id.clone(),
            provider: attachment.provider,
            blob_key: attachment.blob_key.clone(),
            file_name: attachment.file_name.clone(),
            mime_type: attachment.mime_type.clone(),
        };
        if let Err(error) = queue.submit(job) {
            warn!(attachment_id = %attachment.id, "extraction handoff not queued: {error}");
        }
    }
}
