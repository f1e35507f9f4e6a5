//! Fan-out over tenant integrations.
//!
//! Every integration runs `credential -> list -> ingest -> commit` inside its
//! own future under a deadline. Whatever goes wrong there ends up in that
//! integration's [`SyncResult`]; only resolving the integration set can fail
//! the run as a whole.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::blob::BlobStore;
use crate::config::Settings;
use crate::connectors::{AdapterRegistry, ListOutcome, ListRequest, TokenSlot};
use crate::db::models::{Integration, IntegrationStatus, Provider};
use crate::db::Database;
use crate::error::SyncError;
use crate::handoff::HandoffQueue;
use crate::ingest::AttachmentIngestor;
use crate::tokens;
use crate::watermark::{self, CursorMove, PassProgress, MAX_HELD_BACK_PASSES};

pub const MSG_ALL_SYNCED: &str = "synced successfully";
pub const MSG_PARTIAL: &str = "synced with partial errors";
pub const MSG_ALL_FAILED: &str = "unable to sync for any integration";
pub const MSG_NOTHING_TO_SYNC: &str = "no integrations to sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    Provider(Provider),
    Integration { user_id: String, provider: Provider },
}

impl SyncScope {
    pub fn provider(&self) -> Provider {
        match self {
            Self::Provider(provider) | Self::Integration { provider, .. } => *provider,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Self::Integration { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub integration_id: String,
    pub user_id: String,
    pub provider: Provider,
    pub success: bool,
    pub message: String,
    pub emails_synced: usize,
    pub token_refreshed: bool,
    pub integration_status: IntegrationStatus,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub total_integrations: usize,
    pub processed_integrations: usize,
    pub total_emails: usize,
    pub total_success: usize,
    pub total_failed: usize,
    pub token_refreshes: usize,
    pub total_paused: usize,
}

impl RunMetrics {
    fn tally(total_integrations: usize, results: &[SyncResult]) -> Self {
        let mut metrics = Self {
            total_integrations,
            processed_integrations: results.len(),
            ..Self::default()
        };
        for result in results {
            metrics.total_emails += result.emails_synced;
            if result.success {
                metrics.total_success += 1;
            } else {
                metrics.total_failed += 1;
            }
            if result.token_refreshed {
                metrics.token_refreshes += 1;
            }
            if result.integration_status == IntegrationStatus::Paused {
                metrics.total_paused += 1;
            }
        }
        metrics
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub message: String,
    pub metadata: RunMetrics,
    pub data: Vec<SyncResult>,
}

impl RunSummary {
    fn from_results(total_integrations: usize, data: Vec<SyncResult>) -> Self {
        Self {
            message: classify(&data).to_string(),
            metadata: RunMetrics::tally(total_integrations, &data),
            data,
        }
    }

    /// Response body for a run: the full summary for a provider-wide run,
    /// `{message, data}` for a single integration.
    pub fn to_json(&self, scope: &SyncScope) -> serde_json::Value {
        if scope.is_single() {
            json!({ "message": self.message, "data": self.data.first() })
        } else {
            json!(self)
        }
    }
}

pub fn classify(results: &[SyncResult]) -> &'static str {
    let succeeded = results.iter().filter(|result| result.success).count();
    match (succeeded, results.len()) {
        (_, 0) => MSG_NOTHING_TO_SYNC,
        (ok, total) if ok == total => MSG_ALL_SYNCED,
        (0, _) => MSG_ALL_FAILED,
        _ => MSG_PARTIAL,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub concurrency: usize,
    pub pass_timeout: Duration,
    pub production: bool,
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings.concurrency,
            pass_timeout: settings.pass_timeout,
            production: settings.production,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            pass_timeout: Duration::from_secs(300),
            production: false,
        }
    }
}

pub struct SyncEngine<'a> {
    db: &'a Database,
    adapters: &'a AdapterRegistry,
    blobs: &'a dyn BlobStore,
    options: SyncOptions,
    handoff: Option<HandoffQueue>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        db: &'a Database,
        adapters: &'a AdapterRegistry,
        blobs: &'a dyn BlobStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            db,
            adapters,
            blobs,
            options,
            handoff: None,
        }
    }

    /// Stored attachments are submitted here. The queue closes when the
    /// engine is dropped.
    pub fn with_handoff(mut self, queue: HandoffQueue) -> Self {
        self.handoff = Some(queue);
        self
    }

    pub async fn run(&self, scope: &SyncScope) -> Result<RunSummary, SyncError> {
        let integrations = self.resolve(scope)?;
        let total = integrations.len();
        info!(?scope, integrations = total, "sync run started");

        let passes = integrations
            .into_iter()
            .enumerate()
            .map(|(index, integration)| async move {
                (index, self.sync_integration(integration).await)
            });
        let mut indexed: Vec<(usize, SyncResult)> = stream::iter(passes)
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        let results = indexed.into_iter().map(|(_, result)| result).collect();

        let summary = RunSummary::from_results(total, results);
        info!(
            message = %summary.message,
            succeeded = summary.metadata.total_success,
            failed = summary.metadata.total_failed,
            emails = summary.metadata.total_emails,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Runs `scope` every `interval` until `on_pass` breaks. A run that fails
    /// as a whole is logged, handed to `on_pass` and retried next interval.
    pub async fn watch<F>(&self, scope: &SyncScope, interval: Duration, mut on_pass: F)
    where
        F: FnMut(Result<&RunSummary, &SyncError>) -> ControlFlow<()>,
    {
        loop {
            let result = self.run(scope).await;
            if let Err(error) = &result {
                error!(?scope, "sync run failed: {error}");
            }
            if on_pass(result.as_ref()).is_break() {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn resolve(&self, scope: &SyncScope) -> Result<Vec<Integration>, SyncError> {
        match scope {
            SyncScope::Provider(provider) => Ok(self.db.list_integrations(Some(*provider))?),
            SyncScope::Integration { user_id, provider } => self
                .db
                .get_integration_for_user(user_id, *provider)?
                .map(|integration| vec![integration])
                .ok_or_else(|| {
                    SyncError::NotFound(format!("{provider} integration for user {user_id}"))
                }),
        }
    }

    /// One integration end to end. Never fails; failures are folded into the result.
    async fn sync_integration(&self, integration: Integration) -> SyncResult {
        let started_at = Utc::now();
        let deadline = self.options.pass_timeout;
        let rotated = TokenSlot::default();

        let pipeline = self.run_pipeline(&integration, started_at, &rotated);
        let result = match timeout(deadline, pipeline).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => self.failed(&integration, &error, integration.status),
            Err(_) => {
                let mut result =
                    self.failed(&integration, &SyncError::Timeout(deadline), integration.status);
                // The listing future is gone; its rotated credential survives in the slot.
                if let Some(bundle) = rotated.take() {
                    result.token_refreshed = true;
                    if let Err(error) = tokens::persist_rotated(self.db, &integration.id, &bundle) {
                        warn!(
                            integration_id = %integration.id,
                            "failed to persist refreshed token after timeout: {error}"
                        );
                    }
                }
                result
            }
        };

        if result.success {
            info!(
                integration_id = %result.integration_id,
                user_id = %result.user_id,
                provider = %result.provider,
                emails = result.emails_synced,
                "integration synced"
            );
        } else {
            error!(
                integration_id = %result.integration_id,
                user_id = %result.user_id,
                provider = %result.provider,
                errors = ?result.errors,
                "integration sync failed"
            );
            self.record_failure(&integration.id, &result.message, started_at);
        }
        result
    }

    async fn run_pipeline(
        &self,
        integration: &Integration,
        started_at: DateTime<Utc>,
        rotated: &TokenSlot,
    ) -> Result<SyncResult, SyncError> {
        let credential = tokens::require_credential(integration)?;
        let adapter = self.adapters.by_provider(integration.provider)?;

        let metadata = integration.typed_metadata();
        let since = watermark::resolve_cursor(&metadata);
        let request = ListRequest {
            user_id: integration.user_id.clone(),
            integration_id: integration.id.clone(),
            since,
            metadata,
            known_parts: self.known_parts(integration, since),
            rotated: rotated.clone(),
        };
        let outcome = adapter
            .list_new_messages_with_attachments(credential, &request)
            .await;

        self.persist_credential_changes(integration, &outcome);
        let status = outcome.integration_status.unwrap_or(integration.status);

        if !outcome.success {
            let error = outcome.error.as_ref().map_or_else(
                || "listing failed without an error".to_string(),
                |error| error.diagnostic(self.options.production),
            );
            let mut errors = outcome.errors;
            errors.push(error.clone());
            return Ok(SyncResult {
                integration_id: integration.id.clone(),
                user_id: integration.user_id.clone(),
                provider: integration.provider,
                success: false,
                message: error,
                emails_synced: 0,
                token_refreshed: outcome.token_refreshed,
                integration_status: status,
                errors,
            });
        }

        let ingestor =
            AttachmentIngestor::new(self.db, self.blobs).with_handoff(self.handoff.as_ref());
        let report = ingestor.ingest(integration, &outcome.messages);

        let mut failed: Vec<_> = outcome
            .skipped
            .iter()
            .map(|skipped| skipped.received_at)
            .collect();
        failed.extend(report.failures.iter().map(|failure| failure.received_at));
        let progress = PassProgress {
            stored: report.stored,
            listed_everything: outcome.complete,
            failed,
        };
        let movement =
            match watermark::commit_cursor(self.db, &integration.id, started_at, &progress) {
                Ok(movement) => movement,
                Err(error) => {
                    warn!(integration_id = %integration.id, "failed to commit watermark: {error}");
                    CursorMove::Unchanged
                }
            };

        let message = match movement {
            CursorMove::Advanced => format!("synced {} new attachments", report.stored),
            CursorMove::HeldBack { .. } | CursorMove::Unchanged => format!(
                "synced {} new attachments; remaining messages will be picked up next run",
                report.stored
            ),
            CursorMove::GaveUp => {
                error!(
                    integration_id = %integration.id,
                    messages = progress.failed.len(),
                    passes = MAX_HELD_BACK_PASSES,
                    "giving up on messages that kept failing"
                );
                format!(
                    "synced {} new attachments; {} messages failed {MAX_HELD_BACK_PASSES} passes in a row and were skipped",
                    report.stored,
                    progress.failed.len()
                )
            }
        };
        let mut errors = outcome.errors;
        errors.extend(report.failures.iter().map(ToString::to_string));

        Ok(SyncResult {
            integration_id: integration.id.clone(),
            user_id: integration.user_id.clone(),
            provider: integration.provider,
            success: true,
            message,
            emails_synced: report.stored,
            token_refreshed: outcome.token_refreshed,
            integration_status: status,
            errors,
        })
    }

    /// Parts stored since the cursor, so the adapter can skip downloading
    /// them. A lookup failure only costs redundant downloads.
    fn known_parts(
        &self,
        integration: &Integration,
        since: Option<DateTime<Utc>>,
    ) -> HashSet<(String, String)> {
        let since = since.map(watermark::format_timestamp);
        self.db
            .known_parts(&integration.user_id, integration.provider, since.as_deref())
            .unwrap_or_else(|error| {
                warn!(integration_id = %integration.id, "failed to load ingested parts: {error}");
                HashSet::new()
            })
    }

    /// Rotated tokens are saved whether or not the listing succeeded.
    fn persist_credential_changes(&self, integration: &Integration, outcome: &ListOutcome) {
        if let Some(rotated) = &outcome.refreshed_tokens {
            if let Err(error) = tokens::persist_rotated(self.db, &integration.id, rotated) {
                warn!(integration_id = %integration.id, "failed to persist refreshed token: {error}");
            }
        }

        if let Some(status) = outcome.integration_status {
            if status != integration.status {
                if let Err(error) = self.db.set_integration_status(&integration.id, status) {
                    warn!(
                        integration_id = %integration.id,
                        %status,
                        "failed to update integration status: {error}"
                    );
                } else {
                    info!(integration_id = %integration.id, %status, "integration status changed");
                }
            }
        }
    }

    fn failed(
        &self,
        integration: &Integration,
        error: &SyncError,
        status: IntegrationStatus,
    ) -> SyncResult {
        let message = error.diagnostic(self.options.production);
        SyncResult {
            integration_id: integration.id.clone(),
            user_id: integration.user_id.clone(),
            provider: integration.provider,
            success: false,
            message: message.clone(),
            emails_synced: 0,
            token_refreshed: false,
            integration_status: status,
            errors: vec![message],
        }
    }

    fn record_failure(&self, integration_id: &str, message: &str, at: DateTime<Utc>) {
        let patch = json!({
            "lastSyncError": message,
            "lastFailedAt": watermark::format_timestamp(at),
        });
        if let Err(error) = self.db.merge_integration_metadata(integration_id, &patch) {
            warn!(integration_id, "failed to record sync failure: {error}");
        }
    }
}
