use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::db::models::{IntegrationMetadata, IntegrationStatus, Provider};
use crate::error::SyncError;
use crate::tokens::{self, TokenBundle};

pub mod gmail;
pub mod http;
pub mod outlook;

pub use gmail::GmailAdapter;
pub use outlook::OutlookAdapter;

/// Mailbox identity reported by the provider after OAuth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountIdentity {
    pub account_id: String,
    pub email: String,
}

/// Holds the latest rotated credential of a listing. Readable by the caller
/// even after the listing future was dropped on timeout.
#[derive(Debug, Clone, Default)]
pub struct TokenSlot(Rc<RefCell<Option<TokenBundle>>>);

impl TokenSlot {
    pub fn store(&self, tokens: TokenBundle) {
        *self.0.borrow_mut() = Some(tokens);
    }

    pub fn take(&self) -> Option<TokenBundle> {
        self.0.borrow_mut().take()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub user_id: String,
    pub integration_id: String,
    /// Lower bound for message receipt time; `None` lists without a bound.
    pub since: Option<DateTime<Utc>>,
    pub metadata: IntegrationMetadata,
    /// `(message id, part key)` pairs already ingested; not downloaded again.
    pub known_parts: HashSet<(String, String)>,
    pub rotated: TokenSlot,
}

impl ListRequest {
    pub fn is_known(&self, message_id: &str, part_key: &str) -> bool {
        self.known_parts
            .contains(&(message_id.to_string(), part_key.to_string()))
    }
}

/// An invoice-bearing attachment with its bytes already downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAttachment {
    pub part_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// A listed message whose content could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMessage {
    pub id: String,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<CandidateAttachment>,
}

/// Everything a listing round trip reports back to the orchestrator.
///
/// `refreshed_tokens` is set whenever the adapter rotated the credential,
/// including when the listing itself failed afterwards.
#[derive(Debug)]
pub struct ListOutcome {
    pub success: bool,
    pub messages: Vec<ProviderMessage>,
    pub token_refreshed: bool,
    pub refreshed_tokens: Option<TokenBundle>,
    pub integration_status: Option<IntegrationStatus>,
    /// Non-fatal problems (skipped messages, exhausted rate limit).
    pub errors: Vec<String>,
    pub error: Option<SyncError>,
    pub skipped: Vec<SkippedMessage>,
    /// False when the listing stopped before its last page.
    pub complete: bool,
}

impl Default for ListOutcome {
    fn default() -> Self {
        Self {
            success: false,
            messages: Vec::new(),
            token_refreshed: false,
            refreshed_tokens: None,
            integration_status: None,
            errors: Vec::new(),
            error: None,
            skipped: Vec::new(),
            complete: true,
        }
    }
}

impl ListOutcome {
    pub fn succeeded(messages: Vec<ProviderMessage>) -> Self {
        Self {
            success: true,
            messages,
            ..Self::default()
        }
    }

    pub fn failed(error: SyncError) -> Self {
        Self {
            integration_status: error
                .is_paused_signal()
                .then_some(IntegrationStatus::Paused),
            error: Some(error),
            complete: false,
            ..Self::default()
        }
    }

    pub fn with_refreshed_tokens(mut self, tokens: TokenBundle) -> Self {
        self.token_refreshed = true;
        self.refreshed_tokens = Some(tokens);
        self
    }

    /// Records a message the listing walked past without its attachments.
    pub fn skip(
        &mut self,
        integration_id: &str,
        message_id: &str,
        received_at: Option<DateTime<Utc>>,
        error: &SyncError,
    ) {
        warn!(
            integration_id,
            message_id,
            provider_error = %error,
            "skipping message"
        );
        self.errors.push(format!("message {message_id}: {error}"));
        self.skipped.push(SkippedMessage {
            id: message_id.to_string(),
            received_at,
        });
    }

    pub fn error_message(&self, production: bool) -> Option<String> {
        self.error.as_ref().map(|error| error.diagnostic(production))
    }

    /// Folds the listing result and the credential session into an outcome.
    pub(crate) fn finish(
        mut self,
        session: TokenSession<'_>,
        result: Result<(), SyncError>,
    ) -> Self {
        let (tokens, refreshed) = session.into_parts();
        if refreshed {
            self.token_refreshed = true;
            self.refreshed_tokens = Some(tokens);
        }

        match result {
            Ok(()) => self.success = true,
            Err(error @ SyncError::ProviderRateLimit { .. }) => {
                self.success = true;
                self.complete = false;
                self.errors.push(error.to_string());
            }
            Err(error) => {
                self.success = false;
                self.complete = false;
                if error.is_paused_signal() {
                    self.integration_status = Some(IntegrationStatus::Paused);
                }
                self.error = Some(error);
            }
        }
        self
    }
}

/// Errors that end a listing instead of skipping a single message.
pub(crate) fn aborts_listing(error: &SyncError) -> bool {
    matches!(error, SyncError::ProviderRateLimit { .. }) || error.is_paused_signal()
}

/// Only PDFs and images can carry an invoice worth extracting.
pub fn is_invoice_bearing(mime_type: &str, file_name: &str) -> bool {
    let mime = mime_type.trim().to_ascii_lowercase();
    if mime == "application/pdf" || mime.starts_with("image/") {
        return true;
    }

    let generic = mime.is_empty() || mime == "application/octet-stream";
    generic && file_name.trim().to_ascii_lowercase().ends_with(".pdf")
}

#[async_trait(?Send)]
pub trait ProviderAdapter {
    fn provider(&self) -> Provider;

    fn authorization_url(&self, state: &str) -> Result<String, SyncError>;

    async fn exchange_auth_code(&self, code: &str) -> Result<TokenBundle, SyncError>;

    async fn refresh_token(&self, tokens: &TokenBundle) -> Result<TokenBundle, SyncError>;

    async fn fetch_account_identity(
        &self,
        tokens: &TokenBundle,
    ) -> Result<AccountIdentity, SyncError>;

    /// Lists messages received since `request.since` that carry at least one
    /// invoice-bearing attachment. Never fails outright; problems are
    /// reported on the outcome.
    async fn list_new_messages_with_attachments(
        &self,
        tokens: TokenBundle,
        request: &ListRequest,
    ) -> ListOutcome;
}

/// Credential in use for one round trip, refreshed in place when needed.
pub struct TokenSession<'a> {
    adapter: &'a dyn ProviderAdapter,
    tokens: TokenBundle,
    refreshed: bool,
    slot: Option<TokenSlot>,
}

impl<'a> TokenSession<'a> {
    pub fn new(adapter: &'a dyn ProviderAdapter, tokens: TokenBundle) -> Self {
        Self {
            adapter,
            tokens,
            refreshed: false,
            slot: None,
        }
    }

    /// Every refresh is also written to `slot` as soon as it happens.
    pub fn recording_into(mut self, slot: &TokenSlot) -> Self {
        self.slot = Some(slot.clone());
        self
    }

    fn rotate(&mut self, tokens: TokenBundle) {
        if let Some(slot) = &self.slot {
            slot.store(tokens.clone());
        }
        self.tokens = tokens;
        self.refreshed = true;
    }

    pub fn provider(&self) -> Provider {
        self.adapter.provider()
    }

    /// Access token valid for at least the expiry skew.
    pub async fn bearer(&mut self) -> Result<String, SyncError> {
        let lease = tokens::ensure_fresh(self.adapter, self.tokens.clone()).await?;
        if lease.refreshed {
            self.rotate(lease.tokens);
        }
        Ok(self.tokens.access_token.clone())
    }

    /// Called once after the provider answered 401 to a token we believed valid.
    pub async fn force_refresh(&mut self) -> Result<(), SyncError> {
        let lease = tokens::force_refresh(self.adapter, self.tokens.clone()).await?;
        self.rotate(lease.tokens);
        Ok(())
    }

    pub fn into_parts(self) -> (TokenBundle, bool) {
        (self.tokens, self.refreshed)
    }
}

pub struct AdapterRegistry {
    adapters: Vec<Box<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Registry with the live Gmail and Outlook adapters built from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(GmailAdapter::new(
            settings.gmail.clone(),
            settings.max_rate_limit_retries,
        )));
        registry.register(Box::new(OutlookAdapter::new(
            settings.outlook.clone(),
            settings.max_rate_limit_retries,
        )));
        info!(count = registry.adapters.len(), "provider adapters registered");
        registry
    }

    /// A later registration for the same provider replaces the earlier one.
    pub fn register(&mut self, adapter: Box<dyn ProviderAdapter>) {
        let provider = adapter.provider();
        self.adapters.retain(|existing| existing.provider() != provider);
        self.adapters.push(adapter);
    }

    pub fn by_provider(&self, provider: Provider) -> Result<&dyn ProviderAdapter, SyncError> {
        self.adapters
            .iter()
            .find(|adapter| adapter.provider() == provider)
            .map(|adapter| adapter.as_ref())
            .ok_or_else(|| SyncError::NotFound(format!("{provider} adapter")))
    }

    pub fn all(&self) -> &[Box<dyn ProviderAdapter>] {
        &self.adapters
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use super::{
        is_invoice_bearing, AccountIdentity, AdapterRegistry, ListOutcome, ListRequest,
        ProviderAdapter, TokenSession, TokenSlot,
    };
    use crate::db::models::{IntegrationStatus, Provider};
    use crate::error::SyncError;
    use crate::tokens::TokenBundle;

    struct StaticAdapter {
        provider: Provider,
        revoked: bool,
    }

    #[async_trait(?Send)]
    impl ProviderAdapter for StaticAdapter {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn authorization_url(&self, state: &str) -> Result<String, SyncError> {
            Ok(format!("https://auth.test/?state={state}"))
        }

        async fn exchange_auth_code(&self, _code: &str) -> Result<TokenBundle, SyncError> {
            Ok(bundle("exchanged", Some(Duration::hours(1))))
        }

        async fn refresh_token(&self, _tokens: &TokenBundle) -> Result<TokenBundle, SyncError> {
            if self.revoked {
                return Err(SyncError::TokenRevoked {
                    provider: self.provider,
                    message: "invalid_grant".to_string(),
                });
            }
            Ok(TokenBundle {
                refresh_token: None,
                ..bundle("refreshed", Some(Duration::hours(1)))
            })
        }

        async fn fetch_account_identity(
            &self,
            _tokens: &TokenBundle,
        ) -> Result<AccountIdentity, SyncError> {
            Ok(AccountIdentity {
                account_id: "acct".to_string(),
                email: "ap@example.com".to_string(),
            })
        }

        async fn list_new_messages_with_attachments(
            &self,
            _tokens: TokenBundle,
            _request: &ListRequest,
        ) -> ListOutcome {
            ListOutcome::succeeded(Vec::new())
        }
    }

    fn bundle(access: &str, expires_in: Option<Duration>) -> TokenBundle {
        TokenBundle {
            access_token: access.to_string(),
            refresh_token: Some("refresh".to_string()),
            token_type: Some("Bearer".to_string()),
            expiry_date: expires_in.map(|d| Utc::now() + d),
            scopes: vec![],
        }
    }

    #[test]
    fn invoice_bearing_filter_accepts_pdf_and_images_only() {
        assert!(is_invoice_bearing("application/pdf", "invoice.pdf"));
        assert!(is_invoice_bearing("IMAGE/PNG", "scan.png"));
        assert!(is_invoice_bearing("application/octet-stream", "INV-001.PDF"));
        assert!(!is_invoice_bearing("application/octet-stream", "archive.zip"));
        assert!(!is_invoice_bearing("text/calendar", "invite.ics"));
        assert!(!is_invoice_bearing(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "invoice.xlsx"
        ));
    }

    #[test]
    fn registry_replaces_adapter_for_same_provider() {
        let mut registry = AdapterRegistry::new();
        registry.register(Box::new(StaticAdapter {
            provider: Provider::Gmail,
            revoked: false,
        }));
        registry.register(Box::new(StaticAdapter {
            provider: Provider::Gmail,
            revoked: true,
        }));
        assert_eq!(registry.all().len(), 1);
        assert!(registry.by_provider(Provider::Gmail).is_ok());
        assert!(matches!(
            registry.by_provider(Provider::Outlook),
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_refreshes_expiring_token_and_reports_it() {
        let adapter = StaticAdapter {
            provider: Provider::Outlook,
            revoked: false,
        };
        let mut session = TokenSession::new(&adapter, bundle("stale", Some(Duration::seconds(10))));
        assert_eq!(session.bearer().await.expect("bearer"), "refreshed");

        let outcome = ListOutcome::default().finish(session, Ok(()));
        assert!(outcome.success && outcome.token_refreshed);
        let tokens = outcome.refreshed_tokens.expect("rotated tokens");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn rotation_is_readable_from_slot_without_finishing() {
        let adapter = StaticAdapter {
            provider: Provider::Gmail,
            revoked: false,
        };
        let slot = TokenSlot::default();
        let mut session = TokenSession::new(&adapter, bundle("stale", Some(Duration::seconds(5))))
            .recording_into(&slot);
        session.bearer().await.expect("bearer");
        drop(session);

        let rotated = slot.take().expect("rotation recorded");
        assert_eq!(rotated.access_token, "refreshed");
        assert!(slot.take().is_none());
    }

    #[test]
    fn known_parts_match_message_and_part() {
        let mut request = ListRequest::default();
        request
            .known_parts
            .insert(("msg-1".to_string(), "1".to_string()));
        assert!(request.is_known("msg-1", "1"));
        assert!(!request.is_known("msg-1", "2"));
        assert!(!request.is_known("msg-2", "1"));
    }

    #[tokio::test]
    async fn fresh_token_is_used_as_is() {
        let adapter = StaticAdapter {
            provider: Provider::Gmail,
            revoked: true,
        };
        let mut session = TokenSession::new(&adapter, bundle("valid", Some(Duration::hours(1))));
        assert_eq!(session.bearer().await.expect("bearer"), "valid");
        let (_, refreshed) = session.into_parts();
        assert!(!refreshed);
    }

    #[tokio::test]
    async fn revoked_refresh_marks_outcome_paused() {
        let adapter = StaticAdapter {
            provider: Provider::Gmail,
            revoked: true,
        };
        let mut session = TokenSession::new(&adapter, bundle("stale", Some(Duration::seconds(-1))));
        let result = session.bearer().await.map(|_| ());
        let outcome = ListOutcome::default().finish(session, result);
        assert!(!outcome.success);
        assert_eq!(outcome.integration_status, Some(IntegrationStatus::Paused));
        assert!(outcome
            .error_message(true)
            .expect("message")
            .contains("revoked"));
    }

    #[test]
    fn exhausted_rate_limit_is_a_partial_success() {
        let adapter = StaticAdapter {
            provider: Provider::Gmail,
            revoked: false,
        };
        let session = TokenSession::new(&adapter, bundle("valid", None));
        let outcome = ListOutcome::default().finish(
            session,
            Err(SyncError::ProviderRateLimit {
                provider: Provider::Gmail,
                attempts: 6,
            }),
        );
        assert!(outcome.success);
        assert!(!outcome.complete);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.error.is_none());
    }
}
