#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration as StdDuration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use invoice_sync::connectors::{
    AccountIdentity, CandidateAttachment, ListOutcome, ListRequest, ProviderAdapter,
    ProviderMessage, SkippedMessage,
};
use invoice_sync::db::models::{Integration, IntegrationStatus, Provider};
use invoice_sync::db::Database;
use invoice_sync::error::SyncError;
use invoice_sync::tokens::TokenBundle;

/// What the fake provider does when asked to list a user's mailbox.
#[derive(Debug, Clone)]
pub enum Mailbox {
    Messages(Vec<ProviderMessage>),
    Fails(String),
    Revoked,
    Hangs,
    RefreshesThenFails,
    /// Rotates the credential, then never answers.
    RefreshesThenHangs,
    RateLimited(Vec<ProviderMessage>),
    /// Lists `messages` but cannot download the `skipped` ones.
    Skips {
        messages: Vec<ProviderMessage>,
        skipped: Vec<SkippedMessage>,
    },
    /// Answers with no messages after a delay.
    Slow(StdDuration),
}

#[derive(Default)]
pub struct FakeState {
    pub mailboxes: RefCell<HashMap<String, Mailbox>>,
    /// `(user_id, since)` for every listing call.
    pub list_calls: RefCell<Vec<(String, Option<DateTime<Utc>>)>>,
    /// Authorization code -> mailbox address reported by the identity call.
    pub identities: RefCell<HashMap<String, String>>,
    /// Already-ingested parts handed to the latest listing, per user.
    pub known_parts: RefCell<HashMap<String, HashSet<(String, String)>>>,
    pub in_flight: Cell<usize>,
    pub max_in_flight: Cell<usize>,
    pub refreshes: Cell<usize>,
}

/// Counts a listing as in flight until dropped, including on timeout.
struct InFlight<'a>(&'a FakeState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a FakeState) -> Self {
        let now = state.in_flight.get() + 1;
        state.in_flight.set(now);
        state.max_in_flight.set(state.max_in_flight.get().max(now));
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.set(self.0.in_flight.get() - 1);
    }
}

impl FakeState {
    pub fn set_mailbox(&self, user_id: &str, mailbox: Mailbox) {
        self.mailboxes
            .borrow_mut()
            .insert(user_id.to_string(), mailbox);
    }

    pub fn set_identity(&self, code: &str, email: &str) {
        self.identities
            .borrow_mut()
            .insert(code.to_string(), email.to_string());
    }

    pub fn calls_for(&self, user_id: &str) -> Vec<Option<DateTime<Utc>>> {
        self.list_calls
            .borrow()
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, since)| *since)
            .collect()
    }
}

pub struct FakeAdapter {
    pub provider: Provider,
    pub state: Rc<FakeState>,
}

impl FakeAdapter {
    pub fn new(provider: Provider) -> (Self, Rc<FakeState>) {
        let state = Rc::new(FakeState::default());
        (
            Self {
                provider,
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

pub fn bundle(access_token: &str) -> TokenBundle {
    TokenBundle {
        access_token: access_token.to_string(),
        refresh_token: Some(format!("refresh-{access_token}")),
        token_type: Some("Bearer".to_string()),
        expiry_date: Some(Utc::now() + Duration::hours(1)),
        scopes: vec!["mail.read".to_string()],
    }
}

#[async_trait(?Send)]
impl ProviderAdapter for FakeAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn authorization_url(&self, state: &str) -> Result<String, SyncError> {
        Ok(format!("https://auth.test/authorize?state={state}"))
    }

    async fn exchange_auth_code(&self, code: &str) -> Result<TokenBundle, SyncError> {
        if code == "bad-code" {
            return Err(SyncError::InvalidAuthCode {
                provider: self.provider,
                message: "invalid_grant".to_string(),
            });
        }
        Ok(bundle(&format!("access-{code}")))
    }

    async fn refresh_token(&self, tokens: &TokenBundle) -> Result<TokenBundle, SyncError> {
        self.state.refreshes.set(self.state.refreshes.get() + 1);
        Ok(bundle(&format!("{}-refreshed", tokens.access_token)))
    }

    async fn fetch_account_identity(
        &self,
        tokens: &TokenBundle,
    ) -> Result<AccountIdentity, SyncError> {
        let code = tokens.access_token.trim_start_matches("access-");
        match self.state.identities.borrow().get(code) {
            Some(email) => Ok(AccountIdentity {
                account_id: format!("acct-{code}"),
                email: email.clone(),
            }),
            None => Err(SyncError::IdentityFetch {
                provider: self.provider,
                message: "profile request failed: status=403".to_string(),
            }),
        }
    }

    async fn list_new_messages_with_attachments(
        &self,
        tokens: TokenBundle,
        request: &ListRequest,
    ) -> ListOutcome {
        let _in_flight = InFlight::enter(&self.state);
        self.state
            .list_calls
            .borrow_mut()
            .push((request.user_id.clone(), request.since));
        self.state
            .known_parts
            .borrow_mut()
            .insert(request.user_id.clone(), request.known_parts.clone());
        let mailbox = self
            .state
            .mailboxes
            .borrow()
            .get(&request.user_id)
            .cloned()
            .unwrap_or(Mailbox::Messages(Vec::new()));

        match mailbox {
            Mailbox::Messages(messages) => ListOutcome::succeeded(messages),
            Mailbox::Fails(message) => ListOutcome::failed(SyncError::Unexpected(anyhow!(message))),
            Mailbox::Revoked => ListOutcome::failed(SyncError::TokenRevoked {
                provider: self.provider,
                message: "invalid_grant: Token has been expired or revoked.".to_string(),
            }),
            Mailbox::Hangs => {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                ListOutcome::succeeded(Vec::new())
            }
            Mailbox::RefreshesThenFails => {
                let rotated = bundle(&format!("{}-rotated", tokens.access_token));
                ListOutcome::failed(SyncError::Unexpected(anyhow!("messages endpoint returned 500")))
                    .with_refreshed_tokens(rotated)
            }
            Mailbox::RefreshesThenHangs => {
                request
                    .rotated
                    .store(bundle(&format!("{}-rotated", tokens.access_token)));
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                ListOutcome::succeeded(Vec::new())
            }
            Mailbox::Skips { messages, skipped } => {
                let mut outcome = ListOutcome::succeeded(messages);
                for message in skipped {
                    outcome.skip(
                        &request.integration_id,
                        &message.id,
                        message.received_at,
                        &SyncError::Unexpected(anyhow!("attachment request failed: status=500")),
                    );
                }
                outcome
            }
            Mailbox::Slow(delay) => {
                tokio::time::sleep(delay).await;
                ListOutcome::succeeded(Vec::new())
            }
            Mailbox::RateLimited(messages) => ListOutcome {
                success: true,
                messages,
                complete: false,
                errors: vec![format!("{} rate limit exhausted after 6 attempts", self.provider)],
                ..ListOutcome::default()
            },
        }
    }
}

pub fn temp_db() -> (Database, PathBuf) {
    let path = std::env::temp_dir().join(format!("invoice-sync-it-{}.db", Uuid::new_v4()));
    let db = Database::open(&path).expect("open test database");
    (db, path)
}

/// A linked integration with a valid, non-expiring credential.
pub fn link(db: &Database, user_id: &str, provider: Provider, metadata: Value) -> Integration {
    let mut integration = Integration::new(user_id, provider);
    integration.status = IntegrationStatus::Success;
    integration.access_token = Some(format!("access-{user_id}"));
    integration.refresh_token = Some(format!("refresh-{user_id}"));
    integration.expiry_date = Some(Utc::now() + Duration::hours(1));
    integration.provider_email = Some(format!("{user_id}@example.com"));
    integration.metadata = metadata;
    db.upsert_integration(&integration)
        .expect("insert linked integration")
}

pub fn invoice_message(message_id: &str, file_names: &[&str]) -> ProviderMessage {
    ProviderMessage {
        id: message_id.to_string(),
        subject: Some(format!("Invoice {message_id}")),
        sender: Some("billing@vendor.test".to_string()),
        received_at: Some(Utc::now() - Duration::hours(1)),
        attachments: file_names
            .iter()
            .enumerate()
            .map(|(index, name)| CandidateAttachment {
                part_key: format!("{}", index + 1),
                file_name: name.to_string(),
                mime_type: "application/pdf".to_string(),
                content: format!("%PDF {message_id} {name}").into_bytes(),
            })
            .collect(),
    }
}

pub fn metadata_of(db: &Database, integration_id: &str) -> Value {
    db.get_integration(integration_id)
        .expect("load integration")
        .expect("integration exists")
        .metadata
}
