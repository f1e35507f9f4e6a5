//! Account linking: authorization URL, callback handling and the redirect
//! back to the frontend.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::connectors::ProviderAdapter;
use crate::db::models::{merge_patch, Integration, IntegrationStatus, Provider};
use crate::db::Database;
use crate::error::SyncError;
use crate::watermark;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OAuthState {
    #[serde(rename = "userId")]
    user_id: String,
}

/// `{"userId": ...}` as unpadded base64url, safe to embed in a query string.
pub fn encode_state(user_id: &str) -> Result<String, SyncError> {
    let state = serde_json::to_vec(&OAuthState {
        user_id: user_id.to_string(),
    })
    .map_err(anyhow::Error::from)?;
    Ok(URL_SAFE_NO_PAD.encode(state))
}

/// Accepts base64url or standard base64, padded or not.
pub fn decode_state(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .ok()
        .or_else(|| STANDARD.decode(raw.trim()).ok())?;
    let state: OAuthState = serde_json::from_slice(&bytes).ok()?;
    let user_id = state.user_id.trim();
    (!user_id.is_empty()).then(|| user_id.to_string())
}

pub fn authorization_url(
    adapter: &dyn ProviderAdapter,
    user_id: &str,
) -> Result<String, SyncError> {
    if user_id.trim().is_empty() {
        return Err(SyncError::Unexpected(anyhow::anyhow!(
            "a user id is required to link an account"
        )));
    }
    adapter.authorization_url(&encode_state(user_id.trim())?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectKind {
    Success,
    Error,
}

impl RedirectKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRedirect {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: RedirectKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration: Option<Integration>,
}

/// Query parameters the provider sends back to the redirect URI.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user declined consent.
    pub error: Option<String>,
}

pub struct CallbackHandler<'a> {
    db: &'a Database,
    adapter: &'a dyn ProviderAdapter,
    frontend_url: &'a str,
    backfill_days: i64,
}

impl<'a> CallbackHandler<'a> {
    pub fn new(
        db: &'a Database,
        adapter: &'a dyn ProviderAdapter,
        frontend_url: &'a str,
        backfill_days: i64,
    ) -> Self {
        Self {
            db,
            adapter,
            frontend_url,
            backfill_days,
        }
    }

    /// Always produces a redirect; only an unusable frontend URL is an error.
    pub async fn handle(&self, params: &CallbackParams) -> Result<CallbackRedirect, SyncError> {
        let provider = self.adapter.provider();
        let name = provider.display_name();

        if let Some(error) = params.error.as_deref().filter(|e| !e.trim().is_empty()) {
            warn!(%provider, error, "provider returned an authorization error");
            return self.redirect(
                RedirectKind::Error,
                format!("{name} authorization was cancelled or denied."),
                None,
            );
        }

        let Some(user_id) = params.state.as_deref().and_then(decode_state) else {
            return self.redirect(
                RedirectKind::Error,
                "Invalid authorization state. Please start the connection again.".to_string(),
                None,
            );
        };

        let Some(code) = params.code.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
            return self.redirect(
                RedirectKind::Error,
                format!("No authorization code was received from {name}. Please try again."),
                None,
            );
        };

        match self.link(&user_id, code).await {
            Ok(integration) => {
                info!(
                    %provider,
                    user_id = %integration.user_id,
                    integration_id = %integration.id,
                    "mailbox linked"
                );
                self.redirect(
                    RedirectKind::Success,
                    format!("{name} account connected successfully."),
                    Some(integration),
                )
            }
            Err(error) => {
                warn!(%provider, %user_id, "linking failed: {error}");
                self.redirect(RedirectKind::Error, failure_message(provider, &error), None)
            }
        }
    }

    async fn link(&self, user_id: &str, code: &str) -> Result<Integration, SyncError> {
        let provider = self.adapter.provider();
        let tokens = self.adapter.exchange_auth_code(code).await?;
        let identity = self.adapter.fetch_account_identity(&tokens).await?;

        // A mailbox belongs to one integration row, across users and providers.
        if let Some(owner) = self.db.find_integration_by_email(&identity.email)? {
            if owner.user_id != user_id || owner.provider != provider {
                return Err(SyncError::DuplicateMailbox {
                    email: identity.email,
                });
            }
        }

        let mut integration = self
            .db
            .get_integration_for_user(user_id, provider)?
            .unwrap_or_else(|| Integration::new(user_id, provider));

        let backfill_start = || {
            let start = Utc::now() - Duration::days(self.backfill_days.max(0));
            Value::String(watermark::format_timestamp(start))
        };
        let mut patch = json!({});
        if !tokens.scopes.is_empty() {
            patch["scopes"] = json!(tokens.scopes);
        }
        let mailbox_changed = integration
            .provider_email
            .as_deref()
            .is_some_and(|previous| !previous.trim().eq_ignore_ascii_case(identity.email.trim()));
        if mailbox_changed {
            info!(
                %provider,
                %user_id,
                integration_id = %integration.id,
                "integration relinked to a different mailbox; cursor restarts"
            );
            for field in ["lastReadAt", "lastRead", "lastProcessedAt", "heldBackPasses"] {
                patch[field] = Value::Null;
            }
            patch["startReading"] = backfill_start();
        } else if integration.typed_metadata().start_reading.is_none() {
            patch["startReading"] = backfill_start();
        }
        merge_patch(&mut integration.metadata, &patch);

        integration.status = IntegrationStatus::Success;
        integration.access_token = Some(tokens.access_token);
        integration.refresh_token = tokens.refresh_token;
        integration.token_type = tokens.token_type;
        integration.expiry_date = tokens.expiry_date;
        integration.provider_account_id = Some(identity.account_id);
        integration.provider_email = Some(identity.email);

        Ok(self.db.upsert_integration(&integration)?)
    }

    fn redirect(
        &self,
        kind: RedirectKind,
        message: String,
        integration: Option<Integration>,
    ) -> Result<CallbackRedirect, SyncError> {
        Ok(CallbackRedirect {
            url: redirect_url(self.frontend_url, kind, &message)?,
            kind,
            message,
            integration,
        })
    }
}

fn failure_message(provider: Provider, error: &SyncError) -> String {
    let name = provider.display_name();
    match error {
        SyncError::InvalidAuthCode { .. } => {
            format!("{name} rejected the authorization code. Please connect again.")
        }
        SyncError::IdentityFetch { .. } => {
            format!("Could not read your {name} account details. Please try again.")
        }
        SyncError::DuplicateMailbox { email } => {
            format!("The mailbox {email} is already connected to another integration.")
        }
        _ => format!("Failed to connect your {name} account. Please try again later."),
    }
}

pub fn redirect_url(
    frontend_url: &str,
    kind: RedirectKind,
    message: &str,
) -> Result<String, SyncError> {
    let mut url = Url::parse(frontend_url)
        .map_err(|error| anyhow::anyhow!("invalid frontend url '{frontend_url}': {error}"))?;
    url.query_pairs_mut()
        .append_pair("message", message)
        .append_pair("type", kind.as_str());
    Ok(url.into())
}
