use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connectors::ProviderAdapter;
use crate::db::models::{Integration, IntegrationStatus};
use crate::db::{Database, DbError};
use crate::error::SyncError;

/// Tokens within this window of expiry are refreshed before use.
pub const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenBundle {
    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date
            .is_some_and(|expiry| expiry <= now + Duration::seconds(EXPIRY_SKEW_SECONDS))
    }

    /// Providers may omit the refresh token on refresh; keep the previous one then.
    pub fn rotated(self, previous: &TokenBundle) -> TokenBundle {
        TokenBundle {
            refresh_token: self
                .refresh_token
                .or_else(|| previous.refresh_token.clone()),
            scopes: if self.scopes.is_empty() {
                previous.scopes.clone()
            } else {
                self.scopes
            },
            ..self
        }
    }
}

/// Result of making sure a credential is usable for this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialLease {
    pub tokens: TokenBundle,
    pub refreshed: bool,
}

/// Loads the stored credential, failing before any network call when the
/// integration never finished OAuth or is not in a syncable state.
pub fn require_credential(integration: &Integration) -> Result<TokenBundle, SyncError> {
    let access_token = integration
        .access_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty());

    match (integration.status, access_token) {
        (IntegrationStatus::Success, Some(access_token)) => Ok(TokenBundle {
            access_token: access_token.to_string(),
            refresh_token: integration.refresh_token.clone(),
            token_type: integration.token_type.clone(),
            expiry_date: integration.expiry_date,
            scopes: integration.typed_metadata().scopes,
        }),
        (status, _) => Err(SyncError::MissingCredential {
            integration_id: integration.id.clone(),
            status: status.to_string(),
        }),
    }
}

/// Refreshes the credential if it is expired or about to expire.
pub async fn ensure_fresh<A>(adapter: &A, tokens: TokenBundle) -> Result<CredentialLease, SyncError>
where
    A: ProviderAdapter + ?Sized,
{
    if !tokens.is_expiring(Utc::now()) {
        return Ok(CredentialLease {
            tokens,
            refreshed: false,
        });
    }
    force_refresh(adapter, tokens).await
}

/// Refreshes unconditionally, e.g. after the provider answered 401.
pub async fn force_refresh<A>(adapter: &A, tokens: TokenBundle) -> Result<CredentialLease, SyncError>
where
    A: ProviderAdapter + ?Sized,
{
    let provider = adapter.provider();
    let fresh = adapter.refresh_token(&tokens).await?.rotated(&tokens);
    info!(%provider, expires = ?fresh.expiry_date, "access token refreshed");
    Ok(CredentialLease {
        tokens: fresh,
        refreshed: true,
    })
}

pub fn persist_rotated(
    db: &Database,
    integration_id: &str,
    tokens: &TokenBundle,
) -> Result<(), DbError> {
    db.update_integration_tokens(integration_id, tokens)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{require_credential, TokenBundle};
    use crate::db::models::{Integration, IntegrationStatus, Provider};
    use crate::error::SyncError;

    fn bundle(expires_in: Option<Duration>) -> TokenBundle {
        TokenBundle {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            token_type: Some("Bearer".to_string()),
            expiry_date: expires_in.map(|d| Utc::now() + d),
            scopes: vec!["gmail.readonly".to_string()],
        }
    }

    #[test]
    fn expiry_window_includes_skew() {
        let now = Utc::now();
        assert!(bundle(Some(Duration::seconds(30))).is_expiring(now));
        assert!(bundle(Some(Duration::seconds(-5))).is_expiring(now));
        assert!(!bundle(Some(Duration::minutes(10))).is_expiring(now));
        assert!(!bundle(None).is_expiring(now));
    }

    #[test]
    fn rotation_keeps_previous_refresh_token_when_omitted() {
        let previous = bundle(None);
        let fresh = TokenBundle {
            access_token: "new-access".to_string(),
            refresh_token: None,
            token_type: None,
            expiry_date: None,
            scopes: vec![],
        }
        .rotated(&previous);
        assert_eq!(fresh.access_token, "new-access");
        assert_eq!(fresh.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(fresh.scopes, previous.scopes);
    }

    #[test]
    fn missing_access_token_fails_fast() {
        let mut integration = Integration::new("user-1", Provider::Gmail);
        integration.status = IntegrationStatus::Success;
        let error = require_credential(&integration).expect_err("no token");
        assert!(matches!(error, SyncError::MissingCredential { .. }));
    }

    #[test]
    fn non_success_status_fails_fast_even_with_token() {
        let mut integration = Integration::new("user-1", Provider::Outlook);
        integration.access_token = Some("access".to_string());
        integration.status = IntegrationStatus::Paused;
        let error = require_credential(&integration).expect_err("paused");
        assert!(error.to_string().contains("paused"));
    }

    #[test]
    fn success_status_yields_bundle_with_scopes() {
        let mut integration = Integration::new("user-1", Provider::Gmail);
        integration.status = IntegrationStatus::Success;
        integration.access_token = Some("access".to_string());
        integration.metadata = json!({ "scopes": ["a", "b"] });
        let tokens = require_credential(&integration).expect("credential");
        assert_eq!(tokens.access_token, "access");
        assert_eq!(tokens.scopes, vec!["a".to_string(), "b".to_string()]);
    }
}
