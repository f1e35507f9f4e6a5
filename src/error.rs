use std::time::Duration;

use thiserror::Error;

use crate::db::models::Provider;
use crate::db::DbError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("integration {integration_id} has no usable credential (status: {status})")]
    MissingCredential {
        integration_id: String,
        status: String,
    },

    #[error("{provider} rejected the authorization code: {message}")]
    InvalidAuthCode { provider: Provider, message: String },

    #[error("failed to fetch {provider} account identity: {message}")]
    IdentityFetch { provider: Provider, message: String },

    #[error("mailbox {email} is already linked to another user")]
    DuplicateMailbox { email: String },

    #[error("{provider} rate limit exhausted after {attempts} attempts")]
    ProviderRateLimit { provider: Provider, attempts: usize },

    #[error("{provider} refresh token was revoked or expired: {message}")]
    TokenRevoked { provider: Provider, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{resource} does not belong to user {user_id}")]
    Forbidden { resource: String, user_id: String },

    #[error("integration pass timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl SyncError {
    /// Text recorded in `SyncResult.errors`. Unexpected errors carry their
    /// full context chain outside production.
    pub fn diagnostic(&self, production: bool) -> String {
        match self {
            Self::Unexpected(error) if !production => format!("{error:?}"),
            other => other.to_string(),
        }
    }

    pub fn is_paused_signal(&self) -> bool {
        matches!(self, Self::TokenRevoked { .. })
    }
}
