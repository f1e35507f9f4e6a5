use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::crypto::TokenCipher;
use crate::db::models::Provider;
use crate::db::Database;

const ENV_PREFIX: &str = "INVOICE_SYNC_";

const DEFAULT_FRONTEND_URL: &str = "http://localhost:3000/integrations";
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_PASS_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RATE_LIMIT_RETRIES: usize = 5;
const DEFAULT_BACKFILL_DAYS: i64 = 30;
const DEFAULT_HANDOFF_ATTEMPTS: usize = 3;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

const MICROSOFT_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// OAuth client registration and endpoints for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub identity_url: String,
    pub api_base: String,
}

impl ProviderSettings {
    fn defaults(provider: Provider) -> Self {
        match provider {
            Provider::Gmail => Self {
                provider,
                client_id: None,
                client_secret: None,
                redirect_uri: None,
                auth_url: GOOGLE_AUTH_URL.to_string(),
                token_url: GOOGLE_TOKEN_URL.to_string(),
                identity_url: GOOGLE_USERINFO_URL.to_string(),
                api_base: GMAIL_API_BASE.to_string(),
            },
            Provider::Outlook => Self {
                provider,
                client_id: None,
                client_secret: None,
                redirect_uri: None,
                auth_url: MICROSOFT_AUTH_URL.to_string(),
                token_url: MICROSOFT_TOKEN_URL.to_string(),
                identity_url: format!("{GRAPH_API_BASE}/me"),
                api_base: GRAPH_API_BASE.to_string(),
            },
        }
    }

    fn from_lookup(provider: Provider, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::defaults(provider);
        let key = |suffix: &str| format!("{}_{suffix}", provider.to_string().to_ascii_uppercase());
        let api_base = lookup(&key("API_BASE")).unwrap_or(defaults.api_base);
        let identity_url = lookup(&key("IDENTITY_URL")).unwrap_or_else(|| match provider {
            Provider::Gmail => defaults.identity_url,
            Provider::Outlook => format!("{api_base}/me"),
        });

        Self {
            provider,
            client_id: lookup(&key("CLIENT_ID")),
            client_secret: lookup(&key("CLIENT_SECRET")),
            redirect_uri: lookup(&key("REDIRECT_URI")),
            auth_url: lookup(&key("AUTH_URL")).unwrap_or(defaults.auth_url),
            token_url: lookup(&key("TOKEN_URL")).unwrap_or(defaults.token_url),
            identity_url,
            api_base,
        }
    }

    pub fn client_id(&self) -> Result<&str> {
        self.client_id.as_deref().ok_or_else(|| {
            anyhow!(
                "missing {} client id ({})",
                self.provider,
                env_name(self.provider, "CLIENT_ID")
            )
        })
    }

    pub fn client_secret(&self) -> Result<&str> {
        self.client_secret.as_deref().ok_or_else(|| {
            anyhow!(
                "missing {} client secret ({})",
                self.provider,
                env_name(self.provider, "CLIENT_SECRET")
            )
        })
    }

    pub fn redirect_uri(&self) -> Result<&str> {
        self.redirect_uri.as_deref().ok_or_else(|| {
            anyhow!(
                "missing {} redirect uri ({})",
                self.provider,
                env_name(self.provider, "REDIRECT_URI")
            )
        })
    }
}

fn env_name(provider: Provider, suffix: &str) -> String {
    format!(
        "{ENV_PREFIX}{}_{suffix}",
        provider.to_string().to_ascii_uppercase()
    )
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub blob_dir: PathBuf,
    pub frontend_url: String,
    pub production: bool,
    pub gmail: ProviderSettings,
    pub outlook: ProviderSettings,
    pub concurrency: usize,
    pub pass_timeout: Duration,
    pub max_rate_limit_retries: usize,
    pub default_backfill_days: i64,
    pub handoff_webhook_url: Option<String>,
    pub handoff_max_attempts: usize,
    pub token_key: Option<String>,
}

impl Settings {
    /// Reads `INVOICE_SYNC_*` variables. Empty values count as unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| {
            std::env::var(format!("{ENV_PREFIX}{key}"))
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }

    /// Builds settings from a lookup of un-prefixed keys (`DB_PATH`, `GMAIL_CLIENT_ID`, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = match lookup("DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => Database::default_db_path().context("resolve default database path")?,
        };
        let blob_dir = match lookup("BLOB_DIR") {
            Some(path) => PathBuf::from(path),
            None => db_path
                .parent()
                .map(|parent| parent.join("blobs"))
                .unwrap_or_else(|| PathBuf::from("blobs")),
        };

        let concurrency: usize = parse_or(&lookup, "CONCURRENCY", DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(anyhow!("{ENV_PREFIX}CONCURRENCY must be at least 1"));
        }

        Ok(Self {
            db_path,
            blob_dir,
            frontend_url: lookup("FRONTEND_URL").unwrap_or_else(|| DEFAULT_FRONTEND_URL.to_string()),
            production: parse_bool(lookup("ENV").or_else(|| lookup("PRODUCTION")).as_deref()),
            gmail: ProviderSettings::from_lookup(Provider::Gmail, &lookup),
            outlook: ProviderSettings::from_lookup(Provider::Outlook, &lookup),
            concurrency,
            pass_timeout: Duration::from_secs(parse_or(
                &lookup,
                "PASS_TIMEOUT_SECS",
                DEFAULT_PASS_TIMEOUT_SECS,
            )?),
            max_rate_limit_retries: parse_or(
                &lookup,
                "RATE_LIMIT_RETRIES",
                DEFAULT_RATE_LIMIT_RETRIES,
            )?,
            default_backfill_days: parse_or(&lookup, "BACKFILL_DAYS", DEFAULT_BACKFILL_DAYS)?,
            handoff_webhook_url: lookup("HANDOFF_WEBHOOK_URL"),
            handoff_max_attempts: parse_or(&lookup, "HANDOFF_ATTEMPTS", DEFAULT_HANDOFF_ATTEMPTS)?,
            token_key: lookup("TOKEN_KEY"),
        })
    }

    pub fn provider(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Gmail => &self.gmail,
            Provider::Outlook => &self.outlook,
        }
    }

    pub fn token_cipher(&self) -> Result<Option<TokenCipher>> {
        self.token_key
            .as_deref()
            .map(TokenCipher::from_hex)
            .transpose()
            .with_context(|| format!("{ENV_PREFIX}TOKEN_KEY must be 64 hex characters (32 bytes)"))
    }

    pub fn open_database(&self) -> Result<Database> {
        let db = Database::open(&self.db_path)
            .with_context(|| format!("open database at {}", self.db_path.display()))?;
        Ok(db.with_token_cipher(self.token_cipher()?))
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {ENV_PREFIX}{key} '{raw}': {e}")),
    }
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "production" | "prod")
    )
}
