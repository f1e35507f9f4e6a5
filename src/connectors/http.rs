//! HTTP plumbing shared by the provider adapters: bearer requests with
//! rate-limit backoff and the OAuth token endpoint.

use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::connectors::TokenSession;
use crate::db::models::Provider;
use crate::error::SyncError;
use crate::tokens::TokenBundle;

const REDACTED_BODY_MAX_LEN: usize = 200;
const MAX_BACKOFF_SECONDS: u64 = 32;

pub fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(REDACTED_BODY_MAX_LEN) {
        None => trimmed.to_string(),
        Some((cut, _)) => format!(
            "{}…[truncated {} bytes]",
            &trimmed[..cut],
            trimmed.len()
        ),
    }
}

/// Seconds from a numeric `Retry-After` header; HTTP-date values are ignored.
fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

impl OAuthTokenResponse {
    pub fn into_bundle(self, issued_at: DateTime<Utc>) -> TokenBundle {
        TokenBundle {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|token| !token.trim().is_empty()),
            token_type: self.token_type,
            expiry_date: self
                .expires_in
                .map(|seconds| issued_at + Duration::seconds(seconds.max(0))),
            scopes: self
                .scope
                .map(|scope| scope.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug)]
pub enum TokenRequestError {
    /// The authorization server answered with an OAuth error (`invalid_grant`, ...).
    Rejected { code: String, description: String },
    Transport(anyhow::Error),
}

impl TokenRequestError {
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if code == "invalid_grant")
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Rejected { code, description } if description.is_empty() => code.clone(),
            Self::Rejected { code, description } => format!("{code}: {description}"),
            Self::Transport(error) => format!("{error:#}"),
        }
    }

    /// Authorization-code exchange: an OAuth rejection means the code was bad.
    pub fn into_exchange_error(self, provider: Provider) -> SyncError {
        match self {
            Self::Rejected { .. } => SyncError::InvalidAuthCode {
                provider,
                message: self.describe(),
            },
            Self::Transport(error) => {
                SyncError::Unexpected(error.context(format!("exchange {provider} auth code")))
            }
        }
    }

    /// Refresh: `invalid_grant` means the grant is gone and the integration
    /// should be paused until the user links again.
    pub fn into_refresh_error(self, provider: Provider) -> SyncError {
        if self.is_invalid_grant() {
            return SyncError::TokenRevoked {
                provider,
                message: self.describe(),
            };
        }
        match self {
            Self::Transport(error) => {
                SyncError::Unexpected(error.context(format!("refresh {provider} token")))
            }
            rejected => SyncError::Unexpected(anyhow!(
                "refresh {provider} token: {}",
                rejected.describe()
            )),
        }
    }
}

fn classify_token_failure(status: StatusCode, body: &str) -> TokenRequestError {
    let parsed = serde_json::from_str::<OAuthErrorResponse>(body).ok();
    match parsed.and_then(|p| p.error.map(|code| (code, p.error_description))) {
        Some((code, description)) if status.is_client_error() => TokenRequestError::Rejected {
            code,
            description: description.unwrap_or_default(),
        },
        _ => TokenRequestError::Transport(anyhow!(
            "oauth token request failed: status={} body={}",
            status,
            redact_response_body(body)
        )),
    }
}

/// Bearer-authenticated GETs against one provider's API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    provider: Provider,
    max_rate_limit_retries: usize,
}

impl ApiClient {
    pub fn new(provider: Provider, max_rate_limit_retries: usize) -> Self {
        Self {
            client: Client::new(),
            provider,
            max_rate_limit_retries,
        }
    }

    /// Form POST to an OAuth token endpoint.
    pub async fn request_token(
        &self,
        token_url: &str,
        form: &[(&str, &str)],
    ) -> Result<OAuthTokenResponse, TokenRequestError> {
        let provider = self.provider;
        let response = self
            .client
            .post(token_url)
            .header("accept", "application/json")
            .form(form)
            .send()
            .await
            .with_context(|| format!("request {provider} oauth token from {token_url}"))
            .map_err(TokenRequestError::Transport)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("read {provider} token response"))
            .map_err(TokenRequestError::Transport)?;
        if !status.is_success() {
            return Err(classify_token_failure(status, &body));
        }

        serde_json::from_str(&body)
            .with_context(|| format!("decode {provider} token JSON response"))
            .map_err(TokenRequestError::Transport)
    }

    /// GET with the session's bearer token. A 429 is retried honouring
    /// `Retry-After` (exponential 1..32 s otherwise); a 401 triggers one
    /// forced refresh.
    pub async fn get_text(
        &self,
        session: &mut TokenSession<'_>,
        url: &str,
    ) -> Result<String, SyncError> {
        let provider = self.provider;
        let mut backoff_seconds = 1u64;
        let mut rate_limited = 0usize;
        let mut reauthorized = false;

        loop {
            let token = session.bearer().await?;
            let response = self
                .client
                .get(url)
                .bearer_auth(&token)
                .header("accept", "application/json")
                .send()
                .await
                .with_context(|| format!("{provider} api request: {url}"))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if rate_limited == self.max_rate_limit_retries {
                    warn!(%provider, url, "rate limit retries exhausted");
                    return Err(SyncError::ProviderRateLimit {
                        provider,
                        attempts: rate_limited + 1,
                    });
                }

                let wait = retry_after_seconds(response.headers()).unwrap_or(backoff_seconds);
                debug!(%provider, wait, attempt = rate_limited + 1, "rate limited, backing off");
                sleep(StdDuration::from_secs(wait)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                rate_limited += 1;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED && !reauthorized {
                debug!(%provider, url, "access token rejected, forcing refresh");
                session.force_refresh().await?;
                reauthorized = true;
                continue;
            }

            let body = response
                .text()
                .await
                .with_context(|| format!("read {provider} api response body"))?;
            if !status.is_success() {
                return Err(SyncError::Unexpected(anyhow!(
                    "{provider} api request failed: status={} body={}",
                    status,
                    redact_response_body(&body)
                )));
            }

            return Ok(body);
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        session: &mut TokenSession<'_>,
        url: &str,
        what: &str,
    ) -> Result<T, SyncError> {
        let body = self.get_text(session, url).await?;
        let decoded = serde_json::from_str(&body)
            .with_context(|| format!("decode {} {what}", self.provider))?;
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::StatusCode;

    use super::{
        classify_token_failure, redact_response_body, retry_after_seconds, OAuthTokenResponse,
        TokenRequestError,
    };
    use crate::db::models::Provider;
    use crate::error::SyncError;

    #[test]
    fn token_response_maps_to_bundle() {
        let payload = r#"{"access_token":"ya29.abc","token_type":"Bearer","expires_in":3600,"refresh_token":"1//r","scope":"openid https://www.googleapis.com/auth/gmail.readonly"}"#;
        let decoded: OAuthTokenResponse =
            serde_json::from_str(payload).expect("decode oauth token response");
        let issued = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("time");
        let bundle = decoded.into_bundle(issued);

        assert_eq!(bundle.access_token, "ya29.abc");
        assert_eq!(bundle.refresh_token.as_deref(), Some("1//r"));
        assert_eq!(
            bundle.expiry_date,
            Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).single()
        );
        assert_eq!(bundle.scopes.len(), 2);
    }

    #[test]
    fn refresh_response_without_refresh_token_is_accepted() {
        let decoded: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"new","expires_in":60}"#).expect("decode");
        let bundle = decoded.into_bundle(Utc::now());
        assert!(bundle.refresh_token.is_none());
        assert!(bundle.scopes.is_empty());
    }

    #[test]
    fn invalid_grant_is_recognised() {
        let failure = classify_token_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        );
        assert!(failure.is_invalid_grant());
        assert_eq!(
            failure.describe(),
            "invalid_grant: Token has been expired or revoked."
        );
    }

    #[test]
    fn token_failures_map_to_typed_errors() {
        let revoked = classify_token_failure(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#)
            .into_refresh_error(Provider::Outlook);
        assert!(revoked.is_paused_signal());

        let other = classify_token_failure(StatusCode::UNAUTHORIZED, r#"{"error":"invalid_client"}"#)
            .into_refresh_error(Provider::Gmail);
        assert!(matches!(other, SyncError::Unexpected(_)));

        let bad_code = classify_token_failure(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#)
            .into_exchange_error(Provider::Gmail);
        assert!(matches!(bad_code, SyncError::InvalidAuthCode { .. }));
    }

    #[test]
    fn server_errors_are_transport_failures() {
        let failure = classify_token_failure(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(matches!(failure, TokenRequestError::Transport(_)));
        assert!(!failure.is_invalid_grant());
    }

    #[test]
    fn retry_after_reads_numeric_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_seconds(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after_seconds(&headers), Some(7));
        headers.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after_seconds(&headers), None);
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(300);
        let redacted = redact_response_body(&body);
        assert!(redacted.contains("[truncated 600 bytes]"));
        assert_eq!(redact_response_body("  short  "), "short");
    }
}
