use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ProviderSettings;
use crate::connectors::http::ApiClient;
use crate::connectors::{
    aborts_listing, is_invoice_bearing, AccountIdentity, CandidateAttachment, ListOutcome,
    ListRequest, ProviderAdapter, ProviderMessage, TokenSession,
};
use crate::db::models::Provider;
use crate::error::SyncError;
use crate::tokens::TokenBundle;

const PAGE_SIZE: usize = 100;
const GMAIL_SCOPES: &[&str] = &[
    "openid",
    "email",
    "https://www.googleapis.com/auth/gmail.readonly",
];

pub struct GmailAdapter {
    settings: ProviderSettings,
    api: ApiClient,
}

impl GmailAdapter {
    pub fn new(settings: ProviderSettings, max_rate_limit_retries: usize) -> Self {
        Self {
            settings,
            api: ApiClient::new(Provider::Gmail, max_rate_limit_retries),
        }
    }

    fn messages_url(
        &self,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> anyhow::Result<Url> {
        let base = format!("{}/users/me/messages", self.settings.api_base);
        let query = search_query(since);
        let page_size = PAGE_SIZE.to_string();
        let mut params = vec![("q", query.as_str()), ("maxResults", page_size.as_str())];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        Url::parse_with_params(&base, &params)
            .with_context(|| format!("build gmail list url from {base}"))
    }

    async fn collect(
        &self,
        session: &mut TokenSession<'_>,
        request: &ListRequest,
        outcome: &mut ListOutcome,
    ) -> Result<(), SyncError> {
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let url = self.messages_url(request.since, page_token.as_deref())?;
            let page: GmailMessageList = self
                .api
                .get_json(session, url.as_str(), "message list")
                .await?;
            pages += 1;

            for stub in page.messages.unwrap_or_default() {
                let message = match self.fetch_message(session, &stub.id).await {
                    Ok(message) => message,
                    Err(error) if aborts_listing(&error) => return Err(error),
                    Err(error) => {
                        outcome.skip(&request.integration_id, &stub.id, None, &error);
                        continue;
                    }
                };
                match self.download_attachments(session, request, &message).await {
                    Ok(Some(message)) => outcome.messages.push(message),
                    Ok(None) => {}
                    Err(error) if aborts_listing(&error) => return Err(error),
                    Err(error) => outcome.skip(
                        &request.integration_id,
                        &message.id,
                        internal_date(&message),
                        &error,
                    ),
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        debug!(
            integration_id = %request.integration_id,
            pages,
            messages = outcome.messages.len(),
            "gmail listing finished"
        );
        Ok(())
    }

    async fn fetch_message(
        &self,
        session: &mut TokenSession<'_>,
        message_id: &str,
    ) -> Result<GmailMessage, SyncError> {
        let url = format!(
            "{}/users/me/messages/{message_id}?format=full",
            self.settings.api_base
        );
        self.api.get_json(session, &url, "message").await
    }

    /// Bytes of every invoice-bearing part not ingested yet; `None` when
    /// nothing is left to download.
    async fn download_attachments(
        &self,
        session: &mut TokenSession<'_>,
        request: &ListRequest,
        message: &GmailMessage,
    ) -> Result<Option<ProviderMessage>, SyncError> {
        let message_id = message.id.as_str();
        let mut parts = Vec::new();
        collect_attachment_parts(&message.payload, &mut parts);
        parts.retain(|part| !request.is_known(message_id, &part.part_key));

        let mut attachments = Vec::new();
        for part in parts {
            let content = match (&part.inline_data, &part.attachment_id) {
                (Some(data), _) => decode_base64url(data)?,
                (None, Some(attachment_id)) => {
                    let url = format!(
                        "{}/users/me/messages/{message_id}/attachments/{attachment_id}",
                        self.settings.api_base
                    );
                    let body: GmailAttachmentBody =
                        self.api.get_json(session, &url, "attachment").await?;
                    decode_base64url(body.data.as_deref().unwrap_or_default())?
                }
                (None, None) => continue,
            };
            attachments.push(CandidateAttachment {
                part_key: part.part_key,
                file_name: part.file_name,
                mime_type: part.mime_type,
                content,
            });
        }

        if attachments.is_empty() {
            return Ok(None);
        }

        Ok(Some(ProviderMessage {
            id: message.id.clone(),
            subject: extract_header(&message.payload, "Subject"),
            sender: extract_header(&message.payload, "From"),
            received_at: internal_date(message),
            attachments,
        }))
    }
}

#[async_trait(?Send)]
impl ProviderAdapter for GmailAdapter {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    fn authorization_url(&self, state: &str) -> Result<String, SyncError> {
        let scope = GMAIL_SCOPES.join(" ");
        let url = Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("client_id", self.settings.client_id()?),
                ("redirect_uri", self.settings.redirect_uri()?),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("include_granted_scopes", "true"),
                ("state", state),
            ],
        )
        .context("build gmail authorization url")?;
        Ok(url.into())
    }

    async fn exchange_auth_code(&self, code: &str) -> Result<TokenBundle, SyncError> {
        let issued_at = Utc::now();
        let response = self
            .api
            .request_token(
                &self.settings.token_url,
                &[
                    ("code", code),
                    ("client_id", self.settings.client_id()?),
                    ("client_secret", self.settings.client_secret()?),
                    ("redirect_uri", self.settings.redirect_uri()?),
                    ("grant_type", "authorization_code"),
                ],
            )
            .await
            .map_err(|error| error.into_exchange_error(Provider::Gmail))?;
        Ok(response.into_bundle(issued_at))
    }

    async fn refresh_token(&self, tokens: &TokenBundle) -> Result<TokenBundle, SyncError> {
        let Some(refresh_token) = tokens.refresh_token.as_deref() else {
            return Err(SyncError::TokenRevoked {
                provider: Provider::Gmail,
                message: "no refresh token stored".to_string(),
            });
        };

        let issued_at = Utc::now();
        let response = self
            .api
            .request_token(
                &self.settings.token_url,
                &[
                    ("client_id", self.settings.client_id()?),
                    ("client_secret", self.settings.client_secret()?),
                    ("refresh_token", refresh_token),
                    ("grant_type", "refresh_token"),
                ],
            )
            .await
            .map_err(|error| error.into_refresh_error(Provider::Gmail))?;
        Ok(response.into_bundle(issued_at))
    }

    async fn fetch_account_identity(
        &self,
        tokens: &TokenBundle,
    ) -> Result<AccountIdentity, SyncError> {
        let mut session = TokenSession::new(self, tokens.clone());
        let info: GoogleUserInfo = self
            .api
            .get_json(&mut session, &self.settings.identity_url, "userinfo")
            .await
            .map_err(|error| SyncError::IdentityFetch {
                provider: Provider::Gmail,
                message: error.to_string(),
            })?;

        match info.email.map(|email| email.trim().to_string()) {
            Some(email) if !email.is_empty() => Ok(AccountIdentity {
                account_id: info.sub,
                email,
            }),
            _ => Err(SyncError::IdentityFetch {
                provider: Provider::Gmail,
                message: "userinfo response has no email (missing email scope?)".to_string(),
            }),
        }
    }

    async fn list_new_messages_with_attachments(
        &self,
        tokens: TokenBundle,
        request: &ListRequest,
    ) -> ListOutcome {
        info!(
            integration_id = %request.integration_id,
            user_id = %request.user_id,
            since = ?request.since,
            "listing gmail messages with attachments"
        );
        let mut session = TokenSession::new(self, tokens).recording_into(&request.rotated);
        let mut outcome = ListOutcome::default();
        let result = self.collect(&mut session, request, &mut outcome).await;
        outcome.finish(session, result)
    }
}

/// `has:attachment`, bounded below by the cursor when there is one.
fn search_query(since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(since) => format!("has:attachment after:{}", since.timestamp()),
        None => "has:attachment".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttachmentPart {
    part_key: String,
    file_name: String,
    mime_type: String,
    attachment_id: Option<String>,
    inline_data: Option<String>,
}

/// Walks the MIME tree collecting invoice-bearing file parts. The part id is
/// the stable key; attachment ids change between requests.
fn collect_attachment_parts(payload: &GmailPayload, out: &mut Vec<AttachmentPart>) {
    let file_name = payload
        .filename
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    let mime_type = payload.mime_type.as_deref().unwrap_or_default();

    if !file_name.is_empty() && is_invoice_bearing(mime_type, file_name) {
        let body = payload.body.as_ref();
        out.push(AttachmentPart {
            part_key: payload
                .part_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| file_name.to_string()),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_ascii_lowercase(),
            attachment_id: body.and_then(|b| b.attachment_id.clone()),
            inline_data: body
                .and_then(|b| b.data.clone())
                .filter(|data| !data.is_empty()),
        });
    }

    for part in payload.parts.as_deref().unwrap_or_default() {
        collect_attachment_parts(part, out);
    }
}

fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn internal_date(message: &GmailMessage) -> Option<DateTime<Utc>> {
    message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn decode_base64url(data: &str) -> anyhow::Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data.trim().trim_end_matches('='))
        .context("base64url decode gmail attachment data")
}

#[derive(Debug, Clone, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessage {
    id: String,
    payload: GmailPayload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    #[serde(rename = "partId")]
    part_id: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    filename: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailBody {
    data: Option<String>,
    #[serde(rename = "attachmentId")]
    attachment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailAttachmentBody {
    data: Option<String>,
}
