use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
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

const PAGE_SIZE: usize = 50;
const GRAPH_SCOPES: &str = "offline_access Mail.Read User.Read";
const FILE_ATTACHMENT_TYPE: &str = "#microsoft.graph.fileAttachment";

pub struct OutlookAdapter {
    settings: ProviderSettings,
    api: ApiClient,
}

impl OutlookAdapter {
    pub fn new(settings: ProviderSettings, max_rate_limit_retries: usize) -> Self {
        Self {
            settings,
            api: ApiClient::new(Provider::Outlook, max_rate_limit_retries),
        }
    }

    fn first_page_url(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Url> {
        let base = format!("{}/me/messages", self.settings.api_base);
        let filter = message_filter(since);
        let page_size = PAGE_SIZE.to_string();
        Url::parse_with_params(
            &base,
            &[
                ("$filter", filter.as_str()),
                ("$select", "id,subject,from,receivedDateTime,hasAttachments"),
                ("$top", page_size.as_str()),
            ],
        )
        .with_context(|| format!("build graph list url from {base}"))
    }

    async fn collect(
        &self,
        session: &mut TokenSession<'_>,
        request: &ListRequest,
        outcome: &mut ListOutcome,
    ) -> Result<(), SyncError> {
        let mut next_url = Some(self.first_page_url(request.since)?.to_string());
        let mut pages = 0usize;

        while let Some(url) = next_url.take() {
            let page: GraphMessagesPage = self
                .api
                .get_json(session, &url, "messages page")
                .await?;
            pages += 1;

            for message in page.value {
                let Some(message_id) = message.id.clone() else {
                    continue;
                };
                let received_at = message
                    .received_date_time
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|value| value.with_timezone(&Utc));
                match self.fetch_attachments(session, request, &message_id).await {
                    Ok(attachments) if attachments.is_empty() => {}
                    Ok(attachments) => outcome.messages.push(ProviderMessage {
                        id: message_id,
                        subject: message.subject.clone(),
                        sender: message.from.as_ref().and_then(GraphRecipient::display),
                        received_at,
                        attachments,
                    }),
                    Err(error) if aborts_listing(&error) => return Err(error),
                    Err(error) => {
                        outcome.skip(&request.integration_id, &message_id, received_at, &error)
                    }
                }
            }

            next_url = page.next_link;
        }

        debug!(
            integration_id = %request.integration_id,
            pages,
            messages = outcome.messages.len(),
            "outlook listing finished"
        );
        Ok(())
    }

    /// Lists attachment metadata first and downloads bytes only for
    /// invoice-bearing files that are not ingested yet.
    async fn fetch_attachments(
        &self,
        session: &mut TokenSession<'_>,
        request: &ListRequest,
        message_id: &str,
    ) -> Result<Vec<CandidateAttachment>, SyncError> {
        let base = format!("{}/me/messages/{message_id}/attachments", self.settings.api_base);
        let mut next_url = Some(
            Url::parse_with_params(&base, &[("$select", "id,name,contentType,size")])
                .with_context(|| format!("build graph attachments url from {base}"))?
                .to_string(),
        );
        let mut wanted = Vec::new();

        while let Some(url) = next_url.take() {
            let page: GraphAttachmentPage = self
                .api
                .get_json(session, &url, "attachments page")
                .await?;
            wanted.extend(
                page.value
                    .into_iter()
                    .filter(is_wanted_file)
                    .filter_map(|attachment| attachment.id)
                    .filter(|id| !request.is_known(message_id, id)),
            );
            next_url = page.next_link;
        }

        let mut attachments = Vec::new();
        for attachment_id in wanted {
            let url = format!("{base}/{attachment_id}");
            let attachment: GraphAttachment =
                self.api.get_json(session, &url, "attachment").await?;
            if let Some(candidate) = into_candidate(attachment)? {
                attachments.push(candidate);
            }
        }

        Ok(attachments)
    }
}

#[async_trait(?Send)]
impl ProviderAdapter for OutlookAdapter {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    fn authorization_url(&self, state: &str) -> Result<String, SyncError> {
        let url = Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("client_id", self.settings.client_id()?),
                ("redirect_uri", self.settings.redirect_uri()?),
                ("response_type", "code"),
                ("response_mode", "query"),
                ("scope", GRAPH_SCOPES),
                ("prompt", "select_account"),
                ("state", state),
            ],
        )
        .context("build outlook authorization url")?;
        Ok(url.into())
    }

    async fn exchange_auth_code(&self, code: &str) -> Result<TokenBundle, SyncError> {
        let issued_at = Utc::now();
        let response = self
            .api
            .request_token(
                &self.settings.token_url,
                &[
                    ("client_id", self.settings.client_id()?),
                    ("client_secret", self.settings.client_secret()?),
                    ("code", code),
                    ("redirect_uri", self.settings.redirect_uri()?),
                    ("grant_type", "authorization_code"),
                    ("scope", GRAPH_SCOPES),
                ],
            )
            .await
            .map_err(|error| error.into_exchange_error(Provider::Outlook))?;
        Ok(response.into_bundle(issued_at))
    }

    async fn refresh_token(&self, tokens: &TokenBundle) -> Result<TokenBundle, SyncError> {
        let Some(refresh_token) = tokens.refresh_token.as_deref() else {
            return Err(SyncError::TokenRevoked {
                provider: Provider::Outlook,
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
                    ("scope", GRAPH_SCOPES),
                ],
            )
            .await
            .map_err(|error| error.into_refresh_error(Provider::Outlook))?;
        Ok(response.into_bundle(issued_at))
    }

    async fn fetch_account_identity(
        &self,
        tokens: &TokenBundle,
    ) -> Result<AccountIdentity, SyncError> {
        let mut session = TokenSession::new(self, tokens.clone());
        let me: GraphUser = self
            .api
            .get_json(&mut session, &self.settings.identity_url, "profile")
            .await
            .map_err(|error| SyncError::IdentityFetch {
                provider: Provider::Outlook,
                message: error.to_string(),
            })?;

        let email = me
            .mail
            .or(me.user_principal_name)
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty())
            .ok_or_else(|| SyncError::IdentityFetch {
                provider: Provider::Outlook,
                message: "profile has neither mail nor userPrincipalName".to_string(),
            })?;

        Ok(AccountIdentity {
            account_id: me.id,
            email,
        })
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
            "listing outlook messages with attachments"
        );
        let mut session = TokenSession::new(self, tokens).recording_into(&request.rotated);
        let mut outcome = ListOutcome::default();
        let result = self.collect(&mut session, request, &mut outcome).await;
        outcome.finish(session, result)
    }
}

fn message_filter(since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(since) => format!(
            "receivedDateTime ge {} and hasAttachments eq true",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        None => "hasAttachments eq true".to_string(),
    }
}

/// Item and reference attachments carry no bytes; only invoice-bearing file
/// attachments are worth downloading.
fn is_wanted_file(attachment: &GraphAttachment) -> bool {
    attachment.odata_type.as_deref() == Some(FILE_ATTACHMENT_TYPE)
        && attachment.id.as_deref().is_some_and(|id| !id.is_empty())
        && is_invoice_bearing(
            attachment.content_type.as_deref().unwrap_or_default(),
            attachment.name.as_deref().unwrap_or_default(),
        )
}

fn into_candidate(attachment: GraphAttachment) -> anyhow::Result<Option<CandidateAttachment>> {
    if attachment.odata_type.as_deref() != Some(FILE_ATTACHMENT_TYPE) {
        return Ok(None);
    }

    let file_name = attachment.name.unwrap_or_default().trim().to_string();
    let mime_type = attachment
        .content_type
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if !is_invoice_bearing(&mime_type, &file_name) {
        return Ok(None);
    }

    let Some(content_bytes) = attachment.content_bytes else {
        return Ok(None);
    };
    let content = STANDARD
        .decode(content_bytes.trim())
        .with_context(|| format!("base64 decode outlook attachment {file_name}"))?;

    let part_key = attachment
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| file_name.clone());

    Ok(Some(CandidateAttachment {
        part_key,
        file_name,
        mime_type,
        content,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct GraphUser {
    id: String,
    mail: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessagesPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    fn display(&self) -> Option<String> {
        let email = self.email_address.as_ref()?;
        let address = email
            .address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let name = email
            .name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match (name, address) {
            (Some(name), Some(address)) => Some(format!("{name} <{address}>")),
            (None, Some(address)) => Some(address.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphAttachmentPage {
    value: Vec<GraphAttachment>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphAttachment {
    #[serde(rename = "@odata.type")]
    odata_type: Option<String>,
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "contentBytes")]
    content_bytes: Option<String>,
}
