use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::status::{IngestionStatus, ReviewStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Provider {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Gmail => "Gmail",
            Self::Outlook => "Outlook",
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gmail => write!(f, "gmail"),
            Self::Outlook => write!(f, "outlook"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(Self::Gmail),
            "outlook" | "microsoft" | "graph" => Ok(Self::Outlook),
            other => Err(format!("invalid provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Pending,
    Success,
    Failed,
    Paused,
}

impl Display for IntegrationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            other => Err(format!("invalid integration status: {other}")),
        }
    }
}

/// Sync state kept on the integration row.
///
/// `lastRead` is the pre-`lastReadAt` cursor. It is still read as a watermark
/// fallback but never serialized, and metadata writes are merge patches, so an
/// existing value stays in the stored document untouched.
///
/// Each field is read on its own: a value of the wrong type is dropped with a
/// warning and the remaining fields are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationMetadata {
    #[serde(default, deserialize_with = "lenient_scopes")]
    pub scopes: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_read_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing)]
    pub last_read: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_reading: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_processed_at: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_sync_error: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_failed_at: Option<String>,
    /// Consecutive passes that held `lastReadAt` back for undownloadable messages.
    #[serde(
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub held_back_passes: Option<u32>,
}

impl IntegrationMetadata {
    pub fn from_value(value: &Value) -> Self {
        if !value.is_object() {
            if !value.is_null() {
                warn!(metadata = %value, "integration metadata is not an object; ignoring it");
            }
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_else(|error| {
            warn!("unreadable integration metadata: {error}");
            Self::default()
        })
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(value) => Some(value),
        other => {
            warn!(value = %other, "ignoring non-string integration metadata value");
            None
        }
    })
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        other => {
            warn!(value = %other, "ignoring non-numeric integration metadata value");
            None
        }
    })
}

/// Accepts a list of scopes or a single space-separated scope string.
fn lenient_scopes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::String(scopes) => scopes.split_whitespace().map(str::to_string).collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(scope) => Some(scope),
                other => {
                    warn!(value = %other, "ignoring non-string scope");
                    None
                }
            })
            .collect(),
        other => {
            warn!(value = %other, "ignoring unreadable scopes");
            Vec::new()
        }
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub status: IntegrationStatus,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub provider_account_id: Option<String>,
    pub provider_email: Option<String>,
    /// Raw stored document; see [`Integration::typed_metadata`] for the typed view.
    pub metadata: Value,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Integration {
    pub fn new(user_id: &str, provider: Provider) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            provider,
            status: IntegrationStatus::Pending,
            access_token: None,
            refresh_token: None,
            token_type: None,
            expiry_date: None,
            provider_account_id: None,
            provider_email: None,
            metadata: Value::Object(Default::default()),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn typed_metadata(&self) -> IntegrationMetadata {
        IntegrationMetadata::from_value(&self.metadata)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub user_id: String,
    pub integration_id: String,
    pub provider: Provider,
    pub provider_message_id: String,
    /// Stable per-message identifier of the MIME part (Gmail attachment ids
    /// rotate between requests, so the part id or file name is used instead).
    pub part_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub blob_key: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub received_at: Option<String>,
    pub status: IngestionStatus,
    pub created_at: Option<String>,
}

/// Downstream review record produced by the extraction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub attachment_id: String,
    pub status: ReviewStatus,
    pub deleted_at: Option<String>,
}

/// RFC 7386 JSON merge patch: objects merge recursively, `null` removes a key,
/// anything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Default::default());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

fn parse_json_value(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str::<Value>(&s).ok())
}

fn parse_enum<T: FromStr<Err = String>>(raw: String) -> SqlResult<T> {
    T::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            raw.len(),
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
        .map(|value| value.with_timezone(&Utc))
}

impl Integration {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            provider: parse_enum(row.get("provider")?)?,
            status: parse_enum(row.get("status")?)?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            token_type: row.get("token_type")?,
            expiry_date: parse_timestamp(row.get("expiry_date")?),
            provider_account_id: row.get("provider_account_id")?,
            provider_email: row.get("provider_email")?,
            metadata: parse_json_value(row.get("metadata")?)
                .unwrap_or_else(|| Value::Object(Default::default())),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl Attachment {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            integration_id: row.get("integration_id")?,
            provider: parse_enum(row.get("provider")?)?,
            provider_message_id: row.get("provider_message_id")?,
            part_key: row.get("part_key")?,
            file_name: row.get("file_name")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
            blob_key: row.get("blob_key")?,
            subject: row.get("subject")?,
            sender: row.get("sender")?,
            received_at: row.get("received_at")?,
            status: parse_enum(row.get("status")?)?,
            created_at: row.get("created_at")?,
        })
    }
}

impl Document {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let status: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            attachment_id: row.get("attachment_id")?,
            status: ReviewStatus::parse(&status),
            deleted_at: row.get("deleted_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{merge_patch, IntegrationMetadata, IntegrationStatus, Provider};

    #[test]
    fn provider_display_and_parse() {
        assert_eq!(Provider::Gmail.to_string(), "gmail");
        assert_eq!(
            "Microsoft".parse::<Provider>().expect("parse provider"),
            Provider::Outlook
        );
        assert!("imap".parse::<Provider>().is_err());
        assert_eq!(
            "paused"
                .parse::<IntegrationStatus>()
                .expect("parse status"),
            IntegrationStatus::Paused
        );
    }

    #[test]
    fn metadata_reads_legacy_field_but_never_writes_it() {
        let stored = json!({
            "scopes": ["gmail.readonly"],
            "lastRead": "2024-06-01T00:00:00Z",
            "startReading": "2024-01-01"
        });
        let metadata = IntegrationMetadata::from_value(&stored);
        assert_eq!(metadata.last_read.as_deref(), Some("2024-06-01T00:00:00Z"));
        assert_eq!(metadata.scopes, vec!["gmail.readonly".to_string()]);

        let written = serde_json::to_value(&metadata).expect("serialize metadata");
        assert!(written.get("lastRead").is_none());
        assert_eq!(written["startReading"], "2024-01-01");
    }

    #[test]
    fn one_mistyped_field_keeps_the_cursor_fields() {
        let stored = json!({
            "scopes": "gmail.readonly gmail.metadata",
            "lastReadAt": "2025-05-01T00:00:00Z",
            "lastRead": 1714521600,
            "startReading": "2025-01-01",
            "lastProcessedAt": { "at": "yesterday" },
            "heldBackPasses": "two"
        });
        let metadata = IntegrationMetadata::from_value(&stored);
        assert_eq!(metadata.scopes, vec!["gmail.readonly", "gmail.metadata"]);
        assert_eq!(metadata.last_read_at.as_deref(), Some("2025-05-01T00:00:00Z"));
        assert_eq!(metadata.last_read, None);
        assert_eq!(metadata.start_reading.as_deref(), Some("2025-01-01"));
        assert_eq!(metadata.last_processed_at, None);
        assert_eq!(metadata.held_back_passes, None);
        assert_eq!(
            IntegrationMetadata::from_value(&json!({ "heldBackPasses": 2 })).held_back_passes,
            Some(2)
        );

        let mixed = IntegrationMetadata::from_value(&json!({ "scopes": ["mail.read", 7, null] }));
        assert_eq!(mixed.scopes, vec!["mail.read"]);
        assert_eq!(IntegrationMetadata::from_value(&json!("oops")), IntegrationMetadata::default());
    }

    #[test]
    fn merge_patch_preserves_untouched_fields() {
        let mut stored = json!({
            "scopes": ["Mail.Read"],
            "lastRead": "2024-06-01T00:00:00Z",
            "lastSyncError": "boom"
        });
        merge_patch(
            &mut stored,
            &json!({ "lastReadAt": "2025-01-02T00:00:00Z", "lastSyncError": null }),
        );

        assert_eq!(stored["scopes"], json!(["Mail.Read"]));
        assert_eq!(stored["lastRead"], "2024-06-01T00:00:00Z");
        assert_eq!(stored["lastReadAt"], "2025-01-02T00:00:00Z");
        assert!(stored.get("lastSyncError").is_none());
    }
}
