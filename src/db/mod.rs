use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::Value;
use thiserror::Error;

use self::models::{
    merge_patch, Attachment, Document, Integration, IntegrationStatus, Provider,
};
use crate::crypto::TokenCipher;
use crate::status::IngestionStatus;
use crate::tokens::TokenBundle;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("token cipher: {0}")]
    Cipher(String),

    #[error("{0} not found")]
    MissingRow(String),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

const INTEGRATION_COLUMNS: &str = r#"
    id, user_id, provider, status, access_token, refresh_token, token_type, expiry_date,
    provider_account_id, provider_email, metadata, created_at, updated_at
"#;

const ATTACHMENT_COLUMNS: &str = r#"
    id, user_id, integration_id, provider, provider_message_id, part_key, file_name, mime_type,
    size_bytes, blob_key, subject, sender, received_at, status, created_at
"#;

/// SQLite-backed credential store and attachment catalogue.
///
/// Every integration write is scoped to one row; concurrent passes for
/// different tenants never touch the same row, and a row is last-writer-wins.
pub struct Database {
    conn: Connection,
    cipher: Option<TokenCipher>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let mut db = Self {
            conn,
            cipher: None,
        };
        db.initialize()?;
        Ok(db)
    }

    /// Seal token columns on write. Rows written without a cipher stay readable.
    pub fn with_token_cipher(mut self, cipher: Option<TokenCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        self.run_migrations()
    }

    fn run_migrations(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".invoice-sync").join("invoice-sync.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn seal(&self, value: Option<&str>) -> Result<Option<String>, DbError> {
        match (&self.cipher, value) {
            (Some(cipher), Some(value)) => cipher
                .seal(value)
                .map(Some)
                .map_err(|e| DbError::Cipher(format!("{e:#}"))),
            (_, value) => Ok(value.map(str::to_string)),
        }
    }

    fn open_tokens(&self, mut integration: Integration) -> Result<Integration, DbError> {
        if let Some(cipher) = &self.cipher {
            let open = |value: Option<String>| {
                value
                    .map(|v| cipher.open(&v))
                    .transpose()
                    .map_err(|e| DbError::Cipher(format!("{e:#}")))
            };
            integration.access_token = open(integration.access_token.take())?;
            integration.refresh_token = open(integration.refresh_token.take())?;
        }
        Ok(integration)
    }

    fn query_integrations(
        &self,
        where_clause: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Integration>, DbError> {
        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations {where_clause} ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, Integration::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(|row| self.open_tokens(row)).collect()
    }

    /// Insert or update the single integration for `(user_id, provider)`.
    /// The row id of an existing integration is preserved.
    pub fn upsert_integration(&self, integration: &Integration) -> Result<Integration, DbError> {
        let metadata = serde_json::to_string(&integration.metadata)?;
        let access_token = self.seal(integration.access_token.as_deref())?;
        let refresh_token = self.seal(integration.refresh_token.as_deref())?;

        self.conn.execute(
            r#"
            INSERT INTO integrations (
                id, user_id, provider, status, access_token, refresh_token, token_type,
                expiry_date, provider_account_id, provider_email, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                status = excluded.status,
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, integrations.refresh_token),
                token_type = excluded.token_type,
                expiry_date = excluded.expiry_date,
                provider_account_id = excluded.provider_account_id,
                provider_email = excluded.provider_email,
                metadata = excluded.metadata,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            "#,
            params![
                integration.id,
                integration.user_id,
                integration.provider.to_string(),
                integration.status.to_string(),
                access_token,
                refresh_token,
                integration.token_type,
                integration.expiry_date.map(|d| d.to_rfc3339()),
                integration.provider_account_id,
                integration.provider_email,
                metadata,
            ],
        )?;

        self.get_integration_for_user(&integration.user_id, integration.provider)?
            .ok_or_else(|| {
                DbError::MissingRow(format!(
                    "{} integration for user {}",
                    integration.provider, integration.user_id
                ))
            })
    }

    pub fn get_integration(&self, id: &str) -> Result<Option<Integration>, DbError> {
        Ok(self
            .query_integrations("WHERE id = ?", params![id])?
            .into_iter()
            .next())
    }

    pub fn get_integration_for_user(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<Integration>, DbError> {
        let provider = provider.to_string();
        Ok(self
            .query_integrations("WHERE user_id = ? AND provider = ?", params![user_id, provider])?
            .into_iter()
            .next())
    }

    /// Case-insensitive lookup of the integration a mailbox is linked to.
    pub fn find_integration_by_email(&self, email: &str) -> Result<Option<Integration>, DbError> {
        let email = email.trim().to_string();
        Ok(self
            .query_integrations("WHERE lower(provider_email) = lower(?)", params![email])?
            .into_iter()
            .next())
    }

    pub fn list_integrations(
        &self,
        provider: Option<Provider>,
    ) -> Result<Vec<Integration>, DbError> {
        match provider {
            Some(provider) => {
                let provider = provider.to_string();
                self.query_integrations("WHERE provider = ?", params![provider])
            }
            None => self.query_integrations("", params![]),
        }
    }

    pub fn update_integration_tokens(
        &self,
        integration_id: &str,
        tokens: &TokenBundle,
    ) -> Result<(), DbError> {
        let access_token = self.seal(Some(&tokens.access_token))?;
        let refresh_token = self.seal(tokens.refresh_token.as_deref())?;

        let updated = self.conn.execute(
            r#"
            UPDATE integrations SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                token_type = COALESCE(?, token_type),
                expiry_date = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![
                access_token,
                refresh_token,
                tokens.token_type,
                tokens.expiry_date.map(|d| d.to_rfc3339()),
                integration_id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::MissingRow(format!("integration {integration_id}")));
        }
        Ok(())
    }

    pub fn set_integration_status(
        &self,
        integration_id: &str,
        status: IntegrationStatus,
    ) -> Result<(), DbError> {
        let updated = self.conn.execute(
            r#"
            UPDATE integrations SET
                status = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![status.to_string(), integration_id],
        )?;
        if updated == 0 {
            return Err(DbError::MissingRow(format!("integration {integration_id}")));
        }
        Ok(())
    }

    /// Applies a JSON merge patch to the integration's metadata and returns the
    /// resulting document. Keys absent from `patch` are left as stored.
    pub fn merge_integration_metadata(
        &self,
        integration_id: &str,
        patch: &Value,
    ) -> Result<Value, DbError> {
        let tx = self.conn.unchecked_transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT metadata FROM integrations WHERE id = ?",
                [integration_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(DbError::MissingRow(format!("integration {integration_id}")));
        };

        let mut document = serde_json::from_str::<Value>(&current)
            .unwrap_or_else(|_| Value::Object(Default::default()));
        merge_patch(&mut document, patch);

        tx.execute(
            r#"
            UPDATE integrations SET
                metadata = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![serde_json::to_string(&document)?, integration_id],
        )?;
        tx.commit()?;

        Ok(document)
    }

    /// Inserts an attachment unless one with the same idempotency key
    /// `(user_id, provider_message_id, part_key)` exists. Returns whether a row
    /// was created.
    pub fn insert_attachment(&self, attachment: &Attachment) -> Result<bool, DbError> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO attachments (
                id, user_id, integration_id, provider, provider_message_id, part_key, file_name,
                mime_type, size_bytes, blob_key, subject, sender, received_at, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, provider_message_id, part_key) DO NOTHING
            "#,
            params![
                attachment.id,
                attachment.user_id,
                attachment.integration_id,
                attachment.provider.to_string(),
                attachment.provider_message_id,
                attachment.part_key,
                attachment.file_name,
                attachment.mime_type,
                attachment.size_bytes,
                attachment.blob_key,
                attachment.subject,
                attachment.sender,
                attachment.received_at,
                attachment.status.to_string(),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn attachment_exists(
        &self,
        user_id: &str,
        provider_message_id: &str,
        part_key: &str,
    ) -> Result<bool, DbError> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM attachments
            WHERE user_id = ? AND provider_message_id = ? AND part_key = ?
            "#,
            params![user_id, provider_message_id, part_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// `(provider message id, part key)` of everything already ingested for
    /// the user's mailbox on `provider`, limited to messages received at or
    /// after `since` when given. Rows without a receipt time are always included.
    pub fn known_parts(
        &self,
        user_id: &str,
        provider: Provider,
        since: Option<&str>,
    ) -> Result<HashSet<(String, String)>, DbError> {
        let provider = provider.to_string();
        let mut stmt = self.conn.prepare(
            r#"
            SELECT provider_message_id, part_key FROM attachments
            WHERE user_id = ?1 AND provider = ?2
              AND (?3 IS NULL OR received_at IS NULL OR received_at >= ?3)
            "#,
        )?;
        let parts = stmt
            .query_map(params![user_id, provider, since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(parts)
    }

    pub fn get_attachment(&self, id: &str) -> Result<Option<Attachment>, DbError> {
        let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ? LIMIT 1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Attachment::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_attachments(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Attachment>, DbError> {
        let sql = format!(
            r#"
            SELECT {ATTACHMENT_COLUMNS} FROM attachments
            WHERE user_id = ?
            ORDER BY created_at DESC, id ASC
            LIMIT ? OFFSET ?
            "#
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![user_id, limit, offset],
                Attachment::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_attachments(&self, user_id: &str) -> Result<i64, DbError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM attachments WHERE user_id = ?",
            [user_id],
            |row| row.get(0),
        )?)
    }

    pub fn set_attachment_status(
        &self,
        attachment_id: &str,
        status: IngestionStatus,
    ) -> Result<(), DbError> {
        let updated = self.conn.execute(
            "UPDATE attachments SET status = ? WHERE id = ?",
            params![status.to_string(), attachment_id],
        )?;
        if updated == 0 {
            return Err(DbError::MissingRow(format!("attachment {attachment_id}")));
        }
        Ok(())
    }

    /// Written by the downstream review pipeline; read here for status derivation.
    pub fn record_document(&self, document: &Document) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO documents (id, attachment_id, status, deleted_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                deleted_at = excluded.deleted_at
            "#,
            params![
                document.id,
                document.attachment_id,
                document.status.as_str(),
                document.deleted_at,
            ],
        )?;
        Ok(())
    }

    pub fn documents_for_attachments(
        &self,
        attachment_ids: &[String],
    ) -> Result<HashMap<String, Vec<Document>>, DbError> {
        let mut grouped: HashMap<String, Vec<Document>> = HashMap::new();
        if attachment_ids.is_empty() {
            return Ok(grouped);
        }

        let placeholders = vec!["?"; attachment_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, attachment_id, status, deleted_at FROM documents WHERE attachment_id IN ({placeholders}) ORDER BY id ASC"
        );
        let params_refs: Vec<&dyn ToSql> =
            attachment_ids.iter().map(|id| id as &dyn ToSql).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let documents = stmt
            .query_map(params_refs.as_slice(), Document::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for document in documents {
            grouped
                .entry(document.attachment_id.clone())
                .or_default()
                .push(document);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::Database;
    use crate::crypto::TokenCipher;
    use crate::db::models::{Attachment, Document, Integration, IntegrationStatus, Provider};
    use crate::status::{IngestionStatus, ReviewStatus};
    use crate::tokens::TokenBundle;

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("invoice-sync-test-{}.db", Uuid::new_v4()));
        path
    }

    fn linked(user_id: &str, provider: Provider, email: &str) -> Integration {
        let mut integration = Integration::new(user_id, provider);
        integration.status = IntegrationStatus::Success;
        integration.access_token = Some("access".to_string());
        integration.refresh_token = Some("refresh".to_string());
        integration.provider_email = Some(email.to_string());
        integration.metadata = json!({ "scopes": ["mail.read"] });
        integration
    }

    fn attachment(integration: &Integration, message_id: &str, part: &str) -> Attachment {
        Attachment {
            id: Uuid::new_v4().to_string(),
            user_id: integration.user_id.clone(),
            integration_id: integration.id.clone(),
            provider: integration.provider,
            provider_message_id: message_id.to_string(),
            part_key: part.to_string(),
            file_name: "invoice.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 10,
            blob_key: format!("{}/{message_id}/{part}", integration.user_id),
            subject: Some("Invoice".to_string()),
            sender: Some("billing@vendor.test".to_string()),
            received_at: Some("2025-01-02T00:00:00Z".to_string()),
            status: IngestionStatus::Pending,
            created_at: None,
        }
    }

    #[test]
    fn upsert_keeps_one_row_per_user_and_provider() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let first = db
            .upsert_integration(&linked("user-1", Provider::Gmail, "a@example.com"))
            .expect("insert integration");
        let mut relinked = linked("user-1", Provider::Gmail, "b@example.com");
        relinked.refresh_token = None;
        let second = db.upsert_integration(&relinked).expect("relink integration");

        assert_eq!(first.id, second.id);
        assert_eq!(second.provider_email.as_deref(), Some("b@example.com"));
        assert_eq!(second.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(db.list_integrations(Some(Provider::Gmail)).expect("list").len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn provider_email_is_unique_case_insensitively() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.upsert_integration(&linked("user-1", Provider::Gmail, "ap@example.com"))
            .expect("insert integration");
        let found = db
            .find_integration_by_email("AP@Example.com")
            .expect("lookup")
            .expect("found");
        assert_eq!(found.user_id, "user-1");

        let conflict = db.upsert_integration(&linked("user-2", Provider::Gmail, "AP@example.com"));
        assert!(conflict.is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn metadata_merge_keeps_unrelated_fields() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let stored = db
            .upsert_integration(&linked("user-1", Provider::Outlook, "o@example.com"))
            .expect("insert integration");

        let merged = db
            .merge_integration_metadata(&stored.id, &json!({ "lastReadAt": "2025-03-01T00:00:00Z" }))
            .expect("merge metadata");
        assert_eq!(merged["scopes"], json!(["mail.read"]));
        assert_eq!(merged["lastReadAt"], "2025-03-01T00:00:00Z");

        let reloaded = db.get_integration(&stored.id).expect("get").expect("exists");
        assert_eq!(reloaded.metadata, merged);
        assert!(db
            .merge_integration_metadata("missing", &json!({}))
            .is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn tokens_are_sealed_at_rest_when_cipher_configured() {
        let path = temp_db_path();
        let cipher = TokenCipher::from_hex(&"0f".repeat(32)).expect("cipher");
        let db = Database::open(&path)
            .expect("open db")
            .with_token_cipher(Some(cipher));
        let stored = db
            .upsert_integration(&linked("user-1", Provider::Gmail, "s@example.com"))
            .expect("insert integration");
        assert_eq!(stored.access_token.as_deref(), Some("access"));

        db.update_integration_tokens(
            &stored.id,
            &TokenBundle {
                access_token: "rotated".to_string(),
                refresh_token: None,
                token_type: Some("Bearer".to_string()),
                expiry_date: Some(Utc::now() + Duration::hours(1)),
                scopes: vec![],
            },
        )
        .expect("rotate tokens");

        let raw: String = db
            .conn()
            .query_row(
                "SELECT access_token FROM integrations WHERE id = ?",
                [&stored.id],
                |row| row.get(0),
            )
            .expect("raw token");
        assert!(!raw.contains("rotated"));

        let reloaded = db.get_integration(&stored.id).expect("get").expect("exists");
        assert_eq!(reloaded.access_token.as_deref(), Some("rotated"));
        assert_eq!(reloaded.refresh_token.as_deref(), Some("refresh"));
        assert!(reloaded.expiry_date.is_some());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn attachments_are_idempotent_on_message_and_part() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let integration = db
            .upsert_integration(&linked("user-1", Provider::Gmail, "i@example.com"))
            .expect("insert integration");

        assert!(db
            .insert_attachment(&attachment(&integration, "msg-1", "1"))
            .expect("insert"));
        assert!(!db
            .insert_attachment(&attachment(&integration, "msg-1", "1"))
            .expect("insert duplicate"));
        assert!(db
            .insert_attachment(&attachment(&integration, "msg-1", "2"))
            .expect("insert second part"));

        assert!(db.attachment_exists("user-1", "msg-1", "1").expect("exists"));
        assert_eq!(db.count_attachments("user-1").expect("count"), 2);
        assert_eq!(db.list_attachments("user-1", 1, 0).expect("page").len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn known_parts_are_scoped_to_mailbox_and_window() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let gmail = db
            .upsert_integration(&linked("user-1", Provider::Gmail, "k@example.com"))
            .expect("insert gmail");
        let outlook = db
            .upsert_integration(&linked("user-1", Provider::Outlook, "k@outlook.test"))
            .expect("insert outlook");
        db.insert_attachment(&attachment(&gmail, "msg-1", "1"))
            .expect("insert gmail part");
        db.insert_attachment(&attachment(&outlook, "msg-2", "att"))
            .expect("insert outlook part");

        let all = db
            .known_parts("user-1", Provider::Gmail, None)
            .expect("known parts");
        assert_eq!(all.len(), 1);
        assert!(all.contains(&("msg-1".to_string(), "1".to_string())));

        let within = db
            .known_parts("user-1", Provider::Gmail, Some("2025-01-01T00:00:00Z"))
            .expect("known parts since");
        assert_eq!(within.len(), 1);
        let after = db
            .known_parts("user-1", Provider::Gmail, Some("2025-02-01T00:00:00Z"))
            .expect("known parts after");
        assert!(after.is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn documents_group_by_attachment() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let integration = db
            .upsert_integration(&linked("user-1", Provider::Gmail, "d@example.com"))
            .expect("insert integration");
        let att = attachment(&integration, "msg-9", "1");
        db.insert_attachment(&att).expect("insert attachment");
        db.record_document(&Document {
            id: "doc-1".to_string(),
            attachment_id: att.id.clone(),
            status: ReviewStatus::Approved,
            deleted_at: None,
        })
        .expect("record document");

        let grouped = db
            .documents_for_attachments(&[att.id.clone(), "other".to_string()])
            .expect("group documents");
        assert_eq!(grouped.get(&att.id).map(Vec::len), Some(1));
        assert!(!grouped.contains_key("other"));
        let _ = std::fs::remove_file(path);
    }
}
