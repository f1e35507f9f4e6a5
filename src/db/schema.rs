use anyhow::Result;
use rusqlite::Connection;

/// Integration rows (the credential store) and the migration bookkeeping table.
pub fn create_integration_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS integrations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL CHECK(provider IN ('gmail', 'outlook')),
            status TEXT NOT NULL CHECK(status IN ('pending', 'success', 'failed', 'paused')),
            access_token TEXT,
            refresh_token TEXT,
            token_type TEXT,
            expiry_date TEXT,
            provider_account_id TEXT,
            provider_email TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            UNIQUE(user_id, provider)
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_integrations_provider_email
            ON integrations(lower(provider_email)) WHERE provider_email IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_integrations_provider ON integrations(provider);
        "#,
    )?;

    Ok(())
}

/// Ingested attachments and the downstream documents derived from them.
pub fn create_attachment_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            integration_id TEXT NOT NULL REFERENCES integrations(id),
            provider TEXT NOT NULL,
            provider_message_id TEXT NOT NULL,
            part_key TEXT NOT NULL,
            file_name TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            blob_key TEXT NOT NULL,
            subject TEXT,
            sender TEXT,
            received_at TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            UNIQUE(user_id, provider_message_id, part_key)
        );

        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            attachment_id TEXT NOT NULL REFERENCES attachments(id),
            status TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_user_created ON attachments(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_documents_attachment_id ON documents(attachment_id);
        "#,
    )?;

    Ok(())
}
