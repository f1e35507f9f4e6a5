use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::schema;

const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

/// Applied in order; each step commits together with its version bump.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "integrations",
        apply: schema::create_integration_schema,
    },
    Migration {
        version: 2,
        name: "attachments and documents",
        apply: schema::create_attachment_schema,
    },
];

fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    ensure_version_table(conn)?;

    let current = schema_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(anyhow!(
            "database schema version {current} is newer than this build supports ({latest})"
        ));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .unchecked_transaction()
            .context("begin migration transaction")?;
        (migration.apply)(&tx).with_context(|| {
            format!(
                "apply schema migration v{} ({})",
                migration.version, migration.name
            )
        })?;
        record_version(&tx, migration.version)?;
        tx.commit()
            .with_context(|| format!("commit schema migration v{}", migration.version))?;
        tracing::debug!(version = migration.version, name = migration.name, "schema migrated");
    }

    Ok(())
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
    .context("ensure sync_state table for migration tracking")
}

fn schema_version(conn: &Connection) -> Result<u32> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read schema version")?;

    stored.map_or(Ok(0), |value| {
        value
            .parse::<u32>()
            .with_context(|| format!("invalid schema version in database: {value}"))
    })
}

fn record_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sync_state (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
        "#,
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )
    .with_context(|| format!("record schema version {version}"))?;
    Ok(())
}
