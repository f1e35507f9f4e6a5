//! Per-integration read cursor kept in integration metadata.
//!
//! The cursor is read with a fallback chain `lastReadAt -> lastRead ->
//! startReading`. Only `lastReadAt`, `lastProcessedAt` and the
//! `heldBackPasses` counter are ever written.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::db::models::IntegrationMetadata;
use crate::db::{Database, DbError};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Passes in a row a failing message may hold the cursor back before it is
/// given up on.
pub const MAX_HELD_BACK_PASSES: u32 = 3;

/// What a pass achieved, as far as the cursor is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassProgress {
    /// Attachments newly stored during the pass.
    pub stored: usize,
    /// The listing walked every page since the cursor.
    pub listed_everything: bool,
    /// Receipt times of messages that were listed but not fully stored.
    /// `None` when the provider never told us when the message arrived.
    pub failed: Vec<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    /// `lastReadAt` moved up to the pass start.
    Advanced,
    /// `lastReadAt` stopped just short of the earliest failed message.
    HeldBack { passes: u32 },
    /// Failures outlived [`MAX_HELD_BACK_PASSES`]; the cursor moved past them.
    GaveUp,
    /// The listing was cut short; `lastReadAt` stays where it was.
    Unchanged,
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses RFC 3339, naive date-times (read as UTC) and plain dates
/// (midnight UTC).
pub fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

pub fn resolve_cursor(metadata: &IntegrationMetadata) -> Option<DateTime<Utc>> {
    let candidates = [
        ("lastReadAt", metadata.last_read_at.as_deref()),
        ("lastRead", metadata.last_read.as_deref()),
        ("startReading", metadata.start_reading.as_deref()),
    ];

    for (field, raw) in candidates {
        let Some(raw) = raw else {
            continue;
        };
        match normalize_timestamp(raw) {
            Some(cursor) => return Some(cursor),
            None => warn!(field, value = raw, "ignoring unparseable watermark value"),
        }
    }

    None
}

/// Merge patch recording a successful pass that started at `started_at`.
///
/// `lastReadAt` never moves backwards; `lastProcessedAt` only moves when
/// something was stored.
pub fn cursor_patch(
    current: &IntegrationMetadata,
    started_at: DateTime<Utc>,
    progress: &PassProgress,
) -> (Value, CursorMove) {
    let mut patch = Map::new();
    patch.insert("lastSyncError".to_string(), Value::Null);
    patch.insert("lastFailedAt".to_string(), Value::Null);

    if progress.stored > 0 {
        patch.insert(
            "lastProcessedAt".to_string(),
            json!(format_timestamp(started_at)),
        );
    }

    if !progress.listed_everything {
        return (Value::Object(patch), CursorMove::Unchanged);
    }

    let existing = current
        .last_read_at
        .as_deref()
        .and_then(normalize_timestamp);
    let advance = |patch: &mut Map<String, Value>| {
        let next = existing.map_or(started_at, |existing| existing.max(started_at));
        patch.insert("lastReadAt".to_string(), json!(format_timestamp(next)));
        patch.insert("heldBackPasses".to_string(), Value::Null);
    };

    if progress.failed.is_empty() {
        advance(&mut patch);
        return (Value::Object(patch), CursorMove::Advanced);
    }

    let passes = current.held_back_passes.unwrap_or(0).saturating_add(1);
    if passes >= MAX_HELD_BACK_PASSES {
        advance(&mut patch);
        return (Value::Object(patch), CursorMove::GaveUp);
    }

    // A message without a receipt time pins the cursor where it is.
    let earliest = progress
        .failed
        .iter()
        .copied()
        .collect::<Option<Vec<_>>>()
        .and_then(|times| times.into_iter().min());
    let floor = resolve_cursor(current);
    let target = earliest.map(|at| (at - Duration::seconds(1)).min(started_at));
    let next = match (floor, target) {
        (Some(floor), Some(target)) => Some(floor.max(target)),
        (floor, target) => floor.or(target),
    };
    if let Some(next) = next {
        patch.insert("lastReadAt".to_string(), json!(format_timestamp(next)));
    }
    patch.insert("heldBackPasses".to_string(), json!(passes));
    (Value::Object(patch), CursorMove::HeldBack { passes })
}

/// Applies [`cursor_patch`] to the stored metadata.
pub fn commit_cursor(
    db: &Database,
    integration_id: &str,
    started_at: DateTime<Utc>,
    progress: &PassProgress,
) -> Result<CursorMove, DbError> {
    let integration = db
        .get_integration(integration_id)?
        .ok_or_else(|| DbError::MissingRow(format!("integration {integration_id}")))?;
    let (patch, movement) = cursor_patch(&integration.typed_metadata(), started_at, progress);
    db.merge_integration_metadata(integration_id, &patch)?;
    Ok(movement)
}
