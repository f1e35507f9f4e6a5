//! Read side for ingested attachments: paginated listing with derived job
//! status, and single-attachment fetch with the stored bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use crate::blob::{BlobKey, BlobStore};
use crate::db::models::Attachment;
use crate::db::Database;
use crate::error::SyncError;
use crate::status::{derive_for_documents, JobStatus};

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    #[serde(flatten)]
    pub attachment: Attachment,
    pub job_status: JobStatus,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total_attachments: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AttachmentPage {
    pub attachments: Vec<AttachmentView>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentContent {
    #[serde(flatten)]
    pub view: AttachmentView,
    /// Standard base64 of the stored bytes.
    pub content: String,
}

/// Pages are 1-based. `limit` is clamped to `1..=MAX_PAGE_LIMIT`.
pub fn list_attachments(
    db: &Database,
    user_id: &str,
    page: usize,
    limit: usize,
) -> Result<AttachmentPage, SyncError> {
    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_LIMIT);
    let total = usize::try_from(db.count_attachments(user_id)?).unwrap_or_default();

    let rows = db.list_attachments(user_id, limit, (page - 1).saturating_mul(limit))?;
    let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
    let mut documents = db.documents_for_attachments(&ids)?;

    let attachments = rows
        .into_iter()
        .map(|attachment| {
            let children = documents.remove(&attachment.id).unwrap_or_default();
            AttachmentView {
                job_status: derive_for_documents(attachment.status, &children),
                attachment,
            }
        })
        .collect();

    Ok(AttachmentPage {
        attachments,
        pagination: Pagination {
            total_attachments: total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        },
    })
}

/// Loads one attachment owned by `user_id` together with its bytes.
pub fn fetch_attachment_blob(
    db: &Database,
    blobs: &dyn BlobStore,
    attachment_id: &str,
    user_id: &str,
) -> Result<AttachmentContent, SyncError> {
    let attachment = db
        .get_attachment(attachment_id)?
        .ok_or_else(|| SyncError::NotFound(format!("attachment {attachment_id}")))?;
    if attachment.user_id != user_id {
        return Err(SyncError::Forbidden {
            resource: format!("attachment {attachment_id}"),
            user_id: user_id.to_string(),
        });
    }

    let key = BlobKey::from_stored(&attachment.blob_key)?;
    let bytes = blobs
        .get(&key)?
        .ok_or_else(|| SyncError::NotFound(format!("blob {}", key.as_str())))?;

    let documents = db
        .documents_for_attachments(std::slice::from_ref(&attachment.id))?
        .remove(&attachment.id)
        .unwrap_or_default();

    Ok(AttachmentContent {
        view: AttachmentView {
            job_status: derive_for_documents(attachment.status, &documents),
            attachment,
        },
        content: STANDARD.encode(bytes),
    })
}
