use anyhow::Result;

use crate::attachments::{AttachmentContent, AttachmentPage};
use crate::db::models::Integration;
use crate::oauth::CallbackRedirect;
use crate::sync::{RunSummary, SyncScope};

pub fn format_run_summary(scope: &SyncScope, summary: &RunSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(&summary.to_json(scope))?)
}

pub fn format_integrations(integrations: &[Integration]) -> Result<String> {
    Ok(serde_json::to_string_pretty(integrations)?)
}

pub fn format_attachment_page(page: &AttachmentPage) -> Result<String> {
    Ok(serde_json::to_string_pretty(page)?)
}

pub fn format_attachment(content: &AttachmentContent) -> Result<String> {
    Ok(serde_json::to_string_pretty(content)?)
}

pub fn format_redirect(redirect: &CallbackRedirect) -> Result<String> {
    Ok(serde_json::to_string_pretty(redirect)?)
}
