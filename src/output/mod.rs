pub mod json;
pub mod table;

use anyhow::Result;

use crate::attachments::{AttachmentContent, AttachmentPage};
use crate::db::models::Integration;
use crate::oauth::CallbackRedirect;
use crate::sync::{RunSummary, SyncScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_run_summary(
    format: OutputFormat,
    scope: &SyncScope,
    summary: &RunSummary,
) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_run_summary(summary)),
        OutputFormat::Json => json::format_run_summary(scope, summary),
    }
}

pub fn format_integrations(format: OutputFormat, integrations: &[Integration]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_integrations(integrations)),
        OutputFormat::Json => json::format_integrations(integrations),
    }
}

pub fn format_attachment_page(format: OutputFormat, page: &AttachmentPage) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_attachment_page(page)),
        OutputFormat::Json => json::format_attachment_page(page),
    }
}

pub fn format_attachment(format: OutputFormat, content: &AttachmentContent) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_attachment(content)),
        OutputFormat::Json => json::format_attachment(content),
    }
}

pub fn format_redirect(format: OutputFormat, redirect: &CallbackRedirect) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_redirect(redirect)),
        OutputFormat::Json => json::format_redirect(redirect),
    }
}
