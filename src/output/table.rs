use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::attachments::{AttachmentContent, AttachmentPage};
use crate::db::models::Integration;
use crate::oauth::CallbackRedirect;
use crate::sync::RunSummary;

const USER_WIDTH: usize = 20;
const PROVIDER_WIDTH: usize = 8;
const STATUS_WIDTH: usize = 10;
const EMAIL_WIDTH: usize = 28;
const FILE_WIDTH: usize = 32;
const SUBJECT_WIDTH: usize = 36;
const DATE_WIDTH: usize = 12;

pub fn format_run_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", summary.message));
    out.push_str(&format!(
        "Integrations: {} processed of {} ({} ok, {} failed, {} paused)\n",
        summary.metadata.processed_integrations,
        summary.metadata.total_integrations,
        summary.metadata.total_success,
        summary.metadata.total_failed,
        summary.metadata.total_paused
    ));
    out.push_str(&format!(
        "Attachments stored: {}   Token refreshes: {}\n",
        summary.metadata.total_emails, summary.metadata.token_refreshes
    ));

    if summary.data.is_empty() {
        return out;
    }

    out.push('\n');
    out.push_str(&format!(
        "{:<user$}  {:<provider$}  {:<status$}  {:>6}  {}\n",
        "User",
        "Provider",
        "Status",
        "Stored",
        "Result",
        user = USER_WIDTH,
        provider = PROVIDER_WIDTH,
        status = STATUS_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(USER_WIDTH),
        "-".repeat(PROVIDER_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(6),
        "-".repeat(30)
    ));
    for result in &summary.data {
        let marker = if result.success { "ok" } else { "FAILED" };
        out.push_str(&format!(
            "{:<user$}  {:<provider$}  {:<status$}  {:>6}  {marker}: {}\n",
            truncate_for_width(&result.user_id, USER_WIDTH),
            result.provider.to_string(),
            result.integration_status.to_string(),
            result.emails_synced,
            result.message,
            user = USER_WIDTH,
            provider = PROVIDER_WIDTH,
            status = STATUS_WIDTH
        ));
        for error in result.errors.iter().filter(|error| **error != result.message) {
            out.push_str(&format!("{:indent$}  - {error}\n", "", indent = USER_WIDTH));
        }
    }
    out
}

pub fn format_integrations(integrations: &[Integration]) -> String {
    if integrations.is_empty() {
        return "No integrations linked.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<user$}  {:<provider$}  {:<status$}  {:<email$}  {:<date$}  {}\n",
        "User",
        "Provider",
        "Status",
        "Mailbox",
        "Last Read",
        "Last Error",
        user = USER_WIDTH,
        provider = PROVIDER_WIDTH,
        status = STATUS_WIDTH,
        email = EMAIL_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}  {}\n",
        "-".repeat(USER_WIDTH),
        "-".repeat(PROVIDER_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(EMAIL_WIDTH),
        "-".repeat(DATE_WIDTH),
        "-".repeat(10)
    ));

    for integration in integrations {
        let metadata = integration.typed_metadata();
        let last_read = metadata
            .last_read_at
            .as_deref()
            .or(metadata.start_reading.as_deref())
            .map(relative_date)
            .unwrap_or_else(|| "never".to_string());
        out.push_str(&format!(
            "{:<user$}  {:<provider$}  {:<status$}  {:<email$}  {:<date$}  {}\n",
            truncate_for_width(&integration.user_id, USER_WIDTH),
            integration.provider.to_string(),
            integration.status.to_string(),
            truncate_for_width(
                integration.provider_email.as_deref().unwrap_or("(unknown)"),
                EMAIL_WIDTH
            ),
            truncate_for_width(&last_read, DATE_WIDTH),
            metadata.last_sync_error.as_deref().unwrap_or("-"),
            user = USER_WIDTH,
            provider = PROVIDER_WIDTH,
            status = STATUS_WIDTH,
            email = EMAIL_WIDTH,
            date = DATE_WIDTH
        ));
    }
    out
}

pub fn format_attachment_page(page: &AttachmentPage) -> String {
    if page.attachments.is_empty() {
        return "No attachments found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<file$}  {:<subject$}  {:<status$}  {:<date$}  {}\n",
        "File",
        "Subject",
        "Job",
        "Received",
        "ID",
        file = FILE_WIDTH,
        subject = SUBJECT_WIDTH,
        status = STATUS_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(FILE_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(DATE_WIDTH),
        "-".repeat(36)
    ));

    for view in &page.attachments {
        let attachment = &view.attachment;
        let received = attachment
            .received_at
            .as_deref()
            .map(relative_date)
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<file$}  {:<subject$}  {:<status$}  {:<date$}  {}\n",
            truncate_for_width(&attachment.file_name, FILE_WIDTH),
            truncate_for_width(
                attachment.subject.as_deref().unwrap_or("(no subject)"),
                SUBJECT_WIDTH
            ),
            view.job_status.to_string(),
            truncate_for_width(&received, DATE_WIDTH),
            attachment.id,
            file = FILE_WIDTH,
            subject = SUBJECT_WIDTH,
            status = STATUS_WIDTH,
            date = DATE_WIDTH
        ));
    }

    let pagination = &page.pagination;
    out.push_str(&format!(
        "\nPage {} of {} ({} attachments)\n",
        pagination.page, pagination.total_pages, pagination.total_attachments
    ));
    out
}

pub fn format_attachment(content: &AttachmentContent) -> String {
    let attachment = &content.view.attachment;
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", attachment.id));
    out.push_str(&format!("File: {}\n", attachment.file_name));
    out.push_str(&format!(
        "Type: {} ({} bytes)\n",
        attachment.mime_type, attachment.size_bytes
    ));
    out.push_str(&format!(
        "Subject: {}\n",
        attachment.subject.as_deref().unwrap_or("(no subject)")
    ));
    out.push_str(&format!(
        "From: {}\n",
        attachment.sender.as_deref().unwrap_or("(unknown)")
    ));
    if let Some(received) = attachment.received_at.as_deref() {
        out.push_str(&format!("Received: {received} ({})\n", relative_date(received)));
    }
    out.push_str(&format!(
        "Provider: {} message {}\n",
        attachment.provider, attachment.provider_message_id
    ));
    out.push_str(&format!(
        "Status: {} (job: {})\n",
        attachment.status, content.view.job_status
    ));
    out.push_str(&format!("Blob: {}\n", attachment.blob_key));
    out.push_str(&format!("Content: {} base64 characters\n", content.content.len()));
    out
}

pub fn format_redirect(redirect: &CallbackRedirect) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", redirect.message));
    if let Some(integration) = &redirect.integration {
        out.push_str(&format!(
            "Integration: {} ({})\n",
            integration.id,
            integration.provider_email.as_deref().unwrap_or("(unknown)")
        ));
    }
    out.push_str(&format!("Redirect: {}\n", redirect.url));
    out
}

fn relative_date(input: &str) -> String {
    let parsed = match DateTime::parse_from_rfc3339(input) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return input.to_string(),
    };

    let delta = Utc::now().signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
