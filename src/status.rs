use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::db::models::Document;

/// Ingestion state of an attachment as tracked by this crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Pending,
    Processing,
    Success,
    Completed,
    Failed,
}

impl Display for IngestionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Success => write!(f, "success"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for IngestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid ingestion status: {other}")),
        }
    }
}

/// Review state of a downstream document. Statuses this crate does not know
/// about are carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewStatus {
    Pending,
    Processing,
    Approved,
    Rejected,
    Failed,
    Other(String),
}

impl ReviewStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Other(raw) => raw,
        }
    }
}

impl Display for ReviewStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ReviewStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReviewStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Composite status shown for an ingested attachment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Processed,
    Approved,
    Failed,
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Approved => write!(f, "approved"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Derive the job status from the ingestion status and the review statuses
/// of the active (non-deleted) child documents.
pub fn derive_job_status(ingestion: IngestionStatus, children: &[ReviewStatus]) -> JobStatus {
    match ingestion {
        IngestionStatus::Pending => return JobStatus::Pending,
        IngestionStatus::Processing => return JobStatus::Processing,
        IngestionStatus::Failed => return JobStatus::Failed,
        IngestionStatus::Success | IngestionStatus::Completed => {}
    }

    if children.is_empty() {
        return JobStatus::Processed;
    }

    if children.iter().any(|s| *s == ReviewStatus::Failed) {
        return JobStatus::Failed;
    }

    if children
        .iter()
        .all(|s| matches!(s, ReviewStatus::Approved | ReviewStatus::Rejected))
    {
        return JobStatus::Approved;
    }

    // Anything still pending/processing needs review, which reads as processed.
    JobStatus::Processed
}

/// Same as [`derive_job_status`] but takes whole documents, ignoring deleted ones.
pub fn derive_for_documents(ingestion: IngestionStatus, documents: &[Document]) -> JobStatus {
    let active = documents
        .iter()
        .filter(|document| document.deleted_at.is_none())
        .map(|document| document.status.clone())
        .collect::<Vec<_>>();
    derive_job_status(ingestion, &active)
}
