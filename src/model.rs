//! Core data model: documents, jobs, page results, combined results,
//! anomalies, and exports.
//!
//! These are the records the pipeline persists through the
//! [`crate::store::Store`] collaborator. Mutation rules are deliberately
//! narrow: a [`Document`]'s filename and page count are fixed after creation,
//! a [`Job`] is never mutated once terminal, and [`PageResult`] /
//! [`CombinedResult`] / [`Export`] rows are immutable from the moment they
//! are written. Reprocessing always creates a fresh [`Job`] rather than
//! reopening an old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Identifier of an uploaded document.
pub type DocumentId = Uuid;
/// Identifier of one processing attempt over a document.
pub type JobId = Uuid;
/// Identifier of a generated export artifact.
pub type ExportId = Uuid;

// ── Statuses ─────────────────────────────────────────────────────────────

/// Lifecycle of an uploaded document. Mirrors the owning job's status, except
/// that a document with no jobs yet is `Uploaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

/// Lifecycle of a processing job. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states are final; a new processing attempt creates a new job.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Entities ─────────────────────────────────────────────────────────────

/// An uploaded multi-page document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    /// Original filename as uploaded; immutable after creation.
    pub filename: String,
    /// Raw upload size in bytes.
    pub byte_size: u64,
    /// Page count, set once after the first successful split.
    pub page_count: Option<u32>,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
    /// The most recent job, if any. Superseded jobs are retained for history.
    pub latest_job: Option<JobId>,
    /// Handle of the raw bytes in the blob store.
    pub blob: String,
}

/// One processing attempt over a document's pages.
///
/// `pages_processed` never exceeds `total_pages`; both counters are advanced
/// only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub document_id: DocumentId,
    pub status: JobStatus,
    pub pages_processed: u32,
    pub total_pages: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Identifier of the extraction model used, for audit.
    pub model: String,
    /// Human-readable outcome; on failure it names each failed page and why.
    pub message: Option<String>,
}

/// How a page's extraction terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageOutcome {
    Ok,
    Error,
}

/// The structured outcome of extracting one page. Immutable once written;
/// at most one per (job, page number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub job_id: JobId,
    /// 1-based page number, unique within the job.
    pub page_number: u32,
    /// Opaque key/value tree returned by the extraction service. Validated
    /// only at the aggregation boundary.
    pub content: Value,
    /// Page-level confidence as reported by the service, if any.
    /// Zero for pages that exhausted their retries.
    pub confidence: Option<f64>,
    pub duration_ms: u64,
    /// Extra attempts consumed beyond the first call.
    pub retries: u32,
    pub outcome: PageOutcome,
    /// Reason for a terminal failure, naming the page.
    pub error: Option<String>,
}

/// One extracted question/answer entry, validated out of a page's opaque
/// content tree at aggregation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub question: String,
    pub answer: String,
    /// Entry-level confidence in `0.0..=1.0`, if the service reported one.
    pub confidence: Option<f64>,
    /// Source page the entry was extracted from (1-based).
    pub page: u32,
}

/// A flagged answer entry suspected of low reliability.
///
/// The id is a UUIDv5 derived from (job, detector, entry index), so
/// re-running aggregation over the same inputs reproduces it byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub job_id: JobId,
    /// Index of the flagged entry within the combined entry list.
    pub entry_index: usize,
    /// Name of the detector that produced the flag.
    pub detector: String,
    pub score: f64,
    /// Mutable by a user-facing collaborator, never by the pipeline.
    pub dismissed: bool,
}

/// The merged, document-level view assembled from all page results.
///
/// Exists if and only if the owning job completed. Derived and immutable;
/// aggregation over the same page set reproduces it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub job_id: JobId,
    /// Sentinel page number `0` denoting "whole document".
    pub page_number: u32,
    /// All entries in page order, each tagged with its source page.
    pub entries: Vec<FieldEntry>,
    /// Arithmetic mean of entry-level confidences by default (policy knob);
    /// `0.0` when no entry carries a confidence.
    pub overall_confidence: f64,
    pub anomalies: Vec<Anomaly>,
}

/// A generated spreadsheet artifact. Created on demand, never mutated;
/// regeneration produces a new record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub id: ExportId,
    pub job_id: JobId,
    pub filename: String,
    /// Storage location handle in the blob store.
    pub blob: String,
    pub created_at: DateTime<Utc>,
}

// ── Pipeline-internal values ─────────────────────────────────────────────

/// One rasterised page image, ready for extraction.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based page number.
    pub page_number: u32,
    /// PNG-encoded image bytes.
    pub png: Vec<u8>,
}

/// The latest known status tuple for a job, shared by poll and push paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub pages_processed: u32,
    pub total_pages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobSnapshot {
    /// Snapshot for a freshly created job.
    pub fn pending(job_id: JobId, total_pages: u32) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            pages_processed: 0,
            total_pages,
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serialises_lowercase() {
        let s = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(s, "\"processing\"");
    }

    #[test]
    fn snapshot_message_omitted_when_none() {
        let snap = JobSnapshot::pending(Uuid::nil(), 3);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(!json.contains("message"));
        assert!(json.contains("\"total_pages\":3"));
    }
}
