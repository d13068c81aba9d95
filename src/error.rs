//! Error types for the docfields library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocFieldsError`] — **Fatal**: the operation cannot proceed at all
//!   (unreadable upload, unknown job id, export requested before the job
//!   completed). Returned as `Err(DocFieldsError)` from the service surface.
//!
//! * [`ExtractionError`] — **Per-call**: one extraction call against the
//!   external vision service failed. Never propagated upward directly; the
//!   worker pool consumes it to drive the retry policy, and a page that
//!   exhausts its retries is recorded as a [`crate::model::PageResult`] with
//!   outcome `Error` so sibling pages are unaffected.
//!
//! The separation means a caller of the pipeline never sees a transient
//! service hiccup — only the job's final status, with each terminal page
//! failure attributable to a page number and reason.

use crate::model::{ExportId, JobId, JobStatus};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All fatal errors returned by the docfields library.
///
/// Per-call extraction failures use [`ExtractionError`] and are absorbed by
/// the retry policy rather than propagated here.
#[derive(Debug, Error)]
pub enum DocFieldsError {
    // ── Input errors (job never created) ─────────────────────────────────
    /// The uploaded bytes are not a recognised page-based document.
    #[error("Unsupported document format: {detail}")]
    UnsupportedFormat { detail: String },

    /// The document has more pages than the configured ceiling.
    #[error("Document has {pages} pages, exceeding the limit of {limit}")]
    PageLimitExceeded { pages: u32, limit: u32 },

    /// The document is recognised but its pages cannot be rasterised.
    #[error("Corrupt document: {detail}")]
    CorruptInput { detail: String },

    /// Input file was not found at the given path.
    #[error("File not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Entity lookups ────────────────────────────────────────────────────
    /// No document with the given id.
    #[error("Document not found: {id}")]
    DocumentNotFound { id: Uuid },

    /// No job with the given id.
    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    /// A document may have at most one active job at a time.
    #[error("Document {document} already has an active job ({job})")]
    JobAlreadyActive { document: Uuid, job: JobId },

    /// The job reached a terminal state; the requested operation no longer applies.
    #[error("Job {id} is already terminal ({status})")]
    JobNotActive { id: JobId, status: JobStatus },

    /// The operation requires a completed job (results or export requested too early).
    #[error("Job {id} is not completed (status: {status})")]
    JobNotCompleted { id: JobId, status: JobStatus },

    /// No export with the given id.
    #[error("Export not found: {id}")]
    ExportNotFound { id: ExportId },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// Aggregation failed for a job whose pages all succeeded.
    ///
    /// Should not occur if the pipeline invariants hold; the orchestrator
    /// marks the job failed rather than producing a partial combined result.
    #[error("Aggregation failed for job {job}: {detail}")]
    Aggregation { job: JobId, detail: String },

    /// The vision provider could not be constructed (missing API key etc.).
    #[error("Extraction provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// The blob store has no object for the given handle.
    #[error("Blob not found for handle '{handle}'")]
    BlobNotFound { handle: String },

    /// The backing store rejected an operation.
    #[error("Storage error: {detail}")]
    Storage { detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A typed failure from one extraction call against the external service.
///
/// The client performs no retries itself; classification into retryable and
/// terminal failures is the worker pool's responsibility (see
/// [`crate::pipeline::worker`]).
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ExtractionError {
    /// The call exceeded the caller-supplied timeout.
    #[error("extraction call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The service returned HTTP 429 or an equivalent throttling signal.
    #[error("extraction service rate-limited the call")]
    RateLimited,

    /// The service returned an error with an HTTP-like status code.
    /// 4xx codes are terminal; 5xx codes are treated as transient.
    #[error("extraction service error (code {code}): {detail}")]
    ServiceError { code: u16, detail: String },

    /// The service replied, but the reply does not parse into the expected
    /// structured schema. Common with non-deterministic generation; retried
    /// once before being treated as terminal.
    #[error("extraction service returned an unparseable response: {detail}")]
    InvalidResponse { detail: String },
}
