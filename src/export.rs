//! Export generation: render a completed job's combined result as a
//! spreadsheet artifact.
//!
//! Exports are created on demand and never mutated; regenerating produces a
//! fresh [`Export`] row and a fresh blob, leaving earlier artifacts valid for
//! anyone still holding their id. The rendered bytes are derived purely from
//! the combined result, so regenerating over an unchanged job produces
//! identical content under a new name.
//!
//! The artifact is CSV: one row per extracted field entry, with the source
//! page, the entry confidence, and the names of any anomaly detectors that
//! flagged it. CSV opens in every spreadsheet tool and diffs cleanly, which
//! matters more here than native workbook styling.

use crate::blob::BlobStore;
use crate::error::DocFieldsError;
use crate::model::{CombinedResult, Export, ExportId, JobId, JobStatus};
use crate::store::{require_job, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const CSV_HEADER: &str = "question,answer,page,confidence,anomaly";

/// Renders and stores spreadsheet artifacts for completed jobs.
pub struct ExportGenerator {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
}

impl ExportGenerator {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Generate a new export for a completed job.
    ///
    /// Fails with [`DocFieldsError::JobNotCompleted`] while the job is still
    /// pending, processing, or failed.
    pub async fn generate(&self, job_id: JobId) -> Result<Export, DocFieldsError> {
        let job = require_job(self.store.as_ref(), job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(DocFieldsError::JobNotCompleted {
                id: job_id,
                status: job.status,
            });
        }
        let combined = self
            .store
            .combined_result(job_id)
            .await?
            .ok_or(DocFieldsError::JobNotCompleted {
                id: job_id,
                status: job.status,
            })?;

        let document = self
            .store
            .document(job.document_id)
            .await?
            .ok_or(DocFieldsError::DocumentNotFound {
                id: job.document_id,
            })?;

        let created_at = Utc::now();
        let filename = format!(
            "{}_fields_{}.csv",
            file_stem(&document.filename),
            created_at.format("%Y%m%d_%H%M%S")
        );

        let csv = render_csv(&combined);
        let blob = self.blobs.put(csv.into_bytes()).await?;

        let export = Export {
            id: Uuid::new_v4(),
            job_id,
            filename,
            blob,
            created_at,
        };
        self.store.put_export(export.clone()).await?;
        info!(
            "Export {} generated for job {}: '{}' ({} entries)",
            export.id,
            job_id,
            export.filename,
            combined.entries.len()
        );
        Ok(export)
    }

    /// Retrieve a previously generated export and its rendered bytes.
    pub async fn fetch(&self, export_id: ExportId) -> Result<(Export, Vec<u8>), DocFieldsError> {
        let export = self
            .store
            .export(export_id)
            .await?
            .ok_or(DocFieldsError::ExportNotFound { id: export_id })?;
        let bytes = self.blobs.get(&export.blob).await?;
        Ok((export, bytes))
    }
}

/// Render the combined result as CSV. A job with zero entries still renders
/// the header row, so the artifact is well-formed rather than empty.
pub fn render_csv(combined: &CombinedResult) -> String {
    // entry index → detector names, in detector-insertion order.
    let mut flags: HashMap<usize, Vec<&str>> = HashMap::new();
    for anomaly in &combined.anomalies {
        flags
            .entry(anomaly.entry_index)
            .or_default()
            .push(anomaly.detector.as_str());
    }

    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for (index, entry) in combined.entries.iter().enumerate() {
        let confidence = entry
            .confidence
            .map(|c| format!("{c:.2}"))
            .unwrap_or_default();
        let anomaly = flags
            .get(&index)
            .map(|names| names.join("|"))
            .unwrap_or_default();
        out.push_str(&csv_field(&entry.question));
        out.push(',');
        out.push_str(&csv_field(&entry.answer));
        out.push(',');
        out.push_str(&entry.page.to_string());
        out.push(',');
        out.push_str(&confidence);
        out.push(',');
        out.push_str(&anomaly);
        out.push('\n');
    }
    out
}

/// Quote a CSV field per RFC 4180: wrap in quotes when it contains a comma,
/// quote, or line break, doubling embedded quotes.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn file_stem(filename: &str) -> &str {
    std::path::Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
}
