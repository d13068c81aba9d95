//! Persistence collaborator: the relational store behind a narrow trait.
//!
//! The pipeline assumes a relational store with at-least read-your-writes
//! consistency but never commits to an engine; [`Store`] captures exactly the
//! operations the pipeline needs and nothing more. [`MemoryStore`] is the
//! reference implementation used by the CLI and the test suite — constructed
//! per pipeline instance and injected, never a process-global, so tests can
//! build isolated instances per case.
//!
//! The one non-obvious operation is [`Store::record_page_result`]: inserting
//! a page result and bumping the owning job's `pages_processed` counter must
//! be a single atomic step (a transaction in a relational implementation),
//! because page completions race with each other and progress must never be
//! observed to regress.

use crate::error::DocFieldsError;
use crate::model::{
    CombinedResult, Document, DocumentId, DocumentStatus, Export, ExportId, Job, JobId,
    JobStatus, PageResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Narrow persistence interface consumed by the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Documents ────────────────────────────────────────────────────────
    async fn put_document(&self, doc: Document) -> Result<(), DocFieldsError>;
    async fn document(&self, id: DocumentId) -> Result<Option<Document>, DocFieldsError>;
    async fn set_document_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
    ) -> Result<(), DocFieldsError>;
    /// Record the page count and the owning job after the first split.
    async fn set_document_pages(
        &self,
        id: DocumentId,
        page_count: u32,
        latest_job: JobId,
    ) -> Result<(), DocFieldsError>;

    // ── Jobs ─────────────────────────────────────────────────────────────
    async fn put_job(&self, job: Job) -> Result<(), DocFieldsError>;
    async fn job(&self, id: JobId) -> Result<Option<Job>, DocFieldsError>;
    /// The non-terminal job for a document, if one exists. At most one is
    /// active at a time.
    async fn active_job_for(&self, doc: DocumentId) -> Result<Option<Job>, DocFieldsError>;

    // ── Page results ─────────────────────────────────────────────────────
    /// Insert a page result and atomically increment the owning job's
    /// `pages_processed`; returns the new counter value. Rejects duplicate
    /// (job, page number) pairs.
    async fn record_page_result(&self, page: PageResult) -> Result<u32, DocFieldsError>;
    /// All page results for a job, ordered by page number.
    async fn page_results(&self, job: JobId) -> Result<Vec<PageResult>, DocFieldsError>;

    // ── Combined results ─────────────────────────────────────────────────
    async fn put_combined_result(&self, result: CombinedResult) -> Result<(), DocFieldsError>;
    async fn combined_result(&self, job: JobId) -> Result<Option<CombinedResult>, DocFieldsError>;

    // ── Exports ──────────────────────────────────────────────────────────
    async fn put_export(&self, export: Export) -> Result<(), DocFieldsError>;
    async fn export(&self, id: ExportId) -> Result<Option<Export>, DocFieldsError>;
}

// ── In-memory reference implementation ───────────────────────────────────

#[derive(Default)]
struct Tables {
    documents: HashMap<DocumentId, Document>,
    jobs: HashMap<JobId, Job>,
    /// Keyed by (job, page number) so the uniqueness invariant is structural.
    pages: HashMap<(JobId, u32), PageResult>,
    combined: HashMap<JobId, CombinedResult>,
    exports: HashMap<ExportId, Export>,
}

/// In-memory [`Store`] with the same atomicity guarantees a relational
/// implementation would provide via transactions.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> DocFieldsError {
    DocFieldsError::Storage {
        detail: "store lock poisoned".into(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_document(&self, doc: Document) -> Result<(), DocFieldsError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        t.documents.insert(doc.id, doc);
        Ok(())
    }

    async fn document(&self, id: DocumentId) -> Result<Option<Document>, DocFieldsError> {
        let t = self.tables.read().map_err(|_| poisoned())?;
        Ok(t.documents.get(&id).cloned())
    }

    async fn set_document_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
    ) -> Result<(), DocFieldsError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        let doc = t
            .documents
            .get_mut(&id)
            .ok_or(DocFieldsError::DocumentNotFound { id })?;
        doc.status = status;
        Ok(())
    }

    async fn set_document_pages(
        &self,
        id: DocumentId,
        page_count: u32,
        latest_job: JobId,
    ) -> Result<(), DocFieldsError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        let doc = t
            .documents
            .get_mut(&id)
            .ok_or(DocFieldsError::DocumentNotFound { id })?;
        // Page count is immutable after it is first known.
        if doc.page_count.is_none() {
            doc.page_count = Some(page_count);
        }
        doc.latest_job = Some(latest_job);
        Ok(())
    }

    async fn put_job(&self, job: Job) -> Result<(), DocFieldsError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        t.jobs.insert(job.id, job);
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, DocFieldsError> {
        let t = self.tables.read().map_err(|_| poisoned())?;
        Ok(t.jobs.get(&id).cloned())
    }

    async fn active_job_for(&self, doc: DocumentId) -> Result<Option<Job>, DocFieldsError> {
        let t = self.tables.read().map_err(|_| poisoned())?;
        Ok(t.jobs
            .values()
            .find(|j| j.document_id == doc && !j.status.is_terminal())
            .cloned())
    }

    async fn record_page_result(&self, page: PageResult) -> Result<u32, DocFieldsError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        let key = (page.job_id, page.page_number);
        if t.pages.contains_key(&key) {
            return Err(DocFieldsError::Storage {
                detail: format!(
                    "duplicate page result for job {} page {}",
                    page.job_id, page.page_number
                ),
            });
        }
        let job = t
            .jobs
            .get_mut(&page.job_id)
            .ok_or(DocFieldsError::JobNotFound { id: page.job_id })?;
        if job.pages_processed >= job.total_pages {
            return Err(DocFieldsError::Storage {
                detail: format!("job {} already has all pages recorded", page.job_id),
            });
        }
        job.pages_processed += 1;
        let processed = job.pages_processed;
        t.pages.insert(key, page);
        Ok(processed)
    }

    async fn page_results(&self, job: JobId) -> Result<Vec<PageResult>, DocFieldsError> {
        let t = self.tables.read().map_err(|_| poisoned())?;
        let mut pages: Vec<PageResult> = t
            .pages
            .values()
            .filter(|p| p.job_id == job)
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.page_number);
        Ok(pages)
    }

    async fn put_combined_result(&self, result: CombinedResult) -> Result<(), DocFieldsError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        t.combined.insert(result.job_id, result);
        Ok(())
    }

    async fn combined_result(
        &self,
        job: JobId,
    ) -> Result<Option<CombinedResult>, DocFieldsError> {
        let t = self.tables.read().map_err(|_| poisoned())?;
        Ok(t.combined.get(&job).cloned())
    }

    async fn put_export(&self, export: Export) -> Result<(), DocFieldsError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        t.exports.insert(export.id, export);
        Ok(())
    }

    async fn export(&self, id: ExportId) -> Result<Option<Export>, DocFieldsError> {
        let t = self.tables.read().map_err(|_| poisoned())?;
        Ok(t.exports.get(&id).cloned())
    }
}

/// Convenience used by the orchestrator: load a job or fail with `JobNotFound`.
pub async fn require_job(store: &dyn Store, id: JobId) -> Result<Job, DocFieldsError> {
    store
        .job(id)
        .await?
        .ok_or(DocFieldsError::JobNotFound { id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn job(total_pages: u32) -> Job {
        Job {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            status: JobStatus::Processing,
            pages_processed: 0,
            total_pages,
            started_at: Utc::now(),
            completed_at: None,
            model: "test-model".into(),
            message: None,
        }
    }

    fn page(job_id: JobId, n: u32) -> PageResult {
        PageResult {
            job_id,
            page_number: n,
            content: json!({"questions": []}),
            confidence: Some(0.9),
            duration_ms: 5,
            retries: 0,
            outcome: crate::model::PageOutcome::Ok,
            error: None,
        }
    }

    #[tokio::test]
    async fn record_page_result_increments_counter() {
        let store = MemoryStore::new();
        let j = job(3);
        let id = j.id;
        store.put_job(j).await.unwrap();

        assert_eq!(store.record_page_result(page(id, 2)).await.unwrap(), 1);
        assert_eq!(store.record_page_result(page(id, 1)).await.unwrap(), 2);
        assert_eq!(store.record_page_result(page(id, 3)).await.unwrap(), 3);

        let pages = store.page_results(id).await.unwrap();
        let numbers: Vec<u32> = pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3], "results come back in page order");
    }

    #[tokio::test]
    async fn duplicate_page_rejected() {
        let store = MemoryStore::new();
        let j = job(2);
        let id = j.id;
        store.put_job(j).await.unwrap();

        store.record_page_result(page(id, 1)).await.unwrap();
        assert!(store.record_page_result(page(id, 1)).await.is_err());

        let j = store.job(id).await.unwrap().unwrap();
        assert_eq!(j.pages_processed, 1, "failed insert must not bump counter");
    }

    #[tokio::test]
    async fn counter_never_exceeds_total() {
        let store = MemoryStore::new();
        let j = job(1);
        let id = j.id;
        store.put_job(j).await.unwrap();

        store.record_page_result(page(id, 1)).await.unwrap();
        assert!(store.record_page_result(page(id, 2)).await.is_err());
    }

    #[tokio::test]
    async fn active_job_lookup_ignores_terminal() {
        let store = MemoryStore::new();
        let mut j = job(1);
        let doc = j.document_id;
        j.status = JobStatus::Failed;
        store.put_job(j).await.unwrap();
        assert!(store.active_job_for(doc).await.unwrap().is_none());
    }
}
