//! Job orchestrator: drives a document through split, extraction, and
//! aggregation while keeping the persisted state machine honest.
//!
//! ## Lifecycle
//!
//! ```text
//! start_job ──▶ split ──▶ Job(pending) ──▶ processing ──▶ completed
//!                  │                            │
//!                  ▼                            ▼
//!           input error                      failed
//!        (no job row created)    (page failures / cancel / aggregation)
//! ```
//!
//! Input problems (unreadable upload, page limit) surface directly from
//! [`JobOrchestrator::start_job`] and never create a job row. Once a job
//! exists, every failure is absorbed into a terminal `failed` status with a
//! message naming each failed page and why.
//!
//! ## Why pages fan out through one shared pool
//!
//! The worker pool is process-wide, so two documents started back to back
//! share the same in-flight cap rather than doubling pressure on the
//! extraction service. A page failure never aborts its siblings: the stream
//! runs every page to its own terminal outcome and only then finalises the
//! job, so a failed job still retains every page result for diagnosis.

use crate::aggregate::{self, AnomalyDetector};
use crate::blob::BlobStore;
use crate::config::PipelineConfig;
use crate::error::DocFieldsError;
use crate::model::{
    Document, DocumentId, DocumentStatus, Job, JobId, JobSnapshot, JobStatus, PageImage,
    PageOutcome,
};
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::split::DocumentSplitter;
use crate::pipeline::worker::{RetryPolicy, WorkerPool};
use crate::status::StatusHub;
use crate::store::{require_job, Store};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Owns the job state machine and the fan-out of page tasks.
pub struct JobOrchestrator {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    hub: Arc<StatusHub>,
    pool: Arc<WorkerPool>,
    client: Arc<dyn ExtractionClient>,
    splitter: Arc<dyn DocumentSplitter>,
    detectors: Arc<Vec<Box<dyn AnomalyDetector>>>,
    config: PipelineConfig,
    /// Cancellation handles for jobs currently driving pages.
    active: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl JobOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        hub: Arc<StatusHub>,
        pool: Arc<WorkerPool>,
        client: Arc<dyn ExtractionClient>,
        splitter: Arc<dyn DocumentSplitter>,
        config: PipelineConfig,
    ) -> Self {
        let detectors = Arc::new(aggregate::default_detectors(config.confidence_threshold));
        Self {
            store,
            blobs,
            hub,
            pool,
            client,
            splitter,
            detectors,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a processing job for an uploaded document.
    ///
    /// Splits the document synchronously (the page count must be known before
    /// the job row exists), persists the job as `pending`, and spawns the
    /// page fan-out. Returns the pending job immediately; progress is
    /// observed through the status hub.
    ///
    /// Fails without creating a job when the document is unknown, already
    /// has an active job, or its bytes cannot be split.
    pub async fn start_job(self: Arc<Self>, document_id: DocumentId) -> Result<Job, DocFieldsError> {
        let document = self
            .store
            .document(document_id)
            .await?
            .ok_or(DocFieldsError::DocumentNotFound { id: document_id })?;

        if let Some(active) = self.store.active_job_for(document_id).await? {
            return Err(DocFieldsError::JobAlreadyActive {
                document: document_id,
                job: active.id,
            });
        }

        let bytes = self.blobs.get(&document.blob).await?;
        let pages = self.splitter.split(bytes, self.config.max_pages).await?;
        let total_pages = pages.len() as u32;

        let job = Job {
            id: Uuid::new_v4(),
            document_id,
            status: JobStatus::Pending,
            pages_processed: 0,
            total_pages,
            started_at: Utc::now(),
            completed_at: None,
            model: self.client.model_id(),
            message: None,
        };
        self.store.put_job(job.clone()).await?;
        self.store
            .set_document_pages(document_id, total_pages, job.id)
            .await?;
        self.hub.publish(JobSnapshot::pending(job.id, total_pages));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.lock_active().insert(job.id, cancel_tx);

        info!(
            "Job {} started for document '{}' ({} pages, model {})",
            job.id, document.filename, total_pages, job.model
        );

        let orchestrator = Arc::clone(&self);
        let spawned = job.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.drive(spawned, pages, cancel_rx).await {
                error!("Job driver failed: {e}");
            }
        });

        Ok(job)
    }

    /// Request cancellation of an active job.
    ///
    /// Cancellation is cooperative: queued pages stop before dispatch,
    /// in-flight calls finish and are discarded, and the job finalises as
    /// `failed` with a cancellation message.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), DocFieldsError> {
        {
            let active = self.lock_active();
            if let Some(tx) = active.get(&job_id) {
                let _ = tx.send(true);
                info!("Job {job_id}: cancellation requested");
                return Ok(());
            }
        }
        // Not active: distinguish "finished" from "never existed".
        let job = require_job(self.store.as_ref(), job_id).await?;
        Err(DocFieldsError::JobNotActive {
            id: job_id,
            status: job.status,
        })
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
        match self.active.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run every page of a job to its terminal outcome, then finalise.
    async fn drive(
        self: Arc<Self>,
        mut job: Job,
        pages: Vec<PageImage>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), DocFieldsError> {
        // pending → processing happens together with the dispatch of the
        // first page; the document row mirrors the job.
        job.status = JobStatus::Processing;
        self.store.put_job(job.clone()).await?;
        self.store
            .set_document_status(job.document_id, DocumentStatus::Processing)
            .await?;
        self.hub.publish(JobSnapshot {
            job_id: job.id,
            status: JobStatus::Processing,
            pages_processed: 0,
            total_pages: job.total_pages,
            message: None,
        });

        let policy = RetryPolicy::from_config(&self.config);
        let call_timeout = Duration::from_secs(self.config.api_timeout_secs);
        // (page number, reason) for every page that ended in a terminal
        // error, collected out of completion order.
        let failures: Mutex<Vec<(u32, String)>> = Mutex::new(Vec::new());

        let this = &*self;
        stream::iter(pages.iter())
            .for_each_concurrent(None, |page| {
                let policy = &policy;
                let failures = &failures;
                let cancel_rx = &cancel_rx;
                let job = &job;
                async move {
                    let result = this
                        .pool
                        .run_page(
                            job.id,
                            &this.client,
                            page,
                            this.config.model.as_deref(),
                            policy,
                            call_timeout,
                            cancel_rx,
                        )
                        .await;

                    // None means the page was cancelled; nothing is recorded
                    // and progress does not advance.
                    let Some(result) = result else { return };

                    if result.outcome == PageOutcome::Error {
                        let reason = result
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("page {}: unknown error", page.page_number));
                        push_failure(failures, page.page_number, reason);
                    }

                    match this.store.record_page_result(result).await {
                        Ok(processed) => this.hub.publish(JobSnapshot {
                            job_id: job.id,
                            status: JobStatus::Processing,
                            pages_processed: processed,
                            total_pages: job.total_pages,
                            message: None,
                        }),
                        Err(e) => {
                            warn!("Job {}: page {} not recorded: {e}", job.id, page.page_number);
                            push_failure(
                                failures,
                                page.page_number,
                                format!("page {}: {e}", page.page_number),
                            );
                        }
                    }
                }
            })
            .await;

        let cancelled = *cancel_rx.borrow();
        let mut failures = match failures.into_inner() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.sort_by_key(|(page, _)| *page);

        self.finalize(job, cancelled, failures).await
    }

    /// Move the job to its terminal state. Runs exactly once per job, after
    /// the page stream has fully drained.
    async fn finalize(
        &self,
        job: Job,
        cancelled: bool,
        failures: Vec<(u32, String)>,
    ) -> Result<(), DocFieldsError> {
        // Reload for the final pages_processed value.
        let mut job = require_job(self.store.as_ref(), job.id).await?;

        let (status, message) = if cancelled {
            (JobStatus::Failed, Some("cancelled".to_string()))
        } else if !failures.is_empty() {
            let reasons: Vec<String> = failures.into_iter().map(|(_, r)| r).collect();
            (JobStatus::Failed, Some(reasons.join("; ")))
        } else {
            match self.aggregate_job(&job).await {
                Ok(()) => (JobStatus::Completed, None),
                Err(e) => {
                    warn!("Job {}: aggregation failed: {e}", job.id);
                    (JobStatus::Failed, Some(e.to_string()))
                }
            }
        };

        job.status = status;
        job.completed_at = Some(Utc::now());
        job.message = message.clone();
        self.store.put_job(job.clone()).await?;

        let doc_status = match status {
            JobStatus::Completed => DocumentStatus::Completed,
            _ => DocumentStatus::Failed,
        };
        self.store
            .set_document_status(job.document_id, doc_status)
            .await?;

        self.lock_active().remove(&job.id);

        self.hub.publish(JobSnapshot {
            job_id: job.id,
            status,
            pages_processed: job.pages_processed,
            total_pages: job.total_pages,
            message,
        });

        // The terminal snapshot stays available for late pollers and
        // subscribers for a retention window, then the channel is evicted;
        // polls fall back to the job row after that.
        let hub = Arc::clone(&self.hub);
        let retention = Duration::from_secs(self.config.status_retention_secs);
        let finished = job.id;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            hub.evict(finished);
        });

        info!(
            "Job {} finished: {} ({}/{} pages)",
            job.id, status, job.pages_processed, job.total_pages
        );
        Ok(())
    }

    /// Aggregate a fully successful job into its combined result.
    async fn aggregate_job(&self, job: &Job) -> Result<(), DocFieldsError> {
        let pages = self.store.page_results(job.id).await?;
        let combined = aggregate::aggregate(
            job,
            &pages,
            &self.detectors,
            self.config.confidence_policy,
        )?;
        self.store.put_combined_result(combined).await
    }
}

fn push_failure(failures: &Mutex<Vec<(u32, String)>>, page: u32, reason: String) {
    let mut guard = match failures.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.push((page, reason));
}

/// Create the document row for an upload and stash its bytes in the blob
/// store. The document starts `Uploaded` with an unknown page count; the
/// count is established by the first job's split.
pub async fn register_document(
    store: &dyn Store,
    blobs: &dyn BlobStore,
    filename: String,
    bytes: Vec<u8>,
) -> Result<Document, DocFieldsError> {
    let byte_size = bytes.len() as u64;
    let blob = blobs.put(bytes).await?;
    let document = Document {
        id: Uuid::new_v4(),
        filename,
        byte_size,
        page_count: None,
        uploaded_at: Utc::now(),
        status: DocumentStatus::Uploaded,
        latest_job: None,
        blob,
    };
    store.put_document(document.clone()).await?;
    info!(
        "Document {} registered: '{}' ({} bytes)",
        document.id, document.filename, byte_size
    );
    Ok(document)
}
