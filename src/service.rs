//! Service façade: the one type a host application talks to.
//!
//! [`DocumentPipeline`] wires the collaborators together — store, blob
//! store, splitter, extraction client, worker pool, status hub — and exposes
//! the operations of the system as plain async methods: upload, start,
//! observe, fetch results, export, cancel.
//!
//! Construction comes in two flavours: [`DocumentPipeline::new`] resolves
//! everything from the environment (pdfium renderer, vision provider from
//! API keys, in-memory storage) and suits the CLI; [`DocumentPipeline::with_parts`]
//! takes every collaborator injected and is how a host embeds the pipeline
//! over its own database and object store — and how the test suite runs the
//! whole machine with synthetic pages and a scripted extraction service.

use crate::blob::{BlobStore, MemoryBlobStore};
use crate::config::PipelineConfig;
use crate::error::DocFieldsError;
use crate::export::ExportGenerator;
use crate::model::{
    CombinedResult, Document, DocumentId, Export, ExportId, Job, JobId, JobSnapshot, PageResult,
};
use crate::orchestrator::{register_document, JobOrchestrator};
use crate::pipeline::extract::{ExtractionClient, VisionExtractionClient};
use crate::pipeline::input;
use crate::pipeline::split::{DocumentSplitter, PdfiumSplitter};
use crate::pipeline::worker::WorkerPool;
use crate::status::StatusHub;
use crate::store::{require_job, MemoryStore, Store};
use std::sync::Arc;
use tokio::sync::broadcast;

/// End-to-end document processing pipeline.
pub struct DocumentPipeline {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    hub: Arc<StatusHub>,
    orchestrator: Arc<JobOrchestrator>,
    exports: ExportGenerator,
    config: PipelineConfig,
}

impl DocumentPipeline {
    /// Build a pipeline from the environment: pdfium rendering, a vision
    /// provider resolved from API keys, and in-memory storage.
    pub fn new(config: PipelineConfig) -> Result<Self, DocFieldsError> {
        let client = VisionExtractionClient::from_env(&config)?;
        let splitter = PdfiumSplitter::new(config.dpi, config.max_rendered_pixels);
        Ok(Self::with_parts(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(splitter),
            Arc::new(client),
        ))
    }

    /// Build a pipeline over injected collaborators.
    pub fn with_parts(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        splitter: Arc<dyn DocumentSplitter>,
        client: Arc<dyn ExtractionClient>,
    ) -> Self {
        let hub = Arc::new(StatusHub::new());
        let pool = Arc::new(WorkerPool::new(config.concurrency));
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&hub),
            pool,
            client,
            splitter,
            config.clone(),
        ));
        let exports = ExportGenerator::new(Arc::clone(&store), Arc::clone(&blobs));
        Self {
            store,
            blobs,
            hub,
            orchestrator,
            exports,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Register an upload: stash the raw bytes and create the document row.
    pub async fn upload_document(
        &self,
        filename: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Document, DocFieldsError> {
        register_document(self.store.as_ref(), self.blobs.as_ref(), filename.into(), bytes).await
    }

    /// Register a document from a local path or HTTP(S) URL.
    pub async fn upload_from_input(&self, input: &str) -> Result<Document, DocFieldsError> {
        let bytes = input::resolve_input(input, self.config.download_timeout_secs).await?;
        let filename = input::derive_filename(input);
        self.upload_document(filename, bytes).await
    }

    pub async fn document(&self, id: DocumentId) -> Result<Document, DocFieldsError> {
        self.store
            .document(id)
            .await?
            .ok_or(DocFieldsError::DocumentNotFound { id })
    }

    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Start processing a document. Returns the pending job; progress is
    /// observed via [`Self::job_status`] or [`Self::subscribe`].
    pub async fn start_job(&self, document_id: DocumentId) -> Result<Job, DocFieldsError> {
        Arc::clone(&self.orchestrator).start_job(document_id).await
    }

    /// Latest status snapshot for a job (poll path).
    ///
    /// Falls back to the persisted job row when the hub has no entry, so a
    /// job finished before a process restart still answers.
    pub async fn job_status(&self, job_id: JobId) -> Result<JobSnapshot, DocFieldsError> {
        match self.hub.snapshot(job_id) {
            Ok(snapshot) => Ok(snapshot),
            Err(DocFieldsError::JobNotFound { .. }) => {
                let job = require_job(self.store.as_ref(), job_id).await?;
                Ok(JobSnapshot {
                    job_id: job.id,
                    status: job.status,
                    pages_processed: job.pages_processed,
                    total_pages: job.total_pages,
                    message: job.message,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Subscribe to live status updates (push path). The current snapshot is
    /// returned for immediate replay.
    pub fn subscribe(
        &self,
        job_id: JobId,
    ) -> Result<(JobSnapshot, broadcast::Receiver<JobSnapshot>), DocFieldsError> {
        self.hub.subscribe(job_id)
    }

    /// Page results (in page order) plus the combined result, present only
    /// when the job completed.
    pub async fn job_results(
        &self,
        job_id: JobId,
    ) -> Result<(Vec<PageResult>, Option<CombinedResult>), DocFieldsError> {
        require_job(self.store.as_ref(), job_id).await?;
        let pages = self.store.page_results(job_id).await?;
        let combined = self.store.combined_result(job_id).await?;
        Ok((pages, combined))
    }

    /// Request cooperative cancellation of an active job.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), DocFieldsError> {
        self.orchestrator.cancel_job(job_id).await
    }

    // ── Exports ──────────────────────────────────────────────────────────

    /// Generate a fresh spreadsheet export for a completed job.
    pub async fn generate_export(&self, job_id: JobId) -> Result<Export, DocFieldsError> {
        self.exports.generate(job_id).await
    }

    /// Retrieve a previously generated export and its bytes.
    pub async fn fetch_export(
        &self,
        export_id: ExportId,
    ) -> Result<(Export, Vec<u8>), DocFieldsError> {
        self.exports.fetch(export_id).await
    }
}
