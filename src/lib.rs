//! # docfields
//!
//! Turn scanned multi-page documents into structured field data using vision
//! language models.
//!
//! An uploaded document is split into per-page images, each page is sent to
//! an external multimodal extraction service under a bounded-concurrency
//! worker pool with retries, and the per-page results are aggregated into a
//! single combined result with anomaly flags and an exportable spreadsheet.
//!
//! ## Pipeline
//!
//! ```text
//! upload ─▶ split ─▶ ┌─ page 1 ─▶ extract ─┐
//!                    ├─ page 2 ─▶ extract ─┼─▶ aggregate ─▶ export
//!                    └─ page N ─▶ extract ─┘
//!                         (shared worker pool, retries)
//! ```
//!
//! Progress is observable while the job runs: poll [`DocumentPipeline::job_status`]
//! or subscribe to push updates via [`DocumentPipeline::subscribe`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use docfields::{DocumentPipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .concurrency(4)
//!         .model("gpt-4.1")
//!         .build()?;
//!     let pipeline = DocumentPipeline::new(config)?;
//!
//!     let bytes = std::fs::read("scan.pdf")?;
//!     let document = pipeline.upload_document("scan.pdf", bytes).await?;
//!     let job = pipeline.start_job(document.id).await?;
//!
//!     let (_current, mut updates) = pipeline.subscribe(job.id)?;
//!     while let Ok(snapshot) = updates.recv().await {
//!         println!("{}/{} pages", snapshot.pages_processed, snapshot.total_pages);
//!         if snapshot.status.is_terminal() {
//!             break;
//!         }
//!     }
//!
//!     let export = pipeline.generate_export(job.id).await?;
//!     let (_meta, csv) = pipeline.fetch_export(export.id).await?;
//!     std::fs::write(&export.filename, csv)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Embedding
//!
//! Hosts with their own database and object store implement
//! [`store::Store`] and [`blob::BlobStore`] and construct the pipeline with
//! [`DocumentPipeline::with_parts`]; the in-memory implementations exist for
//! the CLI and tests.

pub mod aggregate;
pub mod blob;
pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod service;
pub mod status;
pub mod store;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::{ConfidencePolicy, PipelineConfig, PipelineConfigBuilder};
pub use error::{DocFieldsError, ExtractionError};
pub use model::{
    Anomaly, CombinedResult, Document, DocumentId, DocumentStatus, Export, ExportId, FieldEntry,
    Job, JobId, JobSnapshot, JobStatus, PageImage, PageOutcome, PageResult,
};
pub use pipeline::extract::{ExtractionClient, RawExtraction, VisionExtractionClient};
pub use pipeline::split::{DocumentSplitter, PdfiumSplitter};
pub use service::DocumentPipeline;
pub use store::{MemoryStore, Store};
