//! Command-line interface for the docfields pipeline.
//!
//! Runs the whole pipeline in-process over in-memory storage: upload a PDF
//! (path or URL), watch per-page progress, and write the resulting CSV
//! export next to you. `inspect` reports page counts without spending any
//! extraction calls.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docfields::{DocumentPipeline, DocumentSplitter, JobStatus, PdfiumSplitter, PipelineConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "docfields",
    version,
    about = "Extract structured field data from scanned documents using vision language models"
)]
struct Cli {
    /// Verbose logging (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a document and write its field data as CSV
    Extract {
        /// Path or HTTP(S) URL of the PDF document
        input: String,

        /// Output directory for the CSV export (default: current directory)
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Extraction model identifier (default: provider default)
        #[arg(short, long)]
        model: Option<String>,

        /// Maximum simultaneous extraction calls
        #[arg(short, long, default_value_t = 8)]
        concurrency: usize,

        /// Page-count ceiling; larger documents are rejected
        #[arg(long, default_value_t = 50)]
        max_pages: u32,

        /// Rendering DPI (72-400)
        #[arg(long, default_value_t = 150)]
        dpi: u32,

        /// Per-call timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Report a document's page count without processing it
    Inspect {
        /// Path or HTTP(S) URL of the PDF document
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Extract {
            input,
            output,
            model,
            concurrency,
            max_pages,
            dpi,
            timeout,
        } => {
            extract(
                &input, &output, model, concurrency, max_pages, dpi, timeout,
            )
            .await
        }
        Command::Inspect { input } => inspect(&input).await,
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "docfields=info",
        2 => "docfields=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[allow(clippy::too_many_arguments)]
async fn extract(
    input: &str,
    output: &std::path::Path,
    model: Option<String>,
    concurrency: usize,
    max_pages: u32,
    dpi: u32,
    timeout: u64,
) -> Result<()> {
    let mut builder = PipelineConfig::builder()
        .concurrency(concurrency)
        .max_pages(max_pages)
        .dpi(dpi)
        .api_timeout_secs(timeout);
    if let Some(model) = model {
        builder = builder.model(model);
    }
    let config = builder.build()?;

    let pipeline = DocumentPipeline::new(config)?;
    let document = pipeline.upload_from_input(input).await?;
    let job = pipeline.start_job(document.id).await?;
    eprintln!(
        "Processing '{}' ({} pages, model {})",
        document.filename, job.total_pages, job.model
    );

    let (current, mut updates) = pipeline.subscribe(job.id)?;
    let bar = ProgressBar::new(job.total_pages as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} pages ({elapsed})")
            .context("progress bar template")?,
    );
    bar.set_position(current.pages_processed as u64);

    let mut final_snapshot = current;
    while !final_snapshot.status.is_terminal() {
        match updates.recv().await {
            Ok(snapshot) => {
                bar.set_position(snapshot.pages_processed as u64);
                final_snapshot = snapshot;
            }
            // Lagged or closed: fall back to polling the final status.
            Err(_) => final_snapshot = pipeline.job_status(job.id).await?,
        }
    }
    bar.finish_and_clear();

    if final_snapshot.status != JobStatus::Completed {
        bail!(
            "job failed: {}",
            final_snapshot.message.unwrap_or_else(|| "unknown".into())
        );
    }

    let (_pages, combined) = pipeline.job_results(job.id).await?;
    let combined = combined.context("completed job has no combined result")?;
    eprintln!(
        "Extracted {} fields (confidence {:.2}, {} anomalies)",
        combined.entries.len(),
        combined.overall_confidence,
        combined.anomalies.len()
    );
    for anomaly in &combined.anomalies {
        if let Some(entry) = combined.entries.get(anomaly.entry_index) {
            eprintln!(
                "  ⚠ {} flagged '{}' (score {:.2})",
                anomaly.detector, entry.question, anomaly.score
            );
        }
    }

    let export = pipeline.generate_export(job.id).await?;
    let (_meta, csv) = pipeline.fetch_export(export.id).await?;
    let path = output.join(&export.filename);
    tokio::fs::write(&path, csv)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    println!("{}", path.display());
    Ok(())
}

async fn inspect(input: &str) -> Result<()> {
    let config = PipelineConfig::default();
    let bytes = docfields::pipeline::input::resolve_input(input, config.download_timeout_secs)
        .await?;
    let splitter = PdfiumSplitter::new(config.dpi, config.max_rendered_pixels);
    let pages = splitter.page_count(bytes.clone()).await?;
    println!("input:  {input}");
    println!("size:   {} bytes", bytes.len());
    println!("pages:  {pages}");
    Ok(())
}
