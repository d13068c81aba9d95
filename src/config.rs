//! Configuration for the document processing pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, serialise them for logging, and
//! diff two runs to understand why their outcomes differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.

use crate::error::DocFieldsError;
use serde::{Deserialize, Serialize};

/// How the document-level confidence is derived from entry confidences.
///
/// The upstream formula is underspecified, so this is a policy knob rather
/// than a hard invariant. Entries without a confidence are excluded from
/// the computation, not treated as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidencePolicy {
    /// Arithmetic mean of entry-level confidences (default).
    #[default]
    Mean,
    /// Minimum entry-level confidence; pessimistic, useful when a single
    /// unreliable field should drag the whole document down.
    Minimum,
}

/// Configuration for a processing pipeline instance.
///
/// # Example
/// ```rust
/// use docfields::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(4)
///     .max_pages(20)
///     .model("gpt-4.1")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of simultaneous in-flight extraction calls,
    /// shared across all jobs. Default: 8.
    ///
    /// The cap is system-wide, not per document, so total pressure on the
    /// external service stays bounded no matter how many jobs run at once.
    /// Lower it if the service rate-limits aggressively.
    pub concurrency: usize,

    /// Page-count ceiling enforced at split time. Default: 50.
    ///
    /// Bounds memory and per-document cost; a document above the ceiling is
    /// rejected before any job is created.
    pub max_pages: u32,

    /// Rendering DPI used when rasterising pages. Range: 72–400. Default: 150.
    ///
    /// 150 DPI keeps text sharp enough for a vision model while staying well
    /// below typical API upload limits. Increase for small-font scans.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels.
    /// Default: 2000. A safety cap independent of DPI so an oversized page
    /// cannot exhaust memory.
    pub max_rendered_pixels: u32,

    /// Extraction model identifier passed to the service as a hint.
    /// If None, the client's provider default is used.
    pub model: Option<String>,

    /// Per extraction call timeout in seconds. Default: 60.
    ///
    /// Timeouts are per call, never per job; a job has no aggregate
    /// wall-clock limit in-pipeline.
    pub api_timeout_secs: u64,

    /// Maximum retries for transient failures (timeout, rate limit,
    /// 5xx service errors). Default: 3.
    pub max_retries: u32,

    /// Retries allowed for unparseable responses before treating the page
    /// as failed. Default: 1 — transient parsing issues from
    /// non-deterministic generation are common, persistent ones are not.
    pub invalid_response_retries: u32,

    /// Base retry delay in milliseconds (exponential backoff). Default: 2000.
    ///
    /// Doubles after each attempt and is capped by [`Self::retry_cap_ms`];
    /// jitter is added on top to avoid thundering-herd retries from
    /// concurrent pages.
    pub retry_base_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds. Default: 30000.
    pub retry_cap_ms: u64,

    /// Entries with a confidence below this threshold are flagged by the
    /// built-in low-confidence detector. Default: 0.80.
    pub confidence_threshold: f64,

    /// Document-level confidence derivation. Default: [`ConfidencePolicy::Mean`].
    pub confidence_policy: ConfidencePolicy,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// How long a finished job's status channel stays in the hub before it
    /// is evicted, in seconds. Default: 300.
    ///
    /// Eviction bounds hub memory in long-running hosts; polls keep working
    /// afterwards through the persisted job row, only push subscriptions
    /// stop being available.
    pub status_retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_pages: 50,
            dpi: 150,
            max_rendered_pixels: 2000,
            model: None,
            api_timeout_secs: 60,
            max_retries: 3,
            invalid_response_retries: 1,
            retry_base_ms: 2_000,
            retry_cap_ms: 30_000,
            confidence_threshold: 0.80,
            confidence_policy: ConfidencePolicy::Mean,
            download_timeout_secs: 120,
            status_retention_secs: 300,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_pages(mut self, n: u32) -> Self {
        self.config.max_pages = n.max(1);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn invalid_response_retries(mut self, n: u32) -> Self {
        self.config.invalid_response_retries = n;
        self
    }

    pub fn retry_base_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_ms = ms;
        self
    }

    pub fn retry_cap_ms(mut self, ms: u64) -> Self {
        self.config.retry_cap_ms = ms;
        self
    }

    pub fn confidence_threshold(mut self, t: f64) -> Self {
        self.config.confidence_threshold = t;
        self
    }

    pub fn confidence_policy(mut self, p: ConfidencePolicy) -> Self {
        self.config.confidence_policy = p;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn status_retention_secs(mut self, secs: u64) -> Self {
        self.config.status_retention_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DocFieldsError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(DocFieldsError::InvalidConfig(
                "concurrency must be ≥ 1".into(),
            ));
        }
        if c.dpi < 72 || c.dpi > 400 {
            return Err(DocFieldsError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return Err(DocFieldsError::InvalidConfig(format!(
                "confidence threshold must be within 0.0–1.0, got {}",
                c.confidence_threshold
            )));
        }
        if c.retry_cap_ms < c.retry_base_ms {
            return Err(DocFieldsError::InvalidConfig(
                "retry cap must be ≥ retry base".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = PipelineConfig::builder().build().unwrap();
        assert_eq!(c.concurrency, 8);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.api_timeout_secs, 60);
        assert!((c.confidence_threshold - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrency_floor_is_one() {
        let c = PipelineConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut c = PipelineConfig::default();
        c.confidence_threshold = 1.5;
        let err = PipelineConfigBuilder { config: c }.build();
        assert!(err.is_err());
    }

    #[test]
    fn retry_cap_below_base_rejected() {
        let err = PipelineConfig::builder()
            .retry_base_ms(5_000)
            .retry_cap_ms(1_000)
            .build();
        assert!(err.is_err());
    }
}
