//! Worker pool: bounded-concurrency execution of extraction tasks.
//!
//! One pool is constructed at process start and shared by every job, so the
//! number of simultaneous in-flight calls to the external service is capped
//! system-wide, not per document. The permit is held only while a call is in
//! flight — a page sleeping through retry backoff releases its slot so other
//! pages (and other jobs) keep moving.
//!
//! ## Retry policy
//!
//! Retry counters live in an explicit [`RetryState`] advanced by the task
//! loop, never in nested recursive calls, so cancellation and tests can
//! intercept at any retry boundary:
//!
//! * `Timeout` / `RateLimited` / 5xx `ServiceError` — transient; retried up
//!   to `max_retries` times with exponential backoff (base 2 s, capped at
//!   30 s) plus jitter to avoid thundering-herd retries under concurrency.
//! * 4xx `ServiceError` — terminal immediately; the request itself is wrong
//!   and retrying cannot help.
//! * `InvalidResponse` — retried once (non-deterministic generation produces
//!   transient parse failures), then terminal.
//!
//! A page that exhausts its retries is recorded as a failed [`PageResult`]
//! with confidence zero; sibling pages are never aborted (bulkhead).

use crate::config::PipelineConfig;
use crate::error::ExtractionError;
use crate::model::{JobId, PageImage, PageOutcome, PageResult};
use crate::pipeline::extract::{page_confidence, ExtractionClient};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

// ── Retry policy ─────────────────────────────────────────────────────────

/// Backoff and retry bounds, derived from [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub invalid_response_retries: u32,
    pub base_delay_ms: u64,
    pub cap_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            invalid_response_retries: config.invalid_response_retries,
            base_delay_ms: config.retry_base_ms,
            cap_delay_ms: config.retry_cap_ms,
        }
    }

    /// Delay before the `retry`-th retry (1-based): `base * 2^(retry-1)`,
    /// capped, plus up to 25% uniform jitter.
    fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)));
        let capped = exp.min(self.cap_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=(capped / 4).max(1));
        Duration::from_millis(capped + jitter)
    }
}

/// Per-task retry counters, advanced explicitly by the scheduler loop.
#[derive(Debug, Default, Clone, Copy)]
struct RetryState {
    transient: u32,
    invalid: u32,
}

impl RetryState {
    fn total(&self) -> u32 {
        self.transient + self.invalid
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RetryDecision {
    RetryTransient,
    RetryInvalid,
    Terminal,
}

/// Pure classification of a failed call, given the retries already used.
fn classify(err: &ExtractionError, state: RetryState, policy: &RetryPolicy) -> RetryDecision {
    match err {
        ExtractionError::Timeout { .. } | ExtractionError::RateLimited => {
            if state.transient < policy.max_retries {
                RetryDecision::RetryTransient
            } else {
                RetryDecision::Terminal
            }
        }
        ExtractionError::ServiceError { code, .. } => {
            if *code >= 500 && state.transient < policy.max_retries {
                RetryDecision::RetryTransient
            } else {
                RetryDecision::Terminal
            }
        }
        ExtractionError::InvalidResponse { .. } => {
            if state.invalid < policy.invalid_response_retries {
                RetryDecision::RetryInvalid
            } else {
                RetryDecision::Terminal
            }
        }
    }
}

// ── Worker pool ──────────────────────────────────────────────────────────

/// Long-lived, process-wide executor for extraction tasks.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        let limit = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Maximum number of simultaneous in-flight extraction calls.
    pub fn concurrency(&self) -> usize {
        self.limit
    }

    /// Run one page task to its terminal outcome.
    ///
    /// Returns `None` when the job was cancelled: not-yet-dispatched pages
    /// stop before acquiring a slot, and an in-flight call is allowed to
    /// finish but its result is discarded so upstream call accounting stays
    /// intact.
    pub async fn run_page(
        &self,
        job_id: JobId,
        client: &Arc<dyn ExtractionClient>,
        page: &PageImage,
        model_hint: Option<&str>,
        policy: &RetryPolicy,
        call_timeout: Duration,
        cancelled: &watch::Receiver<bool>,
    ) -> Option<PageResult> {
        let start = Instant::now();
        let mut state = RetryState::default();
        let mut cancel_rx = cancelled.clone();

        loop {
            if *cancel_rx.borrow() {
                debug!("Page {}: cancelled before dispatch", page.page_number);
                return None;
            }

            // Wait for a slot, bailing out if the job is cancelled meanwhile.
            let permit = tokio::select! {
                p = self.permits.acquire() => match p {
                    Ok(p) => p,
                    Err(_) => return None, // pool shut down
                },
                _ = cancel_rx.changed() => {
                    debug!("Page {}: cancelled while queued", page.page_number);
                    return None;
                }
            };

            let call = timeout(call_timeout, client.extract(page, model_hint)).await;
            drop(permit);

            let outcome = match call {
                Ok(result) => result,
                Err(_elapsed) => Err(ExtractionError::Timeout {
                    secs: call_timeout.as_secs(),
                }),
            };

            // An in-flight call finishes even under cancellation; only its
            // result is discarded.
            if *cancel_rx.borrow() {
                debug!("Page {}: cancelled in flight, result discarded", page.page_number);
                return None;
            }

            match outcome {
                Ok(raw) => {
                    let confidence = page_confidence(&raw.content);
                    debug!(
                        "Page {}: extracted after {} retries",
                        page.page_number,
                        state.total()
                    );
                    return Some(PageResult {
                        job_id,
                        page_number: page.page_number,
                        content: raw.content,
                        confidence,
                        duration_ms: start.elapsed().as_millis() as u64,
                        retries: state.total(),
                        outcome: PageOutcome::Ok,
                        error: None,
                    });
                }
                Err(err) => match classify(&err, state, policy) {
                    RetryDecision::Terminal => {
                        warn!(
                            "Page {}: terminal failure after {} retries — {}",
                            page.page_number,
                            state.total(),
                            err
                        );
                        return Some(PageResult {
                            job_id,
                            page_number: page.page_number,
                            content: serde_json::Value::Null,
                            confidence: Some(0.0),
                            duration_ms: start.elapsed().as_millis() as u64,
                            retries: state.total(),
                            outcome: PageOutcome::Error,
                            error: Some(format!("page {}: {}", page.page_number, err)),
                        });
                    }
                    decision => {
                        match decision {
                            RetryDecision::RetryInvalid => state.invalid += 1,
                            _ => state.transient += 1,
                        }
                        let delay = policy.backoff(state.total());
                        warn!(
                            "Page {}: retry {} after {:?} — {}",
                            page.page_number,
                            state.total(),
                            delay,
                            err
                        );
                        // Backoff holds no pool slot. Wake early on cancel so
                        // the next loop iteration observes it.
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = cancel_rx.changed() => {}
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            invalid_response_retries: 1,
            base_delay_ms: 2_000,
            cap_delay_ms: 30_000,
        }
    }

    #[test]
    fn timeout_retries_up_to_bound() {
        let p = policy();
        let err = ExtractionError::Timeout { secs: 60 };
        let mut state = RetryState::default();
        for _ in 0..3 {
            assert_eq!(classify(&err, state, &p), RetryDecision::RetryTransient);
            state.transient += 1;
        }
        assert_eq!(classify(&err, state, &p), RetryDecision::Terminal);
    }

    #[test]
    fn client_errors_never_retried() {
        let err = ExtractionError::ServiceError {
            code: 400,
            detail: "bad request".into(),
        };
        assert_eq!(
            classify(&err, RetryState::default(), &policy()),
            RetryDecision::Terminal
        );
    }

    #[test]
    fn server_errors_are_transient() {
        let err = ExtractionError::ServiceError {
            code: 503,
            detail: "unavailable".into(),
        };
        assert_eq!(
            classify(&err, RetryState::default(), &policy()),
            RetryDecision::RetryTransient
        );
    }

    #[test]
    fn invalid_response_retried_once() {
        let p = policy();
        let err = ExtractionError::InvalidResponse {
            detail: "not json".into(),
        };
        let mut state = RetryState::default();
        assert_eq!(classify(&err, state, &p), RetryDecision::RetryInvalid);
        state.invalid += 1;
        assert_eq!(classify(&err, state, &p), RetryDecision::Terminal);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        // Jitter is ≤ 25%, so check lower bounds and the cap.
        assert!(p.backoff(1) >= Duration::from_millis(2_000));
        assert!(p.backoff(2) >= Duration::from_millis(4_000));
        assert!(p.backoff(3) >= Duration::from_millis(8_000));
        // 2s * 2^9 would be 1024s; must be capped at 30s (+25% jitter).
        assert!(p.backoff(10) <= Duration::from_millis(37_500));
    }
}
