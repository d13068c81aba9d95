//! Status hub: poll and push access to job progress.
//!
//! The hub holds the latest [`JobSnapshot`] per job and fans every update out
//! to subscribers over a `tokio::sync::broadcast` channel. Consumers that
//! poll read the cached snapshot; consumers that subscribe get the current
//! snapshot replayed immediately and then live updates, so a late subscriber
//! never waits for the next page to learn where the job stands.
//!
//! Entries do not live forever: the owner evicts a job's channel some time
//! after its terminal snapshot ([`StatusHub::evict`]), so hub memory stays
//! bounded no matter how many jobs a long-running host churns through.
//!
//! ## Monotonicity
//!
//! Page completions land concurrently, so two snapshot publishes can race.
//! The hub enforces the externally observable ordering instead of trusting
//! callers: `pages_processed` never regresses, and once a terminal snapshot
//! (completed or failed) is stored, later non-terminal publishes are dropped.

use crate::error::DocFieldsError;
use crate::model::{JobId, JobSnapshot};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered updates per subscriber. A slow consumer that falls more than
/// this far behind sees `RecvError::Lagged` and should re-poll.
const CHANNEL_CAPACITY: usize = 64;

struct JobChannel {
    latest: JobSnapshot,
    tx: broadcast::Sender<JobSnapshot>,
}

/// Shared registry of live and recently finished job snapshots.
#[derive(Default)]
pub struct StatusHub {
    jobs: RwLock<HashMap<JobId, JobChannel>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store and broadcast a snapshot, subject to the monotonic guard.
    ///
    /// Out-of-order publishes (stale progress, non-terminal after terminal)
    /// are silently dropped; the caller does not need to serialise its
    /// completions.
    pub fn publish(&self, snapshot: JobSnapshot) {
        let mut jobs = match self.jobs.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        match jobs.get_mut(&snapshot.job_id) {
            Some(channel) => {
                if channel.latest.status.is_terminal() {
                    debug!("Job {}: snapshot after terminal state dropped", snapshot.job_id);
                    return;
                }
                if !snapshot.status.is_terminal()
                    && snapshot.pages_processed < channel.latest.pages_processed
                {
                    debug!(
                        "Job {}: stale snapshot dropped ({} < {})",
                        snapshot.job_id, snapshot.pages_processed, channel.latest.pages_processed
                    );
                    return;
                }
                channel.latest = snapshot.clone();
                // Send fails only when no subscriber is listening.
                let _ = channel.tx.send(snapshot);
            }
            None => {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                let _ = tx.send(snapshot.clone());
                jobs.insert(snapshot.job_id, JobChannel { latest: snapshot, tx });
            }
        }
    }

    /// Latest known snapshot for a job (poll path).
    pub fn snapshot(&self, job_id: JobId) -> Result<JobSnapshot, DocFieldsError> {
        let jobs = match self.jobs.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        jobs.get(&job_id)
            .map(|c| c.latest.clone())
            .ok_or(DocFieldsError::JobNotFound { id: job_id })
    }

    /// Drop a finished job's channel to bound hub memory.
    ///
    /// Only terminal entries are evicted; an active job keeps its channel so
    /// subscribers are never cut off mid-run. Returns whether an entry was
    /// removed. Polls for an evicted job are answered from the persisted job
    /// row by the caller's fallback.
    pub fn evict(&self, job_id: JobId) -> bool {
        let mut jobs = match self.jobs.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let terminal = jobs
            .get(&job_id)
            .map(|channel| channel.latest.status.is_terminal())
            .unwrap_or(false);
        if !terminal {
            return false;
        }
        jobs.remove(&job_id);
        debug!("Job {job_id}: status channel evicted");
        true
    }

    /// Subscribe to a job's updates (push path).
    ///
    /// Returns the current snapshot for immediate replay plus a receiver for
    /// everything published after this call.
    pub fn subscribe(
        &self,
        job_id: JobId,
    ) -> Result<(JobSnapshot, broadcast::Receiver<JobSnapshot>), DocFieldsError> {
        let jobs = match self.jobs.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let channel = jobs
            .get(&job_id)
            .ok_or(DocFieldsError::JobNotFound { id: job_id })?;
        Ok((channel.latest.clone(), channel.tx.subscribe()))
    }
}
