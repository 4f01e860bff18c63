use std::fmt::{self, Display};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::job::{ClaimToken, Job, JobId, JobResult, JobStatus, TagSet, WorkerId};

/// The shared coordination store.
///
/// Every mutating call is a single atomic step with respect to other
/// callers, conditional on the current owner and status of the row. Mutual
/// exclusion between workers rests entirely on that atomicity; no locks are
/// shared outside the store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Pending` job.
    async fn submit(&self, job: Job) -> Result<JobId>;

    /// Atomically take the oldest eligible `Pending` job for `worker_id`.
    ///
    /// Eligible means the job has no tags or shares one with `tags`. Ties on
    /// submission time are broken by submission order. Concurrent callers
    /// never receive the same job.
    async fn claim(
        &self,
        worker_id: &WorkerId,
        tags: &TagSet,
        lease: Duration,
    ) -> Result<Option<Job>>;

    /// Push the lease of the job held by `claim` to `now + lease`.
    ///
    /// Returns `false` without side effects once that claim no longer holds
    /// the job: another worker took it, the same worker claimed it again
    /// under a newer attempt, or it is terminal.
    async fn heartbeat(&self, claim: &ClaimToken, lease: Duration) -> Result<bool>;

    /// Move a claimed job from `Claimed` to `Running`.
    ///
    /// Repeating the call under the same claim returns `true`.
    async fn mark_running(&self, claim: &ClaimToken) -> Result<bool>;

    /// Store the result of a running job and make it terminal.
    ///
    /// Returns `false` when the claim was lost in the meantime; the caller
    /// must then drop its result instead of retrying the write.
    async fn finalize(&self, claim: &ClaimToken, result: JobResult) -> Result<bool>;

    /// Return every owned job whose lease ran out before `now` to `Pending`.
    ///
    /// The returned records are snapshots in the transient `Lost` status and
    /// still name the owner that let the lease lapse. Safe to run from many
    /// nodes at once: each expired job is reclaimed by exactly one caller.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Jobs in FIFO order, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;

    async fn snapshot(&self) -> Result<QueueSnapshot>;
}

/// Supervision records for running workers.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn upsert_worker(&self, record: WorkerRecord) -> Result<()>;

    async fn workers(&self) -> Result<Vec<WorkerRecord>>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Snoozing,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Snoozing => "snoozing",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(WorkerStatus::Starting),
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "snoozing" => Ok(WorkerStatus::Snoozing),
            "stopped" => Ok(WorkerStatus::Stopped),
            other => Err(QueueError::corruption(format!("unknown worker status {other:?}"))),
        }
    }
}

/// What a worker publishes about itself for operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub tags: TagSet,
    pub slots: usize,
    pub busy_slots: usize,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Point-in-time counts for stall detection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Submission time of the oldest job still waiting.
    pub oldest_pending_at: Option<DateTime<Utc>>,
    /// Owned jobs whose lease already ran out and await a reclaim pass.
    pub expired_leases: usize,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            ..Default::default()
        }
    }

    /// Count one job into the snapshot.
    pub fn observe(&mut self, job: &Job) {
        match job.status {
            JobStatus::Pending => {
                self.pending += 1;
                self.oldest_pending_at = Some(match self.oldest_pending_at {
                    Some(at) => at.min(job.submitted_at),
                    None => job.submitted_at,
                });
            }
            JobStatus::Claimed => self.claimed += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Lost => {}
        }
        if job.lease_expired(self.sampled_at) {
            self.expired_leases += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.running + self.succeeded + self.failed
    }
}
