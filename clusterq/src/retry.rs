use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::job::{ClaimToken, Job, JobId, JobResult, JobStatus, TagSet, WorkerId};
use crate::queue::{JobStore, QueueSnapshot, WorkerRecord, WorkerRegistry};

/// Backoff policy for transient store failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Ratio of jitter to add to delays (0.0 - 1.0).
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_backoff_ms: 5_000,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = compute_backoff_delay(attempt, self.base_delay_ms, self.max_backoff_ms);
        with_jitter(base, self.jitter_ratio)
    }
}

/// Exponential backoff: `min(base * 2^(attempt-1), max)`, zero for attempt 0.
pub fn compute_backoff_delay(attempt: u32, base_delay_ms: u64, max_backoff_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exp = attempt.saturating_sub(1).min(62) as i32;
    let scaled = (base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(max_backoff_ms as f64).max(0.0);

    Duration::from_millis(capped as u64)
}

/// Add up to `ratio * delay` of random extra delay.
pub fn with_jitter(delay: Duration, ratio: f32) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0) as f64;
    if ratio == 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..=ratio);
    delay + delay.mul_f64(extra)
}

/// Run `op`, retrying while it fails with a transient error.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "store call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Decorates a store so that every call rides out brief outages.
///
/// A retried `claim` whose first attempt landed but whose reply was lost
/// leaves a job claimed by this worker without it knowing; the lease then
/// runs out and the job is reclaimed.
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl<S: JobStore> JobStore for RetryingStore<S> {
    async fn submit(&self, job: Job) -> Result<JobId> {
        retry_transient(&self.config, "submit", || self.inner.submit(job.clone())).await
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        tags: &TagSet,
        lease: chrono::Duration,
    ) -> Result<Option<Job>> {
        retry_transient(&self.config, "claim", || self.inner.claim(worker_id, tags, lease)).await
    }

    async fn heartbeat(&self, claim: &ClaimToken, lease: chrono::Duration) -> Result<bool> {
        retry_transient(&self.config, "heartbeat", || self.inner.heartbeat(claim, lease)).await
    }

    async fn mark_running(&self, claim: &ClaimToken) -> Result<bool> {
        retry_transient(&self.config, "mark_running", || self.inner.mark_running(claim)).await
    }

    async fn finalize(&self, claim: &ClaimToken, result: JobResult) -> Result<bool> {
        retry_transient(&self.config, "finalize", || {
            self.inner.finalize(claim, result.clone())
        })
        .await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        retry_transient(&self.config, "reclaim_expired", || self.inner.reclaim_expired(now)).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        retry_transient(&self.config, "get", || self.inner.get(job_id)).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        retry_transient(&self.config, "list", || self.inner.list(status, limit)).await
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        retry_transient(&self.config, "snapshot", || self.inner.snapshot()).await
    }
}

#[async_trait]
impl<S: WorkerRegistry> WorkerRegistry for RetryingStore<S> {
    async fn upsert_worker(&self, record: WorkerRecord) -> Result<()> {
        retry_transient(&self.config, "upsert_worker", || {
            self.inner.upsert_worker(record.clone())
        })
        .await
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        retry_transient(&self.config, "workers", || self.inner.workers()).await
    }
}
