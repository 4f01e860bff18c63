//! Tracing spans and lifecycle events for clusterq.
//!
//! The span constructors give every claim, execution, heartbeat and reclaim
//! pass a consistent set of fields. The `record_*` helpers log the event and,
//! with the `metrics` feature, also update the Prometheus series, so callers
//! never need their own `cfg` blocks.

use std::future::Future;
use std::time::Instant;

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

use crate::job::{JobId, JobStatus, WorkerId};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` when the variable is unset or invalid.
///
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// Span around one claim attempt.
#[must_use]
pub fn claim_span(worker_id: &WorkerId) -> Span {
    info_span!("clusterq.claim", worker_id = %worker_id)
}

/// Span around the whole execution of one claimed job.
#[must_use]
pub fn execute_span(job_id: JobId, worker_id: &WorkerId, attempt: u32) -> Span {
    info_span!(
        "clusterq.execute",
        job_id = %job_id,
        worker_id = %worker_id,
        attempt = attempt,
    )
}

#[must_use]
pub fn heartbeat_span(worker_id: &WorkerId, leases: usize) -> Span {
    info_span!("clusterq.heartbeat", worker_id = %worker_id, leases = leases)
}

#[must_use]
pub fn reclaim_span(node: &str) -> Span {
    info_span!("clusterq.reclaim", node = %node)
}

#[must_use]
pub fn submit_span(count: usize) -> Span {
    info_span!("clusterq.submit", count = count)
}

/// Attach an execution span to `future`.
pub fn instrument_execution<F>(
    job_id: JobId,
    worker_id: &WorkerId,
    attempt: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(execute_span(job_id, worker_id, attempt))
}

pub fn record_job_submitted(job_id: JobId) {
    tracing::info!(job_id = %job_id, "job submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted();
}

pub fn record_job_claimed(job_id: JobId, worker_id: &WorkerId, attempt: u32) {
    tracing::info!(
        job_id = %job_id,
        worker_id = %worker_id,
        attempt = attempt,
        "job claimed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_claimed(worker_id.as_str());
}

pub fn record_job_finalized(job_id: JobId, status: JobStatus, exit_code: Option<i32>) {
    tracing::info!(
        job_id = %job_id,
        status = %status,
        exit_code = ?exit_code,
        "job finalized"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finalized(status.as_str());
}

/// A worker stopped working on a job it no longer owns.
pub fn record_lease_lost(job_id: JobId, worker_id: &WorkerId) {
    tracing::warn!(
        job_id = %job_id,
        worker_id = %worker_id,
        "ownership lost, execution abandoned"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_lost(worker_id.as_str());
}

pub fn record_jobs_reclaimed(count: usize) {
    if count > 0 {
        tracing::warn!(count = count, "expired leases reclaimed");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_reclaimed(count);
}

pub fn set_busy_slots(worker_id: &WorkerId, busy: usize) {
    tracing::debug!(worker_id = %worker_id, busy = busy, "busy slots updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_busy_slots(worker_id.as_str(), busy);
}

/// Start timing a payload; finish with [`record_job_end`].
pub fn record_job_start(job_id: JobId) -> JobTimingHandle {
    JobTimingHandle {
        job_id,
        start: Instant::now(),
    }
}

pub fn record_job_end(handle: JobTimingHandle, status: JobStatus) {
    let duration_secs = handle.elapsed().as_secs_f64();
    tracing::debug!(
        job_id = %handle.job_id,
        status = %status,
        duration_secs = duration_secs,
        "payload finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(status.as_str(), duration_secs);
}

/// Returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: JobId,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
