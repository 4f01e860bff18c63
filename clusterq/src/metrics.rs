//! Prometheus metrics for clusterq workers and submitters.
//!
//! Compiled only with the `metrics` feature. Every helper here has a
//! feature-independent wrapper in [`crate::telemetry`]; call those instead.
//!
//! ## Counters
//! - `clusterq_jobs_submitted_total` - jobs accepted by an orchestrator
//! - `clusterq_jobs_claimed_total` - successful claims, per worker
//! - `clusterq_jobs_finalized_total` - terminal writes, per status
//! - `clusterq_leases_lost_total` - abandoned executions, per worker
//! - `clusterq_jobs_reclaimed_total` - expired leases returned to pending
//!
//! ## Gauges
//! - `clusterq_busy_slots` - occupied execution slots, per worker
//!
//! ## Histograms
//! - `clusterq_job_duration_seconds` - payload wall time, per status
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry,
};
use std::sync::LazyLock;

/// Registry holding every clusterq metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_SUBMITTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("clusterq_jobs_submitted_total", "Total number of jobs submitted")
        .expect("clusterq_jobs_submitted_total metric creation failed")
});

/// Labels: `worker`.
pub static JOBS_CLAIMED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("clusterq_jobs_claimed_total", "Total number of successful claims");
    CounterVec::new(opts, &["worker"]).expect("clusterq_jobs_claimed_total metric creation failed")
});

/// Labels: `status` (`succeeded` or `failed`).
pub static JOBS_FINALIZED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "clusterq_jobs_finalized_total",
        "Total number of jobs driven to a terminal status",
    );
    CounterVec::new(opts, &["status"])
        .expect("clusterq_jobs_finalized_total metric creation failed")
});

/// Labels: `worker`.
pub static LEASES_LOST_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "clusterq_leases_lost_total",
        "Total number of executions abandoned after losing ownership",
    );
    CounterVec::new(opts, &["worker"]).expect("clusterq_leases_lost_total metric creation failed")
});

pub static JOBS_RECLAIMED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "clusterq_jobs_reclaimed_total",
        "Total number of expired leases returned to pending",
    )
    .expect("clusterq_jobs_reclaimed_total metric creation failed")
});

/// Labels: `worker`.
pub static BUSY_SLOTS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("clusterq_busy_slots", "Execution slots currently occupied");
    GaugeVec::new(opts, &["worker"]).expect("clusterq_busy_slots metric creation failed")
});

/// Labels: `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 18).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "clusterq_job_duration_seconds",
        "Payload wall time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("clusterq_job_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_CLAIMED_TOTAL.clone()),
        Box::new(JOBS_FINALIZED_TOTAL.clone()),
        Box::new(LEASES_LOST_TOTAL.clone()),
        Box::new(JOBS_RECLAIMED_TOTAL.clone()),
        Box::new(BUSY_SLOTS.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
}

pub fn record_job_claimed(worker: &str) {
    JOBS_CLAIMED_TOTAL.with_label_values(&[worker]).inc();
}

pub fn record_job_finalized(status: &str) {
    JOBS_FINALIZED_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_lease_lost(worker: &str) {
    LEASES_LOST_TOTAL.with_label_values(&[worker]).inc();
}

pub fn record_jobs_reclaimed(count: usize) {
    JOBS_RECLAIMED_TOTAL.inc_by(count as u64);
}

pub fn set_busy_slots(worker: &str, busy: usize) {
    BUSY_SLOTS.with_label_values(&[worker]).set(busy as f64);
}

pub fn observe_job_duration(status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// All registered metrics in the Prometheus text format.
pub fn gather_text() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
