use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::Result;
use crate::job::{ClaimToken, Job, JobId, WorkerId};
use crate::lease::LeaseConfig;
use crate::queue::JobStore;
use crate::runtime::cancel::CancelToken;
use crate::telemetry;

/// Keeps the leases of one worker's claims alive.
///
/// Each tracked claim carries an abandon token. A heartbeat that comes back
/// `false` fires the token and the claim is dropped from tracking; transient
/// store errors leave it tracked so the next tick tries again. At most one
/// claim per job is tracked: tracking a newer attempt abandons the older one.
pub struct LeaseManager<S> {
    store: Arc<S>,
    worker_id: WorkerId,
    lease: LeaseConfig,
    reclaim_interval: Option<Duration>,
    tracked: Mutex<HashMap<JobId, Tracked>>,
}

struct Tracked {
    claim: ClaimToken,
    abandon: CancelToken,
}

impl<S: JobStore> LeaseManager<S> {
    pub fn new(store: Arc<S>, worker_id: WorkerId, lease: LeaseConfig) -> Self {
        Self {
            store,
            worker_id,
            lease,
            reclaim_interval: None,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Also run reclaim passes from [`LeaseManager::run`].
    pub fn with_reclaim_interval(mut self, interval: Option<Duration>) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn lease(&self) -> &LeaseConfig {
        &self.lease
    }

    /// Start renewing the lease of `claim`; the token fires if it is lost.
    pub fn track(&self, claim: ClaimToken) -> CancelToken {
        let mut tracked = self.tracked.lock();
        if let Some(current) = tracked.get(&claim.job_id) {
            if current.claim == claim {
                return current.abandon.clone();
            }
        }
        let abandon = CancelToken::new();
        let previous = tracked.insert(
            claim.job_id,
            Tracked {
                claim: claim.clone(),
                abandon: abandon.clone(),
            },
        );
        drop(tracked);
        if let Some(stale) = previous {
            warn!(stale = %stale.claim, current = %claim, "job claimed again, abandoning older attempt");
            telemetry::record_lease_lost(stale.claim.job_id, &stale.claim.worker_id);
            stale.abandon.cancel();
        }
        abandon
    }

    /// Stop renewing `claim`. A newer claim of the same job stays tracked.
    pub fn release(&self, claim: &ClaimToken) {
        let mut tracked = self.tracked.lock();
        if tracked.get(&claim.job_id).is_some_and(|t| t.claim == *claim) {
            tracked.remove(&claim.job_id);
        }
    }

    pub fn tracked(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Heartbeat every tracked job once. Returns how many were lost.
    pub async fn renew_all(&self) -> usize {
        let claims: Vec<ClaimToken> = self
            .tracked
            .lock()
            .values()
            .map(|t| t.claim.clone())
            .collect();
        if claims.is_empty() {
            return 0;
        }

        let span = telemetry::heartbeat_span(&self.worker_id, claims.len());
        async move {
            let mut lost = 0;
            for claim in claims {
                match self.store.heartbeat(&claim, self.lease.duration()).await {
                    Ok(true) => debug!(claim = %claim, "lease renewed"),
                    Ok(false) => {
                        if self.abandon(&claim) {
                            telemetry::record_lease_lost(claim.job_id, &self.worker_id);
                            lost += 1;
                        }
                    }
                    Err(err) if err.is_transient() => {
                        warn!(claim = %claim, error = %err, "heartbeat failed, will retry");
                    }
                    Err(err) => {
                        error!(claim = %claim, error = %err, "heartbeat rejected, abandoning job");
                        if self.abandon(&claim) {
                            lost += 1;
                        }
                    }
                }
            }
            lost
        }
        .instrument(span)
        .await
    }

    fn abandon(&self, claim: &ClaimToken) -> bool {
        let mut tracked = self.tracked.lock();
        if !tracked.get(&claim.job_id).is_some_and(|t| t.claim == *claim) {
            return false;
        }
        if let Some(t) = tracked.remove(&claim.job_id) {
            t.abandon.cancel();
        }
        true
    }

    /// One reclaim pass on behalf of this worker.
    pub async fn reclaim_expired(&self) -> Result<Vec<Job>> {
        reclaim_pass(self.store.as_ref(), self.worker_id.as_str()).await
    }

    /// Renew on every heartbeat tick until `stop` fires.
    pub async fn run(&self, stop: CancelToken) {
        let mut heartbeat = tokio::time::interval(self.lease.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reclaim = self.reclaim_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(worker_id = %self.worker_id, "lease loop stopping");
                    break;
                }
                _ = heartbeat.tick() => {
                    self.renew_all().await;
                }
                _ = tick_optional(&mut reclaim) => {
                    if let Err(err) = self.reclaim_expired().await {
                        warn!(error = %err, "reclaim pass failed");
                    }
                }
            }
        }
    }
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn reclaim_pass<S: JobStore + ?Sized>(store: &S, node: &str) -> Result<Vec<Job>> {
    let span = telemetry::reclaim_span(node);
    async move {
        let reclaimed = store.reclaim_expired(Utc::now()).await?;
        for job in &reclaimed {
            info!(
                job_id = %job.id,
                previous_owner = ?job.owner.as_ref().map(WorkerId::as_str),
                attempts = job.attempts,
                "job reclaimed"
            );
        }
        telemetry::record_jobs_reclaimed(reclaimed.len());
        Ok(reclaimed)
    }
    .instrument(span)
    .await
}

/// Standalone reclaim loop for deployments that keep reclaim out of workers.
pub struct Reclaimer<S> {
    store: Arc<S>,
    interval: Duration,
    node: String,
}

impl<S: JobStore> Reclaimer<S> {
    pub fn new(store: Arc<S>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            node: "reclaimer".to_string(),
        }
    }

    /// Name used in logs for this reclaimer instance.
    pub fn with_node_name(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub async fn pass(&self) -> Result<Vec<Job>> {
        reclaim_pass(self.store.as_ref(), &self.node).await
    }

    pub async fn run(&self, stop: CancelToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node = %self.node, interval_ms = self.interval.as_millis() as u64, "reclaimer started");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.pass().await {
                        warn!(node = %self.node, error = %err, "reclaim pass failed");
                    }
                }
            }
        }
        info!(node = %self.node, "reclaimer stopped");
    }
}
