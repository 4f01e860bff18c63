use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::artifact::ArtifactStore;
use crate::config::{ExecConfig, WorkerConfig};
use crate::error::Result;
use crate::job::{ClaimToken, Job, TagSet, WorkerId};
use crate::queue::{JobStore, WorkerRecord, WorkerRegistry, WorkerStatus};
use crate::retry::compute_backoff_delay;
use crate::runtime::cancel::CancelToken;
use crate::runtime::lease_manager::LeaseManager;
use crate::runtime::slot::{ExecutionSlot, SlotOutcome};
use crate::telemetry;

/// Fixed set of execution slots.
///
/// Slots are handed out as guards that give the slot back when dropped, so
/// the free count stays right however a slot task ends.
#[derive(Debug)]
pub struct SlotPool {
    capacity: usize,
    free: Mutex<BTreeSet<usize>>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            free: Mutex::new((0..capacity).collect()),
        })
    }

    /// Take the lowest free slot, if any.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let index = self.free.lock().pop_first()?;
        Some(SlotGuard {
            pool: Arc::clone(self),
            index,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free(&self) -> usize {
        self.free.lock().len()
    }

    pub fn busy(&self) -> usize {
        self.capacity - self.free()
    }
}

/// An occupied slot; released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    index: usize,
}

impl SlotGuard {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.free.lock().insert(self.index);
    }
}

/// A long-lived worker: one poll loop, one lease loop and up to `slots`
/// running payloads.
pub struct WorkerAgent<S, A> {
    config: WorkerConfig,
    tags: TagSet,
    store: Arc<S>,
    artifacts: Arc<A>,
    exec: ExecConfig,
}

impl<S, A> WorkerAgent<S, A>
where
    S: JobStore + WorkerRegistry + 'static,
    A: ArtifactStore + 'static,
{
    pub fn new(config: WorkerConfig, store: Arc<S>, artifacts: Arc<A>) -> Result<Self> {
        config.validate()?;
        let tags = config.tag_set()?;
        Ok(Self {
            config,
            tags,
            store,
            artifacts,
            exec: ExecConfig::default(),
        })
    }

    pub fn with_exec(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Start the agent on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancelToken::new();
        let worker_id = self.config.worker_id.clone();
        let pool = SlotPool::new(self.config.slots);
        let task = tokio::spawn(self.run(shutdown.clone(), Arc::clone(&pool)));
        WorkerHandle {
            worker_id,
            shutdown,
            pool,
            task,
        }
    }

    /// Run until `shutdown` fires, then drain running slots.
    pub async fn run_until(self, shutdown: CancelToken) -> anyhow::Result<()> {
        let pool = SlotPool::new(self.config.slots);
        self.run(shutdown, pool).await;
        Ok(())
    }

    async fn run(self, shutdown: CancelToken, pool: Arc<SlotPool>) {
        let started_at = Utc::now();
        let worker_id = self.config.worker_id.clone();
        let lease = self.config.lease();
        let leases = Arc::new(
            LeaseManager::new(Arc::clone(&self.store), worker_id.clone(), lease)
                .with_reclaim_interval(self.config.reclaim_interval()),
        );
        let slot = ExecutionSlot::new(
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
            self.exec.clone(),
            worker_id.clone(),
        );

        let mut registry = Registration::new(&self, started_at);
        registry.publish(WorkerStatus::Starting, 0, true).await;

        let lease_stop = CancelToken::new();
        let lease_task = {
            let leases = Arc::clone(&leases);
            let stop = lease_stop.clone();
            tokio::spawn(async move { leases.run(stop).await })
        };

        info!(
            worker_id = %worker_id,
            tags = %self.tags,
            slots = self.config.slots,
            lease_ms = lease.duration_ms,
            "worker started"
        );

        let mut slots: JoinSet<SlotOutcome> = JoinSet::new();
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            while let Some(joined) = slots.try_join_next() {
                log_slot_exit(&worker_id, joined);
            }

            let mut claim_error = false;
            while let Some(guard) = pool.try_acquire() {
                match self.claim_one(&worker_id).await {
                    Ok(Some(job)) => {
                        let claim = ClaimToken::new(job.id, worker_id.clone(), job.attempts);
                        let abandon = leases.track(claim.clone());
                        let slot = slot.clone();
                        let leases = Arc::clone(&leases);
                        debug!(job_id = %job.id, slot = guard.index(), "dispatching job");
                        slots.spawn(async move {
                            let _guard = guard;
                            let outcome = slot.execute(job, abandon).await;
                            leases.release(&claim);
                            outcome
                        });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(worker_id = %worker_id, error = %err, "claim failed");
                        claim_error = true;
                        break;
                    }
                }
            }

            let busy = pool.busy();
            telemetry::set_busy_slots(&worker_id, busy);
            let (status, delay) = if claim_error {
                failures = failures.saturating_add(1);
                let delay = compute_backoff_delay(
                    failures,
                    self.config.poll_interval_ms,
                    self.config.max_poll_backoff_ms,
                );
                (WorkerStatus::Snoozing, delay)
            } else {
                failures = 0;
                let status = if busy == 0 {
                    WorkerStatus::Idle
                } else {
                    WorkerStatus::Busy
                };
                (status, self.config.poll_interval())
            };
            registry.publish(status, busy, false).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                Some(joined) = slots.join_next(), if !slots.is_empty() => {
                    log_slot_exit(&worker_id, joined);
                }
            }
        }

        info!(worker_id = %worker_id, running = slots.len(), "worker draining");
        drain(&mut slots, &worker_id, self.config.drain_timeout()).await;

        lease_stop.cancel();
        if let Err(err) = lease_task.await {
            error!(worker_id = %worker_id, error = %err, "lease loop panicked");
        }
        registry.publish(WorkerStatus::Stopped, 0, true).await;
        info!(worker_id = %worker_id, "worker stopped");
    }

    async fn claim_one(&self, worker_id: &WorkerId) -> Result<Option<Job>> {
        let span = telemetry::claim_span(worker_id);
        let claimed = self
            .store
            .claim(worker_id, &self.tags, self.config.lease().duration())
            .instrument(span)
            .await?;
        if let Some(job) = &claimed {
            telemetry::record_job_claimed(job.id, worker_id, job.attempts);
        }
        Ok(claimed)
    }
}

async fn drain(slots: &mut JoinSet<SlotOutcome>, worker_id: &WorkerId, timeout: Duration) {
    let drained = tokio::time::timeout(timeout, async {
        while let Some(joined) = slots.join_next().await {
            log_slot_exit(worker_id, joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            worker_id = %worker_id,
            running = slots.len(),
            "drain timed out, killing payloads; their leases will lapse"
        );
        slots.abort_all();
        while slots.join_next().await.is_some() {}
    }
}

fn log_slot_exit(worker_id: &WorkerId, joined: std::result::Result<SlotOutcome, JoinError>) {
    match joined {
        Ok(outcome) => debug!(worker_id = %worker_id, outcome = ?outcome, "slot finished"),
        Err(err) if err.is_cancelled() => {}
        Err(err) => error!(worker_id = %worker_id, error = %err, "slot task panicked"),
    }
}

/// Best-effort publication of the worker record.
struct Registration<S> {
    store: Arc<S>,
    record: WorkerRecord,
    last_published: Option<DateTime<Utc>>,
    refresh: chrono::Duration,
}

impl<S: WorkerRegistry> Registration<S> {
    fn new<A>(agent: &WorkerAgent<S, A>, started_at: DateTime<Utc>) -> Self {
        Self {
            store: Arc::clone(&agent.store),
            record: WorkerRecord {
                worker_id: agent.config.worker_id.clone(),
                tags: agent.tags.clone(),
                slots: agent.config.slots,
                busy_slots: 0,
                status: WorkerStatus::Starting,
                started_at,
                last_seen: started_at,
            },
            last_published: None,
            refresh: agent.config.lease().duration(),
        }
    }

    /// Write the record when it changed or went stale.
    async fn publish(&mut self, status: WorkerStatus, busy: usize, force: bool) {
        let now = Utc::now();
        let changed = self.record.status != status || self.record.busy_slots != busy;
        let stale = self
            .last_published
            .map(|at| now - at >= self.refresh)
            .unwrap_or(true);
        if !(force || changed || stale) {
            return;
        }

        self.record.status = status;
        self.record.busy_slots = busy;
        self.record.last_seen = now;
        match self.store.upsert_worker(self.record.clone()).await {
            Ok(()) => self.last_published = Some(now),
            Err(err) => debug!(
                worker_id = %self.record.worker_id,
                error = %err,
                "worker record not published"
            ),
        }
    }
}

/// Control handle for a spawned [`WorkerAgent`].
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    shutdown: CancelToken,
    pool: Arc<SlotPool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn busy_slots(&self) -> usize {
        self.pool.busy()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop claiming, drain running slots and stop renewing leases.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!(worker_id = %self.worker_id, "worker shutdown requested");
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| anyhow::anyhow!("worker {} task failed: {e}", self.worker_id))
    }

    /// Stop the agent without draining: payloads are killed and their jobs
    /// are left to lease expiry.
    pub fn abort(self) {
        self.task.abort();
    }
}
