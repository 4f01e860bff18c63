use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clusterq::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Artifact area kept in memory.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decoded output stored under `artifact`.
    pub fn output(&self, artifact: &ArtifactRef) -> Option<CapturedOutput> {
        let blobs = self.blobs.lock();
        blobs
            .get(artifact.as_str())
            .and_then(|bytes| CapturedOutput::from_blob(bytes).ok())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn write_blob(&self, claim: &ClaimToken, bytes: Vec<u8>) -> Result<ArtifactRef> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(QueueError::Artifact("artifact area not writable".into()));
        }
        let artifact = ArtifactRef::for_claim(claim);
        self.blobs.lock().insert(artifact.0.clone(), bytes);
        Ok(artifact)
    }

    async fn read_blob(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(artifact.as_str())
            .cloned()
            .ok_or_else(|| QueueError::Artifact(format!("no blob {artifact}")))
    }
}

/// Store wrapper that injects connectivity faults.
///
/// `fail_next(n)` makes the next `n` calls fail before reaching the inner
/// store. `lose_next_replies(n)` lets the next `n` calls go through and then
/// reports them as failed, like a connection dropping after the commit.
pub struct FlakyStore<S> {
    inner: S,
    fail_next: AtomicU32,
    lose_replies: AtomicU32,
    unavailable: AtomicBool,
    calls: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_next: AtomicU32::new(0),
            lose_replies: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn lose_next_replies(&self, n: u32) {
        self.lose_replies.store(n, Ordering::SeqCst);
    }

    /// Fail every call until set back to `false`.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn call<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) || take_one(&self.fail_next) {
            tracing::debug!(op, "injected store fault");
            return Err(QueueError::unavailable(format!("injected fault in {op}")));
        }
        let out = fut.await;
        if take_one(&self.lose_replies) {
            tracing::debug!(op, "injected lost reply");
            return Err(QueueError::unavailable(format!("reply of {op} lost")));
        }
        out
    }
}

#[async_trait]
impl<S: JobStore> JobStore for FlakyStore<S> {
    async fn submit(&self, job: Job) -> Result<JobId> {
        self.call("submit", self.inner.submit(job)).await
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        tags: &TagSet,
        lease: Duration,
    ) -> Result<Option<Job>> {
        self.call("claim", self.inner.claim(worker_id, tags, lease))
            .await
    }

    async fn heartbeat(&self, claim: &ClaimToken, lease: Duration) -> Result<bool> {
        self.call("heartbeat", self.inner.heartbeat(claim, lease)).await
    }

    async fn mark_running(&self, claim: &ClaimToken) -> Result<bool> {
        self.call("mark_running", self.inner.mark_running(claim)).await
    }

    async fn finalize(&self, claim: &ClaimToken, result: JobResult) -> Result<bool> {
        self.call("finalize", self.inner.finalize(claim, result)).await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        self.call("reclaim_expired", self.inner.reclaim_expired(now))
            .await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        self.call("get", self.inner.get(job_id)).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        self.call("list", self.inner.list(status, limit)).await
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.call("snapshot", self.inner.snapshot()).await
    }
}

#[async_trait]
impl<S: WorkerRegistry> WorkerRegistry for FlakyStore<S> {
    async fn upsert_worker(&self, record: WorkerRecord) -> Result<()> {
        self.call("upsert_worker", self.inner.upsert_worker(record))
            .await
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        self.call("workers", self.inner.workers()).await
    }
}
