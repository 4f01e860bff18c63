use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clusterq::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Coordination store kept in process memory.
///
/// One mutex guards the whole state, so every call is atomic with respect
/// to every other call, which is the contract the SQL store provides with
/// conditional updates. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
    workers: BTreeMap<WorkerId, WorkerRecord>,
}

struct Entry {
    seq: u64,
    job: Job,
}

fn touch(job: &mut Job, now: DateTime<Utc>) {
    job.last_updated_at = job.last_updated_at.max(now);
}

fn held_by(job: &Job, claim: &ClaimToken) -> bool {
    job.owner.as_ref() == Some(&claim.worker_id) && job.attempts == claim.attempt
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored job in claim order.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock();
        let mut entries: Vec<&Entry> = state.jobs.values().collect();
        entries.sort_by_key(|e| (e.job.submitted_at, e.seq));
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Move the lease of an owned job into the past, as if its owner had
    /// stopped heartbeating long ago.
    pub fn expire_lease(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock();
        match state.jobs.get_mut(&job_id) {
            Some(entry) if entry.job.status.is_owned() => {
                entry.job.claim_lease_expires_at = Some(Utc::now() - Duration::seconds(1));
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, job: Job) -> Result<JobId> {
        job.validate_for_submit()?;
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(QueueError::validation(format!("job {} already exists", job.id)));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = job.id;
        state.jobs.insert(id, Entry { seq, job });
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        tags: &TagSet,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;
        let mut state = self.state.lock();
        let next = state
            .jobs
            .values()
            .filter(|e| e.job.status == JobStatus::Pending && tags.admits(&e.job.tags))
            .min_by_key(|e| (e.job.submitted_at, e.seq))
            .map(|e| e.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let job = &mut entry.job;
        job.status = JobStatus::Claimed;
        job.owner = Some(worker_id.clone());
        job.claim_lease_expires_at = Some(expires_at);
        job.attempts += 1;
        touch(job, now);
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, claim: &ClaimToken, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&claim.job_id) {
            Some(entry) if entry.job.status.is_owned() && held_by(&entry.job, claim) => {
                entry.job.claim_lease_expires_at = Some(expires_at);
                touch(&mut entry.job, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_running(&self, claim: &ClaimToken) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();
        match state.jobs.get_mut(&claim.job_id) {
            Some(entry) if entry.job.status.is_owned() && held_by(&entry.job, claim) => {
                entry.job.status = JobStatus::Running;
                touch(&mut entry.job, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, claim: &ClaimToken, result: JobResult) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();
        match state.jobs.get_mut(&claim.job_id) {
            Some(entry) if entry.job.status == JobStatus::Running && held_by(&entry.job, claim) => {
                entry.job.status = result.status();
                entry.job.claim_lease_expires_at = None;
                entry.job.result = Some(result);
                touch(&mut entry.job, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let stamp = Utc::now();
        let mut state = self.state.lock();
        let mut expired: Vec<&mut Entry> = state
            .jobs
            .values_mut()
            .filter(|e| e.job.lease_expired(now))
            .collect();
        expired.sort_by_key(|e| (e.job.claim_lease_expires_at, e.seq));

        let mut lost = Vec::with_capacity(expired.len());
        for entry in expired {
            let mut snapshot = entry.job.clone();
            snapshot.status = JobStatus::Lost;

            let job = &mut entry.job;
            job.status = JobStatus::Pending;
            job.owner = None;
            job.claim_lease_expires_at = None;
            touch(job, stamp);

            snapshot.last_updated_at = job.last_updated_at;
            lost.push(snapshot);
        }
        Ok(lost)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        Ok(self
            .jobs()
            .into_iter()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .take(limit)
            .collect())
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for entry in state.jobs.values() {
            snapshot.observe(&entry.job);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryJobStore {
    async fn upsert_worker(&self, record: WorkerRecord) -> Result<()> {
        self.state
            .lock()
            .workers
            .insert(record.worker_id.clone(), record);
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        Ok(self.state.lock().workers.values().cloned().collect())
    }
}
