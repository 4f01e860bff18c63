use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::ArtifactRef;
use crate::error::{QueueError, Result};

/// Longest tag accepted on submission or worker startup.
pub const MAX_TAG_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| QueueError::validation(format!("invalid job id {s:?}: {e}")))
    }
}

/// Identity of a worker process. Fixed at startup.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<hostname>-<suffix>`, falling back to `localhost` when the hostname
    /// cannot be read.
    pub fn from_hostname(suffix: impl Display) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self(format!("{host}-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Capability labels carried by jobs and workers.
///
/// Matching is any-of: a worker admits a job when the job carries no tags
/// or when the two sets share at least one tag.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tag set, rejecting malformed tags.
    pub fn parse<I, T>(tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut set = BTreeSet::new();
        for tag in tags {
            let tag = tag.into();
            validate_tag(&tag)?;
            set.insert(tag);
        }
        Ok(Self(set))
    }

    /// Whether a worker holding `self` may run a job tagged `job_tags`.
    pub fn admits(&self, job_tags: &TagSet) -> bool {
        job_tags.is_empty() || !self.0.is_disjoint(&job_tags.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    /// Re-validate every tag, used on values decoded from storage.
    pub fn validate(&self) -> Result<()> {
        self.0.iter().try_for_each(|t| validate_tag(t))
    }
}

impl Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{{{}}}", joined.join(","))
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(QueueError::validation("tag must not be empty"));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(QueueError::validation(format!(
            "tag {tag:?} longer than {MAX_TAG_LEN} bytes"
        )));
    }
    if let Some(bad) = tag
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-')))
    {
        return Err(QueueError::validation(format!(
            "tag {tag:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Lifecycle state of a job.
///
/// `Lost` is transient: it is never stored, only reported for jobs that a
/// reclaim pass just returned to `Pending`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Lost,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// States in which a job has an owner and a live lease.
    pub fn is_owned(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    /// Edges of the lifecycle graph. The only backward edge is
    /// `Lost -> Pending`, reached through lease expiry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Claimed, Lost)
                | (Running, Lost)
                | (Lost, Pending)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "lost" => Ok(JobStatus::Lost),
            other => Err(QueueError::corruption(format!("unknown job status {other:?}"))),
        }
    }
}

/// Outcome recorded on a terminal job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Exit code of the payload; `None` when it never started or died by signal.
    pub exit_code: Option<i32>,
    /// Captured output blob.
    pub artifact: Option<ArtifactRef>,
    /// Execution or local failure detail.
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn exited(exit_code: Option<i32>, artifact: Option<ArtifactRef>) -> Self {
        Self {
            exit_code,
            artifact,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            artifact: None,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Terminal status implied by this result.
    pub fn status(&self) -> JobStatus {
        if self.exit_code == Some(0) && self.error.is_none() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        }
    }
}

/// A job record as held by the coordination store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: String,
    pub env: BTreeMap<String, String>,
    pub tags: TagSet,
    pub working_dir: Option<PathBuf>,
    pub status: JobStatus,
    pub owner: Option<WorkerId>,
    pub claim_lease_expires_at: Option<DateTime<Utc>>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub result: Option<JobResult>,
}

impl Job {
    /// Checks the fields a store must refuse on insert.
    pub fn validate_for_submit(&self) -> Result<()> {
        validate_payload(&self.payload)?;
        validate_env(&self.env)?;
        self.tags.validate()?;
        if self.status != JobStatus::Pending {
            return Err(QueueError::validation(format!(
                "new job must be pending, got {}",
                self.status
            )));
        }
        if self.owner.is_some() || self.claim_lease_expires_at.is_some() || self.result.is_some()
        {
            return Err(QueueError::validation(
                "new job must not carry owner, lease or result",
            ));
        }
        Ok(())
    }

    /// Checks the ownership invariants of a stored record.
    pub fn check_invariants(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> {
            Err(QueueError::corruption(format!("job {}: {msg}", self.id)))
        };
        match self.status {
            JobStatus::Pending if self.owner.is_some() => fail("pending job has an owner"),
            s if s.is_owned() && self.owner.is_none() => fail("owned job has no owner"),
            s if s.is_owned() && self.claim_lease_expires_at.is_none() => {
                fail("owned job has no lease")
            }
            s if s.is_terminal() && self.result.is_none() => fail("terminal job has no result"),
            JobStatus::Lost => fail("lost is never stored"),
            _ => Ok(()),
        }
    }

    /// Whether the lease of an owned job has run out at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_owned()
            && self
                .claim_lease_expires_at
                .map(|at| at <= now)
                .unwrap_or(false)
    }

    /// Token of the claim currently (or last) holding this job.
    pub fn claim_token(&self) -> Option<ClaimToken> {
        self.owner
            .as_ref()
            .map(|owner| ClaimToken::new(self.id, owner.clone(), self.attempts))
    }
}

/// Fencing token for one claim of a job.
///
/// Every claim bumps the attempt counter, so a job that is reclaimed and
/// claimed again, even by the same worker, gets a new token and writes made
/// under the old one are refused.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ClaimToken {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub attempt: u32,
}

impl ClaimToken {
    pub fn new(job_id: JobId, worker_id: impl Into<WorkerId>, attempt: u32) -> Self {
        Self {
            job_id,
            worker_id: worker_id.into(),
            attempt,
        }
    }
}

impl Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.job_id, self.attempt, self.worker_id)
    }
}

/// Submission input accepted by the orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub payload: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Validate and turn the request into a fresh `Pending` job.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        validate_payload(&self.payload)?;
        validate_env(&self.env)?;
        let tags = TagSet::parse(self.tags)?;
        Ok(Job {
            id,
            payload: self.payload,
            env: self.env,
            tags,
            working_dir: self.working_dir,
            status: JobStatus::Pending,
            owner: None,
            claim_lease_expires_at: None,
            attempts: 0,
            submitted_at: now,
            last_updated_at: now,
            result: None,
        })
    }
}

fn validate_payload(payload: &str) -> Result<()> {
    if payload.trim().is_empty() {
        return Err(QueueError::validation("payload must not be empty"));
    }
    if payload.contains('\0') {
        return Err(QueueError::validation("payload contains NUL"));
    }
    Ok(())
}

fn validate_env(env: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in env {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(QueueError::validation(format!("invalid env key {key:?}")));
        }
        if value.contains('\0') {
            return Err(QueueError::validation(format!("env value for {key} contains NUL")));
        }
    }
    Ok(())
}
