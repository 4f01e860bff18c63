use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use crate::artifact::ArtifactRef;
use crate::error::{QueueError, Result};
use crate::job::{ClaimToken, Job, JobId, JobResult, JobStatus, TagSet, WorkerId};
use crate::lease::check_lease;
use crate::queue::{JobStore, QueueSnapshot, WorkerRecord, WorkerRegistry, WorkerStatus};

/// PostgreSQL-backed coordination store.
///
/// Leases are stamped with the database clock (`NOW()`), so worker clock
/// drift never shortens or stretches a lease. Reclaim passes compare against
/// the earlier of the caller's clock and the database clock.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn lease_ms(lease: Duration) -> Result<i64> {
        Ok(check_lease(lease)?.num_milliseconds())
    }
}

fn attempt_param(claim: &ClaimToken) -> i32 {
    i32::try_from(claim.attempt).unwrap_or(i32::MAX)
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let id = JobId(row.try_get("id")?);
    let status: String = row.try_get("status")?;
    let status: JobStatus = status.parse()?;
    let env: Json<BTreeMap<String, String>> = row.try_get("env")?;
    let tags: Vec<String> = row.try_get("tags")?;
    let tags = TagSet::parse(tags)
        .map_err(|e| QueueError::corruption(format!("job {id}: stored tags invalid: {e}")))?;
    let working_dir: Option<String> = row.try_get("working_dir")?;
    let owner: Option<String> = row.try_get("owner")?;
    let attempts: i32 = row.try_get("attempts")?;
    let last_updated_at: DateTime<Utc> = row.try_get("last_updated_at")?;

    let result = if status.is_terminal() {
        let artifact: Option<String> = row.try_get("artifact_ref")?;
        let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at")?;
        Some(JobResult {
            exit_code: row.try_get("exit_code")?,
            artifact: artifact.map(ArtifactRef),
            error: row.try_get("error")?,
            finished_at: finished_at.unwrap_or(last_updated_at),
        })
    } else {
        None
    };

    let job = Job {
        id,
        payload: row.try_get("payload")?,
        env: env.0,
        tags,
        working_dir: working_dir.map(PathBuf::from),
        status,
        owner: owner.map(WorkerId::from),
        claim_lease_expires_at: row.try_get("lease_expires_at")?,
        attempts: attempts.max(0) as u32,
        submitted_at: row.try_get("submitted_at")?,
        last_updated_at,
        result,
    };
    job.check_invariants()?;
    Ok(job)
}

fn worker_from_row(row: &PgRow) -> Result<WorkerRecord> {
    let worker_id: String = row.try_get("worker_id")?;
    let tags: Vec<String> = row.try_get("tags")?;
    let status: String = row.try_get("status")?;
    let slots: i32 = row.try_get("slots")?;
    let busy_slots: i32 = row.try_get("busy_slots")?;
    Ok(WorkerRecord {
        tags: TagSet::parse(tags).map_err(|e| {
            QueueError::corruption(format!("worker {worker_id}: stored tags invalid: {e}"))
        })?,
        worker_id: WorkerId::from(worker_id),
        slots: slots.max(0) as usize,
        busy_slots: busy_slots.max(0) as usize,
        status: status.parse::<WorkerStatus>()?,
        started_at: row.try_get("started_at")?,
        last_seen: row.try_get("last_seen")?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn submit(&self, job: Job) -> Result<JobId> {
        job.validate_for_submit()?;

        sqlx::query(
            r#"
            INSERT INTO clusterq_jobs (
                id, payload, env, tags, working_dir, status, owner,
                lease_expires_at, attempts, submitted_at, last_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', NULL, NULL, 0, NOW(), NOW())
            "#,
        )
        .bind(job.id.0)
        .bind(&job.payload)
        .bind(Json(&job.env))
        .bind(job.tags.to_vec())
        .bind(job.working_dir.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, tags = %job.tags, "job inserted");
        Ok(job.id)
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        tags: &TagSet,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM clusterq_jobs
                WHERE status = 'pending'
                  AND (cardinality(tags) = 0 OR tags && $2::text[])
                ORDER BY submitted_at, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE clusterq_jobs j
            SET status = 'claimed',
                owner = $1,
                lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                attempts = j.attempts + 1,
                last_updated_at = GREATEST(j.last_updated_at, NOW())
            FROM next
            WHERE j.id = next.id
              AND j.status = 'pending'
            RETURNING j.*
            "#,
        )
        .bind(worker_id.as_str())
        .bind(tags.to_vec())
        .bind(Self::lease_ms(lease)?)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = job_from_row(&row)?;
        debug!(job_id = %job.id, worker_id = %worker_id, "job claimed");
        Ok(Some(job))
    }

    async fn heartbeat(&self, claim: &ClaimToken, lease: Duration) -> Result<bool> {
        let lease_ms = Self::lease_ms(lease)?;
        let res = sqlx::query(
            r#"
            UPDATE clusterq_jobs
            SET lease_expires_at = NOW() + ($4::bigint) * INTERVAL '1 millisecond',
                last_updated_at = GREATEST(last_updated_at, NOW())
            WHERE id = $1
              AND owner = $2
              AND attempts = $3
              AND status IN ('claimed', 'running')
            "#,
        )
        .bind(claim.job_id.0)
        .bind(claim.worker_id.as_str())
        .bind(attempt_param(claim))
        .bind(lease_ms)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_running(&self, claim: &ClaimToken) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE clusterq_jobs
            SET status = 'running',
                last_updated_at = GREATEST(last_updated_at, NOW())
            WHERE id = $1
              AND owner = $2
              AND attempts = $3
              AND status IN ('claimed', 'running')
            "#,
        )
        .bind(claim.job_id.0)
        .bind(claim.worker_id.as_str())
        .bind(attempt_param(claim))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn finalize(&self, claim: &ClaimToken, result: JobResult) -> Result<bool> {
        let status = result.status();
        let res = sqlx::query(
            r#"
            UPDATE clusterq_jobs
            SET status = $4,
                exit_code = $5,
                artifact_ref = $6,
                error = $7,
                finished_at = $8,
                lease_expires_at = NULL,
                last_updated_at = GREATEST(last_updated_at, NOW())
            WHERE id = $1
              AND owner = $2
              AND attempts = $3
              AND status = 'running'
            "#,
        )
        .bind(claim.job_id.0)
        .bind(claim.worker_id.as_str())
        .bind(attempt_param(claim))
        .bind(status.as_str())
        .bind(result.exit_code)
        .bind(result.artifact.as_ref().map(|a| a.as_str()))
        .bind(result.error.as_deref())
        .bind(result.finished_at)
        .execute(&self.pool)
        .await?;

        let finalized = res.rows_affected() == 1;
        if finalized {
            debug!(claim = %claim, status = %status, "job finalized");
        }
        Ok(finalized)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id, owner
                FROM clusterq_jobs
                WHERE status IN ('claimed', 'running')
                  AND lease_expires_at <= LEAST($1, NOW())
                ORDER BY lease_expires_at
                FOR UPDATE SKIP LOCKED
            )
            UPDATE clusterq_jobs j
            SET status = 'pending',
                owner = NULL,
                lease_expires_at = NULL,
                last_updated_at = GREATEST(j.last_updated_at, NOW())
            FROM expired e
            WHERE j.id = e.id
            RETURNING j.*, e.owner AS lost_owner
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut lost = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = job_from_row(&row)?;
            let lost_owner: Option<String> = row.try_get("lost_owner")?;
            job.status = JobStatus::Lost;
            job.owner = lost_owner.map(WorkerId::from);
            warn!(
                job_id = %job.id,
                owner = ?job.owner,
                attempts = job.attempts,
                "lease expired, job returned to pending"
            );
            lost.push(job);
        }
        Ok(lost)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM clusterq_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        if status == Some(JobStatus::Lost) {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM clusterq_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY submitted_at, seq
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                NOW() AS sampled_at,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'claimed') AS claimed,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                MIN(submitted_at) FILTER (WHERE status = 'pending') AS oldest_pending_at,
                COUNT(*) FILTER (
                    WHERE status IN ('claimed', 'running') AND lease_expires_at <= NOW()
                ) AS expired_leases
            FROM clusterq_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> Result<usize> {
            let n: i64 = row.try_get(name)?;
            Ok(n.max(0) as usize)
        };

        Ok(QueueSnapshot {
            sampled_at: row.try_get("sampled_at")?,
            pending: count("pending")?,
            claimed: count("claimed")?,
            running: count("running")?,
            succeeded: count("succeeded")?,
            failed: count("failed")?,
            oldest_pending_at: row.try_get("oldest_pending_at")?,
            expired_leases: count("expired_leases")?,
        })
    }
}

#[async_trait]
impl WorkerRegistry for PostgresJobStore {
    async fn upsert_worker(&self, record: WorkerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clusterq_workers (
                worker_id, tags, slots, busy_slots, status, started_at, last_seen
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (worker_id) DO UPDATE
            SET tags = EXCLUDED.tags,
                slots = EXCLUDED.slots,
                busy_slots = EXCLUDED.busy_slots,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                last_seen = NOW()
            "#,
        )
        .bind(record.worker_id.as_str())
        .bind(record.tags.to_vec())
        .bind(record.slots.min(i32::MAX as usize) as i32)
        .bind(record.busy_slots.min(i32::MAX as usize) as i32)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query("SELECT * FROM clusterq_workers ORDER BY worker_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(worker_from_row).collect()
    }
}
