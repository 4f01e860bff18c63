use clusterq::*;
use std::time::Duration;

/// `echo <message>` with no tags.
pub fn echo_request(message: &str) -> JobRequest {
    JobRequest::new(format!("echo {message}"))
}

/// Payload that prints `$X` from its environment.
pub fn env_echo_request(value: &str) -> JobRequest {
    JobRequest::new("echo $X").with_env("X", value)
}

/// Payload restricted to workers carrying one of `tags`.
pub fn tagged_request(payload: &str, tags: &[&str]) -> JobRequest {
    tags.iter()
        .fold(JobRequest::new(payload), |req, tag| req.with_tag(*tag))
}

pub fn sleep_request(secs: f64) -> JobRequest {
    JobRequest::new(format!("sleep {secs}"))
}

pub fn exit_request(code: i32) -> JobRequest {
    JobRequest::new(format!("exit {code}"))
}

/// A stored-shape `Pending` job, ready for `JobStore::submit`.
pub fn pending_job(request: JobRequest) -> Job {
    request
        .into_job(JobId::new(), chrono::Utc::now())
        .expect("test request should be valid")
}

/// Poll `store` until the job satisfies `done`, or fail after `timeout`.
pub async fn wait_for_job<S, F>(
    store: &S,
    job_id: JobId,
    timeout: Duration,
    mut done: F,
) -> anyhow::Result<Job>
where
    S: JobStore + ?Sized,
    F: FnMut(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = store.get(job_id).await? {
            if done(&job) {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "job {job_id} still {} after {:?}",
                    job.status,
                    timeout
                );
            }
        } else if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("job {job_id} not found after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_terminal<S>(store: &S, job_id: JobId, timeout: Duration) -> anyhow::Result<Job>
where
    S: JobStore + ?Sized,
{
    wait_for_job(store, job_id, timeout, |job| job.status.is_terminal()).await
}
