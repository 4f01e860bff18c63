use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactStore, CapturedOutput};
use crate::config::ExecConfig;
use crate::error::QueueError;
use crate::job::{ClaimToken, Job, JobResult, JobStatus, WorkerId};
use crate::queue::JobStore;
use crate::runtime::cancel::CancelToken;
use crate::telemetry;

/// Environment variable carrying the id of the job a payload runs for.
pub const JOB_ID_VAR: &str = "CLUSTERQ_JOB_ID";

/// How long output pipes are still read after the payload exited. A
/// background process that inherited them must not pin the slot.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// How one execution attempt ended, from the slot's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The result was stored and the job is terminal.
    Finalized(JobStatus),
    /// The abandon signal fired; nothing was written.
    Abandoned,
    /// The store refused a write because another owner took over.
    OwnershipLost,
    /// The store failed; the lease will run out and the job is reclaimed.
    StoreError(QueueError),
}

/// Runs claimed jobs as shell child processes and reports their results.
pub struct ExecutionSlot<S, A> {
    store: Arc<S>,
    artifacts: Arc<A>,
    exec: Arc<ExecConfig>,
    worker_id: WorkerId,
}

impl<S, A> Clone for ExecutionSlot<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            artifacts: Arc::clone(&self.artifacts),
            exec: Arc::clone(&self.exec),
            worker_id: self.worker_id.clone(),
        }
    }
}

impl<S, A> ExecutionSlot<S, A>
where
    S: JobStore,
    A: ArtifactStore,
{
    pub fn new(store: Arc<S>, artifacts: Arc<A>, exec: ExecConfig, worker_id: WorkerId) -> Self {
        Self {
            store,
            artifacts,
            exec: Arc::new(exec),
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Drive one claimed job to a terminal state.
    ///
    /// Once `abandon` fires the slot never writes to the store again for this
    /// job.
    pub async fn execute(&self, job: Job, abandon: CancelToken) -> SlotOutcome {
        let claim = ClaimToken::new(job.id, self.worker_id.clone(), job.attempts);
        telemetry::instrument_execution(
            job.id,
            &self.worker_id,
            job.attempts,
            self.execute_inner(job, claim, abandon),
        )
        .await
    }

    async fn execute_inner(&self, job: Job, claim: ClaimToken, abandon: CancelToken) -> SlotOutcome {
        if abandon.is_cancelled() {
            return SlotOutcome::Abandoned;
        }

        match self.store.mark_running(&claim).await {
            Ok(true) => {}
            Ok(false) => {
                telemetry::record_lease_lost(job.id, &self.worker_id);
                return SlotOutcome::OwnershipLost;
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "could not mark job running");
                return SlotOutcome::StoreError(err);
            }
        }

        let timing = telemetry::record_job_start(job.id);
        let result = match self.run_payload(&job, &claim, &abandon).await {
            Some(result) => result,
            None => {
                telemetry::record_lease_lost(job.id, &self.worker_id);
                return SlotOutcome::Abandoned;
            }
        };
        let status = result.status();
        telemetry::record_job_end(timing, status);

        if abandon.is_cancelled() {
            telemetry::record_lease_lost(job.id, &self.worker_id);
            return SlotOutcome::Abandoned;
        }

        self.finalize(&claim, result).await
    }

    /// Spawn the payload and wait for it. `None` when the job was abandoned.
    async fn run_payload(
        &self,
        job: &Job,
        claim: &ClaimToken,
        abandon: &CancelToken,
    ) -> Option<JobResult> {
        let mut command = self.command(job);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "payload failed to start");
                return Some(JobResult::failed(
                    QueueError::Execution(format!("failed to start payload: {err}")).to_string(),
                ));
            }
        };
        debug!(job_id = %job.id, pid = ?child.id(), "payload started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let kill_on_abandon = self.exec.kill_on_abandon;

        let exited = CancelToken::new();
        let wait = async {
            let outcome = if kill_on_abandon {
                tokio::select! {
                    status = child.wait() => (status, false),
                    _ = abandon.cancelled() => {
                        info!(job_id = %job.id, "killing payload of abandoned job");
                        if let Err(err) = child.kill().await {
                            warn!(job_id = %job.id, error = %err, "kill failed");
                        }
                        (child.wait().await, true)
                    }
                }
            } else {
                (child.wait().await, false)
            };
            exited.cancel();
            outcome
        };

        let ((status, killed), out, errout) =
            tokio::join!(wait, drain(stdout, &exited), drain(stderr, &exited));
        if killed || abandon.is_cancelled() {
            return None;
        }

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                return Some(JobResult::failed(
                    QueueError::Execution(format!("waiting for payload: {err}")).to_string(),
                ));
            }
        };
        let mut result = JobResult::exited(status.code(), None);
        if let Some(detail) = signal_detail(status) {
            result = result.with_error(detail);
        }

        let captured = CapturedOutput::from_bytes(&out, &errout);
        let written = match captured.to_blob() {
            Ok(blob) => self.artifacts.write_blob(claim, blob).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(artifact) => result.artifact = Some(artifact),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not store job output");
                result = result.with_error(format!("artifact write failed: {e}"));
            }
        }
        Some(result)
    }

    fn command(&self, job: &Job) -> Command {
        let mut command = Command::new(&self.exec.shell);
        command
            .arg("-c")
            .arg(&job.payload)
            .env_clear()
            .envs(&self.exec.base_env)
            .env(JOB_ID_VAR, job.id.to_string())
            .envs(&job.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = job.working_dir.as_ref().or(self.exec.working_dir.as_ref()) {
            command.current_dir(dir);
        }
        command
    }

    async fn finalize(&self, claim: &ClaimToken, result: JobResult) -> SlotOutcome {
        let status = result.status();
        let exit_code = result.exit_code;
        match self.store.finalize(claim, result).await {
            Ok(true) => {
                telemetry::record_job_finalized(claim.job_id, status, exit_code);
                SlotOutcome::Finalized(status)
            }
            Ok(false) => self.confirm_finalized(claim).await,
            Err(err) => {
                error!(claim = %claim, error = %err, "finalize failed, lease will lapse");
                SlotOutcome::StoreError(err)
            }
        }
    }

    /// A refused finalize may follow an earlier attempt whose reply was lost.
    async fn confirm_finalized(&self, claim: &ClaimToken) -> SlotOutcome {
        match self.store.get(claim.job_id).await {
            Ok(Some(stored))
                if stored.status.is_terminal() && stored.claim_token().as_ref() == Some(claim) =>
            {
                debug!(claim = %claim, "finalize already applied");
                SlotOutcome::Finalized(stored.status)
            }
            Ok(_) => {
                telemetry::record_lease_lost(claim.job_id, &self.worker_id);
                SlotOutcome::OwnershipLost
            }
            Err(err) => SlotOutcome::StoreError(err),
        }
    }
}

/// Read a pipe to its end, or until [`OUTPUT_GRACE`] after `exited` fires.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, exited: &CancelToken) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut pipe) = pipe else {
        return buf;
    };
    let grace = async {
        exited.cancelled().await;
        tokio::time::sleep(OUTPUT_GRACE).await;
    };
    tokio::pin!(grace);

    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            read = pipe.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    debug!(error = %err, "output pipe closed early");
                    break;
                }
            },
            _ = &mut grace => {
                debug!(bytes = buf.len(), "output pipe still held open after payload exit");
                break;
            }
        }
    }
    buf
}

#[cfg(unix)]
fn signal_detail(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|sig| format!("payload terminated by signal {sig}"))
}

#[cfg(not(unix))]
fn signal_detail(status: ExitStatus) -> Option<String> {
    status.code().is_none().then(|| format!("payload terminated: {status}"))
}
