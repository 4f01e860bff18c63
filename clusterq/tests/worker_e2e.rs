//! End-to-end tests running real shell payloads through worker agents,
//! execution slots and the lease loop against the in-memory store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use clusterq::runtime::{CancelToken, ExecutionSlot, LeaseManager, Reclaimer, SlotOutcome, WorkerAgent};
use clusterq::*;
use clusterq_testkit::*;
use tokio::time::timeout;

const WAIT: StdDuration = StdDuration::from_secs(10);

fn fast_config(id: &str) -> WorkerConfig {
    WorkerConfig::new(id)
        .with_poll_interval(20)
        .with_lease_duration(2_000)
        .with_drain_timeout(5_000)
}

fn setup() -> (Arc<InMemoryJobStore>, Arc<MemoryArtifactStore>, Orchestrator<InMemoryJobStore>) {
    let store = Arc::new(InMemoryJobStore::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store));
    (store, artifacts, orchestrator)
}

#[tokio::test]
async fn test_echo_env_job_succeeds() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(env_echo_request("hi")).await.unwrap();

    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), Arc::clone(&artifacts))
        .unwrap()
        .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.owner, Some(WorkerId::from("w1")));
    assert_eq!(job.attempts, 1);
    let result = job.result.expect("terminal job has a result");
    assert_eq!(result.exit_code, Some(0));
    assert!(result.error.is_none());
    let output = artifacts.output(&result.artifact.unwrap()).unwrap();
    assert_eq!(output.stdout.trim(), "hi");
    assert_eq!(output.stderr, "");
}

#[tokio::test]
async fn test_gpu_jobs_stay_pending_for_cpu_worker() {
    let (store, artifacts, orchestrator) = setup();
    let ids = orchestrator
        .submit_many(vec![
            tagged_request("echo one", &["gpu"]),
            tagged_request("echo two", &["gpu"]),
        ])
        .await
        .unwrap();

    let worker = WorkerAgent::new(fast_config("cpu-1").with_tag("cpu"), Arc::clone(&store), artifacts)
        .unwrap()
        .spawn();
    tokio::time::sleep(StdDuration::from_millis(300)).await;
    worker.shutdown().await.unwrap();

    for id in ids {
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.owner.is_none());
    }
}

#[tokio::test]
async fn test_crashed_owner_is_reclaimed() {
    let (store, _artifacts, orchestrator) = setup();
    let id = orchestrator.submit(echo_request("x")).await.unwrap();

    // A worker claims and dies before its first heartbeat.
    let crashed = WorkerId::from("crashed");
    store
        .claim(&crashed, &TagSet::new(), Duration::milliseconds(100))
        .await
        .unwrap()
        .unwrap();

    let reclaimer = Reclaimer::new(Arc::clone(&store), StdDuration::from_millis(20));
    assert!(reclaimer.pass().await.unwrap().is_empty());

    tokio::time::sleep(StdDuration::from_millis(150)).await;
    let lost = reclaimer.pass().await.unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].id, id);
    assert_eq!(lost[0].owner.as_ref(), Some(&crashed));

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.owner.is_none());
}

#[tokio::test]
async fn test_worker_reclaim_loop_reruns_orphaned_job() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(echo_request("again")).await.unwrap();
    store
        .claim(&WorkerId::from("crashed"), &TagSet::new(), Duration::milliseconds(50))
        .await
        .unwrap()
        .unwrap();

    let worker = WorkerAgent::new(
        fast_config("w2").with_reclaim_interval(30),
        Arc::clone(&store),
        Arc::clone(&artifacts),
    )
    .unwrap()
    .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.owner, Some(WorkerId::from("w2")));
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn test_lost_heartbeat_abandons_and_kills_payload() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(sleep_request(30.0)).await.unwrap();
    let me = WorkerId::from("w1");
    let lease = LeaseConfig::new(1_000);
    let job = store.claim(&me, &TagSet::new(), lease.duration()).await.unwrap().unwrap();

    let leases = LeaseManager::new(Arc::clone(&store), me.clone(), lease);
    let abandon = leases.track(job.claim_token().unwrap());
    let slot = ExecutionSlot::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        ExecConfig::default().with_kill_on_abandon(true),
        me.clone(),
    );
    let running = tokio::spawn(async move { slot.execute(job, abandon).await });

    wait_for_job(store.as_ref(), id, WAIT, |j| j.status == JobStatus::Running)
        .await
        .unwrap();
    // Another node decides the lease is gone.
    let stolen = store.reclaim_expired(Utc::now() + Duration::hours(1)).await.unwrap();
    assert_eq!(stolen.len(), 1);

    assert_eq!(leases.renew_all().await, 1);
    assert_eq!(leases.tracked(), 0);

    let outcome = timeout(StdDuration::from_secs(5), running)
        .await
        .expect("killed payload should end quickly")
        .unwrap();
    assert_eq!(outcome, SlotOutcome::Abandoned);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.result.is_none());
    assert!(artifacts.is_empty());
}

#[tokio::test]
async fn test_abandoned_payload_may_finish_but_result_is_dropped() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(sleep_request(0.3)).await.unwrap();
    let me = WorkerId::from("w1");
    let job = store
        .claim(&me, &TagSet::new(), Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();

    let abandon = CancelToken::new();
    let slot = ExecutionSlot::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        ExecConfig::default(),
        me.clone(),
    );
    let running = {
        let abandon = abandon.clone();
        tokio::spawn(async move { slot.execute(job, abandon).await })
    };
    wait_for_job(store.as_ref(), id, WAIT, |j| j.status == JobStatus::Running)
        .await
        .unwrap();
    abandon.cancel();

    assert_eq!(running.await.unwrap(), SlotOutcome::Abandoned);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.result.is_none());
}

#[tokio::test]
async fn test_slot_skips_jobs_it_no_longer_owns() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(echo_request("x")).await.unwrap();
    let me = WorkerId::from("w1");
    let job = store.claim(&me, &TagSet::new(), Duration::seconds(30)).await.unwrap().unwrap();
    store.reclaim_expired(Utc::now() + Duration::hours(1)).await.unwrap();

    let slot = ExecutionSlot::new(Arc::clone(&store), artifacts, ExecConfig::default(), me);
    assert_eq!(
        slot.execute(job, CancelToken::new()).await,
        SlotOutcome::OwnershipLost
    );
    assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_spawn_failure_is_recorded_as_failed() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(echo_request("never")).await.unwrap();

    let exec = ExecConfig::default().with_shell("/nonexistent/clusterq-shell");
    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), artifacts)
        .unwrap()
        .with_exec(exec)
        .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let result = job.result.unwrap();
    assert_eq!(result.exit_code, None);
    assert!(result.error.unwrap().contains("failed to start payload"));
}

#[tokio::test]
async fn test_nonzero_exit_is_failed_with_output() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator
        .submit(JobRequest::new("echo oops >&2; exit 3"))
        .await
        .unwrap();

    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), Arc::clone(&artifacts))
        .unwrap()
        .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let result = job.result.unwrap();
    assert_eq!(result.exit_code, Some(3));
    let output = artifacts.output(&result.artifact.unwrap()).unwrap();
    assert_eq!(output.stderr.trim(), "oops");
}

#[tokio::test]
async fn test_artifact_failure_degrades_to_failed() {
    let (store, artifacts, orchestrator) = setup();
    artifacts.set_fail_writes(true);
    let id = orchestrator.submit(echo_request("lost output")).await.unwrap();

    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), Arc::clone(&artifacts))
        .unwrap()
        .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let result = job.result.unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert!(result.artifact.is_none());
    assert!(result.error.unwrap().contains("artifact write failed"));
}

#[tokio::test]
async fn test_fs_artifacts_and_working_dir() {
    let shared = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryJobStore::new());
    let artifacts = Arc::new(FsArtifactStore::new(shared.path()));
    let orchestrator = Orchestrator::new(Arc::clone(&store));

    let id = orchestrator
        .submit(JobRequest::new("pwd").with_working_dir(workdir.path()))
        .await
        .unwrap();

    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), Arc::clone(&artifacts))
        .unwrap()
        .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    let artifact = job.result.unwrap().artifact.unwrap();
    assert_eq!(artifact.as_str(), format!("job_{id}_1.json"));
    assert!(shared.path().join(artifact.as_str()).exists());

    let output = CapturedOutput::from_blob(&artifacts.read_blob(&artifact).await.unwrap()).unwrap();
    let expected = workdir.path().canonicalize().unwrap();
    assert_eq!(
        std::path::Path::new(output.stdout.trim()).canonicalize().unwrap(),
        expected
    );
}

#[tokio::test]
async fn test_job_env_overrides_base_env() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator
        .submit(JobRequest::new("echo $BASE-$X-$CLUSTERQ_JOB_ID").with_env("X", "job"))
        .await
        .unwrap();

    let exec = ExecConfig::default()
        .with_base_var("BASE", "b")
        .with_base_var("X", "base");
    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), Arc::clone(&artifacts))
        .unwrap()
        .with_exec(exec)
        .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    let output = artifacts.output(&job.result.unwrap().artifact.unwrap()).unwrap();
    assert_eq!(output.stdout.trim(), format!("b-job-{id}"));
}

#[tokio::test]
async fn test_heartbeats_keep_long_jobs_alive() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(sleep_request(1.0)).await.unwrap();

    let stop = CancelToken::new();
    let reclaimer = {
        let reclaimer = Reclaimer::new(Arc::clone(&store), StdDuration::from_millis(25));
        let stop = stop.clone();
        tokio::spawn(async move { reclaimer.run(stop).await })
    };

    let worker = WorkerAgent::new(
        fast_config("w1").with_lease_duration(300),
        Arc::clone(&store),
        artifacts,
    )
    .unwrap()
    .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();
    stop.cancel();
    reclaimer.await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_multi_slot_worker_runs_jobs_concurrently() {
    let (store, artifacts, orchestrator) = setup();
    let requests = (0..6).map(|_| sleep_request(0.3)).collect();
    let ids = orchestrator.submit_many(requests).await.unwrap();

    let started = std::time::Instant::now();
    let worker = WorkerAgent::new(fast_config("w1").with_slots(3), Arc::clone(&store), artifacts)
        .unwrap()
        .spawn();
    for id in &ids {
        let job = wait_for_terminal(store.as_ref(), *id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    let elapsed = started.elapsed();
    worker.shutdown().await.unwrap();

    // Six 0.3s jobs on three slots take two rounds, not six.
    assert!(elapsed < StdDuration::from_millis(1_500), "took {elapsed:?}");
}

#[tokio::test]
async fn test_shutdown_drains_running_jobs() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(sleep_request(0.4)).await.unwrap();

    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), artifacts)
        .unwrap()
        .spawn();
    wait_for_job(store.as_ref(), id, WAIT, |j| j.status == JobStatus::Running)
        .await
        .unwrap();
    assert_eq!(worker.busy_slots(), 1);
    worker.shutdown().await.unwrap();

    assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    let records = store.workers().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, WorkerStatus::Stopped);
    assert_eq!(records[0].busy_slots, 0);
}

#[tokio::test]
async fn test_run_until_returns_after_shutdown_token() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(echo_request("inline")).await.unwrap();

    let agent = WorkerAgent::new(fast_config("inline"), Arc::clone(&store), artifacts).unwrap();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(agent.run_until(shutdown.clone()));

    wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    shutdown.cancel();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();

    let records = store.workers().await.unwrap();
    assert_eq!(records[0].worker_id, WorkerId::from("inline"));
    assert_eq!(records[0].status, WorkerStatus::Stopped);
}

#[tokio::test]
async fn test_drain_timeout_leaves_job_to_lease_expiry() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(sleep_request(30.0)).await.unwrap();

    let worker = WorkerAgent::new(
        fast_config("w1").with_drain_timeout(100),
        Arc::clone(&store),
        artifacts,
    )
    .unwrap()
    .spawn();
    wait_for_job(store.as_ref(), id, WAIT, |j| j.status == JobStatus::Running)
        .await
        .unwrap();
    timeout(StdDuration::from_secs(5), worker.shutdown())
        .await
        .expect("shutdown bounded by drain timeout")
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.result.is_none());
}

#[tokio::test]
async fn test_worker_survives_store_outage() {
    let flaky = FlakyStore::new(InMemoryJobStore::new());
    let store = Arc::new(RetryingStore::new(
        flaky,
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 5,
            max_backoff_ms: 20,
            jitter_ratio: 0.0,
        },
    ));
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store));
    let id = orchestrator.submit(echo_request("after outage")).await.unwrap();

    store.inner().fail_next(7);
    let worker = WorkerAgent::new(
        fast_config("w1").with_max_poll_backoff(50),
        Arc::clone(&store),
        artifacts,
    )
    .unwrap()
    .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_invalid_worker_config_is_rejected() {
    let (store, artifacts, _) = setup();
    let err = WorkerAgent::new(fast_config("w1").with_slots(0), store, artifacts)
        .err()
        .expect("zero slots must be rejected");
    assert!(matches!(err, QueueError::Config(_)));
}

#[tokio::test]
async fn test_lease_manager_keeps_newest_claim_per_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let me = WorkerId::from("w1");
    let leases = LeaseManager::new(store, me.clone(), LeaseConfig::new(3_000));
    let id = JobId::new();
    let first = ClaimToken::new(id, me.clone(), 1);
    let second = ClaimToken::new(id, me.clone(), 2);

    let stale = leases.track(first.clone());
    assert!(!leases.track(first.clone()).is_cancelled());
    let current = leases.track(second.clone());
    assert!(stale.is_cancelled());
    assert!(!current.is_cancelled());

    // The older slot finishing must not stop renewals for the newer claim.
    leases.release(&first);
    assert_eq!(leases.tracked(), 1);
    leases.release(&second);
    assert_eq!(leases.tracked(), 0);
}

#[tokio::test]
async fn test_same_worker_reclaim_fences_older_attempt() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(sleep_request(1.0)).await.unwrap();
    let me = WorkerId::from("w1");
    let lease = LeaseConfig::new(3_000);
    let leases = LeaseManager::new(Arc::clone(&store), me.clone(), lease);
    let slot = ExecutionSlot::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        ExecConfig::default(),
        me.clone(),
    );

    let first = store.claim(&me, &TagSet::new(), lease.duration()).await.unwrap().unwrap();
    let first_claim = first.claim_token().unwrap();
    let first_run = {
        let slot = slot.clone();
        let abandon = leases.track(first_claim.clone());
        tokio::spawn(async move { slot.execute(first, abandon).await })
    };
    wait_for_job(store.as_ref(), id, WAIT, |j| j.status == JobStatus::Running)
        .await
        .unwrap();

    assert!(store.expire_lease(id));
    assert_eq!(store.reclaim_expired(Utc::now()).await.unwrap().len(), 1);
    let second = store.claim(&me, &TagSet::new(), lease.duration()).await.unwrap().unwrap();
    assert_eq!(second.attempts, 2);
    let second_claim = second.claim_token().unwrap();
    let abandon = leases.track(second_claim.clone());

    // Same owner, older attempt: every write from it is refused.
    assert!(!store.heartbeat(&first_claim, lease.duration()).await.unwrap());
    assert!(!store.mark_running(&first_claim).await.unwrap());

    let second_outcome = slot.execute(second, abandon).await;
    assert_eq!(second_outcome, SlotOutcome::Finalized(JobStatus::Succeeded));
    assert_eq!(first_run.await.unwrap(), SlotOutcome::Abandoned);
    leases.release(&first_claim);
    assert_eq!(leases.tracked(), 1);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(artifacts.len(), 1);
    assert_eq!(
        job.result.unwrap().artifact.unwrap().as_str(),
        format!("job_{id}_2.json")
    );
}

#[tokio::test]
async fn test_agent_reclaimed_by_itself_finalizes_once() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator.submit(sleep_request(1.0)).await.unwrap();

    let worker = WorkerAgent::new(
        fast_config("w1").with_slots(2).with_lease_duration(3_000),
        Arc::clone(&store),
        Arc::clone(&artifacts),
    )
    .unwrap()
    .spawn();
    wait_for_job(store.as_ref(), id, WAIT, |j| j.status == JobStatus::Running)
        .await
        .unwrap();
    assert!(store.expire_lease(id));
    assert_eq!(store.reclaim_expired(Utc::now()).await.unwrap().len(), 1);

    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.owner, Some(WorkerId::from("w1")));
    assert_eq!(job.attempts, 2);
    // Only the current attempt stored output.
    assert_eq!(artifacts.len(), 1);
    assert_eq!(
        job.result.unwrap().artifact.unwrap().as_str(),
        format!("job_{id}_2.json")
    );
}

#[tokio::test]
async fn test_stale_owner_cannot_overwrite_output() {
    let shared = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryJobStore::new());
    let artifacts = Arc::new(FsArtifactStore::new(shared.path()));
    let orchestrator = Orchestrator::new(Arc::clone(&store));
    let id = orchestrator
        .submit(
            JobRequest::new("if [ -e seen ]; then echo new; else touch seen; sleep 1; echo old; fi")
                .with_working_dir(workdir.path()),
        )
        .await
        .unwrap();

    let (w1, w2) = (WorkerId::from("w1"), WorkerId::from("w2"));
    let stale_slot = ExecutionSlot::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        ExecConfig::default(),
        w1.clone(),
    );
    let stale_job = store.claim(&w1, &TagSet::new(), Duration::seconds(30)).await.unwrap().unwrap();
    // The stale owner never learns about the reclaim.
    let stale_run = tokio::spawn(async move { stale_slot.execute(stale_job, CancelToken::new()).await });
    wait_for_job(store.as_ref(), id, WAIT, |j| j.status == JobStatus::Running)
        .await
        .unwrap();

    assert!(store.expire_lease(id));
    store.reclaim_expired(Utc::now()).await.unwrap();
    let job = store.claim(&w2, &TagSet::new(), Duration::seconds(30)).await.unwrap().unwrap();
    let slot = ExecutionSlot::new(Arc::clone(&store), Arc::clone(&artifacts), ExecConfig::default(), w2);
    assert_eq!(
        slot.execute(job, CancelToken::new()).await,
        SlotOutcome::Finalized(JobStatus::Succeeded)
    );
    assert_eq!(stale_run.await.unwrap(), SlotOutcome::OwnershipLost);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.owner, Some(WorkerId::from("w2")));
    let artifact = job.result.unwrap().artifact.unwrap();
    let output = CapturedOutput::from_blob(&artifacts.read_blob(&artifact).await.unwrap()).unwrap();
    assert_eq!(output.stdout.trim(), "new");
}

#[tokio::test]
async fn test_background_child_does_not_pin_slot() {
    let (store, artifacts, orchestrator) = setup();
    let id = orchestrator
        .submit(JobRequest::new("echo done; sleep 30 &"))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let worker = WorkerAgent::new(fast_config("w1"), Arc::clone(&store), Arc::clone(&artifacts))
        .unwrap()
        .spawn();
    let job = wait_for_terminal(store.as_ref(), id, WAIT).await.unwrap();
    let elapsed = started.elapsed();
    worker.shutdown().await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(elapsed < StdDuration::from_secs(8), "took {elapsed:?}");
    let output = artifacts.output(&job.result.unwrap().artifact.unwrap()).unwrap();
    assert_eq!(output.stdout.trim(), "done");
}
