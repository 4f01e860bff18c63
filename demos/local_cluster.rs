//! Two workers sharing one in-memory store.
//!
//! A `cpu` worker and a `gpu` worker poll the same queue. Untagged jobs go
//! to whichever worker claims first; tagged jobs only go to a matching
//! worker. Captured output lands in a temporary artifact directory.
//!
//! Run with: `cargo run --example local_cluster`

use std::sync::Arc;
use std::time::Duration;

use clusterq::runtime::WorkerAgent;
use clusterq::telemetry::init_tracing;
use clusterq::*;
use clusterq_testkit::{InMemoryJobStore, wait_for_terminal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,clusterq=debug")?;

    let store = Arc::new(InMemoryJobStore::new());
    let artifact_dir = tempfile::tempdir()?;
    let artifacts = Arc::new(FsArtifactStore::new(artifact_dir.path()));
    let orchestrator = Orchestrator::new(Arc::clone(&store));

    let cpu = WorkerAgent::new(
        WorkerConfig::new("cpu-node")
            .with_tag("cpu")
            .with_slots(2)
            .with_poll_interval(100)
            .with_lease_duration(5_000)
            .with_reclaim_interval(1_000),
        Arc::clone(&store),
        Arc::clone(&artifacts),
    )?
    .spawn();
    let gpu = WorkerAgent::new(
        WorkerConfig::new("gpu-node")
            .with_tag("gpu")
            .with_poll_interval(100)
            .with_lease_duration(5_000),
        Arc::clone(&store),
        Arc::clone(&artifacts),
    )?
    .spawn();

    let requests = vec![
        JobRequest::new("echo hello from $(hostname)"),
        JobRequest::new("echo $GREETING").with_env("GREETING", "hi there"),
        JobRequest::new("nvidia-smi -L 2>/dev/null || echo no gpu here").with_tag("gpu"),
        JobRequest::new("sleep 0.5 && echo slow").with_tag("cpu"),
        JobRequest::new("echo oops >&2; exit 3"),
    ];
    let ids = orchestrator.submit_many(requests).await?;
    println!("submitted {} jobs", ids.len());

    for id in &ids {
        let job = wait_for_terminal(store.as_ref(), *id, Duration::from_secs(30)).await?;
        let owner = job.owner.as_ref().map(WorkerId::as_str).unwrap_or("-");
        print!("{id} [{}] on {owner}: {}", job.status, job.payload);
        if let Some(result) = &job.result {
            print!(" (exit {:?})", result.exit_code);
            if let Some(artifact) = &result.artifact {
                let output = CapturedOutput::from_blob(&artifacts.read_blob(artifact).await?)?;
                print!(" stdout={:?} stderr={:?}", output.stdout.trim(), output.stderr.trim());
            }
        }
        println!();
    }

    let snapshot = store.snapshot().await?;
    println!(
        "queue: {} succeeded, {} failed, {} pending",
        snapshot.succeeded, snapshot.failed, snapshot.pending
    );
    for worker in store.workers().await? {
        println!("worker {} is {}", worker.worker_id, worker.status);
    }

    cpu.shutdown().await?;
    gpu.shutdown().await?;
    Ok(())
}
