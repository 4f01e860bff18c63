//! clusterq - a lease-based distributed job queue.
//!
//! Submitters put shell payloads into a shared coordination store; worker
//! agents on any number of machines claim them atomically, run them in a
//! fixed number of execution slots and keep ownership alive with heartbeats.
//! A job whose owner stops heartbeating is reclaimed and runs again
//! elsewhere.
//!
//! # Core Concepts
//!
//! - **Job**: a payload with environment, tags and a lifecycle status
//!   ([`Job`], [`JobStatus`]).
//!
//! - **Store**: the [`JobStore`] trait is the only synchronization point
//!   between workers. Every mutation is a single conditional update keyed on
//!   the current owner and status.
//!
//! - **Lease**: a time-bounded ownership grant ([`LeaseConfig`]) renewed by
//!   the [`runtime::LeaseManager`]. It signals liveness, not a deadline.
//!
//! - **Runtime**: [`runtime::WorkerAgent`] runs the poll loop, the lease
//!   loop and one [`runtime::ExecutionSlot`] task per running job.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store via sqlx
//! - `metrics` - Prometheus metrics
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use clusterq::*;
//! use clusterq::runtime::WorkerAgent;
//!
//! let store = Arc::new(PostgresJobStore::new(pool));
//! let artifacts = Arc::new(FsArtifactStore::new("/shared/clusterq"));
//!
//! Orchestrator::new(Arc::clone(&store))
//!     .submit(JobRequest::new("echo $X").with_env("X", "hi"))
//!     .await?;
//!
//! let worker = WorkerAgent::new(WorkerConfig::new("node-1").with_slots(4), store, artifacts)?
//!     .spawn();
//! // ...
//! worker.shutdown().await?;
//! ```

/// Result blobs and the shared artifact area.
pub mod artifact;

/// Configuration for persistence, workers and payload execution.
pub mod config;

/// Error taxonomy shared by stores and workers.
pub mod error;

/// Job records, identifiers, tags and the status state machine.
pub mod job;

/// Lease timing.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Job submission.
pub mod orchestrator;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
pub mod persistence;

/// The coordination store traits and queue snapshots.
pub mod queue;

/// Backoff and retry for transient store failures.
pub mod retry;

/// Worker-side loops and payload execution.
pub mod runtime;

/// Tracing spans and lifecycle events.
pub mod telemetry;

pub use artifact::*;
pub use config::*;
pub use error::{QueueError, Result};
pub use job::*;
pub use lease::*;
pub use orchestrator::Orchestrator;
#[cfg(feature = "postgres")]
pub use persistence::PostgresJobStore;
pub use queue::*;
pub use retry::*;
