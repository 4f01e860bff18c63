/// Cancellation signal shared by the worker loops.
pub mod cancel;
/// Lease renewal and reclaim loops.
pub mod lease_manager;
/// Payload execution for one claimed job.
pub mod slot;
/// Worker agent, slot pool and handle.
pub mod worker;

pub use cancel::CancelToken;
pub use lease_manager::{LeaseManager, Reclaimer};
pub use slot::{ExecutionSlot, SlotOutcome, JOB_ID_VAR};
pub use worker::{SlotGuard, SlotPool, WorkerAgent, WorkerHandle};
