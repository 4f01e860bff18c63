/// PostgreSQL persistence for the coordination store.
///
/// This module provides `PostgresJobStore`, a PostgreSQL-backed
/// implementation of the [`JobStore`](crate::queue::JobStore) and
/// [`WorkerRegistry`](crate::queue::WorkerRegistry) traits. The tables it
/// expects are described in `sql/schema.sql`.
pub mod postgres;

pub use postgres::PostgresJobStore;
