//! Test support for clusterq: an in-memory coordination store, an in-memory
//! artifact area, a fault injector and request fixtures.

pub mod job;
pub mod mock;
pub mod store;

pub use job::*;
pub use mock::*;
pub use store::*;
