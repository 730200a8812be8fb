//! Execution: the per-seed executor and the CPU-pinned worker threads that
//! drive it against the PUT.

pub mod executor;
pub mod worker;

pub use executor::Executor;
pub use worker::{spawn_workers, Job, Worker, WorkerEvent};
