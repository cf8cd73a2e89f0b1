#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Dispatch core for `tokenbroker` (worker pool, admission queues, streaming
//! generation jobs).

/// Public API for the engine crate.
pub mod api;

mod job;
mod pool;
mod queue;
mod worker;

pub use api::{
    EnlistError, NoopRestart, QueueStats, RestartStrategy, WorkerConfig, WorkerError, WorkerStats,
};
pub use job::{Job, JobMonitor};
pub use pool::WorkerPool;
