//! Background processing: durable job queue, worker state machine, and the
//! cleanup sweeper

mod job_queue;
mod sweeper;
mod worker;

pub use job_queue::JobQueue;
pub use sweeper::{CleanupSweeper, SweepReport};
pub use worker::IngestWorker;
