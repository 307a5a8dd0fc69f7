//! Job scheduler: staged DAG execution with locality-aware placement, concurrent dispatch,
//! failure retry, and cancellation (spec.md §4.3), grounded in
//! `original_source/bndl/execute/job.py`.

pub mod accumulator;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod stage;
pub mod task;
pub mod worker;

pub use accumulator::{AccumulatorDelta, Accumulators};
pub use error::{Result, SchedulerError};
pub use job::{Job, TaskResult};
pub use lifecycle::{Lifecycle, State};
pub use stage::Stage;
pub use task::Task;
pub use worker::{TaskOutput, Worker, WorkerPool};
