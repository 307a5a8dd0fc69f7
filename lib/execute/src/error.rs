use thiserror::Error;

pub type Result<T, E = SchedulerError> = error_stack::Result<T, E>;

/// Error taxonomy for the scheduler (spec.md §7): remote invocation failures are wrapped by the
/// `Worker` boundary, then escalated to a terminal `TaskFailed`/`TaskCancelled` once retries are
/// exhausted or cancellation observed.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("remote invocation failed: {0}")]
    RemoteFailure(String),

    #[error("task {task_id} in stage {stage_id} failed after {attempts} attempt(s)")]
    TaskFailed {
        stage_id: u64,
        task_id: u64,
        attempts: usize,
    },

    #[error("task {task_id} in stage {stage_id} was cancelled")]
    TaskCancelled { stage_id: u64, task_id: u64 },

    #[error("no eligible worker available for task {task_id} in stage {stage_id}")]
    NoEligibleWorker { stage_id: u64, task_id: u64 },
}
