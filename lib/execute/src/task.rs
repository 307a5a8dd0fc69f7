//! A single unit of dispatch (spec.md §3 "Task"), grounded in
//! `original_source/bndl/execute/job.py::Task`.

use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};

use tokio::sync::Mutex;

use crate::{
    error::{Result, SchedulerError},
    lifecycle::Lifecycle,
    worker::{TaskOutput, Worker},
};

pub struct Task {
    pub id: u64,
    pub stage_id: u64,
    pub method: String,
    /// Released (`None`) after a successful attempt, to free memory per spec.md §3's "args
    /// released after success" ownership note.
    args: Mutex<Option<serde_json::Value>>,
    pub preferred_workers: Vec<String>,
    pub allowed_workers: Vec<String>,
    lifecycle: Lifecycle,
    attempts_made: AtomicUsize,
}

impl Task {
    pub fn new(
        id: u64,
        stage_id: u64,
        method: impl Into<String>,
        args: serde_json::Value,
        preferred_workers: Vec<String>,
        allowed_workers: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            stage_id,
            method: method.into(),
            args: Mutex::new(Some(args)),
            preferred_workers,
            allowed_workers,
            lifecycle: Lifecycle::new(),
            attempts_made: AtomicUsize::new(0),
        })
    }

    pub fn attempts_made(&self) -> usize {
        self.attempts_made.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.lifecycle.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.lifecycle.cancelled()
    }

    pub fn stopped(&self) -> bool {
        self.lifecycle.stopped()
    }

    /// Dispatches to `worker`, retrying on a fresh worker up to `max_attempts` times (spec.md
    /// §4.3 "Retry"). A fresh future is created per attempt, per spec.md §3's invariant that a
    /// task's future is set exactly once per attempt.
    pub async fn execute_with_retry(
        self: &Arc<Self>,
        mut pick_worker: impl FnMut() -> Option<Arc<dyn Worker>>,
        max_attempts: usize,
    ) -> Result<TaskOutput> {
        self.lifecycle.signal_start();
        let max_attempts = max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self.lifecycle.cancelled() {
                self.lifecycle.signal_stop();
                return Err(error_stack::Report::new(SchedulerError::TaskCancelled {
                    stage_id: self.stage_id,
                    task_id: self.id,
                }));
            }

            let Some(worker) = pick_worker() else {
                self.lifecycle.signal_stop();
                return Err(error_stack::Report::new(SchedulerError::NoEligibleWorker {
                    stage_id: self.stage_id,
                    task_id: self.id,
                }));
            };

            self.attempts_made.store(attempt, Ordering::SeqCst);
            let args = self.args.lock().await.clone().unwrap_or(serde_json::Value::Null);

            match worker.run_task(&self.method, args).await {
                Ok(output) => {
                    *self.args.lock().await = None;
                    self.lifecycle.signal_stop();
                    return Ok(output);
                }
                Err(err) => {
                    tracing::warn!(
                        task_id = self.id,
                        stage_id = self.stage_id,
                        attempt,
                        ?err,
                        "task attempt failed"
                    );
                    if attempt == max_attempts {
                        self.lifecycle.signal_stop();
                        return Err(error_stack::Report::new(SchedulerError::TaskFailed {
                            stage_id: self.stage_id,
                            task_id: self.id,
                            attempts: attempt,
                        })
                        .attach_printable(format!("last attempt failed with: {err:?}")));
                    }
                }
            }
        }
        unreachable!("loop always returns by the final attempt")
    }
}
