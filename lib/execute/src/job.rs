//! A staged, ordered unit of work (spec.md §3 "Job"), grounded in
//! `original_source/bndl/execute/job.py::Job`. A `Job` owns its `Stage`s and drives them strictly
//! in order: stage N+1 is never dispatched until stage N has produced every task result or has
//! been cancelled (spec.md §3 invariant).

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::{mpsc, Mutex};

use crate::{
    accumulator::{AccumulatorDelta, Accumulators},
    error::Result,
    lifecycle::{Lifecycle, State},
    stage::Stage,
    task::Task,
    worker::WorkerPool,
};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// One task's result, tagged with the stage and task it came from, delivered to the caller in
/// task-index order within a stage and stage-index order across stages (spec.md §5 "Ordering
/// guarantees").
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub stage_id: u64,
    pub task_id: u64,
    pub value: serde_json::Value,
}

pub struct Job {
    pub id: u64,
    pub name: Option<String>,
    stages: Mutex<Vec<Arc<Stage>>>,
    next_stage_id: AtomicU64,
    lifecycle: Lifecycle,
    accumulators: Mutex<Accumulators>,
}

impl Job {
    pub fn new(name: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            name,
            stages: Mutex::new(Vec::new()),
            next_stage_id: AtomicU64::new(1),
            lifecycle: Lifecycle::new(),
            accumulators: Mutex::new(Accumulators::default()),
        })
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<State> {
        self.lifecycle.subscribe()
    }

    pub async fn accumulators(&self) -> Accumulators {
        self.accumulators.lock().await.clone()
    }

    /// Reserves the next stage id scoped to this job (spec.md §3: "Stage id — monotonic within
    /// job"), builds that stage's tasks via `build` (so each `Task` can embed the id of the stage
    /// that owns it), and appends the resulting stage.
    pub async fn add_stage(
        self: &Arc<Self>,
        build: impl FnOnce(u64) -> Vec<Arc<Task>>,
    ) -> Arc<Stage> {
        let stage_id = self.next_stage_id.fetch_add(1, Ordering::Relaxed);
        let stage = Stage::new(stage_id, self.id, build(stage_id));
        self.stages.lock().await.push(stage.clone());
        stage
    }

    pub async fn stage_count(&self) -> usize {
        self.stages.lock().await.len()
    }

    /// Cancels every stage of the job (spec.md §4.3 "Cancellation"). Safe to call before, during,
    /// or after [`Self::execute`] has started; a cancel issued before any stage was dispatched
    /// leaves the scheduler stopped having made no worker invocations (spec.md §8).
    pub async fn cancel(self: &Arc<Self>) {
        self.lifecycle.cancel();
        for stage in self.stages.lock().await.iter() {
            stage.cancel().await;
        }
    }

    /// Runs every stage in order, merging each task's accumulator delta into the job's running
    /// totals as it completes, and forwarding each task's result to the returned channel live
    /// (spec.md §2 control flow, §4.3 "Scheduling modes").
    ///
    /// Every stage but (optionally) the last runs eagerly/pipelined; `eager_last_stage` selects
    /// whether the final stage is also pipelined (`true`) or dispatched one task at a time when
    /// the caller declines eager execution (`false`).
    pub fn execute(
        self: &Arc<Self>,
        workers: Arc<WorkerPool>,
        max_attempts: usize,
        eager_last_stage: bool,
    ) -> mpsc::Receiver<Result<TaskResult>> {
        let (tx, rx) = mpsc::channel(64);
        let job = self.clone();
        tokio::spawn(async move {
            job.lifecycle.signal_start();

            let stages = job.stages.lock().await.clone();
            let last_index = stages.len().checked_sub(1);

            for (i, stage) in stages.iter().enumerate() {
                if job.lifecycle.cancelled() {
                    break;
                }

                let is_last = last_index == Some(i);
                let eager = !is_last || eager_last_stage;

                stage.signal_start();
                let mut stage_rx = stage.clone().spawn_dispatch(workers.clone(), eager, max_attempts);

                let mut failed = false;
                while let Some((task_id, result)) = stage_rx.recv().await {
                    match result {
                        Ok(output) => {
                            job.merge_delta(&output.accumulator_delta).await;
                            if tx
                                .send(Ok(TaskResult {
                                    stage_id: stage.id,
                                    task_id,
                                    value: output.value,
                                }))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(err) => {
                            failed = true;
                            let _ = tx.send(Err(err)).await;
                            break;
                        }
                    }
                }

                if failed {
                    stage.cancel().await;
                    for remaining in &stages[i + 1..] {
                        remaining.cancel().await;
                    }
                    job.lifecycle.signal_stop();
                    return;
                }

                stage.signal_stop();
            }

            job.lifecycle.signal_stop();
        });
        rx
    }

    async fn merge_delta(&self, delta: &AccumulatorDelta) {
        self.accumulators.lock().await.merge(delta);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::IpAddr, sync::atomic::AtomicUsize};

    use async_trait::async_trait;

    use super::*;
    use crate::worker::{TaskOutput, Worker};

    struct CountingWorker {
        name: String,
        ip_addresses: HashSet<IpAddr>,
        accumulator_id: &'static str,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn name(&self) -> &str {
            &self.name
        }

        fn ip_addresses(&self) -> &HashSet<IpAddr> {
            &self.ip_addresses
        }

        async fn run_task(&self, _method: &str, args: serde_json::Value) -> Result<TaskOutput> {
            let mut delta = AccumulatorDelta::new();
            delta.add(self.accumulator_id, 1);
            Ok(TaskOutput::with_delta(args, delta))
        }
    }

    fn pool(names: &[&str], accumulator_id: &'static str) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            names
                .iter()
                .map(|n| {
                    Arc::new(CountingWorker {
                        name: (*n).to_owned(),
                        ip_addresses: HashSet::new(),
                        accumulator_id,
                    }) as Arc<dyn Worker>
                })
                .collect(),
        ))
    }

    #[tokio::test]
    async fn zero_stages_yields_nothing_and_stops_immediately() {
        let job = Job::new(None);
        let workers = pool(&["w0"], "acc");
        let mut rx = job.execute(workers, 1, true);
        assert!(rx.recv().await.is_none());
        assert_eq!(job.state(), State::Stopped);
    }

    #[tokio::test]
    async fn two_stage_job_merges_accumulators_and_preserves_order() {
        let job = Job::new(Some("range-count".to_owned()));
        job.add_stage(|stage_id| {
            (0..10)
                .map(|i| Task::new(i, stage_id, "inc", serde_json::json!(i), vec![], vec![]))
                .collect()
        })
        .await;
        job.add_stage(|stage_id| {
            (0..1)
                .map(|i| Task::new(100 + i, stage_id, "count", serde_json::json!(10), vec![], vec![]))
                .collect()
        })
        .await;

        let workers = pool(&["w0", "w1"], "a");
        let mut rx = job.execute(workers, 1, true);

        let mut seen = Vec::new();
        while let Some(result) = rx.recv().await {
            seen.push(result.unwrap());
        }
        assert_eq!(seen.len(), 11);
        // Stage A's results precede stage B's.
        assert!(seen.iter().take(10).all(|r| r.stage_id == seen[0].stage_id));
        assert_eq!(seen.last().unwrap().value, serde_json::json!(10));
        assert_eq!(job.accumulators().await.get("a"), 11);
        assert_eq!(job.state(), State::Stopped);
    }

    #[tokio::test]
    async fn cancel_before_dispatch_runs_no_tasks() {
        let job = Job::new(None);
        job.add_stage(|stage_id| {
            (0..3)
                .map(|i| Task::new(i, stage_id, "noop", serde_json::Value::Null, vec![], vec![]))
                .collect()
        })
        .await;
        job.cancel().await;

        let workers = pool(&["w0"], "a");
        let mut rx = job.execute(workers, 1, true);
        assert!(rx.recv().await.is_none());
    }
}
