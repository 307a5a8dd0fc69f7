//! A contiguous, dependency-free group of tasks (spec.md §3 "Stage"), executed either eagerly
//! (pipelined, every stage but possibly the last) or one task at a time (spec.md §4.3). Grounded
//! in `original_source/bndl/execute/job.py::Stage`.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{mpsc, Mutex, Notify, Semaphore};

use crate::{
    error::{Result, SchedulerError},
    lifecycle::Lifecycle,
    task::Task,
    worker::{TaskOutput, Worker, WorkerPool},
};

pub struct Stage {
    pub id: u64,
    pub job_id: u64,
    pub tasks: Vec<Arc<Task>>,
    lifecycle: Lifecycle,
}

impl Stage {
    pub fn new(id: u64, job_id: u64, tasks: Vec<Arc<Task>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            job_id,
            tasks,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn stopped(&self) -> bool {
        self.lifecycle.stopped()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<crate::lifecycle::State> {
        self.lifecycle.subscribe()
    }

    /// Marks the stage running. Exposed separately from [`Self::execute`] so [`crate::job::Job`]
    /// can observe stage-start before consuming [`Self::spawn_dispatch`]'s stream.
    pub fn signal_start(&self) {
        self.lifecycle.signal_start();
    }

    /// Marks the stage stopped without cancelling it. Called by the owning [`crate::job::Job`]
    /// once a stage's dispatch stream is fully drained without failure.
    pub fn signal_stop(&self) {
        self.lifecycle.signal_stop();
    }

    pub async fn cancel(self: &Arc<Self>) {
        self.lifecycle.cancel();
        for task in &self.tasks {
            task.cancel();
        }
        self.lifecycle.signal_stop();
    }

    /// Runs every task, yielding results strictly in task order (spec.md §8's quantified
    /// invariant), in either eager or one-by-one mode. On the first task failure, remaining tasks
    /// are cancelled and the failure is returned — matching spec.md §4.3's failure semantics.
    ///
    /// Standalone entry point (used directly by tests and by any caller that wants one stage run
    /// to completion rather than streamed); [`crate::job::Job`] instead drives
    /// [`Self::spawn_dispatch`] so it can forward each task's result to its own caller as it
    /// arrives, without waiting for the whole stage to finish.
    pub async fn execute(
        self: &Arc<Self>,
        workers: Arc<WorkerPool>,
        eager: bool,
        max_attempts: usize,
    ) -> Result<(Vec<serde_json::Value>, Vec<crate::accumulator::AccumulatorDelta>)> {
        self.lifecycle.signal_start();

        let mut rx = self.clone().spawn_dispatch(workers, eager, max_attempts);

        let mut values = Vec::with_capacity(self.tasks.len());
        let mut deltas = Vec::with_capacity(self.tasks.len());
        let mut failure = None;
        while let Some((_, result)) = rx.recv().await {
            match result {
                Ok(output) => {
                    values.push(output.value);
                    deltas.push(output.accumulator_delta);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.cancel().await;
            return Err(err);
        }
        self.lifecycle.signal_stop();
        Ok((values, deltas))
    }

    /// Dispatches this stage's tasks in the requested mode, without waiting for completion.
    /// Returns a channel of `(task_id, result)` pairs delivered in task-index order.
    pub fn spawn_dispatch(
        self: Arc<Self>,
        workers: Arc<WorkerPool>,
        eager: bool,
        max_attempts: usize,
    ) -> mpsc::Receiver<(u64, Result<TaskOutput>)> {
        if eager {
            self.spawn_eager(workers, max_attempts)
        } else {
            self.spawn_onebyone(workers, max_attempts)
        }
    }

    fn eligible_workers(task: &Task, workers: &WorkerPool) -> Vec<Arc<dyn Worker>> {
        if !task.preferred_workers.is_empty() {
            task.preferred_workers
                .iter()
                .filter_map(|n| workers.by_name(n))
                .collect()
        } else if !task.allowed_workers.is_empty() {
            task.allowed_workers
                .iter()
                .filter_map(|n| workers.by_name(n))
                .collect()
        } else {
            workers.workers().to_vec()
        }
    }

    /// Builds the retry-time worker picker for one task: same eligibility rule as the initial
    /// dispatch, preferring a worker different from the one that just failed. `initial_last`
    /// seeds the "just failed" worker with whatever ran the first attempt, so a retry picker
    /// built around an already-dispatched attempt 1 doesn't re-pick that same worker on its
    /// first call.
    fn retry_picker(
        task: Arc<Task>,
        workers: Arc<WorkerPool>,
        initial_last: Option<String>,
    ) -> impl FnMut() -> Option<Arc<dyn Worker>> {
        let mut last = initial_last;
        move || {
            let candidates = Stage::eligible_workers(&task, &workers);
            let chosen = candidates
                .iter()
                .find(|w| last.as_deref() != Some(w.name()))
                .or_else(|| candidates.first())
                .cloned();
            if let Some(w) = &chosen {
                last = Some(w.name().to_owned());
            }
            chosen
        }
    }

    /// Pipelined dispatch (spec.md §4.3 "Eager algorithm"): a LIFO schedule queue, a FIFO yield
    /// queue, an occupied-worker set, and a semaphore bounding concurrency to the worker count.
    fn spawn_eager(
        self: Arc<Self>,
        workers: Arc<WorkerPool>,
        max_attempts: usize,
    ) -> mpsc::Receiver<(u64, Result<TaskOutput>)> {
        let (tx, rx) = mpsc::channel(self.tasks.len().max(1));
        tokio::spawn(async move {
            let permits = workers.len().max(1);
            let semaphore = Arc::new(Semaphore::new(permits));
            let occupied: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
            let worker_freed = Arc::new(Notify::new());

            let mut to_schedule: VecDeque<Arc<Task>> = self.tasks.iter().cloned().collect();
            let mut to_yield: VecDeque<Arc<Task>> = self.tasks.iter().cloned().collect();
            let mut handles: std::collections::HashMap<u64, tokio::task::JoinHandle<Result<TaskOutput>>> =
                std::collections::HashMap::new();

            while !to_yield.is_empty() {
                while let Some(task) = to_schedule.front().cloned() {
                    if task.cancelled() {
                        to_schedule.pop_front();
                        handles.insert(
                            task.id,
                            tokio::spawn(async move {
                                Err(error_stack::Report::new(SchedulerError::TaskCancelled {
                                    stage_id: task.stage_id,
                                    task_id: task.id,
                                }))
                            }),
                        );
                        continue;
                    }

                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let candidates = Self::eligible_workers(&task, &workers);
                    let worker = {
                        let occ = occupied.lock().await;
                        candidates.into_iter().find(|w| !occ.contains(w.name()))
                    };
                    let Some(worker) = worker else {
                        drop(permit);
                        break;
                    };

                    to_schedule.pop_front();
                    occupied.lock().await.insert(worker.name().to_owned());

                    let task2 = task.clone();
                    let workers2 = workers.clone();
                    let occupied2 = occupied.clone();
                    let worker_freed2 = worker_freed.clone();
                    let worker_name = worker.name().to_owned();
                    let handle = tokio::spawn(async move {
                        let mut picker =
                            Self::retry_picker(task2.clone(), workers2, Some(worker_name.clone()));
                        // the initial attempt uses the worker already chosen and marked occupied
                        let result = task2
                            .execute_with_retry(
                                {
                                    let mut used_first = false;
                                    move || {
                                        if !used_first {
                                            used_first = true;
                                            Some(worker.clone())
                                        } else {
                                            picker()
                                        }
                                    }
                                },
                                max_attempts,
                            )
                            .await;
                        occupied2.lock().await.remove(&worker_name);
                        worker_freed2.notify_waiters();
                        drop(permit);
                        result
                    });
                    handles.insert(task.id, handle);
                }

                let head = to_yield.front().cloned().expect("to_yield non-empty by loop guard");
                let head_ready = handles.get(&head.id).map(|h| h.is_finished()).unwrap_or(false);

                if to_schedule.is_empty() || head_ready {
                    to_yield.pop_front();
                    let handle = handles
                        .remove(&head.id)
                        .expect("every task is eventually scheduled");
                    let result = handle.await.unwrap_or_else(|_| {
                        Err(error_stack::Report::new(SchedulerError::TaskCancelled {
                            stage_id: head.stage_id,
                            task_id: head.id,
                        }))
                    });
                    let is_err = result.is_err();
                    if tx.send((head.id, result)).await.is_err() {
                        return;
                    }
                    if is_err {
                        for handle in handles.values() {
                            handle.abort();
                        }
                        return;
                    }
                } else {
                    tokio::select! {
                        _ = worker_freed.notified() => {},
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {},
                    }
                }
            }
        });
        rx
    }

    /// Sequential dispatch (spec.md §4.3 "One-by-one algorithm"): used for the final stage when
    /// the caller declines eager execution.
    fn spawn_onebyone(
        self: Arc<Self>,
        workers: Arc<WorkerPool>,
        max_attempts: usize,
    ) -> mpsc::Receiver<(u64, Result<TaskOutput>)> {
        let (tx, rx) = mpsc::channel(self.tasks.len().max(1));
        tokio::spawn(async move {
            for task in &self.tasks {
                if task.cancelled() {
                    let _ = tx
                        .send((
                            task.id,
                            Err(error_stack::Report::new(SchedulerError::TaskCancelled {
                                stage_id: task.stage_id,
                                task_id: task.id,
                            })),
                        ))
                        .await;
                    return;
                }
                let mut picker = Self::retry_picker(task.clone(), workers.clone(), None);
                let result = task.execute_with_retry(&mut picker, max_attempts).await;
                let is_err = result.is_err();
                if tx.send((task.id, result)).await.is_err() {
                    return;
                }
                if is_err {
                    return;
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::IpAddr, sync::atomic::{AtomicUsize, Ordering}};

    use async_trait::async_trait;

    use super::*;
    use crate::worker::TaskOutput;

    struct DummyWorker {
        name: String,
        ip_addresses: HashSet<IpAddr>,
        fail_first_n: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Worker for DummyWorker {
        fn name(&self) -> &str {
            &self.name
        }

        fn ip_addresses(&self) -> &HashSet<IpAddr> {
            &self.ip_addresses
        }

        async fn run_task(&self, _method: &str, args: serde_json::Value) -> Result<TaskOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err(error_stack::Report::new(SchedulerError::RemoteFailure(
                    "injected failure".to_owned(),
                )));
            }
            Ok(TaskOutput::new(args))
        }
    }

    fn workers(names: &[&str]) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            names
                .iter()
                .map(|n| {
                    Arc::new(DummyWorker {
                        name: (*n).to_owned(),
                        ip_addresses: HashSet::new(),
                        fail_first_n: AtomicUsize::new(0),
                        calls: AtomicUsize::new(0),
                    }) as Arc<dyn Worker>
                })
                .collect(),
        ))
    }

    #[tokio::test]
    async fn eager_yields_in_task_order() {
        let tasks: Vec<_> = (0..4)
            .map(|i| Task::new(i, 1, "len", serde_json::json!(i * 100), vec![], vec![]))
            .collect();
        let stage = Stage::new(1, 1, tasks);
        let pool = workers(&["w0", "w1", "w2", "w3"]);
        let (values, _) = stage.execute(pool, true, 1).await.unwrap();
        let got: Vec<i64> = values.iter().map(|v| v.as_i64().unwrap()).collect();
        assert_eq!(got, vec![0, 100, 200, 300]);
    }

    #[tokio::test]
    async fn one_by_one_runs_sequentially() {
        let tasks: Vec<_> = (0..3)
            .map(|i| Task::new(i, 1, "len", serde_json::json!(i), vec![], vec![]))
            .collect();
        let stage = Stage::new(1, 1, tasks);
        let pool = workers(&["w0"]);
        let (values, _) = stage.execute(pool, false, 1).await.unwrap();
        let got: Vec<i64> = values.iter().map(|v| v.as_i64().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn retry_uses_a_different_worker_on_failure() {
        let w0 = Arc::new(DummyWorker {
            name: "w0".to_owned(),
            ip_addresses: HashSet::new(),
            fail_first_n: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
        });
        let w1 = Arc::new(DummyWorker {
            name: "w1".to_owned(),
            ip_addresses: HashSet::new(),
            fail_first_n: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let pool = Arc::new(WorkerPool::new(vec![
            w0.clone() as Arc<dyn Worker>,
            w1.clone() as Arc<dyn Worker>,
        ]));
        let task = Task::new(0, 1, "len", serde_json::json!(42), vec![], vec![]);
        let stage = Stage::new(1, 1, vec![task]);
        let (values, _) = stage.execute(pool, true, 2).await.unwrap();
        assert_eq!(values[0].as_i64().unwrap(), 42);
        assert_eq!(w0.calls.load(Ordering::SeqCst), 1);
        assert_eq!(w1.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_stage() {
        let w0 = Arc::new(DummyWorker {
            name: "w0".to_owned(),
            ip_addresses: HashSet::new(),
            fail_first_n: AtomicUsize::new(5),
            calls: AtomicUsize::new(0),
        });
        let pool = Arc::new(WorkerPool::new(vec![w0 as Arc<dyn Worker>]));
        let task = Task::new(0, 1, "len", serde_json::json!(1), vec![], vec![]);
        let stage = Stage::new(1, 1, vec![task]);
        let err = stage.execute(pool, true, 2).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            SchedulerError::TaskFailed { attempts: 2, .. }
        ));
        assert!(stage.stopped());
    }

    #[tokio::test]
    async fn empty_stage_yields_nothing_and_stops() {
        let stage = Stage::new(1, 1, Vec::new());
        let pool = workers(&["w0"]);
        let (values, deltas) = stage.execute(pool, true, 1).await.unwrap();
        assert!(values.is_empty());
        assert!(deltas.is_empty());
        assert!(stage.stopped());
    }
}
