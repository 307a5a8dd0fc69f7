//! End-to-end scheduler scenarios (spec.md §8), driving `Job`/`Stage`/`Task` against in-process
//! fake workers rather than mocks, mirroring
//! `original_source/bndl/compute/tests/test_task_failure.py`'s scenarios.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use execute::{Job, Result, SchedulerError, Task, TaskOutput, Worker, WorkerPool};

struct PartitionWorker {
    name: String,
    ip_addresses: HashSet<IpAddr>,
}

#[async_trait]
impl Worker for PartitionWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip_addresses(&self) -> &HashSet<IpAddr> {
        &self.ip_addresses
    }

    async fn run_task(&self, _method: &str, args: serde_json::Value) -> Result<TaskOutput> {
        let size = args.as_u64().expect("partition size arg");
        Ok(TaskOutput::new(serde_json::json!(size)))
    }
}

fn workers(names: &[&str]) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(
        names
            .iter()
            .map(|n| {
                Arc::new(PartitionWorker {
                    name: (*n).to_owned(),
                    ip_addresses: HashSet::new(),
                }) as Arc<dyn Worker>
            })
            .collect(),
    ))
}

/// spec.md §8 scenario 1: a single stage splitting `range(1000)` four ways yields
/// `250, 250, 250, 250` in order, summing to 1000.
#[tokio::test]
async fn range_count_yields_equal_partitions_in_order() {
    let job = Job::new(Some("range-count".to_owned()));
    job.add_stage(|stage_id| {
        (0..4)
            .map(|i| Task::new(i, stage_id, "partition_len", serde_json::json!(250), Vec::new(), Vec::new()))
            .collect()
    })
    .await;

    let pool = workers(&["w0", "w1", "w2", "w3"]);
    let mut rx = job.execute(pool, 1, true);

    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result.unwrap().value.as_u64().unwrap());
    }
    assert_eq!(results, vec![250, 250, 250, 250]);
    assert_eq!(results.iter().sum::<u64>(), 1000);
}

struct FlakyWorker {
    name: String,
    ip_addresses: HashSet<IpAddr>,
    /// Tasks dispatched to this worker fail on their first call only.
    seen_once: std::sync::Mutex<HashSet<u64>>,
    failures: AtomicUsize,
}

#[async_trait]
impl Worker for FlakyWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip_addresses(&self) -> &HashSet<IpAddr> {
        &self.ip_addresses
    }

    async fn run_task(&self, _method: &str, args: serde_json::Value) -> Result<TaskOutput> {
        let task_id = args.as_u64().expect("task id arg");
        let first_time = self.seen_once.lock().unwrap().insert(task_id);
        if first_time {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(error_stack::Report::new(SchedulerError::RemoteFailure(
                "w0 always fails the first attempt".to_owned(),
            )));
        }
        Ok(TaskOutput::new(args))
    }
}

struct ReliableWorker {
    name: String,
    ip_addresses: HashSet<IpAddr>,
    calls: AtomicUsize,
}

#[async_trait]
impl Worker for ReliableWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip_addresses(&self) -> &HashSet<IpAddr> {
        &self.ip_addresses
    }

    async fn run_task(&self, _method: &str, args: serde_json::Value) -> Result<TaskOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TaskOutput::new(args))
    }
}

/// spec.md §8 scenario 5: with `attempts=2` and 10 tasks whose first attempt on `w0` always
/// fails, the stage's collected results equal the non-failing reference — every task eventually
/// succeeds on retry.
#[tokio::test]
async fn retry_recovers_every_task_whose_first_attempt_fails() {
    let w0 = Arc::new(FlakyWorker {
        name: "w0".to_owned(),
        ip_addresses: HashSet::new(),
        seen_once: std::sync::Mutex::new(HashSet::new()),
        failures: AtomicUsize::new(0),
    });
    let w1 = Arc::new(ReliableWorker {
        name: "w1".to_owned(),
        ip_addresses: HashSet::new(),
        calls: AtomicUsize::new(0),
    });
    let pool = Arc::new(WorkerPool::new(vec![
        w0.clone() as Arc<dyn Worker>,
        w1.clone() as Arc<dyn Worker>,
    ]));

    let job = Job::new(None);
    job.add_stage(|stage_id| {
        (0..10)
            .map(|i| Task::new(i, stage_id, "echo", serde_json::json!(i), Vec::new(), Vec::new()))
            .collect()
    })
    .await;

    let mut rx = job.execute(pool, 2, true);
    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result.unwrap().value.as_u64().unwrap());
    }
    results.sort_unstable();
    assert_eq!(results, (0..10).collect::<Vec<_>>());
}

/// spec.md §4.3 "Failure semantics summary": once attempts are exhausted, the stage fails, its
/// remaining tasks are cancelled, and the job fails — intermediate (already-yielded) results stay
/// valid up to that point (spec.md §7 "Propagation").
#[tokio::test]
async fn exhausting_attempts_fails_the_job_after_yielding_earlier_results() {
    struct AlwaysFails;
    #[async_trait]
    impl Worker for AlwaysFails {
        fn name(&self) -> &str {
            "w0"
        }
        fn ip_addresses(&self) -> &HashSet<IpAddr> {
            static EMPTY: std::sync::OnceLock<HashSet<IpAddr>> = std::sync::OnceLock::new();
            EMPTY.get_or_init(HashSet::new)
        }
        async fn run_task(&self, _method: &str, _args: serde_json::Value) -> Result<TaskOutput> {
            Err(error_stack::Report::new(SchedulerError::RemoteFailure(
                "permanently broken".to_owned(),
            )))
        }
    }

    let pool = Arc::new(WorkerPool::new(vec![Arc::new(AlwaysFails) as Arc<dyn Worker>]));
    let job = Job::new(None);
    job.add_stage(|stage_id| {
        (0..3)
            .map(|i| Task::new(i, stage_id, "echo", serde_json::json!(i), Vec::new(), Vec::new()))
            .collect()
    })
    .await;

    let mut rx = job.execute(pool, 1, true);
    let mut saw_failure = false;
    while let Some(result) = rx.recv().await {
        if result.is_err() {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
    assert_eq!(job.state(), execute::State::Stopped);
}
