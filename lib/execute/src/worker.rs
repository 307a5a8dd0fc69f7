//! The scheduler's view of an executor (spec.md §6 "Scheduler ↔ worker contract"), modeled as a
//! trait object per spec.md §9's redesign note rather than a concrete RPC stub, so the driver can
//! be tested against an in-process fake without a real transport.

use std::{collections::HashSet, net::IpAddr};

use async_trait::async_trait;

use crate::{accumulator::AccumulatorDelta, error::Result};

/// Value produced by a single task attempt: the user-visible result plus whatever it contributed
/// to the job's accumulators.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub value: serde_json::Value,
    pub accumulator_delta: AccumulatorDelta,
}

impl TaskOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            accumulator_delta: AccumulatorDelta::new(),
        }
    }

    pub fn with_delta(value: serde_json::Value, accumulator_delta: AccumulatorDelta) -> Self {
        Self {
            value,
            accumulator_delta,
        }
    }
}

/// An executor the scheduler can dispatch a task onto. A worker's health is surfaced purely
/// through `run_task` failing or a future never completing (spec.md §6) — there is no separate
/// health-check method.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;
    fn ip_addresses(&self) -> &HashSet<IpAddr>;
    async fn run_task(&self, method: &str, args: serde_json::Value) -> Result<TaskOutput>;
}

/// The driver's registry of known workers (spec.md §3 "Node" / §4.3's `workers` list).
#[derive(Default, Clone)]
pub struct WorkerPool {
    workers: Vec<std::sync::Arc<dyn Worker>>,
}

impl WorkerPool {
    pub fn new(workers: Vec<std::sync::Arc<dyn Worker>>) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> &[std::sync::Arc<dyn Worker>] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<std::sync::Arc<dyn Worker>> {
        self.workers.iter().find(|w| w.name() == name).cloned()
    }
}
