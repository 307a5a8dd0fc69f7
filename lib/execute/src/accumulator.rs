//! Per-task accumulator side-channel (SPEC_FULL.md §4.3), the concrete resolution of spec.md §9's
//! "Accumulators as user-facing mutable globals" redesign note: a task's result carries an
//! [`AccumulatorDelta`] alongside its value, and the scheduler merges deltas into a job-owned
//! [`Accumulators`] map keyed by accumulator id as each task completes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The delta a single task attempt contributes to one or more named accumulators.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AccumulatorDelta(HashMap<String, i64>);

impl AccumulatorDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<String>, delta: i64) {
        *self.0.entry(id.into()).or_insert(0) += delta;
    }

    pub fn get(&self, id: &str) -> i64 {
        *self.0.get(id).unwrap_or(&0)
    }
}

/// A job's running totals, merged from every completed task's `AccumulatorDelta` in completion
/// order. Survives a dataset's cached re-execution (spec.md §8 scenario 2): re-running a
/// downstream stage against cached blocks never re-merges the upstream stage's deltas, since the
/// upstream stage is never re-executed in that case.
#[derive(Debug, Default, Clone)]
pub struct Accumulators {
    values: HashMap<String, i64>,
}

impl Accumulators {
    pub fn merge(&mut self, delta: &AccumulatorDelta) {
        for (id, value) in &delta.0 {
            *self.values.entry(id.clone()).or_insert(0) += value;
        }
    }

    pub fn get(&self, id: &str) -> i64 {
        *self.values.get(id).unwrap_or(&0)
    }
}
