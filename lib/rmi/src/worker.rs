//! Bridges the scheduler's abstract `execute::Worker` trait to a real peer over the wire,
//! grounded in `original_source/bndl/compute/worker.py::Worker` — there, a worker process *is* a
//! `Node` that registers an execution service alongside `BlockManager`; a task is dispatched by
//! calling `worker.run_task(method, *args)`, which in the distributed case is an RPC.
//!
//! `TaskRegistry` is this crate's stand-in for `bndl.execute.worker.ExecutionWorker`'s method
//! dispatch: a small, named set of task bodies a worker process can run on behalf of a remote
//! driver. Real task bodies are necessarily local to the worker process — there is no way to ship
//! a driver-defined closure across the wire — so the registry is populated once at worker
//! startup from a fixed, named set (see `builtin()`), the demo-job equivalent of spec.md's
//! excluded dataset DSL.

use std::{collections::HashSet, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use error_stack::ResultExt;
use execute::{AccumulatorDelta, SchedulerError, TaskOutput};
use net::{Node, RequestContext, Service};
use serde::{Deserialize, Serialize};

/// One named task body a worker can run. Mirrors the call surface `Task.execute` expects of a
/// worker in `original_source/bndl/execute/job.py`: a method name plus a JSON argument value.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value) -> execute::Result<TaskOutput>;
}

/// A worker's dispatch table, keyed by method name.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: std::collections::HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    /// The demo task set a `cli worker` process exposes out of the box: `echo` (returns its
    /// argument unchanged) and `inc` (returns its argument unchanged, contributing `1` to the
    /// `count` accumulator) — enough to drive the `cli submit` demo job.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("inc", Arc::new(IncHandler));
        registry
    }

    fn get(&self, method: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(method).cloned()
    }
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn call(&self, args: serde_json::Value) -> execute::Result<TaskOutput> {
        Ok(TaskOutput::new(args))
    }
}

struct IncHandler;

#[async_trait]
impl TaskHandler for IncHandler {
    async fn call(&self, args: serde_json::Value) -> execute::Result<TaskOutput> {
        let mut delta = AccumulatorDelta::new();
        delta.add("count", 1);
        Ok(TaskOutput::with_delta(args, delta))
    }
}

#[derive(Deserialize)]
struct RunTaskRequest {
    method: String,
    args: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct RunTaskResponse {
    value: serde_json::Value,
    accumulator_delta: AccumulatorDelta,
}

/// Registered under `"execute"` in a worker node's service table — the RPC-facing side of
/// `TaskRegistry`.
pub struct ExecutorService {
    registry: TaskRegistry,
}

impl ExecutorService {
    pub fn new(registry: TaskRegistry) -> Arc<Self> {
        Arc::new(Self { registry })
    }
}

#[async_trait]
impl Service for ExecutorService {
    fn name(&self) -> &'static str {
        "execute"
    }

    async fn call(
        &self,
        method: &str,
        payload: serde_json::Value,
        _attachments: Vec<Bytes>,
        _ctx: &RequestContext,
    ) -> net::Result<(serde_json::Value, Vec<Bytes>)> {
        if method != "run_task" {
            return Err(error_stack::Report::new(net::NetError::transport(format!(
                "unknown execute method {method}"
            ))));
        }
        let req: RunTaskRequest = serde_json::from_value(payload)
            .map_err(|e| error_stack::Report::new(net::NetError::transport(e.to_string())))?;
        let handler = self.registry.get(&req.method).ok_or_else(|| {
            error_stack::Report::new(net::NetError::transport(format!(
                "no task handler registered for method {}",
                req.method
            )))
        })?;
        let output = handler
            .call(req.args)
            .await
            .map_err(|report| error_stack::Report::new(net::NetError::transport(format!("{report:?}"))))?;
        let response = RunTaskResponse {
            value: output.value,
            accumulator_delta: output.accumulator_delta,
        };
        let payload = serde_json::to_value(response)
            .map_err(|e| error_stack::Report::new(net::NetError::transport(e.to_string())))?;
        Ok((payload, Vec::new()))
    }
}

/// An `execute::Worker` that forwards every task to a connected peer's `"execute"` service —
/// the scheduler's view of a remote worker process (spec.md §6 "Scheduler ↔ worker contract").
pub struct RemoteWorker {
    node: Arc<Node>,
    name: String,
    ip_addresses: HashSet<IpAddr>,
}

impl RemoteWorker {
    pub fn new(node: Arc<Node>, peer: &net::PeerSnapshot) -> Self {
        Self {
            node,
            name: peer.name.clone(),
            ip_addresses: peer.ip_addresses.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl execute::Worker for RemoteWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip_addresses(&self) -> &HashSet<IpAddr> {
        &self.ip_addresses
    }

    async fn run_task(&self, method: &str, args: serde_json::Value) -> execute::Result<TaskOutput> {
        let (payload, _) = self
            .node
            .call(
                &self.name,
                "execute",
                "run_task",
                serde_json::json!({ "method": method, "args": args }),
                Vec::new(),
            )
            .await
            .map_err(|report| {
                error_stack::Report::new(SchedulerError::RemoteFailure(format!("{report:?}")))
            })?;
        let response: RunTaskResponse = serde_json::from_value(payload)
            .change_context(SchedulerError::RemoteFailure(format!(
                "malformed run_task response from {}",
                self.name
            )))?;
        Ok(TaskOutput::with_delta(response.value, response.accumulator_delta))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use config::Config;
    use net::NodeAddress;

    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            hello_timeout: Duration::from_millis(500),
            ..Config::default()
        })
    }

    async fn executor_node(name: &str) -> Arc<Node> {
        let node = Node::new(name, "worker", test_config(), Vec::new(), Vec::new());
        node.register_service(ExecutorService::new(TaskRegistry::builtin())).await;
        node.start(&[NodeAddress::tcp("127.0.0.1", 0)]).await.unwrap();
        node
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_worker_runs_a_builtin_task_on_its_peer() {
        let worker = executor_node("w0").await;
        let driver = Node::new("driver", "driver", test_config(), Vec::new(), Vec::new());
        driver.start(&[NodeAddress::tcp("127.0.0.1", 0)]).await.unwrap();

        let worker_addr = worker.addresses().await[0].clone();
        driver.connect(&worker_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let peers = driver.peers_by_type(Some("worker")).await;
        assert_eq!(peers.len(), 1);
        let remote = RemoteWorker::new(driver.clone(), &peers[0]);

        let output = execute::Worker::run_task(&remote, "inc", serde_json::json!(41))
            .await
            .unwrap();
        assert_eq!(output.value, serde_json::json!(41));
        assert_eq!(output.accumulator_delta.get("count"), 1);

        driver.stop().await;
        worker.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_worker_surfaces_an_unknown_method_as_remote_failure() {
        let worker = executor_node("w1").await;
        let driver = Node::new("driver2", "driver", test_config(), Vec::new(), Vec::new());
        driver.start(&[NodeAddress::tcp("127.0.0.1", 0)]).await.unwrap();

        let worker_addr = worker.addresses().await[0].clone();
        driver.connect(&worker_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let peers = driver.peers_by_type(Some("worker")).await;
        let remote = RemoteWorker::new(driver.clone(), &peers[0]);

        let err = execute::Worker::run_task(&remote, "does-not-exist", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            SchedulerError::RemoteFailure(_)
        ));

        driver.stop().await;
        worker.stop().await;
    }
}
