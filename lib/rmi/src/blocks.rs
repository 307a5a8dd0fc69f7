//! Content-addressed, torrent-style block exchange (spec.md §4.2), grounded in
//! `original_source/bndl/rmi/blocks.py`.
//!
//! `BlockManager` is registered as a [`net::Service`] under the name `"blocks"` — the concrete
//! resolution of spec.md §9's "dynamic attribute access for RPC" redesign note — and also exposes
//! a plain async API (`serve_data`, `get_blocks`, ...) for local callers such as the job scheduler.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use bytes::Bytes;
use error_stack::ResultExt;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use net::{Node, NetError, RequestContext, Service};

use crate::error::{BlockError, Result};

/// Advertises a fetchable, already-published block set (spec.md §3 "BlockSpec").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSpec {
    pub seeder: String,
    pub name: String,
    pub num_blocks: usize,
}

type Slots = Arc<Mutex<Vec<Option<Bytes>>>>;

/// Signals "fully present locally", flipped exactly once per download epoch (spec.md §3
/// "Availability record"). Built on `Notify` with an explicit ready flag so that callers arriving
/// after the event is set don't block on a notification that already fired.
struct AvailabilityEvent {
    notify: Notify,
    ready: std::sync::atomic::AtomicBool,
}

impl AvailabilityEvent {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            ready: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn set(&self) {
        self.ready.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        if self.ready.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let notified = self.notify.notified();
        if self.ready.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[derive(Deserialize)]
struct GetBlockRequest {
    name: String,
    idx: usize,
}

#[derive(Serialize)]
struct GetBlockResponse {
    idx: usize,
}

#[derive(Deserialize, Serialize)]
struct NameRequest {
    name: String,
}

pub struct BlockManager {
    node: Weak<Node>,
    cache: Mutex<HashMap<String, Slots>>,
    available: Mutex<HashMap<String, Arc<AvailabilityEvent>>>,
}

impl BlockManager {
    /// `node` is a weak reference since the owning `Node` holds this manager back as a
    /// registered `Service` — an `Arc` either way would be a reference cycle.
    pub fn new(node: Weak<Node>) -> Arc<Self> {
        Arc::new(Self {
            node,
            cache: Mutex::new(HashMap::new()),
            available: Mutex::new(HashMap::new()),
        })
    }

    fn node(&self) -> Arc<Node> {
        self.node
            .upgrade()
            .expect("block manager outlived its owning node")
    }

    /// Splits `data` into `ceil(len/block_size)` blocks, the last absorbing the remainder, and
    /// serves them under `name`.
    pub async fn serve_data(
        &self,
        name: impl Into<String>,
        data: Bytes,
        block_size: usize,
    ) -> Result<BlockSpec> {
        if block_size == 0 {
            return Err(error_stack::Report::new(BlockError::InvalidBlockSize(
                block_size,
            )));
        }
        let length = data.len();
        let blocks = if length > block_size {
            let parts = (length - 1) / block_size; // will be one short, like the original
            let step = length.div_ceil(parts + 1);
            let mut blocks = Vec::with_capacity(parts + 1);
            let mut offset = 0;
            for _ in 0..parts {
                blocks.push(data.slice(offset..offset + step));
                offset += step;
            }
            blocks.push(data.slice(offset..length));
            blocks
        } else {
            vec![data]
        };
        self.serve_blocks(name, blocks).await
    }

    /// Serves pre-sliced `blocks` under `name`; this node becomes the seeder.
    pub async fn serve_blocks(&self, name: impl Into<String>, blocks: Vec<Bytes>) -> Result<BlockSpec> {
        let name = name.into();
        let num_blocks = blocks.len();
        let slots: Vec<Option<Bytes>> = blocks.into_iter().map(Some).collect();
        self.cache
            .lock()
            .await
            .insert(name.clone(), Arc::new(Mutex::new(slots)));
        let event = Arc::new(AvailabilityEvent::new());
        event.set();
        self.available.lock().await.insert(name.clone(), event);
        Ok(BlockSpec {
            seeder: self.node().name().await,
            name,
            num_blocks,
        })
    }

    /// Deletes the local entry (missing entries tolerated) and, if `from_peers`, fires a
    /// removal RPC at every current peer without waiting for responses.
    pub async fn remove_blocks(&self, name: &str, from_peers: bool) {
        self.cache.lock().await.remove(name);
        self.available.lock().await.remove(name);
        if from_peers {
            let node = self.node();
            for peer in node.peers_by_type(None).await {
                let node = node.clone();
                let name = name.to_owned();
                tokio::spawn(async move {
                    let _ = node
                        .call(
                            &peer.name,
                            "blocks",
                            "remove_blocks",
                            serde_json::json!({ "name": name }),
                            Vec::new(),
                        )
                        .await;
                });
            }
        }
    }

    /// Returns the complete block sequence for `spec`, downloading it first if this is the
    /// first caller for that name; concurrent callers coalesce onto the same download.
    pub async fn get_blocks(self: &Arc<Self>, spec: &BlockSpec) -> Result<Vec<Bytes>> {
        let (event, is_downloader) = {
            let mut available = self.available.lock().await;
            if let Some(event) = available.get(&spec.name) {
                (event.clone(), false)
            } else {
                let event = Arc::new(AvailabilityEvent::new());
                available.insert(spec.name.clone(), event.clone());
                (event, true)
            }
        };

        if is_downloader {
            self.download(spec).await?;
            event.set();
        } else {
            event.wait().await;
        }

        let slots = self
            .cache
            .lock()
            .await
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| error_stack::Report::new(BlockError::unknown_name(&spec.name)))?;
        let guard = slots.lock().await;
        Ok(guard
            .iter()
            .cloned()
            .map(|slot| slot.expect("every slot filled once the availability event is set"))
            .collect())
    }

    async fn get_block(&self, name: &str, idx: usize) -> Result<Bytes> {
        let slots = self
            .cache
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| error_stack::Report::new(BlockError::unknown_name(name)))?;
        slots
            .lock()
            .await
            .get(idx)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                error_stack::Report::new(BlockError::BlockNotPresent {
                    name: name.to_owned(),
                    idx,
                })
            })
    }

    /// Never raises for an unknown name — spec.md §4.2's invariant.
    async fn get_blocks_available(&self, name: &str) -> Vec<usize> {
        match self.cache.lock().await.get(name) {
            None => Vec::new(),
            Some(slots) => slots
                .lock()
                .await
                .iter()
                .enumerate()
                .filter_map(|(idx, block)| block.is_some().then_some(idx))
                .collect(),
        }
    }

    /// Picks the next block index to fetch and its candidate sources (spec.md §4.2
    /// `_next_download` policy): the still-missing index with the most advertising workers, or a
    /// uniformly random missing index falling back to the seeder if nobody advertises any.
    async fn next_download(&self, spec: &BlockSpec, slots: &Slots) -> (usize, Vec<String>) {
        let node = self.node();
        let workers = node.peers_by_type(Some("worker")).await;
        let missing: Vec<usize> = {
            let guard = slots.lock().await;
            guard
                .iter()
                .enumerate()
                .filter_map(|(idx, block)| block.is_none().then_some(idx))
                .collect()
        };

        let queries = workers.into_iter().map(|worker| {
            let node = node.clone();
            let name = spec.name.clone();
            async move {
                let result = node
                    .call(
                        &worker.name,
                        "blocks",
                        "get_blocks_available",
                        serde_json::json!({ "name": name }),
                        Vec::new(),
                    )
                    .await;
                (worker.name, result)
            }
        });
        let responses = tokio::time::timeout(
            node.config().availability_timeout,
            futures::future::join_all(queries),
        )
        .await
        .unwrap_or_default();

        let mut availability: HashMap<usize, Vec<String>> = HashMap::new();
        for (worker_name, result) in responses {
            match result {
                Ok((payload, _)) => match serde_json::from_value::<Vec<usize>>(payload) {
                    Ok(indices) => {
                        for idx in indices {
                            if missing.contains(&idx) {
                                availability.entry(idx).or_default().push(worker_name.clone());
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(peer = %worker_name, ?err, "malformed availability response")
                    }
                },
                Err(err) => {
                    tracing::warn!(peer = %worker_name, ?err, "could not get block availability")
                }
            }
        }

        if let Some((idx, candidates)) = availability.into_iter().max_by_key(|(_, v)| v.len()) {
            (idx, candidates)
        } else {
            let idx = *missing
                .choose(&mut rand::thread_rng())
                .expect("download loop only runs while slots remain missing");
            (idx, vec![spec.seeder.clone()])
        }
    }

    /// Fetches every missing slot of `spec`, one index at a time, preferring same-host candidates
    /// and falling back to the seeder when every other candidate fails.
    async fn download(&self, spec: &BlockSpec) -> Result<()> {
        let slots: Slots = Arc::new(Mutex::new(vec![None; spec.num_blocks]));
        self.cache.lock().await.insert(spec.name.clone(), slots.clone());

        let node = self.node();
        let local_ips: HashSet<IpAddr> = node.local_ip_addresses().await.into_iter().collect();

        for _ in 0..spec.num_blocks {
            let (idx, candidate_names) = self.next_download(spec, &slots).await;
            if slots.lock().await[idx].is_some() {
                continue;
            }

            let peers = node.peers_by_type(None).await;
            let mut local = Vec::new();
            let mut remote = Vec::new();
            for name in &candidate_names {
                match peers.iter().find(|p| &p.name == name) {
                    Some(p) if p.ip_addresses.iter().any(|ip| local_ips.contains(ip)) => {
                        local.push(name.clone())
                    }
                    _ => remote.push(name.clone()),
                }
            }

            let mut fetched = false;
            while !fetched && (!local.is_empty() || !remote.is_empty()) {
                let pool = if !local.is_empty() { &mut local } else { &mut remote };
                let i = rand::thread_rng().gen_range(0..pool.len());
                let source = pool.remove(i);
                match self.fetch_block(&source, &spec.name, idx).await {
                    Ok(bytes) => {
                        slots.lock().await[idx] = Some(bytes);
                        fetched = true;
                    }
                    Err(err) => {
                        tracing::debug!(peer = %source, ?err, "block fetch failed, trying next candidate")
                    }
                }
            }
            if !fetched {
                let bytes = self.fetch_block(&spec.seeder, &spec.name, idx).await?;
                slots.lock().await[idx] = Some(bytes);
            }
        }
        Ok(())
    }

    async fn fetch_block(&self, peer: &str, name: &str, idx: usize) -> Result<Bytes> {
        let node = self.node();
        let (_, mut attachments) = node
            .call(
                peer,
                "blocks",
                "get_block",
                serde_json::json!({ "name": name, "idx": idx }),
                Vec::new(),
            )
            .await
            .change_context(BlockError::NoReachableSource {
                name: name.to_owned(),
                idx,
            })?;
        attachments
            .pop()
            .ok_or_else(|| error_stack::Report::new(BlockError::BlockNotPresent {
                name: name.to_owned(),
                idx,
            }))
    }
}

#[async_trait]
impl Service for BlockManager {
    fn name(&self) -> &'static str {
        "blocks"
    }

    async fn call(
        &self,
        method: &str,
        payload: serde_json::Value,
        _attachments: Vec<Bytes>,
        _ctx: &RequestContext,
    ) -> net::Result<(serde_json::Value, Vec<Bytes>)> {
        match method {
            "get_block" => {
                let req: GetBlockRequest = serde_json::from_value(payload)
                    .map_err(|e| error_stack::Report::new(NetError::transport(e.to_string())))?;
                let bytes = self
                    .get_block(&req.name, req.idx)
                    .await
                    .map_err(|report| error_stack::Report::new(NetError::transport(format!("{report:?}"))))?;
                let response = serde_json::to_value(GetBlockResponse { idx: req.idx })
                    .map_err(|e| error_stack::Report::new(NetError::transport(e.to_string())))?;
                Ok((response, vec![bytes]))
            }
            "get_blocks_available" => {
                let req: NameRequest = serde_json::from_value(payload)
                    .map_err(|e| error_stack::Report::new(NetError::transport(e.to_string())))?;
                let indices = self.get_blocks_available(&req.name).await;
                let response = serde_json::to_value(indices)
                    .map_err(|e| error_stack::Report::new(NetError::transport(e.to_string())))?;
                Ok((response, Vec::new()))
            }
            "remove_blocks" => {
                let req: NameRequest = serde_json::from_value(payload)
                    .map_err(|e| error_stack::Report::new(NetError::transport(e.to_string())))?;
                // A peer-initiated removal never cascades further: `from_peers` fan-out only
                // happens at the origin of a local `remove_blocks(..., from_peers=true)` call.
                self.remove_blocks(&req.name, false).await;
                Ok((serde_json::Value::Null, Vec::new()))
            }
            other => Err(error_stack::Report::new(NetError::transport(format!(
                "unknown blocks method {other}"
            )))),
        }
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
            availability_timeout: Duration::from_millis(500),
            ..Config::default()
        })
    }

    async fn node_with_blocks(name: &str) -> (Arc<Node>, Arc<BlockManager>) {
        let node = Node::new(name, "worker", test_config(), Vec::new(), Vec::new());
        node.start(&[NodeAddress::tcp("127.0.0.1", 0)]).await.unwrap();
        let manager = BlockManager::new(Arc::downgrade(&node));
        node.register_service(manager.clone()).await;
        (node, manager)
    }

    #[tokio::test]
    async fn serve_data_splits_into_the_expected_block_count() {
        let (node, manager) = node_with_blocks("solo").await;
        let _ = &node;

        // Exactly divisible: 10 bytes at block_size 5 -> falls under the else branch (length is
        // not > block_size once parts cancel out) only when length <= block_size; here it's
        // bigger, so it takes the splitting path.
        let spec = manager
            .serve_data("ten", Bytes::from_static(b"0123456789"), 5)
            .await
            .unwrap();
        assert_eq!(spec.num_blocks, 2);

        // Smaller than block_size: single block, no splitting.
        let spec = manager
            .serve_data("small", Bytes::from_static(b"hi"), 1024)
            .await
            .unwrap();
        assert_eq!(spec.num_blocks, 1);

        // Remainder absorbed by the last block.
        let spec = manager
            .serve_data("eleven", Bytes::from_static(b"01234567890"), 5)
            .await
            .unwrap();
        assert_eq!(spec.num_blocks, 3);
        let blocks = manager.get_blocks(&spec).await.unwrap();
        let total: usize = blocks.iter().map(Bytes::len).sum();
        assert_eq!(total, 11);

        node.stop().await;
    }

    #[tokio::test]
    async fn serve_data_rejects_a_zero_block_size() {
        let (node, manager) = node_with_blocks("solo2").await;
        let err = manager
            .serve_data("x", Bytes::from_static(b"data"), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            BlockError::InvalidBlockSize(0)
        ));
        node.stop().await;
    }

    #[tokio::test]
    async fn get_blocks_on_an_unknown_name_fails_without_a_seeder() {
        let (node, manager) = node_with_blocks("solo3").await;
        let spec = BlockSpec {
            seeder: "solo3".to_owned(),
            name: "missing".to_owned(),
            num_blocks: 1,
        };
        let err = manager.get_blocks(&spec).await.unwrap_err();
        assert!(matches!(err.current_context(), BlockError::NoReachableSource { .. }));
        node.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetcher_downloads_every_block_from_the_seeder() {
        let (seeder, seeder_blocks) = node_with_blocks("seeder").await;
        let (fetcher, fetcher_blocks) = node_with_blocks("fetcher").await;

        let seeder_addr = seeder.addresses().await[0].clone();
        fetcher.connect(&seeder_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.peer_count().await, 1);

        let payload = Bytes::from(vec![7u8; 37]);
        let spec = seeder_blocks
            .serve_data("payload", payload.clone(), 10)
            .await
            .unwrap();

        let fetched = fetcher_blocks.get_blocks(&spec).await.unwrap();
        let joined: Vec<u8> = fetched.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(joined, payload.to_vec());

        seeder.stop().await;
        fetcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_fetchers_coalesce_onto_a_single_download() {
        let (seeder, seeder_blocks) = node_with_blocks("seeder2").await;
        let (fetcher, fetcher_blocks) = node_with_blocks("fetcher2").await;

        let seeder_addr = seeder.addresses().await[0].clone();
        fetcher.connect(&seeder_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let payload = Bytes::from(vec![9u8; 64]);
        let spec = seeder_blocks
            .serve_data("shared", payload.clone(), 8)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            fetcher_blocks.get_blocks(&spec),
            fetcher_blocks.get_blocks(&spec)
        );
        let a: Vec<u8> = a.unwrap().into_iter().flat_map(|b| b.to_vec()).collect();
        let b: Vec<u8> = b.unwrap().into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(a, payload.to_vec());
        assert_eq!(b, payload.to_vec());

        seeder.stop().await;
        fetcher.stop().await;
    }
}
