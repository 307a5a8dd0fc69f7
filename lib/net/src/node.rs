//! The node: listens for inbound connections, dials seeds, negotiates the hello handshake and
//! connection-contest tiebreak, gossips peer discovery, and watches connection liveness.
//!
//! Mirrors the responsibilities of `original_source/bndl/net/node.py::Node`, split across the
//! supporting modules in this crate (`wire`, `connection`, `peer`, `service`) and reassembled here.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use error_stack::{IntoReport, ResultExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    sync::{oneshot, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    address::NodeAddress,
    connection::{self, Connection, Socket},
    error::{NetError, Result},
    peer::{loses_tie_break, Peer, PeerTable},
    service::{RequestContext, Service},
    wire::{Header, Kind},
};
use config::Config;

/// What a hello exchange tells the other side about us.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloInfo {
    name: String,
    node_type: String,
    addresses: Vec<NodeAddress>,
}

/// A read-only snapshot of a connected peer, handed to services (e.g. the block manager) that
/// need to reason about the peer set without holding the peer-table mutex themselves.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub name: String,
    pub node_type: String,
    pub ip_addresses: Vec<IpAddr>,
}

enum ServerHandle {
    Tcp { task: JoinHandle<()> },
    Unix { path: String, task: JoinHandle<()> },
}

type PendingResult = Result<(serde_json::Value, Vec<bytes::Bytes>)>;

/// A running peer in the compute fabric (spec.md §4.1). Always held behind an `Arc` since its
/// background tasks (acceptors, watchdog, gossip fan-out) each hold a clone.
pub struct Node {
    name: RwLock<String>,
    pub node_type: String,
    config: Arc<Config>,
    services: Mutex<HashMap<&'static str, Arc<dyn Service>>>,
    addresses: Mutex<Vec<NodeAddress>>,
    seeds: Vec<NodeAddress>,
    peers: Mutex<PeerTable>,
    pending: Mutex<HashMap<u64, oneshot::Sender<PendingResult>>>,
    next_correlation_id: AtomicU64,
    servers: Mutex<Vec<ServerHandle>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
    watchdog_misses: Mutex<HashMap<String, u32>>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        node_type: impl Into<String>,
        config: Arc<Config>,
        seeds: Vec<NodeAddress>,
        services: Vec<Arc<dyn Service>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new(name.into()),
            node_type: node_type.into(),
            config,
            services: Mutex::new(services.into_iter().map(|s| (s.name(), s)).collect()),
            addresses: Mutex::new(Vec::new()),
            seeds,
            peers: Mutex::new(PeerTable::default()),
            pending: Mutex::new(HashMap::new()),
            next_correlation_id: AtomicU64::new(1),
            servers: Mutex::new(Vec::new()),
            io_tasks: Mutex::new(Vec::new()),
            watchdog_misses: Mutex::new(HashMap::new()),
        })
    }

    /// Registers (or replaces) a service after construction — used so a service can hold a
    /// `Weak<Node>` back-reference obtained only once the node's `Arc` exists.
    pub async fn register_service(&self, service: Arc<dyn Service>) {
        self.services.lock().await.insert(service.name(), service);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn name(&self) -> String {
        self.name.read().await.clone()
    }

    pub async fn addresses(&self) -> Vec<NodeAddress> {
        self.addresses.lock().await.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn peer_names(&self) -> Vec<String> {
        self.peers
            .lock()
            .await
            .names()
            .map(str::to_owned)
            .collect()
    }

    /// Connected peers, optionally restricted to a `node_type` (e.g. `"worker"`), as snapshots
    /// safe to hold after the peer-table mutex is released.
    pub async fn peers_by_type(&self, node_type: Option<&str>) -> Vec<PeerSnapshot> {
        self.peers
            .lock()
            .await
            .filter(node_type)
            .into_iter()
            .map(|p| PeerSnapshot {
                name: p.name.clone(),
                node_type: p.node_type.clone(),
                ip_addresses: p.ip_addresses.clone(),
            })
            .collect()
    }

    /// The IP addresses this node's own listen addresses resolve to, used by the block manager
    /// to prefer same-host download candidates.
    pub async fn local_ip_addresses(&self) -> Vec<IpAddr> {
        self.addresses
            .lock()
            .await
            .iter()
            .flat_map(NodeAddress::resolve_ips)
            .collect()
    }

    /// Renames the local node, then disconnects every current peer — they are stale under the
    /// new identity and must rediscover it through gossip or the seed list, per spec.md §4.1's
    /// name-change note.
    pub async fn rename(self: &Arc<Self>, new_name: impl Into<String>) {
        *self.name.write().await = new_name.into();
        let names = self.peer_names().await;
        for name in names {
            self.disconnect_peer(&name, "local node renamed").await;
        }
    }

    /// Binds every configured listen address, dials every seed (with backoff, in the background),
    /// and starts the watchdog loop. Returns once listening has succeeded; seed connections and
    /// the watchdog continue running on spawned tasks owned by `self`.
    pub async fn start(self: &Arc<Self>, listen_addresses: &[NodeAddress]) -> Result<()> {
        let addrs = if listen_addresses.is_empty() {
            vec![NodeAddress::tcp("0.0.0.0", config::DEFAULT_TCP_PORT)]
        } else {
            listen_addresses.to_vec()
        };
        for addr in addrs {
            self.listen(addr).await?;
        }

        for seed in self.seeds.clone() {
            let node = self.clone();
            let handle = tokio::spawn(async move { node.connect_seed_with_retry(seed).await });
            self.io_tasks.lock().await.push(handle);
        }

        let node = self.clone();
        let handle = tokio::spawn(async move { node.watchdog_loop().await });
        self.io_tasks.lock().await.push(handle);

        Ok(())
    }

    async fn listen(self: &Arc<Self>, addr: NodeAddress) -> Result<()> {
        match addr {
            NodeAddress::Tcp { host, port } => {
                let mut candidate = port;
                let listener = loop {
                    match TcpListener::bind((host.as_str(), candidate)).await {
                        Ok(listener) => break listener,
                        Err(err)
                            if err.kind() == std::io::ErrorKind::AddrInUse
                                && candidate < port.saturating_add(config::TCP_PORT_PROBE_LIMIT) =>
                        {
                            candidate += 1;
                            continue;
                        }
                        Err(err) => {
                            return Err(err)
                                .into_report()
                                .change_context(NetError::configuration(format!(
                                    "could not bind TCP listener on {host}:{port}"
                                )))
                        }
                    }
                };
                let bound_port = listener
                    .local_addr()
                    .map(|a| a.port())
                    .unwrap_or(candidate);
                let bound = NodeAddress::tcp(host, bound_port);
                tracing::info!(address = %bound, "server socket opened");
                self.addresses.lock().await.push(bound);
                let node = self.clone();
                let task = tokio::spawn(async move { node.accept_tcp_loop(listener).await });
                self.servers.lock().await.push(ServerHandle::Tcp { task });
            }
            NodeAddress::Unix { path } => {
                if std::path::Path::new(&path).exists() {
                    std::fs::remove_file(&path)
                        .into_report()
                        .change_context(NetError::configuration(format!(
                            "could not remove stale socket file {path}"
                        )))?;
                }
                let listener = UnixListener::bind(&path)
                    .into_report()
                    .change_context(NetError::configuration(format!(
                        "could not bind UNIX listener on {path}"
                    )))?;
                tracing::info!(path = %path, "server socket opened");
                self.addresses.lock().await.push(NodeAddress::unix(path.clone()));
                let node = self.clone();
                let task = tokio::spawn(async move { node.accept_unix_loop(listener).await });
                self.servers
                    .lock()
                    .await
                    .push(ServerHandle::Unix { path, task });
            }
        }
        Ok(())
    }

    async fn accept_tcp_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.handle_accepted(Socket::from(stream), peer_addr.to_string())
                            .await
                    });
                }
                Err(err) => {
                    tracing::warn!(?err, "error accepting TCP connection");
                    break;
                }
            }
        }
    }

    async fn accept_unix_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.handle_accepted(Socket::from(stream), "unix".to_owned())
                            .await
                    });
                }
                Err(err) => {
                    tracing::warn!(?err, "error accepting UNIX connection");
                    break;
                }
            }
        }
    }

    async fn handle_accepted(self: Arc<Self>, socket: Socket, peer_addr: String) {
        let (conn, mut read_half) = Connection::new(socket, peer_addr);
        let hello = match tokio::time::timeout(
            self.config.hello_timeout,
            connection::read_header(&mut read_half),
        )
        .await
        {
            Ok(Ok((header, _))) => header,
            Ok(Err(err)) => {
                tracing::warn!(?err, "hello read failed");
                return;
            }
            Err(_) => {
                tracing::warn!("hello timed out waiting for inbound connection");
                return;
            }
        };
        let (correlation_id, name, node_type, addresses) = match hello.kind {
            Kind::Hello {
                name,
                node_type,
                addresses,
            } => (hello.correlation_id, name, node_type, addresses),
            _ => {
                tracing::warn!("expected hello as first message on accepted connection");
                return;
            }
        };

        let conn = Arc::new(conn);
        let our_info = HelloInfo {
            name: self.name().await,
            node_type: self.node_type.clone(),
            addresses: self.addresses().await,
        };
        let payload = match serde_json::to_value(&our_info) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(?err, "could not encode hello response");
                return;
            }
        };

        let mut peer = Peer::new(name.clone(), node_type, addresses, false);
        peer.connection = Some(conn.clone());
        let survived = self.peer_connected(peer).await;
        if !survived {
            let _ = conn
                .send(
                    &Header {
                        correlation_id,
                        kind: Kind::Error {
                            message: "lost connection contest".to_owned(),
                        },
                        num_attachments: 0,
                    },
                    &[],
                )
                .await;
            conn.close().await;
            return;
        }

        if conn
            .send(
                &Header {
                    correlation_id,
                    kind: Kind::Response { payload },
                    num_attachments: 0,
                },
                &[],
            )
            .await
            .is_err()
        {
            self.disconnect_peer_connection(&name, &conn, "hello response failed")
                .await;
            return;
        }

        self.spawn_reader(name.clone(), read_half, conn).await;
        let node = self.clone();
        tokio::spawn(async move { node.notify_peers(name).await });
    }

    /// Dials `addr` as initiator, performs the hello handshake and connection contest, and (if
    /// this connection survives) installs the peer and starts its reader loop.
    pub async fn connect(self: &Arc<Self>, addr: &NodeAddress) -> Result<()> {
        let socket: Socket = match addr {
            NodeAddress::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
                .await
                .into_report()
                .change_context(NetError::transport(format!("could not connect to {addr}")))?
                .into(),
            NodeAddress::Unix { path } => UnixStream::connect(path)
                .await
                .into_report()
                .change_context(NetError::transport(format!("could not connect to {addr}")))?
                .into(),
        };
        let (conn, mut read_half) = Connection::new(socket, addr.to_string());
        let conn = Arc::new(conn);

        let our_info = HelloInfo {
            name: self.name().await,
            node_type: self.node_type.clone(),
            addresses: self.addresses().await,
        };
        conn.send(
            &Header {
                correlation_id: 0,
                kind: Kind::Hello {
                    name: our_info.name,
                    node_type: our_info.node_type,
                    addresses: our_info.addresses,
                },
                num_attachments: 0,
            },
            &[],
        )
        .await?;

        let (header, _) = tokio::time::timeout(
            self.config.hello_timeout,
            connection::read_header(&mut read_half),
        )
        .await
        .map_err(|_| error_stack::Report::new(NetError::transport("hello timed out")))??;

        let remote = match header.kind {
            Kind::Response { payload } => serde_json::from_value::<HelloInfo>(payload)
                .change_context(NetError::transport("malformed hello response"))?,
            Kind::Error { message } => {
                return Err(error_stack::Report::new(NetError::transport(format!(
                    "peer rejected connection: {message}"
                ))))
            }
            _ => {
                return Err(error_stack::Report::new(NetError::transport(
                    "expected hello response",
                )))
            }
        };

        let mut peer = Peer::new(remote.name.clone(), remote.node_type, remote.addresses, true);
        peer.connection = Some(conn.clone());
        let name = remote.name;
        let survived = self.peer_connected(peer).await;
        if !survived {
            conn.close().await;
            return Ok(());
        }

        self.spawn_reader(name.clone(), read_half, conn).await;
        let node = self.clone();
        tokio::spawn(async move { node.notify_peers(name).await });
        Ok(())
    }

    async fn connect_seed_with_retry(self: Arc<Self>, seed: NodeAddress) {
        let mut backoff = self.config.seed_retry_initial;
        loop {
            match self.connect(&seed).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(seed = %seed, ?err, "could not connect to seed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.seed_retry_max);
                }
            }
        }
    }

    async fn spawn_reader(
        self: &Arc<Self>,
        name: String,
        read_half: tokio::io::ReadHalf<crate::connection::BoxedStream>,
        conn: Arc<Connection>,
    ) {
        let node = self.clone();
        let handle = tokio::spawn(async move { node.reader_loop(name, read_half, conn).await });
        self.io_tasks.lock().await.push(handle);
    }

    /// Resolves a self-connect or a connection contest against any existing peer entry under the
    /// same name, then installs `candidate` if it survives. Mirrors
    /// `original_source/bndl/net/node.py::Node._peer_connected`.
    async fn peer_connected(self: &Arc<Self>, candidate: Peer) -> bool {
        let local_name = self.name().await;
        if candidate.name == local_name {
            if let Some(conn) = &candidate.connection {
                conn.close().await;
            }
            tracing::debug!(peer = %candidate.name, "rejected self-connection");
            return false;
        }

        let mut table = self.peers.lock().await;
        if let Some(existing) = table.get(&candidate.name) {
            if existing.is_connected() {
                if loses_tie_break(
                    &local_name,
                    &candidate.name,
                    candidate.is_initiator,
                    existing.is_initiator,
                ) {
                    if let Some(conn) = &candidate.connection {
                        conn.close().await;
                    }
                    tracing::debug!(peer = %candidate.name, "lost connection contest");
                    return false;
                }
                if let Some(existing_mut) = table.get_mut(&candidate.name) {
                    if let Some(conn) = existing_mut.connection.take() {
                        conn.close().await;
                    }
                }
                tracing::debug!(peer = %candidate.name, "won connection contest, replacing peer");
            }
        }
        table.insert(candidate);
        true
    }

    async fn reader_loop(
        self: Arc<Self>,
        peer_name: String,
        mut read_half: tokio::io::ReadHalf<crate::connection::BoxedStream>,
        connection: Arc<Connection>,
    ) {
        loop {
            let (header, attachments) = match connection::read_header(&mut read_half).await {
                Ok(v) => v,
                Err(_) => {
                    self.disconnect_peer_connection(&peer_name, &connection, "connection closed")
                        .await;
                    break;
                }
            };
            match header.kind {
                Kind::Request {
                    service,
                    method,
                    payload,
                } => {
                    let node = self.clone();
                    let conn = connection.clone();
                    let from = peer_name.clone();
                    let correlation_id = header.correlation_id;
                    tokio::spawn(async move {
                        let outcome = node
                            .dispatch(&service, &method, payload, attachments, &from)
                            .await;
                        let reply = match outcome {
                            Ok((payload, attachments)) => {
                                let header = Header {
                                    correlation_id,
                                    kind: Kind::Response { payload },
                                    num_attachments: attachments.len() as u32,
                                };
                                conn.send(&header, &attachments).await
                            }
                            Err(err) => {
                                let header = Header {
                                    correlation_id,
                                    kind: Kind::Error {
                                        message: format!("{err:?}"),
                                    },
                                    num_attachments: 0,
                                };
                                conn.send(&header, &[]).await
                            }
                        };
                        if let Err(err) = reply {
                            tracing::warn!(?err, "could not send response");
                        }
                    });
                }
                Kind::Response { payload } => {
                    if let Some(tx) = self.pending.lock().await.remove(&header.correlation_id) {
                        let _ = tx.send(Ok((payload, attachments)));
                    }
                }
                Kind::Error { message } => {
                    if let Some(tx) = self.pending.lock().await.remove(&header.correlation_id) {
                        let _ = tx.send(Err(error_stack::Report::new(NetError::transport(
                            message,
                        ))));
                    }
                }
                Kind::Hello { .. } => {
                    tracing::warn!(peer = %peer_name, "unexpected hello after handshake");
                }
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        service: &str,
        method: &str,
        payload: serde_json::Value,
        attachments: Vec<bytes::Bytes>,
        from: &str,
    ) -> Result<(serde_json::Value, Vec<bytes::Bytes>)> {
        if service == "node" {
            return self.dispatch_node(method, payload).await;
        }
        let handler = self
            .services
            .lock()
            .await
            .get(service)
            .cloned()
            .ok_or_else(|| {
                error_stack::Report::new(NetError::transport(format!(
                    "unknown service {service}"
                )))
            })?;
        let ctx = RequestContext {
            from: from.to_owned(),
        };
        handler.call(method, payload, attachments, &ctx).await
    }

    async fn dispatch_node(
        self: &Arc<Self>,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<(serde_json::Value, Vec<bytes::Bytes>)> {
        match method {
            "discover" => {
                let discovered: Vec<(String, Vec<NodeAddress>)> = serde_json::from_value(payload)
                    .change_context(NetError::transport("malformed discover payload"))?;
                for (name, addresses) in discovered {
                    let known = self.peers.lock().await.contains(&name)
                        || name == self.name().await;
                    if known || addresses.is_empty() {
                        continue;
                    }
                    let node = self.clone();
                    tokio::spawn(async move {
                        for addr in &addresses {
                            if node.connect(addr).await.is_ok() {
                                return;
                            }
                        }
                        tracing::warn!(peer = %name, "could not connect to any address for discovered peer");
                    });
                }
                Ok((serde_json::Value::Null, Vec::new()))
            }
            "ping" => Ok((serde_json::Value::Null, Vec::new())),
            other => Err(error_stack::Report::new(NetError::transport(format!(
                "unknown node method {other}"
            )))),
        }
    }

    /// Tells `target` about `peers` via the built-in `node`/`discover` method.
    async fn notify_discovery(
        self: &Arc<Self>,
        target: &str,
        peers: Vec<(String, Vec<NodeAddress>)>,
    ) -> Result<()> {
        self.call(
            target,
            "node",
            "discover",
            serde_json::to_value(peers)
                .change_context(NetError::transport("could not encode discover payload"))?,
            Vec::new(),
        )
        .await?;
        Ok(())
    }

    /// Gossips the arrival of `new_peer_name` to every other connected peer, and tells the new
    /// peer about everyone else — a shuffled snapshot each, per spec.md §4.1's gossip fan-out,
    /// bounded to three hello-timeouts per spec.md §9 (now resolved in SPEC_FULL.md §4.1).
    async fn notify_peers(self: Arc<Self>, new_peer_name: String) {
        let (mut others, new_peer_addrs) = {
            let table = self.peers.lock().await;
            let others: Vec<(String, Vec<NodeAddress>)> = table
                .filter(None)
                .into_iter()
                .filter(|p| p.name != new_peer_name)
                .map(|p| (p.name.clone(), p.addresses.clone()))
                .collect();
            let new_peer_addrs = table
                .get(&new_peer_name)
                .map(|p| p.addresses.clone())
                .unwrap_or_default();
            (others, new_peer_addrs)
        };
        others.shuffle(&mut rand::thread_rng());

        let bound = self.config.hello_timeout * 3;
        if !others.is_empty() {
            let _ = tokio::time::timeout(bound, self.notify_discovery(&new_peer_name, others.clone()))
                .await;
        }
        for (name, _) in others {
            let _ = tokio::time::timeout(
                bound,
                self.notify_discovery(&name, vec![(new_peer_name.clone(), new_peer_addrs.clone())]),
            )
            .await;
        }
    }

    /// Issues a request to a connected peer's service and awaits its response (or its failure
    /// report, propagated from the remote's `Kind::Error`).
    pub async fn call(
        self: &Arc<Self>,
        peer_name: &str,
        service: &str,
        method: &str,
        payload: serde_json::Value,
        attachments: Vec<bytes::Bytes>,
    ) -> Result<(serde_json::Value, Vec<bytes::Bytes>)> {
        let conn = {
            let table = self.peers.lock().await;
            table
                .get(peer_name)
                .and_then(|p| p.connection.clone())
                .ok_or_else(|| {
                    error_stack::Report::new(NetError::transport(format!(
                        "no connection to peer {peer_name}"
                    )))
                })?
        };
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id, tx);

        let header = Header {
            correlation_id,
            kind: Kind::Request {
                service: service.to_owned(),
                method: method.to_owned(),
                payload,
            },
            num_attachments: attachments.len() as u32,
        };
        if let Err(err) = conn.send(&header, &attachments).await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(err);
        }
        rx.await.unwrap_or_else(|_| {
            Err(error_stack::Report::new(NetError::transport(
                "connection closed while awaiting response",
            )))
        })
    }

    async fn disconnect_peer(self: &Arc<Self>, name: &str, reason: &str) {
        let mut table = self.peers.lock().await;
        if let Some(peer) = table.get_mut(name) {
            if let Some(conn) = peer.connection.take() {
                conn.close().await;
            }
        }
        tracing::debug!(peer = %name, %reason, "peer disconnected");
    }

    /// Like [`Self::disconnect_peer`], but only tears down the table's connection if it is the
    /// very one `conn` refers to. A connection contest can replace the table's entry for `name`
    /// out from under a caller that is still holding on to the losing side, so callers that own a
    /// specific connection (a reader loop, a just-installed outbound/inbound connection) must
    /// check identity before clearing the table — otherwise they tear down a connection that has
    /// already replaced theirs.
    async fn disconnect_peer_connection(self: &Arc<Self>, name: &str, conn: &Arc<Connection>, reason: &str) {
        let mut table = self.peers.lock().await;
        if let Some(peer) = table.get_mut(name) {
            let matches = peer
                .connection
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, conn));
            if matches {
                if let Some(conn) = peer.connection.take() {
                    conn.close().await;
                }
                tracing::debug!(peer = %name, %reason, "peer disconnected");
            } else {
                tracing::debug!(peer = %name, %reason, "stale connection teardown ignored, peer already replaced");
            }
        }
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.watchdog_interval);
        loop {
            ticker.tick().await;
            let targets: Vec<String> = {
                self.peers
                    .lock()
                    .await
                    .filter(None)
                    .into_iter()
                    .map(|p| p.name.clone())
                    .collect()
            };
            for name in targets {
                let node = self.clone();
                tokio::spawn(async move {
                    let ok = tokio::time::timeout(
                        node.config.hello_timeout,
                        node.call(&name, "node", "ping", serde_json::Value::Null, Vec::new()),
                    )
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                    node.record_watchdog(&name, ok).await;
                });
            }
        }
    }

    async fn record_watchdog(self: &Arc<Self>, name: &str, ok: bool) {
        let mut misses = self.watchdog_misses.lock().await;
        if ok {
            misses.remove(name);
            return;
        }
        let count = misses.entry(name.to_owned()).or_insert(0);
        *count += 1;
        let missed = *count;
        let threshold = self.config.watchdog_missed_pings;
        drop(misses);
        if missed >= threshold {
            self.watchdog_misses.lock().await.remove(name);
            self.disconnect_peer(name, "watchdog: missed pings").await;
        }
    }

    /// Disconnects every peer, aborts all listeners and background tasks, and removes any UNIX
    /// socket files this node created.
    pub async fn stop(self: &Arc<Self>) {
        let names = self.peer_names().await;
        for name in names {
            self.disconnect_peer(&name, "node stopping").await;
        }
        self.peers.lock().await.drain().for_each(drop);

        let servers = std::mem::take(&mut *self.servers.lock().await);
        for server in servers {
            match server {
                ServerHandle::Tcp { task } => task.abort(),
                ServerHandle::Unix { path, task } => {
                    task.abort();
                    let _ = std::fs::remove_file(path);
                }
            }
        }

        let tasks = std::mem::take(&mut *self.io_tasks.lock().await);
        for task in tasks {
            task.abort();
        }
    }
}
