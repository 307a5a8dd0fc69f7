use std::{collections::HashMap, net::IpAddr, sync::Arc};

use crate::{address::NodeAddress, connection::Connection};

/// An entry in a node's peer table (spec.md §3).
///
/// `connection` is `None` for a peer that is known (by name/address) but not currently
/// connected — the failure model keeps such entries around for reconnection rather than
/// dropping them, per spec.md §4.1 "Failure model".
pub struct Peer {
    pub name: String,
    pub node_type: String,
    pub addresses: Vec<NodeAddress>,
    pub ip_addresses: Vec<IpAddr>,
    pub connection: Option<Arc<Connection>>,
    /// Whether *we* initiated the connection current in `connection` (or the last one held).
    /// Used as the tiebreak key's third component when a connection contest arises.
    pub is_initiator: bool,
}

impl Peer {
    pub fn new(
        name: String,
        node_type: String,
        addresses: Vec<NodeAddress>,
        is_initiator: bool,
    ) -> Self {
        let ip_addresses = addresses.iter().flat_map(NodeAddress::resolve_ips).collect();
        Self {
            name,
            node_type,
            addresses,
            ip_addresses,
            connection: None,
            is_initiator,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Totally orders two candidate peer records for the connection-contest tiebreak (spec.md §4.1,
/// Open Question resolved in SPEC_FULL.md §4.1): the connection whose *initiator* has the
/// lexicographically lower name survives. Returns `true` if `ours` loses to `theirs` and should
/// be the one disconnected.
///
/// The key is built from the initiator's name rather than from the local `is_initiator` flag
/// directly: when two nodes dial each other concurrently, each end observes a *different* local
/// boolean for "did I initiate this one" on the same pair of physical connections, so comparing
/// raw flags would let each side keep a different connection (the two ends would then agree on
/// neither's survivor, and the "surviving" socket on one side is the one the other side already
/// closed). Keying off the initiator's name instead gives both ends the same two keys to compare,
/// so they converge on the same surviving connection.
pub fn loses_tie_break(
    local_name: &str,
    remote_name: &str,
    ours_is_initiator: bool,
    theirs_is_initiator: bool,
) -> bool {
    let ours_initiator = if ours_is_initiator { local_name } else { remote_name };
    let theirs_initiator = if theirs_is_initiator { local_name } else { remote_name };
    ours_initiator > theirs_initiator
}

/// The node's registry of known remote nodes and their connections, guarded by the caller with
/// the peer-table mutex (spec.md §5 "Shared resources").
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Peer> {
        self.peers.get_mut(name)
    }

    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.name.clone(), peer);
    }

    pub fn remove(&mut self, name: &str) -> Option<Peer> {
        self.peers.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Connected peers, optionally restricted to a `node_type` — mirrors
    /// `original_source/bndl/net/peer.py::PeerTable.filter`.
    pub fn filter(&self, node_type: Option<&str>) -> Vec<&Peer> {
        self.peers
            .values()
            .filter(|peer| peer.is_connected())
            .filter(|peer| node_type.map_or(true, |t| peer.node_type == t))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Peer> + '_ {
        self.peers.drain().map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_named_initiator_wins_tie_break() {
        // The connection initiated by "alpha" (lexicographically lower) should survive
        // regardless of which physical socket a given node calls "ours".
        assert!(loses_tie_break("alpha", "beta", false, true));
        assert!(!loses_tie_break("alpha", "beta", true, false));
    }

    #[test]
    fn both_ends_agree_on_the_same_surviving_connection() {
        // Mirrors the mutual-seed race: alpha dials beta (alpha is the initiator of conn1) while
        // beta dials alpha at the same time (beta is the initiator of conn2). Each node must
        // independently decide to keep conn1 (initiated by "alpha", the lower name) — otherwise
        // the two ends would end up holding different, mutually-severed sockets.
        //
        // At alpha: existing = alpha's own outbound to beta (conn1, is_initiator=true);
        // candidate = inbound from beta (conn2, is_initiator=false). `loses_tie_break` is called
        // as `(local, remote, candidate.is_initiator, existing.is_initiator)` at the call site.
        let candidate_conn2_loses_at_alpha = loses_tie_break("alpha", "beta", false, true);
        // At beta: existing = beta's own outbound to alpha (conn2, is_initiator=true);
        // candidate = inbound from alpha (conn1, is_initiator=false).
        let candidate_conn1_loses_at_beta = loses_tie_break("beta", "alpha", false, true);

        assert!(candidate_conn2_loses_at_alpha, "alpha should keep its conn1 existing entry");
        assert!(
            !candidate_conn1_loses_at_beta,
            "beta should replace its own conn2 with the incoming alpha-initiated conn1"
        );
    }
}
