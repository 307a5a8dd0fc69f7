//! Peer membership and transport layer: connection-contest resolution, hello handshake, gossip
//! discovery, and a length-prefixed request/response wire protocol with a raw attachment
//! side-channel. Grounded in `original_source/bndl/net/`.

pub mod address;
pub mod connection;
pub mod error;
pub mod node;
pub mod peer;
pub mod service;
pub mod wire;

pub use address::NodeAddress;
pub use error::{NetError, Result};
pub use node::{Node, PeerSnapshot};
pub use peer::{Peer, PeerTable};
pub use service::{RequestContext, Service};
