use std::{
    fmt,
    net::{IpAddr, ToSocketAddrs},
    str::FromStr,
};

use error_stack::{IntoReport, ResultExt};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// A node listen/seed address: `tcp://host:port` or `unix:///path/to/socket`.
///
/// Mirrors `bndl.net.connection.urlparse` from the original implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAddress {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl NodeAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Resolves the host-part of a TCP address to its IP addresses. Returns an empty set for
    /// UNIX addresses, since those never share "the same host" in the sense of the block
    /// manager's local/remote candidate split (loopback-only by construction).
    pub fn resolve_ips(&self) -> Vec<IpAddr> {
        match self {
            Self::Tcp { host, port } => (host.as_str(), *port)
                .to_socket_addrs()
                .map(|addrs| addrs.map(|a| a.ip()).collect())
                .unwrap_or_default(),
            Self::Unix { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix { path } => write!(f, "unix://{path}"),
        }
    }
}

impl FromStr for NodeAddress {
    type Err = error_stack::Report<NetError>;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| NetError::configuration(format!("missing port in address {s}")))?;
            let port = port
                .parse::<u16>()
                .into_report()
                .change_context_lazy(|| NetError::configuration(format!("invalid port in {s}")))?;
            Ok(Self::Tcp {
                host: host.to_owned(),
                port,
            })
        } else if let Some(rest) = s.strip_prefix("unix://") {
            Ok(Self::Unix {
                path: rest.to_owned(),
            })
        } else {
            Err(error_stack::Report::new(NetError::configuration(format!(
                "unsupported scheme in address {s}"
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp() {
        let addr: NodeAddress = "tcp://localhost:5000".parse().unwrap();
        assert_eq!(addr, NodeAddress::tcp("localhost", 5000));
        assert_eq!(addr.to_string(), "tcp://localhost:5000");
    }

    #[test]
    fn parses_unix() {
        let addr: NodeAddress = "unix:///tmp/bndl.socket".parse().unwrap();
        assert_eq!(addr, NodeAddress::unix("/tmp/bndl.socket"));
        assert_eq!(addr.to_string(), "unix:///tmp/bndl.socket");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("ftp://localhost:21".parse::<NodeAddress>().is_err());
    }
}
