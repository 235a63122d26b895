//! Network addresses for real and virtual connections.

use std::fmt;
use std::net::SocketAddr;

/// A network address: the network name (`tcp`, `ssh-channel`, ...) and an
/// address string in that network's notation.
///
/// Virtual connections have no socket address, so this is deliberately not
/// a [`SocketAddr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddr {
    network: String,
    addr: String,
}

impl NetAddr {
    /// Create an address in the given network.
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            addr: addr.into(),
        }
    }

    /// Sentinel returned by a fan-in listener that wraps no listeners.
    /// Nothing is bound at this address.
    pub fn placeholder() -> Self {
        Self::new("tcp", "127.0.0.1:0")
    }

    /// The network name.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The address string.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Parse the address as a socket address, if it is one.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addr.parse().ok()
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new("tcp", addr.to_string())
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.addr)
    }
}
