//! Transport core for a secure access proxy.
//!
//! - [`FanInListener`] merges several listeners into one accept stream
//! - [`ChanConn`] presents a multiplexed sub-channel as a connection
//! - [`TlsDialer`] dials TLS with a bounded, verified handshake

pub mod config;
pub mod net;
pub mod observability;

pub use config::TransportConfig;
pub use net::{
    BoxConn, CancelSignal, ChanConn, Conn, Done, FanInListener, Listener, NetAddr, TlsClientConfig,
    TlsConn, TlsDialer, TransportError,
};
