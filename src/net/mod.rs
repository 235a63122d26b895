//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Server side:
//!     TcpAcceptor / virtual listeners (listener.rs)
//!         → one forwarding worker each (fanin.rs)
//!         → shared bounded queue
//!         → FanInListener::accept
//!
//! Multiplexed sessions:
//!     SSH channel (or any sub-stream) → ChanConn (chanconn.rs) → Conn
//!
//! Client side:
//!     DialFn (tcp_dial or custom) → rustls handshake raced against timer (tls.rs)
//!         → verified TlsConn
//! ```
//!
//! # Design Decisions
//! - Every connection is a `Conn`, whether socket, channel or TLS session
//! - Cancellation is a one-shot watch signal (signal.rs), never polled
//! - Errors are typed (error.rs) so callers can tell connection problems apart

pub mod addr;
pub mod backoff;
pub mod chanconn;
pub mod conn;
pub mod error;
pub mod fanin;
pub mod listener;
pub mod signal;
pub mod tls;

pub use addr::NetAddr;
pub use chanconn::ChanConn;
pub use conn::{close_conn, BoxConn, Conn, ConnectionId, TcpConn};
pub use error::{AggregateError, TransportError};
pub use fanin::{FanInListener, FanInSender};
pub use listener::{Listener, TcpAcceptor};
pub use signal::{CancelSignal, Done};
pub use tls::{tcp_dial, tls_dial, DialFn, TlsClientConfig, TlsConn, TlsDialer};
