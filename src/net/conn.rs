//! Connection capability and the TCP implementation.
//!
//! # Responsibilities
//! - Define what every connection handed out by this crate can do
//! - Generate unique connection IDs for tracing
//! - Give plain TCP streams the deadline semantics of a network connection

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

use crate::net::addr::NetAddr;
use crate::net::error::TransportError;
use crate::net::listener::ConnectionPermit;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A bidirectional byte stream with network-connection semantics.
///
/// Closing is `AsyncWriteExt::shutdown` followed by drop; see [`close_conn`].
/// A `None` deadline clears any previously set one.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> NetAddr;

    fn remote_addr(&self) -> NetAddr;

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError>;

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError>;

    /// Set both deadlines, read first. Fails as soon as one setter fails.
    fn set_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }
}

/// Type-erased connection as produced by listeners and dial functions.
pub type BoxConn = Box<dyn Conn>;

impl<T: Conn + ?Sized> Conn for Box<T> {
    fn local_addr(&self) -> NetAddr {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> NetAddr {
        (**self).remote_addr()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        (**self).set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        (**self).set_write_deadline(deadline)
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        (**self).set_deadline(deadline)
    }
}

/// Shut a connection down and release it.
pub async fn close_conn(mut conn: BoxConn) -> Result<(), TransportError> {
    conn.shutdown()
        .await
        .map_err(|e| TransportError::io("close connection", e))
}

/// A TCP stream with read and write deadlines.
///
/// An expired deadline fails the pending and all later operations in that
/// direction with `io::ErrorKind::TimedOut` until it is moved or cleared.
pub struct TcpConn {
    stream: TcpStream,
    id: ConnectionId,
    local: NetAddr,
    remote: NetAddr,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    _permit: Option<ConnectionPermit>,
}

impl TcpConn {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?.into();
        let remote = stream.peer_addr()?.into();
        Ok(Self {
            stream,
            id: ConnectionId::new(),
            local,
            remote,
            read_deadline: None,
            write_deadline: None,
            _permit: None,
        })
    }

    /// Wrap a stream fresh from `accept`, using the peer address accept
    /// reported. The peer may already have reset the connection, so the
    /// socket is not asked again.
    pub(crate) fn accepted(stream: TcpStream, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            stream,
            id: ConnectionId::new(),
            local: local.into(),
            remote: remote.into(),
            read_deadline: None,
            write_deadline: None,
            _permit: None,
        }
    }

    /// Hold a listener slot for as long as this connection lives.
    pub(crate) fn with_permit(mut self, permit: ConnectionPermit) -> Self {
        self._permit = Some(permit);
        self
    }

    /// This connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

fn deadline_sleep(deadline: Option<Instant>) -> Option<Pin<Box<Sleep>>> {
    deadline.map(|at| Box::pin(tokio::time::sleep_until(at)))
}

fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>, what: &str) -> Option<io::Error> {
    let sleep = deadline.as_mut()?;
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => Some(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} deadline exceeded"),
        )),
        Poll::Pending => None,
    }
}

impl Conn for TcpConn {
    fn local_addr(&self) -> NetAddr {
        self.local.clone()
    }

    fn remote_addr(&self) -> NetAddr {
        self.remote.clone()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.read_deadline = deadline_sleep(deadline);
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.write_deadline = deadline_sleep(deadline);
        Ok(())
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = expired(&mut this.read_deadline, cx, "read") {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = expired(&mut this.write_deadline, cx, "write") {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = expired(&mut this.write_deadline, cx, "write") {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        tracing::trace!(connection_id = %self.id, remote = %self.remote, "Connection closed");
    }
}
