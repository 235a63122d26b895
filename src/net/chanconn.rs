//! Connection adapter for multiplexed sub-channels.
//!
//! A sub-channel (an SSH channel, a stream inside any other multiplexed
//! session) is a plain byte stream with no addresses and no deadlines.
//! [`ChanConn`] gives it the shape of a [`Conn`] so upper layers cannot tell
//! it apart from a socket. The multiplexed session itself is not owned here,
//! only the one channel.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;

use crate::net::addr::NetAddr;
use crate::net::conn::{Conn, ConnectionId};
use crate::net::error::TransportError;
use crate::net::signal::{CancelSignal, Done};

/// A sub-channel presented as a network connection.
///
/// Deadlines are rejected: the channel transport has no way to interrupt a
/// blocked read or write, and pretending otherwise would turn timeout-based
/// liveness checks into silent hangs.
pub struct ChanConn<C> {
    channel: C,
    local: NetAddr,
    remote: NetAddr,
    closed: CloseSignal,
}

/// Fires the adapter's close signal at most once, and at the latest on drop.
struct CloseSignal {
    signal: CancelSignal,
    id: ConnectionId,
}

impl CloseSignal {
    fn fire(&self) {
        if self.signal.cancel() {
            tracing::trace!(connection_id = %self.id, "Channel connection closed");
        }
    }

    fn is_fired(&self) -> bool {
        self.signal.is_cancelled()
    }
}

impl Drop for CloseSignal {
    fn drop(&mut self) {
        self.fire();
    }
}

impl<C> ChanConn<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(local: NetAddr, remote: NetAddr, channel: C) -> Self {
        let id = ConnectionId::new();
        tracing::trace!(connection_id = %id, local = %local, remote = %remote, "Channel connection opened");
        Self {
            channel,
            local,
            remote,
            closed: CloseSignal {
                signal: CancelSignal::new(),
                id,
            },
        }
    }

    /// Fire the close signal, then close the sub-channel.
    ///
    /// Later reads and writes fail. Repeated calls are passed through to the
    /// sub-channel; the signal only fires once.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.shutdown()
            .await
            .map_err(|e| TransportError::io("close channel", e))
    }

    /// Signal that fires when this connection is closed.
    pub fn done(&self) -> Done {
        self.closed.signal.done()
    }

    pub fn id(&self) -> ConnectionId {
        self.closed.id
    }

    pub fn get_ref(&self) -> &C {
        &self.channel
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Give the sub-channel back to the caller. The adapter counts as closed,
    /// so its signal fires; the sub-channel itself is left open.
    pub fn into_inner(self) -> C {
        let ChanConn { channel, closed, .. } = self;
        closed.fire();
        channel
    }
}

fn use_after_close() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed network connection")
}

impl<C> Conn for ChanConn<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn local_addr(&self) -> NetAddr {
        self.local.clone()
    }

    fn remote_addr(&self) -> NetAddr {
        self.remote.clone()
    }

    fn set_read_deadline(&mut self, _deadline: Option<Instant>) -> Result<(), TransportError> {
        Err(TransportError::DeadlineNotSupported("read"))
    }

    fn set_write_deadline(&mut self, _deadline: Option<Instant>) -> Result<(), TransportError> {
        Err(TransportError::DeadlineNotSupported("write"))
    }
}

impl<C> AsyncRead for ChanConn<C>
where
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.is_fired() {
            return Poll::Ready(Err(use_after_close()));
        }
        Pin::new(&mut this.channel).poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for ChanConn<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.is_fired() {
            return Poll::Ready(Err(use_after_close()));
        }
        Pin::new(&mut this.channel).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().channel).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.closed.fire();
        Pin::new(&mut this.channel).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn adapter() -> (ChanConn<DuplexStream>, DuplexStream) {
        let (ours, theirs) = duplex(1024);
        let conn = ChanConn::new(
            NetAddr::new("ssh-channel", "proxy:3022"),
            NetAddr::new("ssh-channel", "node-1:22"),
            ours,
        );
        (conn, theirs)
    }

    #[test]
    fn addresses_are_fixed() {
        let (conn, _peer) = adapter();
        assert_eq!(conn.local_addr(), NetAddr::new("ssh-channel", "proxy:3022"));
        assert_eq!(conn.remote_addr(), NetAddr::new("ssh-channel", "node-1:22"));
    }

    #[test]
    fn set_deadline_fails_on_read_path() {
        let (mut conn, _peer) = adapter();
        let err = conn.set_deadline(Some(Instant::now())).unwrap_err();
        assert!(matches!(err, TransportError::DeadlineNotSupported("read")));
    }

    #[test]
    fn write_deadline_unsupported() {
        let (mut conn, _peer) = adapter();
        assert!(matches!(
            conn.set_write_deadline(None),
            Err(TransportError::DeadlineNotSupported("write"))
        ));
        assert!(matches!(
            conn.set_read_deadline(None),
            Err(TransportError::DeadlineNotSupported("read"))
        ));
    }

    #[tokio::test]
    async fn close_fires_done_before_peer_sees_eof() {
        let (mut conn, mut peer) = adapter();
        let done = conn.done();
        assert!(!done.is_done());

        conn.close().await.unwrap();
        assert!(done.is_done());

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_close_is_delegated() {
        let (mut conn, _peer) = adapter();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.done().is_done());
    }

    #[tokio::test]
    async fn reads_and_writes_fail_after_close() {
        let (mut conn, mut peer) = adapter();
        conn.close().await.unwrap();

        peer.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let err = conn.write_all(b"more").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn into_inner_fires_done_and_keeps_channel_open() {
        let (conn, mut peer) = adapter();
        let done = conn.done();

        let mut channel = conn.into_inner();
        assert!(done.is_done());

        channel.write_all(b"raw").await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw");
    }

    #[test]
    fn drop_fires_done() {
        let (conn, _peer) = adapter();
        let done = conn.done();
        drop(conn);
        assert!(done.is_done());
    }
}
