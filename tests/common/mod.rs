//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use access_transport::net::{
    BoxConn, CancelSignal, ChanConn, Conn, Done, Listener, NetAddr, TcpConn, TransportError,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

/// An in-memory listener fed through an mpsc sender, standing in for a
/// listener of virtual (channel) connections.
pub struct ChannelListener {
    name: String,
    rx: Mutex<mpsc::Receiver<BoxConn>>,
    closed: CancelSignal,
    close_error: Option<String>,
    close_calls: AtomicUsize,
}

impl ChannelListener {
    pub fn new(name: &str) -> (Arc<Self>, mpsc::Sender<BoxConn>) {
        Self::build(name, None)
    }

    /// A listener whose `close` reports `message` as a failure.
    pub fn failing_close(name: &str, message: &str) -> (Arc<Self>, mpsc::Sender<BoxConn>) {
        Self::build(name, Some(message.to_string()))
    }

    fn build(name: &str, close_error: Option<String>) -> (Arc<Self>, mpsc::Sender<BoxConn>) {
        let (tx, rx) = mpsc::channel(64);
        let listener = Arc::new(Self {
            name: name.to_string(),
            rx: Mutex::new(rx),
            closed: CancelSignal::new(),
            close_error,
            close_calls: AtomicUsize::new(0),
        });
        (listener, tx)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&self) -> Result<BoxConn, TransportError> {
        let done = self.closed.done();
        tokio::select! {
            biased;
            _ = done.wait() => Err(TransportError::ListenerClosed),
            conn = async { self.rx.lock().await.recv().await } => {
                conn.ok_or_else(|| TransportError::ConnectionProblem(format!("{} feed dropped", self.name)))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        match &self.close_error {
            Some(message) => Err(TransportError::ConnectionProblem(message.clone())),
            None => Ok(()),
        }
    }

    fn local_addr(&self) -> NetAddr {
        NetAddr::new("virtual", self.name.clone())
    }
}

/// A channel connection tagged `listener/n`, with the far end of the
/// channel and the connection's close signal.
pub fn virtual_conn(listener: &str, n: usize) -> (BoxConn, DuplexStream, Done) {
    let (ours, theirs) = duplex(1024);
    let conn = ChanConn::new(
        NetAddr::new("virtual", format!("{}/{}", listener, n)),
        NetAddr::new("virtual", format!("client-{}", n)),
        ours,
    );
    let done = conn.done();
    (Box::new(conn), theirs, done)
}

/// Whether the far end of a channel observes the connection as closed.
pub async fn peer_sees_close(peer: &mut DuplexStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(peer.read(&mut buf).await, Ok(0) | Err(_))
}

/// Connect to `addr` and abort the connection with a reset before the
/// server gets to accept it. Returns the client's address.
pub async fn reset_client(addr: SocketAddr) -> SocketAddr {
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_linger(Some(std::time::Duration::ZERO)).unwrap();
    let stream = socket.connect(addr).await.unwrap();
    let local = stream.local_addr().unwrap();
    drop(stream);
    local
}

/// A self-signed certificate and its key.
pub struct SelfSigned {
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn self_signed(name: &str) -> SelfSigned {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    SelfSigned {
        cert_der: certified.cert.der().clone(),
        key_der: certified.key_pair.serialize_der(),
        cert_pem: certified.cert.pem(),
        key_pem: certified.key_pair.serialize_pem(),
    }
}

/// Start a TLS server that greets every client and then waits for it to leave.
pub async fn start_tls_server(cert: &SelfSigned, greeting: &'static [u8]) -> SocketAddr {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.cert_der.clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_der.clone())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    let _ = tls.write_all(greeting).await;
                    let _ = tls.flush().await;
                    let mut buf = [0u8; 64];
                    let _ = tls.read(&mut buf).await;
                }
            });
        }
    });

    addr
}

/// Start a server that accepts TCP connections and never speaks. Each
/// accepted socket reports on the returned channel once its peer closes it.
pub async fn start_silent_server() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                let _ = closed_tx.send(());
            });
        }
    });

    (addr, closed_rx)
}

/// A TCP connection that records when it is dropped.
pub struct TrackedConn {
    inner: TcpConn,
    dropped: Arc<AtomicBool>,
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

impl Conn for TrackedConn {
    fn local_addr(&self) -> NetAddr {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> NetAddr {
        self.inner.remote_addr()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.inner.set_write_deadline(deadline)
    }
}

impl AsyncRead for TrackedConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A dial function that ignores the requested address, connects to
/// `target` and flags `dropped` when the raw connection goes away.
pub fn tracked_dial(
    target: SocketAddr,
    dropped: Arc<AtomicBool>,
) -> impl Fn(Done, String, String) -> BoxFuture<'static, Result<BoxConn, TransportError>> + Send + Sync {
    move |_ctx: Done, _network: String, _addr: String| {
        let dropped = dropped.clone();
        let fut: BoxFuture<'static, Result<BoxConn, TransportError>> = Box::pin(async move {
            let stream = TcpStream::connect(target)
                .await
                .map_err(|e| TransportError::io("dial", e))?;
            let inner = TcpConn::new(stream).map_err(|e| TransportError::io("dial", e))?;
            Ok(Box::new(TrackedConn { inner, dropped }) as BoxConn)
        });
        fut
    }
}
