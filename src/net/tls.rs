//! TLS client dialing with a bounded handshake.
//!
//! # Responsibilities
//! - Dial the raw connection through a pluggable dial function
//! - Wrap it in a rustls client session and race the handshake against a timer
//! - Verify the peer against the expected server name unless told not to
//! - Load trust roots and client certificates from PEM files
//!
//! # Design Decisions
//! - The dial context only governs the raw dial; the handshake is bounded by
//!   the handshake timeout alone
//! - On any handshake failure the session is dropped, which closes the raw
//!   connection; no half-initialized connection is returned

use std::fs::File;
use std::io::{self, BufReader};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use crate::config::{DialConfig, TlsSettings};
use crate::net::addr::NetAddr;
use crate::net::conn::{BoxConn, Conn, TcpConn};
use crate::net::error::TransportError;
use crate::net::signal::Done;
use crate::observability::metrics;

/// Handshake timeout used when none is configured.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Establishes the raw connection underneath TLS.
///
/// Takes the dial context, the network name and the address. Plug in a
/// custom implementation to add proxying or custom resolution.
pub trait DialFn:
    Fn(Done, String, String) -> BoxFuture<'static, Result<BoxConn, TransportError>> + Send + Sync
{
}

impl<F> DialFn for F where
    F: Fn(Done, String, String) -> BoxFuture<'static, Result<BoxConn, TransportError>> + Send + Sync
{
}

/// Default dial function: plain TCP for `tcp`, `tcp4` and `tcp6`.
pub fn tcp_dial(ctx: Done, network: String, addr: String) -> BoxFuture<'static, Result<BoxConn, TransportError>> {
    Box::pin(async move {
        let want_v4 = match network.as_str() {
            "tcp" => None,
            "tcp4" => Some(true),
            "tcp6" => Some(false),
            other => {
                return Err(TransportError::BadParameter(format!(
                    "unsupported network {:?}",
                    other
                )))
            }
        };

        let connect = async {
            let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr.as_str())
                .await?
                .filter(|a| want_v4.map_or(true, |v4| a.is_ipv4() == v4))
                .collect();
            if candidates.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no {} address for {}", network, addr),
                ));
            }
            TcpStream::connect(candidates.as_slice()).await
        };

        let stream = tokio::select! {
            biased;
            _ = ctx.wait() => return Err(TransportError::Cancelled),
            connected = connect => connected.map_err(|e| TransportError::io(format!("dial {}", addr), e))?,
        };
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::io("set nodelay", e))?;

        let conn = TcpConn::new(stream).map_err(|e| TransportError::io("dialed connection", e))?;
        Ok(Box::new(conn) as BoxConn)
    })
}

/// Client certificate presented during the handshake.
#[derive(Debug)]
pub struct ClientAuth {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for ClientAuth {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// TLS options for a dial.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Skip chain and hostname verification entirely.
    pub insecure_skip_verify: bool,
    /// Expected certificate name. Derived from the dial address when unset.
    pub server_name: Option<String>,
    /// Trusted roots. With none, every certificate fails verification.
    pub root_certs: Vec<CertificateDer<'static>>,
    pub client_auth: Option<ClientAuth>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl TlsClientConfig {
    /// Load the PEM material named in the settings.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TransportError> {
        let root_certs = match &settings.ca_path {
            Some(path) => load_certs(Path::new(path))?,
            None => Vec::new(),
        };

        let client_auth = match (&settings.cert_path, &settings.key_path) {
            (Some(cert), Some(key)) => Some(ClientAuth {
                cert_chain: load_certs(Path::new(cert))?,
                key: load_private_key(Path::new(key))?,
            }),
            (None, None) => None,
            _ => {
                return Err(TransportError::BadParameter(
                    "client certificate and key must be configured together".into(),
                ))
            }
        };

        Ok(Self {
            insecure_skip_verify: settings.insecure_skip_verify,
            server_name: settings.server_name.clone(),
            root_certs,
            client_auth,
            alpn_protocols: settings
                .alpn_protocols
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect(),
        })
    }

    fn client_config(&self) -> Result<ClientConfig, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(TransportError::Tls)?;

        let builder = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        } else {
            let mut roots = RootCertStore::empty();
            for cert in &self.root_certs {
                roots.add(cert.clone()).map_err(TransportError::Tls)?;
            }
            builder.with_root_certificates(roots)
        };

        let mut config = match &self.client_auth {
            Some(auth) => builder
                .with_client_auth_cert(auth.cert_chain.clone(), auth.key.clone_key())
                .map_err(TransportError::Tls)?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(config)
    }
}

/// Load every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::io(format!("open certificate file {:?}", path), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::io(format!("parse certificate file {:?}", path), e))?;
    if certs.is_empty() {
        return Err(TransportError::BadParameter(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::io(format!("open private key file {:?}", path), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::io(format!("parse private key file {:?}", path), e))?
        .ok_or_else(|| TransportError::BadParameter(format!("no private key found in {:?}", path)))
}

/// Host part of a dial address: `host:port`, `[v6]:port`, a bare host or a URL.
pub fn derive_server_name(addr: &str) -> Result<String, TransportError> {
    let addr = addr.trim();
    let bad = || TransportError::BadParameter(format!("cannot derive server name from {:?}", addr));

    if addr.contains("://") {
        let url = Url::parse(addr).map_err(|_| bad())?;
        return match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => Ok(domain.to_string()),
            Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
            Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
            _ => Err(bad()),
        };
    }
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok(socket.ip().to_string());
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        return Ok(rest[..end].to_string());
    }

    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    if host.is_empty() {
        return Err(bad());
    }
    Ok(host.to_string())
}

/// Server name sent in SNI when verification is off and the address names
/// no usable host.
const INSECURE_FALLBACK_SERVER_NAME: &str = "localhost";

/// Pick the name to verify the peer against. Without verification the name
/// only feeds SNI, so addresses that name no host (a socket path, a channel
/// id) fall back to a placeholder instead of failing.
fn resolve_server_name(
    tls: &TlsClientConfig,
    addr: &str,
) -> Result<(String, ServerName<'static>), TransportError> {
    let resolved = match tls.server_name.as_deref() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => derive_server_name(addr),
    }
    .and_then(|name| {
        ServerName::try_from(name.clone())
            .map(|server_name| (name.clone(), server_name))
            .map_err(|e| TransportError::BadParameter(format!("invalid server name {:?}: {}", name, e)))
    });

    match resolved {
        Err(e) if tls.insecure_skip_verify => {
            tracing::debug!(address = addr, error = %e, "Using placeholder server name");
            let name = INSECURE_FALLBACK_SERVER_NAME.to_string();
            let server_name = ServerName::try_from(name.clone())
                .map_err(|e| TransportError::BadParameter(format!("invalid server name {:?}: {}", name, e)))?;
            Ok((name, server_name))
        }
        other => other,
    }
}

/// Dials TLS connections with a fixed handshake timeout.
#[derive(Debug, Clone)]
pub struct TlsDialer {
    handshake_timeout: Duration,
}

impl TlsDialer {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    pub fn from_config(config: &DialConfig) -> Self {
        Self::new(Duration::from_millis(config.handshake_timeout_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Dial `addr`, perform the TLS handshake and verify the peer.
    ///
    /// `ctx` can abort the raw dial. Once the raw connection exists only the
    /// handshake timeout bounds the handshake.
    pub async fn dial<D>(
        &self,
        ctx: Done,
        dial: &D,
        network: &str,
        addr: &str,
        tls: &TlsClientConfig,
    ) -> Result<TlsConn, TransportError>
    where
        D: DialFn + ?Sized,
    {
        let (name, server_name) = resolve_server_name(tls, addr)?;
        let connector = TlsConnector::from(Arc::new(tls.client_config()?));

        let raw = tokio::select! {
            biased;
            _ = ctx.wait() => return Err(TransportError::Cancelled),
            raw = dial(ctx.clone(), network.to_string(), addr.to_string()) => raw?,
        };
        let remote = raw.remote_addr();

        let started = Instant::now();
        let handshake = tokio::time::timeout(self.handshake_timeout, connector.connect(server_name, raw)).await;

        match handshake {
            Err(_) => {
                metrics::record_handshake("timeout");
                tracing::warn!(
                    remote = %remote,
                    server_name = %name,
                    timeout = ?self.handshake_timeout,
                    "TLS handshake timed out"
                );
                Err(TransportError::HandshakeTimeout(self.handshake_timeout))
            }
            Ok(Err(e)) => {
                let err = handshake_error(e);
                let outcome = match err {
                    TransportError::Verification(_) => "verification_failed",
                    _ => "failed",
                };
                metrics::record_handshake(outcome);
                tracing::debug!(remote = %remote, server_name = %name, error = %err, "TLS handshake failed");
                Err(err)
            }
            Ok(Ok(stream)) => {
                metrics::record_handshake("ok");
                tracing::debug!(
                    remote = %remote,
                    server_name = %name,
                    elapsed = ?started.elapsed(),
                    "TLS handshake complete"
                );
                Ok(TlsConn { inner: stream })
            }
        }
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

/// Dial with [`DEFAULT_DIAL_TIMEOUT`] as the handshake timeout.
pub async fn tls_dial<D>(
    ctx: Done,
    dial: &D,
    network: &str,
    addr: &str,
    tls: &TlsClientConfig,
) -> Result<TlsConn, TransportError>
where
    D: DialFn + ?Sized,
{
    TlsDialer::default().dial(ctx, dial, network, addr, tls).await
}

fn handshake_error(err: io::Error) -> TransportError {
    let tls_err = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .cloned();
    match tls_err {
        Some(e @ rustls::Error::InvalidCertificate(_)) => TransportError::Verification(e),
        Some(e) => TransportError::Tls(e),
        None => TransportError::io("tls handshake", err),
    }
}

/// An established, verified client TLS connection.
pub struct TlsConn {
    inner: TlsStream<BoxConn>,
}

impl TlsConn {
    /// The raw connection underneath the session.
    pub fn get_ref(&self) -> &BoxConn {
        self.inner.get_ref().0
    }

    /// Protocol agreed through ALPN, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.inner.get_ref().1.alpn_protocol()
    }

    /// Certificate chain presented by the server.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.inner.get_ref().1.peer_certificates()
    }
}

impl Conn for TlsConn {
    fn local_addr(&self) -> NetAddr {
        self.get_ref().local_addr()
    }

    fn remote_addr(&self) -> NetAddr {
        self.get_ref().remote_addr()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.inner.get_mut().0.set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        self.inner.get_mut().0.set_write_deadline(deadline)
    }
}

impl AsyncRead for TlsConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Accepts any server certificate. Handshake signatures are still checked,
/// so the peer must hold the key for the certificate it presents.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
