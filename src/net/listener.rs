//! Listener capability and the TCP implementation with backpressure.
//!
//! # Responsibilities
//! - Define the accept/close contract every listener (real or virtual) honours
//! - Bind TCP listeners from configuration
//! - Enforce max_connections limit via semaphore
//! - Release the socket on close, not on drop of the last reference

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};

use crate::config::ListenerConfig;
use crate::net::addr::NetAddr;
use crate::net::conn::{BoxConn, TcpConn};
use crate::net::error::TransportError;
use crate::net::signal::CancelSignal;

/// Source of inbound connections.
///
/// `accept` must be cancel-safe: dropping its future before it completes
/// must not lose a connection. After `close`, `accept` returns
/// [`TransportError::ListenerClosed`].
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<BoxConn, TransportError>;

    /// Stop accepting and release the underlying acceptor.
    async fn close(&self) -> Result<(), TransportError>;

    /// Address this listener accepts on.
    fn local_addr(&self) -> NetAddr;
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// `accept` waits until an earlier connection is dropped.
pub struct TcpAcceptor {
    /// The underlying TCP listener, taken out on close.
    inner: RwLock<Option<TcpListener>>,
    local_addr: SocketAddr,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
    closed: CancelSignal,
}

impl TcpAcceptor {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, TransportError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            TransportError::BadParameter(format!(
                "invalid bind address {:?}: {}",
                config.bind_address, e
            ))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::io(format!("bind {}", addr), e))?;

        Self::from_listener(listener, config.max_connections)
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener, max_connections: usize) -> Result<Self, TransportError> {
        if max_connections == 0 {
            return Err(TransportError::BadParameter(
                "max_connections must be greater than zero".into(),
            ));
        }
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::io("listener address", e))?;

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: RwLock::new(Some(listener)),
            local_addr,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            closed: CancelSignal::new(),
        })
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> Result<BoxConn, TransportError> {
        let guard = self.inner.read().await;
        let listener = guard.as_ref().ok_or(TransportError::ListenerClosed)?;
        let done = self.closed.done();

        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            biased;
            _ = done.wait() => return Err(TransportError::ListenerClosed),
            permit = self.connection_limit.clone().acquire_owned() => {
                permit.map_err(|_| TransportError::ListenerClosed)?
            }
        };

        let (stream, peer_addr) = tokio::select! {
            biased;
            _ = done.wait() => return Err(TransportError::ListenerClosed),
            accepted = listener.accept() => {
                accepted.map_err(|e| TransportError::io("accept", e))?
            }
        };

        // Wildcard binds report the concrete interface once connected.
        let local = stream.local_addr().unwrap_or(self.local_addr);
        let conn = TcpConn::accepted(stream, local, peer_addr)
            .with_permit(ConnectionPermit { _permit: permit });

        tracing::debug!(
            peer_addr = %peer_addr,
            connection_id = %conn.id(),
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok(Box::new(conn))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.cancel() {
            return Err(TransportError::ListenerClosed);
        }
        self.connection_limit.close();
        // Pending accepts hold the read lock until they observe the signal.
        drop(self.inner.write().await.take());
        tracing::info!(address = %self.local_addr, "Listener closed");
        Ok(())
    }

    fn local_addr(&self) -> NetAddr {
        self.local_addr.into()
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
