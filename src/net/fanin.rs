//! Fan-in listener: many listeners, one accept stream.
//!
//! # Responsibilities
//! - Run one forwarding worker per underlying listener
//! - Merge accepted connections into a single bounded queue
//! - Shut down exactly once: stop workers, close listeners, drain the queue
//!
//! # Design Decisions
//! - A listener that fails permanently stops only its own worker
//! - Workers reserve queue capacity before giving up a connection, so a
//!   connection is either queued or closed by the worker, never lost
//! - Workers are joined before the drain, so nothing is pushed behind it

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::config::{FanInConfig, ListenerConfig};
use crate::net::addr::NetAddr;
use crate::net::backoff::accept_backoff;
use crate::net::conn::{close_conn, BoxConn, Conn};
use crate::net::error::TransportError;
use crate::net::listener::{Listener, TcpAcceptor};
use crate::net::signal::{CancelSignal, Done};
use crate::observability::metrics;

/// Queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Aggregates several listeners into one.
pub struct FanInListener {
    listeners: Vec<Arc<dyn Listener>>,
    queue_tx: mpsc::Sender<BoxConn>,
    queue_rx: Mutex<mpsc::Receiver<BoxConn>>,
    cancel: CancelSignal,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    close_result: OnceCell<Result<(), TransportError>>,
}

impl FanInListener {
    /// Start forwarding from every listener with the default queue capacity.
    pub fn new(listeners: Vec<Arc<dyn Listener>>) -> Self {
        Self::with_capacity(listeners, DEFAULT_QUEUE_CAPACITY)
    }

    /// Start forwarding from every listener using the configured queue capacity.
    pub fn from_config(config: &FanInConfig, listeners: Vec<Arc<dyn Listener>>) -> Self {
        Self::with_capacity(listeners, config.queue_capacity)
    }

    /// Start forwarding from every listener into a queue of `capacity`
    /// connections. Must be called from within a Tokio runtime.
    pub fn with_capacity(listeners: Vec<Arc<dyn Listener>>, capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let cancel = CancelSignal::new();

        let workers = listeners
            .iter()
            .enumerate()
            .map(|(index, listener)| {
                tokio::spawn(forward(
                    index,
                    Arc::clone(listener),
                    queue_tx.clone(),
                    cancel.done(),
                ))
            })
            .collect();

        tracing::debug!(listeners = listeners.len(), capacity, "Fan-in listener started");

        Self {
            listeners,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            cancel,
            workers: StdMutex::new(workers),
            close_result: OnceCell::new(),
        }
    }

    /// Bind a TCP acceptor per listener config and fan them in.
    ///
    /// If any bind fails, acceptors bound so far are closed again.
    pub async fn bind(config: &FanInConfig, listeners: &[ListenerConfig]) -> Result<Self, TransportError> {
        let mut bound: Vec<Arc<dyn Listener>> = Vec::with_capacity(listeners.len());
        for listener_config in listeners {
            match TcpAcceptor::bind(listener_config).await {
                Ok(acceptor) => bound.push(Arc::new(acceptor)),
                Err(e) => {
                    for listener in &bound {
                        if let Err(close_err) = listener.close().await {
                            tracing::warn!(error = %close_err, "Failed to release listener after bind error");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::from_config(config, bound))
    }

    /// Signal that fires once this listener starts closing.
    pub fn done(&self) -> Done {
        self.cancel.done()
    }

    /// A handle for pushing already established connections into the
    /// accept stream.
    pub fn sender(&self) -> FanInSender {
        FanInSender {
            queue_tx: self.queue_tx.clone(),
            done: self.cancel.done(),
        }
    }

    /// Number of listeners being fanned in.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listeners are fanned in; connections can still arrive
    /// through [`FanInListener::sender`].
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.cancel.cancel();

        let mut errors = Vec::new();
        for (index, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.close().await {
                tracing::warn!(listener = index, error = %e, "Failed to close listener");
                errors.push(e);
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Forwarding worker ended abnormally");
            }
        }

        // Senders may still hold reserved slots; `recv` waits for those to be
        // used or released before reporting the queue empty.
        let mut queue = self.queue_rx.lock().await;
        queue.close();
        let mut drained = 0usize;
        while let Some(conn) = queue.recv().await {
            drained += 1;
            if let Err(e) = close_conn(conn).await {
                tracing::debug!(error = %e, "Failed to close queued connection");
            }
        }
        if drained > 0 {
            metrics::record_drained(drained);
        }

        tracing::info!(
            listeners = self.listeners.len(),
            drained,
            failed_closes = errors.len(),
            "Fan-in listener closed"
        );

        TransportError::aggregate(errors)
    }
}

#[async_trait]
impl Listener for FanInListener {
    /// Wait for a connection from any listener. Returns
    /// [`TransportError::ListenerClosed`] once closing has started, even if
    /// connections are still queued.
    async fn accept(&self) -> Result<BoxConn, TransportError> {
        let done = self.cancel.done();
        tokio::select! {
            biased;
            _ = done.wait() => Err(TransportError::ListenerClosed),
            conn = async { self.queue_rx.lock().await.recv().await } => {
                conn.ok_or(TransportError::ListenerClosed)
            }
        }
    }

    /// Close every listener and every connection still queued. Idempotent:
    /// all calls return the result of the first.
    async fn close(&self) -> Result<(), TransportError> {
        self.close_result
            .get_or_init(|| self.shutdown())
            .await
            .clone()
    }

    /// Address of the first listener, or [`NetAddr::placeholder`] if there
    /// are none.
    fn local_addr(&self) -> NetAddr {
        self.listeners
            .first()
            .map(|listener| listener.local_addr())
            .unwrap_or_else(NetAddr::placeholder)
    }
}

impl Drop for FanInListener {
    fn drop(&mut self) {
        // Workers keep their listener alive; make sure they let go.
        self.cancel.cancel();
    }
}

/// Pushes connections into a [`FanInListener`]'s accept stream.
#[derive(Clone)]
pub struct FanInSender {
    queue_tx: mpsc::Sender<BoxConn>,
    done: Done,
}

impl FanInSender {
    /// Queue a connection, waiting for capacity. If the fan-in is closed the
    /// connection is closed and [`TransportError::ListenerClosed`] returned.
    pub async fn send(&self, conn: BoxConn) -> Result<(), TransportError> {
        let reserved = tokio::select! {
            biased;
            _ = self.done.wait() => None,
            permit = self.queue_tx.reserve() => permit.ok(),
        };
        match reserved {
            Some(permit) => {
                permit.send(conn);
                Ok(())
            }
            None => {
                let _ = close_conn(conn).await;
                Err(TransportError::ListenerClosed)
            }
        }
    }

    /// Signal that fires once the fan-in starts closing.
    pub fn done(&self) -> Done {
        self.done.clone()
    }
}

async fn forward(
    index: usize,
    listener: Arc<dyn Listener>,
    queue: mpsc::Sender<BoxConn>,
    done: Done,
) {
    let addr = listener.local_addr();
    let label = addr.to_string();
    let mut failures = 0u32;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = done.wait() => break,
            accepted = listener.accept() => accepted,
        };

        let conn = match accepted {
            Ok(conn) => {
                failures = 0;
                conn
            }
            Err(e) if e.is_temporary() => {
                failures = failures.saturating_add(1);
                let delay = accept_backoff(failures);
                tracing::warn!(listener = index, address = %addr, error = %e, ?delay, "Temporary accept error");
                tokio::select! {
                    biased;
                    _ = done.wait() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            Err(e) => {
                if done.is_done() {
                    tracing::debug!(listener = index, address = %addr, "Listener closed during shutdown");
                } else {
                    tracing::warn!(listener = index, address = %addr, error = %e, "Listener failed, stopping its forwarder");
                    metrics::record_listener_stopped();
                }
                break;
            }
        };

        tokio::select! {
            biased;
            _ = done.wait() => {
                let _ = close_conn(conn).await;
                break;
            }
            permit = queue.reserve() => match permit {
                Ok(permit) => {
                    tracing::debug!(listener = index, remote = %conn.remote_addr(), "Connection queued");
                    metrics::record_accepted(&label);
                    permit.send(conn);
                }
                Err(_) => {
                    let _ = close_conn(conn).await;
                    break;
                }
            },
        }
    }

    tracing::debug!(listener = index, address = %addr, "Forwarding worker stopped");
}
