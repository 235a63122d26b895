//! Transport error taxonomy.
//!
//! Errors are `Clone` so the fan-in listener can hand the same close result to
//! every caller of `close`. I/O sources are kept behind an `Arc` for that reason.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by listeners, connections and the TLS dial helper.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Malformed or missing input, rejected before any work starts.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The listener was closed; no further connections will be accepted.
    #[error("connection problem: listener closed")]
    ListenerClosed,

    /// The connection was already closed.
    #[error("connection problem: use of closed network connection")]
    ConnectionClosed,

    /// The TLS handshake did not finish within the configured window.
    #[error("connection problem: handshake timeout after {0:?}")]
    HandshakeTimeout(Duration),

    /// Any other connection-level failure.
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// The dial context was cancelled before the raw connection was established.
    #[error("operation cancelled")]
    Cancelled,

    /// Deadlines are not available on this connection type.
    #[error("{0} deadline not supported on multiplexed channel")]
    DeadlineNotSupported(&'static str),

    /// The peer certificate failed chain or hostname verification.
    #[error("certificate verification failed: {0}")]
    Verification(#[source] rustls::Error),

    /// TLS protocol failure other than certificate verification.
    #[error("tls: {0}")]
    Tls(#[source] rustls::Error),

    /// I/O failure with the operation that produced it.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Several independent failures reported together.
    #[error(transparent)]
    Aggregate(AggregateError),
}

impl TransportError {
    /// Wrap an I/O error with the operation that failed.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        TransportError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Collapse a list of errors: none is success, one is returned as is,
    /// several become an [`AggregateError`].
    pub fn aggregate(mut errors: Vec<TransportError>) -> Result<(), TransportError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TransportError::Aggregate(AggregateError(errors))),
        }
    }

    /// Whether the error belongs to the connection-problem family, which upper
    /// layers treat as "try another path" rather than fatal.
    pub fn is_connection_problem(&self) -> bool {
        matches!(
            self,
            TransportError::ListenerClosed
                | TransportError::ConnectionClosed
                | TransportError::HandshakeTimeout(_)
                | TransportError::ConnectionProblem(_)
                | TransportError::Io { .. }
        )
    }

    /// Whether an accept loop should back off and try again instead of giving up.
    pub fn is_temporary(&self) -> bool {
        let TransportError::Io { source, .. } = self else {
            return false;
        };
        match source.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => true,
            // EMFILE / ENFILE / ENOBUFS / ENOMEM
            _ => matches!(source.raw_os_error(), Some(23 | 24 | 105 | 12)),
        }
    }
}

/// A collection of errors that happened independently of each other.
#[derive(Debug, Clone)]
pub struct AggregateError(Vec<TransportError>);

impl AggregateError {
    /// The individual errors, in the order they occurred.
    pub fn errors(&self) -> &[TransportError] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_ok() {
        assert!(TransportError::aggregate(Vec::new()).is_ok());
    }

    #[test]
    fn aggregate_of_one_is_unwrapped() {
        let err = TransportError::aggregate(vec![TransportError::ListenerClosed]).unwrap_err();
        assert!(matches!(err, TransportError::ListenerClosed));
    }

    #[test]
    fn aggregate_names_every_failure() {
        let err = TransportError::aggregate(vec![
            TransportError::ConnectionProblem("a failed".into()),
            TransportError::ConnectionProblem("b failed".into()),
        ])
        .unwrap_err();

        let TransportError::Aggregate(ref agg) = err else {
            panic!("expected aggregate, got {err:?}");
        };
        assert_eq!(agg.errors().len(), 2);
        let msg = err.to_string();
        assert!(msg.contains("a failed"));
        assert!(msg.contains("b failed"));
    }

    #[test]
    fn listener_closed_message() {
        assert_eq!(
            TransportError::ListenerClosed.to_string(),
            "connection problem: listener closed"
        );
        assert!(TransportError::ListenerClosed.is_connection_problem());
    }

    #[test]
    fn temporary_classification() {
        let aborted = TransportError::io(
            "accept",
            io::Error::new(io::ErrorKind::ConnectionAborted, "aborted"),
        );
        assert!(aborted.is_temporary());

        let fd_limit = TransportError::io("accept", io::Error::from_raw_os_error(24));
        assert!(fd_limit.is_temporary());

        let reset_before_accept = TransportError::io(
            "accepted connection",
            io::Error::new(io::ErrorKind::NotConnected, "peer gone"),
        );
        assert!(reset_before_accept.is_temporary());

        let invalid = TransportError::io(
            "accept",
            io::Error::new(io::ErrorKind::InvalidInput, "bad socket"),
        );
        assert!(!invalid.is_temporary());
        assert!(!TransportError::ListenerClosed.is_temporary());
    }

    #[test]
    fn deadline_error_is_not_connection_problem() {
        let err = TransportError::DeadlineNotSupported("read");
        assert!(!err.is_connection_problem());
        assert_eq!(err.to_string(), "read deadline not supported on multiplexed channel");
    }
}
