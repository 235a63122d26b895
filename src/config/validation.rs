//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities and timeouts > 0, addresses parse)
//! - Check that paired TLS settings come together
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::TransportConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listeners[{index}]: invalid bind address {address:?}")]
    BindAddress { index: usize, address: String },

    #[error("listeners[{index}]: max_connections must be greater than zero")]
    MaxConnections { index: usize },

    #[error("fanin.queue_capacity must be greater than zero")]
    QueueCapacity,

    #[error("dial.handshake_timeout_ms must be greater than zero")]
    HandshakeTimeout,

    #[error("tls.cert_path and tls.key_path must be set together")]
    ClientCertPair,

    #[error("tls.server_name must not be empty when set")]
    EmptyServerName,
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (index, listener) in config.listeners.iter().enumerate() {
        if listener.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::BindAddress {
                index,
                address: listener.bind_address.clone(),
            });
        }
        if listener.max_connections == 0 {
            errors.push(ValidationError::MaxConnections { index });
        }
    }

    if config.fanin.queue_capacity == 0 {
        errors.push(ValidationError::QueueCapacity);
    }

    if config.dial.handshake_timeout_ms == 0 {
        errors.push(ValidationError::HandshakeTimeout);
    }

    if config.tls.cert_path.is_some() != config.tls.key_path.is_some() {
        errors.push(ValidationError::ClientCertPair);
    }

    if config.tls.server_name.as_deref() == Some("") {
        errors.push(ValidationError::EmptyServerName);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
