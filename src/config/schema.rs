//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport core.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Listeners fanned in by the server side.
    pub listeners: Vec<ListenerConfig>,

    /// Fan-in queue settings.
    pub fanin: FanInConfig,

    /// Client dial settings.
    pub dial: DialConfig,

    /// Client TLS material and verification.
    pub tls: TlsSettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3023").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3023".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Fan-in listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FanInConfig {
    /// Accepted connections that may wait for `accept` before workers block.
    pub queue_capacity: usize,
}

impl Default for FanInConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::net::fanin::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Dial configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DialConfig {
    /// TLS handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: crate::net::tls::DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Client TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsSettings {
    /// Skip certificate chain and hostname verification.
    pub insecure_skip_verify: bool,

    /// Expected server certificate name; derived from the dial address if unset.
    pub server_name: Option<String>,

    /// Path to trusted CA bundle (PEM).
    pub ca_path: Option<String>,

    /// Path to client certificate chain (PEM).
    pub cert_path: Option<String>,

    /// Path to client private key (PEM).
    pub key_path: Option<String>,

    /// ALPN protocols to offer, in preference order.
    pub alpn_protocols: Vec<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level for this crate when `RUST_LOG` is not set.
    pub log_level: String,

    /// Emit logs as JSON.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
