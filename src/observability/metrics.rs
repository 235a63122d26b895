//! Transport metrics.
//!
//! # Metrics
//! - `transport_fanin_accepted_total` (counter): connections queued, by listener
//! - `transport_fanin_drained_total` (counter): queued connections closed on shutdown
//! - `transport_listener_stopped_total` (counter): forwarders ended by a listener failure
//! - `transport_tls_handshakes_total` (counter): handshakes by outcome
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed

/// A connection from `listener` was queued for accept.
pub fn record_accepted(listener: &str) {
    ::metrics::counter!("transport_fanin_accepted_total", "listener" => listener.to_string()).increment(1);
}

/// `count` queued connections were closed during shutdown.
pub fn record_drained(count: usize) {
    ::metrics::counter!("transport_fanin_drained_total").increment(count as u64);
}

/// A forwarding worker stopped because its listener failed.
pub fn record_listener_stopped() {
    ::metrics::counter!("transport_listener_stopped_total").increment(1);
}

/// A TLS handshake finished with `outcome`
/// (`ok`, `timeout`, `verification_failed`, `failed`).
pub fn record_handshake(outcome: &'static str) {
    ::metrics::counter!("transport_tls_handshakes_total", "outcome" => outcome).increment(1);
}
