//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listeners, fan-in workers, dialer produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters via the metrics facade)
//!
//! Consumers:
//!     → Whatever subscriber / recorder the embedding binary installs
//! ```
//!
//! # Design Decisions
//! - The library never installs a global recorder; binaries choose one
//! - Log fields are stable keys (`listener`, `address`, `connection_id`, `error`)

pub mod logging;
pub mod metrics;
