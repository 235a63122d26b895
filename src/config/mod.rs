//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → handed to FanInListener::bind, TlsDialer::from_config,
//!       TlsClientConfig::from_settings, init_logging
//! ```
//!
//! # Design Decisions
//! - Config is passed explicitly to constructors; there are no process-wide defaults
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::TransportConfig;
pub use schema::ListenerConfig;
pub use schema::FanInConfig;
pub use schema::DialConfig;
pub use schema::TlsSettings;
pub use schema::ObservabilityConfig;
