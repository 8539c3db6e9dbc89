//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → KitConfig (validated, immutable)
//!     → section.settings() → middleware / server / app builders
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::KitConfig;
pub use schema::{
    AppConfig, CircuitBreakerConfig, HttpConfig, LogFormat, LoggingConfig, ObservabilityConfig,
    RateLimitConfig, RecoveryConfig,
};
