//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) [+ backends JSON file]
//!     → loader.rs (parse & deserialize, merge backends file)
//!     → validation.rs (semantic checks)
//!     → BalancerConfig (validated, immutable)
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → startup reconciles the registry and swaps the strategy
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use validation::{validate_backend, validate_config, ValidationError};
pub use schema::{
    AdminConfig, BackendConfig, BalancerConfig, CircuitBreakerConfig, DispatchConfig, FrontendMode,
    HealthCheckConfig, ListenerConfig, LogFormat, ObservabilityConfig, ProbeKind,
};
