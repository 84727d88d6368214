//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against a backend:
//!     → timeouts.rs (per-attempt timeout clipped to the request deadline)
//!     → On failure: retries.rs (budget check, backoff, pick another backend)
//!     → circuit_breaker.rs (track failures, open circuit if threshold exceeded)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every attempt has a deadline
//! - Circuit breakers gate selection on a fast time-scale, independent of
//!   the health prober
//! - Retry budget prevents retry storms under load

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;
