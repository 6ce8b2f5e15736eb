//! Tether Core Resilience: pure-logic reconnection primitives
//!
//! # Overview
//!
//! This crate provides the building blocks Tether uses to recover broker
//! connections after transient outages:
//!
//! - **Reconnect Backoff**: exponential delay schedule, capped, with random jitter
//! - **Task Executor**: named, bounded pool for background reconnect and resend work
//!
//! # Key Principles
//!
//! This crate has zero knowledge of:
//! - Broker technologies or wire protocols
//! - The delivery log or its on-disk format
//! - Connection naming or registries
//!
//! # Architecture
//!
//! ```text
//!   foreground send fails
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Task Executor ("reconnect")       │  ← bounded, cancellable
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Reconnect Backoff                 │  ← 1s, 2s, 4s, 8s, 16s, 16s ...
//! │  (delay = base * 2^min(n, cap) + jitter)│
//! └─────────────┬───────────────────────────┘
//!               │ connected
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Task Executor ("resend")          │  ← backlog replay
//! └─────────────────────────────────────────┘
//! ```

pub mod backoff;
pub mod error;
pub mod executor;

// Re-export main types for convenience
pub use backoff::{BackoffConfig, ReconnectBackoff};
pub use error::ResilienceError;
pub use executor::TaskExecutor;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tether_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{BackoffConfig, ReconnectBackoff};
    pub use super::error::ResilienceError;
    pub use super::executor::TaskExecutor;
}
