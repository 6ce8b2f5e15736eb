//! Error types for the resilience crate

use thiserror::Error;

/// Errors that can occur while configuring or driving resilience primitives
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// No tokio runtime was available to host background work
    #[error("No tokio runtime available for executor '{0}'")]
    NoRuntime(String),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
