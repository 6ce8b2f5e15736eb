/*!
 * Error types for Tether
 */

use crate::adapter::AdapterError;
use tether_core_journal::JournalError;
use tether_core_resilience::ResilienceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// No connection is registered under this name
    #[error("Unknown connection: {0}")]
    ConnectionUnknown(String),

    /// Operation attempted while the connection is down
    #[error("Connection {0} is disconnected")]
    Disconnected(String),

    /// Send failed; the cause has already been recorded when durable logging is on
    #[error("Send on connection {connection} failed: {source}")]
    Send {
        connection: String,
        source: Box<BrokerError>,
    },

    /// Receive failed; never logged or retried
    #[error("Receive on connection {connection} failed: {source}")]
    Receive {
        connection: String,
        source: Box<BrokerError>,
    },

    /// Adapter could not be constructed or failed its first health check
    #[error("Failed to initialize connection {connection}: {source}")]
    ConnectionInitialization {
        connection: String,
        source: AdapterError,
    },

    /// A reconnect attempt failed
    #[error("Failed to recover connection {connection}: {source}")]
    ConnectionRecovery {
        connection: String,
        source: AdapterError,
    },

    /// Resend requested while the delivery log is disabled
    #[error("Resend is unavailable: the delivery log is disabled")]
    ResendDisabled,

    /// Delivery log I/O or content error
    #[error("Delivery log error: {0}")]
    Logger(#[from] JournalError),

    /// Adapter operation failed
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Background executor could not be created or used
    #[error("Executor error: {0}")]
    Executor(#[from] ResilienceError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    pub(crate) fn send(connection: &str, cause: BrokerError) -> Self {
        BrokerError::Send {
            connection: connection.to_string(),
            source: Box::new(cause),
        }
    }

    pub(crate) fn receive(connection: &str, cause: BrokerError) -> Self {
        BrokerError::Receive {
            connection: connection.to_string(),
            source: Box::new(cause),
        }
    }

    /// Whether the root cause is a plain refused connection.
    ///
    /// Refusals are expected while a broker is down, so they are reported at
    /// warning level rather than as errors.
    pub fn is_connection_refused(&self) -> bool {
        match self {
            BrokerError::Send { source, .. } | BrokerError::Receive { source, .. } => {
                source.is_connection_refused()
            }
            BrokerError::ConnectionInitialization { source, .. }
            | BrokerError::ConnectionRecovery { source, .. }
            | BrokerError::Adapter(source) => source.is_connection_refused(),
            _ => false,
        }
    }

    /// Check if the error reports a connection that is down rather than a bad request
    pub fn is_disconnected(&self) -> bool {
        match self {
            BrokerError::Disconnected(_) => true,
            BrokerError::Send { source, .. } | BrokerError::Receive { source, .. } => {
                source.is_disconnected()
            }
            _ => false,
        }
    }
}
