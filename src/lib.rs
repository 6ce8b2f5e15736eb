/*!
 * Tether - durable named broker connections
 *
 * A reliability layer between application code and message brokers:
 * - One uniform "named connection" abstraction over Kafka, AMQP and MQTT adapters
 * - At-least-once delivery across transient broker outages
 * - Failed sends recorded in an append-only, per-connection delivery log
 * - Single-flight reconnection with capped exponential backoff and jitter
 * - Ordered backlog replay once a connection is healthy again
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod adapter;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod reconnect;
pub mod registry;
pub mod testing;

// Re-export commonly used types
pub use adapter::{
    AdapterError, AdapterFactory, AdapterKind, BrokerAdapter, ConnectorSet, DeliveryReceipt,
    Properties, ReceivedMessage,
};
pub use config::{ConnectionConfig, TetherConfig};
pub use error::{BrokerError, Result};
pub use orchestrator::{BrokerOrchestrator, ConnectionStatus, ResendOutcome, ResendReport};
pub use reconnect::Reconnector;
pub use registry::{Connection, Registry};
pub use tether_core_journal::{DeliveryLog, DeliveryLogEntry};
pub use tether_core_resilience::BackoffConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
