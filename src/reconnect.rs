/*!
 * Reconnection strategy
 *
 * Rebuilds a broken connection from its `(kind, configuration)` pair and
 * keeps trying, with capped exponential backoff, until a fresh adapter passes
 * its health check. The loop has no attempt limit; it ends on success, when
 * the connection is removed from the registry, or when the executor running
 * it is shut down.
 */

use crate::adapter::{BrokerAdapter, ConnectorSet};
use crate::error::{BrokerError, Result};
use crate::registry::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core_resilience::{BackoffConfig, ReconnectBackoff};
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct Reconnector {
    connectors: ConnectorSet,
    backoff: BackoffConfig,
    invocations: AtomicU64,
    attempts: AtomicU64,
}

impl Reconnector {
    pub fn new(connectors: ConnectorSet, backoff: BackoffConfig) -> Self {
        Self {
            connectors,
            backoff,
            invocations: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn connectors(&self) -> &ConnectorSet {
        &self.connectors
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// Number of reconnect loops started
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of individual connect attempts across all loops
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Produce a healthy replacement adapter for `name`.
    ///
    /// Marks the connection as reconnecting for the whole loop. The flag stays
    /// set after the new adapter is returned; `Registry::replace` clears it
    /// when the adapter is installed.
    pub async fn reconnect_with_backoff(
        &self,
        registry: &Registry,
        name: &str,
    ) -> Result<Arc<dyn BrokerAdapter>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        registry.mark_reconnecting(name, true)?;

        let mut backoff = ReconnectBackoff::new(self.backoff.clone());
        loop {
            // Re-read each round: stops once the connection has been removed
            let connection = registry.get(name)?;
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            match self
                .connectors
                .establish(connection.kind(), name, connection.configuration())
                .await
            {
                Ok(adapter) => {
                    info!(
                        connection = name,
                        attempts = backoff.attempts() + 1,
                        "Connection re-established"
                    );
                    return Ok(adapter);
                }
                Err(cause) => {
                    let delay = backoff.next_delay();
                    let failure = BrokerError::ConnectionRecovery {
                        connection: name.to_string(),
                        source: cause,
                    };
                    if failure.is_connection_refused() {
                        warn!(
                            connection = name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Reconnect attempt refused, retrying"
                        );
                    } else {
                        error!(
                            connection = name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Reconnect attempt failed, retrying"
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterKind, Properties};
    use crate::registry::Connection;
    use crate::testing::MockBroker;
    use std::time::Duration;
    use tokio::time::Instant;

    fn registry_with_offline(name: &str) -> Registry {
        let registry = Registry::new();
        registry.add(Connection::offline(name, AdapterKind::Kafka, Properties::new()));
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_immediately_when_broker_is_up() {
        let broker = MockBroker::new();
        let reconnector = Reconnector::new(broker.connectors(), BackoffConfig::default());
        let registry = registry_with_offline("q1");

        let start = Instant::now();
        let adapter = reconnector
            .reconnect_with_backoff(&registry, "q1")
            .await
            .unwrap();

        assert!(adapter.check_health().await.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(reconnector.invocations(), 1);
        assert_eq!(reconnector.attempts(), 1);

        // Still claimed until the adapter is installed
        let conn = registry.get("q1").unwrap();
        assert!(conn.is_reconnecting());
        assert!(!conn.is_connected());

        registry.replace("q1", adapter).await.unwrap();
        let conn = registry.get("q1").unwrap();
        assert!(conn.is_connected());
        assert!(!conn.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_until_broker_recovers() {
        let broker = MockBroker::new();
        broker.set_accept_connections(false);
        let backoff = BackoffConfig::without_jitter(Duration::from_secs(1), 4);
        let reconnector = Arc::new(Reconnector::new(broker.connectors(), backoff));
        let registry = Arc::new(registry_with_offline("q1"));

        let task = {
            let reconnector = Arc::clone(&reconnector);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { reconnector.reconnect_with_backoff(&registry, "q1").await })
        };

        // Delays 1s + 2s + 4s: the fourth attempt lands at t = 7s
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert!(registry.get("q1").unwrap().is_reconnecting());
        assert_eq!(broker.refused(), 3);

        broker.set_accept_connections(true);
        let adapter = task.await.unwrap().unwrap();
        assert!(adapter.check_health().await.is_ok());
        assert_eq!(reconnector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_candidates_are_stopped() {
        let broker = MockBroker::new();
        broker.set_healthy(false);
        let backoff = BackoffConfig::without_jitter(Duration::from_millis(10), 2);
        let reconnector = Arc::new(Reconnector::new(broker.connectors(), backoff));
        let registry = Arc::new(registry_with_offline("q1"));

        let task = {
            let reconnector = Arc::clone(&reconnector);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { reconnector.reconnect_with_backoff(&registry, "q1").await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        broker.set_healthy(true);
        task.await.unwrap().unwrap();

        // Every rejected candidate was stopped; the winner is still running
        assert_eq!(broker.stops(), broker.connects() - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_connection_is_removed() {
        let broker = MockBroker::new();
        broker.set_accept_connections(false);
        let reconnector = Arc::new(Reconnector::new(broker.connectors(), BackoffConfig::default()));
        let registry = Arc::new(registry_with_offline("q1"));

        let task = {
            let reconnector = Arc::clone(&reconnector);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { reconnector.reconnect_with_backoff(&registry, "q1").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.remove("q1").await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(BrokerError::ConnectionUnknown(_))));
    }
}
