/*!
 * Broker adapter contract
 *
 * Every broker technology plugs in through two traits: `AdapterFactory`
 * builds a live `BrokerAdapter` from a connection's opaque configuration, and
 * the adapter performs the actual I/O. The core never looks inside the
 * configuration beyond the `type` and `enabled` keys.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Ordered key/value map used for messages, send options and connection configuration
pub type Properties = Map<String, Value>;

/// Broker technology behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Kafka,
    Amqp,
    Mqtt,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 3] = [AdapterKind::Kafka, AdapterKind::Amqp, AdapterKind::Mqtt];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Kafka => "kafka",
            AdapterKind::Amqp => "amqp",
            AdapterKind::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kafka" => Ok(AdapterKind::Kafka),
            "amqp" => Ok(AdapterKind::Amqp),
            "mqtt" => Ok(AdapterKind::Mqtt),
            other => Err(AdapterError::InvalidConfiguration(format!(
                "unknown connection type '{}'",
                other
            ))),
        }
    }
}

/// Broker acknowledgement for one delivered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Topic, queue or subject the message landed on
    pub destination: String,
    #[serde(default)]
    pub details: Properties,
}

/// A message pulled from a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub source: String,
    pub payload: Properties,
    #[serde(default)]
    pub headers: Properties,
}

/// Failure reported by a broker adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Broker endpoint actively refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Network or protocol failure after connecting
    #[error("Transport error: {0}")]
    Transport(String),

    /// Broker accepted the connection but rejected the message
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    /// Health check failed
    #[error("Health check failed: {0}")]
    Unhealthy(String),

    /// Configuration cannot produce an adapter
    #[error("Invalid adapter configuration: {0}")]
    InvalidConfiguration(String),
}

impl AdapterError {
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, AdapterError::ConnectionRefused(_))
    }
}

/// Live connection to one broker
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Publish one message
    async fn send(
        &self,
        message: &Properties,
        config: &Properties,
    ) -> Result<Vec<DeliveryReceipt>, AdapterError>;

    /// Pull whatever messages are available
    async fn receive(&self, config: &Properties) -> Result<Vec<ReceivedMessage>, AdapterError>;

    /// Cheap liveness probe run before every foreground send
    async fn check_health(&self) -> Result<(), AdapterError>;

    /// Release broker resources. Must not fail; called at most once per adapter
    /// by the registry, but implementations should tolerate repeated calls.
    async fn stop(&self);
}

/// Builds adapters for one broker technology
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        configuration: &Properties,
    ) -> Result<Arc<dyn BrokerAdapter>, AdapterError>;
}

/// One adapter constructor per broker technology
#[derive(Clone, Default)]
pub struct ConnectorSet {
    kafka: Option<Arc<dyn AdapterFactory>>,
    amqp: Option<Arc<dyn AdapterFactory>>,
    mqtt: Option<Arc<dyn AdapterFactory>>,
}

impl fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorSet")
            .field("kafka", &self.kafka.is_some())
            .field("amqp", &self.amqp.is_some())
            .field("mqtt", &self.mqtt.is_some())
            .finish()
    }
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the constructor for one broker technology
    pub fn with(mut self, kind: AdapterKind, factory: Arc<dyn AdapterFactory>) -> Self {
        *self.slot_mut(kind) = Some(factory);
        self
    }

    /// Use the same constructor for every broker technology
    pub fn uniform(factory: Arc<dyn AdapterFactory>) -> Self {
        AdapterKind::ALL
            .into_iter()
            .fold(Self::new(), |set, kind| set.with(kind, Arc::clone(&factory)))
    }

    pub fn supports(&self, kind: AdapterKind) -> bool {
        self.slot(kind).is_some()
    }

    fn slot(&self, kind: AdapterKind) -> Option<&Arc<dyn AdapterFactory>> {
        match kind {
            AdapterKind::Kafka => self.kafka.as_ref(),
            AdapterKind::Amqp => self.amqp.as_ref(),
            AdapterKind::Mqtt => self.mqtt.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: AdapterKind) -> &mut Option<Arc<dyn AdapterFactory>> {
        match kind {
            AdapterKind::Kafka => &mut self.kafka,
            AdapterKind::Amqp => &mut self.amqp,
            AdapterKind::Mqtt => &mut self.mqtt,
        }
    }

    /// Construct an adapter and confirm it is healthy.
    ///
    /// An adapter that connects but fails its health check is stopped before
    /// the error is returned.
    pub async fn establish(
        &self,
        kind: AdapterKind,
        name: &str,
        configuration: &Properties,
    ) -> Result<Arc<dyn BrokerAdapter>, AdapterError> {
        let factory = self.slot(kind).ok_or_else(|| {
            AdapterError::InvalidConfiguration(format!("no connector registered for {}", kind))
        })?;

        let adapter = factory.connect(name, configuration).await?;
        if let Err(e) = adapter.check_health().await {
            adapter.stop().await;
            return Err(e);
        }
        Ok(adapter)
    }
}
