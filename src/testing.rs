//! In-memory broker for tests
//!
//! `MockBroker` is an `AdapterFactory` whose adapters all talk to the same
//! shared state. Tests flip its switches to simulate outages, refused
//! connections and flaky sends, and read its counters to verify what the
//! orchestrator did.
//!
//! # Example
//!
//! ```
//! use tether::testing::MockBroker;
//!
//! let broker = MockBroker::new();
//! broker.set_healthy(false);
//! let connectors = broker.connectors();
//! # let _ = connectors;
//! ```

use crate::adapter::{
    AdapterError, AdapterFactory, BrokerAdapter, ConnectorSet, DeliveryReceipt, Properties,
    ReceivedMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct BrokerState {
    healthy: AtomicBool,
    accept_sends: AtomicBool,
    accept_connections: AtomicBool,
    /// Remaining sends before every send fails; `None` means unlimited
    send_budget: Mutex<Option<u64>>,
    /// How long an accepted send stays in flight
    send_delay: Mutex<Duration>,
    connects: AtomicU64,
    refused: AtomicU64,
    stops: AtomicU64,
    delivered: Mutex<Vec<(String, Properties)>>,
    inbound: Mutex<VecDeque<ReceivedMessage>>,
}

/// Shared handle to a simulated broker
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// A healthy broker that accepts everything
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                healthy: AtomicBool::new(true),
                accept_sends: AtomicBool::new(true),
                accept_connections: AtomicBool::new(true),
                send_budget: Mutex::new(None),
                send_delay: Mutex::new(Duration::ZERO),
                connects: AtomicU64::new(0),
                refused: AtomicU64::new(0),
                stops: AtomicU64::new(0),
                delivered: Mutex::new(Vec::new()),
                inbound: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Connector set using this broker for every adapter kind
    pub fn connectors(&self) -> ConnectorSet {
        ConnectorSet::uniform(Arc::new(self.clone()))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_accept_sends(&self, accept: bool) {
        self.state.accept_sends.store(accept, Ordering::SeqCst);
    }

    pub fn set_accept_connections(&self, accept: bool) {
        self.state.accept_connections.store(accept, Ordering::SeqCst);
    }

    /// Let `budget` more sends through, then fail every send
    pub fn set_send_budget(&self, budget: Option<u64>) {
        *self.state.send_budget.lock() = budget;
    }

    /// Keep every accepted send in flight for `delay` before it lands
    pub fn set_send_delay(&self, delay: Duration) {
        *self.state.send_delay.lock() = delay;
    }

    /// Queue a message for the next `receive`
    pub fn push_inbound(&self, message: ReceivedMessage) {
        self.state.inbound.lock().push_back(message);
    }

    /// Successful adapter constructions
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Refused adapter constructions
    pub fn refused(&self) -> u64 {
        self.state.refused.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u64 {
        self.state.stops.load(Ordering::SeqCst)
    }

    /// Every message delivered so far, in delivery order
    pub fn delivered(&self) -> Vec<Properties> {
        self.state
            .delivered
            .lock()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Messages delivered through connections named `connection`
    pub fn delivered_to(&self, connection: &str) -> Vec<Properties> {
        self.state
            .delivered
            .lock()
            .iter()
            .filter(|(name, _)| name == connection)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.state.delivered.lock().len()
    }
}

#[async_trait]
impl AdapterFactory for MockBroker {
    async fn connect(
        &self,
        name: &str,
        _configuration: &Properties,
    ) -> Result<Arc<dyn BrokerAdapter>, AdapterError> {
        tokio::task::yield_now().await;
        if !self.state.accept_connections.load(Ordering::SeqCst) {
            self.state.refused.fetch_add(1, Ordering::SeqCst);
            return Err(AdapterError::ConnectionRefused(format!("mock://{}", name)));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockAdapter {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            stopped: AtomicBool::new(false),
        }))
    }
}

/// Adapter handed out by `MockBroker`
#[derive(Debug)]
pub struct MockAdapter {
    name: String,
    state: Arc<BrokerState>,
    stopped: AtomicBool,
}

impl MockAdapter {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerAdapter for MockAdapter {
    async fn send(
        &self,
        message: &Properties,
        _config: &Properties,
    ) -> Result<Vec<DeliveryReceipt>, AdapterError> {
        tokio::task::yield_now().await;
        if self.is_stopped() {
            return Err(AdapterError::Transport("adapter stopped".to_string()));
        }
        if !self.state.accept_sends.load(Ordering::SeqCst) {
            return Err(AdapterError::Transport("broker dropped the message".to_string()));
        }
        {
            let mut budget = self.state.send_budget.lock();
            match budget.as_mut() {
                Some(0) => {
                    return Err(AdapterError::Transport("send budget exhausted".to_string()))
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }

        let delay = *self.state.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.state
            .delivered
            .lock()
            .push((self.name.clone(), message.clone()));
        Ok(vec![DeliveryReceipt {
            destination: self.name.clone(),
            details: Properties::new(),
        }])
    }

    async fn receive(&self, _config: &Properties) -> Result<Vec<ReceivedMessage>, AdapterError> {
        if self.is_stopped() {
            return Err(AdapterError::Transport("adapter stopped".to_string()));
        }
        if !self.state.healthy.load(Ordering::SeqCst) {
            return Err(AdapterError::Transport("broker unreachable".to_string()));
        }
        Ok(self.state.inbound.lock().drain(..).collect())
    }

    async fn check_health(&self) -> Result<(), AdapterError> {
        tokio::task::yield_now().await;
        if self.state.healthy.load(Ordering::SeqCst) && !self.is_stopped() {
            Ok(())
        } else {
            Err(AdapterError::Unhealthy(format!("{} is unreachable", self.name)))
        }
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}
