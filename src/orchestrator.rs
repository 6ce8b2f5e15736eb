/*!
 * Broker orchestrator
 *
 * Ties the registry, the delivery log and the reconnection strategy into one
 * protocol:
 *
 * ```text
 * send ──ok──▶ receipt (and flush any backlog in the background)
 *   │
 *   └─fail──▶ append to delivery log ─▶ mark disconnected ─▶ SendError
 *                                            │
 *                     reconnect pool ◀───────┘  (single-flight per name)
 *                           │ healthy adapter installed
 *                           ▼
 *                      resend pool ──▶ replay backlog from the manifest pointer
 * ```
 *
 * Reconnect loops and resends run on two separate bounded executors. A
 * resend that hits a failure hands the reconnect to the reconnect executor
 * and returns; it never waits on it.
 */

use crate::adapter::{AdapterKind, ConnectorSet, DeliveryReceipt, Properties, ReceivedMessage};
use crate::config::{ExecutorConfig, TetherConfig};
use crate::error::{BrokerError, Result};
use crate::reconnect::Reconnector;
use crate::registry::{Connection, Registry};
use dashmap::DashSet;
use std::sync::Arc;
use tether_core_journal::{DeliveryLog, Settled};
use tether_core_resilience::{BackoffConfig, TaskExecutor};
use tracing::{debug, error, info, trace, warn};

/// How a resend run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendOutcome {
    /// Every entry up to the end of the log was replayed
    Drained,
    /// Stopped after sending the requested number of entries
    LimitReached,
    /// A send failed; the connection was marked disconnected
    Failed(String),
    /// The backlog was already empty
    NothingToSend,
    /// The connection is down; the resend will follow its reconnect
    NotConnected,
    /// Another resend for the same connection is running
    AlreadyDraining,
}

/// Result of one resend run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendReport {
    pub sent: u64,
    /// Unreadable entries stepped over
    pub skipped: u64,
    /// Replay pointer after the run
    pub next_offset: u64,
    pub outcome: ResendOutcome,
}

impl ResendReport {
    fn idle(next_offset: u64, outcome: ResendOutcome) -> Self {
        Self {
            sent: 0,
            skipped: 0,
            next_offset,
            outcome,
        }
    }
}

/// Operational view of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub name: String,
    pub kind: AdapterKind,
    pub connected: bool,
    pub reconnecting: bool,
    pub entries: u64,
    pub pointer: u64,
}

impl ConnectionStatus {
    pub fn backlog(&self) -> u64 {
        self.entries.saturating_sub(self.pointer)
    }
}

/// Move the replay pointer, logging instead of failing.
///
/// A pointer left behind only causes entries to be replayed again.
fn record_pointer(log: &DeliveryLog, name: &str, offset: u64) {
    if let Err(e) = log.update_pointer(name, offset) {
        warn!(connection = name, offset, error = %e, "Replay pointer not persisted; entries will be replayed");
    }
}

/// Marks a connection as draining for as long as it lives
struct DrainGuard<'a> {
    draining: &'a DashSet<String>,
    name: String,
}

impl<'a> DrainGuard<'a> {
    fn acquire(draining: &'a DashSet<String>, name: &str) -> Option<Self> {
        draining.insert(name.to_string()).then(|| Self {
            draining,
            name: name.to_string(),
        })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.draining.remove(&self.name);
    }
}

struct Inner {
    registry: Registry,
    delivery_log: Option<DeliveryLog>,
    reconnector: Reconnector,
    reconnect_pool: TaskExecutor,
    resend_pool: TaskExecutor,
    draining: DashSet<String>,
    /// Resends requested while a drain was running
    rerun: DashSet<String>,
}

/// Coordinates sends, failures, reconnects and resends for every connection
#[derive(Clone)]
pub struct BrokerOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BrokerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerOrchestrator")
            .field("connections", &self.inner.registry.len())
            .field("durable", &self.inner.delivery_log.is_some())
            .field("reconnect_pool", &self.inner.reconnect_pool)
            .field("resend_pool", &self.inner.resend_pool)
            .finish()
    }
}

impl BrokerOrchestrator {
    /// Assemble an orchestrator from its parts.
    ///
    /// Without a delivery log the orchestrator runs in best-effort mode:
    /// failed sends are not recorded and cannot be resent. Must be called
    /// from within a tokio runtime.
    pub fn new(
        registry: Registry,
        delivery_log: Option<DeliveryLog>,
        reconnector: Reconnector,
        executor: &ExecutorConfig,
    ) -> Result<Self> {
        let reconnect_pool = TaskExecutor::new("reconnect", executor.reconnect_workers)?;
        let resend_pool = TaskExecutor::new("resend", executor.resend_workers)?;

        if delivery_log.is_none() {
            warn!("Delivery log disabled: failed sends will be dropped after one attempt");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                delivery_log,
                reconnector,
                reconnect_pool,
                resend_pool,
                draining: DashSet::new(),
                rerun: DashSet::new(),
            }),
        })
    }

    /// Build everything from configuration, activate every enabled
    /// connection, and reconcile leftover state from a previous run.
    pub async fn start(config: &TetherConfig, connectors: ConnectorSet) -> Result<Self> {
        config.validate()?;

        let delivery_log = if config.delivery_log.enabled {
            let names = config.enabled_connections().map(|(name, _)| name.as_str());
            Some(DeliveryLog::initialize(&config.delivery_log.location, names)?)
        } else {
            None
        };

        let backoff: BackoffConfig = config.backoff.to_backoff_config();
        let reconnector = Reconnector::new(connectors, backoff);
        let orchestrator = Self::new(Registry::new(), delivery_log, reconnector, &config.executor)?;

        for (name, connection) in config.enabled_connections() {
            // Failures are logged and recovered in the background
            let _ = orchestrator
                .activate(name, connection.kind, connection.properties.clone())
                .await;
        }

        orchestrator.reconcile();
        info!(
            connections = orchestrator.inner.registry.len(),
            durable = orchestrator.is_durable(),
            "Broker orchestrator started"
        );
        Ok(orchestrator)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn delivery_log(&self) -> Option<&DeliveryLog> {
        self.inner.delivery_log.as_ref()
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.inner.reconnector
    }

    /// Whether failed sends are durably recorded
    pub fn is_durable(&self) -> bool {
        self.inner.delivery_log.is_some()
    }

    /// Bring a connection up under `name`.
    ///
    /// On failure the connection is still registered, offline, and a
    /// reconnect is scheduled; the initialization error is returned.
    pub async fn activate(
        &self,
        name: &str,
        kind: AdapterKind,
        configuration: Properties,
    ) -> Result<()> {
        if let Some(log) = &self.inner.delivery_log {
            log.register(name)?;
        }

        let established = self
            .inner
            .reconnector
            .connectors()
            .establish(kind, name, &configuration)
            .await;

        match established {
            Ok(adapter) => {
                let previous = self
                    .inner
                    .registry
                    .add(Connection::new(name, kind, configuration, adapter));
                if let Some(previous) = previous {
                    previous.stop().await;
                }
                info!(connection = name, kind = %kind, "Connection activated");
                Ok(())
            }
            Err(cause) => {
                let failure = BrokerError::ConnectionInitialization {
                    connection: name.to_string(),
                    source: cause,
                };
                if failure.is_connection_refused() {
                    warn!(connection = name, kind = %kind, error = %failure, "Connection refused at activation");
                } else {
                    error!(connection = name, kind = %kind, error = %failure, "Connection activation failed");
                }

                let previous = self
                    .inner
                    .registry
                    .add(Connection::offline(name, kind, configuration));
                if let Some(previous) = previous {
                    previous.stop().await;
                }
                self.schedule_reconnect(name);
                Err(failure)
            }
        }
    }

    /// Remove a connection and stop its adapter. Its delivery log is kept.
    pub async fn remove_connection(&self, name: &str) -> Result<()> {
        self.inner.registry.remove(name).await
    }

    /// Send one message.
    ///
    /// A failed send is recorded in the delivery log (when enabled), the
    /// connection is marked disconnected, a reconnect is scheduled, and a
    /// `Send` error is returned. Sending on a connection that is already
    /// disconnected fails fast and records nothing.
    pub async fn send(
        &self,
        name: &str,
        message: &Properties,
        config: &Properties,
    ) -> Result<Vec<DeliveryReceipt>> {
        let connection = self.inner.registry.get(name)?;

        let adapter = match connection.adapter() {
            Some(adapter) if connection.is_connected() => Arc::clone(adapter),
            _ => {
                return Err(BrokerError::send(
                    name,
                    BrokerError::Disconnected(name.to_string()),
                ))
            }
        };

        let outcome = match adapter.check_health().await {
            Ok(()) => adapter.send(message, config).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(receipts) => {
                if let Some(log) = &self.inner.delivery_log {
                    if log.backlog(name) > 0 {
                        self.schedule_resend(name);
                    }
                }
                Ok(receipts)
            }
            Err(cause) => {
                let recorded = match &self.inner.delivery_log {
                    Some(log) => log.append(name, message, config).map(Some),
                    None => Ok(None),
                };

                if let Err(e) = self.inner.registry.mark_connected(name, false) {
                    debug!(connection = name, error = %e, "Connection gone while handling send failure");
                }
                self.schedule_reconnect(name);

                match recorded {
                    Ok(entries) => {
                        warn!(
                            connection = name,
                            error = %cause,
                            logged_entries = entries,
                            "Send failed, connection marked disconnected"
                        );
                        Err(BrokerError::send(name, BrokerError::Adapter(cause)))
                    }
                    Err(log_error) => {
                        error!(
                            connection = name,
                            error = %cause,
                            log_error = %log_error,
                            "Send failed and the message could not be recorded"
                        );
                        Err(BrokerError::send(name, BrokerError::Logger(log_error)))
                    }
                }
            }
        }
    }

    /// Pull messages. Failures surface immediately and are never retried.
    pub async fn receive(&self, name: &str, config: &Properties) -> Result<Vec<ReceivedMessage>> {
        let connection = self.inner.registry.get(name)?;

        let adapter = match connection.adapter() {
            Some(adapter) if connection.is_connected() => Arc::clone(adapter),
            _ => {
                return Err(BrokerError::receive(
                    name,
                    BrokerError::Disconnected(name.to_string()),
                ))
            }
        };

        adapter
            .receive(config)
            .await
            .map_err(|e| BrokerError::receive(name, BrokerError::Adapter(e)))
    }

    /// Schedule a reconnect followed by a resend, unless one is already in
    /// flight for `name`. Returns whether a new reconnect was scheduled.
    pub fn schedule_reconnect(&self, name: &str) -> bool {
        match self.inner.registry.try_begin_reconnect(name) {
            Ok(true) => {}
            Ok(false) => {
                debug!(connection = name, "Reconnect already in progress");
                return false;
            }
            Err(e) => {
                debug!(connection = name, error = %e, "Cannot reconnect");
                return false;
            }
        }

        let this = self.clone();
        let owned = name.to_string();
        let spawned = self
            .inner
            .reconnect_pool
            .spawn(format!("reconnect:{}", name), async move {
                this.reconnect_then_resend(&owned).await
            });

        if spawned {
            info!(connection = name, "Reconnect scheduled");
        } else {
            let _ = self.inner.registry.mark_reconnecting(name, false);
        }
        spawned
    }

    /// Schedule a full backlog resend on the resend pool
    pub fn schedule_resend(&self, name: &str) -> bool {
        if self.inner.delivery_log.is_none() {
            return false;
        }

        let this = self.clone();
        let owned = name.to_string();
        self.inner
            .resend_pool
            .spawn(format!("resend:{}", name), async move {
                this.resend(&owned, 0).await.map(|_| ())
            })
    }

    async fn reconnect_then_resend(&self, name: &str) -> Result<()> {
        let registry = &self.inner.registry;
        let adapter = self
            .inner
            .reconnector
            .reconnect_with_backoff(registry, name)
            .await?;
        registry.replace(name, adapter).await?;
        info!(connection = name, "Connection restored");

        if let Some(log) = &self.inner.delivery_log {
            if log.entry_count(name) > 0 {
                self.schedule_resend(name);
            }
        }
        Ok(())
    }

    /// Replay a connection's backlog in log order.
    ///
    /// `limit` caps how many entries are sent; zero means drain everything.
    /// A fully drained log is reset. A run stopped by the limit only moves
    /// the replay pointer. A run stopped by a failed send moves the pointer,
    /// marks the connection disconnected and schedules a reconnect. Failing
    /// to persist the pointer is logged and does not stop those steps; the
    /// entries are replayed again later.
    ///
    /// Only one resend runs per connection. A request that finds one running
    /// is handed to it, and a full drain follows once it finishes.
    pub async fn resend(&self, name: &str, limit: u64) -> Result<ResendReport> {
        let log = self
            .inner
            .delivery_log
            .as_ref()
            .ok_or(BrokerError::ResendDisabled)?;
        self.inner.registry.get(name)?;

        let guard = match DrainGuard::acquire(&self.inner.draining, name) {
            Some(guard) => guard,
            None => {
                self.inner.rerun.insert(name.to_string());
                // The running drain may have finished before it could see the request
                match DrainGuard::acquire(&self.inner.draining, name) {
                    Some(guard) => {
                        self.inner.rerun.remove(name);
                        guard
                    }
                    None => {
                        debug!(connection = name, "Resend handed to the running drain");
                        return Ok(ResendReport::idle(
                            log.pointer(name),
                            ResendOutcome::AlreadyDraining,
                        ));
                    }
                }
            }
        };

        let drained = self.drain_backlog(log, name, limit).await;
        drop(guard);

        let requested = self.inner.rerun.remove(name).is_some();
        let (report, remaining) = drained?;
        if remaining || requested {
            debug!(connection = name, remaining, requested, "Scheduling follow-up resend");
            self.schedule_resend(name);
        }
        Ok(report)
    }

    /// One pass over the backlog. Must hold the connection's drain guard.
    ///
    /// Also returns whether entries appended during the pass are still waiting.
    async fn drain_backlog(
        &self,
        log: &DeliveryLog,
        name: &str,
        limit: u64,
    ) -> Result<(ResendReport, bool)> {
        let connection = self.inner.registry.get(name)?;
        let adapter = match connection.adapter() {
            Some(adapter) if connection.is_connected() => Arc::clone(adapter),
            _ => {
                debug!(connection = name, "Resend skipped, connection is down");
                let report = ResendReport::idle(log.pointer(name), ResendOutcome::NotConnected);
                return Ok((report, false));
            }
        };

        let start = log.pointer(name);
        if start >= log.entry_count(name) {
            let report = ResendReport::idle(start, ResendOutcome::NothingToSend);
            return Ok((report, false));
        }

        let stream = log.stream_from(name, start)?;
        let end = stream.end();
        let mut cursor = start;
        let mut sent = 0u64;
        let mut skipped = 0u64;
        let mut failure = None;

        debug!(connection = name, from = start, to = end, limit, "Resending backlog");

        for item in stream {
            match item {
                Ok(entry) => match adapter.send(&entry.message, &entry.send_config).await {
                    Ok(_) => {
                        trace!(connection = name, offset = cursor, "Replayed entry");
                        cursor += 1;
                        sent += 1;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
                Err(e) => {
                    error!(connection = name, offset = cursor, error = %e, "Skipping unreadable delivery log entry");
                    cursor += 1;
                    skipped += 1;
                }
            }
            if limit > 0 && sent >= limit {
                break;
            }
        }

        let mut remaining = false;
        let outcome = if let Some(cause) = failure {
            record_pointer(log, name, cursor);
            if let Err(e) = self.inner.registry.mark_connected(name, false) {
                debug!(connection = name, error = %e, "Connection gone while handling resend failure");
            }
            warn!(
                connection = name,
                offset = cursor,
                sent,
                error = %cause,
                "Resend interrupted, connection marked disconnected"
            );
            self.schedule_reconnect(name);
            ResendOutcome::Failed(cause.to_string())
        } else if cursor >= end {
            match log.settle(name, cursor) {
                Ok(Settled::Reset) => {
                    info!(connection = name, sent, skipped, "Backlog drained");
                }
                Ok(Settled::Advanced { remaining: left }) => {
                    info!(connection = name, sent, skipped, remaining = left, "Backlog drained up to new failures");
                    remaining = true;
                }
                Err(e) => {
                    error!(connection = name, offset = cursor, error = %e, "Failed to settle drained backlog; entries will be replayed");
                }
            }
            ResendOutcome::Drained
        } else {
            record_pointer(log, name, cursor);
            debug!(connection = name, sent, offset = cursor, "Resend limit reached");
            ResendOutcome::LimitReached
        };

        let report = ResendReport {
            sent,
            skipped,
            next_offset: log.pointer(name),
            outcome,
        };
        Ok((report, remaining))
    }

    /// Schedule recovery work left over from a previous run: a reconnect for
    /// every disconnected connection and a resend for every connected one
    /// with logged entries.
    pub fn reconcile(&self) {
        for connection in self.inner.registry.snapshot() {
            let name = connection.name();
            if !connection.is_connected() {
                self.schedule_reconnect(name);
            } else if let Some(log) = &self.inner.delivery_log {
                if log.entry_count(name) > 0 {
                    self.schedule_resend(name);
                }
            }
        }

        if let Some(log) = &self.inner.delivery_log {
            for name in log.connections() {
                if !self.inner.registry.exists(&name) && log.backlog(&name) > 0 {
                    warn!(
                        connection = %name,
                        backlog = log.backlog(&name),
                        "Delivery log holds messages for a connection that is not configured"
                    );
                }
            }
        }
    }

    /// Status of every registered connection, in name order
    pub fn list_connections(&self) -> Vec<ConnectionStatus> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|connection| {
                let name = connection.name();
                let (entries, pointer) = match &self.inner.delivery_log {
                    Some(log) => (log.entry_count(name), log.pointer(name)),
                    None => (0, 0),
                };
                ConnectionStatus {
                    name: name.to_string(),
                    kind: connection.kind(),
                    connected: connection.is_connected(),
                    reconnecting: connection.is_reconnecting(),
                    entries,
                    pointer,
                }
            })
            .collect()
    }

    /// Resend up to `count` backlog entries now (zero means all)
    pub async fn force_resend(&self, name: &str, count: u64) -> Result<ResendReport> {
        if self.inner.delivery_log.is_none() {
            return Err(BrokerError::ResendDisabled);
        }
        self.resend(name, count).await
    }

    /// Drop the current adapter's standing and rebuild the connection.
    ///
    /// Returns `false` if a reconnect was already in flight.
    pub fn force_reconnect(&self, name: &str) -> Result<bool> {
        self.inner.registry.mark_connected(name, false)?;
        Ok(self.schedule_reconnect(name))
    }

    pub fn set_connected(&self, name: &str, connected: bool) -> Result<()> {
        self.inner.registry.mark_connected(name, connected)
    }

    pub fn set_reconnecting(&self, name: &str, reconnecting: bool) -> Result<()> {
        self.inner.registry.mark_reconnecting(name, reconnecting)
    }

    /// Wait until no reconnect or resend work is pending.
    ///
    /// Never returns while a reconnect loop keeps failing.
    pub async fn wait_idle(&self) {
        loop {
            self.inner.reconnect_pool.wait_idle().await;
            self.inner.resend_pool.wait_idle().await;
            if self.inner.reconnect_pool.active_tasks() == 0
                && self.inner.resend_pool.active_tasks() == 0
            {
                break;
            }
        }
    }

    /// Cancel background work and stop every connection
    pub async fn shutdown(&self) {
        self.inner.reconnect_pool.shutdown().await;
        self.inner.resend_pool.shutdown().await;
        self.inner.registry.close_all().await;
        info!("Broker orchestrator shut down");
    }
}
