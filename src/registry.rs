/*!
 * Connection registry
 *
 * Owns every named connection. Lookups and updates go through a sharded
 * concurrent map, so there is no single global lock. The `connected` and
 * `reconnecting` flags live in a shared cell that survives adapter
 * replacement, and are only ever changed through the registry.
 */

use crate::adapter::{AdapterKind, BrokerAdapter, Properties};
use crate::error::{BrokerError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ConnectionFlags {
    connected: AtomicBool,
    reconnecting: AtomicBool,
}

/// A named connection and its current adapter
pub struct Connection {
    name: String,
    kind: AdapterKind,
    configuration: Properties,
    adapter: Option<Arc<dyn BrokerAdapter>>,
    flags: Arc<ConnectionFlags>,
}

impl Connection {
    /// A live connection; starts out connected
    pub fn new(
        name: impl Into<String>,
        kind: AdapterKind,
        configuration: Properties,
        adapter: Arc<dyn BrokerAdapter>,
    ) -> Self {
        let flags = Arc::new(ConnectionFlags::default());
        flags.connected.store(true, Ordering::SeqCst);
        Self {
            name: name.into(),
            kind,
            configuration,
            adapter: Some(adapter),
            flags,
        }
    }

    /// A connection whose first activation failed; recovered by reconnecting
    pub fn offline(name: impl Into<String>, kind: AdapterKind, configuration: Properties) -> Self {
        Self {
            name: name.into(),
            kind,
            configuration,
            adapter: None,
            flags: Arc::new(ConnectionFlags::default()),
        }
    }

    fn with_adapter(&self, adapter: Arc<dyn BrokerAdapter>) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            configuration: self.configuration.clone(),
            adapter: Some(adapter),
            flags: Arc::clone(&self.flags),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn configuration(&self) -> &Properties {
        &self.configuration
    }

    pub fn adapter(&self) -> Option<&Arc<dyn BrokerAdapter>> {
        self.adapter.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.flags.reconnecting.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("has_adapter", &self.adapter.is_some())
            .field("connected", &self.is_connected())
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}

/// Concurrent map of named connections
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<String, Arc<Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a connection.
    ///
    /// A replaced connection hands its flags to the new one, so a reconnect
    /// already in flight keeps its claim. Returns the previous adapter, if
    /// any. Stopping it is up to the caller.
    pub fn add(&self, mut connection: Connection) -> Option<Arc<dyn BrokerAdapter>> {
        let name = connection.name.clone();
        let previous = match self.connections.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                let connected = connection.is_connected();
                connection.flags = Arc::clone(&entry.get().flags);
                connection.flags.connected.store(connected, Ordering::SeqCst);
                Some(entry.insert(Arc::new(connection)))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(connection));
                None
            }
        };
        debug!(connection = %name, replaced = previous.is_some(), "Connection registered");
        previous.and_then(|conn| conn.adapter.clone())
    }

    /// Look up a connection by name
    pub fn get(&self, name: &str) -> Result<Arc<Connection>> {
        self.connections
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::ConnectionUnknown(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Install a freshly reconnected adapter under an existing name.
    ///
    /// The swap happens under the map's shard lock. Still under it, the
    /// connection is marked connected and then its reconnect claim is
    /// released, so no reader sees it both disconnected and unclaimed. The
    /// old adapter is stopped afterwards, outside the lock. If the name was
    /// removed in the meantime the new adapter is stopped instead.
    pub async fn replace(&self, name: &str, adapter: Arc<dyn BrokerAdapter>) -> Result<()> {
        let previous = self.connections.get_mut(name).map(|mut entry| {
            let next = Arc::new(entry.value().with_adapter(Arc::clone(&adapter)));
            let previous = std::mem::replace(entry.value_mut(), next);
            previous.flags.connected.store(true, Ordering::SeqCst);
            previous.flags.reconnecting.store(false, Ordering::SeqCst);
            previous
        });

        let Some(previous) = previous else {
            adapter.stop().await;
            return Err(BrokerError::ConnectionUnknown(name.to_string()));
        };

        if let Some(old) = previous.adapter.as_ref() {
            old.stop().await;
        }
        debug!(connection = name, "Adapter replaced");
        Ok(())
    }

    /// Remove a connection and stop its adapter
    pub async fn remove(&self, name: &str) -> Result<()> {
        let (_, connection) = self
            .connections
            .remove(name)
            .ok_or_else(|| BrokerError::ConnectionUnknown(name.to_string()))?;

        connection.flags.connected.store(false, Ordering::SeqCst);
        if let Some(adapter) = connection.adapter.as_ref() {
            adapter.stop().await;
        }
        info!(connection = name, "Connection removed");
        Ok(())
    }

    pub fn mark_connected(&self, name: &str, connected: bool) -> Result<()> {
        self.get(name)?
            .flags
            .connected
            .store(connected, Ordering::SeqCst);
        Ok(())
    }

    pub fn mark_reconnecting(&self, name: &str, reconnecting: bool) -> Result<()> {
        self.get(name)?
            .flags
            .reconnecting
            .store(reconnecting, Ordering::SeqCst);
        Ok(())
    }

    /// Atomically claim the right to reconnect `name`.
    ///
    /// Returns `false` if a reconnect is already in progress.
    pub fn try_begin_reconnect(&self, name: &str) -> Result<bool> {
        Ok(self
            .get(name)?
            .flags
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Point-in-time view of every connection, sorted by name
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        connections.sort_by(|a, b| a.name.cmp(&b.name));
        connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Stop every adapter and empty the registry
    pub async fn close_all(&self) {
        let names = self.names();
        let mut stopped = 0usize;
        for name in names {
            if let Some((_, connection)) = self.connections.remove(&name) {
                connection.flags.connected.store(false, Ordering::SeqCst);
                if let Some(adapter) = connection.adapter.as_ref() {
                    adapter.stop().await;
                    stopped += 1;
                }
            }
        }
        info!(stopped, "All connections closed");
    }
}
