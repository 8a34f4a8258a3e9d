//! Process-local store backend.
//!
//! Behaves like the shared key/value store for a single process: string
//! keys, hashes and broadcast channels. Availability can be toggled to
//! simulate an outage.

use async_trait::async_trait;
use dashmap::DashMap;
use rg_types::ConnectionError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{StoreBackend, StoreConnector};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct InMemoryStore {
    strings: DashMap<String, String>,
    hashes: DashMap<String, HashMap<String, String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
    reads: AtomicU64,
    connects: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
            hashes: DashMap::new(),
            channels: DashMap::new(),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_available(&self, available: bool) {
        debug!(available, "In-memory store availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of `get` / `hgetall` calls served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Seed a hash without going through a connection.
    pub fn put_hash<K, V>(&self, key: &str, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: ToString,
    {
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.into(), value.to_string());
        }
    }

    /// Seed a string key without going through a connection.
    pub fn put_string(&self, key: &str, value: impl Into<String>) {
        self.strings.insert(key.to_string(), value.into());
    }

    pub fn string_value(&self, key: &str) -> Option<String> {
        self.strings.get(key).map(|v| v.clone())
    }

    pub fn hash_value(&self, key: &str) -> Option<HashMap<String, String>> {
        self.hashes.get(key).map(|v| v.clone())
    }

    fn ensure_available(&self, operation: &str) -> Result<(), ConnectionError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ConnectionError::OperationFailed {
                operation: operation.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn ping(&self) -> Result<(), ConnectionError> {
        self.ensure_available("PING")
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ConnectionError> {
        self.ensure_available("GET")?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.string_value(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), ConnectionError> {
        self.ensure_available("SET")?;
        self.strings.insert(key.to_string(), value);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, ConnectionError> {
        self.ensure_available("HGETALL")?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.hash_value(key).unwrap_or_default())
    }

    async fn hset(
        &self,
        key: &str,
        fields: HashMap<String, String>,
    ) -> Result<(), ConnectionError> {
        self.ensure_available("HSET")?;
        self.hashes.entry(key.to_string()).or_default().extend(fields);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize, ConnectionError> {
        self.ensure_available("PUBLISH")?;
        let delivered = match self.channels.get(channel) {
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        };
        Ok(delivered)
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// Connector handing out sessions on one shared [`InMemoryStore`].
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    store: Arc<InMemoryStore>,
}

impl InMemoryConnector {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }
}

#[async_trait]
impl StoreConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn StoreBackend>, ConnectionError> {
        if !self.store.is_available() {
            return Err(ConnectionError::Unreachable {
                message: "in-memory store offline".to_string(),
            });
        }
        self.store.connects.fetch_add(1, Ordering::Relaxed);
        Ok(self.store.clone() as Arc<dyn StoreBackend>)
    }
}
