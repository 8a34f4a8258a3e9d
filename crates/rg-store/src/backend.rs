use async_trait::async_trait;
use rg_types::ConnectionError;
use std::collections::HashMap;
use std::sync::Arc;

/// Key/value + pub/sub operations the pipeline needs from the shared store.
#[async_trait]
pub trait StoreBackend: Send + Sync + std::fmt::Debug {
    /// Round-trip liveness probe
    async fn ping(&self) -> Result<(), ConnectionError>;

    async fn get(&self, key: &str) -> Result<Option<String>, ConnectionError>;

    async fn set(&self, key: &str, value: String) -> Result<(), ConnectionError>;

    /// All fields of a hash. Missing keys yield an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, ConnectionError>;

    async fn hset(&self, key: &str, fields: HashMap<String, String>)
        -> Result<(), ConnectionError>;

    /// Publish on a channel, returning the number of subscribers reached.
    async fn publish(&self, channel: &str, message: String) -> Result<usize, ConnectionError>;

    fn name(&self) -> &str;
}

/// Opens new backend sessions for the Connection Manager.
#[async_trait]
pub trait StoreConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> Result<Arc<dyn StoreBackend>, ConnectionError>;
}
