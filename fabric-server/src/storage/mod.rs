//! Storage adapter interface (component A): a uniform async key/value contract over
//! opaque collections, with schema validation on write and a local fire-and-forget
//! event bus. `redis` implements this over a namespaced Redis connection; `fake`
//! implements it in memory for tests.

pub mod fake;
pub mod redis_adapter;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use fabric_common::error::FabricResult;

/// A single in-process notification. Distinct from the cross-connection `remote`
/// broadcast the channel broker fans out -- this is the adapter's own local bus, and
/// conflating the two would let a local caller observe another tenant's events.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    Get { collection: String, key: String },
    Set { collection: String, key: String },
    Delete { collection: String, key: String },
    Clear { collection: Option<String>, count: u64 },
    Error { message: String },
    Connected,
    Disconnected,
    Remote { kind: RemoteKind, collection: String, key: Option<String>, value: Option<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Set,
    Delete,
    Clear,
}

/// A schema check for one (collection, key) pair. Returns `true` if `value` is valid.
pub type SchemaCheck = std::sync::Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> FabricResult<Option<Value>>;
    async fn has(&self, collection: &str, key: &str) -> FabricResult<bool>;
    async fn set(&self, collection: &str, key: &str, value: Value) -> FabricResult<()>;
    async fn delete(&self, collection: &str, key: &str) -> FabricResult<bool>;
    async fn clear(&self, collection: Option<&str>) -> FabricResult<u64>;
    async fn size(&self, collection: Option<&str>) -> FabricResult<u64>;
    async fn keys(&self, collection: &str) -> FabricResult<Vec<String>>;
    async fn close(&self);

    /// Subscribes to this adapter's local event bus.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;

    /// Registers a validation schema for a (collection, key) pair. `set` must reject
    /// (without writing) any value that fails it; `get` surfaces a mismatch as an error.
    fn register_schema(&self, collection: &str, key: &str, check: SchemaCheck);
}
