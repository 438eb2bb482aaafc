//! In-memory fake implementing the same [`StorageAdapter`] contract as the Redis
//! adapter, so the dispatcher, bucket manager and channel broker can be exercised in
//! tests without a live Redis instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use fabric_common::error::{FabricError, FabricResult};

use super::{SchemaCheck, StorageAdapter, StorageEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Store {
    data: HashMap<(String, String), Value>,
}

pub struct FakeStorageAdapter {
    store: Mutex<Store>,
    schemas: Mutex<HashMap<(String, String), SchemaCheck>>,
    events: broadcast::Sender<StorageEvent>,
}

impl FakeStorageAdapter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store: Mutex::new(Store::default()), schemas: Mutex::new(HashMap::new()), events }
    }

    fn check_schema(&self, collection: &str, key: &str, value: &Value) -> FabricResult<()> {
        let schemas = self.schemas.lock().expect("schema lock poisoned");
        match schemas.get(&(collection.to_string(), key.to_string())) {
            Some(check) if !check(value) => {
                Err(FabricError::Validation(format!("value for {collection}/{key} failed schema validation")))
            }
            _ => Ok(()),
        }
    }

    fn emit(&self, event: StorageEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for FakeStorageAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for FakeStorageAdapter {
    async fn get(&self, collection: &str, key: &str) -> FabricResult<Option<Value>> {
        let value = self.store.lock().expect("store lock poisoned").data.get(&(collection.to_string(), key.to_string())).cloned();
        if let Some(ref value) = value {
            self.check_schema(collection, key, value)?;
        }
        self.emit(StorageEvent::Get { collection: collection.to_string(), key: key.to_string() });
        Ok(value)
    }

    async fn has(&self, collection: &str, key: &str) -> FabricResult<bool> {
        Ok(self.store.lock().expect("store lock poisoned").data.contains_key(&(collection.to_string(), key.to_string())))
    }

    async fn set(&self, collection: &str, key: &str, value: Value) -> FabricResult<()> {
        self.check_schema(collection, key, &value)?;
        self.store.lock().expect("store lock poisoned").data.insert((collection.to_string(), key.to_string()), value);
        self.emit(StorageEvent::Set { collection: collection.to_string(), key: key.to_string() });
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> FabricResult<bool> {
        let removed = self
            .store
            .lock()
            .expect("store lock poisoned")
            .data
            .remove(&(collection.to_string(), key.to_string()))
            .is_some();
        if removed {
            self.emit(StorageEvent::Delete { collection: collection.to_string(), key: key.to_string() });
        }
        Ok(removed)
    }

    async fn clear(&self, collection: Option<&str>) -> FabricResult<u64> {
        let mut store = self.store.lock().expect("store lock poisoned");
        let before = store.data.len();
        match collection {
            Some(c) => store.data.retain(|(col, _), _| col != c),
            None => store.data.clear(),
        }
        let count = (before - store.data.len()) as u64;
        drop(store);
        self.emit(StorageEvent::Clear { collection: collection.map(str::to_string), count });
        Ok(count)
    }

    async fn size(&self, collection: Option<&str>) -> FabricResult<u64> {
        let store = self.store.lock().expect("store lock poisoned");
        let count = match collection {
            Some(c) => store.data.keys().filter(|(col, _)| col == c).count(),
            None => store.data.len(),
        };
        Ok(count as u64)
    }

    async fn keys(&self, collection: &str) -> FabricResult<Vec<String>> {
        let store = self.store.lock().expect("store lock poisoned");
        Ok(store.data.keys().filter(|(col, _)| col == collection).map(|(_, k)| k.clone()).collect())
    }

    async fn close(&self) {}

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn register_schema(&self, collection: &str, key: &str, check: SchemaCheck) {
        self.schemas.lock().expect("schema lock poisoned").insert((collection.to_string(), key.to_string()), check);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_a_value() {
        let adapter = FakeStorageAdapter::new();
        adapter.set("test", "data", json!({"message": "hi"})).await.unwrap();
        assert_eq!(adapter.get("test", "data").await.unwrap(), Some(json!({"message": "hi"})));
    }

    #[tokio::test]
    async fn delete_then_has_and_keys_agree() {
        let adapter = FakeStorageAdapter::new();
        adapter.set("test", "data", json!(1)).await.unwrap();
        assert!(adapter.delete("test", "data").await.unwrap());
        assert!(!adapter.has("test", "data").await.unwrap());
        assert!(!adapter.keys("test").await.unwrap().contains(&"data".to_string()));
    }

    #[tokio::test]
    async fn clear_scoped_to_a_collection_leaves_others_untouched() {
        let adapter = FakeStorageAdapter::new();
        adapter.set("a", "k", json!(1)).await.unwrap();
        adapter.set("b", "k", json!(2)).await.unwrap();
        let removed = adapter.clear(Some("a")).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(adapter.size(Some("a")).await.unwrap(), 0);
        assert_eq!(adapter.size(Some("b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn schema_violation_rejects_the_write() {
        let adapter = FakeStorageAdapter::new();
        adapter.register_schema(
            "test",
            "data",
            std::sync::Arc::new(|v: &Value| v.get("message").and_then(Value::as_str).is_some()),
        );
        let result = adapter.set("test", "data", json!({"message": 42})).await;
        assert!(result.is_err());
        assert_eq!(adapter.has("test", "data").await.unwrap(), false);
    }
}
