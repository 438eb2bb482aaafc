//! Bucket manager (component C): maps a client token to a tenant-id, and the tenant-id
//! to a cached, namespaced storage adapter. Owns the global `all_users` index and the
//! per-tenant metadata cache.

use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use slog::Logger;
use tokio::sync::RwLock;

use fabric_common::error::{FabricError, FabricResult};
use fabric_common::logging::{debug, info, o, warn};
use fabric_common::protocol::TenantMetadata;
use fabric_common::time::timestamp_ms;
use fabric_common::crypto::tenant_id_for_token;

use crate::storage::redis_adapter::RedisNamespacedAdapter;
use crate::storage::StorageAdapter;

const ALL_USERS_KEY: &str = "all_users";

fn metadata_key(tenant_id: &str) -> String {
    format!("user_metadata:{tenant_id}")
}

fn data_prefix(tenant_id: &str) -> String {
    format!("user_data:{tenant_id}")
}

pub struct BucketManager {
    conn: ConnectionManager,
    cache: RwLock<HashMap<String, Arc<dyn StorageAdapter>>>,
    metadata: RwLock<HashMap<String, TenantMetadata>>,
    log: Logger,
}

impl BucketManager {
    pub fn new(conn: ConnectionManager, log: Logger) -> Self {
        Self {
            conn,
            cache: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            log: log.new(o!("component" => "bucket_manager")),
        }
    }

    /// Loads every known tenant-id and hydrates the metadata cache. A tenant whose
    /// metadata JSON fails to parse is logged and skipped rather than treated as a
    /// hard failure -- one corrupt record should not prevent the server from starting.
    pub async fn initialize(&self) -> FabricResult<()> {
        let mut conn = self.conn.clone();
        let tenant_ids: Vec<String> =
            conn.smembers(ALL_USERS_KEY).await.map_err(|e| FabricError::BackingStore(e.to_string()))?;

        let mut metadata = self.metadata.write().await;
        for tenant_id in tenant_ids {
            let raw: Option<String> = conn
                .get(metadata_key(&tenant_id))
                .await
                .map_err(|e| FabricError::BackingStore(e.to_string()))?;

            match raw {
                Some(raw) => match serde_json::from_str::<TenantMetadata>(&raw) {
                    Ok(parsed) => {
                        metadata.insert(tenant_id, parsed);
                    }
                    Err(err) => {
                        warn!(self.log, "skipping tenant with corrupt metadata"; "tenant_id" => %tenant_id, "error" => %err);
                    }
                },
                None => {
                    warn!(self.log, "tenant indexed in all_users but has no metadata record"; "tenant_id" => %tenant_id);
                }
            }
        }

        info!(self.log, "bucket manager initialized"; "tenant_count" => metadata.len());
        Ok(())
    }

    fn adapter_for(&self, tenant_id: &str) -> Arc<dyn StorageAdapter> {
        Arc::new(RedisNamespacedAdapter::new(
            self.conn.clone(),
            data_prefix(tenant_id),
            self.log.new(o!("tenant_id" => tenant_id.to_string())),
        ))
    }

    /// Returns the adapter for `token`'s tenant, creating the tenant record if this is
    /// its first ever successful handshake. Always refreshes `lastAccessedAt`.
    pub async fn ensure_user_bucket(&self, token: &str) -> FabricResult<Arc<dyn StorageAdapter>> {
        let tenant_id = tenant_id_for_token(token);
        let now = timestamp_ms();

        {
            let mut conn = self.conn.clone();
            let mut metadata = self.metadata.write().await;

            let entry = metadata.entry(tenant_id.clone()).or_insert_with(|| {
                debug!(self.log, "creating new tenant"; "tenant_id" => &tenant_id);
                TenantMetadata {
                    user_id: tenant_id.clone(),
                    created_at: now,
                    last_accessed_at: now,
                    is_active: true,
                }
            });
            entry.last_accessed_at = now;

            let serialized = serde_json::to_string(&*entry)?;
            let _: () = conn
                .set(metadata_key(&tenant_id), serialized)
                .await
                .map_err(|e| FabricError::BackingStore(e.to_string()))?;
            let _: () = conn
                .sadd(ALL_USERS_KEY, &tenant_id)
                .await
                .map_err(|e| FabricError::BackingStore(e.to_string()))?;
        }

        let mut cache = self.cache.write().await;
        let adapter = cache.entry(tenant_id.clone()).or_insert_with(|| self.adapter_for(&tenant_id)).clone();
        Ok(adapter)
    }

    /// Returns the adapter for `token`'s tenant only if that tenant already exists.
    pub async fn get_user_bucket(&self, token: &str) -> FabricResult<Option<Arc<dyn StorageAdapter>>> {
        let tenant_id = tenant_id_for_token(token);
        if !self.metadata.read().await.contains_key(&tenant_id) {
            return Ok(None);
        }

        let mut cache = self.cache.write().await;
        let adapter = cache.entry(tenant_id.clone()).or_insert_with(|| self.adapter_for(&tenant_id)).clone();
        Ok(Some(adapter))
    }

    pub async fn delete_user_bucket(&self, tenant_id: &str) -> FabricResult<bool> {
        if !self.metadata.read().await.contains_key(tenant_id) {
            return Ok(false);
        }

        if let Some(adapter) = self.cache.read().await.get(tenant_id).cloned() {
            adapter.clear(None).await?;
            adapter.close().await;
        }

        let mut conn = self.conn.clone();
        let _: () =
            conn.del(metadata_key(tenant_id)).await.map_err(|e| FabricError::BackingStore(e.to_string()))?;
        let _: () =
            conn.srem(ALL_USERS_KEY, tenant_id).await.map_err(|e| FabricError::BackingStore(e.to_string()))?;

        self.metadata.write().await.remove(tenant_id);
        self.cache.write().await.remove(tenant_id);

        info!(self.log, "deleted tenant"; "tenant_id" => tenant_id);
        Ok(true)
    }

    pub async fn get_user_metadata(&self, tenant_id: &str) -> Option<TenantMetadata> {
        self.metadata.read().await.get(tenant_id).cloned()
    }

    pub async fn list_tenants(&self) -> Vec<(String, TenantMetadata)> {
        self.metadata.read().await.iter().map(|(id, meta)| (id.clone(), meta.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_derivation_is_a_pure_function_of_the_token() {
        assert_eq!(tenant_id_for_token("alpha"), tenant_id_for_token("alpha"));
        assert_ne!(tenant_id_for_token("alpha"), tenant_id_for_token("beta"));
    }

    #[test]
    fn key_layout_matches_the_spec() {
        assert_eq!(metadata_key("user_abc"), "user_metadata:user_abc");
        assert_eq!(data_prefix("user_abc"), "user_data:user_abc");
    }
}
