//! Request dispatcher (component G): turns an authenticated [`ClientRequest`] into a
//! [`ResponseFrame`] and, for successful mutations, an [`EventFrame`] to broadcast.
//! Broadcasting on a failed mutation is a correctness bug, not a style choice -- every
//! branch below only returns a broadcast alongside a success response.

use serde_json::json;

use fabric_common::protocol::{ClientRequest, EventFrame, EventKind, ResponseFrame};

use crate::bucket::BucketManager;
use crate::storage::StorageAdapter;

/// Outcome of dispatching one request: the response always goes back to the
/// originator; `broadcast` (if present) goes to every other connection in the channel.
pub struct DispatchOutcome {
    pub response: ResponseFrame,
    pub broadcast: Option<EventFrame>,
}

impl DispatchOutcome {
    fn response_only(response: ResponseFrame) -> Self {
        Self { response, broadcast: None }
    }

    fn with_broadcast(response: ResponseFrame, event: EventFrame) -> Self {
        Self { response, broadcast: Some(event) }
    }
}

pub async fn dispatch(
    request: ClientRequest,
    adapter: &dyn StorageAdapter,
    bucket_manager: &BucketManager,
) -> DispatchOutcome {
    match request {
        ClientRequest::AdminListUsers { .. } | ClientRequest::AdminDeleteUser { .. } | ClientRequest::AdminUserInfo { .. } => {
            dispatch_admin(request, bucket_manager).await
        }
        storage_request => dispatch_storage(storage_request, adapter).await,
    }
}

/// Handles the `get`/`set`/`delete`/`clear`/`size`/`keys` actions, the only ones that
/// touch a tenant's storage adapter rather than the bucket manager's metadata.
pub async fn dispatch_storage(request: ClientRequest, adapter: &dyn StorageAdapter) -> DispatchOutcome {
    match request {
        ClientRequest::Get { id, collection, key } => match adapter.get(&collection, &key).await {
            Ok(value) => DispatchOutcome::response_only(ResponseFrame::ok(
                id,
                json!({"collection": collection, "key": key, "value": value}),
            )),
            Err(err) => DispatchOutcome::response_only(ResponseFrame::err(id, err.to_string())),
        },

        ClientRequest::Set { id, collection, key, value } => {
            match adapter.set(&collection, &key, value.clone()).await {
                Ok(()) => {
                    let event = EventFrame::new(EventKind::Set, collection.clone())
                        .with_key(key.clone())
                        .with_value(value);
                    DispatchOutcome::with_broadcast(
                        ResponseFrame::ok(id, json!({"collection": collection, "key": key})),
                        event,
                    )
                }
                Err(err) => DispatchOutcome::response_only(ResponseFrame::err(id, err.to_string())),
            }
        }

        ClientRequest::Delete { id, collection, key } => match adapter.delete(&collection, &key).await {
            Ok(success) => {
                let response = ResponseFrame::ok(id.clone(), json!({"success": success}));
                if success {
                    let event = EventFrame::new(EventKind::Delete, collection.clone()).with_key(key);
                    DispatchOutcome::with_broadcast(response, event)
                } else {
                    DispatchOutcome::response_only(response)
                }
            }
            Err(err) => DispatchOutcome::response_only(ResponseFrame::err(id, err.to_string())),
        },

        ClientRequest::Clear { id, collection } => match adapter.clear(collection.as_deref()).await {
            Ok(count) => {
                let collection_field = collection.clone().unwrap_or_else(|| "all".to_string());
                let event = EventFrame::new(EventKind::Clear, collection_field);
                DispatchOutcome::with_broadcast(ResponseFrame::ok(id, json!({"count": count})), event)
            }
            Err(err) => DispatchOutcome::response_only(ResponseFrame::err(id, err.to_string())),
        },

        ClientRequest::Size { id, collection } => match adapter.size(collection.as_deref()).await {
            Ok(size) => DispatchOutcome::response_only(ResponseFrame::ok(id, json!({"size": size}))),
            Err(err) => DispatchOutcome::response_only(ResponseFrame::err(id, err.to_string())),
        },

        ClientRequest::Keys { id, collection } => match adapter.keys(&collection).await {
            Ok(keys) => DispatchOutcome::response_only(ResponseFrame::ok(id, json!({"keys": keys}))),
            Err(err) => DispatchOutcome::response_only(ResponseFrame::err(id, err.to_string())),
        },

        ClientRequest::AdminListUsers { .. }
        | ClientRequest::AdminDeleteUser { .. }
        | ClientRequest::AdminUserInfo { .. } => {
            unreachable!("admin actions are routed to dispatch_admin by dispatch()")
        }
    }
}

/// Handles the `admin_*` actions, all of which only need the bucket manager's
/// tenant-metadata index -- never a tenant's own storage adapter.
async fn dispatch_admin(request: ClientRequest, bucket_manager: &BucketManager) -> DispatchOutcome {
    match request {
        ClientRequest::AdminListUsers { id } => {
            let users: Vec<_> = bucket_manager
                .list_tenants()
                .await
                .into_iter()
                .map(|(user_id, metadata)| json!({"userId": user_id, "metadata": metadata}))
                .collect();
            DispatchOutcome::response_only(ResponseFrame::ok(id, json!({"users": users})))
        }

        ClientRequest::AdminDeleteUser { id, user_id } => match bucket_manager.delete_user_bucket(&user_id).await {
            Ok(success) => DispatchOutcome::response_only(ResponseFrame::ok(id, json!({"success": success}))),
            Err(err) => DispatchOutcome::response_only(ResponseFrame::err(id, err.to_string())),
        },

        ClientRequest::AdminUserInfo { id, user_id } => match bucket_manager.get_user_metadata(&user_id).await {
            Some(metadata) => {
                DispatchOutcome::response_only(ResponseFrame::ok(id, json!({"userId": user_id, "metadata": metadata})))
            }
            None => DispatchOutcome::response_only(ResponseFrame::err(id, "unknown user")),
        },

        _ => unreachable!("non-admin actions are routed to dispatch_storage by dispatch()"),
    }
}

#[cfg(test)]
mod tests {
    use super::dispatch_storage;
    use super::*;
    use crate::storage::fake::FakeStorageAdapter;
    use serde_json::json;

    #[tokio::test]
    async fn set_succeeds_and_broadcasts() {
        let adapter = FakeStorageAdapter::new();
        let request = ClientRequest::Set {
            id: "1".into(),
            collection: "test".into(),
            key: "data".into(),
            value: json!({"message": "hi"}),
        };

        let outcome = dispatch_storage(request, &adapter).await;
        assert!(outcome.response.error.is_none());
        assert!(outcome.broadcast.is_some());
    }

    #[tokio::test]
    async fn schema_violation_fails_without_broadcasting() {
        let adapter = FakeStorageAdapter::new();
        adapter.register_schema(
            "test",
            "data",
            std::sync::Arc::new(|v: &serde_json::Value| v.get("message").and_then(serde_json::Value::as_str).is_some()),
        );
        let request = ClientRequest::Set {
            id: "1".into(),
            collection: "test".into(),
            key: "data".into(),
            value: json!({"message": 42}),
        };

        let outcome = dispatch_storage(request, &adapter).await;
        assert!(outcome.response.error.is_some());
        assert!(outcome.broadcast.is_none());
        assert_eq!(adapter.has("test", "data").await.unwrap(), false);
    }

    #[tokio::test]
    async fn delete_of_missing_key_does_not_broadcast() {
        let adapter = FakeStorageAdapter::new();
        let request = ClientRequest::Delete { id: "1".into(), collection: "test".into(), key: "missing".into() };

        let outcome = dispatch_storage(request, &adapter).await;
        assert_eq!(outcome.response.result, Some(json!({"success": false})));
        assert!(outcome.broadcast.is_none());
    }

    #[tokio::test]
    async fn clear_all_labels_the_event_collection_as_all() {
        let adapter = FakeStorageAdapter::new();
        adapter.set("a", "k", json!(1)).await.unwrap();
        let request = ClientRequest::Clear { id: "1".into(), collection: None };

        let outcome = dispatch_storage(request, &adapter).await;
        assert_eq!(outcome.broadcast.unwrap().collection, "all");
    }
}
