//! Session persistence: the latest `{token, sessionId, sequence, resumeGatewayUrl,
//! timestamp, userId?}` is written on each READY/RESUMED and on every sequence
//! advance, so a later reconnect can RESUME instead of re-IDENTIFY.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use fabric_common::time::timestamp_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySession {
    pub token: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub sequence: u64,
    #[serde(rename = "resumeGatewayUrl")]
    pub resume_gateway_url: String,
    pub timestamp: i64,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl GatewaySession {
    pub fn new(token: String, session_id: String, resume_gateway_url: String, sequence: u64, user_id: Option<String>) -> Self {
        Self { token, session_id, sequence, resume_gateway_url, timestamp: timestamp_ms(), user_id }
    }
}

/// Pluggable session store: a real deployment might back this with a file or a
/// database; the FSM only ever needs load/save/clear.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Option<GatewaySession>;
    async fn save(&self, session: GatewaySession);
    async fn clear(&self);
}

/// In-memory session store, the one concrete implementation this crate ships --
/// grounded on the same in-process-fake convention the storage fabric uses for its
/// own test doubles, since a real persistent store is out of scope here.
#[derive(Default)]
pub struct InMemorySessionStore {
    current: Mutex<Option<GatewaySession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self) -> Option<GatewaySession> {
        self.current.lock().await.clone()
    }

    async fn save(&self, session: GatewaySession) {
        *self.current.lock().await = Some(session);
    }

    async fn clear(&self) {
        *self.current.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemorySessionStore::new();
        let session = GatewaySession::new("token".into(), "session-1".into(), "wss://gateway.example/resume".into(), 42, None);
        store.save(session.clone()).await;
        assert_eq!(store.load().await, Some(session));
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let store = InMemorySessionStore::new();
        store.save(GatewaySession::new("t".into(), "s".into(), "url".into(), 0, None)).await;
        store.clear().await;
        assert_eq!(store.load().await, None);
    }
}
