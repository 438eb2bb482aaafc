//! Wire protocol types shared by the server, the client storage adapter, and tests.
//! Every frame is one JSON object per transport message, per the handshake and
//! request/response shapes the fabric specifies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unencrypted, client -> server, the only frame sent before the handshake completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    #[serde(rename = "type")]
    pub frame_type: HelloType,
    pub token: String,
}

impl ClientHello {
    pub fn new(token: impl Into<String>) -> Self {
        Self { frame_type: HelloType::Hello, token: token.into() }
    }
}

/// Unencrypted, server -> client, first handshake frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    #[serde(rename = "type")]
    pub frame_type: HelloType,
    #[serde(rename = "channelId")]
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HelloType {
    #[serde(rename = "hello")]
    Hello,
}

impl ServerHello {
    pub fn new(channel_id: String) -> Self {
        Self { frame_type: HelloType::Hello, channel_id }
    }
}

/// Unencrypted, server -> client, second handshake frame: the wrapped session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionFrame {
    #[serde(rename = "type")]
    pub frame_type: EncryptionType,
    #[serde(rename = "encryptionKey")]
    pub encryption_key: String,
    pub iv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncryptionType {
    #[serde(rename = "encryption")]
    Encryption,
}

impl EncryptionFrame {
    pub fn new(encryption_key: String, iv: String) -> Self {
        Self { frame_type: EncryptionType::Encryption, encryption_key, iv }
    }
}

/// Unencrypted or post-handshake error notification with no correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub frame_type: ErrorType,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorType {
    #[serde(rename = "error")]
    Error,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self { frame_type: ErrorType::Error, error: message.into() }
    }
}

/// Authenticated client request, the plaintext carried inside every encrypted frame
/// sent client -> server. Internally tagged on `action`, one variant per RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientRequest {
    #[serde(rename = "get")]
    Get { id: String, collection: String, key: String },
    #[serde(rename = "set")]
    Set { id: String, collection: String, key: String, value: Value },
    #[serde(rename = "delete")]
    Delete { id: String, collection: String, key: String },
    #[serde(rename = "clear")]
    Clear { id: String, collection: Option<String> },
    #[serde(rename = "size")]
    Size { id: String, collection: Option<String> },
    #[serde(rename = "keys")]
    Keys { id: String, collection: String },
    #[serde(rename = "admin_list_users")]
    AdminListUsers { id: String },
    #[serde(rename = "admin_delete_user")]
    AdminDeleteUser { id: String, #[serde(rename = "userId")] user_id: String },
    #[serde(rename = "admin_user_info")]
    AdminUserInfo { id: String, #[serde(rename = "userId")] user_id: String },
}

impl ClientRequest {
    pub fn id(&self) -> &str {
        match self {
            ClientRequest::Get { id, .. }
            | ClientRequest::Set { id, .. }
            | ClientRequest::Delete { id, .. }
            | ClientRequest::Clear { id, .. }
            | ClientRequest::Size { id, .. }
            | ClientRequest::Keys { id, .. }
            | ClientRequest::AdminListUsers { id }
            | ClientRequest::AdminDeleteUser { id, .. }
            | ClientRequest::AdminUserInfo { id, .. } => id,
        }
    }
}

/// Server -> client response. Exactly one of `result`/`error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self { id: id.into(), result: Some(result), error: None }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), result: None, error: Some(message.into()) }
    }
}

/// Server -> every-other-connection-in-channel, unsolicited mutation notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: EventFrameType,
    pub event: EventKind,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventFrameType {
    #[serde(rename = "event")]
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Set,
    Delete,
    Clear,
}

impl EventFrame {
    pub fn new(event: EventKind, collection: impl Into<String>) -> Self {
        Self {
            frame_type: EventFrameType::Event,
            event,
            collection: collection.into(),
            key: None,
            value: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Persisted tenant metadata, `user_metadata:{tenant-id}` in the backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantMetadata {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "lastAccessedAt")]
    pub last_accessed_at: i64,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_round_trips_through_json() {
        let req = ClientRequest::Set {
            id: "abc".into(),
            collection: "test".into(),
            key: "data".into(),
            value: serde_json::json!({"message": "hi"}),
        };
        let wire = serde_json::to_string(&req).unwrap();
        assert!(wire.contains("\"action\":\"set\""));
        let parsed: ClientRequest = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.id(), "abc");
    }

    #[test]
    fn response_frame_omits_absent_fields() {
        let ok = ResponseFrame::ok("1", serde_json::json!({"size": 3}));
        let wire = serde_json::to_string(&ok).unwrap();
        assert!(!wire.contains("error"));

        let err = ResponseFrame::err("2", "nope");
        let wire = serde_json::to_string(&err).unwrap();
        assert!(!wire.contains("result"));
    }
}
