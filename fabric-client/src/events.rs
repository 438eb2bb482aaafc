//! Local events the client adapter surfaces, the same fire-and-forget discipline as
//! the server's `storage::StorageEvent` bus: `connected`/`disconnected` track the
//! transport lifecycle, `Remote` carries a broadcast mutation this fabric does not
//! cache locally, and `Error` surfaces a server-sent error with no request to
//! correlate it to.

use fabric_common::protocol::EventKind;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Remote { collection: String, event: EventKind, key: Option<String>, value: Option<Value> },
    Error(String),
}
