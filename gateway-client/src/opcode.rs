//! Numeric gateway opcodes and the envelope every frame is sent/received in. Only the
//! opcodes the core must itself react to are named; everything else a `dispatch`
//! carries is re-emitted to the caller untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DISPATCH: u8 = 0;
pub const HEARTBEAT: u8 = 1;
/// Client -> server identify, sent after `hello` when no resumable session exists.
/// Not itself one of the reactions the core must implement, but it is the frame
/// `hello`'s handling sends, so it lives here with the rest of the envelope helpers.
pub const IDENTIFY: u8 = 2;
pub const RESUME: u8 = 6;
pub const RECONNECT: u8 = 7;
pub const INVALID_SESSION: u8 = 9;
pub const HELLO: u8 = 10;
pub const HEARTBEAT_ACK: u8 = 11;

/// The gateway's wire envelope: `{op, d, s?, t?}`. `s` and `t` are only ever present
/// on a `dispatch` (op 0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayFrame {
    pub fn new(op: u8, d: Value) -> Self {
        Self { op, d, s: None, t: None }
    }

    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self::new(HEARTBEAT, last_sequence.map(Value::from).unwrap_or(Value::Null))
    }

    pub fn identify(token: &str, extra: Value) -> Self {
        let mut payload = extra;
        if let Value::Object(ref mut map) = payload {
            map.insert("token".to_string(), Value::String(token.to_string()));
        }
        Self::new(IDENTIFY, payload)
    }

    pub fn resume(token: &str, session_id: &str, sequence: u64) -> Self {
        Self::new(
            RESUME,
            serde_json::json!({ "token": token, "session_id": session_id, "seq": sequence }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_injects_the_token_into_the_extra_payload() {
        let frame = GatewayFrame::identify("tok123", serde_json::json!({ "intents": 1 }));
        assert_eq!(frame.op, IDENTIFY);
        assert_eq!(frame.d["token"], "tok123");
        assert_eq!(frame.d["intents"], 1);
    }

    #[test]
    fn heartbeat_carries_the_last_sequence_or_null() {
        assert_eq!(GatewayFrame::heartbeat(Some(7)).d, serde_json::json!(7));
        assert_eq!(GatewayFrame::heartbeat(None).d, Value::Null);
    }

    #[test]
    fn resume_carries_token_session_and_sequence() {
        let frame = GatewayFrame::resume("tok123", "sess-1", 42);
        assert_eq!(frame.op, RESUME);
        assert_eq!(frame.d["token"], "tok123");
        assert_eq!(frame.d["session_id"], "sess-1");
        assert_eq!(frame.d["seq"], 42);
    }
}
