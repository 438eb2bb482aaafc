//! Typed events the gateway FSM surfaces to its caller -- every `dispatch` other than
//! `READY`/`RESUMED` (which the FSM consumes itself to manage session state) is
//! re-emitted here untouched.

use serde_json::Value;

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Ready,
    Resumed,
    Dispatch { t: String, d: Value },
    Disconnected,
    Error(String),
}
