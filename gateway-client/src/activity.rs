//! Activity/presence builder (component J): typed construction and schema checks for
//! the payload `identify` carries, generalizing the builder-method shape
//! `protocol::EventFrame` uses (`new` plus `with_*` setters) to this gateway's
//! identify payload instead of a raw [`serde_json::Value`] assembled by hand.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use fabric_common::error::{FabricError, FabricResult};

/// Discord-style activity type discriminant, matching `EventKind`'s lowercase-tag
/// convention rather than a raw numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Playing,
    Streaming,
    Listening,
    Watching,
    Custom,
    Competing,
}

/// One entry of a presence's `activities` list.
#[derive(Debug, Clone)]
pub struct Activity {
    name: String,
    activity_type: ActivityType,
    url: Option<String>,
}

impl Activity {
    /// Builds an activity, rejecting shapes the gateway would otherwise bounce:
    /// an empty name, or a `Streaming` activity missing the stream `url` it requires.
    pub fn new(name: impl Into<String>, activity_type: ActivityType, url: Option<String>) -> FabricResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FabricError::Validation("activity name must not be empty".into()));
        }
        if activity_type == ActivityType::Streaming && url.is_none() {
            return Err(FabricError::Validation("a streaming activity requires a url".into()));
        }
        Ok(Self { name, activity_type, url })
    }

    fn to_value(&self) -> Value {
        let mut value = json!({ "name": self.name, "type": self.activity_type });
        if let Some(url) = &self.url {
            value["url"] = Value::String(url.clone());
        }
        value
    }
}

/// Online presence status, carried alongside `activities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Invisible,
}

/// This connection's declared presence: a status plus up to one displayed activity,
/// matching the shape real gateways bounce a longer `activities` list down to.
#[derive(Debug, Clone)]
pub struct Presence {
    status: PresenceStatus,
    activity: Option<Activity>,
}

impl Presence {
    pub fn new(status: PresenceStatus) -> Self {
        Self { status, activity: None }
    }

    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activity = Some(activity);
        self
    }

    fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "activities": self.activity.iter().map(Activity::to_value).collect::<Vec<_>>(),
        })
    }
}

/// The connection-properties block every identify carries: the client's declared
/// `os`/browser/device identity, unrelated to presence but part of the same payload.
#[derive(Debug, Clone)]
pub struct ConnectionProperties {
    os: String,
    browser: String,
    device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self { os: std::env::consts::OS.to_string(), browser: "fabric-gateway-client".to_string(), device: "fabric-gateway-client".to_string() }
    }
}

impl ConnectionProperties {
    fn to_value(&self) -> Value {
        json!({ "os": self.os, "browser": self.browser, "device": self.device })
    }
}

/// Validated, typed construction of the payload `GatewayFrame::identify` merges the
/// token into. Replaces an implementer hand-assembling a raw [`Value`].
#[derive(Debug, Clone, Default)]
pub struct IdentifyPayload {
    properties: ConnectionProperties,
    intents: u64,
    presence: Option<Presence>,
}

impl IdentifyPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "properties": self.properties.to_value(),
            "intents": self.intents,
        });
        if let Some(presence) = &self.presence {
            value["presence"] = presence.to_value();
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_activity_without_a_url_is_rejected() {
        let result = Activity::new("a stream", ActivityType::Streaming, None);
        assert!(result.is_err());
    }

    #[test]
    fn streaming_activity_with_a_url_is_accepted() {
        let result = Activity::new("a stream", ActivityType::Streaming, Some("https://example.com/live".into()));
        assert!(result.is_ok());
    }

    #[test]
    fn an_empty_activity_name_is_rejected() {
        assert!(Activity::new("   ", ActivityType::Playing, None).is_err());
    }

    #[test]
    fn identify_payload_carries_intents_and_presence() {
        let activity = Activity::new("sorting keys", ActivityType::Playing, None).unwrap();
        let presence = Presence::new(PresenceStatus::Idle).with_activity(activity);
        let payload = IdentifyPayload::new().with_intents(513).with_presence(presence).to_value();

        assert_eq!(payload["intents"], 513);
        assert_eq!(payload["presence"]["status"], "idle");
        assert_eq!(payload["presence"]["activities"][0]["name"], "sorting keys");
    }

    #[test]
    fn identify_payload_omits_presence_when_unset() {
        let payload = IdentifyPayload::new().to_value();
        assert!(payload.get("presence").is_none());
    }
}
