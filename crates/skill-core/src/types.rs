//! Wire types exchanged over the bus and shared across the runtime.
//!
//! Every inbound payload is parsed into these types before any skill logic
//! sees it; see [`IntentRequest::from_slice`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for registry records.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Closed set of command categories produced by the intent classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentType {
    #[serde(rename = "device.on")]
    DeviceOn,
    #[serde(rename = "device.off")]
    DeviceOff,
    #[serde(rename = "device.set")]
    DeviceSet,
    #[serde(rename = "device.open")]
    DeviceOpen,
    #[serde(rename = "device.close")]
    DeviceClose,
    #[serde(rename = "media.play")]
    MediaPlay,
    #[serde(rename = "media.stop")]
    MediaStop,
    #[serde(rename = "media.next")]
    MediaNext,
    #[serde(rename = "query.status")]
    QueryStatus,
    #[serde(rename = "query.list")]
    QueryList,
    #[serde(rename = "query.time")]
    QueryTime,
    #[serde(rename = "scene.apply")]
    SceneApply,
    #[serde(rename = "schedule.set")]
    ScheduleSet,
    #[serde(rename = "schedule.cancel")]
    ScheduleCancel,
    #[serde(rename = "system.help")]
    SystemHelp,
    #[serde(rename = "system.refresh")]
    SystemRefresh,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceOn => "device.on",
            Self::DeviceOff => "device.off",
            Self::DeviceSet => "device.set",
            Self::DeviceOpen => "device.open",
            Self::DeviceClose => "device.close",
            Self::MediaPlay => "media.play",
            Self::MediaStop => "media.stop",
            Self::MediaNext => "media.next",
            Self::QueryStatus => "query.status",
            Self::QueryList => "query.list",
            Self::QueryTime => "query.time",
            Self::SceneApply => "scene.apply",
            Self::ScheduleSet => "schedule.set",
            Self::ScheduleCancel => "schedule.cancel",
            Self::SystemHelp => "system.help",
            Self::SystemRefresh => "system.refresh",
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of span an [`Entity`] was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Device,
    DeviceType,
    Room,
    Number,
    Duration,
    Time,
    MediaId,
    Scene,
    Modifier,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::DeviceType => "device_type",
            Self::Room => "room",
            Self::Number => "number",
            Self::Duration => "duration",
            Self::Time => "time",
            Self::MediaId => "media_id",
            Self::Scene => "scene",
            Self::Modifier => "modifier",
        }
    }
}

// --- Payloads ---

/// Where an utterance came from and where the answer should go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: Uuid,
    pub text: String,
    pub room: String,
    pub output_topic: String,
}

/// A typed, normalized span extracted from an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub raw_text: String,
    pub normalized_value: serde_json::Value,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Ids of related entities in the same intent, e.g. a number tied to a
    /// duration unit.
    #[serde(default)]
    pub linked_to: Vec<Uuid>,
}

impl Entity {
    pub fn new(
        entity_type: EntityType,
        raw_text: impl Into<String>,
        normalized_value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity_type,
            raw_text: raw_text.into(),
            normalized_value: normalized_value.into(),
            confidence: 1.0,
            metadata: HashMap::new(),
            linked_to: Vec::new(),
        }
    }

    /// Normalized value as text, falling back to the raw span.
    pub fn value_text(&self) -> String {
        match &self.normalized_value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => self.raw_text.clone(),
            other => other.to_string(),
        }
    }
}

fn full_confidence() -> f64 {
    1.0
}

/// Output of the upstream classifier for a single utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedIntent {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub intent_type: IntentType,
    pub confidence: f64,
    /// Entities grouped by entity type key, in extraction order.
    #[serde(default)]
    pub entities: HashMap<String, Vec<Entity>>,
    #[serde(default)]
    pub alternative_intents: Vec<(IntentType, f64)>,
    pub raw_text: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedIntent {
    /// Entities under `key`; a missing key is an empty list.
    pub fn entities_of(&self, key: &str) -> &[Entity] {
        self.entities
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Snapshot of normalized values per entity key, used for context tracking.
    pub fn entity_values(&self) -> HashMap<String, Vec<serde_json::Value>> {
        self.entities
            .iter()
            .map(|(key, list)| {
                (
                    key.clone(),
                    list.iter().map(|e| e.normalized_value.clone()).collect(),
                )
            })
            .collect()
    }
}

/// The unit of work delivered to every skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRequest {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub classified_intent: ClassifiedIntent,
    pub client_request: ClientRequest,
}

/// Why an inbound payload was dropped.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{field} confidence {value} is outside [0, 1]")]
    ConfidenceOutOfRange { field: &'static str, value: f64 },
}

impl IntentRequest {
    /// Parse and validate an inbound intent-result payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        let request: Self = serde_json::from_slice(payload)?;
        request.validate()?;
        Ok(request)
    }

    pub fn intent_type(&self) -> IntentType {
        self.classified_intent.intent_type
    }

    pub fn confidence(&self) -> f64 {
        self.classified_intent.confidence
    }

    fn validate(&self) -> Result<(), ValidationError> {
        check_unit("intent", self.classified_intent.confidence)?;
        for entity in self.classified_intent.entities.values().flatten() {
            check_unit("entity", entity.confidence)?;
        }
        for (_, confidence) in &self.classified_intent.alternative_intents {
            check_unit("alternative intent", *confidence)?;
        }
        Ok(())
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::ConfidenceOutOfRange { field, value })
    }
}

/// Accepts RFC 3339 timestamps as well as naive ISO timestamps, which are
/// taken to be UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Audio cue played around a spoken response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub play_before: bool,
    #[serde(default)]
    pub play_after: bool,
    #[serde(default = "default_sound")]
    pub sound: String,
}

fn default_sound() -> String {
    "default".to_string()
}

impl Default for Alert {
    fn default() -> Self {
        Self {
            play_before: false,
            play_after: false,
            sound: default_sound(),
        }
    }
}

/// Text answer published back to a client or broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}

impl Response {
    pub fn new(text: impl Into<String>, alert: Option<Alert>) -> Self {
        Self {
            text: text.into(),
            alert,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Minimal valid request for the given intent and confidence.
    pub fn request(intent_type: IntentType, confidence: f64) -> IntentRequest {
        IntentRequest {
            id: Uuid::now_v7(),
            classified_intent: ClassifiedIntent {
                id: Uuid::now_v7(),
                intent_type,
                confidence,
                entities: HashMap::new(),
                alternative_intents: Vec::new(),
                raw_text: "turn it off".to_string(),
                timestamp: Utc::now(),
            },
            client_request: ClientRequest {
                id: Uuid::now_v7(),
                text: "turn it off".to_string(),
                room: "kitchen".to_string(),
                output_topic: "assistant/kitchen/output".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "id": "0191d3c4-8a2b-7c3d-9e4f-5a6b7c8d9e0f",
        "classified_intent": {
            "id": "0191d3c4-8a2b-7c3d-9e4f-5a6b7c8d9e10",
            "intent_type": "device.on",
            "confidence": 0.92,
            "entities": {
                "device": [
                    {"type": "device", "raw_text": "lights", "normalized_value": "light"}
                ]
            },
            "alternative_intents": [["device.set", 0.4]],
            "raw_text": "turn on the lights",
            "timestamp": "2025-03-01T12:30:00.123456"
        },
        "client_request": {
            "id": "0191d3c4-8a2b-7c3d-9e4f-5a6b7c8d9e11",
            "text": "turn on the lights",
            "room": "living room",
            "output_topic": "assistant/living_room/output"
        }
    }"#;

    #[test]
    fn intent_type_uses_dotted_names() {
        assert_eq!(
            serde_json::to_string(&IntentType::DeviceOff).unwrap(),
            "\"device.off\""
        );
        assert_eq!(IntentType::ScheduleCancel.as_str(), "schedule.cancel");
        assert_eq!(IntentType::SystemRefresh.to_string(), "system.refresh");
    }

    #[test]
    fn entity_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&EntityType::MediaId).unwrap(),
            "\"media_id\""
        );
        assert_eq!(EntityType::DeviceType.as_str(), "device_type");
    }

    #[test]
    fn parses_request_with_defaults() {
        let request = IntentRequest::from_slice(PAYLOAD.as_bytes()).unwrap();
        let intent = &request.classified_intent;
        assert_eq!(intent.intent_type, IntentType::DeviceOn);
        assert_eq!(intent.alternative_intents, vec![(IntentType::DeviceSet, 0.4)]);
        assert_eq!(intent.timestamp.to_rfc3339(), "2025-03-01T12:30:00.123456+00:00");

        let devices = intent.entities_of("device");
        assert_eq!(devices.len(), 1);
        assert!((devices[0].confidence - 1.0).abs() < f64::EPSILON);
        assert!(devices[0].metadata.is_empty());
        assert_eq!(devices[0].value_text(), "light");
        assert!(intent.entities_of("room").is_empty());
        assert_eq!(request.client_request.room, "living room");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let payload = PAYLOAD.replace("0.92", "1.5");
        let err = IntentRequest::from_slice(payload.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ConfidenceOutOfRange { field: "intent", .. }
        ));
    }

    #[test]
    fn rejects_unknown_intent_type() {
        let payload = PAYLOAD.replace("\"device.on\"", "\"device.explode\"");
        let err = IntentRequest::from_slice(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn rejects_non_json() {
        assert!(IntentRequest::from_slice(b"not json").is_err());
    }

    #[test]
    fn response_omits_missing_alert() {
        let response = Response::new("done", None);
        assert_eq!(serde_json::to_string(&response).unwrap(), r#"{"text":"done"}"#);

        let response = Response::new("done", Some(Alert::default()));
        let json: serde_json::Value = serde_json::to_value(&response).unwrap();
        assert_eq!(json["alert"]["sound"], "default");
        assert_eq!(json["alert"]["play_before"], false);
    }

    #[test]
    fn entity_values_snapshot() {
        let request = IntentRequest::from_slice(PAYLOAD.as_bytes()).unwrap();
        let values = request.classified_intent.entity_values();
        assert_eq!(values["device"], vec![serde_json::json!("light")]);
    }
}
