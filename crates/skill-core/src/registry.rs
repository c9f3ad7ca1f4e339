//! Device registry records shared by every skill.
//!
//! The upstream classifier reads the same catalog to resolve device names
//! and match patterns, so these types are the contract between skills and
//! the classifier, not just an internal storage detail.

use crate::types::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Id,
    pub name: String,
}

/// A skill as known to the registry (unique by name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRecord {
    pub id: Id,
    pub name: String,
    pub help_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Id,
    pub skill_id: Id,
    pub device_type_id: Id,
    /// Denormalized type name, filled in on read.
    pub device_type: String,
    pub name: String,
    /// Free-text or regex patterns the classifier uses to recognize the device.
    pub patterns: Vec<String>,
    pub device_attributes: Option<serde_json::Value>,
    pub room_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Case-insensitive match of `text` against the device name or any pattern.
    pub fn is_named_by(&self, text: &str) -> bool {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return false;
        }
        self.name.to_lowercase() == text || self.patterns.iter().any(|p| p.to_lowercase() == text)
    }
}

/// Input for registering a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewDevice {
    pub device_type: String,
    pub name: String,
    pub patterns: Vec<String>,
    pub room: Option<String>,
    pub device_attributes: Option<serde_json::Value>,
}

impl NewDevice {
    pub fn new(device_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn attributes(mut self, attributes: serde_json::Value) -> Self {
        self.device_attributes = Some(attributes);
        self
    }

    /// Trimmed, non-empty, de-duplicated patterns in declaration order.
    ///
    /// The device name is not a pattern; [`Device::is_named_by`] matches it
    /// separately, so same-named devices of different skills can coexist.
    pub fn normalized_patterns(&self) -> Vec<String> {
        normalize_patterns(&self.patterns)
    }
}

/// Trim, drop empties and de-duplicate, keeping first occurrence order.
pub fn normalize_patterns(patterns: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for pattern in patterns {
        let pattern = pattern.trim();
        if !pattern.is_empty() && !out.iter().any(|p| p == pattern) {
            out.push(pattern.to_string());
        }
    }
    out
}

/// Partial update of a registered device; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub patterns: Option<Vec<String>>,
    pub device_attributes: Option<serde_json::Value>,
    /// `Some(None)` clears the room.
    pub room_id: Option<Option<Id>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_patterns_keep_only_declared_patterns() {
        let device = NewDevice::new("light", "Ceiling Light")
            .pattern(" ceiling light ")
            .pattern("ceiling light")
            .pattern("")
            .pattern("big lamp");
        assert_eq!(device.normalized_patterns(), vec!["ceiling light", "big lamp"]);
        assert!(NewDevice::new("light", "lamp").normalized_patterns().is_empty());
    }

    #[test]
    fn device_is_named_by_name_or_pattern() {
        let now = Utc::now();
        let device = Device {
            id: Id::new(),
            skill_id: Id::new(),
            device_type_id: Id::new(),
            device_type: "light".to_string(),
            name: "Desk Lamp".to_string(),
            patterns: vec!["reading light".to_string()],
            device_attributes: None,
            room_id: None,
            created_at: now,
            updated_at: now,
        };
        assert!(device.is_named_by("desk lamp"));
        assert!(device.is_named_by("Reading Light "));
        assert!(!device.is_named_by("lamp"));
        assert!(!device.is_named_by("  "));
    }
}
