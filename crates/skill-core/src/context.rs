//! Rolling record of a skill's most recent accepted action.
//!
//! The context never runs a timer: expiry is checked lazily by whoever reads
//! it (normally the certainty gate, right before evaluation). Every time-based
//! method has an `_at` variant taking an explicit `now` for deterministic
//! tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tunables for context tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub confidence_threshold_default: f64,
    /// Threshold suggested while a recent action is still in play.
    pub confidence_threshold_recent: f64,
    pub recency_window_seconds: u64,
    pub max_follow_up_commands: u32,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            confidence_threshold_default: 0.7,
            confidence_threshold_recent: 0.4,
            recency_window_seconds: 300,
            max_follow_up_commands: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkillContext {
    skill_name: String,
    last_action: Option<String>,
    last_executed_at: Option<DateTime<Utc>>,
    last_entities: HashMap<String, Vec<serde_json::Value>>,
    command_count_since_last: u32,
    settings: ContextSettings,
}

impl SkillContext {
    pub fn new(skill_name: impl Into<String>) -> Self {
        Self::with_settings(skill_name, ContextSettings::default())
    }

    pub fn with_settings(skill_name: impl Into<String>, settings: ContextSettings) -> Self {
        Self {
            skill_name: skill_name.into(),
            last_action: None,
            last_executed_at: None,
            last_entities: HashMap::new(),
            command_count_since_last: 0,
            settings,
        }
    }

    pub fn add_action(&mut self, label: &str, entities: HashMap<String, Vec<serde_json::Value>>) {
        self.add_action_at(label, entities, Utc::now());
    }

    /// Record `label` as the last action and reset the follow-up counter.
    pub fn add_action_at(
        &mut self,
        label: &str,
        entities: HashMap<String, Vec<serde_json::Value>>,
        now: DateTime<Utc>,
    ) {
        self.last_action = Some(label.to_string());
        self.last_executed_at = Some(now);
        self.last_entities = entities;
        self.command_count_since_last = 0;
    }

    pub fn add_follow_up(
        &mut self,
        label: &str,
        entities: HashMap<String, Vec<serde_json::Value>>,
    ) {
        self.add_follow_up_at(label, entities, Utc::now());
    }

    /// Record an action that continues the current conversation.
    ///
    /// Unlike [`add_action_at`](Self::add_action_at) the follow-up counter
    /// keeps growing, so a long chain of relaxed-threshold commands eventually
    /// expires the context.
    pub fn add_follow_up_at(
        &mut self,
        label: &str,
        entities: HashMap<String, Vec<serde_json::Value>>,
        now: DateTime<Utc>,
    ) {
        let count = self.command_count_since_last + 1;
        self.add_action_at(label, entities, now);
        self.command_count_since_last = count;
    }

    pub fn has_recent_intent(&self, label: &str, window_seconds: u64) -> bool {
        self.has_recent_intent_at(label, window_seconds, Utc::now())
    }

    /// True iff the last action is `label` and happened at most
    /// `window_seconds` before `now`.
    pub fn has_recent_intent_at(
        &self,
        label: &str,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> bool {
        if self.last_action.as_deref() != Some(label) {
            return false;
        }
        self.elapsed_seconds(now)
            .is_some_and(|elapsed| elapsed <= window_seconds as f64)
    }

    pub fn should_expire(&self) -> bool {
        self.should_expire_at(Utc::now())
    }

    pub fn should_expire_at(&self, now: DateTime<Utc>) -> bool {
        let stale = self
            .elapsed_seconds(now)
            .is_some_and(|elapsed| elapsed > self.settings.recency_window_seconds as f64);
        stale || self.command_count_since_last > self.settings.max_follow_up_commands
    }

    /// Reset to empty if expired. Returns whether a reset happened.
    pub fn expire_if_stale_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.should_expire_at(now) {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_action = None;
        self.last_executed_at = None;
        self.last_entities.clear();
        self.command_count_since_last = 0;
    }

    /// Threshold a skill may apply to ad-hoc follow-ups: relaxed while a
    /// recent action is still inside the recency window.
    pub fn suggested_threshold_at(&self, now: DateTime<Utc>) -> f64 {
        let recent = self
            .elapsed_seconds(now)
            .is_some_and(|elapsed| elapsed <= self.settings.recency_window_seconds as f64);
        if recent {
            self.settings.confidence_threshold_recent
        } else {
            self.settings.confidence_threshold_default
        }
    }

    pub fn skill_name(&self) -> &str {
        &self.skill_name
    }

    pub fn last_action(&self) -> Option<&str> {
        self.last_action.as_deref()
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.last_executed_at
    }

    pub fn last_entities(&self) -> &HashMap<String, Vec<serde_json::Value>> {
        &self.last_entities
    }

    pub fn command_count(&self) -> u32 {
        self.command_count_since_last
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Seconds since the last action; clock skew into the future counts as 0.
    fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_executed_at.map(|at| {
            let millis = (now - at).num_milliseconds().max(0);
            millis as f64 / 1000.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn empty_context_has_no_recent_intent() {
        let ctx = SkillContext::new("switch");
        assert!(!ctx.has_recent_intent_at("device.on", 300, base()));
        assert!(!ctx.should_expire_at(base()));
        assert_eq!(ctx.skill_name(), "switch");
    }

    #[test]
    fn recent_intent_respects_label_and_window() {
        let mut ctx = SkillContext::new("switch");
        ctx.add_action_at("device.on", HashMap::new(), base());

        let later = base() + Duration::seconds(10);
        assert!(ctx.has_recent_intent_at("device.on", 300, later));
        assert!(!ctx.has_recent_intent_at("device.off", 300, later));
        assert!(ctx.has_recent_intent_at("device.on", 300, base() + Duration::seconds(300)));
        assert!(!ctx.has_recent_intent_at("device.on", 300, base() + Duration::seconds(301)));
        assert!(ctx.has_recent_intent_at("device.on", 5, base() - Duration::seconds(2)));
    }

    #[test]
    fn expires_after_recency_window() {
        let mut ctx = SkillContext::new("switch");
        ctx.add_action_at("device.on", HashMap::new(), base());
        assert!(!ctx.should_expire_at(base() + Duration::seconds(300)));
        assert!(ctx.should_expire_at(base() + Duration::seconds(301)));
    }

    #[test]
    fn expires_when_follow_ups_exceed_limit() {
        let settings = ContextSettings {
            max_follow_up_commands: 2,
            ..ContextSettings::default()
        };
        let mut ctx = SkillContext::with_settings("switch", settings);
        ctx.add_action_at("device.on", HashMap::new(), base());
        ctx.add_follow_up_at("device.off", HashMap::new(), base());
        ctx.add_follow_up_at("device.on", HashMap::new(), base());
        assert_eq!(ctx.command_count(), 2);
        assert!(!ctx.should_expire_at(base()));

        ctx.add_follow_up_at("device.off", HashMap::new(), base());
        assert!(ctx.should_expire_at(base()));
        assert!(ctx.expire_if_stale_at(base()));
        assert_eq!(ctx.last_action(), None);
        assert_eq!(ctx.command_count(), 0);
    }

    #[test]
    fn add_action_resets_counter_and_overwrites_entities() {
        let mut ctx = SkillContext::new("switch");
        let mut entities = HashMap::new();
        entities.insert("device".to_string(), vec![serde_json::json!("lamp")]);
        ctx.add_action_at("device.on", entities, base());
        ctx.add_follow_up_at("device.off", HashMap::new(), base());
        assert_eq!(ctx.command_count(), 1);
        assert!(ctx.last_entities().is_empty());

        ctx.add_action_at("device.on", HashMap::new(), base());
        assert_eq!(ctx.command_count(), 0);
        assert_eq!(ctx.last_executed_at(), Some(base()));
    }

    #[test]
    fn suggested_threshold_relaxes_while_recent() {
        let mut ctx = SkillContext::new("switch");
        assert!((ctx.suggested_threshold_at(base()) - 0.7).abs() < f64::EPSILON);
        ctx.add_action_at("device.on", HashMap::new(), base());
        let recent = ctx.suggested_threshold_at(base() + Duration::seconds(30));
        let stale = ctx.suggested_threshold_at(base() + Duration::seconds(600));
        assert!((recent - 0.4).abs() < f64::EPSILON);
        assert!((stale - 0.7).abs() < f64::EPSILON);
    }
}
