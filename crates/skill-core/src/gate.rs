//! Per-skill accept/reject decision for incoming intent requests.
//!
//! Evaluation runs in three stages, cheapest first:
//!
//! 1. intent type must be in the supported set (single map lookup);
//! 2. confidence must reach the effective threshold, which applicable
//!    confidence modifiers may lower but never raise;
//! 3. if entity matchers are declared, at least one must accept.
//!
//! A [`GatePolicy`] is validated once by [`GatePolicyBuilder::build`] and is
//! immutable afterwards.

use crate::context::SkillContext;
use crate::types::{Entity, IntentRequest, IntentType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GateConfigError {
    #[error("threshold {threshold} for {intent} is outside [0, 1]")]
    ThresholdOutOfRange { intent: IntentType, threshold: f64 },
    #[error("modifier for {target} lowers to {reduced}, which is outside [0, 1]")]
    ModifierOutOfRange { target: IntentType, reduced: f64 },
    #[error("modifier for {target} would raise the threshold ({reduced} > base {base})")]
    ModifierRaisesThreshold {
        target: IntentType,
        reduced: f64,
        base: f64,
    },
    #[error("modifier targets unsupported intent {0}")]
    ModifierTargetUnsupported(IntentType),
    #[error("modifier for {0} has a zero time window")]
    ZeroTimeWindow(IntentType),
}

pub type Result<T> = std::result::Result<T, GateConfigError>;

/// Temporarily lowers the threshold of `lowers_threshold_for` while
/// `trigger_intent` is the skill's recent action.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceModifier {
    pub trigger_intent: IntentType,
    pub lowers_threshold_for: IntentType,
    pub reduced_threshold: f64,
    pub time_window_seconds: u64,
}

impl ConfidenceModifier {
    pub const DEFAULT_WINDOW_SECONDS: u64 = 300;

    pub fn new(
        trigger_intent: IntentType,
        lowers_threshold_for: IntentType,
        reduced_threshold: f64,
    ) -> Self {
        Self {
            trigger_intent,
            lowers_threshold_for,
            reduced_threshold,
            time_window_seconds: Self::DEFAULT_WINDOW_SECONDS,
        }
    }

    pub fn within(mut self, seconds: u64) -> Self {
        self.time_window_seconds = seconds;
        self
    }
}

pub type EntityPredicate = Arc<dyn Fn(&[Entity]) -> bool + Send + Sync>;

/// Predicate over the entity list stored under one key.
#[derive(Clone)]
pub struct EntityMatcher {
    key: String,
    predicate: EntityPredicate,
}

impl EntityMatcher {
    pub fn new<F>(key: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&[Entity]) -> bool + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Accepts when any entity under `key` has a value containing one of
    /// `needles` (case-insensitive).
    pub fn contains_any(key: impl Into<String>, needles: &[&str]) -> Self {
        let needles: Vec<String> = needles.iter().map(|n| n.to_lowercase()).collect();
        Self::new(key, move |entities| {
            entities.iter().any(|entity| {
                let value = entity.value_text().to_lowercase();
                needles.iter().any(|needle| value.contains(needle.as_str()))
            })
        })
    }

    /// Accepts when at least one entity exists under `key`.
    pub fn non_empty(key: impl Into<String>) -> Self {
        Self::new(key, |entities| !entities.is_empty())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn accepts(&self, entities: &[Entity]) -> bool {
        (self.predicate)(entities)
    }
}

impl std::fmt::Debug for EntityMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMatcher")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Immutable acceptance rules for one skill.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    supported: HashMap<IntentType, f64>,
    modifiers: HashMap<IntentType, Vec<ConfidenceModifier>>,
    entity_matchers: Vec<EntityMatcher>,
}

impl GatePolicy {
    pub fn builder() -> GatePolicyBuilder {
        GatePolicyBuilder::default()
    }

    pub fn threshold(&self, intent: IntentType) -> Option<f64> {
        self.supported.get(&intent).copied()
    }

    pub fn supports(&self, intent: IntentType) -> bool {
        self.supported.contains_key(&intent)
    }

    pub fn supported_intents(&self) -> impl Iterator<Item = (IntentType, f64)> + '_ {
        self.supported.iter().map(|(intent, threshold)| (*intent, *threshold))
    }

    pub fn modifiers_for(&self, intent: IntentType) -> &[ConfidenceModifier] {
        self.modifiers
            .get(&intent)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn entity_matchers(&self) -> &[EntityMatcher] {
        &self.entity_matchers
    }
}

#[derive(Debug, Default)]
pub struct GatePolicyBuilder {
    supported: HashMap<IntentType, f64>,
    modifiers: Vec<ConfidenceModifier>,
    entity_matchers: Vec<EntityMatcher>,
}

impl GatePolicyBuilder {
    pub fn support(mut self, intent: IntentType, threshold: f64) -> Self {
        self.supported.insert(intent, threshold);
        self
    }

    pub fn modifier(mut self, modifier: ConfidenceModifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn entity_matcher(mut self, matcher: EntityMatcher) -> Self {
        self.entity_matchers.push(matcher);
        self
    }

    pub fn build(self) -> Result<GatePolicy> {
        for (&intent, &threshold) in &self.supported {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(GateConfigError::ThresholdOutOfRange { intent, threshold });
            }
        }

        let mut modifiers: HashMap<IntentType, Vec<ConfidenceModifier>> = HashMap::new();
        for modifier in self.modifiers {
            let target = modifier.lowers_threshold_for;
            let reduced = modifier.reduced_threshold;
            if !(0.0..=1.0).contains(&reduced) {
                return Err(GateConfigError::ModifierOutOfRange { target, reduced });
            }
            if modifier.time_window_seconds == 0 {
                return Err(GateConfigError::ZeroTimeWindow(target));
            }
            let Some(&base) = self.supported.get(&target) else {
                return Err(GateConfigError::ModifierTargetUnsupported(target));
            };
            if reduced > base {
                return Err(GateConfigError::ModifierRaisesThreshold {
                    target,
                    reduced,
                    base,
                });
            }
            modifiers.entry(target).or_default().push(modifier);
        }

        Ok(GatePolicy {
            supported: self.supported,
            modifiers,
            entity_matchers: self.entity_matchers,
        })
    }
}

/// Stage at which a request left the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    FilteredByType,
    ThresholdChecked,
    EntityChecked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    UnsupportedIntent(IntentType),
    BelowThreshold { confidence: f64, threshold: f64 },
    EntityMismatch,
}

impl Rejection {
    pub fn stage(&self) -> GateStage {
        match self {
            Self::UnsupportedIntent(_) => GateStage::FilteredByType,
            Self::BelowThreshold { .. } => GateStage::ThresholdChecked,
            Self::EntityMismatch => GateStage::EntityChecked,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedIntent(intent) => write!(f, "unsupported intent {intent}"),
            Self::BelowThreshold {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence:.2} below threshold {threshold:.2}"),
            Self::EntityMismatch => f.write_str("no entity matcher accepted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub intent_type: IntentType,
    pub confidence: f64,
    pub base_threshold: f64,
    pub effective_threshold: f64,
    /// True when a confidence modifier relaxed the threshold.
    pub modifier_applied: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept(Acceptance),
    Reject(Rejection),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

#[derive(Debug, Clone)]
pub struct CertaintyGate {
    policy: GatePolicy,
}

impl CertaintyGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn evaluate(&self, request: &IntentRequest, context: &SkillContext) -> Decision {
        self.evaluate_at(request, context, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        request: &IntentRequest,
        context: &SkillContext,
        now: DateTime<Utc>,
    ) -> Decision {
        let intent = &request.classified_intent;

        let Some(base) = self.policy.threshold(intent.intent_type) else {
            return Decision::Reject(Rejection::UnsupportedIntent(intent.intent_type));
        };

        let (effective, modifier_applied) =
            self.effective_threshold_at(intent.intent_type, base, context, now);
        if intent.confidence < effective {
            return Decision::Reject(Rejection::BelowThreshold {
                confidence: intent.confidence,
                threshold: effective,
            });
        }

        let matchers = self.policy.entity_matchers();
        if !matchers.is_empty()
            && !matchers
                .iter()
                .any(|matcher| matcher.accepts(intent.entities_of(matcher.key())))
        {
            return Decision::Reject(Rejection::EntityMismatch);
        }

        Decision::Accept(Acceptance {
            intent_type: intent.intent_type,
            confidence: intent.confidence,
            base_threshold: base,
            effective_threshold: effective,
            modifier_applied,
        })
    }

    fn effective_threshold_at(
        &self,
        intent: IntentType,
        base: f64,
        context: &SkillContext,
        now: DateTime<Utc>,
    ) -> (f64, bool) {
        self.policy
            .modifiers_for(intent)
            .iter()
            .filter(|m| {
                context.has_recent_intent_at(m.trigger_intent.as_str(), m.time_window_seconds, now)
            })
            .fold((base, false), |(effective, _), m| {
                (effective.min(m.reduced_threshold), true)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{fixtures, EntityType};
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn switch_gate() -> CertaintyGate {
        let policy = GatePolicy::builder()
            .support(IntentType::DeviceOn, 0.8)
            .support(IntentType::DeviceOff, 0.8)
            .modifier(ConfidenceModifier::new(IntentType::DeviceOn, IntentType::DeviceOff, 0.5))
            .build()
            .unwrap();
        CertaintyGate::new(policy)
    }

    fn context_with(label: &str, seconds_ago: i64) -> SkillContext {
        let mut ctx = SkillContext::new("switch");
        ctx.add_action_at(label, HashMap::new(), now() - Duration::seconds(seconds_ago));
        ctx
    }

    #[test]
    fn accepts_with_recent_trigger() {
        let gate = switch_gate();
        let ctx = context_with("device.on", 10);
        let request = fixtures::request(IntentType::DeviceOff, 0.6);

        match gate.evaluate_at(&request, &ctx, now()) {
            Decision::Accept(acceptance) => {
                assert!(acceptance.modifier_applied);
                assert!((acceptance.effective_threshold - 0.5).abs() < f64::EPSILON);
                assert!((acceptance.base_threshold - 0.8).abs() < f64::EPSILON);
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[test]
    fn rejects_when_trigger_is_stale() {
        let gate = switch_gate();
        let ctx = context_with("device.on", 400);
        let request = fixtures::request(IntentType::DeviceOff, 0.6);

        let decision = gate.evaluate_at(&request, &ctx, now());
        assert_eq!(
            decision,
            Decision::Reject(Rejection::BelowThreshold {
                confidence: 0.6,
                threshold: 0.8
            })
        );
    }

    #[test]
    fn accepts_at_exact_threshold() {
        let gate = switch_gate();
        let ctx = SkillContext::new("switch");
        let request = fixtures::request(IntentType::DeviceOn, 0.8);
        assert!(gate.evaluate_at(&request, &ctx, now()).is_accepted());
    }

    #[test]
    fn multiple_modifiers_take_minimum() {
        let policy = GatePolicy::builder()
            .support(IntentType::DeviceOff, 0.9)
            .modifier(ConfidenceModifier::new(IntentType::DeviceOn, IntentType::DeviceOff, 0.6))
            .modifier(
                ConfidenceModifier::new(IntentType::DeviceOn, IntentType::DeviceOff, 0.3)
                    .within(60),
            )
            .modifier(ConfidenceModifier::new(IntentType::MediaPlay, IntentType::DeviceOff, 0.1))
            .build()
            .unwrap();
        let gate = CertaintyGate::new(policy);

        let ctx = context_with("device.on", 30);
        let request = fixtures::request(IntentType::DeviceOff, 0.35);
        match gate.evaluate_at(&request, &ctx, now()) {
            Decision::Accept(a) => assert!((a.effective_threshold - 0.3).abs() < f64::EPSILON),
            other => panic!("expected accept, got {other:?}"),
        }

        // Outside the 60s window only the 0.6 modifier applies.
        let ctx = context_with("device.on", 120);
        assert!(!gate.evaluate_at(&request, &ctx, now()).is_accepted());
    }

    #[test]
    fn effective_threshold_never_exceeds_base() {
        let gate = switch_gate();
        for seconds_ago in [0, 10, 299, 300, 301, 10_000] {
            for label in ["device.on", "device.off", "media.play"] {
                let ctx = context_with(label, seconds_ago);
                let (effective, _) =
                    gate.effective_threshold_at(IntentType::DeviceOff, 0.8, &ctx, now());
                assert!(effective <= 0.8);
            }
        }
    }

    #[test]
    fn unsupported_intent_rejected_before_other_checks() {
        let matcher_called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&matcher_called);
        let policy = GatePolicy::builder()
            .support(IntentType::DeviceOff, 0.8)
            .modifier(ConfidenceModifier::new(IntentType::DeviceOn, IntentType::DeviceOff, 0.0))
            .entity_matcher(EntityMatcher::new("device", move |_| {
                flag.store(true, Ordering::SeqCst);
                true
            }))
            .build()
            .unwrap();
        let gate = CertaintyGate::new(policy);
        let ctx = context_with("device.on", 1);
        let request = fixtures::request(IntentType::MediaPlay, 1.0);

        let decision = gate.evaluate_at(&request, &ctx, now());
        assert_eq!(
            decision,
            Decision::Reject(Rejection::UnsupportedIntent(IntentType::MediaPlay))
        );
        assert!(!matcher_called.load(Ordering::SeqCst));
        if let Decision::Reject(rejection) = decision {
            assert_eq!(rejection.stage(), GateStage::FilteredByType);
        }
    }

    #[test]
    fn entity_mismatch_rejects() {
        let policy = GatePolicy::builder()
            .support(IntentType::DeviceOn, 0.5)
            .entity_matcher(EntityMatcher::contains_any("devices", &["light"]))
            .build()
            .unwrap();
        let gate = CertaintyGate::new(policy);
        let mut request = fixtures::request(IntentType::DeviceOn, 0.9);
        request.classified_intent.entities.insert(
            "rooms".to_string(),
            vec![Entity::new(EntityType::Room, "kitchen", "kitchen")],
        );

        let decision = gate.evaluate_at(&request, &SkillContext::new("switch"), now());
        assert_eq!(decision, Decision::Reject(Rejection::EntityMismatch));

        request.classified_intent.entities.insert(
            "devices".to_string(),
            vec![Entity::new(EntityType::Device, "Lights", "ceiling light")],
        );
        assert!(gate
            .evaluate_at(&request, &SkillContext::new("switch"), now())
            .is_accepted());
    }

    #[test]
    fn entity_matchers_stop_at_first_acceptance() {
        let second_called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&second_called);
        let policy = GatePolicy::builder()
            .support(IntentType::DeviceOn, 0.5)
            .entity_matcher(EntityMatcher::new("anything", |_| true))
            .entity_matcher(EntityMatcher::new("device", move |_| {
                flag.store(true, Ordering::SeqCst);
                false
            }))
            .build()
            .unwrap();
        let gate = CertaintyGate::new(policy);
        let request = fixtures::request(IntentType::DeviceOn, 0.9);
        assert!(gate
            .evaluate_at(&request, &SkillContext::new("switch"), now())
            .is_accepted());
        assert!(!second_called.load(Ordering::SeqCst));
    }

    #[test]
    fn build_rejects_invalid_policies() {
        let raising = GatePolicy::builder()
            .support(IntentType::DeviceOff, 0.5)
            .modifier(ConfidenceModifier::new(IntentType::DeviceOn, IntentType::DeviceOff, 0.7))
            .build();
        assert!(matches!(
            raising,
            Err(GateConfigError::ModifierRaisesThreshold { .. })
        ));

        let unsupported = GatePolicy::builder()
            .support(IntentType::DeviceOn, 0.5)
            .modifier(ConfidenceModifier::new(IntentType::DeviceOn, IntentType::DeviceOff, 0.3))
            .build();
        assert_eq!(
            unsupported.unwrap_err(),
            GateConfigError::ModifierTargetUnsupported(IntentType::DeviceOff)
        );

        let zero_window = GatePolicy::builder()
            .support(IntentType::DeviceOff, 0.5)
            .modifier(
                ConfidenceModifier::new(IntentType::DeviceOn, IntentType::DeviceOff, 0.3).within(0),
            )
            .build();
        assert_eq!(
            zero_window.unwrap_err(),
            GateConfigError::ZeroTimeWindow(IntentType::DeviceOff)
        );

        let out_of_range = GatePolicy::builder().support(IntentType::DeviceOn, 1.2).build();
        assert!(matches!(
            out_of_range,
            Err(GateConfigError::ThresholdOutOfRange { .. })
        ));
    }
}
