//! The capability interface every skill implements.
//!
//! The runtime only ever talks to a skill through [`Skill`]; concrete skills
//! never see the receive loop, only the [`SkillServices`] handed to them.

use crate::bus::BusClient;
use crate::metrics::MetricsCollector;
use crate::registry::DeviceRegistry;
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use parking_lot::Mutex;
use skill_core::gate::GateConfigError;
use skill_core::{
    BoundedCache, CertaintyGate, Decision, Device, GatePolicy, IntentRequest, SkillConfig,
    SkillContext,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Handles shared between the runtime and a skill's business logic.
#[derive(Clone)]
pub struct SkillServices {
    pub config: Arc<SkillConfig>,
    pub bus: BusClient,
    pub supervisor: Supervisor,
    pub registry: Arc<DeviceRegistry>,
    pub metrics: Arc<MetricsCollector>,
    /// Recently accepted requests keyed by request id.
    pub requests: Arc<BoundedCache<Uuid, IntentRequest>>,
    pub context: Arc<Mutex<SkillContext>>,
}

impl std::fmt::Debug for SkillServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillServices")
            .field("skill", &self.registry.skill_name())
            .field("bus", &self.bus)
            .field("cached_requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Skill: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn help_text(&self) -> Option<&str> {
        None
    }

    /// Supported intents, modifiers and entity matchers. Built once at
    /// startup; an error here stops the skill from running.
    fn gate_policy(&self, config: &SkillConfig) -> Result<GatePolicy, GateConfigError>;

    /// Device types this skill owns in the registry.
    fn device_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Topics beyond the intent result and device update topics.
    fn extra_topics(&self) -> Vec<String> {
        Vec::new()
    }

    fn evaluate(
        &self,
        gate: &CertaintyGate,
        request: &IntentRequest,
        context: &SkillContext,
    ) -> Decision {
        gate.evaluate(request, context)
    }

    /// Runs once after the registry sync, before any request is dispatched.
    async fn prepare(&self, _services: &SkillServices) -> eyre::Result<()> {
        Ok(())
    }

    async fn process_request(
        &self,
        request: &IntentRequest,
        services: &SkillServices,
    ) -> eyre::Result<()>;

    /// Messages on [`extra_topics`](Self::extra_topics).
    async fn handle_message(
        &self,
        topic: &str,
        payload: &[u8],
        _services: &SkillServices,
    ) -> eyre::Result<()> {
        debug!(topic, bytes = payload.len(), skill = self.name(), "ignoring message");
        Ok(())
    }

    /// Called after the local device view was reloaded.
    fn on_devices_refreshed(&self, _devices: &[Device]) {}
}
