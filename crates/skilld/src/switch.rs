//! Reference skill: switches registered lights on and off.
//!
//! "turn on the desk lamp" followed by "turn it off" works because the
//! off intent gets a relaxed threshold right after an on (and vice versa),
//! and the device falls back to the one named in the previous command.

use crate::skill::{Skill, SkillServices};
use async_trait::async_trait;
use parking_lot::Mutex;
use skill_core::gate::GateConfigError;
use skill_core::{
    ConfidenceModifier, Device, EntityType, GatePolicy, IntentRequest, IntentType, NewDevice,
    SkillConfig,
};
use std::collections::HashMap;
use tracing::{debug, info};

pub const DEVICE_TYPE: &str = "light";

/// Threshold for a toggle that directly follows the opposite toggle.
const FOLLOW_UP_THRESHOLD: f64 = 0.5;

#[derive(Debug)]
pub struct SwitchSkill {
    name: String,
    devices: Vec<NewDevice>,
    /// On/off state by device id.
    states: Mutex<HashMap<String, bool>>,
}

impl SwitchSkill {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            devices: Vec::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Devices to register during [`Skill::prepare`].
    pub fn with_devices(mut self, devices: Vec<NewDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn is_on(&self, device: &Device) -> bool {
        self.states.lock().get(&device.id.0).copied().unwrap_or(false)
    }

    fn target(&self, request: &IntentRequest, services: &SkillServices) -> Option<Device> {
        let key = EntityType::Device.as_str();
        let named = request
            .classified_intent
            .entities_of(key)
            .iter()
            .find_map(|entity| services.registry.find_device(&entity.value_text()));
        if named.is_some() {
            return named;
        }

        // "turn it off": reuse the device from the previous command.
        let previous: Vec<String> = services
            .context
            .lock()
            .last_entities()
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        previous.iter().find_map(|name| services.registry.find_device(name))
    }
}

#[async_trait]
impl Skill for SwitchSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn help_text(&self) -> Option<&str> {
        Some("Turns lights on and off, e.g. \"turn on the desk lamp\".")
    }

    fn gate_policy(&self, config: &SkillConfig) -> Result<GatePolicy, GateConfigError> {
        let base = config.certainty_threshold;
        let follow_up = FOLLOW_UP_THRESHOLD.min(base);
        let (on, off) = (IntentType::DeviceOn, IntentType::DeviceOff);
        GatePolicy::builder()
            .support(on, base)
            .support(off, base)
            .modifier(ConfidenceModifier::new(on, off, follow_up))
            .modifier(ConfidenceModifier::new(off, on, follow_up))
            .build()
    }

    fn device_types(&self) -> Vec<String> {
        vec![DEVICE_TYPE.to_string()]
    }

    async fn prepare(&self, services: &SkillServices) -> eyre::Result<()> {
        for device in &self.devices {
            services.registry.register_device(device).await?;
        }
        info!(
            skill = %self.name,
            devices = services.registry.devices().len(),
            "switch prepared"
        );
        Ok(())
    }

    async fn process_request(
        &self,
        request: &IntentRequest,
        services: &SkillServices,
    ) -> eyre::Result<()> {
        let on = match request.intent_type() {
            IntentType::DeviceOn => true,
            IntentType::DeviceOff => false,
            other => eyre::bail!("switch cannot handle {other}"),
        };

        let Some(device) = self.target(request, services) else {
            debug!(text = %request.client_request.text, "no known device in request");
            services
                .bus
                .reply("Which device do you mean?", &request.client_request, None)
                .await;
            return Ok(());
        };

        self.states.lock().insert(device.id.0.clone(), on);
        info!(device = %device.name, on, "switched device");

        let text = format!("Turned {} the {}.", if on { "on" } else { "off" }, device.name);
        services.bus.reply(&text, &request.client_request, None).await;
        Ok(())
    }

    fn on_devices_refreshed(&self, devices: &[Device]) {
        let mut states = self.states.lock();
        states.retain(|id, _| devices.iter().any(|d| d.id.0 == *id));
        debug!(skill = %self.name, devices = devices.len(), "device list refreshed");
    }
}
