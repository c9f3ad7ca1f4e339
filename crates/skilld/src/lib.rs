//! skilld - skill runtime for the voice assistant bus.
//!
//! [`SkillRuntime`] wires one [`Skill`] to the broker: it owns the single
//! receive loop, runs the certainty gate on every intent result, syncs the
//! device registry, and supervises all background work.

pub mod bus;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod skill;
pub mod storage;
pub mod supervisor;
pub mod switch;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bus::{BusClient, ConnectionManager, Connector, InboundMessage, PublishRetry};
use chrono::Utc;
use metrics::{MessageOutcome, MetricsCollector};
use parking_lot::Mutex;
use registry::DeviceRegistry;
use skill_core::cache::CacheError;
use skill_core::config::ConfigError;
use skill_core::gate::GateConfigError;
use skill_core::topic::TopicError;
use skill_core::{
    Admission, BoundedCache, CertaintyGate, Decision, IntentRequest, SkillConfig, SkillContext,
};
use storage::Storage;
use supervisor::Supervisor;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use skill::{Skill, SkillServices};

/// Errors that stop a skill from running. Everything else is contained
/// per message, per reconnect attempt or per background task.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid gate policy: {0}")]
    Gate(#[from] GateConfigError),
    #[error("invalid subscription: {0}")]
    Topic(#[from] TopicError),
    #[error("invalid intent cache: {0}")]
    Cache(#[from] CacheError),
    #[error("skill '{skill}' failed to prepare: {reason}")]
    Prepare { skill: String, reason: String },
    #[error("receive loop for skill '{skill}' stopped unexpectedly")]
    ReceiveLoopStopped { skill: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    IntentResult,
    DeviceUpdate,
    Skill,
}

/// Runs one skill against one broker until shut down.
pub struct SkillRuntime<C: Connector> {
    skill: Arc<dyn Skill>,
    config: Arc<SkillConfig>,
    connector: C,
    storage: Arc<Storage>,
    metrics: Arc<MetricsCollector>,
    supervisor: Supervisor,
    bus: BusClient,
}

impl<C: Connector> std::fmt::Debug for SkillRuntime<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRuntime")
            .field("skill", &self.skill.name())
            .field("endpoint", &self.connector.endpoint())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> SkillRuntime<C> {
    pub fn new(
        skill: Arc<dyn Skill>,
        config: SkillConfig,
        connector: C,
        storage: Arc<Storage>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new(skill.name()));
        let supervisor = Supervisor::new(Arc::clone(&metrics));
        let bus = BusClient::new(&config, PublishRetry::default(), Arc::clone(&metrics));
        Self {
            skill,
            config: Arc::new(config),
            connector,
            storage,
            metrics,
            supervisor,
            bus,
        }
    }

    pub fn with_publish_retry(mut self, retry: PublishRetry) -> Self {
        self.bus = BusClient::new(&self.config, retry, Arc::clone(&self.metrics));
        self
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn supervisor(&self) -> Supervisor {
        self.supervisor.clone()
    }

    pub fn bus(&self) -> BusClient {
        self.bus.clone()
    }

    /// Run until `shutdown` fires. Configuration problems (including a
    /// failing [`Skill::prepare`]) and a dead receive loop return an error;
    /// in the latter case every supervised task has been cancelled first.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RuntimeError> {
        let Self {
            skill,
            config,
            connector,
            storage,
            metrics,
            supervisor,
            bus,
        } = self;
        let name = skill.name().to_string();

        config.validate()?;
        let gate = CertaintyGate::new(skill.gate_policy(&config)?);
        for (intent, threshold) in gate.policy().supported_intents() {
            debug!(skill = %name, intent = %intent, threshold, "supported intent");
        }

        let registry = Arc::new(DeviceRegistry::new(
            storage,
            bus.clone(),
            name.clone(),
            skill.help_text().map(str::to_string),
            skill.device_types(),
        ));
        let services = SkillServices {
            config: Arc::clone(&config),
            bus: bus.clone(),
            supervisor: supervisor.clone(),
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
            requests: Arc::new(BoundedCache::new(config.intent_cache_size)?),
            context: Arc::new(Mutex::new(SkillContext::with_settings(
                name.clone(),
                config.context.clone(),
            ))),
        };

        let mut manager = ConnectionManager::new(
            connector,
            bus.clone(),
            config.retry_interval(),
            Arc::clone(&metrics),
        );
        manager.subscribe(&config.intent_analysis_result_topic(), Route::IntentResult)?;
        manager.subscribe(&config.device_update_topic(), Route::DeviceUpdate)?;
        for topic in skill.extra_topics() {
            manager.subscribe(&topic, Route::Skill)?;
        }

        let (ready_tx, ready_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher {
            skill: Arc::clone(&skill),
            gate,
            services: services.clone(),
            ready: ready_rx,
        });
        let tasks = supervisor.clone();
        let dispatch = move |route: Route, message: InboundMessage| {
            let dispatcher = Arc::clone(&dispatcher);
            let mut metadata = std::collections::HashMap::new();
            metadata.insert("topic".to_string(), message.topic.clone());
            tasks.spawn_with_metadata(route.task_name(), metadata, async move {
                dispatcher.dispatch(route, message).await;
                Ok::<(), Infallible>(())
            });
        };
        supervisor.spawn_critical("receive-loop", move |token| async move {
            manager.run(token, dispatch).await;
            Ok::<(), Infallible>(())
        });

        // Cancelled by the supervisor alone when the receive loop dies.
        let halted = supervisor.token();

        info!(skill = %name, "waiting for broker connection");
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!(skill = %name, "shutdown requested before connecting");
                supervisor.shutdown().await;
                return Ok(());
            }
            () = halted.cancelled() => return Err(loop_stopped(name, &supervisor).await),
            () = bus.wait_connected() => {}
        }

        match registry.sync_startup().await {
            Ok(()) => skill.on_devices_refreshed(&registry.devices()),
            Err(e) => {
                warn!(
                    skill = %name,
                    error = %e,
                    retry_in_secs = config.retry_interval_secs,
                    "device registry sync failed, retrying in background"
                );
                spawn_registry_retry(&supervisor, &registry, &skill, config.retry_interval());
            }
        }

        if let Err(e) = skill.prepare(&services).await {
            error!(skill = %name, error = %format!("{e:#}"), "skill failed to prepare");
            supervisor.shutdown().await;
            return Err(RuntimeError::Prepare {
                skill: name,
                reason: format!("{e:#}"),
            });
        }

        ready_tx.send_replace(true);
        info!(skill = %name, "skill ready");

        tokio::select! {
            biased;
            () = shutdown.cancelled() => {}
            () = halted.cancelled() => return Err(loop_stopped(name, &supervisor).await),
        }
        info!(skill = %name, active_tasks = supervisor.active_count(), "shutting down");
        supervisor.shutdown().await;
        info!(skill = %name, "skill stopped");
        Ok(())
    }
}

async fn loop_stopped(skill: String, supervisor: &Supervisor) -> RuntimeError {
    error!(skill = %skill, "receive loop stopped, shutting down");
    supervisor.shutdown().await;
    RuntimeError::ReceiveLoopStopped { skill }
}

fn spawn_registry_retry(
    supervisor: &Supervisor,
    registry: &Arc<DeviceRegistry>,
    skill: &Arc<dyn Skill>,
    interval: std::time::Duration,
) {
    let registry = Arc::clone(registry);
    let skill = Arc::clone(skill);
    supervisor.spawn("registry-sync", async move {
        let mut attempt: u32 = 1;
        loop {
            tokio::time::sleep(interval).await;
            attempt += 1;
            match registry.sync_startup().await {
                Ok(()) => {
                    info!(attempt, "device registry sync recovered");
                    skill.on_devices_refreshed(&registry.devices());
                    return Ok::<(), Infallible>(());
                }
                Err(e) => warn!(attempt, error = %e, "device registry sync failed"),
            }
        }
    });
}

impl Route {
    fn task_name(self) -> &'static str {
        match self {
            Self::IntentResult => "intent-result",
            Self::DeviceUpdate => "device-update",
            Self::Skill => "skill-message",
        }
    }
}

/// Per-message handling, run on a supervised task so the receive loop never
/// waits on skill logic.
struct Dispatcher {
    skill: Arc<dyn Skill>,
    gate: CertaintyGate,
    services: SkillServices,
    ready: watch::Receiver<bool>,
}

impl Dispatcher {
    async fn dispatch(&self, route: Route, message: InboundMessage) {
        let mut ready = self.ready.clone();
        if ready.wait_for(|ready| *ready).await.is_err() {
            return;
        }

        match route {
            Route::IntentResult => self.handle_intent(&message.payload).await,
            Route::DeviceUpdate => self.handle_device_update().await,
            Route::Skill => {
                if let Err(e) = self
                    .skill
                    .handle_message(&message.topic, &message.payload, &self.services)
                    .await
                {
                    self.services.metrics.record_error();
                    error!(
                        skill = self.skill.name(),
                        topic = %message.topic,
                        error = %format!("{e:#}"),
                        "message handler failed"
                    );
                }
            }
        }
    }

    async fn handle_intent(&self, payload: &[u8]) {
        let started = Instant::now();
        let skill = self.skill.name();
        let metrics = &self.services.metrics;

        let request = match IntentRequest::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                metrics.record_message(MessageOutcome::Invalid, None, None);
                warn!(skill, error = %e, bytes = payload.len(), "dropping invalid intent result");
                return;
            }
        };
        let intent = request.intent_type();
        let confidence = request.confidence();

        let decision = {
            let mut context = self.services.context.lock();
            if context.expire_if_stale_at(Utc::now()) {
                debug!(skill, "context expired");
            }
            self.skill.evaluate(&self.gate, &request, &context)
        };

        let acceptance = match decision {
            Decision::Accept(acceptance) => acceptance,
            Decision::Reject(reason) => {
                metrics.record_message(MessageOutcome::Rejected, Some(confidence), None);
                debug!(
                    skill,
                    intent = %intent,
                    confidence,
                    stage = ?reason.stage(),
                    reason = %reason,
                    "request rejected"
                );
                return;
            }
        };

        let cache = &self.services.requests;
        match cache.admit(request.id, request.clone()) {
            Admission::Present => {
                metrics.record_cache_lookup(true, cache.len());
                metrics.record_message(MessageOutcome::Duplicate, Some(confidence), None);
                debug!(skill, request_id = %request.id, "duplicate request ignored");
                return;
            }
            Admission::Inserted { evicted } => {
                metrics.record_cache_lookup(false, cache.len());
                if evicted.is_some() {
                    metrics.record_cache_eviction();
                }
            }
        }

        info!(
            skill,
            request_id = %request.id,
            intent = %intent,
            confidence,
            threshold = acceptance.effective_threshold,
            modifier_applied = acceptance.modifier_applied,
            "request accepted"
        );

        match self.skill.process_request(&request, &self.services).await {
            Ok(()) => {
                let entities = request.classified_intent.entity_values();
                {
                    let mut context = self.services.context.lock();
                    if acceptance.modifier_applied {
                        context.add_follow_up(intent.as_str(), entities);
                    } else {
                        context.add_action(intent.as_str(), entities);
                    }
                }
                let elapsed = Some(started.elapsed());
                metrics.record_message(MessageOutcome::Processed, Some(confidence), elapsed);
            }
            Err(e) => {
                let elapsed = Some(started.elapsed());
                metrics.record_message(MessageOutcome::Failed, Some(confidence), elapsed);
                error!(
                    skill,
                    request_id = %request.id,
                    intent = %intent,
                    text = %request.client_request.text,
                    error = %format!("{e:#}"),
                    "request processing failed"
                );
            }
        }
    }

    async fn handle_device_update(&self) {
        let registry = &self.services.registry;
        match registry.refresh().await {
            Ok(count) => {
                debug!(skill = self.skill.name(), devices = count, "device catalog reloaded");
                self.skill.on_devices_refreshed(&registry.devices());
            }
            Err(e) => warn!(skill = self.skill.name(), error = %e, "device catalog reload failed"),
        }
    }
}
