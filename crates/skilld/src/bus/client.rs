//! Outbound publish helpers shared by the runtime and skill logic.
//!
//! The connection manager attaches a fresh publisher after every successful
//! (re)connect and detaches it on loss; publishes issued in between fail
//! fast with `NotConnected` and go through the retry policy.

use super::{BusError, Publisher, Result};
use crate::metrics::MetricsCollector;
use parking_lot::RwLock;
use skill_core::{Alert, ClientRequest, Response, SkillConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Retry policy for a single logical publish.
#[derive(Debug, Clone)]
pub struct PublishRetry {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub max_backoff: Duration,
}

impl Default for PublishRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(5),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl PublishRetry {
    /// `min(2^attempt, max_backoff)` seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = 2u64.saturating_pow(attempt);
        Duration::from_secs(secs).min(self.max_backoff)
    }
}

#[derive(Debug)]
struct Topics {
    broadcast: String,
    feedback: String,
    device_update: String,
}

struct ClientInner {
    publisher: RwLock<Option<Arc<dyn Publisher>>>,
    connected: watch::Sender<bool>,
    topics: Topics,
    retry: PublishRetry,
    default_alert: Alert,
    metrics: Arc<MetricsCollector>,
}

/// Cheap-to-clone handle for publishing to the bus.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("connected", &self.is_connected())
            .field("topics", &self.inner.topics)
            .finish_non_exhaustive()
    }
}

impl BusClient {
    pub fn new(config: &SkillConfig, retry: PublishRetry, metrics: Arc<MetricsCollector>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                publisher: RwLock::new(None),
                connected,
                topics: Topics {
                    broadcast: config.broadcast_topic(),
                    feedback: config.feedback_topic(),
                    device_update: config.device_update_topic(),
                },
                retry,
                default_alert: Alert {
                    play_before: true,
                    ..Alert::default()
                },
                metrics,
            }),
        }
    }

    pub(crate) fn attach(&self, publisher: Arc<dyn Publisher>) {
        *self.inner.publisher.write() = Some(publisher);
        self.inner.connected.send_replace(true);
    }

    pub(crate) fn detach(&self) {
        *self.inner.publisher.write() = None;
        self.inner.connected.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Resolves once a broker session is attached.
    pub async fn wait_connected(&self) {
        let mut rx = self.inner.connected.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|connected| *connected).await;
    }

    pub fn device_update_topic(&self) -> &str {
        &self.inner.topics.device_update
    }

    /// One publish attempt bounded by the per-attempt timeout.
    pub async fn publish_once(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let publisher = self
            .inner
            .publisher
            .read()
            .clone()
            .ok_or(BusError::NotConnected)?;
        let timeout = self.inner.retry.attempt_timeout;
        match tokio::time::timeout(timeout, publisher.publish(topic, payload)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Publish with retry and backoff. Returns whether the payload went out.
    pub async fn publish_with_retry(&self, topic: &str, payload: Vec<u8>) -> bool {
        let retry = &self.inner.retry;
        let metrics = &self.inner.metrics;

        for attempt in 0..=retry.max_retries {
            let started = Instant::now();
            match self.publish_once(topic, payload.clone()).await {
                Ok(()) => {
                    metrics.record_publish(true, started.elapsed());
                    if attempt > 0 {
                        info!(topic, attempt = attempt + 1, "publish succeeded after retry");
                    } else {
                        debug!(topic, "published");
                    }
                    return true;
                }
                Err(e) => {
                    metrics.record_publish(false, started.elapsed());
                    if attempt == retry.max_retries {
                        metrics.record_error();
                        error!(
                            topic,
                            attempts = attempt + 1,
                            error_kind = e.kind(),
                            error = %e,
                            "giving up on publish"
                        );
                        break;
                    }
                    let backoff = retry.backoff(attempt);
                    warn!(
                        topic,
                        attempt = attempt + 1,
                        error_kind = e.kind(),
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "publish failed, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        false
    }

    async fn publish_response(&self, topic: &str, response: &Response) -> bool {
        match serde_json::to_vec(response) {
            Ok(payload) => self.publish_with_retry(topic, payload).await,
            Err(e) => {
                error!(
                    topic,
                    error_kind = "validation_error",
                    error = %e,
                    "failed to encode response"
                );
                false
            }
        }
    }

    /// Targeted response on `topic`.
    pub async fn send(&self, text: &str, topic: &str, alert: Option<Alert>) -> bool {
        self.publish_response(topic, &Response::new(text, alert)).await
    }

    /// Answer on the output topic of the originating client request.
    pub async fn reply(&self, text: &str, request: &ClientRequest, alert: Option<Alert>) -> bool {
        self.send(text, &request.output_topic, alert).await
    }

    /// Fan-out response on the broadcast topic.
    pub async fn broadcast(&self, text: &str, alert: Option<Alert>) -> bool {
        let topic = self.inner.topics.broadcast.clone();
        self.publish_response(&topic, &Response::new(text, alert)).await
    }

    /// Response preceded by an audio cue (the skill default unless given).
    pub async fn publish_with_alert(
        &self,
        text: &str,
        request: Option<&ClientRequest>,
        broadcast: bool,
        alert: Option<Alert>,
    ) -> Result<bool> {
        let alert = Some(alert.unwrap_or_else(|| self.inner.default_alert.clone()));
        match (broadcast, request) {
            (true, _) => Ok(self.broadcast(text, alert).await),
            (false, Some(request)) => Ok(self.reply(text, request, alert).await),
            (false, None) => Err(BusError::NoDestination),
        }
    }

    /// Plain-text status on the per-skill feedback topic.
    pub async fn send_feedback(&self, text: &str) -> bool {
        let topic = self.inner.topics.feedback.clone();
        self.publish_with_retry(&topic, text.as_bytes().to_vec()).await
    }

    /// Empty-payload notice telling every participant to reload the device catalog.
    pub async fn notify_device_update(&self) -> bool {
        let topic = self.inner.topics.device_update.clone();
        self.publish_with_retry(&topic, Vec::new()).await
    }
}
