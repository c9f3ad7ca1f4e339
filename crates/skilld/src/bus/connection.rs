//! Broker connection lifecycle and the single inbound receive loop.
//!
//! [`ConnectionManager::run`] consumes the manager, and the session it opens
//! never leaves that call, so a second receive loop over the same
//! subscriptions cannot be started.

use super::{BusClient, BusError, Connector, InboundMessage, Session};
use crate::metrics::MetricsCollector;
use skill_core::topic::{self, TopicRouter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ConnectionManager<C: Connector, R> {
    connector: C,
    router: TopicRouter<R>,
    client: BusClient,
    retry_interval: Duration,
    metrics: Arc<MetricsCollector>,
}

impl<C: Connector, R> std::fmt::Debug for ConnectionManager<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.connector.endpoint())
            .field(
                "topics",
                &self.router.patterns().map(|p| p.as_str()).collect::<Vec<_>>(),
            )
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

impl<C, R> ConnectionManager<C, R>
where
    C: Connector,
    R: Clone + Send + Sync,
{
    pub fn new(
        connector: C,
        client: BusClient,
        retry_interval: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            connector,
            router: TopicRouter::new(),
            client,
            retry_interval,
            metrics,
        }
    }

    /// Register a subscription and the route its messages dispatch to.
    ///
    /// Routes are matched in registration order.
    pub fn subscribe(&mut self, pattern: &str, route: R) -> topic::Result<()> {
        self.router.add(pattern, route)
    }

    pub fn topics(&self) -> Vec<String> {
        self.router.patterns().map(|p| p.as_str().to_string()).collect()
    }

    /// Connect, subscribe and dispatch until `cancel` fires.
    ///
    /// Connection failures and losses are retried every `retry_interval`
    /// without limit. `dispatch` runs on the receive loop, so it must hand
    /// real work off rather than await it.
    pub async fn run<F>(self, cancel: CancellationToken, mut dispatch: F)
    where
        F: FnMut(R, InboundMessage) + Send,
    {
        let endpoint = self.connector.endpoint();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            info!(endpoint = %endpoint, attempt, "connecting to broker");

            let established = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.establish() => result,
            };

            let mut session = match established {
                Ok(session) => session,
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        error = %e,
                        retry_in_secs = self.retry_interval.as_secs_f64(),
                        "connection attempt failed"
                    );
                    if self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            info!(endpoint = %endpoint, attempt, topics = self.router.len(), "connected to broker");
            attempt = 0;

            let lost = tokio::select! {
                () = cancel.cancelled() => None,
                error = self.pump(&mut session, &mut dispatch) => Some(error),
            };
            self.client.detach();

            match lost {
                None => {
                    session.disconnect().await;
                    break;
                }
                Some(e) => {
                    self.metrics.record_reconnection();
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        retry_in_secs = self.retry_interval.as_secs_f64(),
                        "connection lost, reconnecting"
                    );
                    if self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.client.detach();
        info!(endpoint = %endpoint, "receive loop stopped");
    }

    /// Open a session and restore every subscription before exposing it.
    ///
    /// A refused subscription closes the session and counts as a failed
    /// connection attempt.
    async fn establish(&self) -> Result<C::Session, BusError> {
        let mut session = self.connector.connect().await?;
        for pattern in self.router.patterns() {
            if let Err(e) = session.subscribe(pattern.as_str()).await {
                session.disconnect().await;
                return Err(e);
            }
            info!(topic = %pattern, "subscribed");
        }
        self.client.attach(session.publisher());
        Ok(session)
    }

    async fn pump<F>(&self, session: &mut C::Session, dispatch: &mut F) -> BusError
    where
        F: FnMut(R, InboundMessage) + Send,
    {
        loop {
            let message = match session.recv().await {
                Ok(message) => message,
                Err(e) => return e,
            };
            match self.router.route(&message.topic) {
                Some(route) => dispatch(route.clone(), message),
                None => debug!(topic = %message.topic, "no route for message"),
            }
        }
    }

    /// Sleep for the retry interval. Returns true if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(self.retry_interval) => false,
        }
    }
}
