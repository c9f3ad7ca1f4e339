//! MQTT transport on top of `rumqttc`.

use super::{BusError, Connector, InboundMessage, Publisher, Result, Session};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use skill_core::SkillConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    credentials: Option<(String, String)>,
}

impl MqttConnector {
    pub fn from_config(config: &SkillConfig) -> Self {
        let credentials = match (&config.mqtt_username, &config.mqtt_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            (Some(user), None) => Some((user.clone(), String::new())),
            _ => None,
        };
        Self {
            host: config.mqtt_server_host.clone(),
            port: config.mqtt_server_port,
            client_id: config.client_id.clone(),
            credentials,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user, password);
        }
        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self) -> Result<MqttSession> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        // Drive the event loop until the broker acknowledges the connection.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(BusError::Connect {
                        endpoint: self.endpoint(),
                        reason: format!("{:?}", ack.code),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(BusError::Connect {
                        endpoint: self.endpoint(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(MqttSession {
            client,
            eventloop,
            pending: VecDeque::new(),
        })
    }

    fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    /// Publishes that arrived while waiting for a SUBACK.
    pending: VecDeque<InboundMessage>,
}

impl MqttSession {
    /// Poll until the broker answers the subscribe just queued.
    async fn await_suback(&mut self) -> Result<SubAck> {
        let mut pkid = None;
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Subscribe(id))) => pkid = Some(id),
                Ok(Event::Incoming(Packet::SubAck(ack))) if pkid == Some(ack.pkid) => {
                    return Ok(ack);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.pending.push_back(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(BusError::ConnectionLost("broker sent disconnect".to_string()));
                }
                Ok(event) => debug!(?event, "mqtt event"),
                Err(e) => return Err(BusError::ConnectionLost(e.to_string())),
            }
        }
    }
}

/// Reject a SUBACK carrying any failure return code (0x80).
fn check_suback(topic: &str, ack: &SubAck) -> Result<()> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(BusError::Subscribe {
            topic: topic.to_string(),
            reason: "broker rejected the subscription".to_string(),
        });
    }
    Ok(())
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for MqttSession {
    /// Resolves once the broker has acknowledged the subscription.
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(SUBACK_TIMEOUT, self.await_suback()).await {
            Ok(ack) => check_suback(topic, &ack?),
            Err(_) => Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: format!("no SUBACK within {SUBACK_TIMEOUT:?}"),
            }),
        }
    }

    async fn recv(&mut self) -> Result<InboundMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(BusError::ConnectionLost("broker sent disconnect".to_string()));
                }
                Ok(event) => debug!(?event, "mqtt event"),
                Err(e) => return Err(BusError::ConnectionLost(e.to_string())),
            }
        }
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MqttPublisher {
            client: self.client.clone(),
        })
    }

    async fn disconnect(&mut self) {
        if self.client.disconnect().await.is_ok() {
            // Flush the disconnect packet; the poll error that follows is expected.
            let _ = tokio::time::timeout(Duration::from_secs(1), self.eventloop.poll()).await;
        }
    }
}

struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }
}
