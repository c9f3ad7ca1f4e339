//! In-process broker used by tests and local experiments.
//!
//! Delivery follows broker semantics closely enough to exercise the runtime:
//! a session only receives messages published after it subscribed, messages
//! published while nobody is subscribed are lost, and dropping connections
//! ends every session's receive stream. The broker keeps the last
//! [`PUBLISHED_LOG_CAPACITY`] published messages for inspection.

use super::{BusError, Connector, InboundMessage, Publisher, Result, Session};
use async_trait::async_trait;
use parking_lot::Mutex;
use skill_core::TopicPattern;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const PUBLISHED_LOG_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct SessionEntry {
    patterns: Vec<TopicPattern>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    sessions: HashMap<u64, SessionEntry>,
    next_session: u64,
    connect_attempts: u32,
    refuse_connects: u32,
    fail_publishes: u32,
    refused_subscriptions: HashSet<String>,
    published: VecDeque<InboundMessage>,
}

impl BrokerState {
    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        if self.published.len() == PUBLISHED_LOG_CAPACITY {
            self.published.pop_front();
        }
        self.published.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        for entry in self.sessions.values() {
            if entry.patterns.iter().any(|p| p.matches(topic)) {
                let _ = entry.tx.send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Publish from outside any session, e.g. as the intent engine.
    pub fn publish(&self, topic: &str, payload: impl AsRef<[u8]>) {
        self.state.lock().deliver(topic, payload.as_ref());
    }

    /// End every live session, as if the broker went away.
    pub fn drop_connections(&self) {
        self.state.lock().sessions.clear();
    }

    pub fn refuse_next_connects(&self, count: u32) {
        self.state.lock().refuse_connects = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().fail_publishes = count;
    }

    /// Answer every subscription to exactly `pattern` with a failure.
    pub fn refuse_subscriptions(&self, pattern: &str) {
        self.state.lock().refused_subscriptions.insert(pattern.to_string());
    }

    pub fn accept_subscriptions(&self) {
        self.state.lock().refused_subscriptions.clear();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Patterns subscribed by all live sessions.
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut patterns: Vec<String> = state
            .sessions
            .values()
            .flat_map(|entry| entry.patterns.iter().map(|p| p.as_str().to_string()))
            .collect();
        patterns.sort();
        patterns
    }

    /// Most recent published messages, oldest first.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.state.lock().published.iter().cloned().collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession> {
        let mut state = self.broker.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BusError::Connect {
                endpoint: self.endpoint(),
                reason: "connection refused".to_string(),
            });
        }

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            SessionEntry {
                patterns: Vec::new(),
                tx,
            },
        );
        Ok(MemorySession {
            id,
            broker: self.broker.clone(),
            rx,
        })
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    broker: MemoryBroker,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl Session for MemorySession {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let pattern = TopicPattern::parse(topic).map_err(|e| BusError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let mut state = self.broker.state.lock();
        if state.refused_subscriptions.contains(topic) {
            return Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: "refused by broker".to_string(),
            });
        }
        let entry = state
            .sessions
            .get_mut(&self.id)
            .ok_or_else(|| BusError::ConnectionLost("session closed".to_string()))?;
        entry.patterns.push(pattern);
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundMessage> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BusError::ConnectionLost("broker dropped the connection".to_string()))
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MemoryPublisher {
            id: self.id,
            broker: self.broker.clone(),
        })
    }

    async fn disconnect(&mut self) {
        self.broker.state.lock().sessions.remove(&self.id);
    }
}

#[derive(Debug)]
struct MemoryPublisher {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(BusError::NotConnected);
        }
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BusError::Publish("injected failure".to_string()));
        }
        state.deliver(topic, &payload);
        Ok(())
    }
}
