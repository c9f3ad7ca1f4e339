//! Message bus abstraction.
//!
//! The runtime talks to the broker only through [`Connector`], [`Session`]
//! and [`Publisher`]. [`mqtt`] implements them on top of `rumqttc`; [`memory`]
//! is an in-process broker for tests.

mod client;
mod connection;
pub mod memory;
pub mod mqtt;

pub use client::{BusClient, PublishRetry};
pub use connection::ConnectionManager;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("not connected to broker")]
    NotConnected,
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("a client request or broadcast is required to publish a response")]
    NoDestination,
}

impl BusError {
    /// Category used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } | Self::ConnectionLost(_) | Self::NotConnected => {
                "connection_lost"
            }
            Self::Subscribe { .. } | Self::Publish(_) => "publish_failed",
            Self::Timeout(_) => "timeout",
            Self::Serialization(_) | Self::NoDestination => "validation_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Opens broker sessions. Called again for every reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session>;

    /// Human-readable broker address for logs.
    fn endpoint(&self) -> String;
}

/// One live broker connection.
///
/// A session is owned by exactly one receive loop; only its [`Publisher`]
/// is shared.
#[async_trait]
pub trait Session: Send + 'static {
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Next inbound message. An error means the connection is gone.
    async fn recv(&mut self) -> Result<InboundMessage>;

    fn publisher(&self) -> Arc<dyn Publisher>;

    async fn disconnect(&mut self);
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}
