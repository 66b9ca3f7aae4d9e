//! Transport layer for the MQTT session.
//!
//! [`MqttTransport`] is the seam between the connection state machine and the
//! network: the rumqttc-backed [`RumqttTransport`] talks to a real broker over
//! mutual TLS, while [`MockTransport`] records calls for tests and dry runs.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::crypto::ClientIdentity;

pub mod mock;
pub mod rumqtt;
mod tls;

pub use mock::{MockCall, MockTransport};
pub use rumqtt::RumqttTransport;
pub use tls::{build_client_config, parse_mqtt_endpoint, MqttEndpoint, TrustPolicy, DEFAULT_MQTT_PORT};

/// Observable state of the single MQTT session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{0}")]
    NameResolution(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection refused by broker: {0}")]
    Refused(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("session not open")]
    NotConnected,
    #[error("message dropped")]
    MessageDropped,
    #[error("session closed")]
    Closed,
}

/// Asynchronous notifications from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker acknowledged the QoS 1 message with this id.
    Delivered(u16),
    /// An open session dropped without being asked to.
    ConnectionLost {
        session: u64,
        error: Option<TransportError>,
    },
}

/// Everything needed to open a mutual-TLS session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub identity: ClientIdentity,
    pub trust: TrustPolicy,
    pub keep_alive: Duration,
}

#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Open a session and resolve once the broker accepted it. Returns the session id.
    async fn open(&self, options: SessionOptions) -> Result<u64, TransportError>;

    /// Close the current session, if any.
    async fn close(&self) -> Result<(), TransportError>;

    /// Queue a QoS 1 publish and return its message id.
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<u16, TransportError>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
