//! Publish requests on top of the connection controller.
//!
//! Applies the `%T` timestamp template, classifies failures into "fix your
//! settings" and transient kinds, and holds transient results back until a
//! minimum busy interval has passed so feedback is always perceptible.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::connection::{ConnectError, ConnectionController, PublishError};
use crate::crypto::{EncrypterError, TimestampEncrypter};
use crate::transport::TransportError;

/// Placeholder replaced by an encrypted timestamp block.
pub const TIMESTAMP_PLACEHOLDER: &str = "%T";

/// Shortest time a publish keeps the busy indicator up before reporting a transient result.
pub const MIN_BUSY_INTERVAL: Duration = Duration::from_secs(2);

const NAME_RESOLUTION_MESSAGE: &str = "hostname nor servname provided, or not known";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Encrypt(#[from] EncrypterError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl DispatchError {
    /// Short human-readable text for alerts.
    pub fn user_message(&self) -> String {
        match self {
            Self::Encrypt(e) => e.to_string(),
            Self::Publish(PublishError::ClientNotConnected(Some(cause))) => {
                format!("client not connected: {}", connect_error_message(cause))
            }
            Self::Publish(PublishError::Transport(e)) => transport_message(e),
            Self::Publish(e) => e.to_string(),
        }
    }
}

/// Short human-readable text for a failed connect.
pub fn connect_error_message(error: &ConnectError) -> String {
    match error {
        ConnectError::Transport(e) => transport_message(e),
        ConnectError::RootCertificate(e) => e.to_string(),
        other => other.to_string(),
    }
}

fn transport_message(error: &TransportError) -> String {
    match error {
        TransportError::NameResolution(_) => NAME_RESOLUTION_MESSAGE.to_string(),
        other => other.to_string(),
    }
}

/// Whether `error` needs the user to fix stored settings rather than retry.
///
/// These are reported immediately; everything else waits out [`MIN_BUSY_INTERVAL`].
pub fn is_blocking_configuration_error(error: &DispatchError) -> bool {
    match error {
        DispatchError::Encrypt(_) => false,
        DispatchError::Publish(e) => matches!(
            e,
            PublishError::MessageEmpty
                | PublishError::TopicEmpty
                | PublishError::ClientNotConnected(_)
        ),
    }
}

/// Whether a failed connect is down to the stored endpoint or certificates.
pub fn is_blocking_connect_error(error: &ConnectError) -> bool {
    match error {
        ConnectError::EndpointEmpty
        | ConnectError::CertificateEmpty
        | ConnectError::PrivateKeyEmpty
        | ConnectError::InvalidEndpoint(_)
        | ConnectError::ClientCertificatesCreateFailure(_)
        | ConnectError::RootCertificate(_) => true,
        ConnectError::Transport(_) => false,
    }
}

pub struct PublishCoordinator {
    controller: Arc<ConnectionController>,
    encrypter: Arc<dyn TimestampEncrypter>,
    timestamp_key: Mutex<Option<String>>,
}

impl PublishCoordinator {
    pub fn new(
        controller: Arc<ConnectionController>,
        encrypter: Arc<dyn TimestampEncrypter>,
    ) -> Self {
        Self {
            controller,
            encrypter,
            timestamp_key: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &Arc<ConnectionController> {
        &self.controller
    }

    pub fn set_timestamp_key(&self, key: Option<String>) {
        if let Ok(mut slot) = self.timestamp_key.lock() {
            *slot = key.filter(|k| !k.trim().is_empty());
        }
    }

    fn timestamp_key(&self) -> Option<String> {
        self.timestamp_key.lock().ok().and_then(|slot| slot.clone())
    }

    /// Fill the `%T` placeholder when a timestamp key is configured.
    pub fn render_message(&self, message: &str) -> Result<String, EncrypterError> {
        if !message.contains(TIMESTAMP_PLACEHOLDER) {
            return Ok(message.to_string());
        }
        match self.timestamp_key() {
            Some(key) => {
                let block = self.encrypter.encrypt_timestamp(&key)?;
                Ok(message.replace(TIMESTAMP_PLACEHOLDER, &block))
            }
            None => Ok(message.to_string()),
        }
    }

    pub async fn publish(&self, message: &str, topic: &str) -> Result<(), DispatchError> {
        let rendered = self.render_message(message)?;
        self.controller.publish(&rendered, topic).await?;
        log::info!("published to {}", topic);
        Ok(())
    }

    /// Publish, reporting configuration errors at once and anything else no
    /// sooner than [`MIN_BUSY_INTERVAL`] after the call.
    pub async fn publish_with_feedback(
        &self,
        message: &str,
        topic: &str,
    ) -> Result<(), DispatchError> {
        let started = Instant::now();
        let result = self.publish(message, topic).await;
        if let Err(e) = &result {
            if is_blocking_configuration_error(e) {
                return result;
            }
        }
        tokio::time::sleep_until(started + MIN_BUSY_INTERVAL).await;
        result
    }
}
