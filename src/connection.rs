//! The single MQTT session and its connect/disconnect/publish operations.
//!
//! [`ConnectionController`] is an explicitly owned service: build one per
//! process, wrap it in an `Arc` and hand it to whoever publishes. It owns the
//! observable [`ConnectionState`], the last connect error and the table of
//! publishes awaiting a broker acknowledgment.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::crypto::{CertificateConverter, ConvertError};
use crate::settings::Settings;
use crate::transport::{
    parse_mqtt_endpoint, MqttTransport, SessionOptions, TransportError, TransportEvent,
    TrustPolicy, DEFAULT_MQTT_PORT,
};

pub use crate::transport::ConnectionState;

/// How long a QoS 1 publish may take, from the send to the broker's acknowledgment.
pub const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("MQTT endpoint empty")]
    EndpointEmpty,
    #[error("certificate empty")]
    CertificateEmpty,
    #[error("private key empty")]
    PrivateKeyEmpty,
    #[error("MQTT endpoint incorrect: {0}")]
    InvalidEndpoint(String),
    #[error("certificate or private key incorrect")]
    ClientCertificatesCreateFailure(#[source] ConvertError),
    #[error("root CA incorrect")]
    RootCertificate(#[source] ConvertError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("message empty")]
    MessageEmpty,
    #[error("MQTT topic empty")]
    TopicEmpty,
    #[error("client not connected")]
    ClientNotConnected(Option<ConnectError>),
    #[error("message dropped")]
    MessageDropped,
    #[error("timeout")]
    Timeout,
    #[error(transparent)]
    Transport(TransportError),
}

/// Inputs of one connect attempt, usually taken from [`Settings`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub endpoint: String,
    pub client_id: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub root_ca_pem: Option<String>,
}

impl From<&Settings> for ConnectParams {
    fn from(settings: &Settings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            client_id: settings.client_id.clone(),
            certificate_pem: settings.certificate.clone(),
            private_key_pem: settings.private_key.clone(),
            root_ca_pem: settings
                .root_ca
                .clone()
                .filter(|pem| !pem.trim().is_empty()),
        }
    }
}

/// Session parameters that come from runtime configuration rather than settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTuning {
    pub default_port: u16,
    pub keep_alive: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_MQTT_PORT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

/// Acknowledgment slots keyed by packet id.
///
/// The transport may report an ack before `send` hands back the id, so acks
/// with no waiter are kept in `early` until their publish registers.
#[derive(Default)]
struct AckTable {
    waiting: HashMap<u16, oneshot::Sender<()>>,
    early: HashSet<u16>,
    abandoned: HashSet<u16>,
}

impl AckTable {
    /// `None` when the ack already arrived.
    fn register(&mut self, id: u16) -> Option<oneshot::Receiver<()>> {
        self.abandoned.remove(&id);
        if self.early.remove(&id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        Some(rx)
    }

    fn deliver(&mut self, id: u16) {
        if let Some(tx) = self.waiting.remove(&id) {
            let _ = tx.send(());
        } else if self.abandoned.remove(&id) {
            log::debug!("late acknowledgment for message {}", id);
        } else {
            self.early.insert(id);
        }
    }

    /// Drop the waiter for a publish that gave up; its late ack is discarded.
    fn abandon(&mut self, id: u16) {
        if self.waiting.remove(&id).is_some() {
            self.abandoned.insert(id);
        }
    }

    /// Packet ids restart with a new session.
    fn reset_unmatched(&mut self) {
        self.early.clear();
        self.abandoned.clear();
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    last_error: StdMutex<Option<ConnectError>>,
    acks: StdMutex<AckTable>,
    session: AtomicU64,
}

impl Shared {
    fn set_last_error(&self, error: Option<ConnectError>) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = error;
        }
    }

    fn last_error(&self) -> Option<ConnectError> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    fn with_acks<T>(&self, f: impl FnOnce(&mut AckTable) -> T) -> T {
        f(&mut self.acks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub struct ConnectionController {
    transport: Arc<dyn MqttTransport>,
    converter: Arc<dyn CertificateConverter>,
    tuning: SessionTuning,
    shared: Arc<Shared>,
    connect_lock: Mutex<()>,
    pump: JoinHandle<()>,
}

impl ConnectionController {
    /// Build a controller and start its transport event pump.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        converter: Arc<dyn CertificateConverter>,
        tuning: SessionTuning,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state,
            last_error: StdMutex::new(None),
            acks: StdMutex::new(AckTable::default()),
            session: AtomicU64::new(0),
        });
        let pump = tokio::spawn(run_event_pump(transport.subscribe(), shared.clone()));
        Self {
            transport,
            converter,
            tuning,
            shared,
            connect_lock: Mutex::new(()),
            pump,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn last_error(&self) -> Option<ConnectError> {
        self.shared.last_error()
    }

    /// Open the session. A no-op when already connected.
    ///
    /// Validation and certificate conversion happen before any network call;
    /// on failure the error is recorded for [`PublishError::ClientNotConnected`].
    pub async fn connect(&self, params: &ConnectParams) -> Result<(), ConnectError> {
        let _serial = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.shared.set_last_error(None);

        match self.open_session(params).await {
            Ok(_) if self.state() != ConnectionState::Connecting => {
                // Disconnected while the handshake was in flight.
                log::info!("MQTT connect superseded by disconnect");
                if let Err(e) = self.transport.close().await {
                    log::debug!("closing superseded session failed: {}", e);
                }
                Err(ConnectError::Transport(TransportError::Closed))
            }
            Ok(session) => {
                self.shared.with_acks(AckTable::reset_unmatched);
                self.shared.session.store(session, Ordering::SeqCst);
                self.shared.state.send_replace(ConnectionState::Connected);
                log::info!("MQTT connected (session {})", session);
                Ok(())
            }
            Err(e) => {
                log::warn!("MQTT connect failed: {}", e);
                self.shared.set_last_error(Some(e.clone()));
                self.shared.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_session(&self, params: &ConnectParams) -> Result<u64, ConnectError> {
        let options = self.session_options(params)?;
        self.shared.state.send_replace(ConnectionState::Connecting);
        Ok(self.transport.open(options).await?)
    }

    fn session_options(&self, params: &ConnectParams) -> Result<SessionOptions, ConnectError> {
        if params.endpoint.trim().is_empty() {
            return Err(ConnectError::EndpointEmpty);
        }
        if params.certificate_pem.trim().is_empty() {
            return Err(ConnectError::CertificateEmpty);
        }
        if params.private_key_pem.trim().is_empty() {
            return Err(ConnectError::PrivateKeyEmpty);
        }

        let endpoint = parse_mqtt_endpoint(&params.endpoint, self.tuning.default_port)
            .map_err(ConnectError::InvalidEndpoint)?;
        let identity = self
            .converter
            .pem_to_client_identity(&params.certificate_pem, &params.private_key_pem)
            .map_err(ConnectError::ClientCertificatesCreateFailure)?;
        let trust = match params.root_ca_pem.as_deref().filter(|pem| !pem.trim().is_empty()) {
            Some(pem) => TrustPolicy::Pinned(
                self.converter
                    .pem_to_der(pem)
                    .map_err(ConnectError::RootCertificate)?,
            ),
            None => TrustPolicy::WebPki,
        };

        Ok(SessionOptions {
            endpoint,
            client_id: params.client_id.clone(),
            identity,
            trust,
            keep_alive: self.tuning.keep_alive,
        })
    }

    /// Close the session. A no-op when already disconnected.
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.shared.session.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(ConnectionState::Disconnected);
        self.transport.close().await?;
        log::info!("MQTT disconnected");
        Ok(())
    }

    /// Publish at-least-once and wait for the broker's acknowledgment.
    pub async fn publish(&self, message: &str, topic: &str) -> Result<(), PublishError> {
        if message.is_empty() {
            return Err(PublishError::MessageEmpty);
        }
        if topic.is_empty() {
            return Err(PublishError::TopicEmpty);
        }
        if self.state() != ConnectionState::Connected {
            return Err(PublishError::ClientNotConnected(self.last_error()));
        }

        // One deadline covers both the hand-off to the transport and the ack.
        let deadline = Instant::now() + PUBLISH_ACK_TIMEOUT;
        let sent = timeout_at(deadline, self.transport.send(topic, message.as_bytes().to_vec()));
        let id = match sent.await {
            Ok(result) => result.map_err(|e| match e {
                TransportError::MessageDropped => PublishError::MessageDropped,
                TransportError::NotConnected => PublishError::ClientNotConnected(self.last_error()),
                other => PublishError::Transport(other),
            })?,
            Err(_) => {
                log::warn!("message on {} not handed to the transport in time", topic);
                return Err(PublishError::Timeout);
            }
        };

        let Some(rx) = self.shared.with_acks(|acks| acks.register(id)) else {
            log::debug!("message {} acknowledged on {}", id, topic);
            return Ok(());
        };
        match timeout_at(deadline, rx).await {
            Ok(Ok(())) => {
                log::debug!("message {} acknowledged on {}", id, topic);
                Ok(())
            }
            // Slot replaced without an ack.
            Ok(Err(_)) => Err(PublishError::Timeout),
            Err(_) => {
                self.shared.with_acks(|acks| acks.abandon(id));
                log::warn!("message {} on {} not acknowledged in time", id, topic);
                Err(PublishError::Timeout)
            }
        }
    }

    /// Number of publishes still waiting for an acknowledgment.
    pub fn pending_acks(&self) -> usize {
        self.shared.with_acks(|acks| acks.waiting.len())
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn run_event_pump(mut events: broadcast::Receiver<TransportEvent>, shared: Arc<Shared>) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Delivered(id)) => shared.with_acks(|acks| acks.deliver(id)),
            Ok(TransportEvent::ConnectionLost { session, error }) => {
                if session != shared.session.load(Ordering::SeqCst) {
                    continue;
                }
                log::warn!(
                    "MQTT session {} lost{}",
                    session,
                    error
                        .as_ref()
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                );
                shared.set_last_error(error.map(ConnectError::Transport));
                shared.session.store(0, Ordering::SeqCst);
                shared.state.send_replace(ConnectionState::Disconnected);
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("transport event pump lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
