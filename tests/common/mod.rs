#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::time::Instant;

use secured_publisher::connection::{ConnectParams, ConnectionController, SessionTuning};
use secured_publisher::crypto::{CertificateConverter, ClientIdentity, ConvertError};
use secured_publisher::rendezvous::{FeedbackCue, TriggerFeedback};
use secured_publisher::transport::MockTransport;
use secured_publisher::{Action, ActionRegistry, Settings};

/// Converter that accepts any non-empty PEM and hands back placeholder DER.
#[derive(Default)]
pub struct StubConverter {
    pub fail_identity: bool,
}

impl CertificateConverter for StubConverter {
    fn pem_to_client_identity(
        &self,
        _certificate_pem: &str,
        _private_key_pem: &str,
    ) -> Result<ClientIdentity, ConvertError> {
        if self.fail_identity {
            return Err(ConvertError::CertificateFormatIncorrect);
        }
        Ok(ClientIdentity {
            certificates: vec![CertificateDer::from(vec![0x30, 0x01, 0x00])],
            private_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![0x30, 0x02, 0x00])),
        })
    }

    fn pem_to_der(&self, _certificate_pem: &str) -> Result<Vec<u8>, ConvertError> {
        Ok(vec![0x30, 0x03, 0x00])
    }
}

pub fn controller(transport: &Arc<MockTransport>) -> Arc<ConnectionController> {
    Arc::new(ConnectionController::new(
        transport.clone(),
        Arc::new(StubConverter::default()),
        SessionTuning::default(),
    ))
}

pub fn params() -> ConnectParams {
    ConnectParams {
        endpoint: "broker.local".to_string(),
        client_id: "smp-test".to_string(),
        certificate_pem: "CERT".to_string(),
        private_key_pem: "KEY".to_string(),
        root_ca_pem: None,
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.endpoint = "broker.local:8883".to_string();
    settings.client_id = "smp-test".to_string();
    settings.certificate = "CERT".to_string();
    settings.private_key = "KEY".to_string();
    settings.actions = ActionRegistry::new(vec![
        Action::new("Door", "home/door", "open"),
        Action::new("Garage", "home/garage", "toggle"),
        Action::new("Lights", "home/lights", "on:%T"),
        Action::new("Unused", "", ""),
    ]);
    settings
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seen {
    Countdown(u32),
    Cue(FeedbackCue),
    Failed(String),
    Background,
}

/// Feedback sink recording what the user would have seen, and when.
pub struct RecordingFeedback {
    origin: Instant,
    seen: Mutex<Vec<(std::time::Duration, Seen)>>,
}

impl RecordingFeedback {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<(std::time::Duration, Seen)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(std::time::Duration, String)> {
        self.seen()
            .into_iter()
            .filter_map(|(at, seen)| match seen {
                Seen::Failed(message) => Some((at, message)),
                _ => None,
            })
            .collect()
    }

    pub fn saw(&self, wanted: &Seen) -> bool {
        self.seen().iter().any(|(_, seen)| seen == wanted)
    }

    fn push(&self, seen: Seen) {
        self.seen
            .lock()
            .unwrap()
            .push((self.origin.elapsed(), seen));
    }
}

impl TriggerFeedback for RecordingFeedback {
    fn countdown(&self, _action_title: &str, remaining: u32) {
        self.push(Seen::Countdown(remaining));
    }

    fn cue(&self, cue: FeedbackCue) {
        self.push(Seen::Cue(cue));
    }

    fn failed(&self, message: &str) {
        self.push(Seen::Failed(message.to_string()));
    }

    fn request_background(&self) {
        self.push(Seen::Background);
    }
}
