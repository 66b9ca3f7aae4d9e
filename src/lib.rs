//! Secured MQTT Publisher (SMP) core
//!
//! Publishes authenticated control messages to an MQTT broker over mutual TLS,
//! and lets a physical NFC tag or a QR-shared secret act as an unlock token for
//! one of a small set of pre-configured actions.
//!
//! # Architecture
//!
//! Two halves carry the design:
//!
//! 1. **Token protocol**: per-action rotating HMAC-SHA256 secrets (at most three),
//!    signed trigger URLs written to tags, unsigned share URLs for QR transfer,
//!    and one-way migration of the legacy single-secret schema.
//! 2. **Connection/publish state machine**: one MQTT session owned by a
//!    [`ConnectionController`], acknowledged QoS 1 publishes bounded by a
//!    timeout, and a [`TriggerRendezvous`] that only dispatches a tag-triggered
//!    action once both the confirmation countdown and the connection are ready.
//!
//! # Module Structure
//!
//! - `settings`, `registry`: persisted configuration, actions and their secrets
//! - `token`: trigger and share URL codec
//! - `crypto`: secret generation, `%T` timestamp block, PEM conversion
//! - `transport`: MQTT transport seam (rumqttc, mock) and TLS setup
//! - `connection`, `coordinator`, `rendezvous`: the publish state machine
//! - `tag`: NFC tag collaborator and provisioning
//! - `app`: the process-wide [`Publisher`]
//! - `config`: runtime configuration loading

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod app;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod crypto;
pub mod registry;
pub mod rendezvous;
pub mod settings;
pub mod tag;
pub mod token;
pub mod transport;

pub use app::{ActionError, Authenticator, Publisher, PublisherDeps, TriggerOutcome, UrlOutcome};
pub use config::PublisherConfig;
pub use connection::{
    ConnectError, ConnectParams, ConnectionController, ConnectionState, PublishError,
    SessionTuning,
};
pub use coordinator::{
    is_blocking_configuration_error, is_blocking_connect_error, DispatchError, PublishCoordinator,
};
pub use registry::{ActionRegistry, RegistryError, MAX_SECRETS_PER_ACTION};
pub use rendezvous::{
    ExecutionGate, ExecutionGuard, FeedbackCue, LogFeedback, RendezvousTiming, SessionOutcome,
    TriggerError, TriggerFeedback, TriggerHandle, TriggerRendezvous,
};
pub use settings::{Action, JsonFileSettingsStore, Secret, Settings, SettingsStore};
pub use tag::{provision_tag, FileTag, PendingTag, ProvisionError, TagSession, WriterError};
pub use token::{ShareGrant, TokenError, TriggerVerdict};

/// Current Unix time in whole seconds.
pub fn now_unix_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
