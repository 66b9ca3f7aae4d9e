//! The process-wide publisher: settings, session and trigger flow in one owner.
//!
//! [`Publisher`] wires the stores and state machines together and exposes the
//! operations the surrounding shell needs: settings mutation, focus changes,
//! manual publishes, incoming tag/QR URLs and secret management.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::connection::{
    ConnectError, ConnectParams, ConnectionController, ConnectionState, SessionTuning,
};
use crate::coordinator::{DispatchError, PublishCoordinator};
use crate::crypto::{
    key_fingerprint, Aes128EcbTimestamp, CertificateConverter, PemCertificateConverter,
    TimestampEncrypter,
};
use crate::registry::RegistryError;
use crate::rendezvous::{
    ExecutionGate, LogFeedback, RendezvousTiming, TriggerError, TriggerFeedback, TriggerHandle,
    TriggerRendezvous,
};
use crate::settings::{Secret, Settings, SettingsStore};
use crate::tag::{PendingTag, ProvisionError, TagSession};
use crate::token::{
    build_share_url, is_share_url, parse_share_url, verify_trigger_url, InvalidReason,
    ShareGrant, TokenError, TriggerVerdict,
};
use crate::transport::MqttTransport;

/// Biometric prompt shown when a tag cannot unlock an action on its own.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<()>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("{}", .0.user_message())]
    Dispatch(#[from] DispatchError),
    #[error("failed to save settings: {0}")]
    Persist(String),
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// Confirmation running. `pending_import` is set when the tag carried a key
    /// this device does not store yet; see [`Publisher::accept_import`].
    Started {
        handle: TriggerHandle,
        pending_import: Option<ShareGrant>,
    },
    /// Tag rejected. `authenticated` reports the biometric fallback, if it ran.
    Rejected {
        reason: InvalidReason,
        authenticated: Option<bool>,
    },
    Failed(TriggerError),
}

#[derive(Debug)]
pub enum UrlOutcome {
    Trigger(TriggerOutcome),
    Imported(ShareGrant),
    ImportRejected(ActionError),
}

/// Collaborators a [`Publisher`] is assembled from.
pub struct PublisherDeps {
    pub transport: Arc<dyn MqttTransport>,
    pub converter: Arc<dyn CertificateConverter>,
    pub encrypter: Arc<dyn TimestampEncrypter>,
    pub feedback: Arc<dyn TriggerFeedback>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl PublisherDeps {
    /// Default collaborators around `transport`.
    pub fn new(transport: Arc<dyn MqttTransport>) -> Self {
        Self {
            transport,
            converter: Arc::new(PemCertificateConverter),
            encrypter: Arc::new(Aes128EcbTimestamp),
            feedback: Arc::new(LogFeedback),
            authenticator: None,
        }
    }
}

pub struct Publisher {
    store: Arc<dyn SettingsStore>,
    settings: Mutex<Settings>,
    controller: Arc<ConnectionController>,
    coordinator: Arc<PublishCoordinator>,
    rendezvous: TriggerRendezvous,
    gate: ExecutionGate,
    authenticator: Option<Arc<dyn Authenticator>>,
    pending_import: StdMutex<Option<ShareGrant>>,
    reconfigure: Mutex<()>,
}

impl Publisher {
    /// Load settings (or defaults) and assemble the publisher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn SettingsStore>,
        deps: PublisherDeps,
        tuning: SessionTuning,
        timing: RendezvousTiming,
    ) -> Result<Self> {
        let settings = match store.load()? {
            Some(settings) => settings,
            None => {
                log::info!("no stored settings, starting from defaults");
                Settings::default()
            }
        };

        let controller = Arc::new(ConnectionController::new(
            deps.transport,
            deps.converter,
            tuning,
        ));
        let coordinator = Arc::new(PublishCoordinator::new(controller.clone(), deps.encrypter));
        coordinator.set_timestamp_key(settings.timestamp_key().map(str::to_string));
        let gate = ExecutionGate::new();
        let rendezvous =
            TriggerRendezvous::new(coordinator.clone(), gate.clone(), deps.feedback, timing);

        Ok(Self {
            store,
            settings: Mutex::new(settings),
            controller,
            coordinator,
            rendezvous,
            gate,
            authenticator: deps.authenticator,
            pending_import: StdMutex::new(None),
            reconfigure: Mutex::new(()),
        })
    }

    pub async fn settings(&self) -> Settings {
        self.settings.lock().await.clone()
    }

    pub fn controller(&self) -> &Arc<ConnectionController> {
        &self.controller
    }

    pub fn coordinator(&self) -> &Arc<PublishCoordinator> {
        &self.coordinator
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn execution_gate(&self) -> &ExecutionGate {
        &self.gate
    }

    // -------------------- Session lifecycle --------------------

    pub async fn connect(&self) -> Result<(), ConnectError> {
        let params = ConnectParams::from(&*self.settings.lock().await);
        self.controller.connect(&params).await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        self.controller.disconnect().await
    }

    /// Foreground lost: drop the session unless a trigger is executing.
    pub async fn focus_lost(&self) {
        if self.gate.is_engaged() {
            log::debug!("focus lost during trigger execution, keeping session");
            return;
        }
        if let Err(e) = self.disconnect().await {
            log::warn!("disconnect on focus loss failed: {}", e);
        }
    }

    /// Foreground regained: reconnect unless a trigger is executing.
    pub async fn focus_gained(&self) {
        if self.gate.is_engaged() {
            log::debug!("focus gained during trigger execution, leaving connect to the trigger");
            return;
        }
        if let Err(e) = self.connect().await {
            log::warn!("connect on focus gain failed: {}", e);
        }
    }

    /// Replace the settings: persist, then disconnect and reconnect with the new values.
    ///
    /// A failed reconnect is recorded on the controller, not returned.
    pub async fn update_settings(&self, next: Settings) -> Result<()> {
        let _chain = self.reconfigure.lock().await;
        self.store.save(&next)?;
        self.coordinator
            .set_timestamp_key(next.timestamp_key().map(str::to_string));
        let params = ConnectParams::from(&next);
        *self.settings.lock().await = next;

        if let Err(e) = self.controller.disconnect().await {
            log::warn!("disconnect before reconfigure failed: {}", e);
        }
        if let Err(e) = self.controller.connect(&params).await {
            log::warn!("reconnect with new settings failed: {}", e);
        }
        Ok(())
    }

    /// Apply a registry-level edit and persist it. The session is left alone.
    async fn edit_settings<T>(
        &self,
        edit: impl FnOnce(&mut Settings) -> Result<T, ActionError>,
    ) -> Result<T, ActionError> {
        let mut settings = self.settings.lock().await;
        let mut next = settings.clone();
        let value = edit(&mut next)?;
        self.store
            .save(&next)
            .map_err(|e| ActionError::Persist(format!("{:#}", e)))?;
        *settings = next;
        Ok(value)
    }

    // -------------------- Publishing --------------------

    /// Publish the action bound to a home-screen button.
    pub async fn publish_action(&self, action_index: usize) -> Result<(), ActionError> {
        let action = self
            .settings
            .lock()
            .await
            .actions
            .get(action_index)?
            .clone();
        self.coordinator
            .publish_with_feedback(&action.message, &action.topic)
            .await?;
        Ok(())
    }

    // -------------------- Incoming URLs --------------------

    /// Route a URL read from a tag or a QR code.
    pub async fn handle_url(&self, url: &str) -> UrlOutcome {
        if is_share_url(url) {
            match self.import_shared_secret(url).await {
                Ok(grant) => UrlOutcome::Imported(grant),
                Err(e) => {
                    log::warn!("share URL rejected: {}", e);
                    UrlOutcome::ImportRejected(e)
                }
            }
        } else {
            UrlOutcome::Trigger(self.handle_trigger(url).await)
        }
    }

    pub async fn handle_trigger(&self, url: &str) -> TriggerOutcome {
        let (verdict, settings) = {
            let settings = self.settings.lock().await;
            (verify_trigger_url(url, &settings.actions), settings.clone())
        };

        let (action_index, pending_import) = match verdict {
            TriggerVerdict::Valid(idx) | TriggerVerdict::AlreadyConfigured(idx) => (idx, None),
            TriggerVerdict::ImportAvailable {
                action_index,
                key_material,
            } => {
                log::info!(
                    "tag for action {} carries unknown key {}…",
                    action_index,
                    key_fingerprint(&key_material)
                );
                let grant = ShareGrant {
                    action_index,
                    key_material,
                    label: None,
                };
                (action_index, Some(grant))
            }
            TriggerVerdict::Invalid(reason) => {
                log::info!("trigger URL rejected: {}", reason);
                let authenticated = self.authenticate_fallback(&settings).await;
                return TriggerOutcome::Rejected {
                    reason,
                    authenticated,
                };
            }
        };

        let action = match settings.actions.get(action_index) {
            Ok(action) => action,
            Err(_) => return TriggerOutcome::Failed(TriggerError::IndexOutOfRange(action_index)),
        };
        match self
            .rendezvous
            .start(action_index, action, ConnectParams::from(&settings))
        {
            Ok(handle) => {
                if let Ok(mut slot) = self.pending_import.lock() {
                    *slot = pending_import.clone();
                }
                TriggerOutcome::Started {
                    handle,
                    pending_import,
                }
            }
            Err(e) => {
                log::warn!("trigger for action {} not started: {}", action_index, e);
                TriggerOutcome::Failed(e)
            }
        }
    }

    async fn authenticate_fallback(&self, settings: &Settings) -> Option<bool> {
        if !settings.is_biometric_auth_enabled {
            return None;
        }
        let authenticator = self.authenticator.as_ref()?;
        match authenticator.authenticate().await {
            Ok(()) => Some(true),
            Err(e) => {
                log::info!("biometric authentication not completed: {:#}", e);
                Some(false)
            }
        }
    }

    /// Cancel the running trigger confirmation, if any.
    pub fn cancel_trigger(&self) -> bool {
        if let Ok(mut slot) = self.pending_import.lock() {
            *slot = None;
        }
        self.rendezvous.cancel()
    }

    /// Store the key offered by the last trigger tag.
    pub async fn accept_import(&self) -> Result<Option<Secret>, ActionError> {
        let grant = self.pending_import.lock().ok().and_then(|mut slot| slot.take());
        let Some(grant) = grant else {
            return Ok(None);
        };
        let secret = self
            .edit_settings(|s| {
                Ok(s.actions
                    .add_secret(grant.action_index, &grant.key_material, grant.label.clone())?)
            })
            .await?;
        Ok(Some(secret))
    }

    pub async fn import_shared_secret(&self, url: &str) -> Result<ShareGrant, ActionError> {
        let grant = parse_share_url(url)?;
        self.edit_settings(|s| {
            s.actions
                .add_secret(grant.action_index, &grant.key_material, grant.label.clone())?;
            Ok(())
        })
        .await?;
        Ok(grant)
    }

    // -------------------- Secret management --------------------

    pub async fn provision_tag(
        &self,
        tag: &dyn TagSession,
        action_index: usize,
        label: Option<String>,
    ) -> Result<Secret, ActionError> {
        let pending = PendingTag::prepare(&self.settings.lock().await.actions, action_index)?;
        // The settings stay unlocked while the tag is written.
        pending.write(tag).await?;
        self.edit_settings(|next| Ok(pending.commit(&mut next.actions, label)?))
            .await
    }

    /// Share URL for one stored secret, for display as a QR code.
    pub async fn share_url(&self, action_index: usize, secret_id: Uuid) -> Result<String, ActionError> {
        let settings = self.settings.lock().await;
        let secret = settings
            .actions
            .get(action_index)?
            .secrets()
            .iter()
            .find(|s| s.id() == secret_id)
            .ok_or(RegistryError::SecretNotFound(secret_id))?;
        Ok(build_share_url(
            action_index,
            secret.key_material(),
            secret.label(),
        )?)
    }

    pub async fn remove_secret(&self, action_index: usize, secret_id: Uuid) -> Result<(), ActionError> {
        self.edit_settings(|s| Ok(s.actions.remove_secret(action_index, secret_id)?))
            .await
    }

    pub async fn remove_all_secrets(&self, action_index: usize) -> Result<usize, ActionError> {
        self.edit_settings(|s| Ok(s.actions.remove_all_secrets(action_index)?))
            .await
    }

    pub async fn rename_secret(
        &self,
        action_index: usize,
        secret_id: Uuid,
        label: Option<String>,
    ) -> Result<(), ActionError> {
        self.edit_settings(|s| Ok(s.actions.rename_secret(action_index, secret_id, label)?))
            .await
    }
}
