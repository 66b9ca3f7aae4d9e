//! Fixed-size ordered action list and the per-action secret store.
//!
//! The registry is the trust boundary for action indices: every lookup coming
//! from a tag, a QR code or the command line goes through [`ActionRegistry::get`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{is_key_material, key_fingerprint};
use crate::settings::{Action, Secret};

/// Maximum number of live secrets per action.
pub const MAX_SECRETS_PER_ACTION: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action index {index} out of range (have {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("action already holds the maximum of 3 secrets")]
    LimitReached,
    #[error("secret already present on this action")]
    AlreadyPresent,
    #[error("secret must be 64 hex characters")]
    InvalidKeyMaterial,
    #[error("secret {0} not found")]
    SecretNotFound(Uuid),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ActionRegistry {
    actions: Vec<Action>,
}

impl ActionRegistry {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn with_len(len: usize) -> Self {
        Self {
            actions: vec![Action::default(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn get(&self, index: usize) -> Result<&Action, RegistryError> {
        self.actions.get(index).ok_or(RegistryError::IndexOutOfRange {
            index,
            len: self.actions.len(),
        })
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Action, RegistryError> {
        let len = self.actions.len();
        self.actions
            .get_mut(index)
            .ok_or(RegistryError::IndexOutOfRange { index, len })
    }

    /// Add a secret to an action. Fails without mutating on a full or duplicate list.
    pub fn add_secret(
        &mut self,
        index: usize,
        key_material: &str,
        label: Option<String>,
    ) -> Result<Secret, RegistryError> {
        if !is_key_material(key_material) {
            return Err(RegistryError::InvalidKeyMaterial);
        }
        let action = self.get_mut(index)?;
        if action.secrets.len() >= MAX_SECRETS_PER_ACTION {
            return Err(RegistryError::LimitReached);
        }
        if action.has_key(key_material) {
            return Err(RegistryError::AlreadyPresent);
        }

        let created_at = crate::now_unix_secs().unwrap_or(0);
        let label = label.filter(|l| !l.trim().is_empty());
        let secret = Secret::new(key_material.to_lowercase(), label, created_at);
        action.secrets.push(secret.clone());
        log::info!(
            "added secret {} ({}…) to action {}",
            secret.id(),
            key_fingerprint(secret.key_material()),
            index
        );
        Ok(secret)
    }

    pub fn remove_secret(&mut self, index: usize, secret_id: Uuid) -> Result<(), RegistryError> {
        let action = self.get_mut(index)?;
        let before = action.secrets.len();
        action.secrets.retain(|s| s.id() != secret_id);
        if action.secrets.len() == before {
            return Err(RegistryError::SecretNotFound(secret_id));
        }
        log::info!("removed secret {} from action {}", secret_id, index);
        Ok(())
    }

    /// Remove every secret on an action; returns how many were revoked.
    pub fn remove_all_secrets(&mut self, index: usize) -> Result<usize, RegistryError> {
        let action = self.get_mut(index)?;
        let removed = action.secrets.len();
        action.secrets.clear();
        log::info!("removed all {} secrets from action {}", removed, index);
        Ok(removed)
    }

    pub fn rename_secret(
        &mut self,
        index: usize,
        secret_id: Uuid,
        label: Option<String>,
    ) -> Result<(), RegistryError> {
        let action = self.get_mut(index)?;
        let secret = action
            .secrets
            .iter_mut()
            .find(|s| s.id() == secret_id)
            .ok_or(RegistryError::SecretNotFound(secret_id))?;
        secret.set_label(label.filter(|l| !l.trim().is_empty()));
        Ok(())
    }
}
