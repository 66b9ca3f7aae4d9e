//! Persisted configuration: actions, their rotating secrets, and connection material.
//!
//! Actions are decoded with an explicit versioned fallback: the multi-secret
//! `nfcSecrets` list (V2) wins; otherwise a non-empty legacy `nfcSecret`
//! string (V1) is migrated into a one-element list. Encoding only ever emits V2.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::registry::{ActionRegistry, MAX_SECRETS_PER_ACTION};

/// Number of home-screen action buttons.
pub const ACTION_COUNT: usize = 4;

/// Label given to a secret migrated from the legacy single-secret field.
pub const MIGRATED_SECRET_LABEL: &str = "Migrated";

pub const DEFAULT_HOME_TITLE: &str = "MQTT PUBS";

// -------------------- Secret --------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    id: Uuid,
    #[serde(rename = "secret")]
    key_material: String,
    created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

impl Secret {
    /// Build a secret from already-validated key material.
    pub(crate) fn new(key_material: String, label: Option<String>, created_at: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            key_material,
            created_at,
            label,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key_material(&self) -> &str {
        &self.key_material
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    /// Key comparison is case-insensitive: hex is hex.
    pub fn matches_key(&self, key_hex: &str) -> bool {
        self.key_material.eq_ignore_ascii_case(key_hex)
    }
}

// -------------------- Action --------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", from = "ActionRecord")]
pub struct Action {
    pub title: String,
    pub topic: String,
    pub message: String,
    #[serde(rename = "nfcSecrets")]
    pub(crate) secrets: Vec<Secret>,
}

impl Action {
    pub fn new(title: impl Into<String>, topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            topic: topic.into(),
            message: message.into(),
            secrets: Vec::new(),
        }
    }

    pub fn secrets(&self) -> &[Secret] {
        &self.secrets
    }

    pub fn has_key(&self, key_hex: &str) -> bool {
        self.secrets.iter().any(|s| s.matches_key(key_hex))
    }
}

/// Wire shape accepted when decoding an action; carries both schema generations.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionRecord {
    #[serde(default)]
    title: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    nfc_secrets: Option<Vec<Secret>>,
    #[serde(default)]
    nfc_secret: Option<String>,
}

impl From<ActionRecord> for Action {
    fn from(record: ActionRecord) -> Self {
        let secrets = decode_secrets_v2(record.nfc_secrets)
            .or_else(|| decode_secret_v1(record.nfc_secret))
            .unwrap_or_default();
        Action {
            title: record.title,
            topic: record.topic,
            message: record.message,
            secrets,
        }
    }
}

fn decode_secrets_v2(secrets: Option<Vec<Secret>>) -> Option<Vec<Secret>> {
    let secrets = secrets?;
    let mut kept: Vec<Secret> = Vec::with_capacity(secrets.len().min(MAX_SECRETS_PER_ACTION));
    for secret in secrets {
        if kept.iter().any(|k| k.matches_key(&secret.key_material)) {
            log::warn!("dropping duplicate stored secret {}", secret.id);
            continue;
        }
        if kept.len() == MAX_SECRETS_PER_ACTION {
            log::warn!("dropping stored secret {} beyond per-action limit", secret.id);
            continue;
        }
        kept.push(secret);
    }
    Some(kept)
}

fn decode_secret_v1(secret: Option<String>) -> Option<Vec<Secret>> {
    let key = secret.filter(|s| !s.is_empty())?;
    let created_at = crate::now_unix_secs().unwrap_or(0);
    log::info!("migrating legacy single-secret action");
    Some(vec![Secret::new(
        key,
        Some(MIGRATED_SECRET_LABEL.to_string()),
        created_at,
    )])
}

// -------------------- Settings --------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub home_title: String,
    pub endpoint: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub certificate: String,
    pub private_key: String,
    #[serde(rename = "rootCA", default)]
    pub root_ca: Option<String>,
    pub is_biometric_auth_enabled: bool,
    pub is_unused_button_hidden: bool,
    #[serde(default)]
    pub timestamp_key: Option<String>,
    pub actions: ActionRegistry,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home_title: DEFAULT_HOME_TITLE.to_string(),
            endpoint: String::new(),
            client_id: format!("SMP Client-{}", Uuid::new_v4().to_string().to_uppercase()),
            certificate: String::new(),
            private_key: String::new(),
            root_ca: None,
            is_biometric_auth_enabled: false,
            is_unused_button_hidden: false,
            timestamp_key: None,
            actions: ActionRegistry::with_len(ACTION_COUNT),
        }
    }
}

impl Settings {
    /// Configured timestamp key, if non-empty.
    pub fn timestamp_key(&self) -> Option<&str> {
        self.timestamp_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

// -------------------- Persistence --------------------

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Option<Settings>>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings persisted as a JSON document with owner-only permissions.
#[derive(Clone, Debug)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn load(&self) -> Result<Option<Settings>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read settings {}", self.path.display()))?;
        let settings = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid settings file {}: {}", self.path.display(), e))?;
        Ok(Some(settings))
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(settings)?;
        write_atomic(&self.path, &encoded)
    }
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    settings: Mutex<Option<Settings>>,
}

impl InMemorySettingsStore {
    pub fn new(settings: Option<Settings>) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn load(&self) -> Result<Option<Settings>> {
        let guard = self
            .settings
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))?;
        *guard = Some(settings.clone());
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow!(
                    "failed to create settings directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&tmp_path)
            .map_err(|e| anyhow!("failed to write settings {}: {}", tmp_path.display(), e))?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
        .map_err(|e| anyhow!("failed to replace settings {}: {}", path.display(), e))?;
    Ok(())
}
