//! NFC tag collaborator and tag provisioning.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::crypto::{generate_secret_hex, key_fingerprint};
use crate::registry::{ActionRegistry, RegistryError, MAX_SECRETS_PER_ACTION};
use crate::settings::Secret;
use crate::token::{build_trigger_url, TokenError};

/// User memory of an NTAG215, the smallest common tag that fits a trigger URL with key.
pub const NTAG215_USER_BYTES: usize = 504;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriterError {
    #[error("NFC not available")]
    NotAvailable,
    #[error("no tags detected")]
    NoTagsDetected,
    #[error("tag is not writable")]
    NotWritable,
    #[error("tag capacity too small: {required} bytes required, {available} available")]
    InsufficientCapacity { required: usize, available: usize },
    #[error("tag I/O failure: {0}")]
    IoFailure(String),
    #[error("tag does not contain a valid URL")]
    InvalidUrl,
    #[error("cancelled")]
    UserCancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Writer(#[from] WriterError),
}

/// One NFC hardware session: read or write a single URL record.
#[async_trait]
pub trait TagSession: Send + Sync {
    async fn write_url(&self, url: &str) -> Result<(), WriterError>;
    async fn read_url(&self) -> Result<Url, WriterError>;
}

/// A trigger URL and its secret, generated but not yet written or stored.
#[derive(Debug, Clone)]
pub struct PendingTag {
    action_index: usize,
    key: String,
    url: String,
}

impl PendingTag {
    /// Check that `action_index` can take another secret and generate one.
    pub fn prepare(registry: &ActionRegistry, action_index: usize) -> Result<Self, ProvisionError> {
        let action = registry.get(action_index)?;
        if action.secrets().len() >= MAX_SECRETS_PER_ACTION {
            return Err(RegistryError::LimitReached.into());
        }
        let key = generate_secret_hex();
        let url = build_trigger_url(action_index, &key)?;
        Ok(Self {
            action_index,
            key,
            url,
        })
    }

    pub fn action_index(&self) -> usize {
        self.action_index
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Write the URL to the tag. Touches no registry state.
    pub async fn write(&self, tag: &dyn TagSession) -> Result<(), ProvisionError> {
        if let Err(e) = tag.write_url(&self.url).await {
            if e == WriterError::UserCancelled {
                log::info!("tag write for action {} cancelled", self.action_index);
            } else {
                log::warn!("tag write for action {} failed: {}", self.action_index, e);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Store the secret of a written tag.
    ///
    /// The registry may have changed since [`PendingTag::prepare`]; a full
    /// action still fails with [`RegistryError::LimitReached`] here.
    pub fn commit(
        self,
        registry: &mut ActionRegistry,
        label: Option<String>,
    ) -> Result<Secret, ProvisionError> {
        let secret = registry.add_secret(self.action_index, &self.key, label)?;
        log::info!(
            "provisioned tag for action {} with secret {}…",
            self.action_index,
            key_fingerprint(&self.key)
        );
        Ok(secret)
    }
}

/// Write a fresh trigger URL for `action_index` to the tag and store its secret.
///
/// The secret is only added once the write succeeded. A full action fails
/// with [`RegistryError::LimitReached`] before the tag is touched.
pub async fn provision_tag(
    registry: &mut ActionRegistry,
    tag: &dyn TagSession,
    action_index: usize,
    label: Option<String>,
) -> Result<Secret, ProvisionError> {
    let pending = PendingTag::prepare(registry, action_index)?;
    pending.write(tag).await?;
    pending.commit(registry, label)
}

// -------------------- File-backed tag --------------------

/// A tag emulated by a file holding one URL, for tests and the command line.
#[derive(Clone, Debug)]
pub struct FileTag {
    path: PathBuf,
    capacity: usize,
    writable: bool,
}

impl FileTag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capacity: NTAG215_USER_BYTES,
            writable: true,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TagSession for FileTag {
    async fn write_url(&self, url: &str) -> Result<(), WriterError> {
        if !self.writable {
            return Err(WriterError::NotWritable);
        }
        if url.len() > self.capacity {
            return Err(WriterError::InsufficientCapacity {
                required: url.len(),
                available: self.capacity,
            });
        }
        fs::write(&self.path, url).map_err(|e| WriterError::IoFailure(e.to_string()))
    }

    async fn read_url(&self) -> Result<Url, WriterError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WriterError::NoTagsDetected)
            }
            Err(e) => return Err(WriterError::IoFailure(e.to_string())),
        };
        Url::parse(raw.trim()).map_err(|_| WriterError::InvalidUrl)
    }
}
