//! Capability URLs for NFC tags and QR codes.
//!
//! Trigger URL (signed, written to a tag):
//!
//! ```text
//! smp://action?idx=<uint>&ts=<uint>&sig=<hex64>&key=<hex64>
//! ```
//!
//! Share URL (unsigned, shown as a QR code between trusted devices):
//!
//! ```text
//! smpshare://secret?idx=<uint>&key=<hex64>&label=<urlencoded>
//! ```
//!
//! Signatures are HMAC-SHA256 over `idx=<idx>&ts=<ts>` keyed with the raw
//! secret bytes. Timestamps are carried but never checked for staleness: a
//! physical tag cannot be refreshed, so a tag stays valid until its secret is
//! revoked.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use url::Url;
use zeroize::Zeroize;

use crate::crypto::{is_key_material, key_fingerprint};
use crate::registry::ActionRegistry;

type HmacSha256 = Hmac<Sha256>;

pub const TRIGGER_SCHEME: &str = "smp";
pub const TRIGGER_HOST: &str = "action";
pub const SHARE_SCHEME: &str = "smpshare";
pub const SHARE_HOST: &str = "secret";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("key is not valid hex")]
    InvalidKeyEncoding,
    #[error("bad scheme/host")]
    BadSchemeOrHost,
    #[error("missing parameters")]
    MissingParameters,
    #[error("secret must be 64 hex characters")]
    InvalidKeyMaterial,
    #[error("system clock error: {0}")]
    Clock(String),
}

/// Why a trigger URL was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidReason {
    MalformedUrl,
    BadSchemeOrHost,
    MissingParameters,
    IndexOutOfRange,
    NoSecretsConfigured,
    SignatureMismatch,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MalformedUrl => "malformed URL",
            Self::BadSchemeOrHost => "bad scheme/host",
            Self::MissingParameters => "missing parameters",
            Self::IndexOutOfRange => "index out of range",
            Self::NoSecretsConfigured => "no secrets configured",
            Self::SignatureMismatch => "signature mismatch",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerVerdict {
    /// Signed by a secret already stored on the action.
    Valid(usize),
    /// Signed by the embedded key, which is already stored on the action.
    AlreadyConfigured(usize),
    /// Signed by an embedded key this device does not know yet.
    ImportAvailable {
        action_index: usize,
        key_material: String,
    },
    Invalid(InvalidReason),
}

impl TriggerVerdict {
    /// Index of the action this verdict allows to run, if any.
    pub fn action_index(&self) -> Option<usize> {
        match self {
            Self::Valid(idx) | Self::AlreadyConfigured(idx) => Some(*idx),
            Self::ImportAvailable { action_index, .. } => Some(*action_index),
            Self::Invalid(_) => None,
        }
    }
}

/// Decoded share URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareGrant {
    pub action_index: usize,
    pub key_material: String,
    pub label: Option<String>,
}

// -------------------- Signing --------------------

fn payload(action_index: usize, timestamp: u64) -> String {
    format!("idx={}&ts={}", action_index, timestamp)
}

fn mac_for(key_hex: &str, action_index: usize, timestamp: u64) -> Result<HmacSha256, TokenError> {
    let mut key = hex::decode(key_hex).map_err(|_| TokenError::InvalidKeyEncoding)?;
    let mac = HmacSha256::new_from_slice(&key);
    key.zeroize();
    let mut mac = mac.map_err(|_| TokenError::InvalidKeyEncoding)?;
    mac.update(payload(action_index, timestamp).as_bytes());
    Ok(mac)
}

/// HMAC-SHA256 of the canonical payload, as lowercase hex.
pub fn sign(action_index: usize, timestamp: u64, key_hex: &str) -> Result<String, TokenError> {
    let mac = mac_for(key_hex, action_index, timestamp)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn signature_matches(key_hex: &str, action_index: usize, timestamp: u64, sig: &[u8]) -> bool {
    match mac_for(key_hex, action_index, timestamp) {
        Ok(mac) => mac.verify_slice(sig).is_ok(),
        Err(_) => false,
    }
}

// -------------------- Trigger URLs --------------------

/// Build a trigger URL stamped with the current time.
pub fn build_trigger_url(action_index: usize, key_material: &str) -> Result<String, TokenError> {
    let now = crate::now_unix_secs().map_err(|e| TokenError::Clock(e.to_string()))?;
    build_trigger_url_at(action_index, key_material, now)
}

/// Build a trigger URL for an explicit timestamp.
///
/// The key is embedded so that another device can import the secret from the
/// tag itself; anyone holding the tag already holds its capability.
pub fn build_trigger_url_at(
    action_index: usize,
    key_material: &str,
    timestamp: u64,
) -> Result<String, TokenError> {
    let signature = sign(action_index, timestamp, key_material)?;
    Ok(format!(
        "{TRIGGER_SCHEME}://{TRIGGER_HOST}?idx={action_index}&ts={timestamp}&sig={signature}&key={}",
        key_material.to_lowercase()
    ))
}

struct TriggerParams {
    raw_idx: String,
    /// `None` when the decimal index does not fit a `usize` or is negative.
    idx: Option<usize>,
    ts: u64,
    sig: Vec<u8>,
    key: Option<String>,
}

fn parse_trigger_params(url: &Url) -> Option<TriggerParams> {
    let raw_idx = first_param(url, "idx")?;
    let idx = parse_index(&raw_idx)?;
    let ts = first_param(url, "ts")?.parse::<u64>().ok()?;
    let sig = hex::decode(first_param(url, "sig")?).ok()?;
    let key = first_param(url, "key").filter(|k| !k.is_empty());
    Some(TriggerParams {
        raw_idx,
        idx,
        ts,
        sig,
        key,
    })
}

/// Outer `None` for anything that is not a decimal integer, inner `None`
/// for integers no action can have.
fn parse_index(raw: &str) -> Option<Option<usize>> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if negative {
        return Some(None);
    }
    Some(digits.parse::<usize>().ok())
}

fn first_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Check a trigger URL against the secrets stored in `registry`.
pub fn verify_trigger_url(url: &str, registry: &ActionRegistry) -> TriggerVerdict {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("trigger url unparsable: {}", e);
            return TriggerVerdict::Invalid(InvalidReason::MalformedUrl);
        }
    };
    if parsed.scheme() != TRIGGER_SCHEME || parsed.host_str() != Some(TRIGGER_HOST) {
        log::debug!(
            "trigger url bad scheme/host: {}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("")
        );
        return TriggerVerdict::Invalid(InvalidReason::BadSchemeOrHost);
    }

    let Some(params) = parse_trigger_params(&parsed) else {
        log::debug!("trigger url missing idx/ts/sig");
        return TriggerVerdict::Invalid(InvalidReason::MissingParameters);
    };

    let action_index = match params.idx {
        Some(idx) if idx < registry.len() => idx,
        _ => {
            log::debug!("trigger url index {} out of range", params.raw_idx);
            return TriggerVerdict::Invalid(InvalidReason::IndexOutOfRange);
        }
    };
    let Ok(action) = registry.get(action_index) else {
        return TriggerVerdict::Invalid(InvalidReason::IndexOutOfRange);
    };

    if action
        .secrets()
        .iter()
        .any(|s| signature_matches(s.key_material(), action_index, params.ts, &params.sig))
    {
        log::info!("trigger url valid for action {}", action_index);
        return TriggerVerdict::Valid(action_index);
    }

    if let Some(key) = params.key.filter(|k| is_key_material(k)) {
        if signature_matches(&key, action_index, params.ts, &params.sig) {
            if action.has_key(&key) {
                return TriggerVerdict::AlreadyConfigured(action_index);
            }
            log::info!(
                "trigger url carries importable key {}… for action {}",
                key_fingerprint(&key),
                action_index
            );
            return TriggerVerdict::ImportAvailable {
                action_index,
                key_material: key.to_lowercase(),
            };
        }
    }

    let reason = if action.secrets().is_empty() {
        InvalidReason::NoSecretsConfigured
    } else {
        InvalidReason::SignatureMismatch
    };
    log::info!("trigger url rejected for action {}: {}", action_index, reason);
    TriggerVerdict::Invalid(reason)
}

// -------------------- Share URLs --------------------

pub fn build_share_url(
    action_index: usize,
    key_material: &str,
    label: Option<&str>,
) -> Result<String, TokenError> {
    if !is_key_material(key_material) {
        return Err(TokenError::InvalidKeyMaterial);
    }
    let mut url = Url::parse(&format!("{SHARE_SCHEME}://{SHARE_HOST}"))
        .map_err(|_| TokenError::BadSchemeOrHost)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("idx", &action_index.to_string());
        query.append_pair("key", key_material);
        if let Some(label) = label {
            query.append_pair("label", label);
        }
    }
    Ok(url.into())
}

pub fn parse_share_url(url: &str) -> Result<ShareGrant, TokenError> {
    let parsed = Url::parse(url).map_err(|_| TokenError::BadSchemeOrHost)?;
    if parsed.scheme() != SHARE_SCHEME || parsed.host_str() != Some(SHARE_HOST) {
        return Err(TokenError::BadSchemeOrHost);
    }

    let action_index = first_param(&parsed, "idx")
        .and_then(|idx| idx.parse::<usize>().ok())
        .ok_or(TokenError::MissingParameters)?;
    let key_material = first_param(&parsed, "key")
        .filter(|k| !k.is_empty())
        .ok_or(TokenError::MissingParameters)?;
    if !is_key_material(&key_material) {
        return Err(TokenError::InvalidKeyMaterial);
    }
    let label = first_param(&parsed, "label");

    Ok(ShareGrant {
        action_index,
        key_material,
        label,
    })
}

/// True if `url` uses the share scheme; used to route incoming URLs.
pub fn is_share_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| u.scheme() == SHARE_SCHEME)
        .unwrap_or(false)
}
