//! Timestamp obfuscation for the `%T` message placeholder.
//!
//! A 16-byte block is built as:
//!
//! ```text
//! byte 0..4    random
//! byte 4..8    Unix seconds, little endian (u32)
//! byte 8..15   random
//! byte 15      (sum of bytes 0..15) & 0xff
//! ```
//!
//! and encrypted with AES-128 in ECB mode without padding. The receiving device
//! decrypts the block, checks the checksum byte and rejects stale timestamps.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Length of the plaintext/ciphertext block.
pub const TIMESTAMP_BLOCK_LEN: usize = 16;

const AES128_KEY_HEX_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncrypterError {
    #[error("timestamp key must be 32 hex characters")]
    KeyFormatIncorrect,
    #[error("encrypted timestamp must be 32 hex characters")]
    HexFormatIncorrect,
    #[error("timestamp block checksum mismatch")]
    ChecksumMismatch,
    #[error("timestamp {timestamp} outside tolerance (now {now})")]
    Stale { timestamp: u32, now: u64 },
    #[error("system clock error: {0}")]
    Clock(String),
}

/// Collaborator that fills the `%T` placeholder.
pub trait TimestampEncrypter: Send + Sync {
    fn encrypt_timestamp(&self, key_hex: &str) -> Result<String, EncrypterError>;
}

/// Default encrypter using the current system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct Aes128EcbTimestamp;

impl TimestampEncrypter for Aes128EcbTimestamp {
    fn encrypt_timestamp(&self, key_hex: &str) -> Result<String, EncrypterError> {
        let now = crate::now_unix_secs().map_err(|e| EncrypterError::Clock(e.to_string()))?;
        encrypt_timestamp_at(key_hex, now)
    }
}

/// Encrypt a block carrying `unix_secs` (truncated to 32 bits).
pub fn encrypt_timestamp_at(key_hex: &str, unix_secs: u64) -> Result<String, EncrypterError> {
    let cipher = cipher_from_hex(key_hex)?;

    let mut block = [0u8; TIMESTAMP_BLOCK_LEN];
    rand::thread_rng().fill_bytes(&mut block[..15]);
    block[4..8].copy_from_slice(&(unix_secs as u32).to_le_bytes());
    block[15] = checksum(&block[..15]);

    let mut ga = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut ga);
    block.zeroize();
    Ok(hex::encode(ga))
}

/// Decrypt a block and return the embedded timestamp after checking the checksum.
pub fn decrypt_timestamp_block(key_hex: &str, block_hex: &str) -> Result<u32, EncrypterError> {
    let cipher = cipher_from_hex(key_hex)?;
    let bytes = hex::decode(block_hex).map_err(|_| EncrypterError::HexFormatIncorrect)?;
    if bytes.len() != TIMESTAMP_BLOCK_LEN {
        return Err(EncrypterError::HexFormatIncorrect);
    }

    let mut ga = GenericArray::clone_from_slice(&bytes);
    cipher.decrypt_block(&mut ga);
    if checksum(&ga[..15]) != ga[15] {
        return Err(EncrypterError::ChecksumMismatch);
    }
    let mut ts = [0u8; 4];
    ts.copy_from_slice(&ga[4..8]);
    Ok(u32::from_le_bytes(ts))
}

/// Receiver-side check: decrypt, validate, and reject blocks older than `tolerance_secs`.
///
/// Blocks stamped in the future are accepted, matching the device firmware which
/// only bounds the age of a command.
pub fn verify_timestamp_block(
    key_hex: &str,
    block_hex: &str,
    now: u64,
    tolerance_secs: u64,
) -> Result<u32, EncrypterError> {
    let timestamp = decrypt_timestamp_block(key_hex, block_hex)?;
    let now32 = now as u32;
    let age = now32.wrapping_sub(timestamp) as i32;
    if i64::from(age) > tolerance_secs as i64 {
        return Err(EncrypterError::Stale { timestamp, now });
    }
    Ok(timestamp)
}

fn cipher_from_hex(key_hex: &str) -> Result<Aes128, EncrypterError> {
    if key_hex.len() != AES128_KEY_HEX_LEN {
        return Err(EncrypterError::KeyFormatIncorrect);
    }
    let mut key = hex::decode(key_hex).map_err(|_| EncrypterError::KeyFormatIncorrect)?;
    let cipher = Aes128::new_from_slice(&key).map_err(|_| EncrypterError::KeyFormatIncorrect);
    key.zeroize();
    cipher
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}
