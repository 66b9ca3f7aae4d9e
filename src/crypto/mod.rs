//! Key material helpers and the two crypto collaborators the core relies on:
//! the AES-128-ECB timestamp obfuscator and the PEM certificate converter.

use rand::RngCore;
use zeroize::Zeroize;

pub mod certificate;
pub mod timestamp;

pub use certificate::{
    CertificateConverter, ClientIdentity, ConvertError, PemCertificateConverter,
};
pub use timestamp::{
    decrypt_timestamp_block, encrypt_timestamp_at, verify_timestamp_block, Aes128EcbTimestamp,
    EncrypterError, TimestampEncrypter, TIMESTAMP_BLOCK_LEN,
};

/// Raw secret length in bytes.
pub const SECRET_LEN: usize = 32;

/// Hex length of a secret (two chars per byte).
pub const SECRET_HEX_LEN: usize = SECRET_LEN * 2;

/// Generate a fresh 32-byte secret from the OS RNG, rendered as lowercase hex.
pub fn generate_secret_hex() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let secret = hex::encode(bytes);
    bytes.zeroize();
    secret
}

/// True if `value` is exactly 64 hex characters (either case).
pub fn is_key_material(value: &str) -> bool {
    value.len() == SECRET_HEX_LEN && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Short, log-safe prefix of a secret.
pub fn key_fingerprint(key_hex: &str) -> &str {
    let end = key_hex
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(key_hex.len());
    &key_hex[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_are_lowercase_hex() {
        let secret = generate_secret_hex();
        assert_eq!(secret.len(), SECRET_HEX_LEN);
        assert!(is_key_material(&secret));
        assert_eq!(secret, secret.to_lowercase());
        assert_ne!(secret, generate_secret_hex());
    }

    #[test]
    fn key_material_requires_exact_hex_length() {
        assert!(is_key_material(&"AB".repeat(32)));
        assert!(!is_key_material(&"ab".repeat(31)));
        assert!(!is_key_material(&"zz".repeat(32)));
        assert!(!is_key_material(""));
    }

    #[test]
    fn fingerprint_truncates() {
        assert_eq!(key_fingerprint("0123456789abcdef"), "01234567");
        assert_eq!(key_fingerprint("abc"), "abc");
    }
}
