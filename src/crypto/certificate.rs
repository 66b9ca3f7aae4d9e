//! PEM certificate conversion.
//!
//! The connection layer never touches PEM text directly: it asks a
//! [`CertificateConverter`] for a client identity (certificate chain + key)
//! and for the DER bytes of an optional pinned root CA.

use rumqttc::tokio_rustls::rustls;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("certificate format incorrect")]
    CertificateFormatIncorrect,
    #[error("private key format incorrect")]
    PrivateKeyFormatIncorrect,
    #[error("certificate and private key mismatch")]
    CertificateAndPrivateKeyMismatch,
    #[error("certificate or private key incorrect")]
    BundleCreateFailure,
    #[error("certificate or private key or root CA incorrect: {0}")]
    Unknown(String),
}

/// Client certificate chain and matching private key, ready for mutual TLS.
#[derive(Debug)]
pub struct ClientIdentity {
    pub certificates: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            certificates: self.certificates.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

pub trait CertificateConverter: Send + Sync {
    fn pem_to_client_identity(
        &self,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<ClientIdentity, ConvertError>;

    fn pem_to_der(&self, certificate_pem: &str) -> Result<Vec<u8>, ConvertError>;
}

/// Converter backed by `rustls-pemfile`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PemCertificateConverter;

impl CertificateConverter for PemCertificateConverter {
    fn pem_to_client_identity(
        &self,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<ClientIdentity, ConvertError> {
        let certificates = parse_certificates(certificate_pem)?;

        let private_key = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .map_err(|_| ConvertError::PrivateKeyFormatIncorrect)?
            .ok_or(ConvertError::PrivateKeyFormatIncorrect)?;

        // Reject keys the TLS stack cannot sign with before any socket is opened.
        rustls::crypto::ring::sign::any_supported_type(&private_key)
            .map_err(|_| ConvertError::BundleCreateFailure)?;

        Ok(ClientIdentity {
            certificates,
            private_key,
        })
    }

    fn pem_to_der(&self, certificate_pem: &str) -> Result<Vec<u8>, ConvertError> {
        let mut certificates = parse_certificates(certificate_pem)?;
        // A root CA bundle pins its first certificate.
        Ok(certificates.swap_remove(0).as_ref().to_vec())
    }
}

fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, ConvertError> {
    let certificates = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConvertError::CertificateFormatIncorrect)?;
    if certificates.is_empty() {
        return Err(ConvertError::CertificateFormatIncorrect);
    }
    Ok(certificates)
}
