//! Endpoint parsing and rustls client configuration for the MQTT session.
//!
//! Trust model:
//! - with a root CA configured, the server chain must contain that exact
//!   certificate; chain and hostname validation are otherwise skipped, since
//!   IoT brokers commonly run on private or self-signed CAs
//! - without one, the server is validated against the public webpki roots
//! - the client always authenticates with its own certificate (mutual TLS)

use rumqttc::tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

use super::TransportError;
use crate::crypto::ClientIdentity;

/// Port used when the endpoint does not name one.
pub const DEFAULT_MQTT_PORT: u16 = 8883;

/// MQTT endpoint. TLS is always on for this client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
}

/// How the broker's certificate is trusted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustPolicy {
    WebPki,
    Pinned(Vec<u8>),
}

/// Build a rustls client config presenting `identity` and trusting per `trust`.
pub fn build_client_config(
    identity: &ClientIdentity,
    trust: &TrustPolicy,
) -> Result<Arc<ClientConfig>, TransportError> {
    let builder = ClientConfig::builder();
    let builder = match trust {
        TrustPolicy::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots)
        }
        TrustPolicy::Pinned(der) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertificate::new(der.clone()))),
    };

    let config = builder
        .with_client_auth_cert(
            identity.certificates.clone(),
            identity.private_key.clone_key(),
        )
        .map_err(|e| TransportError::Tls(format!("client certificate rejected: {}", e)))?;
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct PinnedCertificate {
    der: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertificate {
    fn new(der: Vec<u8>) -> Self {
        Self {
            der,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let pinned = std::iter::once(end_entity)
            .chain(intermediates.iter())
            .any(|cert| cert.as_ref() == self.der.as_slice());
        if pinned {
            Ok(ServerCertVerified::assertion())
        } else {
            ::log::warn!("broker certificate chain does not contain the pinned root CA");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Parse an MQTT endpoint.
///
/// Supports formats:
/// - `host` (port defaults to `default_port`)
/// - `host:port`
/// - `mqtts://host:port`, `ssl://host:port`, `tls://host:port`
/// - `[ipv6]:port`
///
/// Plain-text schemes (`mqtt://`, `tcp://`) are rejected: the session is mutual TLS only.
pub fn parse_mqtt_endpoint(addr: &str, default_port: u16) -> Result<MqttEndpoint, String> {
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtts" | "ssl" | "tls" => {}
            "mqtt" | "tcp" => {
                return Err(format!("plain-text MQTT scheme not supported: {}", scheme))
            }
            other => return Err(format!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let remainder = remainder.trim_end_matches('/');
    if remainder.is_empty() {
        return Err("MQTT endpoint empty".to_string());
    }

    let (host, port) = split_host_port(remainder, default_port)?;
    if host.is_empty() {
        return Err(format!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint { host, port })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16), String> {
    // Handle IPv6 addresses in brackets: [::1]:8883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| format!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port, addr)?,
            None if rest.is_empty() => default_port,
            None => return Err(format!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port, addr)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16, String> {
    port.parse()
        .map_err(|_| format!("invalid MQTT port in {}", addr))
}
