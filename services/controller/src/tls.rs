//! Ephemeral TLS material for both listeners.
//!
//! A fresh 2048-bit RSA key and self-signed certificate (CN = listening
//! host, 30-day validity) are minted on every start; nothing touches disk.
//! Agents connect with verification disabled — the passkey layer, not PKI,
//! authenticates this closed fleet.

use axum_server::tls_rustls::RustlsConfig;
use rcgen::{CertificateParams, DnType, KeyPair};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("RSA key generation failed: {0}")]
    KeyGen(String),
    #[error("certificate generation failed: {0}")]
    CertGen(String),
    #[error("TLS config rejected generated material: {0}")]
    Config(String),
}

/// PEM-encoded certificate and private key shared by the control and
/// transfer listeners.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn generate_self_signed(host: &str) -> Result<TlsMaterial, TlsError> {
    let mut rng = rand::rngs::OsRng;
    let rsa_key = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| TlsError::KeyGen(e.to_string()))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| TlsError::KeyGen(e.to_string()))?
        .to_string();

    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| TlsError::CertGen(e.to_string()))?;

    // SANs reject a wildcard bind address; fall back to localhost names.
    let san = if host == "0.0.0.0" || host == "::" {
        vec!["localhost".to_owned(), "127.0.0.1".to_owned()]
    } else {
        vec![host.to_owned()]
    };
    let mut params =
        CertificateParams::new(san).map_err(|e| TlsError::CertGen(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, host.to_owned());

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertGen(e.to_string()))?;

    Ok(TlsMaterial {
        cert_pem: cert.pem(),
        key_pem,
    })
}

pub async fn rustls_config(material: &TlsMaterial) -> Result<RustlsConfig, TlsError> {
    // Other crates in this workspace also compile in the `ring` backend, so
    // rustls can't auto-select a default provider; pin the one axum-server
    // was built against.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    RustlsConfig::from_pem(
        material.cert_pem.clone().into_bytes(),
        material.key_pem.clone().into_bytes(),
    )
    .await
    .map_err(|e| TlsError::Config(e.to_string()))
}
