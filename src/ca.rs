//! Root certificate authority used to terminate intercepted TLS
//!
//! A single self-signed root is generated when the process starts. The same
//! certificate is presented on every TLS connection the proxy accepts, so
//! clients have to trust this exact certificate out of band.

use crate::error::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Common name of the generated root
pub const CA_COMMON_NAME: &str = "Trawler Capture CA";

/// File name used when the certificate is written to disk
pub const CA_CERT_FILE: &str = "ca_cert.pem";
/// File name used when the private key is written to disk
pub const CA_KEY_FILE: &str = "ca_key.pem";

/// Self-signed root certificate and its private key.
///
/// Read-only once generated; share it behind an `Arc`.
pub struct CertificateAuthority {
  cert_pem: String,
  key_pem: String,
  cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
  not_after: OffsetDateTime,
}

impl CertificateAuthority {
  /// Generate a fresh root key pair and self-signed certificate.
  ///
  /// Subject and issuer are identical; the certificate is valid for one
  /// year from now. Failure here is fatal to proxy start.
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, "Trawler");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    // DigitalSignature is needed because the root itself signs TLS handshakes.
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);
    let not_after = params.not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize CA key DER"))?;

    tracing::info!("Generated root certificate \"{}\"", CA_COMMON_NAME);

    Ok(Self {
      cert_pem: cert.pem(),
      key_pem: key_pair.serialize_pem(),
      cert_der,
      key_der,
      not_after,
    })
  }

  /// Certificate in PEM format, for installation as a trusted root
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Private key in PEM format
  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }

  /// Certificate in DER format
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// End of the validity window
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// Build the rustls server configuration presenting this certificate.
  pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(vec![self.cert_der.clone()], self.key_der.clone_key())
      .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
    // Only HTTP/1.x is spoken on intercepted connections.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
  }

  /// Write the certificate and key as PEM files into `dir`.
  ///
  /// Returns the certificate path.
  pub async fn write_pem(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    if !dir.exists() {
      fs::create_dir_all(dir).await?;
    }
    let cert_path = dir.join(CA_CERT_FILE);
    let mut cert_file = fs::File::create(&cert_path).await?;
    cert_file.write_all(self.cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut key_file = fs::File::create(dir.join(CA_KEY_FILE)).await?;
    key_file.write_all(self.key_pem.as_bytes()).await?;
    key_file.flush().await?;
    Ok(cert_path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ca_generation() {
    let ca = CertificateAuthority::generate().unwrap();
    assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
    assert!(ca.cert_pem().contains("END CERTIFICATE"));
    assert!(ca.key_pem().contains("PRIVATE KEY"));
    assert!(!ca.cert_der().is_empty());
  }

  #[test]
  fn test_validity_is_at_least_one_year() {
    let before = OffsetDateTime::now_utc();
    let ca = CertificateAuthority::generate().unwrap();
    assert!(ca.not_after() >= before + Duration::days(365));
  }

  #[test]
  fn test_each_generation_is_distinct() {
    let a = CertificateAuthority::generate().unwrap();
    let b = CertificateAuthority::generate().unwrap();
    assert_ne!(a.cert_pem(), b.cert_pem());
    assert_ne!(a.key_pem(), b.key_pem());
  }

  #[test]
  fn test_server_config() {
    let ca = CertificateAuthority::generate().unwrap();
    let config = ca.server_config();
    assert!(config.is_ok(), "Failed to create TLS config: {:?}", config.err());
    assert_eq!(config.unwrap().alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[tokio::test]
  async fn test_write_pem() {
    let temp_dir = std::env::temp_dir().join("trawler-test-ca");
    if temp_dir.exists() {
      std::fs::remove_dir_all(&temp_dir).ok();
    }

    let ca = CertificateAuthority::generate().unwrap();
    let cert_path = ca.write_pem(&temp_dir).await.unwrap();
    assert!(cert_path.exists(), "CA certificate file not created");
    assert!(temp_dir.join(CA_KEY_FILE).exists(), "CA key file not created");
    let written = std::fs::read_to_string(&cert_path).unwrap();
    assert_eq!(written, ca.cert_pem());

    std::fs::remove_dir_all(&temp_dir).ok();
  }
}
