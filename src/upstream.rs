//! Outbound connections to origin servers

use crate::error::{Error, Result};
use crate::exchange::Headers;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  crypto::CryptoProvider,
  pki_types::{CertificateDer, ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// Scheme of a proxied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
  /// Plain HTTP
  Http,
  /// HTTP over TLS
  Https,
}

impl Scheme {
  /// Port used when the request does not name one
  pub fn default_port(self) -> u16 {
    match self {
      Scheme::Http => 80,
      Scheme::Https => 443,
    }
  }

  /// Scheme name as used in URLs
  pub fn as_str(self) -> &'static str {
    match self {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }
  }
}

/// Where a request is going
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
  pub scheme: Scheme,
  /// Host as written in the request (IPv6 literals keep their brackets)
  pub host: String,
  pub port: u16,
  /// Path and query in origin-form
  pub path: String,
}

impl Target {
  /// Resolve the target of a request.
  ///
  /// Absolute-form targets carry everything. Origin-form targets use the
  /// tunnel's `default_authority` when there is one, else the `Host` header.
  pub fn resolve(
    request_target: &str,
    headers: &Headers,
    default_scheme: Scheme,
    default_authority: Option<&str>,
  ) -> Result<Self> {
    let lower = request_target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
      let uri: http::Uri = request_target
        .parse()
        .map_err(|e| Error::invalid_request(format!("Invalid URI {}: {}", request_target, e)))?;
      let scheme = if uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
        Scheme::Https
      } else {
        Scheme::Http
      };
      let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::invalid_request(format!("Missing host in {}", request_target)))?;
      let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
      return Ok(Self {
        scheme,
        host: host.to_string(),
        port: uri.port_u16().unwrap_or(scheme.default_port()),
        path: path.to_string(),
      });
    }

    if !request_target.starts_with('/') && request_target != "*" {
      return Err(Error::invalid_request(format!(
        "Unsupported request target: {}",
        request_target
      )));
    }
    let authority = default_authority
      .or_else(|| headers.get("host"))
      .filter(|a| !a.trim().is_empty())
      .ok_or_else(|| Error::invalid_request("Missing Host header".to_string()))?;
    let authority: http::uri::Authority = authority
      .trim()
      .parse()
      .map_err(|e| Error::invalid_request(format!("Invalid Host {}: {}", authority, e)))?;
    Ok(Self {
      scheme: default_scheme,
      host: authority.host().to_string(),
      port: authority.port_u16().unwrap_or(default_scheme.default_port()),
      path: request_target.to_string(),
    })
  }

  /// `host[:port]`, omitting the default port
  pub fn authority(&self) -> String {
    if self.port == self.scheme.default_port() {
      self.host.clone()
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  /// Absolute URL of the request
  pub fn url(&self) -> String {
    let path = if self.path == "*" { "" } else { self.path.as_str() };
    format!("{}://{}{}", self.scheme.as_str(), self.authority(), path)
  }

  /// Host for DNS resolution and SNI
  pub fn dial_host(&self) -> &str {
    self.host.trim_start_matches('[').trim_end_matches(']')
  }
}

/// Open connection to an origin
pub(crate) enum OriginStream {
  Plain(TcpStream),
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.get_mut() {
      OriginStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
      OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for OriginStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      OriginStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
      OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      OriginStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
      OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      OriginStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
      OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

/// Certificate verifier that accepts any origin certificate
#[derive(Debug)]
struct NoVerifier {
  schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.schemes.clone()
  }
}

/// Dials origins, wrapping the connection in TLS for `https` targets
#[derive(Clone)]
pub(crate) struct Upstream {
  connector: TlsConnector,
  connect_timeout: Option<Duration>,
}

impl fmt::Debug for Upstream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Upstream")
      .field("connect_timeout", &self.connect_timeout)
      .finish()
  }
}

impl Upstream {
  pub fn new(verify_tls: bool, connect_timeout: Option<Duration>) -> Result<Self> {
    let provider = CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
    let builder = ClientConfig::builder_with_provider(provider.clone())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_error(format!("Invalid TLS versions: {}", e)))?;
    let mut config = if verify_tls {
      let mut roots = RootCertStore::empty();
      let native = rustls_native_certs::load_native_certs();
      for err in &native.errors {
        tracing::warn!("Failed to load a platform root certificate: {}", err);
      }
      let (added, ignored) = roots.add_parsable_certificates(native.certs);
      tracing::debug!("Loaded {} platform roots ({} ignored)", added, ignored);
      builder.with_root_certificates(roots).with_no_client_auth()
    } else {
      let schemes = provider
        .signature_verification_algorithms
        .supported_schemes();
      builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier { schemes }))
        .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Self {
      connector: TlsConnector::from(Arc::new(config)),
      connect_timeout,
    })
  }

  /// Open a connection to `target`. The stream closes when dropped.
  pub async fn connect(&self, target: &Target) -> Result<OriginStream> {
    let authority = format!("{}:{}", target.host, target.port);
    let connecting = TcpStream::connect((target.dial_host(), target.port));
    let connected = match self.connect_timeout {
      Some(limit) => tokio::time::timeout(limit, connecting)
        .await
        .map_err(|_| Error::connection_error(format!("Timed out connecting to {}", authority)))?,
      None => connecting.await,
    };
    let tcp = connected
      .map_err(|e| Error::connection_error(format!("Failed to connect to {}: {}", authority, e)))?;
    tcp.set_nodelay(true).ok();

    match target.scheme {
      Scheme::Http => Ok(OriginStream::Plain(tcp)),
      Scheme::Https => {
        let name = ServerName::try_from(target.dial_host().to_string())
          .map_err(|e| Error::tls_error(format!("Invalid server name {}: {}", target.host, e)))?;
        let tls = self.connector.connect(name, tcp).await.map_err(|e| {
          Error::tls_error(format!("TLS handshake with {} failed: {}", authority, e))
        })?;
        Ok(OriginStream::Tls(Box::new(tls)))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_absolute_form() {
    let target = Target::resolve("http://example.com/a?b=1", &Headers::new(), Scheme::Http, None).unwrap();
    assert_eq!(target.scheme, Scheme::Http);
    assert_eq!(target.host, "example.com");
    assert_eq!(target.port, 80);
    assert_eq!(target.path, "/a?b=1");
    assert_eq!(target.url(), "http://example.com/a?b=1");

    let target = Target::resolve("https://example.com:8443", &Headers::new(), Scheme::Http, None).unwrap();
    assert_eq!(target.scheme, Scheme::Https);
    assert_eq!(target.port, 8443);
    assert_eq!(target.path, "/");
    assert_eq!(target.url(), "https://example.com:8443/");
  }

  #[test]
  fn test_resolve_origin_form() {
    let headers = Headers::from_iter([("Host", "api.test:9000")]);
    let target = Target::resolve("/v1/items", &headers, Scheme::Https, None).unwrap();
    assert_eq!(target.scheme, Scheme::Https);
    assert_eq!(target.host, "api.test");
    assert_eq!(target.port, 9000);
    assert_eq!(target.url(), "https://api.test:9000/v1/items");

    let target = Target::resolve("/", &Headers::new(), Scheme::Https, Some("tunnel.test:443")).unwrap();
    assert_eq!(target.url(), "https://tunnel.test/");
  }

  #[test]
  fn test_resolve_prefers_tunnel_authority() {
    let headers = Headers::from_iter([("Host", "host.test")]);
    let target = Target::resolve("/login", &headers, Scheme::Https, Some("host.test:8443")).unwrap();
    assert_eq!(target.host, "host.test");
    assert_eq!(target.port, 8443);
    assert_eq!(target.url(), "https://host.test:8443/login");
  }

  #[test]
  fn test_resolve_failures() {
    assert!(Target::resolve("/", &Headers::new(), Scheme::Http, None).is_err());
    assert!(Target::resolve("example.com:80", &Headers::new(), Scheme::Http, None).is_err());
    assert!(Target::resolve("http:///nohost", &Headers::new(), Scheme::Http, None).is_err());
  }

  #[test]
  fn test_ipv6_dial_host() {
    let target = Target::resolve("http://[::1]:8080/", &Headers::new(), Scheme::Http, None).unwrap();
    assert_eq!(target.host, "[::1]");
    assert_eq!(target.dial_host(), "::1");
    assert_eq!(target.url(), "http://[::1]:8080/");
  }

  #[tokio::test]
  async fn test_connect_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let upstream = Upstream::new(false, Some(Duration::from_secs(5))).unwrap();
    let target = Target {
      scheme: Scheme::Http,
      host: "127.0.0.1".to_string(),
      port,
      path: "/".to_string(),
    };
    let result = upstream.connect(&target).await;
    assert!(matches!(result, Err(Error::ConnectionError(_))));
  }
}
