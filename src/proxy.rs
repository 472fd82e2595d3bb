//! Proxy configuration and capture lifecycle

use crate::broadcast::{Broadcaster, CaptureEvent, DEFAULT_QUEUE_CAPACITY};
use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::server::{ConnectionHandler, ListenerKind};
use crate::store::ExchangeStore;
use crate::upstream::Upstream;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Configuration for the capture proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address both proxy listeners bind to
  pub listen_host: String,
  /// Default plain HTTP port
  pub http_port: u16,
  /// Default TLS port
  pub https_port: u16,
  /// Events buffered per observer before it is evicted
  pub observer_queue: usize,
  /// Largest accepted request or response head in bytes
  pub max_head_size: usize,
  /// Largest accepted request body in bytes
  pub max_body_size: usize,
  /// Verify origin certificates against the platform roots
  pub verify_upstream_tls: bool,
  /// Limit on establishing the TCP connection to an origin
  pub connect_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen_host: "127.0.0.1".to_string(),
      http_port: 8080,
      https_port: 8443,
      observer_queue: DEFAULT_QUEUE_CAPACITY,
      max_head_size: 64 * 1024,
      max_body_size: 16 * 1024 * 1024,
      verify_upstream_tls: true,
      connect_timeout: None,
    }
  }
}

/// Ports the listeners are bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPorts {
  /// Plain HTTP listener
  pub http: u16,
  /// TLS listener
  pub https: u16,
}

/// Process-wide capture state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
  /// No listeners
  Idle,
  /// Listeners bound on these ports
  Capturing(BoundPorts),
}

struct Running {
  requested: (u16, u16),
  ports: BoundPorts,
  shutdown: watch::Sender<bool>,
  tasks: Vec<JoinHandle<()>>,
}

impl Running {
  async fn close(self) {
    let _ = self.shutdown.send(true);
    for task in self.tasks {
      if let Err(e) = task.await {
        tracing::warn!("Listener task ended abnormally: {}", e);
      }
    }
  }
}

/// Owns the proxy listeners and the capture state machine
pub struct ProxyEngine {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  store: ExchangeStore,
  broadcaster: Broadcaster,
  handler: Arc<ConnectionHandler>,
  running: Mutex<Option<Running>>,
  state: RwLock<CaptureState>,
}

impl ProxyEngine {
  /// Create an idle engine. Observers of its broadcaster buffer up to
  /// `config.observer_queue` events.
  ///
  /// Fails when the TLS configuration for the root certificate or for
  /// outbound connections cannot be built.
  pub fn new(
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    store: ExchangeStore,
  ) -> Result<Self> {
    let broadcaster = Broadcaster::new(config.observer_queue);
    let acceptor = TlsAcceptor::from(ca.server_config()?);
    let upstream = Upstream::new(config.verify_upstream_tls, config.connect_timeout)?;
    let handler = Arc::new(ConnectionHandler::new(
      store.clone(),
      broadcaster.clone(),
      upstream,
      acceptor,
      config.max_head_size,
      config.max_body_size,
    ));
    Ok(Self {
      config,
      ca,
      store,
      broadcaster,
      handler,
      running: Mutex::new(None),
      state: RwLock::new(CaptureState::Idle),
    })
  }

  /// Start capturing on the given ports; `None` picks the configured
  /// defaults and `0` asks for an ephemeral port.
  ///
  /// Starting again with the same ports returns the current binding. Starting
  /// with different ports replaces the running listeners.
  pub async fn start(&self, http_port: Option<u16>, https_port: Option<u16>) -> Result<BoundPorts> {
    let requested = (
      http_port.unwrap_or(self.config.http_port),
      https_port.unwrap_or(self.config.https_port),
    );
    let mut running = self.running.lock().await;
    if let Some(current) = running.as_ref() {
      if current.requested == requested || (current.ports.http, current.ports.https) == requested {
        tracing::debug!("Already capturing on {:?}", current.ports);
        return Ok(current.ports);
      }
    }
    let replaced = running.take();
    if let Some(previous) = replaced.as_ref() {
      tracing::info!("Restarting capture, replacing listeners on {:?}", previous.ports);
    }
    if let Some(previous) = replaced {
      previous.close().await;
    }

    let bound = self.bind(requested).await;
    let (http_listener, https_listener) = match bound {
      Ok(listeners) => listeners,
      Err(e) => {
        let was_capturing = self.set_state(CaptureState::Idle);
        if was_capturing {
          self.broadcaster.publish(CaptureEvent::Status { capturing: false });
        }
        return Err(e);
      }
    };
    let ports = BoundPorts {
      http: local_port(&http_listener)?,
      https: local_port(&https_listener)?,
    };

    let (shutdown, watcher) = watch::channel(false);
    let tasks = vec![
      tokio::spawn(
        self
          .handler
          .clone()
          .run_listener(http_listener, ListenerKind::Plain, watcher.clone()),
      ),
      tokio::spawn(
        self
          .handler
          .clone()
          .run_listener(https_listener, ListenerKind::Tls, watcher),
      ),
    ];
    *running = Some(Running {
      requested,
      ports,
      shutdown,
      tasks,
    });
    self.set_state(CaptureState::Capturing(ports));
    tracing::info!(
      "Capturing on http://{}:{} and https://{}:{}",
      self.config.listen_host,
      ports.http,
      self.config.listen_host,
      ports.https
    );
    self.broadcaster.publish(CaptureEvent::Status { capturing: true });
    Ok(ports)
  }

  async fn bind(&self, (http_port, https_port): (u16, u16)) -> Result<(TcpListener, TcpListener)> {
    let host = self.config.listen_host.as_str();
    let http = TcpListener::bind((host, http_port))
      .await
      .map_err(|e| Error::proxy_error(format!("Failed to bind to {}:{}: {}", host, http_port, e)))?;
    // a failure here drops the HTTP listener again
    let https = TcpListener::bind((host, https_port))
      .await
      .map_err(|e| Error::proxy_error(format!("Failed to bind to {}:{}: {}", host, https_port, e)))?;
    Ok((http, https))
  }

  /// Stop capturing. Closes the listeners; exchanges in flight run to
  /// completion. Stopping an idle engine succeeds without effect.
  pub async fn stop(&self) -> Result<()> {
    let mut running = self.running.lock().await;
    let Some(current) = running.take() else {
      return Ok(());
    };
    let ports = current.ports;
    current.close().await;
    self.set_state(CaptureState::Idle);
    tracing::info!("Capture stopped, listeners on {:?} closed", ports);
    self.broadcaster.publish(CaptureEvent::Status { capturing: false });
    Ok(())
  }

  /// Returns whether the state was `Capturing` before
  fn set_state(&self, state: CaptureState) -> bool {
    let previous = std::mem::replace(&mut *self.state.write(), state);
    matches!(previous, CaptureState::Capturing(_))
  }

  /// Current capture state
  pub fn state(&self) -> CaptureState {
    *self.state.read()
  }

  /// Whether the listeners are running
  pub fn is_capturing(&self) -> bool {
    matches!(self.state(), CaptureState::Capturing(_))
  }

  /// Ports in use while capturing
  pub fn bound_ports(&self) -> Option<BoundPorts> {
    match self.state() {
      CaptureState::Capturing(ports) => Some(ports),
      CaptureState::Idle => None,
    }
  }

  /// Engine configuration
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// History shared with the connection tasks
  pub fn store(&self) -> &ExchangeStore {
    &self.store
  }

  /// Event channel shared with the connection tasks
  pub fn broadcaster(&self) -> &Broadcaster {
    &self.broadcaster
  }

  /// Root certificate authority
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }
}

fn local_port(listener: &TcpListener) -> Result<u16> {
  Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn engine_with(config: ProxyConfig) -> ProxyEngine {
    let ca = Arc::new(CertificateAuthority::generate().unwrap());
    ProxyEngine::new(config, ca, ExchangeStore::new()).unwrap()
  }

  fn engine() -> ProxyEngine {
    engine_with(ProxyConfig {
      http_port: 0,
      https_port: 0,
      ..Default::default()
    })
  }

  #[tokio::test]
  async fn test_start_is_idempotent() {
    let engine = engine();
    let mut events = engine.broadcaster().subscribe();
    assert_eq!(engine.state(), CaptureState::Idle);

    let first = engine.start(None, None).await.unwrap();
    assert_ne!(first.http, 0);
    assert_ne!(first.https, 0);
    assert!(engine.is_capturing());
    let second = engine.start(None, None).await.unwrap();
    assert_eq!(first, second);
    let explicit = engine.start(Some(first.http), Some(first.https)).await.unwrap();
    assert_eq!(first, explicit);

    // a single state change was announced
    assert_eq!(*events.recv().await.unwrap(), CaptureEvent::Status { capturing: true });
    assert!(events.try_recv().is_none());
    engine.stop().await.unwrap();
  }

  #[tokio::test]
  async fn test_stop_closes_listeners() {
    let engine = engine();
    let ports = engine.start(None, None).await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(engine.state(), CaptureState::Idle);
    assert!(engine.bound_ports().is_none());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", ports.http)).await.is_err());

    // stopping again is fine
    engine.stop().await.unwrap();
  }

  #[tokio::test]
  async fn test_bind_failure_leaves_engine_idle() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();
    let engine = engine();
    let result = engine.start(Some(0), Some(port)).await;
    assert!(matches!(result, Err(Error::ProxyError(_))));
    assert!(!engine.is_capturing());
  }

  #[tokio::test]
  async fn test_observer_queue_from_config() {
    let engine = engine_with(ProxyConfig {
      http_port: 0,
      https_port: 0,
      observer_queue: 1,
      ..Default::default()
    });
    let _slow = engine.broadcaster().subscribe();
    assert_eq!(engine.broadcaster().publish(CaptureEvent::Status { capturing: true }), 1);
    // the second event overflows the single slot and evicts the observer
    assert_eq!(engine.broadcaster().publish(CaptureEvent::Status { capturing: false }), 0);
    assert_eq!(engine.broadcaster().observer_count(), 0);
  }
}
