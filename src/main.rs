//! Trawler capture proxy binary.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trawler::{CertificateAuthority, ControlState, ExchangeStore, ProxyConfig, ProxyEngine};

#[derive(Parser, Debug)]
#[command(name = "trawler")]
#[command(version, about, long_about = None)]
struct Args {
  /// Address the proxy listeners bind to
  #[arg(long, env = "TRAWLER_LISTEN_HOST", default_value = "127.0.0.1")]
  listen_host: String,

  /// Plain HTTP proxy port
  #[arg(long, env = "TRAWLER_HTTP_PORT", default_value_t = 8080)]
  http_port: u16,

  /// TLS proxy port
  #[arg(long, env = "TRAWLER_HTTPS_PORT", default_value_t = 8443)]
  https_port: u16,

  /// Address the control API binds to
  #[arg(long, env = "TRAWLER_API_HOST", default_value = "127.0.0.1")]
  api_host: String,

  /// Control API port
  #[arg(long, env = "TRAWLER_API_PORT", default_value_t = 3001)]
  api_port: u16,

  /// Start capturing immediately
  #[arg(long, env = "TRAWLER_CAPTURE")]
  capture: bool,

  /// Directory to write the root certificate and key into
  #[arg(long, env = "TRAWLER_CA_DIR")]
  ca_dir: Option<PathBuf>,

  /// Events buffered per live observer
  #[arg(long, env = "TRAWLER_OBSERVER_QUEUE", default_value_t = trawler::DEFAULT_QUEUE_CAPACITY)]
  observer_queue: usize,

  /// Largest accepted message head in bytes
  #[arg(long, env = "TRAWLER_MAX_HEAD_SIZE", default_value_t = 64 * 1024)]
  max_head_size: usize,

  /// Largest accepted request body in bytes
  #[arg(long, env = "TRAWLER_MAX_BODY_SIZE", default_value_t = 16 * 1024 * 1024)]
  max_body_size: usize,

  /// Accept any certificate from origins
  #[arg(long, env = "TRAWLER_INSECURE_UPSTREAM")]
  insecure_upstream: bool,

  /// Seconds allowed for connecting to an origin
  #[arg(long, env = "TRAWLER_CONNECT_TIMEOUT")]
  connect_timeout: Option<u64>,
}

impl Args {
  fn proxy_config(&self) -> ProxyConfig {
    ProxyConfig {
      listen_host: self.listen_host.clone(),
      http_port: self.http_port,
      https_port: self.https_port,
      observer_queue: self.observer_queue,
      max_head_size: self.max_head_size,
      max_body_size: self.max_body_size,
      verify_upstream_tls: !self.insecure_upstream,
      connect_timeout: self.connect_timeout.map(Duration::from_secs),
    }
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trawler=info")))
    .with(tracing_subscriber::fmt::layer())
    .init();

  let args = Args::parse();
  let config = args.proxy_config();
  tracing::info!("Starting trawler v{}", env!("CARGO_PKG_VERSION"));

  let ca = Arc::new(CertificateAuthority::generate()?);
  tracing::info!(
    "Generated root certificate {:?}, valid until {}",
    trawler::CA_COMMON_NAME,
    ca.not_after()
  );
  if let Some(dir) = &args.ca_dir {
    let path = ca.write_pem(dir).await?;
    tracing::info!("Root certificate written to {}", path.display());
  }

  let engine = Arc::new(ProxyEngine::new(config, ca, ExchangeStore::new())?);
  if args.capture {
    engine.start(None, None).await?;
  }

  let api_addr = SocketAddr::new(args.api_host.parse::<IpAddr>()?, args.api_port);
  let shutdown = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("Failed to listen for shutdown signal: {}", e);
      std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
  };
  trawler::serve(api_addr, ControlState::new(engine.clone()), shutdown).await?;
  engine.stop().await?;
  Ok(())
}
