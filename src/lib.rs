//! Intercepting HTTP/HTTPS proxy with traffic capture
//!
//! This crate runs a recording proxy: every request passing through it is
//! forwarded to its origin, the origin's answer is streamed back, and the pair
//! is kept as a [`CapturedExchange`] that can be queried, exported, or watched
//! live.
//!
//! # Features
//!
//! - Self-signed root certificate generated at startup
//! - Plain HTTP listener with `CONNECT` interception, plus a TLS listener
//! - In-memory history with search and method filters
//! - Non-blocking fan-out of capture events to observers
//! - HTTP control API and WebSocket feed built on axum
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trawler::{CertificateAuthority, ExchangeStore, ProxyConfig, ProxyEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let ca = Arc::new(CertificateAuthority::generate()?);
//!   let engine = ProxyEngine::new(ProxyConfig::default(), ca, ExchangeStore::new())?;
//!   let ports = engine.start(None, None).await?;
//!   println!("proxy on port {}", ports.http);
//!   Ok(())
//! }
//! ```

mod broadcast;
mod ca;
mod control;
mod error;
mod exchange;
mod proxy;
mod server;
mod store;
mod upstream;
mod wire;

pub use broadcast::{Broadcaster, CaptureEvent, ObserverId, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use ca::{CertificateAuthority, CA_CERT_FILE, CA_COMMON_NAME, CA_KEY_FILE};
pub use control::{router, serve, ControlState};
pub use error::{Error, Result};
pub use exchange::{Body, CapturedExchange, ExchangeOutcome, Headers, RequestRecord, ResponseRecord};
pub use proxy::{BoundPorts, CaptureState, ProxyConfig, ProxyEngine};
pub use store::{ExchangeFilter, ExchangeStore};
