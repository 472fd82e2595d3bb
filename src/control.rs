//! HTTP control API and live event feed

use crate::broadcast::CaptureEvent;
use crate::error::{Error, Result};
use crate::proxy::ProxyEngine;
use crate::store::ExchangeFilter;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

/// Shared state of the control handlers
#[derive(Clone)]
pub struct ControlState {
  engine: Arc<ProxyEngine>,
}

impl ControlState {
  /// State over a proxy engine
  pub fn new(engine: Arc<ProxyEngine>) -> Self {
    Self { engine }
  }

  /// The controlled engine
  pub fn engine(&self) -> &Arc<ProxyEngine> {
    &self.engine
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = match self {
      Error::InvalidRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

/// Ports requested by `POST /api/capture/start`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
  port: Option<u16>,
  https_port: Option<u16>,
}

/// Build the control router
pub fn router(state: ControlState) -> Router {
  Router::new()
    .route("/api/requests", get(list_requests).delete(clear_requests))
    .route("/api/capture/start", post(start_capture))
    .route("/api/capture/stop", post(stop_capture))
    .route("/api/export", get(export_requests))
    .route("/api/health", get(health))
    .route("/api/ca", get(ca_certificate))
    .route("/ws", get(observe))
    .layer(CorsLayer::permissive())
    .with_state(state)
}

/// Serve the control API on `addr` until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, state: ControlState, shutdown: F) -> Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|e| Error::proxy_error(format!("Failed to bind control API to {}: {}", addr, e)))?;
  tracing::info!("Control API listening on http://{}", listener.local_addr()?);
  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown)
    .await?;
  Ok(())
}

async fn list_requests(
  State(state): State<ControlState>,
  Query(filter): Query<ExchangeFilter>,
) -> impl IntoResponse {
  Json(state.engine.store().query(&filter))
}

async fn clear_requests(State(state): State<ControlState>) -> StatusCode {
  state.engine.store().clear();
  tracing::info!("History cleared");
  StatusCode::NO_CONTENT
}

async fn start_capture(State(state): State<ControlState>, body: Bytes) -> Result<impl IntoResponse> {
  let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
    StartRequest::default()
  } else {
    serde_json::from_slice(&body)?
  };
  let ports = state.engine.start(request.port, request.https_port).await?;
  Ok(Json(json!({
    "status": "capturing",
    "capturing": true,
    "port": ports.http,
    "httpsPort": ports.https,
  })))
}

async fn stop_capture(State(state): State<ControlState>) -> Result<impl IntoResponse> {
  state.engine.stop().await?;
  Ok(Json(json!({ "status": "stopped", "capturing": false })))
}

async fn export_requests(State(state): State<ControlState>) -> Result<impl IntoResponse> {
  let document = serde_json::to_vec_pretty(&state.engine.store().snapshot())?;
  Ok((
    [
      (header::CONTENT_TYPE, "application/json"),
      (header::CONTENT_DISPOSITION, "attachment; filename=requests.json"),
    ],
    document,
  ))
}

async fn health(State(state): State<ControlState>) -> impl IntoResponse {
  Json(json!({ "status": "ok", "proxyRunning": state.engine.is_capturing() }))
}

async fn ca_certificate(State(state): State<ControlState>) -> impl IntoResponse {
  (
    [(header::CONTENT_TYPE, "application/x-pem-file")],
    state.engine.ca().cert_pem().to_string(),
  )
}

async fn observe(ws: WebSocketUpgrade, State(state): State<ControlState>) -> Response {
  ws.on_upgrade(move |socket| feed(socket, state))
}

/// Send `init`, then every published event until either side goes away
async fn feed(mut socket: WebSocket, state: ControlState) {
  // subscribe first so nothing published after the snapshot is missed
  let mut subscription = state.engine.broadcaster().subscribe();
  let init = CaptureEvent::Init {
    capturing: state.engine.is_capturing(),
    requests: state.engine.store().snapshot(),
  };
  if send_event(&mut socket, &init).await.is_err() {
    return;
  }
  loop {
    let event = tokio::select! {
      event = subscription.recv() => event,
      incoming = socket.recv() => match incoming {
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => None,
        Some(Ok(_)) => continue,
      },
    };
    let Some(event) = event else {
      break;
    };
    if send_event(&mut socket, &event).await.is_err() {
      break;
    }
  }
  tracing::debug!("Observer {:?} disconnected", subscription.id());
}

async fn send_event(socket: &mut WebSocket, event: &CaptureEvent) -> Result<()> {
  let text = serde_json::to_string(event)?;
  socket
    .send(Message::Text(text.into()))
    .await
    .map_err(|e| Error::connection_error(format!("Observer send failed: {}", e)))
}
