//! Per-connection proxy handling
//!
//! Each accepted connection runs in its own task. Requests are read, recorded,
//! forwarded to the origin, and the origin's answer is streamed back while it
//! is captured.

use crate::broadcast::{Broadcaster, CaptureEvent};
use crate::error::{Error, Result};
use crate::exchange::{Body, CapturedExchange, ExchangeOutcome, Headers, RequestRecord, ResponseRecord};
use crate::store::ExchangeStore;
use crate::upstream::{OriginStream, Scheme, Target, Upstream};
use crate::wire::{
  encode_request_head, parse_request_head, parse_response_head, read_body, read_head, relay_body,
  synthetic_response, BodyFraming, HeadRead, RequestHead, ResponseHead,
};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

/// Headers that only concern the client-to-proxy hop
const HOP_BY_HOP: &[&str] = &[
  "proxy-connection",
  "proxy-authorization",
  "keep-alive",
  "connection",
  "transfer-encoding",
  "expect",
];

/// Longest wait for a closing client to stop sending
const LINGER_TIMEOUT: Duration = Duration::from_secs(2);
/// Most bytes drained from a closing client
const LINGER_LIMIT: u64 = 1024 * 1024;

/// Which listener accepted a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerKind {
  /// Plain HTTP, also accepts `CONNECT`
  Plain,
  /// TLS terminated with the root certificate
  Tls,
}

/// Shared state of every connection task
pub(crate) struct ConnectionHandler {
  store: ExchangeStore,
  broadcaster: Broadcaster,
  upstream: Upstream,
  acceptor: TlsAcceptor,
  max_head_size: usize,
  max_body_size: usize,
}

impl ConnectionHandler {
  pub fn new(
    store: ExchangeStore,
    broadcaster: Broadcaster,
    upstream: Upstream,
    acceptor: TlsAcceptor,
    max_head_size: usize,
    max_body_size: usize,
  ) -> Self {
    Self {
      store,
      broadcaster,
      upstream,
      acceptor,
      max_head_size,
      max_body_size,
    }
  }

  /// Accept connections until `shutdown` flips to `true`.
  ///
  /// Connection tasks already spawned keep running after the listener closes.
  pub async fn run_listener(
    self: Arc<Self>,
    listener: TcpListener,
    kind: ListenerKind,
    mut shutdown: watch::Receiver<bool>,
  ) {
    loop {
      tokio::select! {
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
        accepted = listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            let handler = self.clone();
            tokio::spawn(async move {
              if let Err(e) = handler.handle_connection(stream, peer_addr, kind).await {
                tracing::debug!("Connection from {} ended with error: {}", peer_addr, e);
              }
            });
          }
          Err(e) => {
            tracing::error!("Failed to accept connection: {}", e);
          }
        }
      }
    }
    if let Ok(addr) = listener.local_addr() {
      tracing::info!("Listener on {} closed", addr);
    }
  }

  async fn handle_connection(
    &self,
    stream: TcpStream,
    peer_addr: SocketAddr,
    kind: ListenerKind,
  ) -> Result<()> {
    tracing::debug!("Accepted {:?} connection from {}", kind, peer_addr);
    stream.set_nodelay(true).ok();
    match kind {
      ListenerKind::Plain => self.serve_plain(stream).await,
      ListenerKind::Tls => {
        let tls = self
          .acceptor
          .accept(stream)
          .await
          .map_err(|e| Error::tls_error(format!("TLS handshake with {} failed: {}", peer_addr, e)))?;
        self.serve_http(BufReader::new(tls), Scheme::Https, None).await?;
        Ok(())
      }
    }
  }

  /// Plain listener: proxy requests directly until the client asks for a
  /// `CONNECT` tunnel, then intercept the tunnel.
  async fn serve_plain(&self, stream: TcpStream) -> Result<()> {
    let Served::Connect(mut client, authority) =
      self.serve_http(BufReader::new(stream), Scheme::Http, None).await?
    else {
      return Ok(());
    };
    client
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    client.flush().await?;
    // bytes the client pipelined after the CONNECT head stay in the buffer
    let tls = self
      .acceptor
      .accept(client)
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake in tunnel to {} failed: {}", authority, e)))?;
    tracing::debug!("Intercepting tunnel to {}", authority);
    self
      .serve_http(BufReader::new(tls), Scheme::Https, Some(authority))
      .await?;
    Ok(())
  }

  /// Request loop over one client connection.
  ///
  /// `CONNECT` is honoured only on plain connections outside a tunnel; the
  /// connection is then handed back for interception.
  async fn serve_http<S>(
    &self,
    mut client: BufReader<S>,
    scheme: Scheme,
    tunnel: Option<String>,
  ) -> Result<Served<S>>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let accepts_connect = scheme == Scheme::Http && tunnel.is_none();
    loop {
      let head = read_head(&mut client, self.max_head_size).await?;
      let received = OffsetDateTime::now_utc();
      let raw = match head {
        HeadRead::Complete(raw) => raw,
        HeadRead::Closed => break,
        HeadRead::Truncated(partial) => {
          let error = Error::invalid_request("Connection closed inside request head");
          self
            .reject_malformed(&mut client, &partial, received, StatusCode::BAD_REQUEST, error)
            .await;
          break;
        }
        HeadRead::Oversized(partial) => {
          let error = Error::invalid_request(format!(
            "Request head exceeds maximum allowed size of {} bytes",
            self.max_head_size
          ));
          self
            .reject_malformed(
              &mut client,
              &partial,
              received,
              StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
              error,
            )
            .await;
          break;
        }
      };
      let head = match parse_request_head(&raw) {
        Ok(head) => head,
        Err(e) => {
          self
            .reject_malformed(&mut client, &raw, received, e.client_status(), e)
            .await;
          break;
        }
      };
      if accepts_connect && head.method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Served::Connect(client, head.target));
      }
      let keep_alive = self
        .exchange(&mut client, head, received, scheme, tunnel.as_deref())
        .await?;
      if !keep_alive {
        break;
      }
    }
    linger(&mut client).await;
    Ok(Served::Closed)
  }

  /// Proxy one request. Returns whether the client connection can carry
  /// another request.
  async fn exchange<S>(
    &self,
    client: &mut BufReader<S>,
    head: RequestHead,
    received: OffsetDateTime,
    scheme: Scheme,
    default_authority: Option<&str>,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let client_keep_alive = head.keep_alive();
    let RequestHead {
      method,
      target: request_target,
      headers,
      ..
    } = head;

    if headers.has_token("expect", "100-continue") {
      client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
      client.flush().await?;
    }

    let body = match BodyFraming::for_request(&headers) {
      Ok(framing) => read_body(client, framing, self.max_body_size)
        .await
        .map_err(|e| Error::invalid_request(format!("Failed to read request body: {}", e))),
      Err(e) => Err(e),
    };
    let target = Target::resolve(&request_target, &headers, scheme, default_authority);
    let url = match &target {
      Ok(target) => target.url(),
      Err(_) => request_target.clone(),
    };
    let request = RequestRecord {
      method: method.clone(),
      url,
      headers,
      body: body.as_ref().map(|b| Body::from(b.clone())).unwrap_or_default(),
    };

    let (body, target) = match (body, target) {
      (Ok(body), Ok(target)) => (body, target),
      (Err(e), _) | (_, Err(e)) => {
        let stored = self.store.insert(CapturedExchange::pending_at(request, received));
        self.fail(client, stored, e, 0).await;
        return Ok(false);
      }
    };
    let stored = self.store.insert(CapturedExchange::pending_at(request, received));
    let started = Instant::now();

    let origin = match self.forward(&target, &method, &stored.request, &body).await {
      Ok(origin) => origin,
      Err(e) => {
        self.fail(client, stored, e, elapsed_ms(started)).await;
        return Ok(false);
      }
    };
    let mut origin = BufReader::new(origin);

    let response = match self.read_final_head(&mut origin, client).await {
      Ok(response) => response,
      Err(HeadError::Origin(e)) => {
        self.fail(client, stored, e, elapsed_ms(started)).await;
        return Ok(false);
      }
      Err(HeadError::Client(e)) => {
        self.finish_failed(stored, ResponseRecord::empty(StatusCode::BAD_GATEWAY.as_u16(), elapsed_ms(started)), &e);
        return Err(e);
      }
    };
    let framing = match BodyFraming::for_response(&method, response.status, &response.headers) {
      Ok(framing) => framing,
      Err(e) => {
        self.fail(client, stored, e, elapsed_ms(started)).await;
        return Ok(false);
      }
    };

    let mut captured = Vec::new();
    let relayed = match client.write_all(&response.raw).await {
      Ok(()) => relay_body(&mut origin, client, framing, &mut captured, None).await,
      Err(e) => Err(e),
    };
    let record = ResponseRecord {
      status: response.status.as_u16(),
      headers: response.headers.clone(),
      body: Body::from(captured),
      duration: elapsed_ms(started),
    };
    if let Err(e) = relayed {
      let e = Error::connection_error(format!("Relaying response for {} failed: {}", stored.request.url, e));
      self.finish_failed(stored, record, &e);
      return Ok(false);
    }

    tracing::info!(
      "{} {} -> {} ({} ms)",
      stored.request.method,
      stored.request.url,
      record.status,
      record.duration
    );
    self.finish(stored, ExchangeOutcome::Completed(record));

    if response.status == StatusCode::SWITCHING_PROTOCOLS {
      match tokio::io::copy_bidirectional(client, &mut origin).await {
        Ok((up, down)) => tracing::debug!("Upgraded connection closed ({} bytes up, {} down)", up, down),
        Err(e) => tracing::debug!("Upgraded connection ended: {}", e),
      }
      return Ok(false);
    }

    Ok(
      client_keep_alive
        && framing != BodyFraming::UntilClose
        && !response.headers.has_token("connection", "close"),
    )
  }

  /// Dial the origin and send the adjusted request
  async fn forward(
    &self,
    target: &Target,
    method: &str,
    request: &RequestRecord,
    body: &[u8],
  ) -> Result<OriginStream> {
    let mut origin = self.upstream.connect(target).await?;
    let headers = forwarded_headers(&request.headers, target, body.len());
    let head = encode_request_head(method, &target.path, &headers);
    let sent = async {
      origin.write_all(&head).await?;
      origin.write_all(body).await?;
      origin.flush().await
    }
    .await;
    sent.map_err(|e| {
      Error::connection_error(format!("Failed to send request to {}: {}", target.authority(), e))
    })?;
    Ok(origin)
  }

  /// Read response heads until a final one, relaying interim `1xx` heads
  async fn read_final_head<S>(
    &self,
    origin: &mut BufReader<OriginStream>,
    client: &mut BufReader<S>,
  ) -> std::result::Result<ResponseHead, HeadError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    loop {
      let raw = match read_head(origin, self.max_head_size).await {
        Ok(HeadRead::Complete(raw)) => raw,
        Ok(HeadRead::Closed) => {
          return Err(HeadError::Origin(Error::connection_error(
            "Origin closed the connection without a response",
          )))
        }
        Ok(HeadRead::Truncated(_)) => {
          return Err(HeadError::Origin(Error::connection_error(
            "Origin closed the connection inside the response head",
          )))
        }
        Ok(HeadRead::Oversized(_)) => {
          return Err(HeadError::Origin(Error::connection_error(format!(
            "Response head exceeds maximum allowed size of {} bytes",
            self.max_head_size
          ))))
        }
        Err(e) => return Err(HeadError::Origin(e.into())),
      };
      let head = parse_response_head(raw).map_err(HeadError::Origin)?;
      if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
        client
          .write_all(&head.raw)
          .await
          .map_err(|e| HeadError::Client(e.into()))?;
        continue;
      }
      return Ok(head);
    }
  }

  /// Record a request whose head could not be read or parsed
  async fn reject_malformed<S>(
    &self,
    client: &mut S,
    raw: &[u8],
    received: OffsetDateTime,
    status: StatusCode,
    error: Error,
  ) where
    S: AsyncWrite + Unpin,
  {
    let text = String::from_utf8_lossy(raw);
    let mut parts = text.lines().next().unwrap_or_default().split_whitespace();
    let request = RequestRecord {
      method: parts.next().unwrap_or_default().to_string(),
      url: parts.next().unwrap_or_default().to_string(),
      headers: Headers::new(),
      body: Body::default(),
    };
    let stored = self.store.insert(CapturedExchange::pending_at(request, received));
    self.respond_failure(client, stored, status, error.to_string(), 0).await;
  }

  /// Send a synthetic error response and record the failure
  async fn fail<S>(&self, client: &mut S, exchange: CapturedExchange, error: Error, duration: u64)
  where
    S: AsyncWrite + Unpin,
  {
    let status = error.client_status();
    self.respond_failure(client, exchange, status, error.to_string(), duration).await;
  }

  async fn respond_failure<S>(
    &self,
    client: &mut S,
    exchange: CapturedExchange,
    status: StatusCode,
    message: String,
    duration: u64,
  ) where
    S: AsyncWrite + Unpin,
  {
    if let Err(e) = client.write_all(&synthetic_response(status, &message)).await {
      tracing::debug!("Could not deliver error response: {}", e);
    }
    client.flush().await.ok();
    tracing::warn!(
      "{} {} -> {} ({})",
      exchange.request.method,
      exchange.request.url,
      status.as_u16(),
      message
    );
    self.finish(
      exchange,
      ExchangeOutcome::Failed {
        response: ResponseRecord::empty(status.as_u16(), duration),
        message,
      },
    );
  }

  fn finish_failed(&self, exchange: CapturedExchange, response: ResponseRecord, error: &Error) {
    self.finish(
      exchange,
      ExchangeOutcome::Failed {
        response,
        message: error.to_string(),
      },
    );
  }

  /// Attach the outcome and notify observers.
  ///
  /// The event is published even when the history was cleared meanwhile.
  fn finish(&self, mut exchange: CapturedExchange, outcome: ExchangeOutcome) {
    let completed = match self.store.complete(&exchange.id, outcome.clone()) {
      Some(completed) => completed,
      None => {
        exchange.apply(outcome);
        exchange
      }
    };
    self
      .broadcaster
      .publish(CaptureEvent::Request { request: completed });
  }
}

/// How a request loop ended
enum Served<S> {
  /// The connection is finished
  Closed,
  /// The client asked for a tunnel to this authority
  Connect(BufReader<S>, String),
}

enum HeadError {
  Origin(Error),
  Client(Error),
}

/// Close the write side, then drain what the client still sends so the last
/// response is not lost to a connection reset.
async fn linger<S>(client: &mut BufReader<S>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  client.shutdown().await.ok();
  let mut rest = (&mut *client).take(LINGER_LIMIT);
  let mut sink = tokio::io::sink();
  let _ = tokio::time::timeout(LINGER_TIMEOUT, tokio::io::copy(&mut rest, &mut sink)).await;
}

fn elapsed_ms(started: Instant) -> u64 {
  started.elapsed().as_millis() as u64
}

/// Headers sent to the origin: hop-by-hop headers removed, the body length
/// made explicit, and `Host` filled in.
fn forwarded_headers(client_headers: &Headers, target: &Target, body_len: usize) -> Headers {
  let upgrade = client_headers.has_token("connection", "upgrade") && client_headers.contains("upgrade");
  let mut headers = client_headers.clone();
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
  if body_len > 0 || client_headers.contains("content-length") {
    headers.set("content-length", body_len.to_string());
  }
  if !headers.contains("host") {
    headers.push("host", target.authority());
  }
  headers.set("connection", if upgrade { "upgrade" } else { "close" });
  headers
}
