//! HTTP/1.x message framing on raw streams
//!
//! Heads are read line by line; bodies are copied to a writer as they
//! arrive while the decoded bytes are captured.

use crate::error::{Error, Result};
use crate::exchange::Headers;
use http::StatusCode;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const CR_LF: &[u8] = b"\r\n";
const COPY_BUFFER: usize = 8192;

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
  pub method: String,
  pub target: String,
  pub version: http::Version,
  pub headers: Headers,
}

impl RequestHead {
  /// Whether the client allows another request on this connection
  pub fn keep_alive(&self) -> bool {
    self.version == http::Version::HTTP_11 && !self.headers.has_token("connection", "close")
  }
}

/// Parsed status line and headers, plus the raw bytes for relaying
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
  pub status: StatusCode,
  pub headers: Headers,
  pub raw: Vec<u8>,
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  Empty,
  Length(u64),
  Chunked,
  UntilClose,
}

impl BodyFraming {
  pub fn for_request(headers: &Headers) -> Result<Self> {
    if headers.has_token("transfer-encoding", "chunked") {
      return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
      Some(0) | None => Ok(BodyFraming::Empty),
      Some(n) => Ok(BodyFraming::Length(n)),
    }
  }

  pub fn for_response(method: &str, status: StatusCode, headers: &Headers) -> Result<Self> {
    if method.eq_ignore_ascii_case("HEAD")
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(BodyFraming::Empty);
    }
    if headers.has_token("transfer-encoding", "chunked") {
      return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
      Some(0) => Ok(BodyFraming::Empty),
      Some(n) => Ok(BodyFraming::Length(n)),
      None => Ok(BodyFraming::UntilClose),
    }
  }
}

fn content_length(headers: &Headers) -> Result<Option<u64>> {
  match headers.get("content-length") {
    Some(value) => value
      .trim()
      .parse::<u64>()
      .map(Some)
      .map_err(|_| Error::invalid_request(format!("Invalid content-length: {}", value))),
    None => Ok(None),
  }
}

/// Outcome of reading a message head
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HeadRead {
  /// Head up to and including the blank line
  Complete(Vec<u8>),
  /// EOF before any byte
  Closed,
  /// EOF inside the head; carries what arrived
  Truncated(Vec<u8>),
  /// Head longer than allowed; carries the first bytes
  Oversized(Vec<u8>),
}

/// Read a message head up to and including the blank line.
///
/// Leading empty lines are skipped. At most `max_size + 1` bytes are taken
/// from `reader`.
pub(crate) async fn read_head<R>(reader: &mut R, max_size: usize) -> io::Result<HeadRead>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = Vec::new();
  loop {
    let budget = (max_size + 1).saturating_sub(head.len()) as u64;
    let mut line = Vec::new();
    let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
    if n == 0 {
      if head.is_empty() {
        return Ok(HeadRead::Closed);
      }
      return Ok(HeadRead::Truncated(head));
    }
    let blank = line == b"\r\n" || line == b"\n";
    if blank && head.is_empty() {
      continue;
    }
    head.extend_from_slice(&line);
    if head.len() > max_size {
      head.truncate(max_size);
      return Ok(HeadRead::Oversized(head));
    }
    if blank {
      return Ok(HeadRead::Complete(head));
    }
  }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Headers {
  let mut headers = Headers::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    if let Some(idx) = line.find(':') {
      let (name, value) = line.split_at(idx);
      headers.push(name.trim(), value[1..].trim());
    } else {
      tracing::debug!("Skipping malformed header line {:?}", line);
    }
  }
  headers
}

fn parse_version(token: &str) -> Option<http::Version> {
  match token {
    "HTTP/1.0" => Some(http::Version::HTTP_10),
    "HTTP/1.1" => Some(http::Version::HTTP_11),
    _ => None,
  }
}

pub(crate) fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
  let text = String::from_utf8_lossy(raw);
  let mut lines = text.lines();
  let request_line = lines
    .next()
    .ok_or_else(|| Error::invalid_request("Empty request".to_string()))?;
  let parts: Vec<&str> = request_line.split_whitespace().collect();
  if parts.len() != 3 {
    return Err(Error::invalid_request(format!(
      "Invalid request line: {:?}",
      request_line
    )));
  }
  let method = parts[0];
  if !method.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-' || b == b'_') {
    return Err(Error::invalid_request(format!("Invalid method: {:?}", method)));
  }
  let version = parse_version(parts[2])
    .ok_or_else(|| Error::invalid_request(format!("Unsupported version: {}", parts[2])))?;
  Ok(RequestHead {
    method: method.to_string(),
    target: parts[1].to_string(),
    version,
    headers: parse_header_lines(lines),
  })
}

pub(crate) fn parse_response_head(raw: Vec<u8>) -> Result<ResponseHead> {
  let (status, headers) = {
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.lines();
    let status_line = lines
      .next()
      .ok_or_else(|| Error::connection_error("Empty response from origin"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
      return Err(Error::connection_error(format!(
        "Invalid status line from origin: {:?}",
        status_line
      )));
    }
    let code = parts.next().unwrap_or_default();
    let status = StatusCode::from_bytes(code.as_bytes()).map_err(|_| {
      Error::connection_error(format!("Invalid status code from origin: {:?}", code))
    })?;
    (status, parse_header_lines(lines))
  };
  Ok(ResponseHead {
    status,
    headers,
    raw,
  })
}

/// Serialize a request head in origin-form
pub(crate) fn encode_request_head(method: &str, path: &str, headers: &Headers) -> Vec<u8> {
  let mut buf = Vec::new();
  buf.extend_from_slice(format!("{} {} HTTP/1.1", method, path).as_bytes());
  buf.extend_from_slice(CR_LF);
  for (name, value) in headers.iter() {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CR_LF);
  }
  buf.extend_from_slice(CR_LF);
  buf
}

/// A complete plain-text response the proxy sends on its own behalf
pub(crate) fn synthetic_response(status: StatusCode, message: &str) -> Vec<u8> {
  format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown"),
    message.len(),
    message
  )
  .into_bytes()
}

async fn copy_exact<R, W>(
  reader: &mut R,
  writer: &mut W,
  mut remaining: u64,
  capture: &mut Vec<u8>,
) -> io::Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; COPY_BUFFER];
  while remaining > 0 {
    let want = std::cmp::min(remaining, buffer.len() as u64) as usize;
    let n = reader.read(&mut buffer[..want]).await?;
    if n == 0 {
      return Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "body ended before its declared length",
      ));
    }
    writer.write_all(&buffer[..n]).await?;
    capture.extend_from_slice(&buffer[..n]);
    remaining -= n as u64;
  }
  Ok(())
}

async fn read_line_relayed<R, W>(reader: &mut R, writer: &mut W) -> io::Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut line = Vec::new();
  if reader.read_until(b'\n', &mut line).await? == 0 {
    return Err(io::Error::new(
      io::ErrorKind::UnexpectedEof,
      "chunked body ended early",
    ));
  }
  writer.write_all(&line).await?;
  Ok(line)
}

/// Copy a body from `reader` to `writer` exactly as framed on the wire,
/// appending the decoded bytes to `capture`.
///
/// With `limit`, a body whose decoded size exceeds it is an error.
pub(crate) async fn relay_body<R, W>(
  reader: &mut R,
  writer: &mut W,
  framing: BodyFraming,
  capture: &mut Vec<u8>,
  limit: Option<usize>,
) -> io::Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let too_large = || io::Error::new(io::ErrorKind::InvalidData, "body exceeds maximum allowed size");
  match framing {
    BodyFraming::Empty => {}
    BodyFraming::Length(n) => {
      if limit.is_some_and(|max| n > max as u64) {
        return Err(too_large());
      }
      copy_exact(reader, writer, n, capture).await?;
    }
    BodyFraming::Chunked => loop {
      let line = read_line_relayed(reader, writer).await?;
      let text = String::from_utf8_lossy(&line);
      let size = text.trim().split(';').next().unwrap_or_default().trim();
      let size = u64::from_str_radix(size, 16).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, format!("invalid chunk size {:?}", size))
      })?;
      if size == 0 {
        // trailers end with an empty line
        loop {
          let trailer = read_line_relayed(reader, writer).await?;
          if trailer == b"\r\n" || trailer == b"\n" {
            break;
          }
        }
        break;
      }
      if limit.is_some_and(|max| capture.len() as u64 + size > max as u64) {
        return Err(too_large());
      }
      copy_exact(reader, writer, size, capture).await?;
      read_line_relayed(reader, writer).await?;
    },
    BodyFraming::UntilClose => {
      let mut buffer = vec![0u8; COPY_BUFFER];
      loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
          break;
        }
        writer.write_all(&buffer[..n]).await?;
        capture.extend_from_slice(&buffer[..n]);
        if limit.is_some_and(|max| capture.len() > max) {
          return Err(too_large());
        }
      }
    }
  }
  writer.flush().await
}

/// Read and decode a body without relaying it
pub(crate) async fn read_body<R>(reader: &mut R, framing: BodyFraming, limit: usize) -> io::Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  relay_body(reader, &mut tokio::io::sink(), framing, &mut body, Some(limit)).await?;
  Ok(body)
}
