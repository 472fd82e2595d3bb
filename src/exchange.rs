//! Captured request/response pairs
//!
//! A [`CapturedExchange`] serializes flat: the request fields sit next to
//! `id`, `timestamp` and `error`, and `response` is `null` until the
//! exchange completes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use time::OffsetDateTime;

/// Header multimap.
///
/// Names are stored lower-cased, duplicates are preserved in arrival order.
/// Serialized as a JSON object: a name seen once maps to a string, a
/// repeated name maps to an array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  /// Empty header map
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a header, keeping earlier values with the same name.
  pub fn push(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
    self
      .0
      .push((name.as_ref().trim().to_ascii_lowercase(), value.into()));
  }

  /// First value for `name`
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// All values for `name`, in arrival order
  pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
    let name = name.to_ascii_lowercase();
    self
      .0
      .iter()
      .filter(move |(n, _)| n.eq_ignore_ascii_case(&name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether any value is present for `name`
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Remove every value for `name`
  pub fn remove(&mut self, name: &str) {
    self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
  }

  /// Replace every value for `name` with a single one
  pub fn set(&mut self, name: &str, value: impl Into<String>) {
    self.remove(name);
    self.push(name, value);
  }

  /// Whether a comma-separated header such as `Connection` lists `token`
  pub fn has_token(&self, name: &str, token: &str) -> bool {
    self
      .get_all(name)
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  }

  /// Iterate over `(name, value)` pairs
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  /// Number of header lines
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether there are no headers
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for Headers {
  fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
    let mut headers = Headers::new();
    for (name, value) in iter {
      headers.push(name, value);
    }
    headers
  }
}

impl Serialize for Headers {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut names: Vec<&str> = Vec::new();
    for (name, _) in &self.0 {
      if !names.contains(&name.as_str()) {
        names.push(name);
      }
    }
    let mut map = serializer.serialize_map(Some(names.len()))?;
    for name in names {
      let values: Vec<&str> = self.get_all(name).collect();
      if let [single] = values.as_slice() {
        map.serialize_entry(name, single)?;
      } else {
        map.serialize_entry(name, &values)?;
      }
    }
    map.end()
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderValues {
  One(String),
  Many(Vec<String>),
}

impl<'de> Deserialize<'de> for Headers {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct HeadersVisitor;

    impl<'de> Visitor<'de> for HeadersVisitor {
      type Value = Headers;

      fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of header names to a string or an array of strings")
      }

      fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
        let mut headers = Headers::new();
        while let Some((name, values)) = access.next_entry::<String, HeaderValues>()? {
          match values {
            HeaderValues::One(value) => headers.push(&name, value),
            HeaderValues::Many(values) => {
              for value in values {
                headers.push(&name, value);
              }
            }
          }
        }
        Ok(headers)
      }
    }

    deserializer.deserialize_map(HeadersVisitor)
  }
}

/// Captured body bytes.
///
/// Serialized as a string when the bytes are valid UTF-8, otherwise as
/// `{"base64": "..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body(Bytes);

impl Body {
  /// Raw bytes
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Body length in bytes
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether the body is empty
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Body as text, replacing invalid UTF-8 sequences
  pub fn text_lossy(&self) -> String {
    String::from_utf8_lossy(&self.0).into_owned()
  }
}

impl From<Vec<u8>> for Body {
  fn from(value: Vec<u8>) -> Self {
    Body(Bytes::from(value))
  }
}

impl From<Bytes> for Body {
  fn from(value: Bytes) -> Self {
    Body(value)
  }
}

impl From<&str> for Body {
  fn from(value: &str) -> Self {
    Body(Bytes::copy_from_slice(value.as_bytes()))
  }
}

impl From<String> for Body {
  fn from(value: String) -> Self {
    Body(Bytes::from(value))
  }
}

impl Serialize for Body {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match std::str::from_utf8(&self.0) {
      Ok(text) => serializer.serialize_str(text),
      Err(_) => {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("base64", &STANDARD.encode(&self.0))?;
        map.end()
      }
    }
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BodyRepr {
  Text(String),
  Encoded { base64: String },
}

impl<'de> Deserialize<'de> for Body {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    match BodyRepr::deserialize(deserializer)? {
      BodyRepr::Text(text) => Ok(Body::from(text)),
      BodyRepr::Encoded { base64 } => STANDARD
        .decode(base64.as_bytes())
        .map(Body::from)
        .map_err(de::Error::custom),
    }
  }
}

/// Request half of an exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
  /// Upper-case method token
  pub method: String,
  /// Absolute URL of the target
  pub url: String,
  /// Request headers as sent by the client
  pub headers: Headers,
  /// Request body (de-chunked)
  #[serde(default)]
  pub body: Body,
}

/// Response half of an exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
  /// Status code returned to the client
  pub status: u16,
  /// Response headers as sent by the origin
  pub headers: Headers,
  /// Response body (de-chunked)
  #[serde(default)]
  pub body: Body,
  /// Milliseconds from the start of forwarding to the last byte written
  pub duration: u64,
}

impl ResponseRecord {
  /// A response with no headers and no body, used for failed exchanges
  pub fn empty(status: u16, duration: u64) -> Self {
    Self {
      status,
      duration,
      ..Default::default()
    }
  }
}

/// How an exchange ended
#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
  /// The origin answered and the answer was relayed
  Completed(ResponseRecord),
  /// The proxy could not obtain or relay a response
  Failed {
    /// What the client was sent (synthetic, or the partial origin response)
    response: ResponseRecord,
    /// Best-effort description of the failure
    message: String,
  },
}

/// One captured request paired with its (possibly absent) response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
  /// Unique within the process; empty until the store assigns one
  #[serde(default)]
  pub id: String,
  /// Request half
  #[serde(flatten)]
  pub request: RequestRecord,
  /// `None` until the exchange completes
  pub response: Option<ResponseRecord>,
  /// Moment the request head finished arriving
  #[serde(with = "time::serde::rfc3339")]
  pub timestamp: OffsetDateTime,
  /// Set when no response could be obtained or relayed
  #[serde(default)]
  pub error: bool,
  /// Description of the failure, when `error` is set
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_message: Option<String>,
}

impl CapturedExchange {
  /// A new exchange with no response yet, stamped now
  pub fn pending(request: RequestRecord) -> Self {
    Self::pending_at(request, OffsetDateTime::now_utc())
  }

  /// A new exchange with no response yet, stamped at `timestamp`
  pub fn pending_at(request: RequestRecord, timestamp: OffsetDateTime) -> Self {
    Self {
      id: String::new(),
      request,
      response: None,
      timestamp,
      error: false,
      error_message: None,
    }
  }

  /// Whether a response or an error has been attached
  pub fn is_complete(&self) -> bool {
    self.response.is_some() || self.error
  }

  /// Status code of the attached response
  pub fn status(&self) -> Option<u16> {
    self.response.as_ref().map(|r| r.status)
  }

  pub(crate) fn apply(&mut self, outcome: ExchangeOutcome) {
    match outcome {
      ExchangeOutcome::Completed(response) => {
        self.response = Some(response);
      }
      ExchangeOutcome::Failed { response, message } => {
        self.response = Some(response);
        self.error = true;
        self.error_message = Some(message);
      }
    }
  }
}
