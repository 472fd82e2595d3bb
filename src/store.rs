//! In-memory history of captured exchanges

use crate::exchange::{CapturedExchange, ExchangeOutcome};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Conjunctive filter for [`ExchangeStore::query`].
///
/// Empty strings count as "no constraint".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeFilter {
  /// Case-insensitive substring over the serialized exchange
  #[serde(default)]
  pub search: Option<String>,
  /// Method, compared case-insensitively
  #[serde(default)]
  pub method: Option<String>,
}

impl ExchangeFilter {
  /// Filter on a search term only
  pub fn search(term: impl Into<String>) -> Self {
    Self {
      search: Some(term.into()),
      method: None,
    }
  }

  /// Filter on a method only
  pub fn method(method: impl Into<String>) -> Self {
    Self {
      search: None,
      method: Some(method.into()),
    }
  }

  fn is_empty(&self) -> bool {
    self.search.as_deref().map_or(true, str::is_empty)
      && self.method.as_deref().map_or(true, str::is_empty)
  }

  /// Whether `exchange` satisfies every criterion
  pub fn matches(&self, exchange: &CapturedExchange) -> bool {
    if let Some(method) = self.method.as_deref().filter(|m| !m.is_empty()) {
      if !exchange.request.method.eq_ignore_ascii_case(method) {
        return false;
      }
    }
    if let Some(term) = self.search.as_deref().filter(|t| !t.is_empty()) {
      let serialized = match serde_json::to_string(exchange) {
        Ok(s) => s,
        Err(_) => return false,
      };
      if !serialized.to_lowercase().contains(&term.to_lowercase()) {
        return false;
      }
    }
    true
  }
}

/// Ordered, shared collection of exchanges, most recent first.
///
/// Cloning the store clones a handle to the same history.
#[derive(Clone, Default)]
pub struct ExchangeStore {
  entries: Arc<RwLock<VecDeque<CapturedExchange>>>,
}

impl ExchangeStore {
  /// Empty store
  pub fn new() -> Self {
    Self::default()
  }

  /// Record an exchange and return the stored form.
  ///
  /// An id is generated when the exchange has none, or when the supplied one
  /// is already taken.
  pub fn insert(&self, mut exchange: CapturedExchange) -> CapturedExchange {
    let mut entries = self.entries.write();
    if exchange.id.is_empty() || entries.iter().any(|e| e.id == exchange.id) {
      exchange.id = uuid::Uuid::now_v7().to_string();
    }
    entries.push_front(exchange.clone());
    exchange
  }

  /// Attach the outcome of an exchange.
  ///
  /// Returns the updated exchange, or `None` when the id is unknown (the
  /// history was cleared meanwhile) or the exchange already completed. A
  /// completed exchange is never modified again.
  pub fn complete(&self, id: &str, outcome: ExchangeOutcome) -> Option<CapturedExchange> {
    let mut entries = self.entries.write();
    let entry = entries.iter_mut().find(|e| e.id == id)?;
    if entry.is_complete() {
      tracing::warn!("Exchange {} already completed; outcome ignored", id);
      return None;
    }
    entry.apply(outcome);
    Some(entry.clone())
  }

  /// Snapshot of the exchanges matching `filter`, most recent first
  pub fn query(&self, filter: &ExchangeFilter) -> Vec<CapturedExchange> {
    let snapshot = self.snapshot();
    if filter.is_empty() {
      return snapshot;
    }
    snapshot.into_iter().filter(|e| filter.matches(e)).collect()
  }

  /// Snapshot of every exchange, most recent first
  pub fn snapshot(&self) -> Vec<CapturedExchange> {
    self.entries.read().iter().cloned().collect()
  }

  /// Get exchange by id
  pub fn get(&self, id: &str) -> Option<CapturedExchange> {
    self.entries.read().iter().find(|e| e.id == id).cloned()
  }

  /// Remove every exchange
  pub fn clear(&self) {
    self.entries.write().clear();
  }

  /// Number of stored exchanges
  pub fn len(&self) -> usize {
    self.entries.read().len()
  }

  /// Whether the store is empty
  pub fn is_empty(&self) -> bool {
    self.entries.read().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::exchange::{Body, Headers, RequestRecord, ResponseRecord};
  use std::collections::HashSet;

  fn request(method: &str, url: &str, body: &str) -> CapturedExchange {
    CapturedExchange::pending(RequestRecord {
      method: method.to_string(),
      url: url.to_string(),
      headers: Headers::from_iter([("Host", "example.com")]),
      body: Body::from(body),
    })
  }

  #[test]
  fn test_insert_assigns_ids_and_prepends() {
    let store = ExchangeStore::new();
    let first = store.insert(request("GET", "http://a.test/", ""));
    let second = store.insert(request("GET", "http://b.test/", ""));
    assert!(!first.id.is_empty());
    assert_ne!(first.id, second.id);

    let all = store.snapshot();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second.id);
    assert_eq!(all[1].id, first.id);
  }

  #[test]
  fn test_duplicate_supplied_id_is_replaced() {
    let store = ExchangeStore::new();
    let mut a = request("GET", "http://a.test/", "");
    a.id = "fixed".to_string();
    let mut b = request("GET", "http://b.test/", "");
    b.id = "fixed".to_string();
    let a = store.insert(a);
    let b = store.insert(b);
    assert_eq!(a.id, "fixed");
    assert_ne!(b.id, "fixed");
  }

  #[test]
  fn test_complete_happens_once() {
    let store = ExchangeStore::new();
    let stored = store.insert(request("GET", "http://a.test/", ""));
    assert!(store.get(&stored.id).unwrap().response.is_none());

    let done = store
      .complete(
        &stored.id,
        ExchangeOutcome::Completed(ResponseRecord {
          status: 200,
          headers: Headers::new(),
          body: Body::from("ok"),
          duration: 5,
        }),
      )
      .unwrap();
    assert_eq!(done.status(), Some(200));

    let again = store.complete(
      &stored.id,
      ExchangeOutcome::Failed {
        response: ResponseRecord::empty(502, 1),
        message: "late".to_string(),
      },
    );
    assert!(again.is_none());
    let reread = store.get(&stored.id).unwrap();
    assert_eq!(reread.status(), Some(200));
    assert!(!reread.error);
  }

  #[test]
  fn test_complete_after_clear_is_ignored() {
    let store = ExchangeStore::new();
    let stored = store.insert(request("GET", "http://a.test/", ""));
    store.clear();
    let result = store.complete(&stored.id, ExchangeOutcome::Completed(ResponseRecord::empty(200, 0)));
    assert!(result.is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn test_method_filter() {
    let store = ExchangeStore::new();
    store.insert(request("GET", "http://a.test/", ""));
    store.insert(request("POST", "http://a.test/form", "x=1"));
    store.insert(request("post", "http://a.test/lower", ""));

    let posts = store.query(&ExchangeFilter::method("POST"));
    assert_eq!(posts.len(), 2);
    assert!(posts.iter().all(|e| e.request.method.eq_ignore_ascii_case("post")));

    let lower = store.query(&ExchangeFilter::method("get"));
    assert_eq!(lower.len(), 1);
  }

  #[test]
  fn test_search_filter_is_case_insensitive() {
    let store = ExchangeStore::new();
    store.insert(request("POST", "http://a.test/login", "user=FooBar"));
    store.insert(request("GET", "http://b.test/", ""));

    let hits = store.query(&ExchangeFilter::search("foobar"));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].request.url, "http://a.test/login");

    // headers are part of the serialized form
    assert_eq!(store.query(&ExchangeFilter::search("EXAMPLE.COM")).len(), 2);
  }

  #[test]
  fn test_filters_are_conjunctive_and_empty_means_all() {
    let store = ExchangeStore::new();
    store.insert(request("POST", "http://a.test/foo", ""));
    store.insert(request("GET", "http://a.test/foo", ""));
    store.insert(request("POST", "http://a.test/bar", ""));

    let filter = ExchangeFilter {
      search: Some("foo".to_string()),
      method: Some("POST".to_string()),
    };
    assert_eq!(store.query(&filter).len(), 1);

    let empty = ExchangeFilter {
      search: Some(String::new()),
      method: Some(String::new()),
    };
    assert_eq!(store.query(&empty).len(), 3);
  }

  #[test]
  fn test_query_returns_snapshot() {
    let store = ExchangeStore::new();
    store.insert(request("GET", "http://a.test/", ""));
    let snapshot = store.query(&ExchangeFilter::default());
    store.clear();
    store.insert(request("GET", "http://b.test/", ""));
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].request.url, "http://a.test/");
  }

  #[test]
  fn test_clear_twice() {
    let store = ExchangeStore::new();
    store.insert(request("GET", "http://a.test/", ""));
    store.clear();
    assert!(store.is_empty());
    store.clear();
    assert!(store.is_empty());
  }

  #[test]
  fn test_concurrent_inserts_are_unique() {
    let store = ExchangeStore::new();
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let store = store.clone();
        std::thread::spawn(move || {
          for i in 0..50 {
            store.insert(request("GET", &format!("http://t{}.test/{}", t, i), ""));
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    let ids: HashSet<String> = store.snapshot().into_iter().map(|e| e.id).collect();
    assert_eq!(store.len(), 400);
    assert_eq!(ids.len(), 400);
  }
}
