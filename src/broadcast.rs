//! Fan-out of capture events to live observers
//!
//! Every observer owns a bounded queue. Publishing never waits: an observer
//! whose queue is full, or whose receiving side is gone, is evicted.

use crate::exchange::CapturedExchange;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default per-observer queue length
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Event delivered to observers, serialized as `{"type": ..., ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CaptureEvent {
  /// Sent once when an observer connects
  Init {
    /// Current capture state
    capturing: bool,
    /// Current history, most recent first
    requests: Vec<CapturedExchange>,
  },
  /// Capture state changed
  Status {
    /// New capture state
    capturing: bool,
  },
  /// An exchange was recorded
  Request {
    /// The completed exchange
    request: CapturedExchange,
  },
}

/// Identifier of a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Inner {
  observers: Mutex<HashMap<ObserverId, mpsc::Sender<Arc<CaptureEvent>>>>,
  next_id: AtomicU64,
  capacity: usize,
}

/// Fan-out channel for [`CaptureEvent`]s
#[derive(Clone)]
pub struct Broadcaster {
  inner: Arc<Inner>,
}

impl Default for Broadcaster {
  fn default() -> Self {
    Self::new(DEFAULT_QUEUE_CAPACITY)
  }
}

impl Broadcaster {
  /// Broadcaster whose observers buffer up to `capacity` events
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        observers: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        capacity: capacity.max(1),
      }),
    }
  }

  /// Register a new observer.
  ///
  /// The observer is removed when the returned [`Subscription`] is dropped.
  pub fn subscribe(&self) -> Subscription {
    let (tx, rx) = mpsc::channel(self.inner.capacity);
    let id = ObserverId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    self.inner.observers.lock().insert(id, tx);
    tracing::debug!("Observer {:?} subscribed", id);
    Subscription {
      id,
      receiver: rx,
      broadcaster: Arc::downgrade(&self.inner),
    }
  }

  /// Remove an observer. Unknown or already removed ids are ignored.
  pub fn unsubscribe(&self, id: ObserverId) {
    Self::remove(&self.inner, id);
  }

  fn remove(inner: &Inner, id: ObserverId) {
    if inner.observers.lock().remove(&id).is_some() {
      tracing::debug!("Observer {:?} unsubscribed", id);
    }
  }

  /// Deliver `event` to every current observer without waiting.
  ///
  /// Returns the number of observers that accepted the event.
  pub fn publish(&self, event: CaptureEvent) -> usize {
    let event = Arc::new(event);
    let mut observers = self.inner.observers.lock();
    observers.retain(|id, tx| match tx.try_send(event.clone()) {
      Ok(()) => true,
      Err(TrySendError::Full(_)) => {
        tracing::warn!("Observer {:?} is not keeping up; evicted", id);
        false
      }
      Err(TrySendError::Closed(_)) => false,
    });
    observers.len()
  }

  /// Number of registered observers
  pub fn observer_count(&self) -> usize {
    self.inner.observers.lock().len()
  }
}

/// Receiving end of an observer registration
pub struct Subscription {
  id: ObserverId,
  receiver: mpsc::Receiver<Arc<CaptureEvent>>,
  broadcaster: Weak<Inner>,
}

impl Subscription {
  /// This observer's id
  pub fn id(&self) -> ObserverId {
    self.id
  }

  /// Wait for the next event.
  ///
  /// Returns `None` once the observer has been evicted or unsubscribed and
  /// its queue is drained.
  pub async fn recv(&mut self) -> Option<Arc<CaptureEvent>> {
    self.receiver.recv().await
  }

  /// Next event if one is already queued
  pub fn try_recv(&mut self) -> Option<Arc<CaptureEvent>> {
    self.receiver.try_recv().ok()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.broadcaster.upgrade() {
      Broadcaster::remove(&inner, self.id);
    }
  }
}
