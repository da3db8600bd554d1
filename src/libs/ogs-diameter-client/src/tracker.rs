//! Pending request tracker
//!
//! Maps an application-chosen key to the one-shot channel that will carry
//! the answer once it arrives on whichever link it arrives on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{DiameterError, DiameterResult};

/// Correlation key of a pending request, typically a Session-Id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(key: impl Into<String>) -> Self {
        RequestKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        RequestKey(key.to_string())
    }
}

impl From<String> for RequestKey {
    fn from(key: String) -> Self {
        RequestKey(key)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one [`RequestTracker::register`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration(u64);

struct Pending<A> {
    registration: Registration,
    done: oneshot::Sender<A>,
}

/// Key → answer channel map
pub struct RequestTracker<A> {
    pending: Mutex<HashMap<RequestKey, Pending<A>>>,
    next_registration: AtomicU64,
}

impl<A> RequestTracker<A> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_registration: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<RequestKey, Pending<A>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `key`. A channel already registered under the same key is
    /// dropped, so its receiver sees the sender closed.
    pub fn register(&self, key: RequestKey, done: oneshot::Sender<A>) -> Registration {
        let registration = Registration(self.next_registration.fetch_add(1, Ordering::Relaxed));
        let entry = Pending { registration, done };
        if self.pending().insert(key.clone(), entry).is_some() {
            log::debug!("[{key}] replaced pending request");
        }
        registration
    }

    /// Stop tracking `key` and hand back its channel.
    pub fn deregister(&self, key: &RequestKey) -> DiameterResult<oneshot::Sender<A>> {
        self.pending()
            .remove(key)
            .map(|entry| entry.done)
            .ok_or_else(|| DiameterError::RequestNotFound(key.to_string()))
    }

    /// Stop tracking `key` only if it still belongs to `registration`.
    /// Returns whether an entry was removed.
    pub fn withdraw(&self, key: &RequestKey, registration: Registration) -> bool {
        let mut pending = self.pending();
        if pending.get(key).is_some_and(|entry| entry.registration == registration) {
            pending.remove(key);
            return true;
        }
        false
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.pending().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

impl<A> Default for RequestTracker<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for RequestTracker<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracker")
            .field("pending", &self.len())
            .finish()
    }
}
