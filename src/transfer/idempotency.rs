//! Idempotency keys
//!
//! Requests that share a key are serialized in-process by [`KeyedLocks`].
//! Across processes the unique index on `transfers.idempotency_key` decides:
//! the loser of the insert race replays the stored transfer.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::LedgerError;

/// Maximum idempotency key length
pub const MAX_KEY_LEN: usize = 128;

/// Check key format: 1-128 printable ASCII characters, no spaces at the edges
pub fn validate_key(key: &str) -> Result<(), LedgerError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(LedgerError::InvalidIdempotencyKey(format!(
            "length must be 1-{MAX_KEY_LEN} characters, got {}",
            key.len()
        )));
    }
    if !key.chars().all(|c| c.is_ascii_graphic() || c == ' ') || key.trim() != key {
        return Err(LedgerError::InvalidIdempotencyKey(format!(
            "'{key}' must be printable ASCII without surrounding spaces"
        )));
    }
    Ok(())
}

/// One async mutex per in-flight key
#[derive(Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder of `key` remains
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        // Built before waiting: if this future is dropped mid-wait, the
        // guard's drop still removes an entry nobody else references.
        let mut waiter = KeyGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: None,
        };
        waiter.guard = Some(lock.lock_owned().await);
        waiter
    }

    /// Number of keys with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held for the duration of one keyed request
pub struct KeyGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the strong count reflects only map + waiters.
        // A cancelled waiter has no guard; its lock handle is already gone.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
