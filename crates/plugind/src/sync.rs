//! Synchronization primitives for plugind.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock for '{0}' is held")]
    Held(String),

    #[error("timed out after {timeout:?} waiting for lock '{key}'")]
    Timeout { key: String, timeout: Duration },
}

/// A key's mutex plus the number of callers waiting on or holding it.
struct LockEntry {
    mutex: Arc<Mutex<()>>,
    refs: usize,
}

type LockTable = DashMap<String, LockEntry>;

// ============================================================================
// GranularityLock
// ============================================================================

/// Per-key async mutex with reference-counted entries.
///
/// Operations on the same key are serialized while unrelated keys proceed in
/// parallel. An entry lives only while someone waits on or holds it, so the
/// table never grows with keys that are no longer in use.
///
/// ```ignore
/// let locks = GranularityLock::new();
/// let _guard = locks.lock("acme/echo:0.1.0").await;
/// // launching the same identity elsewhere waits here
/// ```
#[derive(Clone, Default)]
pub struct GranularityLock {
    table: Arc<LockTable>,
}

impl GranularityLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting while another caller holds it.
    ///
    /// Dropping the returned future before it resolves releases the waiter's
    /// reference, so cancelled waits do not leak entries.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let (mutex, key_ref) = self.retain(key);
        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _ref: key_ref,
        }
    }

    /// Acquire the lock for `key` only if it is free right now.
    pub fn try_lock(&self, key: &str) -> Result<KeyGuard, LockError> {
        let (mutex, key_ref) = self.retain(key);
        match mutex.try_lock_owned() {
            Ok(guard) => Ok(KeyGuard {
                _guard: guard,
                _ref: key_ref,
            }),
            // key_ref drops here and gives back the reference taken above.
            Err(_) => Err(LockError::Held(key.to_string())),
        }
    }

    /// Acquire the lock for `key`, giving up after `timeout`.
    pub async fn lock_timeout(&self, key: &str, timeout: Duration) -> Result<KeyGuard, LockError> {
        tokio::time::timeout(timeout, self.lock(key))
            .await
            .map_err(|_| {
                debug!(key, ?timeout, "Keyed lock acquisition timed out");
                LockError::Timeout {
                    key: key.to_string(),
                    timeout,
                }
            })
    }

    /// Number of keys currently waited on or held.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Reference count for `key` (0 when absent).
    pub fn refs(&self, key: &str) -> usize {
        self.table.get(key).map(|e| e.refs).unwrap_or(0)
    }

    fn retain(&self, key: &str) -> (Arc<Mutex<()>>, KeyRef) {
        let mut entry = self
            .table
            .entry(key.to_string())
            .or_insert_with(|| LockEntry {
                mutex: Arc::new(Mutex::new(())),
                refs: 0,
            });
        entry.refs += 1;
        let mutex = Arc::clone(&entry.mutex);
        drop(entry);

        (
            mutex,
            KeyRef {
                table: Arc::clone(&self.table),
                key: key.to_string(),
            },
        )
    }
}

/// One counted reference to a table entry. Dropping it decrements the count
/// and removes the entry once nobody else references it.
struct KeyRef {
    table: Arc<LockTable>,
    key: String,
}

impl Drop for KeyRef {
    fn drop(&mut self) {
        self.table.remove_if_mut(&self.key, |_, entry| {
            entry.refs -= 1;
            entry.refs == 0
        });
    }
}

/// Held lock for one key. Dropping it unlocks.
pub struct KeyGuard {
    // Field order matters: the mutex is released before the reference.
    _guard: OwnedMutexGuard<()>,
    _ref: KeyRef,
}

impl KeyGuard {
    /// Release the lock explicitly.
    pub fn unlock(self) {}
}

// ============================================================================
// Tests
// ============================================================================
