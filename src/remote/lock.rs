//! Per-resource operation locks
//!
//! An interactive editor fires overlapping requests for the same path
//! (rapid clicks, preview re-triggers). Each operation claims `verb:path`
//! for its whole duration; a second caller for the same key fails fast with
//! [`RemoteError::OperationInProgress`] instead of racing the first one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::RemoteError;

/// Operation kinds that take a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Read,
    Write,
    Delete,
    Rename,
    Copy,
    Mkdir,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Copy => "copy",
            Self::Mkdir => "mkdir",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock key in `verb:absolutePath` form
pub fn lock_key(verb: Verb, path: &str) -> String {
    format!("{}:{}", verb, path)
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    acquired_at: Instant,
    token: u64,
}

/// Registry of in-flight operations
#[derive(Debug)]
pub struct OperationLockRegistry {
    locks: DashMap<String, LockEntry>,
    next_token: AtomicU64,
    /// Locks older than this are considered leaked and may be taken over
    ceiling: parking_lot::RwLock<Duration>,
}

impl OperationLockRegistry {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            next_token: AtomicU64::new(1),
            ceiling: parking_lot::RwLock::new(ceiling),
        }
    }

    /// Update the hard ceiling; it must outlast the longest operation,
    /// reconnects and retry included
    pub fn set_ceiling(&self, ceiling: Duration) {
        *self.ceiling.write() = ceiling;
    }

    /// Atomically claim `verb:path`.
    ///
    /// The returned guard releases the lock when dropped, whatever the
    /// outcome of the operation.
    pub fn acquire(
        self: &Arc<Self>,
        verb: Verb,
        path: &str,
    ) -> Result<OperationLockGuard, RemoteError> {
        let key = lock_key(verb, path);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = LockEntry {
            acquired_at: Instant::now(),
            token,
        };
        let ceiling = *self.ceiling.read();

        match self.locks.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let held_for = occupied.get().acquired_at.elapsed();
                if held_for < ceiling {
                    debug!("Lock {} busy (held for {:?})", key, held_for);
                    return Err(RemoteError::OperationInProgress {
                        verb,
                        path: path.to_string(),
                    });
                }
                warn!(
                    "Lock {} held for {:?}, beyond ceiling {:?}; taking it over",
                    key, held_for, ceiling
                );
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        debug!("Lock acquired: {}", key);
        Ok(OperationLockGuard {
            registry: Arc::clone(self),
            key,
            token,
        })
    }

    /// Release a lock by key. Releasing a missing key is a no-op.
    pub fn release(&self, key: &str) {
        if self.locks.remove(key).is_some() {
            debug!("Lock released: {}", key);
        }
    }

    fn release_token(&self, key: &str, token: u64) {
        // A lock force-released by disconnect may have been re-acquired since;
        // only the holder that owns the current token may remove it.
        if self
            .locks
            .remove_if(key, |_, entry| entry.token == token)
            .is_some()
        {
            debug!("Lock released: {}", key);
        }
    }

    /// Force-release every outstanding lock
    pub fn release_all(&self) -> usize {
        let count = self.locks.len();
        self.locks.clear();
        if count > 0 {
            debug!("Force-released {} operation locks", count);
        }
        count
    }

    pub fn is_locked(&self, verb: Verb, path: &str) -> bool {
        self.locks.contains_key(&lock_key(verb, path))
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Keys currently held
    pub fn held_keys(&self) -> Vec<String> {
        self.locks.iter().map(|e| e.key().clone()).collect()
    }
}

/// Held operation lock; released on drop
#[derive(Debug)]
pub struct OperationLockGuard {
    registry: Arc<OperationLockRegistry>,
    key: String,
    token: u64,
}

impl OperationLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for OperationLockGuard {
    fn drop(&mut self) {
        self.registry.release_token(&self.key, self.token);
    }
}
