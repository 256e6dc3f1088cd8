// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-key serialization of authentication.
//!
//! Concurrent dispatches that share a key reference authenticate one at a
//! time. Established sessions are not affected.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

#[derive(Clone, Default)]
pub struct KeyLocks {
    locks: Arc<Mutex<LockMap>>,
}

/// Exclusive use of one key. Dropping it releases the key and forgets it
/// when nobody else is waiting.
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
    key: PathBuf,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Hold the map so no new waiter can clone the entry in between
        let mut locks = self.locks.lock();
        self.guard.take();
        let idle = locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.key);
        }
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &Path) -> KeyGuard {
        let lock = self.locks.lock().entry(key.to_path_buf()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyGuard { guard: Some(guard), locks: Arc::clone(&self.locks), key: key.to_path_buf() }
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "keys_tests.rs"]
mod tests;
