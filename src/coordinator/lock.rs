//! Per-key locks for mutating operations
//!
//! Fail-fast: there is no wait queue. A caller that loses the race is told to
//! come back later (409 on the HTTP surface).

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct KeyLocks {
    locked: Mutex<HashSet<Vec<u8>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` if nobody holds it.
    pub fn try_lock(&self, key: &[u8]) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        locked.insert(key.to_vec())
    }

    pub fn unlock(&self, key: &[u8]) {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        locked.remove(key);
    }

    /// Like [`try_lock`](Self::try_lock), released when the guard drops.
    pub fn acquire(&self, key: &[u8]) -> Option<KeyGuard<'_>> {
        self.try_lock(key).then(|| KeyGuard {
            locks: self,
            key: key.to_vec(),
        })
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        let locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        locked.contains(key)
    }
}

/// Held key lock
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: Vec<u8>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(&self.key);
    }
}
