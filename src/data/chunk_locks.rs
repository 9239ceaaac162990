// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::ChunkKey;

struct LockEntry {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// One named shared-mutex per live chunk.
///
/// Handles are refcounted: an entry exists only while at least one
/// [`ChunkMutex`] for its key is alive, so the table does not grow with the
/// lifetime of the process.
#[derive(Default)]
pub struct ChunkLockTable {
    inner: Arc<Mutex<HashMap<ChunkKey, LockEntry>>>,
}

impl ChunkLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the chunk's mutex, creating it on first use. The caller
    /// locks and unlocks explicitly; no ordering is enforced here.
    pub fn acquire(&self, key: &ChunkKey) -> ChunkMutex {
        let mut map = self.inner.lock();
        let entry = map.entry(key.clone()).or_insert_with(|| LockEntry {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        entry.refs += 1;
        ChunkMutex {
            key: key.clone(),
            lock: entry.lock.clone(),
            table: self.inner.clone(),
        }
    }

    /// Eagerly drops entries under `prefix`. Outstanding handles stay
    /// usable; their drop just finds nothing to decrement.
    pub fn remove_prefix(&self, prefix: &ChunkKey) {
        self.inner.lock().retain(|key, _| !key.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Refcounted handle to one chunk's mutex.
pub struct ChunkMutex {
    key: ChunkKey,
    lock: Arc<RwLock<()>>,
    table: Arc<Mutex<HashMap<ChunkKey, LockEntry>>>,
}

impl ChunkMutex {
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }
}

impl Drop for ChunkMutex {
    fn drop(&mut self) {
        let mut map = self.table.lock();
        if let Some(entry) = map.get_mut(&self.key) {
            // the entry may have been replaced after a remove_prefix
            if Arc::ptr_eq(&entry.lock, &self.lock) {
                entry.refs -= 1;
                if entry.refs == 0 {
                    map.remove(&self.key);
                }
            }
        }
    }
}
