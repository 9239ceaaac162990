// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Catalog lock discipline.
//!
//! Each catalog carries a shared/exclusive mutex over its in-memory state
//! and a plain mutex over its persistence layer. Guards are reentrant by
//! thread identity: a thread that already holds a sufficient lock gets a
//! no-op guard, and the guard itself carries that ticket instead of hiding
//! it in thread-local flags.
//!
//! Locking order, violations of which are not detected:
//! across catalogs, read/write before persist; within a hierarchy, parent
//! catalog locks before child catalog locks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Crate-local thread identity: dense tokens starting at 1, so 0 can mean
/// "no thread" in owner fields.
fn current_thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

const NO_THREAD: u64 = 0;

/// The lock pair of one catalog.
#[derive(Default)]
pub struct CatalogLocks {
    shared: RwLock<()>,
    persist: Mutex<()>,
    write_owner: AtomicU64,
    persist_owner: AtomicU64,
    read_holders: Mutex<HashSet<u64>>,
}

impl CatalogLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared lock over the catalog state. No-op if this thread already
    /// holds the write lock or a read lock.
    pub fn read(&self) -> CatalogReadGuard<'_> {
        let token = current_thread_token();
        if self.write_owner.load(Ordering::Acquire) == token
            || self.read_holders.lock().contains(&token)
        {
            return CatalogReadGuard {
                locks: self,
                token,
                inner: None,
            };
        }
        let inner = self.shared.read();
        self.read_holders.lock().insert(token);
        CatalogReadGuard {
            locks: self,
            token,
            inner: Some(inner),
        }
    }

    /// Exclusive lock over the catalog state. No-op if this thread already
    /// holds it. Taking the write lock while holding only a read lock on
    /// the same thread deadlocks; order writes first.
    pub fn write(&self) -> CatalogWriteGuard<'_> {
        let token = current_thread_token();
        if self.write_owner.load(Ordering::Acquire) == token {
            return CatalogWriteGuard {
                locks: self,
                inner: None,
            };
        }
        let inner = self.shared.write();
        self.write_owner.store(token, Ordering::Release);
        CatalogWriteGuard {
            locks: self,
            inner: Some(inner),
        }
    }

    /// Lock of the persistence layer. Takes a read lock first so the
    /// cross-catalog ordering holds, then the persistence mutex unless this
    /// thread already owns it.
    pub fn persist(&self) -> CatalogPersistGuard<'_> {
        let read = self.read();
        let token = current_thread_token();
        if self.persist_owner.load(Ordering::Acquire) == token {
            return CatalogPersistGuard {
                locks: self,
                _read: read,
                inner: None,
            };
        }
        let inner = self.persist.lock();
        self.persist_owner.store(token, Ordering::Release);
        CatalogPersistGuard {
            locks: self,
            _read: read,
            inner: Some(inner),
        }
    }
}

/// RAII shared guard; `inner` is `None` for a reentrant no-op.
pub struct CatalogReadGuard<'a> {
    locks: &'a CatalogLocks,
    token: u64,
    inner: Option<RwLockReadGuard<'a, ()>>,
}

impl CatalogReadGuard<'_> {
    pub fn is_reentrant(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for CatalogReadGuard<'_> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.locks.read_holders.lock().remove(&self.token);
        }
    }
}

pub struct CatalogWriteGuard<'a> {
    locks: &'a CatalogLocks,
    inner: Option<RwLockWriteGuard<'a, ()>>,
}

impl CatalogWriteGuard<'_> {
    pub fn is_reentrant(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for CatalogWriteGuard<'_> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.locks.write_owner.store(NO_THREAD, Ordering::Release);
        }
    }
}

pub struct CatalogPersistGuard<'a> {
    locks: &'a CatalogLocks,
    _read: CatalogReadGuard<'a>,
    inner: Option<MutexGuard<'a, ()>>,
}

impl CatalogPersistGuard<'_> {
    pub fn is_reentrant(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for CatalogPersistGuard<'_> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.locks.persist_owner.store(NO_THREAD, Ordering::Release);
        }
    }
}
