// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffer::{AbstractBuffer, StorageResult, TracedStorageError};
use crate::types::{ChunkKey, ChunkStats, MemoryLevel};

/// Persistent per-chunk record, stored next to the chunk's payload as
/// `<column>_<fragment>.meta.json`. Renaming it into place is the commit
/// point of a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_key: ChunkKey,
    pub epoch: u64,
    pub size: usize,
    pub page_size: usize,
    pub crc32: u32,
    pub stats: ChunkStats,
}

/// The authoritative, disk-resident copy of a chunk.
///
/// Payload bytes are cached lazily: reads fault the data file in (verifying
/// its checksum), writes mutate the cache and mark the buffer dirty, and a
/// checkpoint pushes the cache back out. Dropping the cache of a clean
/// buffer is always safe.
pub struct FileBuffer {
    key: ChunkKey,
    data_path: PathBuf,
    page_size: usize,
    size: AtomicUsize,
    /// Size of the last persisted payload, for rollback.
    persisted_size: AtomicUsize,
    crc32: AtomicU32,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    /// Whether a persisted `.data`/`.meta.json` pair exists.
    on_disk: AtomicBool,
    data: Mutex<Option<Vec<u8>>>,
    stats: Mutex<ChunkStats>,
}

impl FileBuffer {
    pub(super) fn create(key: ChunkKey, data_path: PathBuf, page_size: usize) -> Self {
        FileBuffer {
            key,
            data_path,
            page_size,
            size: AtomicUsize::new(0),
            persisted_size: AtomicUsize::new(0),
            crc32: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            on_disk: AtomicBool::new(false),
            data: Mutex::new(None),
            stats: Mutex::new(ChunkStats::default()),
        }
    }

    pub(super) fn from_meta(meta: ChunkMeta, data_path: PathBuf) -> Self {
        FileBuffer {
            key: meta.chunk_key,
            data_path,
            page_size: meta.page_size,
            size: AtomicUsize::new(meta.size),
            persisted_size: AtomicUsize::new(meta.size),
            crc32: AtomicU32::new(meta.crc32),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            on_disk: AtomicBool::new(true),
            data: Mutex::new(None),
            stats: Mutex::new(meta.stats),
        }
    }

    pub fn chunk_key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn stats(&self) -> ChunkStats {
        self.stats.lock().clone()
    }

    pub(super) fn set_stats(&self, stats: ChunkStats) {
        *self.stats.lock() = stats;
    }

    pub(super) fn meta_path(&self) -> PathBuf {
        self.data_path.with_extension("meta.json")
    }

    pub(super) fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> StorageResult<R> {
        let mut guard = self.data.lock();
        if guard.is_none() {
            if self.on_disk.load(Ordering::Acquire) {
                let bytes = std::fs::read(&self.data_path)?;
                let found = crc32fast::hash(&bytes);
                let expected = self.crc32.load(Ordering::Acquire);
                if found != expected {
                    return Err(TracedStorageError::checksum(found, expected));
                }
                *guard = Some(bytes);
            } else {
                *guard = Some(Vec::new());
            }
        }
        Ok(f(guard.as_mut().unwrap()))
    }

    /// Persists the payload and metadata at `epoch`. The metadata rename is
    /// the commit point; a crash before it leaves the previous epoch intact.
    pub(super) fn flush(&self, epoch: u64) -> StorageResult<()> {
        let mut guard = self.data.lock();
        if guard.is_none() {
            // stats-only change; fault the payload in so the rewrite keeps it
            if self.on_disk.load(Ordering::Acquire) {
                let bytes = std::fs::read(&self.data_path)?;
                let found = crc32fast::hash(&bytes);
                let expected = self.crc32.load(Ordering::Acquire);
                if found != expected {
                    return Err(TracedStorageError::checksum(found, expected));
                }
                *guard = Some(bytes);
            } else {
                *guard = Some(Vec::new());
            }
        }
        let bytes: &[u8] = guard.as_deref().unwrap();

        super::write_file_sync(&self.data_path, bytes)?;
        let crc32 = crc32fast::hash(bytes);
        let meta = ChunkMeta {
            chunk_key: self.key.clone(),
            epoch,
            size: bytes.len(),
            page_size: self.page_size,
            crc32,
            stats: self.stats.lock().clone(),
        };
        super::commit_json(&self.meta_path(), &meta)?;

        self.crc32.store(crc32, Ordering::Release);
        self.persisted_size.store(bytes.len(), Ordering::Release);
        self.on_disk.store(true, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Discards unpersisted writes, restoring the last checkpointed state.
    pub(super) fn discard_writes(&self) {
        *self.data.lock() = None;
        self.size
            .store(self.persisted_size.load(Ordering::Acquire), Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }

    pub(super) fn is_on_disk(&self) -> bool {
        self.on_disk.load(Ordering::Acquire)
    }

    /// Drops the payload cache if no writes would be lost.
    pub(super) fn drop_clean_cache(&self) {
        if !self.is_dirty() {
            *self.data.lock() = None;
        }
    }
}

impl AbstractBuffer for FileBuffer {
    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn reserved_size(&self) -> usize {
        // disk chunks grow freely; reservation is the page-rounded size
        self.size().div_ceil(self.page_size).max(1) * self.page_size
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn memory_level(&self) -> MemoryLevel {
        MemoryLevel::Disk
    }

    fn device_id(&self) -> i32 {
        0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin of unpinned chunk {}", self.key);
    }

    fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> StorageResult<()> {
        let end = offset + dst.len();
        if end > self.size() {
            return Err(TracedStorageError::not_found(
                "chunk range",
                format!("{}..{} of {}", offset, end, self.key),
            ));
        }
        self.with_data(|data| dst.copy_from_slice(&data[offset..end]))
    }

    fn write(&self, offset: usize, src: &[u8]) -> StorageResult<()> {
        let end = offset + src.len();
        self.with_data(|data| {
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset..end].copy_from_slice(src);
        })?;
        self.size.fetch_max(end, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn append(&self, src: &[u8]) -> StorageResult<()> {
        self.write(self.size(), src)
    }
}
