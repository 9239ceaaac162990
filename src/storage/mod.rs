// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The disk tier: authoritative chunk storage under `data_dir`.
//!
//! Layout is one directory per table, `<data_dir>/<db>_<table>/`, holding a
//! payload file and a JSON metadata file per chunk plus the table's epoch
//! record. Every commit point is a write-temp-then-rename of a metadata
//! file, so a crash mid-checkpoint leaves the previous epoch readable.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffer::{
    AbstractBuffer, BufferMgr, BufferPin, MemStatus, MemoryData, MemoryInfo, StorageResult,
    TracedStorageError,
};
use crate::types::{ChunkKey, ChunkStats, DatabaseId, MemoryLevel, TableId};

mod file_buffer;

pub use file_buffer::{ChunkMeta, FileBuffer};

const EPOCH_FILE_NAME: &str = "epoch.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct EpochRecord {
    epoch: u64,
}

pub(crate) fn write_file_sync(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    Ok(())
}

/// Writes `value` as JSON to `<path>.tmp`, then renames over `path`.
pub(crate) fn commit_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    write_file_sync(&tmp, &serde_json::to_vec(value)?)?;
    std::fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_data()?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    Ok(serde_json::from_slice(&std::fs::read(path)?)?)
}

fn table_dir_name(db_id: DatabaseId, table_id: TableId) -> String {
    format!("{}_{}", db_id, table_id)
}

fn parse_table_dir_name(name: &str) -> Option<(DatabaseId, TableId)> {
    let (db, table) = name.split_once('_')?;
    Some((db.parse().ok()?, table.parse().ok()?))
}

#[derive(Default)]
struct DiskInner {
    /// Ordered so prefix scans are contiguous ranges.
    buffers: std::collections::BTreeMap<ChunkKey, Arc<FileBuffer>>,
    epochs: HashMap<(DatabaseId, TableId), u64>,
}

/// Buffer manager of the DISK level.
///
/// Unlike the pools above it, this manager never evicts chunk *entries*:
/// clearing memory only drops clean payload caches, and the entry (and its
/// files) stay authoritative until explicitly deleted.
pub struct DiskBufferMgr {
    data_dir: PathBuf,
    page_size: usize,
    inner: RwLock<DiskInner>,
}

impl DiskBufferMgr {
    /// Opens `data_dir`, replaying every table directory found inside.
    /// Metadata files are read by up to `num_reader_threads` workers.
    pub fn open(
        data_dir: impl AsRef<Path>,
        page_size: usize,
        num_reader_threads: usize,
    ) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let mut inner = DiskInner::default();
        let mut meta_paths = vec![];
        for entry in std::fs::read_dir(&data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some((db_id, table_id)) =
                entry.file_name().to_str().and_then(parse_table_dir_name)
            else {
                warn!("skipping unrecognized entry {:?} in data dir", entry.path());
                continue;
            };

            let epoch_path = entry.path().join(EPOCH_FILE_NAME);
            if epoch_path.exists() {
                let record: EpochRecord = read_json(&epoch_path)?;
                inner.epochs.insert((db_id, table_id), record.epoch);
            }

            for chunk_entry in std::fs::read_dir(entry.path())? {
                let path = chunk_entry?.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                // a leftover .tmp is an uncommitted write; the previous epoch wins
                if name.ends_with(".meta.json") {
                    meta_paths.push(path);
                }
            }
        }

        let loaded = Self::load_metadata(&meta_paths, num_reader_threads.max(1))?;
        for buffer in loaded {
            inner.buffers.insert(buffer.chunk_key().clone(), buffer);
        }

        info!(
            data_dir = %data_dir.display(),
            chunks = inner.buffers.len(),
            tables = inner.epochs.len(),
            "opened disk buffer manager"
        );
        Ok(DiskBufferMgr {
            data_dir,
            page_size,
            inner: RwLock::new(inner),
        })
    }

    fn load_metadata(
        meta_paths: &[PathBuf],
        num_threads: usize,
    ) -> StorageResult<Vec<Arc<FileBuffer>>> {
        let loaded = Mutex::new(Vec::with_capacity(meta_paths.len()));
        let failure = Mutex::new(None);
        let (loaded_ref, failure_ref) = (&loaded, &failure);
        std::thread::scope(|scope| {
            for paths in meta_paths.chunks(meta_paths.len().div_ceil(num_threads).max(1)) {
                scope.spawn(move || {
                    for path in paths {
                        match read_json::<ChunkMeta>(path) {
                            Ok(meta) => {
                                let data_path = path
                                    .parent()
                                    .unwrap()
                                    .join(data_file_name(&meta.chunk_key));
                                loaded_ref
                                    .lock()
                                    .push(Arc::new(FileBuffer::from_meta(meta, data_path)));
                            }
                            Err(err) => {
                                *failure_ref.lock() = Some(err);
                                return;
                            }
                        }
                    }
                });
            }
        });
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        Ok(loaded.into_inner())
    }

    fn table_dir(&self, db_id: DatabaseId, table_id: TableId) -> PathBuf {
        self.data_dir.join(table_dir_name(db_id, table_id))
    }

    fn chunk_paths(&self, key: &ChunkKey) -> (PathBuf, PathBuf) {
        let dir = self.table_dir(key.db_id().unwrap_or(-1), key.table_id().unwrap_or(-1));
        let data = dir.join(data_file_name(key));
        let meta = data.with_extension("meta.json");
        (data, meta)
    }

    fn find(&self, key: &ChunkKey) -> StorageResult<Arc<FileBuffer>> {
        self.inner
            .read()
            .buffers
            .get(key)
            .cloned()
            .ok_or_else(|| TracedStorageError::not_found("chunk", key))
    }

    fn keys_with_prefix(inner: &DiskInner, prefix: &ChunkKey) -> Vec<ChunkKey> {
        inner
            .buffers
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Persists dirty chunks of the table and advances its epoch. The epoch
    /// file rename is the last step; everything before it is invisible to a
    /// restart.
    pub fn checkpoint(&self, db_id: DatabaseId, table_id: TableId) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let prefix = ChunkKey::table_prefix(db_id, table_id);
        let epoch = inner.epochs.get(&(db_id, table_id)).copied().unwrap_or(0) + 1;

        std::fs::create_dir_all(self.table_dir(db_id, table_id))?;
        let mut flushed = 0;
        for key in Self::keys_with_prefix(&inner, &prefix) {
            let buffer = inner.buffers[&key].clone();
            if buffer.is_dirty() {
                buffer.flush(epoch)?;
                flushed += 1;
            }
        }

        commit_json(
            &self.table_dir(db_id, table_id).join(EPOCH_FILE_NAME),
            &EpochRecord { epoch },
        )?;
        inner.epochs.insert((db_id, table_id), epoch);
        info!(db_id, table_id, epoch, flushed, "table checkpoint complete");
        Ok(())
    }

    /// Checkpoints every table known to this manager. Only conversion and
    /// migration paths may use this.
    pub fn checkpoint_all(&self) -> StorageResult<()> {
        let tables: Vec<(DatabaseId, TableId)> = {
            let inner = self.inner.read();
            inner
                .buffers
                .keys()
                .filter_map(|key| Some((key.db_id()?, key.table_id()?)))
                .chain(inner.epochs.keys().copied())
                .unique()
                .sorted()
                .collect()
        };
        for (db_id, table_id) in tables {
            self.checkpoint(db_id, table_id)?;
        }
        Ok(())
    }

    /// Discards every unpersisted write to the table, restoring the state of
    /// its last checkpoint.
    pub fn rollback(&self, db_id: DatabaseId, table_id: TableId) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let prefix = ChunkKey::table_prefix(db_id, table_id);
        for key in Self::keys_with_prefix(&inner, &prefix) {
            let buffer = inner.buffers[&key].clone();
            if buffer.is_on_disk() {
                buffer.discard_writes();
            } else {
                // never checkpointed; the chunk does not survive rollback
                inner.buffers.remove(&key);
            }
        }
        info!(db_id, table_id, "table rollback complete");
        Ok(())
    }

    pub fn get_table_epoch(&self, db_id: DatabaseId, table_id: TableId) -> u64 {
        self.inner
            .read()
            .epochs
            .get(&(db_id, table_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_table_epoch(
        &self,
        db_id: DatabaseId,
        table_id: TableId,
        epoch: u64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        std::fs::create_dir_all(self.table_dir(db_id, table_id))?;
        commit_json(
            &self.table_dir(db_id, table_id).join(EPOCH_FILE_NAME),
            &EpochRecord { epoch },
        )?;
        inner.epochs.insert((db_id, table_id), epoch);
        Ok(())
    }

    /// `(key, stats)` of every chunk, or of those under `prefix`.
    pub fn chunk_stats_vec(&self, prefix: Option<&ChunkKey>) -> Vec<(ChunkKey, ChunkStats)> {
        let inner = self.inner.read();
        let keys = match prefix {
            Some(prefix) => Self::keys_with_prefix(&inner, prefix),
            None => inner.buffers.keys().cloned().collect(),
        };
        keys.into_iter()
            .map(|key| {
                let stats = inner.buffers[&key].stats();
                (key, stats)
            })
            .collect()
    }

    pub fn update_chunk_stats(&self, key: &ChunkKey, stats: ChunkStats) -> StorageResult<()> {
        let buffer = self.find(key)?;
        buffer.set_stats(stats);
        buffer.set_dirty(true);
        Ok(())
    }

    /// Deletes the table's chunks, its epoch record, and its directory.
    pub fn remove_table(&self, db_id: DatabaseId, table_id: TableId) -> StorageResult<()> {
        self.delete_chunks_with_prefix(&ChunkKey::table_prefix(db_id, table_id))?;
        let mut inner = self.inner.write();
        inner.epochs.remove(&(db_id, table_id));
        let dir = self.table_dir(db_id, table_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

impl BufferMgr for DiskBufferMgr {
    fn memory_level(&self) -> MemoryLevel {
        MemoryLevel::Disk
    }

    fn device_id(&self) -> i32 {
        0
    }

    fn create_chunk_buffer(
        &self,
        key: &ChunkKey,
        page_size: usize,
        _num_bytes: usize,
    ) -> StorageResult<BufferPin> {
        let mut inner = self.inner.write();
        if inner.buffers.contains_key(key) {
            return Err(TracedStorageError::duplicated("chunk", key));
        }
        let (data_path, _) = self.chunk_paths(key);
        let page_size = if page_size == 0 { self.page_size } else { page_size };
        let buffer = Arc::new(FileBuffer::create(key.clone(), data_path, page_size));
        inner.buffers.insert(key.clone(), buffer.clone());
        Ok(BufferPin::new(buffer))
    }

    fn get_chunk_buffer(&self, key: &ChunkKey, _num_bytes: usize) -> StorageResult<BufferPin> {
        Ok(BufferPin::new(self.find(key)?))
    }

    fn has_chunk(&self, key: &ChunkKey) -> bool {
        self.inner.read().buffers.contains_key(key)
    }

    fn delete_chunk(&self, key: &ChunkKey) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let buffer = inner
            .buffers
            .get(key)
            .ok_or_else(|| TracedStorageError::not_found("chunk", key))?;
        if buffer.pin_count() > 0 {
            return Err(TracedStorageError::pinned("chunk", key));
        }
        let buffer = inner.buffers.remove(key).unwrap();
        for path in [buffer.data_path().to_path_buf(), buffer.meta_path()] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn delete_chunks_with_prefix(&self, prefix: &ChunkKey) -> StorageResult<()> {
        let keys = Self::keys_with_prefix(&self.inner.read(), prefix);
        for key in keys {
            self.delete_chunk(&key)?;
        }
        Ok(())
    }

    fn alloc(&self, _num_bytes: usize) -> StorageResult<BufferPin> {
        unreachable!("anonymous allocation is not supported at the DISK level")
    }

    fn free(&self, _buffer: BufferPin) -> StorageResult<()> {
        unreachable!("anonymous allocation is not supported at the DISK level")
    }

    fn free_all_buffers(&self) {}

    fn clear(&self) {
        // entries stay authoritative; only clean payload caches are dropped
        let inner = self.inner.read();
        for buffer in inner.buffers.values() {
            if buffer.pin_count() == 0 {
                buffer.drop_clean_cache();
            }
        }
    }

    fn dirty_chunk_keys(&self, prefix: Option<&ChunkKey>) -> Vec<ChunkKey> {
        let inner = self.inner.read();
        inner
            .buffers
            .iter()
            .filter(|(key, buffer)| {
                buffer.is_dirty() && prefix.map(|p| key.starts_with(p)).unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn memory_info(&self) -> MemoryInfo {
        let inner = self.inner.read();
        let node_memory_data: Vec<MemoryData> = inner
            .buffers
            .values()
            .map(|buffer| MemoryData {
                slab: 0,
                start_page: 0,
                num_pages: buffer.size().div_ceil(self.page_size),
                touch: 0,
                chunk_key: Some(buffer.chunk_key().clone()),
                status: MemStatus::Used,
            })
            .collect();
        let num_pages = node_memory_data.iter().map(|d| d.num_pages).sum();
        MemoryInfo {
            page_size: self.page_size,
            max_num_pages: num_pages,
            num_pages_allocated: num_pages,
            is_allocation_capped: false,
            node_memory_data,
        }
    }
}

fn data_file_name(key: &ChunkKey) -> String {
    format!(
        "{}_{}.data",
        key.column_id().unwrap_or(-1),
        key.fragment_id().unwrap_or(-1)
    )
}
