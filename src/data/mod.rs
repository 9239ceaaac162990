// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Front door to the buffer pyramid.
//!
//! [`DataMgr`] owns one buffer manager per `(memory level, device)` pair and
//! routes every chunk request to the right one: reads pull chunks up from
//! the nearest lower level that has them, checkpoints push dirty bytes down
//! until the disk tier persists them and advances the table epoch.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, warn};

use crate::buffer::{
    AbstractBuffer, BufferMgr, BufferPin, HostSlabSource, MemoryInfo, PoolBufferMgr,
    StorageError, StorageResult, TracedStorageError,
};
use crate::config::DataMgrOptions;
use crate::device::{DeviceMgr, DeviceSlabSource};
use crate::storage::DiskBufferMgr;
use crate::sys::{default_probe, MemoryProbe, SystemMemoryUsage};
use crate::types::{ChunkKey, ChunkStats, DatabaseId, MemoryLevel, TableId};

mod chunk_locks;

pub use chunk_locks::{ChunkLockTable, ChunkMutex};

/// Owner of the buffer pyramid: `DISK -> CPU -> GPU[0..n)`.
pub struct DataMgr {
    /// `buffer_mgrs[level][device]`; the GPU level exists only when GPUs
    /// are enabled.
    buffer_mgrs: Vec<Vec<Arc<dyn BufferMgr>>>,
    disk_mgr: Arc<DiskBufferMgr>,
    device_mgr: Option<Arc<DeviceMgr>>,
    chunk_locks: ChunkLockTable,
    probe: Box<dyn MemoryProbe>,
    options: DataMgrOptions,
}

impl DataMgr {
    /// Opens the pyramid described by `options`, probing system memory with
    /// the platform default probe.
    pub fn open(options: DataMgrOptions) -> StorageResult<Self> {
        Self::open_with_probe(options, default_probe())
    }

    pub fn open_with_probe(
        options: DataMgrOptions,
        probe: Box<dyn MemoryProbe>,
    ) -> StorageResult<Self> {
        let disk_mgr = Arc::new(DiskBufferMgr::open(
            &options.data_dir,
            options.page_size,
            options.num_reader_threads,
        )?);

        let pages_per_slab = options.slab_size / options.page_size;
        assert!(pages_per_slab > 0, "slab size below one page");

        let cpu_budget = options.cpu_budget(probe.total_system_memory());
        let max_cpu_slabs = (cpu_budget / options.slab_size).max(1);
        info!(
            cpu_budget,
            slab_size = options.slab_size,
            max_cpu_slabs,
            "sizing CPU buffer pool"
        );
        let cpu_mgr: Arc<dyn BufferMgr> = Arc::new(PoolBufferMgr::new(
            MemoryLevel::Cpu,
            0,
            options.page_size,
            pages_per_slab,
            max_cpu_slabs,
            Box::new(HostSlabSource),
        ));

        let mut buffer_mgrs: Vec<Vec<Arc<dyn BufferMgr>>> = vec![
            vec![disk_mgr.clone() as Arc<dyn BufferMgr>],
            vec![cpu_mgr],
        ];

        let device_mgr = if options.use_gpus && options.num_gpus > 0 {
            let device_mgr = Arc::new(DeviceMgr::new(
                options.num_gpus,
                options.gpu_device_mem,
                options.start_gpu,
            ));
            let mut gpu_mgrs: Vec<Arc<dyn BufferMgr>> = vec![];
            for device in 0..device_mgr.num_devices() {
                let free = device_mgr.free_memory(device);
                let budget = options
                    .gpu_buffer_size
                    .unwrap_or_else(|| free.saturating_sub(options.reserved_gpu_mem));
                let max_slabs = (budget / options.slab_size).max(1);
                info!(device, free, budget, max_slabs, "sizing GPU buffer pool");
                gpu_mgrs.push(Arc::new(PoolBufferMgr::new(
                    MemoryLevel::Gpu,
                    device as i32,
                    options.page_size,
                    pages_per_slab,
                    max_slabs,
                    Box::new(DeviceSlabSource::new(device_mgr.clone(), device)),
                )));
            }
            buffer_mgrs.push(gpu_mgrs);
            Some(device_mgr)
        } else {
            None
        };

        Ok(DataMgr {
            buffer_mgrs,
            disk_mgr,
            device_mgr,
            chunk_locks: ChunkLockTable::new(),
            probe,
            options,
        })
    }

    pub fn options(&self) -> &DataMgrOptions {
        &self.options
    }

    pub fn gpus_present(&self) -> bool {
        self.device_mgr.is_some()
    }

    pub fn device_mgr(&self) -> Option<&Arc<DeviceMgr>> {
        self.device_mgr.as_ref()
    }

    /// Number of device managers per level, disk first.
    pub fn level_sizes(&self) -> Vec<usize> {
        self.buffer_mgrs.iter().map(|level| level.len()).collect()
    }

    fn mgr(&self, level: MemoryLevel, device: usize) -> StorageResult<&Arc<dyn BufferMgr>> {
        self.buffer_mgrs
            .get(level.index())
            .and_then(|mgrs| mgrs.get(device))
            .ok_or_else(|| {
                TracedStorageError::not_found(
                    "buffer manager",
                    format!("{}:{}", level, device),
                )
            })
    }

    /// Hands out the chunk's named mutex. Two readers of one chunk share it;
    /// a writer is exclusive. Lock ordering is the caller's problem.
    pub fn chunk_mutex(&self, key: &ChunkKey) -> ChunkMutex {
        self.chunk_locks.acquire(key)
    }

    /// Allocates a new chunk buffer at `(level, device)`, reserving room for
    /// `num_bytes`. Creating above disk also registers the chunk at the disk
    /// level, which stays the authoritative copy.
    pub fn create_chunk_buffer(
        &self,
        key: &ChunkKey,
        level: MemoryLevel,
        device: usize,
        page_size: usize,
        num_bytes: usize,
    ) -> StorageResult<BufferPin> {
        let mgr = self.mgr(level, device)?;
        if level != MemoryLevel::Disk && !self.disk_mgr.has_chunk(key) {
            if let Err(err) = self.disk_mgr.create_chunk_buffer(key, page_size, 0) {
                // a concurrent creator registering the same chunk is fine
                if !matches!(err.kind(), StorageError::Duplicated(..)) {
                    return Err(err);
                }
            }
        }
        mgr.create_chunk_buffer(key, page_size, num_bytes)
    }

    /// Returns the chunk at `(level, device)`, pulling it up from the
    /// nearest lower level on a miss. `num_bytes` advises the minimum
    /// reservation; oversize is permitted.
    pub fn get_chunk_buffer(
        &self,
        key: &ChunkKey,
        level: MemoryLevel,
        device: usize,
        num_bytes: usize,
    ) -> StorageResult<BufferPin> {
        let mgr = self.mgr(level, device)?;
        if mgr.has_chunk(key) || level == MemoryLevel::Disk {
            return mgr.get_chunk_buffer(key, num_bytes);
        }

        // miss: find the nearest lower level holding the chunk
        let src = self.find_below(key, level)?;
        let size = src.size().max(num_bytes);
        let dst = match mgr.create_chunk_buffer(key, src.page_size(), size) {
            Ok(dst) => dst,
            // another thread won the pull-up
            Err(err) if matches!(err.kind(), StorageError::Duplicated(..)) => {
                return mgr.get_chunk_buffer(key, num_bytes);
            }
            Err(err) => return Err(err),
        };
        let bytes = src.to_vec()?;
        dst.write(0, &bytes)?;
        // the new copy is a cache of the source, not a write
        dst.set_dirty(false);
        Ok(dst)
    }

    fn find_below(&self, key: &ChunkKey, level: MemoryLevel) -> StorageResult<BufferPin> {
        for lower in (0..level.index()).rev() {
            for mgr in &self.buffer_mgrs[lower] {
                if mgr.has_chunk(key) {
                    return mgr.get_chunk_buffer(key, 0);
                }
            }
        }
        Err(TracedStorageError::not_found("chunk", key))
    }

    /// Removes every chunk under `prefix` from one level, or from all levels
    /// top-down when `level` is `None`. A pinned chunk fails the operation;
    /// chunks already removed stay removed.
    pub fn delete_chunks_with_prefix(
        &self,
        prefix: &ChunkKey,
        level: Option<MemoryLevel>,
    ) -> StorageResult<()> {
        match level {
            Some(level) => {
                for mgr in &self.buffer_mgrs[level.index()] {
                    mgr.delete_chunks_with_prefix(prefix)?;
                }
            }
            None => {
                // caches first so the disk copy stays authoritative
                for mgrs in self.buffer_mgrs.iter().rev() {
                    for mgr in mgrs {
                        mgr.delete_chunks_with_prefix(prefix)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Anonymous buffer allocation, released with [`DataMgr::free`].
    ///
    /// Panics when called with [`MemoryLevel::Disk`]; anonymous buffers only
    /// exist in memory pools.
    pub fn alloc(
        &self,
        level: MemoryLevel,
        device: usize,
        num_bytes: usize,
    ) -> StorageResult<BufferPin> {
        assert_ne!(
            level,
            MemoryLevel::Disk,
            "anonymous allocation at the DISK level"
        );
        self.mgr(level, device)?.alloc(num_bytes)
    }

    pub fn free(&self, buffer: BufferPin) -> StorageResult<()> {
        let level = buffer.memory_level();
        let device = buffer.device_id().max(0) as usize;
        self.mgr(level, device)?.free(buffer)
    }

    pub fn free_all_buffers(&self) {
        for mgrs in &self.buffer_mgrs {
            for mgr in mgrs {
                mgr.free_all_buffers();
            }
        }
    }

    /// Byte copy between buffers, across levels and devices.
    pub fn copy(&self, dst: &dyn AbstractBuffer, src: &dyn AbstractBuffer) -> StorageResult<()> {
        let bytes = src.to_vec()?;
        dst.write(0, &bytes)
    }

    pub fn is_buffer_on_device(
        &self,
        key: &ChunkKey,
        level: MemoryLevel,
        device: usize,
    ) -> StorageResult<bool> {
        Ok(self.mgr(level, device)?.has_chunk(key))
    }

    /// One [`MemoryInfo`] per device at `level`.
    pub fn memory_info(&self, level: MemoryLevel) -> Vec<MemoryInfo> {
        self.buffer_mgrs
            .get(level.index())
            .map(|mgrs| mgrs.iter().map(|mgr| mgr.memory_info()).collect())
            .unwrap_or_default()
    }

    /// Human-readable dump of every pool at `level`.
    pub fn dump_level(&self, level: MemoryLevel) -> String {
        let mut out = String::new();
        for (device, info) in self.memory_info(level).iter().enumerate() {
            writeln!(
                out,
                "{} device {}: {}/{} pages of {} bytes{}",
                level,
                device,
                info.num_pages_allocated,
                info.max_num_pages,
                info.page_size,
                if info.is_allocation_capped {
                    " [capped]"
                } else {
                    ""
                },
            )
            .unwrap();
            for data in &info.node_memory_data {
                writeln!(
                    out,
                    "  slab {} page {:>6} +{:<6} {:?} touch {} {}",
                    data.slab,
                    data.start_page,
                    data.num_pages,
                    data.status,
                    data.touch,
                    data.chunk_key
                        .as_ref()
                        .map(|k| k.to_string())
                        .unwrap_or_default(),
                )
                .unwrap();
            }
        }
        out
    }

    /// Evicts every unpinned chunk from the level. Pinned chunks remain.
    pub fn clear_memory(&self, level: MemoryLevel) {
        warn!(%level, "clearing memory level");
        if let Some(mgrs) = self.buffer_mgrs.get(level.index()) {
            for mgr in mgrs {
                mgr.clear();
            }
        }
    }

    /// Flushes dirty chunks of the table down the pyramid, then persists
    /// them and advances the table epoch. Returns only after the disk level
    /// reflects every write that happened before the call.
    pub fn checkpoint(&self, db_id: DatabaseId, table_id: TableId) -> StorageResult<()> {
        let prefix = ChunkKey::table_prefix(db_id, table_id);
        self.push_down_dirty(Some(&prefix))?;
        self.disk_mgr.checkpoint(db_id, table_id)
    }

    /// Whole-database checkpoint, for conversion and migration paths only.
    pub fn checkpoint_all_for_migration(&self) -> StorageResult<()> {
        self.push_down_dirty(None)?;
        self.disk_mgr.checkpoint_all()
    }

    /// Copies dirty chunks at every level above disk into the level below,
    /// top-down, clearing their dirty flags.
    fn push_down_dirty(&self, prefix: Option<&ChunkKey>) -> StorageResult<()> {
        for level in (1..self.buffer_mgrs.len()).rev() {
            for mgr in &self.buffer_mgrs[level] {
                for key in mgr.dirty_chunk_keys(prefix) {
                    let src = mgr.get_chunk_buffer(&key, 0)?;
                    let below = &self.buffer_mgrs[level - 1][0];
                    let dst = if below.has_chunk(&key) {
                        below.get_chunk_buffer(&key, src.size())?
                    } else {
                        below.create_chunk_buffer(&key, src.page_size(), src.size())?
                    };
                    self.copy(&*dst, &*src)?;
                    src.set_dirty(false);
                }
            }
        }
        Ok(())
    }

    /// `(key, stats)` pairs from the disk level only.
    pub fn chunk_stats_vec(&self) -> Vec<(ChunkKey, ChunkStats)> {
        self.disk_mgr.chunk_stats_vec(None)
    }

    pub fn chunk_stats_vec_for_prefix(&self, prefix: &ChunkKey) -> Vec<(ChunkKey, ChunkStats)> {
        self.disk_mgr.chunk_stats_vec(Some(prefix))
    }

    pub fn update_chunk_stats(&self, key: &ChunkKey, stats: ChunkStats) -> StorageResult<()> {
        self.disk_mgr.update_chunk_stats(key, stats)
    }

    /// Drops everything the table owns: chunks at every level, the on-disk
    /// directory, and the chunk mutex entries.
    pub fn remove_table_related_ds(
        &self,
        db_id: DatabaseId,
        table_id: TableId,
    ) -> StorageResult<()> {
        let prefix = ChunkKey::table_prefix(db_id, table_id);
        for mgrs in self.buffer_mgrs.iter().skip(1).rev() {
            for mgr in mgrs {
                mgr.delete_chunks_with_prefix(&prefix)?;
            }
        }
        self.disk_mgr.remove_table(db_id, table_id)?;
        self.chunk_locks.remove_prefix(&prefix);
        Ok(())
    }

    pub fn get_table_epoch(&self, db_id: DatabaseId, table_id: TableId) -> u64 {
        self.disk_mgr.get_table_epoch(db_id, table_id)
    }

    pub fn set_table_epoch(
        &self,
        db_id: DatabaseId,
        table_id: TableId,
        epoch: u64,
    ) -> StorageResult<()> {
        self.disk_mgr.set_table_epoch(db_id, table_id, epoch)
    }

    /// Discards unpersisted writes to the table at every level.
    pub fn rollback(&self, db_id: DatabaseId, table_id: TableId) -> StorageResult<()> {
        let prefix = ChunkKey::table_prefix(db_id, table_id);
        for mgrs in self.buffer_mgrs.iter().skip(1).rev() {
            for mgr in mgrs {
                mgr.delete_chunks_with_prefix(&prefix)?;
            }
        }
        self.disk_mgr.rollback(db_id, table_id)
    }

    pub fn system_memory_usage(&self) -> SystemMemoryUsage {
        self.probe.system_memory_usage()
    }
}
