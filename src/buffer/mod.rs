// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Fixed-budget buffer pools.
//!
//! Each pool manages one `(memory level, device)` pair: a byte budget carved
//! into slabs, each slab carved into fixed-size pages. Chunks live in ordered
//! page runs inside slabs and are evicted least-recently-touched first when
//! an allocation cannot be satisfied.

use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{ChunkKey, MemoryLevel};

pub mod error;
mod buffer;
mod pool;
mod slab;

pub use buffer::SlabBuffer;
pub use error::{StorageError, StorageResult, TracedStorageError};
pub use pool::PoolBufferMgr;
pub use slab::{HostSlabSource, SlabSource};
pub(crate) use slab::Slab;

/// Status of one page run inside a slab.
///
/// `Free -> Used` on allocation, `Used -> Evicted` on victim selection,
/// `Evicted -> Free` on slab compaction, `Used -> Free` on explicit delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemStatus {
    Free,
    Used,
    Evicted,
}

/// One page run of a pool, as reported by telemetry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryData {
    pub slab: usize,
    pub start_page: usize,
    pub num_pages: usize,
    pub touch: u64,
    pub chunk_key: Option<ChunkKey>,
    pub status: MemStatus,
}

/// Summary of one buffer pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub page_size: usize,
    pub max_num_pages: usize,
    pub num_pages_allocated: usize,
    pub is_allocation_capped: bool,
    pub node_memory_data: Vec<MemoryData>,
}

/// A region of bytes resident at one `(level, device)` location.
///
/// Handles stay valid while pinned; an unpinned handle may be invalidated by
/// eviction at any time, after which accesses fail with `NotFound`.
pub trait AbstractBuffer: Send + Sync {
    fn size(&self) -> usize;
    fn reserved_size(&self) -> usize;
    fn page_size(&self) -> usize;
    fn memory_level(&self) -> MemoryLevel;
    fn device_id(&self) -> i32;

    fn pin(&self);
    fn unpin(&self);
    fn pin_count(&self) -> u32;

    fn is_dirty(&self) -> bool;
    fn set_dirty(&self, dirty: bool);

    fn read(&self, offset: usize, dst: &mut [u8]) -> StorageResult<()>;
    /// Writes mark the buffer dirty. Writing past `size` grows the buffer up
    /// to `reserved_size`.
    fn write(&self, offset: usize, src: &[u8]) -> StorageResult<()>;
    fn append(&self, src: &[u8]) -> StorageResult<()>;

    fn to_vec(&self) -> StorageResult<Vec<u8>> {
        let mut data = vec![0; self.size()];
        self.read(0, &mut data)?;
        Ok(data)
    }
}

pub type BufferRef = Arc<dyn AbstractBuffer>;

/// RAII pin over a buffer handle. The pool will not evict the underlying
/// chunk while any `BufferPin` is alive.
pub struct BufferPin {
    buffer: BufferRef,
}

impl std::fmt::Debug for BufferPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPin").finish_non_exhaustive()
    }
}

impl BufferPin {
    pub fn new(buffer: BufferRef) -> Self {
        buffer.pin();
        BufferPin { buffer }
    }

    pub fn buffer(&self) -> &BufferRef {
        &self.buffer
    }
}

impl Clone for BufferPin {
    fn clone(&self) -> Self {
        BufferPin::new(self.buffer.clone())
    }
}

impl Deref for BufferPin {
    type Target = dyn AbstractBuffer;

    fn deref(&self) -> &Self::Target {
        &*self.buffer
    }
}

impl Drop for BufferPin {
    fn drop(&mut self) {
        self.buffer.unpin();
    }
}

/// Capability set of one buffer pool: allocate, fetch, evict, report.
///
/// One implementation per tier: [`PoolBufferMgr`] for CPU and GPU pools,
/// [`DiskBufferMgr`](crate::storage::DiskBufferMgr) for the authoritative
/// disk level.
pub trait BufferMgr: Send + Sync {
    fn memory_level(&self) -> MemoryLevel;
    fn device_id(&self) -> i32;

    /// Allocates a new chunk buffer. Fails with `Duplicated` if the chunk
    /// already exists here, or `AllocationCapped` if the pool cannot satisfy
    /// the reservation after maximal eviction.
    fn create_chunk_buffer(
        &self,
        key: &ChunkKey,
        page_size: usize,
        num_bytes: usize,
    ) -> StorageResult<BufferPin>;

    /// Returns the resident chunk, or `NotFound`. The disk level materializes
    /// the chunk from its file instead of failing.
    fn get_chunk_buffer(&self, key: &ChunkKey, num_bytes: usize) -> StorageResult<BufferPin>;

    fn has_chunk(&self, key: &ChunkKey) -> bool;

    fn delete_chunk(&self, key: &ChunkKey) -> StorageResult<()>;

    /// Removes every chunk whose key begins with `prefix`. Fails with
    /// `Pinned` on the first pinned chunk; earlier removals are kept.
    fn delete_chunks_with_prefix(&self, prefix: &ChunkKey) -> StorageResult<()>;

    /// Anonymous (non-chunk) allocation, released with [`BufferMgr::free`].
    fn alloc(&self, num_bytes: usize) -> StorageResult<BufferPin>;

    fn free(&self, buffer: BufferPin) -> StorageResult<()>;

    fn free_all_buffers(&self);

    /// Evicts every unpinned chunk and resets the allocation-capped latch.
    fn clear(&self);

    /// Keys of dirty chunks under `prefix` (all chunks when `None`).
    fn dirty_chunk_keys(&self, prefix: Option<&ChunkKey>) -> Vec<ChunkKey>;

    fn memory_info(&self) -> MemoryInfo;
}
