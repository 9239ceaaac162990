// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use parking_lot::Mutex;

use super::StorageResult;

/// Source of slab memory for a pool: host heap, or a device allocator that
/// accounts against a fixed per-device budget.
pub trait SlabSource: Send + Sync {
    /// Obtains one contiguous slab of `num_bytes`, zeroed.
    fn alloc_slab(&self, num_bytes: usize) -> StorageResult<Box<[u8]>>;

    /// Returns the slab's bytes to the source's accounting.
    fn free_slab(&self, num_bytes: usize);
}

/// Host-memory slab source.
pub struct HostSlabSource;

impl SlabSource for HostSlabSource {
    fn alloc_slab(&self, num_bytes: usize) -> StorageResult<Box<[u8]>> {
        Ok(vec![0; num_bytes].into_boxed_slice())
    }

    fn free_slab(&self, _num_bytes: usize) {}
}

/// One contiguous allocation, subdivided into pages by the owning pool.
///
/// Buffers for different page runs of the same slab serialize their byte
/// access on this mutex; run disjointness is enforced by the pool's segment
/// bookkeeping.
pub struct Slab {
    data: Mutex<Box<[u8]>>,
}

impl Slab {
    pub fn new(data: Box<[u8]>) -> Self {
        Slab {
            data: Mutex::new(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    pub fn write(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }
}
