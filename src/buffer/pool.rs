// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The slab/page pool backing the CPU and GPU tiers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{ChunkKey, MemoryLevel};

use super::buffer::SlabBuffer;
use super::{
    AbstractBuffer, BufferMgr, BufferPin, MemStatus, MemoryData, MemoryInfo, Slab, SlabSource,
    StorageResult, TracedStorageError,
};

/// One page run of a slab.
struct Segment {
    start_page: usize,
    num_pages: usize,
    status: MemStatus,
    touch: u64,
    chunk_key: Option<ChunkKey>,
    buffer: Option<Arc<SlabBuffer>>,
}

impl Segment {
    fn free(start_page: usize, num_pages: usize) -> Self {
        Segment {
            start_page,
            num_pages,
            status: MemStatus::Free,
            touch: 0,
            chunk_key: None,
            buffer: None,
        }
    }

    fn is_evictable(&self) -> bool {
        self.status == MemStatus::Used
            && self
                .buffer
                .as_ref()
                .map(|b| b.pin_count() == 0)
                .unwrap_or(false)
    }
}

struct SlabEntry {
    mem: Arc<Slab>,
    /// Ordered by `start_page`; runs partition the slab exactly.
    segs: Vec<Segment>,
}

#[derive(Default)]
struct PoolInner {
    slabs: Vec<SlabEntry>,
    /// Chunk key -> index of the slab holding it.
    chunk_index: HashMap<ChunkKey, usize>,
}

/// Fixed-budget page allocator with least-recently-touched eviction.
///
/// Chunks occupy ordered page runs within slabs. On allocation the pool
/// looks for the smallest free run that fits, grows by one slab while under
/// its slab cap, and otherwise evicts the coldest unpinned chunks until a
/// run opens up. Evicted runs keep their bookkeeping until an allocation
/// compacts them back into free space.
pub struct PoolBufferMgr {
    level: MemoryLevel,
    device_id: i32,
    page_size: usize,
    pages_per_slab: usize,
    max_slabs: usize,
    source: Box<dyn SlabSource>,
    /// Pool-global touch clock; every get/create stamps its segment.
    clock: AtomicU64,
    capped: AtomicBool,
    inner: Mutex<PoolInner>,
}

impl PoolBufferMgr {
    pub fn new(
        level: MemoryLevel,
        device_id: i32,
        page_size: usize,
        pages_per_slab: usize,
        max_slabs: usize,
        source: Box<dyn SlabSource>,
    ) -> Self {
        assert!(page_size > 0 && pages_per_slab > 0 && max_slabs > 0);
        PoolBufferMgr {
            level,
            device_id,
            page_size,
            pages_per_slab,
            max_slabs,
            source,
            clock: AtomicU64::new(0),
            capped: AtomicBool::new(false),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn pages_for(&self, num_bytes: usize) -> usize {
        num_bytes.div_ceil(self.page_size).max(1)
    }

    fn next_touch(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn add_slab(&self, inner: &mut PoolInner) -> StorageResult<()> {
        let bytes = self.pages_per_slab * self.page_size;
        let mem = self.source.alloc_slab(bytes)?;
        inner.slabs.push(SlabEntry {
            mem: Arc::new(Slab::new(mem)),
            segs: vec![Segment::free(0, self.pages_per_slab)],
        });
        debug!(
            level = %self.level,
            device = self.device_id,
            slabs = inner.slabs.len(),
            "pool grew by one slab"
        );
        Ok(())
    }

    /// Finds the smallest run of contiguous non-used segments holding at
    /// least `num_pages` pages. Returns `(slab, first segment, last+1)`.
    fn best_fit(inner: &PoolInner, num_pages: usize) -> Option<(usize, usize, usize)> {
        let mut best: Option<(usize, usize, usize, usize)> = None;
        for (si, slab) in inner.slabs.iter().enumerate() {
            let mut run_start = 0;
            while run_start < slab.segs.len() {
                if slab.segs[run_start].status == MemStatus::Used {
                    run_start += 1;
                    continue;
                }
                let mut run_end = run_start;
                let mut run_pages = 0;
                while run_end < slab.segs.len() && slab.segs[run_end].status != MemStatus::Used {
                    run_pages += slab.segs[run_end].num_pages;
                    run_end += 1;
                }
                if run_pages >= num_pages
                    && best.map(|(_, _, _, pages)| run_pages < pages).unwrap_or(true)
                {
                    best = Some((si, run_start, run_end, run_pages));
                }
                run_start = run_end;
            }
        }
        best.map(|(si, start, end, _)| (si, start, end))
    }

    /// Folds the segment run `[start, end)` into one free segment.
    /// This is where evicted runs hand their pages back.
    fn compact_run(slab: &mut SlabEntry, start: usize, end: usize) {
        let start_page = slab.segs[start].start_page;
        let num_pages: usize = slab.segs[start..end].iter().map(|s| s.num_pages).sum();
        slab.segs.splice(start..end, [Segment::free(start_page, num_pages)]);
    }

    /// Carves `num_pages` off the free segment at `(si, pos)` and returns
    /// the new buffer, already registered in the segment.
    fn carve(
        &self,
        inner: &mut PoolInner,
        si: usize,
        pos: usize,
        num_pages: usize,
        chunk_key: Option<ChunkKey>,
    ) -> Arc<SlabBuffer> {
        let touch = self.next_touch();
        let slab = &mut inner.slabs[si];
        debug_assert_eq!(slab.segs[pos].status, MemStatus::Free);
        debug_assert!(slab.segs[pos].num_pages >= num_pages);

        let start_page = slab.segs[pos].start_page;
        let leftover = slab.segs[pos].num_pages - num_pages;
        let buffer = Arc::new(SlabBuffer::new(
            self.level,
            self.device_id,
            slab.mem.clone(),
            start_page,
            num_pages,
            self.page_size,
            0,
            chunk_key.clone(),
        ));

        let used = Segment {
            start_page,
            num_pages,
            status: MemStatus::Used,
            touch,
            chunk_key: chunk_key.clone(),
            buffer: Some(buffer.clone()),
        };
        if leftover == 0 {
            slab.segs[pos] = used;
        } else {
            slab.segs[pos] = Segment::free(start_page + num_pages, leftover);
            slab.segs.insert(pos, used);
        }
        if let Some(key) = chunk_key {
            inner.chunk_index.insert(key, si);
        }
        buffer
    }

    /// Marks the coldest unpinned used segment evicted. Returns `false`
    /// when nothing can be evicted.
    fn evict_coldest(inner: &mut PoolInner) -> bool {
        let mut victim: Option<(usize, usize, u64)> = None;
        for (si, slab) in inner.slabs.iter().enumerate() {
            for (pos, seg) in slab.segs.iter().enumerate() {
                if seg.is_evictable()
                    && victim.map(|(_, _, touch)| seg.touch < touch).unwrap_or(true)
                {
                    victim = Some((si, pos, seg.touch));
                }
            }
        }
        let Some((si, pos, _)) = victim else {
            return false;
        };
        let seg = &mut inner.slabs[si].segs[pos];
        if let Some(buffer) = seg.buffer.take() {
            buffer.invalidate();
        }
        seg.status = MemStatus::Evicted;
        if let Some(key) = &seg.chunk_key {
            debug!(chunk = %key, touch = seg.touch, "evicted chunk");
            inner.chunk_index.remove(key);
        }
        true
    }

    fn alloc_segment(
        &self,
        inner: &mut PoolInner,
        num_pages: usize,
        chunk_key: Option<ChunkKey>,
    ) -> StorageResult<Arc<SlabBuffer>> {
        let mut can_grow = true;
        loop {
            if let Some((si, start, end)) = Self::best_fit(inner, num_pages) {
                Self::compact_run(&mut inner.slabs[si], start, end);
                return Ok(self.carve(inner, si, start, num_pages, chunk_key));
            }
            if can_grow && inner.slabs.len() < self.max_slabs {
                match self.add_slab(inner) {
                    Ok(()) => continue,
                    // the slab source is out of budget; fall back to eviction
                    Err(_) => can_grow = false,
                }
            }
            if !Self::evict_coldest(inner) {
                self.capped.store(true, Ordering::Release);
                return Err(TracedStorageError::capped(format!(
                    "{} pages at {}:{} ({} slabs, all remaining chunks pinned)",
                    num_pages,
                    self.level,
                    self.device_id,
                    inner.slabs.len(),
                )));
            }
        }
    }

    /// Locates the used segment of a chunk. The index maps the key to its
    /// slab; the slab's segment list is scanned.
    fn find_chunk(inner: &PoolInner, key: &ChunkKey) -> Option<(usize, usize)> {
        let si = *inner.chunk_index.get(key)?;
        inner.slabs[si]
            .segs
            .iter()
            .position(|seg| {
                seg.status == MemStatus::Used && seg.chunk_key.as_ref() == Some(key)
            })
            .map(|pos| (si, pos))
    }

    fn release_segment(seg: &mut Segment, status: MemStatus) {
        if let Some(buffer) = seg.buffer.take() {
            buffer.invalidate();
        }
        seg.status = status;
        if status == MemStatus::Free {
            seg.chunk_key = None;
            seg.touch = 0;
        }
    }

    #[cfg(test)]
    fn total_pages(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let accounted = inner
            .slabs
            .iter()
            .flat_map(|s| s.segs.iter())
            .map(|seg| seg.num_pages)
            .sum();
        (accounted, inner.slabs.len() * self.pages_per_slab)
    }
}

impl BufferMgr for PoolBufferMgr {
    fn memory_level(&self) -> MemoryLevel {
        self.level
    }

    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn create_chunk_buffer(
        &self,
        key: &ChunkKey,
        _page_size: usize,
        num_bytes: usize,
    ) -> StorageResult<BufferPin> {
        let mut inner = self.inner.lock();
        if inner.chunk_index.contains_key(key) {
            return Err(TracedStorageError::duplicated("chunk", key));
        }
        let num_pages = self.pages_for(num_bytes);
        let buffer = self.alloc_segment(&mut inner, num_pages, Some(key.clone()))?;
        Ok(BufferPin::new(buffer))
    }

    fn get_chunk_buffer(&self, key: &ChunkKey, _num_bytes: usize) -> StorageResult<BufferPin> {
        let mut inner = self.inner.lock();
        let touch = self.next_touch();
        let (si, pos) = Self::find_chunk(&inner, key)
            .ok_or_else(|| TracedStorageError::not_found("chunk", key))?;
        let seg = &mut inner.slabs[si].segs[pos];
        seg.touch = touch;
        Ok(BufferPin::new(seg.buffer.clone().unwrap()))
    }

    fn has_chunk(&self, key: &ChunkKey) -> bool {
        let inner = self.inner.lock();
        Self::find_chunk(&inner, key).is_some()
    }

    fn delete_chunk(&self, key: &ChunkKey) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let (si, pos) = Self::find_chunk(&inner, key)
            .ok_or_else(|| TracedStorageError::not_found("chunk", key))?;
        let seg = &mut inner.slabs[si].segs[pos];
        if seg.buffer.as_ref().unwrap().pin_count() > 0 {
            return Err(TracedStorageError::pinned("chunk", key));
        }
        Self::release_segment(seg, MemStatus::Free);
        inner.chunk_index.remove(key);
        Ok(())
    }

    fn delete_chunks_with_prefix(&self, prefix: &ChunkKey) -> StorageResult<()> {
        let keys: Vec<ChunkKey> = {
            let inner = self.inner.lock();
            let mut keys: Vec<_> = inner
                .chunk_index
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            keys
        };
        for key in keys {
            self.delete_chunk(&key)?;
        }
        Ok(())
    }

    fn alloc(&self, num_bytes: usize) -> StorageResult<BufferPin> {
        let mut inner = self.inner.lock();
        let num_pages = self.pages_for(num_bytes);
        let buffer = self.alloc_segment(&mut inner, num_pages, None)?;
        Ok(BufferPin::new(buffer))
    }

    fn free(&self, buffer: BufferPin) -> StorageResult<()> {
        if buffer.pin_count() > 1 {
            return Err(TracedStorageError::pinned("buffer", "anonymous"));
        }
        let target = Arc::as_ptr(buffer.buffer()) as *const u8;
        let mut inner = self.inner.lock();
        for slab in &mut inner.slabs {
            for seg in &mut slab.segs {
                let matches = seg
                    .buffer
                    .as_ref()
                    .map(|b| Arc::as_ptr(b) as *const u8 == target)
                    .unwrap_or(false);
                if matches {
                    Self::release_segment(seg, MemStatus::Free);
                    return Ok(());
                }
            }
        }
        Err(TracedStorageError::not_found("buffer", "anonymous"))
    }

    fn free_all_buffers(&self) {
        let mut inner = self.inner.lock();
        for slab in &mut inner.slabs {
            for seg in &mut slab.segs {
                if seg.status == MemStatus::Used && seg.chunk_key.is_none() {
                    Self::release_segment(seg, MemStatus::Free);
                }
            }
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        for slab in &mut inner.slabs {
            for seg in &mut slab.segs {
                if seg.is_evictable() {
                    if let Some(key) = &seg.chunk_key {
                        inner.chunk_index.remove(key);
                    }
                    Self::release_segment(seg, MemStatus::Evicted);
                }
            }
        }
        self.capped.store(false, Ordering::Release);
    }

    fn dirty_chunk_keys(&self, prefix: Option<&ChunkKey>) -> Vec<ChunkKey> {
        let inner = self.inner.lock();
        let mut keys: Vec<ChunkKey> = inner
            .slabs
            .iter()
            .flat_map(|s| s.segs.iter())
            .filter(|seg| seg.status == MemStatus::Used)
            .filter(|seg| seg.buffer.as_ref().map(|b| b.is_dirty()).unwrap_or(false))
            .filter_map(|seg| seg.chunk_key.clone())
            .filter(|key| prefix.map(|p| key.starts_with(p)).unwrap_or(true))
            .collect();
        keys.sort();
        keys
    }

    fn memory_info(&self) -> MemoryInfo {
        let inner = self.inner.lock();
        MemoryInfo {
            page_size: self.page_size,
            max_num_pages: self.max_slabs * self.pages_per_slab,
            num_pages_allocated: inner.slabs.len() * self.pages_per_slab,
            is_allocation_capped: self.capped.load(Ordering::Acquire),
            node_memory_data: inner
                .slabs
                .iter()
                .enumerate()
                .flat_map(|(si, slab)| {
                    slab.segs.iter().map(move |seg| MemoryData {
                        slab: si,
                        start_page: seg.start_page,
                        num_pages: seg.num_pages,
                        touch: seg.touch,
                        chunk_key: seg.chunk_key.clone(),
                        status: seg.status,
                    })
                })
                .collect(),
        }
    }
}

impl Drop for PoolBufferMgr {
    fn drop(&mut self) {
        let slabs = self.inner.lock().slabs.len();
        self.source
            .free_slab(slabs * self.pages_per_slab * self.page_size);
    }
}
