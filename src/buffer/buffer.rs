// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::types::{ChunkKey, MemoryLevel};

use super::{AbstractBuffer, Slab, StorageResult, TracedStorageError};

/// A buffer backed by a page run inside a pool slab.
///
/// `size` is the number of meaningful bytes and never exceeds
/// `num_pages * page_size` (the reservation). The pool invalidates the
/// handle when the run is evicted or deleted; later accesses fail instead
/// of touching reused pages.
pub struct SlabBuffer {
    level: MemoryLevel,
    device_id: i32,
    slab: Arc<Slab>,
    start_page: usize,
    num_pages: usize,
    page_size: usize,
    size: AtomicUsize,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    valid: AtomicBool,
    /// `None` for anonymous allocations.
    chunk_key: Option<ChunkKey>,
}

impl SlabBuffer {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        level: MemoryLevel,
        device_id: i32,
        slab: Arc<Slab>,
        start_page: usize,
        num_pages: usize,
        page_size: usize,
        size: usize,
        chunk_key: Option<ChunkKey>,
    ) -> Self {
        SlabBuffer {
            level,
            device_id,
            slab,
            start_page,
            num_pages,
            page_size,
            size: AtomicUsize::new(size),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            valid: AtomicBool::new(true),
            chunk_key,
        }
    }

    pub fn chunk_key(&self) -> Option<&ChunkKey> {
        self.chunk_key.as_ref()
    }

    pub(super) fn start_page(&self) -> usize {
        self.start_page
    }

    pub(super) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(super) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn byte_offset(&self) -> usize {
        self.start_page * self.page_size
    }

    fn describe(&self) -> String {
        match &self.chunk_key {
            Some(key) => key.to_string(),
            None => format!("anon@{}:{}", self.level, self.device_id),
        }
    }

    fn check_valid(&self) -> StorageResult<()> {
        if !self.is_valid() {
            return Err(TracedStorageError::not_found("buffer", self.describe()));
        }
        Ok(())
    }
}

impl AbstractBuffer for SlabBuffer {
    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn reserved_size(&self) -> usize {
        self.num_pages * self.page_size
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn memory_level(&self) -> MemoryLevel {
        self.level
    }

    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin of unpinned buffer {}", self.describe());
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
        self.check_valid()?;
        if offset + dst.len() > self.size() {
            return Err(TracedStorageError::not_found(
                "buffer range",
                format!("{}..{} of {}", offset, offset + dst.len(), self.describe()),
            ));
        }
        self.slab.read(self.byte_offset() + offset, dst);
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> StorageResult<()> {
        self.check_valid()?;
        let end = offset + src.len();
        if end > self.reserved_size() {
            return Err(TracedStorageError::capped(format!(
                "write of {} bytes at {} exceeds the {} bytes reserved for {}",
                src.len(),
                offset,
                self.reserved_size(),
                self.describe(),
            )));
        }
        self.slab.write(self.byte_offset() + offset, src);
        self.size.fetch_max(end, Ordering::AcqRel);
        self.set_dirty(true);
        Ok(())
    }

    fn append(&self, src: &[u8]) -> StorageResult<()> {
        self.write(self.size(), src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_of(pages: usize, page_size: usize) -> SlabBuffer {
        let slab = Arc::new(Slab::new(vec![0; pages * page_size].into_boxed_slice()));
        SlabBuffer::new(
            MemoryLevel::Cpu,
            0,
            slab,
            0,
            pages,
            page_size,
            0,
            Some(ChunkKey::new(1, 1, 1, 0)),
        )
    }

    #[test]
    fn test_write_grows_size_and_dirties() {
        let buf = buffer_of(2, 64);
        assert_eq!(buf.size(), 0);
        buf.write(0, &[7; 100]).unwrap();
        assert_eq!(buf.size(), 100);
        assert!(buf.is_dirty());

        buf.append(&[9; 28]).unwrap();
        assert_eq!(buf.size(), 128);

        let mut out = vec![0; 128];
        buf.read(0, &mut out).unwrap();
        assert_eq!(&out[..100], &[7; 100][..]);
        assert_eq!(&out[100..], &[9; 28][..]);
    }

    #[test]
    fn test_write_past_reservation_fails() {
        let buf = buffer_of(1, 64);
        buf.write(0, &[1; 64]).unwrap();
        let err = buf.append(&[1]).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::buffer::StorageError::AllocationCapped(_)
        ));
    }

    #[test]
    fn test_invalidated_buffer_fails() {
        let buf = buffer_of(1, 64);
        buf.write(0, &[1; 8]).unwrap();
        buf.invalidate();
        let mut out = [0; 8];
        assert!(buf.read(0, &mut out).is_err());
        assert!(buf.write(0, &[2; 8]).is_err());
    }
}
