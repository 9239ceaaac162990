// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Device memory accounting for the GPU tier.
//!
//! Only residency is in scope here: the manager tracks how many bytes each
//! device has left and hands out slabs charged against that budget. Compute
//! never touches these buffers, so slab storage itself is host memory; a
//! real device backend would swap [`SlabSource::alloc_slab`] for a device
//! allocation without the pools noticing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::buffer::{SlabSource, StorageResult, TracedStorageError};

struct DeviceState {
    total: usize,
    free: AtomicUsize,
}

/// Tracks per-device memory budgets for `GPU[start_gpu .. start_gpu + n)`.
pub struct DeviceMgr {
    devices: Vec<DeviceState>,
    start_gpu: usize,
}

impl DeviceMgr {
    pub fn new(num_devices: usize, mem_per_device: usize, start_gpu: usize) -> Self {
        info!(
            num_devices,
            mem_per_device, start_gpu, "initializing device manager"
        );
        DeviceMgr {
            devices: (0..num_devices)
                .map(|_| DeviceState {
                    total: mem_per_device,
                    free: AtomicUsize::new(mem_per_device),
                })
                .collect(),
            start_gpu,
        }
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn start_gpu(&self) -> usize {
        self.start_gpu
    }

    pub fn total_memory(&self, device: usize) -> usize {
        self.devices[device].total
    }

    pub fn free_memory(&self, device: usize) -> usize {
        self.devices[device].free.load(Ordering::Acquire)
    }

    /// Charges `num_bytes` against the device. Never returns the bytes of a
    /// reservation back once carved off.
    fn charge(&self, device: usize, num_bytes: usize) -> StorageResult<()> {
        let free = &self.devices[device].free;
        let mut current = free.load(Ordering::Acquire);
        loop {
            if current < num_bytes {
                return Err(TracedStorageError::capped(format!(
                    "device {} has {} of {} bytes free, wanted {}",
                    device, current, self.devices[device].total, num_bytes,
                )));
            }
            match free.compare_exchange(
                current,
                current - num_bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn refund(&self, device: usize, num_bytes: usize) {
        self.devices[device].free.fetch_add(num_bytes, Ordering::AcqRel);
    }
}

/// [`SlabSource`] charging one device of a [`DeviceMgr`].
pub struct DeviceSlabSource {
    mgr: Arc<DeviceMgr>,
    device: usize,
}

impl DeviceSlabSource {
    pub fn new(mgr: Arc<DeviceMgr>, device: usize) -> Self {
        DeviceSlabSource { mgr, device }
    }
}

impl SlabSource for DeviceSlabSource {
    fn alloc_slab(&self, num_bytes: usize) -> StorageResult<Box<[u8]>> {
        self.mgr.charge(self.device, num_bytes)?;
        Ok(vec![0; num_bytes].into_boxed_slice())
    }

    fn free_slab(&self, num_bytes: usize) {
        self.mgr.refund(self.device, num_bytes);
    }
}
