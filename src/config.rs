// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Runtime configuration for the data manager.
//!
//! Everything tunable lives here instead of in process-wide globals, so a
//! test can spin up several managers with different shapes in one process.

use std::path::PathBuf;

/// Options for [`DataMgr`](crate::data::DataMgr).
#[derive(Clone, Debug)]
pub struct DataMgrOptions {
    /// Root of the persistent storage tree.
    pub data_dir: PathBuf,
    /// Byte budget of the CPU pool. `None` sizes the pool from the probed
    /// system memory.
    pub cpu_buffer_size: Option<usize>,
    /// Byte budget of each GPU pool. `None` sizes each pool from the
    /// device's free memory minus `reserved_gpu_mem`.
    pub gpu_buffer_size: Option<usize>,
    /// Page size of the in-memory pools, in bytes.
    pub page_size: usize,
    /// Size of one slab, in bytes. Must be a multiple of `page_size`.
    pub slab_size: usize,
    pub use_gpus: bool,
    pub num_gpus: usize,
    pub start_gpu: usize,
    /// Capacity the device manager reports per device.
    pub gpu_device_mem: usize,
    /// Device memory carved off each GPU at startup and never pooled.
    pub reserved_gpu_mem: usize,
    /// Worker threads used when scanning chunk metadata off disk.
    /// `0` picks a default.
    pub num_reader_threads: usize,
    /// Upper bound import collaborators consult when fanning out workers.
    pub max_import_threads: usize,
}

/// When the CPU budget is not configured, use this share of system memory.
const DEFAULT_CPU_MEM_FRACTION: (usize, usize) = (4, 5);

pub const DEFAULT_PAGE_SIZE: usize = 512;
pub const DEFAULT_SLAB_SIZE: usize = 1 << 31;
pub const DEFAULT_GPU_DEVICE_MEM: usize = 4 << 30;
pub const DEFAULT_RESERVED_GPU_MEM: usize = 1 << 27;

impl Default for DataMgrOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("stratadb.data"),
            cpu_buffer_size: None,
            gpu_buffer_size: None,
            page_size: DEFAULT_PAGE_SIZE,
            slab_size: DEFAULT_SLAB_SIZE,
            use_gpus: false,
            num_gpus: 0,
            start_gpu: 0,
            gpu_device_mem: DEFAULT_GPU_DEVICE_MEM,
            reserved_gpu_mem: DEFAULT_RESERVED_GPU_MEM,
            num_reader_threads: 0,
            max_import_threads: 8,
        }
    }
}

impl DataMgrOptions {
    pub fn default_for_test() -> Self {
        Self {
            data_dir: PathBuf::from("stratadb.test.data"),
            cpu_buffer_size: Some(1 << 20),
            gpu_buffer_size: Some(1 << 20),
            page_size: 64,
            slab_size: 1 << 12,
            use_gpus: false,
            num_gpus: 0,
            start_gpu: 0,
            gpu_device_mem: 1 << 20,
            reserved_gpu_mem: 1 << 10,
            num_reader_threads: 2,
            max_import_threads: 2,
        }
    }

    /// CPU pool budget, falling back to a share of probed system memory.
    pub fn cpu_budget(&self, system_memory: usize) -> usize {
        let (num, den) = DEFAULT_CPU_MEM_FRACTION;
        self.cpu_buffer_size
            .unwrap_or(system_memory / den * num)
            .max(self.slab_size)
    }
}
