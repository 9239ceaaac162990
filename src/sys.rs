// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! System memory probing.
//!
//! Pool sizing at startup and the memory telemetry surface both go through
//! [`MemoryProbe`], so platforms differ in which probe gets constructed,
//! not in conditional code at the call sites.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::buffer::{StorageResult, TracedStorageError};

/// Process and host memory, all fields in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMemoryUsage {
    /// Available host RAM.
    pub free: i64,
    /// Total host RAM.
    pub total: i64,
    /// Resident process memory.
    pub resident: i64,
    /// Total process virtual memory.
    pub vtotal: i64,
    /// Process bytes that are not shared.
    pub regular: i64,
    /// Process bytes shared with other mappings (file maps and shmem).
    pub shared: i64,
}

pub trait MemoryProbe: Send + Sync {
    fn system_memory_usage(&self) -> SystemMemoryUsage;

    fn total_system_memory(&self) -> usize {
        self.system_memory_usage().total.max(0) as usize
    }
}

/// Parse `/proc/meminfo`-shaped text into name/value pairs.
///
/// Each line reads `Name: value [kB]`; a `kB` suffix scales the value by
/// 1024, no suffix means bytes.
pub struct ProcMeminfoParser {
    items: HashMap<String, u64>,
}

impl ProcMeminfoParser {
    pub fn parse(text: &str) -> StorageResult<Self> {
        let mut items = HashMap::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let (name, rest) = line.split_once(':').ok_or_else(|| {
                TracedStorageError::not_found("meminfo separator", line)
            })?;
            let mut fields = rest.split_whitespace();
            let value: u64 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| TracedStorageError::not_found("meminfo value", line))?;
            let scale = match fields.next() {
                None => 1,
                Some(unit) if unit.eq_ignore_ascii_case("kb") => 1024,
                Some(unit) => {
                    return Err(TracedStorageError::not_found("meminfo unit", unit));
                }
            };
            items.insert(name.trim().to_string(), value * scale);
        }
        Ok(ProcMeminfoParser { items })
    }

    pub fn get(&self, name: &str) -> u64 {
        self.items.get(name).copied().unwrap_or(0)
    }

    /// RAM the kernel could hand us: free pages plus droppable caches.
    pub fn available(&self) -> u64 {
        self.get("MemFree") + self.get("Buffers") + self.get("Cached")
    }

    pub fn total(&self) -> u64 {
        self.get("MemTotal")
    }
}

/// Probe backed by `/proc/meminfo` and `/proc/self/statm`.
pub struct LinuxMemoryProbe;

/// Linux reports statm in pages of this size on every tier we deploy on.
const STATM_PAGE_BYTES: i64 = 4096;

impl MemoryProbe for LinuxMemoryProbe {
    fn system_memory_usage(&self) -> SystemMemoryUsage {
        let mut usage = SystemMemoryUsage::default();

        match std::fs::read_to_string("/proc/meminfo")
            .map_err(TracedStorageError::from)
            .and_then(|text| ProcMeminfoParser::parse(&text))
        {
            Ok(meminfo) => {
                usage.total = meminfo.total() as i64;
                usage.free = meminfo.available() as i64;
            }
            Err(err) => warn!("failed to read /proc/meminfo: {}", err),
        }

        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            let fields: Vec<i64> = statm
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            // statm: size resident shared ...
            if fields.len() >= 3 {
                usage.vtotal = fields[0] * STATM_PAGE_BYTES;
                usage.resident = fields[1] * STATM_PAGE_BYTES;
                usage.shared = fields[2] * STATM_PAGE_BYTES;
                usage.regular = usage.resident - usage.shared;
            }
        }

        usage
    }
}

/// Conservative probe for platforms without a native implementation.
pub struct FallbackMemoryProbe {
    total: usize,
}

/// 8 GiB: small enough to be safe on a laptop, large enough to be useful.
const FALLBACK_TOTAL_MEMORY: usize = 8 << 30;

impl Default for FallbackMemoryProbe {
    fn default() -> Self {
        FallbackMemoryProbe {
            total: FALLBACK_TOTAL_MEMORY,
        }
    }
}

impl MemoryProbe for FallbackMemoryProbe {
    fn system_memory_usage(&self) -> SystemMemoryUsage {
        SystemMemoryUsage {
            free: self.total as i64 / 2,
            total: self.total as i64,
            ..Default::default()
        }
    }
}

pub fn default_probe() -> Box<dyn MemoryProbe> {
    if cfg!(target_os = "linux") {
        Box::new(LinuxMemoryProbe)
    } else {
        Box::new(FallbackMemoryProbe::default())
    }
}
