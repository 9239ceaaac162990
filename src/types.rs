// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Common identifier types shared by the buffer pyramid and the catalog.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type DatabaseId = i32;
pub type TableId = i32;
pub type ColumnId = i32;
pub type FragmentId = i32;

/// Name of a chunk: `[db_id, table_id, column_id, fragment_id]`.
///
/// Shorter instances of the same key act as prefixes and name scopes, e.g.
/// `[db_id, table_id]` names every chunk of a table. Ordered comparison is
/// lexicographic over the components, so chunks sharing a prefix are
/// contiguous in a sorted map.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey(SmallVec<[i32; 4]>);

impl ChunkKey {
    pub fn new(
        db_id: DatabaseId,
        table_id: TableId,
        column_id: ColumnId,
        fragment_id: FragmentId,
    ) -> Self {
        ChunkKey(SmallVec::from_slice(&[db_id, table_id, column_id, fragment_id]))
    }

    /// Prefix naming every chunk of a database.
    pub fn db_prefix(db_id: DatabaseId) -> Self {
        ChunkKey(SmallVec::from_slice(&[db_id]))
    }

    /// Prefix naming every chunk of a table.
    pub fn table_prefix(db_id: DatabaseId, table_id: TableId) -> Self {
        ChunkKey(SmallVec::from_slice(&[db_id, table_id]))
    }

    pub fn from_slice(components: &[i32]) -> Self {
        ChunkKey(SmallVec::from_slice(components))
    }

    pub fn starts_with(&self, prefix: &ChunkKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    pub fn db_id(&self) -> Option<DatabaseId> {
        self.0.first().copied()
    }

    pub fn table_id(&self) -> Option<TableId> {
        self.0.get(1).copied()
    }

    pub fn column_id(&self) -> Option<ColumnId> {
        self.0.get(2).copied()
    }

    pub fn fragment_id(&self) -> Option<FragmentId> {
        self.0.get(3).copied()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, component) in self.0.iter().enumerate() {
            if idx != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", component)?;
        }
        write!(f, "]")
    }
}

/// The tiers of the buffer pyramid, slowest first. Each level above disk acts
/// as a cache for the level below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemoryLevel {
    Disk = 0,
    Cpu = 1,
    Gpu = 2,
}

impl MemoryLevel {
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLevel::Disk => write!(f, "DISK"),
            MemoryLevel::Cpu => write!(f, "CPU"),
            MemoryLevel::Gpu => write!(f, "GPU"),
        }
    }
}

/// Per-chunk summary used by the query layer for fragment pruning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub row_count: u64,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub has_nulls: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_key_prefix() {
        let key = ChunkKey::new(1, 7, 3, 0);
        assert!(key.starts_with(&ChunkKey::db_prefix(1)));
        assert!(key.starts_with(&ChunkKey::table_prefix(1, 7)));
        assert!(key.starts_with(&key));
        assert!(!key.starts_with(&ChunkKey::table_prefix(1, 8)));
        assert!(!ChunkKey::table_prefix(1, 7).starts_with(&key));
    }

    #[test]
    fn test_chunk_key_order_groups_prefixes() {
        let mut keys = vec![
            ChunkKey::new(1, 8, 0, 0),
            ChunkKey::new(1, 7, 3, 0),
            ChunkKey::new(1, 7, 1, 2),
            ChunkKey::new(2, 1, 0, 0),
        ];
        keys.sort();
        let table: Vec<_> = keys
            .iter()
            .filter(|k| k.starts_with(&ChunkKey::table_prefix(1, 7)))
            .collect();
        assert_eq!(table.len(), 2);
        // contiguous after sorting
        assert_eq!(keys[0], ChunkKey::new(1, 7, 1, 2));
        assert_eq!(keys[1], ChunkKey::new(1, 7, 3, 0));
    }
}
