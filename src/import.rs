// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The surface importers load through.
//!
//! Parsers and wire formats live outside this crate; what they hand us is an
//! opaque batch of chunk payloads. The loader routes batches through an
//! [`InsertConnector`] and tracks a shared [`ImportStatus`] that parallel
//! workers poll to short-circuit once any of them fails. Finalizing a load
//! checkpoints the table on success and rolls it back on failure, so the
//! table moves atomically from one epoch to the next.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{error, info};

use crate::buffer::StorageResult;
use crate::data::DataMgr;
use crate::types::{ChunkKey, ChunkStats, ColumnId, DatabaseId, FragmentId, MemoryLevel, TableId};

/// Caller identity attached to every external request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub db_id: DatabaseId,
    pub user_id: i32,
}

/// One column of one fragment, ready to land in the buffer pyramid.
#[derive(Clone, Debug)]
pub struct InsertChunk {
    pub column_id: ColumnId,
    pub data: Bytes,
    pub stats: ChunkStats,
}

/// Opaque insert payload: every column chunk of one fragment.
#[derive(Clone, Debug)]
pub struct InsertBatch {
    pub table_id: TableId,
    pub fragment_id: FragmentId,
    pub num_rows: u64,
    pub chunks: Vec<InsertChunk>,
}

/// Where insert payloads go. The production implementation writes through a
/// [`DataMgr`]; tests may substitute anything.
pub trait InsertConnector: Send + Sync {
    fn insert_data(&self, session: &SessionContext, batch: InsertBatch) -> StorageResult<()>;

    fn checkpoint(&self, session: &SessionContext, table_id: TableId) -> StorageResult<()>;

    fn rollback(&self, session: &SessionContext, table_id: TableId) -> StorageResult<()>;
}

/// Connector writing batches into the CPU tier of a [`DataMgr`].
pub struct DataMgrConnector {
    data_mgr: Arc<DataMgr>,
}

impl DataMgrConnector {
    pub fn new(data_mgr: Arc<DataMgr>) -> Self {
        DataMgrConnector { data_mgr }
    }
}

impl InsertConnector for DataMgrConnector {
    fn insert_data(&self, session: &SessionContext, batch: InsertBatch) -> StorageResult<()> {
        for chunk in batch.chunks {
            let key = ChunkKey::new(
                session.db_id,
                batch.table_id,
                chunk.column_id,
                batch.fragment_id,
            );
            let mutex = self.data_mgr.chunk_mutex(&key);
            let _guard = mutex.write();

            let on_cpu = self
                .data_mgr
                .is_buffer_on_device(&key, MemoryLevel::Cpu, 0)?;
            let buffer = if on_cpu {
                self.data_mgr
                    .get_chunk_buffer(&key, MemoryLevel::Cpu, 0, chunk.data.len())?
            } else {
                self.data_mgr.create_chunk_buffer(
                    &key,
                    MemoryLevel::Cpu,
                    0,
                    0,
                    chunk.data.len(),
                )?
            };
            buffer.write(0, &chunk.data)?;
            self.data_mgr.update_chunk_stats(&key, chunk.stats)?;
        }
        Ok(())
    }

    fn checkpoint(&self, session: &SessionContext, table_id: TableId) -> StorageResult<()> {
        self.data_mgr.checkpoint(session.db_id, table_id)
    }

    fn rollback(&self, session: &SessionContext, table_id: TableId) -> StorageResult<()> {
        self.data_mgr.rollback(session.db_id, table_id)
    }
}

/// Progress and failure state of one load, shared across its workers.
#[derive(Clone, Debug, Default)]
pub struct ImportStatus {
    pub rows_completed: u64,
    pub rows_rejected: u64,
    pub load_failed: bool,
    pub load_msg: String,
}

/// Routes insert batches to a connector and settles the load at a table
/// epoch boundary.
pub struct InsertDataLoader {
    connector: Arc<dyn InsertConnector>,
    status: Arc<RwLock<ImportStatus>>,
}

impl InsertDataLoader {
    pub fn new(connector: Arc<dyn InsertConnector>) -> Self {
        InsertDataLoader {
            connector,
            status: Arc::new(RwLock::new(ImportStatus::default())),
        }
    }

    pub fn status(&self) -> ImportStatus {
        self.status.read().clone()
    }

    /// Workers poll this between batches and stop submitting once it trips.
    pub fn load_failed(&self) -> bool {
        self.status.read().load_failed
    }

    pub fn mark_failed(&self, message: impl Into<String>) {
        let mut status = self.status.write();
        status.load_failed = true;
        status.load_msg = message.into();
    }

    /// Submits one batch. A failure marks the whole load failed; the caller
    /// still owns calling [`InsertDataLoader::finalize`].
    pub fn insert_data(
        &self,
        session: &SessionContext,
        batch: InsertBatch,
    ) -> StorageResult<()> {
        let num_rows = batch.num_rows;
        match self.connector.insert_data(session, batch) {
            Ok(()) => {
                self.status.write().rows_completed += num_rows;
                Ok(())
            }
            Err(err) => {
                {
                    let mut status = self.status.write();
                    status.load_failed = true;
                    status.load_msg = err.to_string();
                    status.rows_rejected += num_rows;
                }
                Err(err)
            }
        }
    }

    /// Settles the load: checkpoint on success, rollback on failure. A
    /// failed checkpoint downgrades the load to failed and rolls back, so
    /// the table never lands between epochs.
    pub fn finalize(
        &self,
        session: &SessionContext,
        table_id: TableId,
    ) -> StorageResult<ImportStatus> {
        if !self.load_failed() {
            match self.connector.checkpoint(session, table_id) {
                Ok(()) => {
                    let status = self.status();
                    info!(
                        table_id,
                        rows = status.rows_completed,
                        "import checkpointed"
                    );
                    return Ok(status);
                }
                Err(err) => {
                    error!(table_id, "import checkpoint failed: {}", err);
                    self.mark_failed(format!("checkpoint failed: {}", err));
                }
            }
        }
        self.connector.rollback(session, table_id)?;
        Ok(self.status())
    }
}
