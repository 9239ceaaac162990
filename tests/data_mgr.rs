// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios over the buffer pyramid.

use std::sync::Arc;

use stratadb::buffer::StorageError;
use stratadb::import::{
    DataMgrConnector, InsertBatch, InsertChunk, InsertDataLoader, SessionContext,
};
use stratadb::types::{ChunkKey, ChunkStats, MemoryLevel};
use stratadb::{DataMgr, DataMgrOptions};

fn options(data_dir: &std::path::Path) -> DataMgrOptions {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    DataMgrOptions {
        data_dir: data_dir.to_path_buf(),
        ..DataMgrOptions::default_for_test()
    }
}

fn chunk_key(column: i32) -> ChunkKey {
    ChunkKey::new(1, 7, column, 0)
}

#[test]
fn test_pull_up_from_disk() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    {
        let buf = data_mgr
            .create_chunk_buffer(&chunk_key(3), MemoryLevel::Disk, 0, 0, 0)
            .unwrap();
        buf.write(0, &payload).unwrap();
    }

    let buf = data_mgr
        .get_chunk_buffer(&chunk_key(3), MemoryLevel::Cpu, 0, 4096)
        .unwrap();
    assert_eq!(buf.to_vec().unwrap(), payload);
    assert_eq!(buf.memory_level(), MemoryLevel::Cpu);
    // the cache copy is clean and the disk copy stays authoritative
    assert!(!buf.is_dirty());
    assert!(data_mgr
        .is_buffer_on_device(&chunk_key(3), MemoryLevel::Disk, 0)
        .unwrap());
}

#[test]
fn test_write_checkpoint_clear_get_round_trip() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();

    let payload = b"the bytes that must survive".to_vec();
    {
        let buf = data_mgr
            .create_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0, payload.len())
            .unwrap();
        buf.write(0, &payload).unwrap();
    }
    data_mgr.checkpoint(1, 7).unwrap();
    data_mgr.clear_memory(MemoryLevel::Cpu);
    assert!(!data_mgr
        .is_buffer_on_device(&chunk_key(1), MemoryLevel::Cpu, 0)
        .unwrap());

    let buf = data_mgr
        .get_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0)
        .unwrap();
    assert_eq!(buf.to_vec().unwrap(), payload);
}

#[test]
fn test_checkpoint_idempotent_and_epoch_advances() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();

    data_mgr
        .create_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0, 16)
        .unwrap()
        .write(0, b"fixed")
        .unwrap();
    data_mgr.checkpoint(1, 7).unwrap();
    let epoch = data_mgr.get_table_epoch(1, 7);
    assert!(epoch >= 1);

    data_mgr.checkpoint(1, 7).unwrap();
    assert_eq!(data_mgr.get_table_epoch(1, 7), epoch + 1);
    let buf = data_mgr
        .get_chunk_buffer(&chunk_key(1), MemoryLevel::Disk, 0, 0)
        .unwrap();
    assert_eq!(buf.to_vec().unwrap(), b"fixed");
}

#[test]
fn test_recovery_reads_last_checkpoint() {
    let tempdir = tempfile::tempdir().unwrap();
    {
        let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();
        data_mgr
            .create_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0, 32)
            .unwrap()
            .write(0, b"checkpointed state")
            .unwrap();
        data_mgr.checkpoint(1, 7).unwrap();
        // a write that never reaches a checkpoint
        data_mgr
            .get_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0)
            .unwrap()
            .write(0, b"lost on crash.....")
            .unwrap();
        // drop without checkpoint simulates the crash
    }

    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();
    let buf = data_mgr
        .get_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0)
        .unwrap();
    assert_eq!(buf.to_vec().unwrap(), b"checkpointed state");
    assert_eq!(data_mgr.get_table_epoch(1, 7), 1);
}

#[test]
fn test_lru_eviction_prefers_coldest() {
    let tempdir = tempfile::tempdir().unwrap();
    // one CPU slab of four pages so the fifth chunk forces an eviction
    let opts = DataMgrOptions {
        cpu_buffer_size: Some(256),
        page_size: 64,
        slab_size: 256,
        ..options(tempdir.path())
    };
    let data_mgr = DataMgr::open(opts).unwrap();

    for column in 1..=4 {
        data_mgr
            .create_chunk_buffer(&chunk_key(column), MemoryLevel::Cpu, 0, 0, 64)
            .unwrap();
    }
    // chunk 1 is now warmer than chunk 2
    data_mgr
        .get_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0)
        .unwrap();

    data_mgr
        .create_chunk_buffer(&chunk_key(5), MemoryLevel::Cpu, 0, 0, 64)
        .unwrap();
    assert!(data_mgr
        .is_buffer_on_device(&chunk_key(1), MemoryLevel::Cpu, 0)
        .unwrap());
    assert!(!data_mgr
        .is_buffer_on_device(&chunk_key(2), MemoryLevel::Cpu, 0)
        .unwrap());
    // the evicted chunk still has its authoritative entry below
    assert!(data_mgr
        .is_buffer_on_device(&chunk_key(2), MemoryLevel::Disk, 0)
        .unwrap());
}

#[test]
fn test_gpu_tier_pull_up_and_checkpoint() {
    let tempdir = tempfile::tempdir().unwrap();
    let opts = DataMgrOptions {
        use_gpus: true,
        num_gpus: 2,
        ..options(tempdir.path())
    };
    let data_mgr = DataMgr::open(opts).unwrap();
    assert!(data_mgr.gpus_present());
    assert_eq!(data_mgr.level_sizes(), vec![1, 1, 2]);

    let payload = b"resident on device one".to_vec();
    {
        let buf = data_mgr
            .create_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0, payload.len())
            .unwrap();
        buf.write(0, &payload).unwrap();
    }
    let gpu_buf = data_mgr
        .get_chunk_buffer(&chunk_key(1), MemoryLevel::Gpu, 1, 0)
        .unwrap();
    assert_eq!(gpu_buf.to_vec().unwrap(), payload);
    assert_eq!(gpu_buf.device_id(), 1);
    drop(gpu_buf);

    // a write landing on the device flows down through CPU to disk
    let gpu_buf = data_mgr
        .get_chunk_buffer(&chunk_key(1), MemoryLevel::Gpu, 1, 0)
        .unwrap();
    gpu_buf.write(0, b"mutated on device one.").unwrap();
    drop(gpu_buf);
    data_mgr.checkpoint(1, 7).unwrap();

    data_mgr.clear_memory(MemoryLevel::Gpu);
    data_mgr.clear_memory(MemoryLevel::Cpu);
    let buf = data_mgr
        .get_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0)
        .unwrap();
    assert_eq!(buf.to_vec().unwrap(), b"mutated on device one.");
}

#[test]
fn test_delete_chunks_with_prefix_scopes_by_level() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();

    for column in 1..=2 {
        data_mgr
            .create_chunk_buffer(&chunk_key(column), MemoryLevel::Cpu, 0, 0, 16)
            .unwrap()
            .write(0, b"x")
            .unwrap();
    }
    let prefix = ChunkKey::table_prefix(1, 7);

    data_mgr
        .delete_chunks_with_prefix(&prefix, Some(MemoryLevel::Cpu))
        .unwrap();
    assert!(!data_mgr
        .is_buffer_on_device(&chunk_key(1), MemoryLevel::Cpu, 0)
        .unwrap());
    assert!(data_mgr
        .is_buffer_on_device(&chunk_key(1), MemoryLevel::Disk, 0)
        .unwrap());

    data_mgr.delete_chunks_with_prefix(&prefix, None).unwrap();
    assert!(!data_mgr
        .is_buffer_on_device(&chunk_key(1), MemoryLevel::Disk, 0)
        .unwrap());
}

#[test]
fn test_pinned_chunk_blocks_prefix_delete() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();
    let _pin = data_mgr
        .create_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0, 16)
        .unwrap();
    let err = data_mgr
        .delete_chunks_with_prefix(&ChunkKey::table_prefix(1, 7), Some(MemoryLevel::Cpu))
        .unwrap_err();
    assert!(matches!(err.kind(), StorageError::Pinned(..)));
}

#[test]
fn test_remove_table_related_ds() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();
    data_mgr
        .create_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0, 16)
        .unwrap()
        .write(0, b"bytes")
        .unwrap();
    data_mgr.checkpoint(1, 7).unwrap();

    data_mgr.remove_table_related_ds(1, 7).unwrap();
    assert!(!data_mgr
        .is_buffer_on_device(&chunk_key(1), MemoryLevel::Cpu, 0)
        .unwrap());
    assert!(!data_mgr
        .is_buffer_on_device(&chunk_key(1), MemoryLevel::Disk, 0)
        .unwrap());
    assert_eq!(data_mgr.get_table_epoch(1, 7), 0);
    assert!(data_mgr.chunk_stats_vec().is_empty());
}

#[test]
fn test_anonymous_alloc_and_copy() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();

    let src = data_mgr.alloc(MemoryLevel::Cpu, 0, 128).unwrap();
    src.write(0, &[7; 128]).unwrap();
    let dst = data_mgr.alloc(MemoryLevel::Cpu, 0, 128).unwrap();
    data_mgr.copy(&*dst, &*src).unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![7; 128]);
    data_mgr.free(src).unwrap();
    data_mgr.free(dst).unwrap();
}

#[test]
fn test_memory_info_and_dump() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();
    data_mgr
        .create_chunk_buffer(&chunk_key(1), MemoryLevel::Cpu, 0, 0, 100)
        .unwrap();

    let info = data_mgr.memory_info(MemoryLevel::Cpu);
    assert_eq!(info.len(), 1);
    assert!(!info[0].is_allocation_capped);
    assert!(info[0]
        .node_memory_data
        .iter()
        .any(|data| data.chunk_key.as_ref() == Some(&chunk_key(1))));

    let dump = data_mgr.dump_level(MemoryLevel::Cpu);
    assert!(dump.contains("CPU device 0"));
    assert!(dump.contains("[1,7,1,0]"));
}

#[test]
fn test_system_memory_usage_smoke() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();
    let usage = data_mgr.system_memory_usage();
    assert!(usage.total > 0);
}

#[test]
fn test_import_load_checkpoints_table() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = Arc::new(DataMgr::open(options(tempdir.path())).unwrap());
    let loader = InsertDataLoader::new(Arc::new(DataMgrConnector::new(data_mgr.clone())));
    let session = SessionContext {
        db_id: 1,
        user_id: 10,
    };

    let payload = bytes::Bytes::from_static(b"column bytes");
    loader
        .insert_data(
            &session,
            InsertBatch {
                table_id: 7,
                fragment_id: 0,
                num_rows: 3,
                chunks: vec![InsertChunk {
                    column_id: 2,
                    data: payload.clone(),
                    stats: ChunkStats {
                        row_count: 3,
                        min: Some(1),
                        max: Some(9),
                        has_nulls: false,
                    },
                }],
            },
        )
        .unwrap();
    let status = loader.finalize(&session, 7).unwrap();
    assert!(!status.load_failed);
    assert_eq!(status.rows_completed, 3);
    assert_eq!(data_mgr.get_table_epoch(1, 7), 1);

    let stats = data_mgr.chunk_stats_vec_for_prefix(&ChunkKey::table_prefix(1, 7));
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].1.max, Some(9));

    // survives a reopen
    drop(loader);
    drop(data_mgr);
    let data_mgr = DataMgr::open(options(tempdir.path())).unwrap();
    let buf = data_mgr
        .get_chunk_buffer(&ChunkKey::new(1, 7, 2, 0), MemoryLevel::Cpu, 0, 0)
        .unwrap();
    assert_eq!(buf.to_vec().unwrap(), payload);
}

#[test]
fn test_failed_import_rolls_back_table() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = Arc::new(DataMgr::open(options(tempdir.path())).unwrap());
    let loader = InsertDataLoader::new(Arc::new(DataMgrConnector::new(data_mgr.clone())));
    let session = SessionContext {
        db_id: 1,
        user_id: 10,
    };

    loader
        .insert_data(
            &session,
            InsertBatch {
                table_id: 7,
                fragment_id: 0,
                num_rows: 1,
                chunks: vec![InsertChunk {
                    column_id: 2,
                    data: bytes::Bytes::from_static(b"doomed"),
                    stats: ChunkStats::default(),
                }],
            },
        )
        .unwrap();
    loader.mark_failed("worker exploded");
    let status = loader.finalize(&session, 7).unwrap();
    assert!(status.load_failed);

    // nothing survived the rollback
    assert!(!data_mgr
        .is_buffer_on_device(&ChunkKey::new(1, 7, 2, 0), MemoryLevel::Disk, 0)
        .unwrap());
    assert_eq!(data_mgr.get_table_epoch(1, 7), 0);
}

#[test]
fn test_chunk_mutex_coordinates_writers() {
    let tempdir = tempfile::tempdir().unwrap();
    let data_mgr = Arc::new(DataMgr::open(options(tempdir.path())).unwrap());
    let key = chunk_key(1);
    data_mgr
        .create_chunk_buffer(&key, MemoryLevel::Cpu, 0, 0, 64)
        .unwrap()
        .write(0, &[0; 64])
        .unwrap();

    let mut handles = vec![];
    for value in 1..=4u8 {
        let data_mgr = data_mgr.clone();
        let key = key.clone();
        handles.push(std::thread::spawn(move || {
            let mutex = data_mgr.chunk_mutex(&key);
            let _guard = mutex.write();
            let buf = data_mgr
                .get_chunk_buffer(&key, MemoryLevel::Cpu, 0, 0)
                .unwrap();
            buf.write(0, &[value; 64]).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // a torn write would mix values; exclusion keeps the chunk uniform
    let buf = data_mgr
        .get_chunk_buffer(&key, MemoryLevel::Cpu, 0, 0)
        .unwrap();
    let bytes = buf.to_vec().unwrap();
    assert!(bytes.iter().all(|b| *b == bytes[0]));
}
