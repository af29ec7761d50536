//! Cross-engine scenarios: a master and a worker wired the way the RPC
//! layer wires them, with a local directory standing in for the UFS.

use anycache_common::{BlockId, BlockStoreConfig, MasterConfig, TierConfig, TierKind, WorkerConfig};
use anycache_master::FileSystemMaster;
use anycache_ufs::{CreateOptions, LocalUfs, UnderFileSystem};
use anycache_worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn small_worker(dir: &TempDir) -> Worker {
    let ufs = Arc::new(LocalUfs::new(dir.path().join("ufs")).unwrap());
    let config = WorkerConfig {
        block_store: BlockStoreConfig {
            tiers: vec![TierConfig::memory(64 * 1024 * 1024)],
            ..Default::default()
        },
        ..Default::default()
    };
    Worker::new(&config, Some(ufs)).unwrap()
}

#[test]
fn create_write_read_single_block() {
    let dir = TempDir::new().unwrap();
    let master = FileSystemMaster::new(&MasterConfig::default(), Box::new(|_| None)).unwrap();
    let worker = small_worker(&dir);

    let status = worker.status();
    let worker_id = master.register_worker("worker-1:29999", status.capacity_bytes, 0);

    // Client-side flow: mkdir, create, write one block on the worker
    master.mkdir("/data", 0o755, false).unwrap();
    let (file_id, target) = master.create_file("/data/x", 0o644).unwrap();
    assert_eq!(target, Some(worker_id));

    let block_id = BlockId::new(file_id, 0);
    let tier = worker.write_block(block_id, 0, b"hello world").unwrap();
    master.report_block_location(block_id, worker_id, "worker-1:29999", tier);
    master.complete_file(file_id, 11).unwrap();

    let info = master.get_file_info("/data/x").unwrap();
    assert_eq!(info.size, 11);
    assert!(info.is_complete);

    let data = worker.read_block(block_id, 0, 11).unwrap();
    assert_eq!(&data[..], b"hello world");

    let locations = master.get_block_locations(&[block_id]);
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].worker_id, worker_id);
    assert_eq!(locations[0].tier, TierKind::Memory);
}

#[test]
fn heartbeat_expiry_purges_worker_locations() {
    let dir = TempDir::new().unwrap();
    let master = FileSystemMaster::new(
        &MasterConfig {
            worker_heartbeat_timeout_ms: 50,
            ..Default::default()
        },
        Box::new(|_| None),
    )
    .unwrap();
    let worker = small_worker(&dir);

    let worker_id = master.register_worker("worker-1:29999", 1 << 30, 0);
    let file_id = {
        let (id, _) = master.create_file("/five-blocks", 0o644).unwrap();
        id
    };

    let block_ids: Vec<BlockId> = (0..5).map(|i| BlockId::new(file_id, i)).collect();
    for &block_id in &block_ids {
        let tier = worker.write_block(block_id, 0, b"block data").unwrap();
        master.report_block_location(block_id, worker_id, "worker-1:29999", tier);
    }
    assert_eq!(master.get_block_locations(&block_ids).len(), 5);

    // Stop heartbeating and let the timeout lapse
    std::thread::sleep(Duration::from_millis(80));
    let dead = master.check_heartbeats();
    assert_eq!(dead, vec![worker_id]);

    for &block_id in &block_ids {
        assert!(master.get_block_locations(&[block_id]).is_empty());
    }
    assert!(!master.get_worker(worker_id).unwrap().alive);
}

#[test]
fn preload_from_mounted_ufs_and_persist_back() {
    let dir = TempDir::new().unwrap();
    let ufs_root = dir.path().join("backing");
    let master = {
        let root = ufs_root.clone();
        FileSystemMaster::new(
            &MasterConfig::default(),
            Box::new(move |uri| {
                let rest = uri.strip_prefix("file://")?;
                LocalUfs::new(root.join(rest.trim_start_matches('/')))
                    .ok()
                    .map(|u| Arc::new(u) as Arc<dyn UnderFileSystem>)
            }),
        )
        .unwrap()
    };
    let worker = small_worker(&dir);

    master.mkdir("/warehouse", 0o755, false).unwrap();
    master.mount("/warehouse", "file://wh").unwrap();
    let (ufs, relative) = master.resolve_ufs("/warehouse/part-0.dat").unwrap();
    assert_eq!(relative, "part-0.dat");

    // Seed the backing store, then preload through the worker
    let file = ufs
        .create(
            &relative,
            &CreateOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .unwrap();
    file.write_at(b"warehouse row data", 0).unwrap();
    drop(file);

    let (file_id, _) = master.create_file("/warehouse/part-0.dat", 0o644).unwrap();
    let block_id = BlockId::new(file_id, 0);
    let cached = worker
        .cache_block(block_id, ufs.as_ref(), &relative, 0, 18)
        .unwrap();
    assert_eq!(cached, 18);
    assert_eq!(&worker.read_block(block_id, 0, 18).unwrap()[..], b"warehouse row data");

    // And persist it to a different backing path
    worker
        .data_mover()
        .submit_persist_with(block_id, "copies/part-0.dat", 0, Arc::clone(&ufs))
        .unwrap();
    worker.data_mover().wait_all();

    let copy = ufs.open("copies/part-0.dat").unwrap();
    let mut buf = [0u8; 18];
    assert_eq!(copy.read_at(&mut buf, 0).unwrap(), 18);
    assert_eq!(&buf, b"warehouse row data");
}
