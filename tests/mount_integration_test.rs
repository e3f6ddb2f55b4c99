// Mount-level integration tests: exercise MountState end to end across an
// open/transaction/close cycle, an unclean shutdown followed by recovery
// on reopen, and the torn-write stop condition (scenario 6).

use pagebuf::block_io::{BlockIoPort, MemoryBlockDevice};
use pagebuf::buffer::object::IoMoveOp;
use pagebuf::log_item::buf_item::BufferLogItem;
use pagebuf::page_store::{MemoryPageStore, PAGE_SIZE};
use pagebuf::transaction::TRANS_TYPE_GENERIC;
use pagebuf::{MountConfig, MountState};
use std::sync::Arc;

fn test_config() -> MountConfig {
    MountConfig { log_size_blocks: 2048, iclog_count: 4, iclog_capacity: 8192, ..MountConfig::default() }
}

async fn commit_one_buffer_write(mount: &MountState, blkno: u64, byte: u8) {
    let target = mount.device_target();
    let buf = pagebuf::buffer::Buffer::new(target, blkno * 512, PAGE_SIZE, PAGE_SIZE);
    buf.associate_memory(vec![0u8; PAGE_SIZE]);
    buf.iomove(0, IoMoveOp::Write(&[byte; 128]));
    let item = BufferLogItem::new(buf, mount.flusher(), mount.ail());

    let txn = mount.transaction(TRANS_TYPE_GENERIC, 512, false).unwrap();
    txn.log_buf(&item, 0, 127);
    txn.commit(true).await.unwrap();
}

#[tokio::test]
async fn open_commit_close_reopen_replays_nothing_once_clean() {
    let device: Arc<dyn BlockIoPort> = Arc::new(MemoryBlockDevice::new(4096));
    let store: Arc<dyn pagebuf::page_store::PageStore> = Arc::new(MemoryPageStore::new());

    let mount = MountState::open(0, store.clone(), device.clone(), test_config(), None).await.unwrap();
    assert_eq!(mount.recovery_report().transactions_replayed, 0);

    commit_one_buffer_write(&mount, 100, 0xAB).await;
    mount.close().await.unwrap();

    // A clean unmount writes its own terminal record, so a fresh mount
    // finds the log quiescent and replays nothing.
    let remounted = MountState::open(0, store, device, test_config(), None).await.unwrap();
    assert_eq!(remounted.recovery_report().transactions_replayed, 0);
    remounted.close().await.unwrap();
}

#[tokio::test]
async fn crash_without_unmount_replays_the_committed_transaction_on_reopen() {
    let device: Arc<dyn BlockIoPort> = Arc::new(MemoryBlockDevice::new(4096));
    let store: Arc<dyn pagebuf::page_store::PageStore> = Arc::new(MemoryPageStore::new());

    let mount = MountState::open(0, store.clone(), device.clone(), test_config(), None).await.unwrap();
    commit_one_buffer_write(&mount, 200, 0xCD).await;
    // No close(): simulate a crash, leaving the committed record on disk
    // without a matching unmount marker.
    drop(mount);

    let recovered = MountState::open(0, store, device, test_config(), None).await.unwrap();
    assert_eq!(recovered.recovery_report().transactions_replayed, 1);
    assert_eq!(recovered.recovery_report().buffer_writes_applied, 1);
    recovered.close().await.unwrap();
}

#[tokio::test]
async fn torn_write_on_second_commit_stops_replay_after_the_first() {
    let raw_device = Arc::new(MemoryBlockDevice::new(4096));
    let device: Arc<dyn BlockIoPort> = raw_device.clone();
    let store: Arc<dyn pagebuf::page_store::PageStore> = Arc::new(MemoryPageStore::new());

    let mount = MountState::open(0, store.clone(), device.clone(), test_config(), None).await.unwrap();
    commit_one_buffer_write(&mount, 300, 0x11).await;

    // The first commit's force issues two writes (iclog header, iclog
    // data); the second commit's data write is the 4th write overall,
    // and is the one torn here so only the first record replays clean.
    raw_device.torn_write_at(4);
    commit_one_buffer_write(&mount, 301, 0x22).await;
    drop(mount);

    let recovered = MountState::open(0, store, device, test_config(), None).await.unwrap();
    assert_eq!(recovered.recovery_report().transactions_replayed, 1);
}

#[tokio::test]
async fn stats_reflect_log_activity_and_clear_to_zero() {
    let device: Arc<dyn BlockIoPort> = Arc::new(MemoryBlockDevice::new(4096));
    let store: Arc<dyn pagebuf::page_store::PageStore> = Arc::new(MemoryPageStore::new());
    let mount = MountState::open(0, store, device, test_config(), None).await.unwrap();

    commit_one_buffer_write(&mount, 400, 0x33).await;
    let stats = mount.stats();
    assert!(stats.log_reservations > 0);

    mount.clear_stats();
    let cleared = mount.stats();
    assert_eq!(cleared.log_reservations, 0);
    assert_eq!(cleared.ail_inserted, 0);

    mount.close().await.unwrap();
}

#[tokio::test]
async fn flusher_writes_back_a_dirty_buffer_queued_after_commit() {
    let device: Arc<dyn BlockIoPort> = Arc::new(MemoryBlockDevice::new(4096));
    let store: Arc<dyn pagebuf::page_store::PageStore> = Arc::new(MemoryPageStore::new());
    let mount = MountState::open(0, store, device, test_config(), None).await.unwrap();

    let target = mount.device_target();
    let buf = pagebuf::buffer::Buffer::new(target, 4096, PAGE_SIZE, PAGE_SIZE);
    buf.associate_memory(vec![0u8; PAGE_SIZE]);
    buf.iomove(0, IoMoveOp::Write(&[0x77u8; 64]));
    mount.flusher().queue(buf);

    let flushed = mount.flusher().run_once(mount.block_io().as_ref());
    assert_eq!(flushed, 1);

    mount.close().await.unwrap();
}

#[tokio::test]
async fn committed_buffer_is_removed_from_ail_once_its_write_back_completes() {
    let device: Arc<dyn BlockIoPort> = Arc::new(MemoryBlockDevice::new(4096));
    let store: Arc<dyn pagebuf::page_store::PageStore> = Arc::new(MemoryPageStore::new());
    let mount = MountState::open(0, store, device, test_config(), None).await.unwrap();

    commit_one_buffer_write(&mount, 500, 0x44).await;
    assert_eq!(mount.stats().ail_inserted, 1);

    // commit()'s completion callback already queued the buffer with the
    // delwri flusher; force the write-back through so its iodone callback
    // fires and removes the item from the AIL.
    mount.flusher().request_force_flush();
    let flushed = mount.flusher().run_once(mount.block_io().as_ref());
    assert_eq!(flushed, 1);
    assert_eq!(mount.stats().ail_deleted, 1);

    mount.close().await.unwrap();
}
