#![forbid(unsafe_code)]

use ffs_alloc::mem::MemFixture;
use ffs_alloc::{AllocConfig, BlockGroup, BlockGroupFlags, CachingState, WorkerPool};
use ffs_error::FfsError;
use ffs_ondisk::BtrfsKey;
use ffs_types::{SZ_1M, SZ_4K};
use std::sync::{Arc, Barrier};
use tracing_subscriber::EnvFilter;

/// Route allocator logs to the test harness; `RUST_LOG=ffs::alloc=debug`
/// shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const CAPACITY: u64 = 100 * 1024 * SZ_1M;

fn pooled(config: AllocConfig) -> MemFixture {
    let pool = Arc::new(WorkerPool::new("cache", 4).unwrap());
    MemFixture::build(config, CAPACITY, pool).unwrap()
}

/// Three extents in a fresh data group, committed. Returns the group and
/// the extents as `(start, len)`.
fn populated(fx: &MemFixture) -> (Arc<BlockGroup>, Vec<(u64, u64)>) {
    init_tracing();
    let bg = fx.manager.force_chunk_alloc(BlockGroupFlags::DATA).unwrap();
    fx.commit();
    let extents: Vec<_> = [SZ_1M, 3 * SZ_4K, 2 * SZ_1M]
        .into_iter()
        .map(|len| (fx.allocate(&bg, len).unwrap(), len))
        .collect();
    fx.commit();
    (bg, extents)
}

fn not_cached(bg: &BlockGroup) -> bool {
    matches!(bg.lock().caching, CachingState::NotCached)
}

#[test]
fn concurrent_callers_share_one_caching_run() {
    let config = AllocConfig {
        space_cache: false,
        ..AllocConfig::default()
    };
    let fx = pooled(config);
    let (bg, extents) = populated(&fx);
    let used: u64 = extents.iter().map(|&(_, len)| len).sum();

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    assert!(not_cached(&bg));
    assert_eq!(bg.free_space().free_bytes(), 0);

    let barrier = Barrier::new(4);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                barrier.wait();
                fx.manager.ensure_cached(&bg, true).unwrap();
            });
        }
    });

    assert_eq!(fx.manager.stats().caching_runs, 1);
    assert!(bg.is_cached());
    assert_eq!(
        bg.free_space().free_bytes(),
        bg.length() - used - bg.bytes_super()
    );
    for (start, len) in extents {
        assert!(!bg.free_space().is_free(start, len));
    }
    // Terminal; a second request does no work.
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert_eq!(fx.manager.stats().caching_runs, 1);
}

#[test]
fn waiter_wakes_while_scan_is_still_running() {
    let config = AllocConfig {
        space_cache: false,
        free_space_tree: false,
        caching_wake_bytes: SZ_4K,
        ..AllocConfig::default()
    };
    let fx = pooled(config);
    init_tracing();
    let bg = fx.manager.force_chunk_alloc(BlockGroupFlags::METADATA).unwrap();
    fx.commit();
    let [first, hole, last] = [0; 3].map(|_| fx.allocate(&bg, SZ_1M).unwrap());
    assert_eq!([hole, last], [first + SZ_1M, first + 2 * SZ_1M]);
    fx.commit();
    fx.free(hole, SZ_1M).unwrap();
    fx.commit();

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    // The scan finds the hole, then stalls reading past the last extent.
    fx.store.pause_reads_from(last);
    fx.manager.wait_for_progress(&bg, SZ_1M / 2).unwrap();
    let mid_scan = matches!(bg.lock().caching, CachingState::Started(_));
    let free_mid_scan = bg.free_space().free_bytes();
    fx.store.resume_reads();

    assert!(mid_scan);
    assert_eq!(free_mid_scan, SZ_1M);
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert_eq!(
        bg.free_space().free_bytes(),
        bg.length() - 2 * SZ_1M - bg.bytes_super()
    );
}

#[test]
fn extent_freed_before_caching_stays_pinned_until_commit() {
    let config = AllocConfig {
        space_cache: false,
        ..AllocConfig::default()
    };
    let fx = MemFixture::with_config(config);
    init_tracing();
    let bg = fx.manager.force_chunk_alloc(BlockGroupFlags::DATA).unwrap();
    fx.commit();
    let at = fx.allocate(&bg, SZ_1M).unwrap();
    fx.allocate(&bg, SZ_1M).unwrap();
    fx.commit();

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    // Gone from the extent records but still pinned by the running
    // transaction.
    fx.free(at, SZ_1M).unwrap();
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert!(!bg.free_space().is_free(at, SZ_1M));
    assert_eq!(
        bg.free_space().free_bytes(),
        bg.length() - 2 * SZ_1M - bg.bytes_super()
    );

    fx.try_commit().unwrap();
    assert!(bg.free_space().is_free(at, SZ_1M));
    assert_eq!(bg.free_space().free_bytes(), bg.length() - SZ_1M - bg.bytes_super());
}

#[test]
fn current_snapshot_is_trusted() {
    let fx = MemFixture::new();
    let (bg, extents) = populated(&fx);
    let before = bg.free_space().ranges();

    // Without the extent records a scan would see the whole group free.
    for &(start, len) in &extents {
        fx.store.remove(&BtrfsKey::extent(start, len));
    }
    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert_eq!(bg.free_space().ranges(), before);
}

#[test]
fn clean_group_keeps_its_snapshot_across_commits() {
    let fx = MemFixture::new();
    let (bg, extents) = populated(&fx);
    let header = BtrfsKey::free_space_header(bg.start());
    let written = fx.store.get(&header).unwrap();
    let before = bg.free_space().ranges();

    // Later commits touch only another group.
    let other = fx.manager.force_chunk_alloc(BlockGroupFlags::DATA).unwrap();
    fx.commit();
    fx.allocate(&other, SZ_1M).unwrap();
    fx.commit();
    assert_eq!(fx.store.get(&header).unwrap(), written);
    assert!(fx.store.get(&BtrfsKey::free_space_header(other.start())).is_some());

    for &(start, len) in &extents {
        fx.store.remove(&BtrfsKey::extent(start, len));
    }
    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert_eq!(bg.free_space().ranges(), before);
}

#[test]
fn dirty_group_that_is_not_cached_drops_its_snapshot() {
    let fx = MemFixture::new();
    let (bg, extents) = populated(&fx);
    let header = BtrfsKey::free_space_header(bg.start());
    assert!(fx.store.get(&header).is_some());

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    let (start, len) = extents[0];
    fx.free(start, len).unwrap();
    fx.commit();
    assert!(!bg.is_cached());
    assert!(fx.store.get(&header).is_none());

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert!(bg.free_space().is_free(start, len));
    let used: u64 = extents[1..].iter().map(|&(_, len)| len).sum();
    assert_eq!(
        bg.free_space().free_bytes(),
        bg.length() - used - bg.bytes_super()
    );
}

#[test]
fn snapshot_from_uncommitted_transaction_is_ignored() {
    let fx = MemFixture::new();
    let (bg, extents) = populated(&fx);
    let (start, len) = extents[1];
    fx.free(start, len).unwrap();
    // Written but never committed: stamped with a generation the next
    // mount has not reached.
    fx.manager
        .write_dirty_block_groups(&fx.transactions.current())
        .unwrap();
    // A scan sees this range free; a trusted snapshot would not.
    let (lost, lost_len) = extents[0];
    fx.store.remove(&BtrfsKey::extent(lost, lost_len));

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert!(bg.free_space().is_free(start, len));
    assert!(bg.free_space().is_free(lost, lost_len));
}

#[test]
fn free_space_tree_round_trips_through_mount() {
    let config = AllocConfig {
        space_cache: false,
        free_space_tree: true,
        ..AllocConfig::default()
    };
    let fx = MemFixture::with_config(config);
    let (bg, extents) = populated(&fx);
    let before = bg.free_space().ranges();
    for &(start, len) in &extents {
        fx.store.remove(&BtrfsKey::extent(start, len));
    }

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    fx.manager.ensure_cached(&bg, true).unwrap();
    assert_eq!(bg.free_space().ranges(), before);
}

#[test]
fn inconsistent_free_space_tree_fails_closed() {
    let config = AllocConfig {
        space_cache: false,
        free_space_tree: true,
        ..AllocConfig::default()
    };
    let fx = MemFixture::with_config(config);
    let (bg, _) = populated(&fx);
    // One extent more than the info item records.
    fx.store
        .put(BtrfsKey::free_space_extent(bg.end() - SZ_4K, SZ_4K), Vec::new());

    let fx = fx.remount().unwrap();
    let bg = fx.manager.get_block_group(bg.start()).unwrap();
    assert!(matches!(
        fx.manager.ensure_cached(&bg, true),
        Err(FfsError::CachingFailed { start, .. }) if start == bg.start()
    ));
    assert_eq!(fx.manager.stats().caching_failures, 1);
    assert_eq!(bg.free_space().free_bytes(), 0);
    assert!(matches!(
        fx.manager.ensure_cached(&bg, false),
        Err(FfsError::CachingFailed { .. })
    ));
}
