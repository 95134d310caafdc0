#![forbid(unsafe_code)]

use ffs_alloc::mem::MemFixture;
use ffs_alloc::{
    AllocConfig, BlockGroup, BlockGroupFlags, ChunkAllocator, GroupPhase, ListMembership,
    ReadOnlyRequest, ReserveOptions,
};
use ffs_error::FfsError;
use ffs_ondisk::BtrfsKey;
use ffs_types::{SZ_1G, SZ_1M, SZ_4K};
use proptest::prelude::*;
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

fn active_data_group(fx: &MemFixture) -> Arc<BlockGroup> {
    init_tracing();
    let bg = fx.manager.force_chunk_alloc(BlockGroupFlags::DATA).unwrap();
    fx.commit();
    assert_eq!(bg.phase(), GroupPhase::Active);
    bg
}

fn assert_conserved(bg: &BlockGroup) {
    let stats = bg.stats();
    assert!(stats.is_conserved(), "group {} not conserved: {stats:?}", bg.start());
}

// ── Allocate / free round trip ─────────────────────────────────────────────

#[test]
fn allocate_free_round_trip_restores_free_space() {
    let fx = MemFixture::new();
    let bg = active_data_group(&fx);
    assert_eq!(bg.length(), SZ_1G);
    let before = bg.free_space().ranges();

    let trans = fx.transactions.current();
    fx.manager
        .reserve_extent(&bg, bg.start(), SZ_4K, ReserveOptions::default())
        .unwrap();
    fx.manager
        .update_on_allocation(&trans, bg.start(), SZ_4K, true)
        .unwrap();
    assert_eq!(bg.used(), 4096);
    assert!(!bg.free_space().is_free(bg.start(), SZ_4K));
    assert_conserved(&bg);

    fx.manager
        .update_on_allocation(&trans, bg.start(), SZ_4K, false)
        .unwrap();
    assert_eq!(bg.used(), 0);
    assert_eq!(bg.lock().pinned, SZ_4K);
    assert_conserved(&bg);

    fx.commit();
    assert_eq!(bg.lock().pinned, 0);
    assert_eq!(bg.free_space().ranges(), before);
    assert_eq!(bg.free_space().free_bytes(), bg.length() - bg.bytes_super());
    let c = bg.space_info().snapshot();
    assert_eq!((c.bytes_used, c.bytes_pinned, c.bytes_reserved), (0, 0, 0));
}

#[test]
fn allocation_spanning_two_groups_updates_both() {
    let fx = MemFixture::new();
    fx.chunks.set_chunk_size(Some(128 * SZ_1M));
    let a = active_data_group(&fx);
    let b = active_data_group(&fx);
    assert_eq!(a.end(), b.start());

    let tail = a.end() - SZ_1M;
    fx.manager
        .reserve_extent(&a, tail, SZ_1M, ReserveOptions::default())
        .unwrap();
    fx.manager
        .reserve_extent(&b, b.start(), SZ_1M, ReserveOptions::default())
        .unwrap();
    let trans = fx.transactions.current();
    fx.manager
        .update_on_allocation(&trans, tail, 2 * SZ_1M, true)
        .unwrap();
    assert_eq!(a.used(), SZ_1M);
    assert_eq!(b.used(), SZ_1M);
    assert_eq!(trans.dirty_count(), 2);
}

#[test]
fn address_outside_every_group_is_not_found() {
    let fx = MemFixture::new();
    active_data_group(&fx);
    let trans = fx.transactions.current();
    assert!(matches!(
        fx.manager.update_on_allocation(&trans, 7, SZ_4K, true),
        Err(FfsError::NotFound(_))
    ));
}

// ── Read-only ──────────────────────────────────────────────────────────────

#[test]
fn forced_readonly_under_pressure() {
    let fx = MemFixture::with_capacity(1000 * SZ_1M);
    let mut groups = Vec::new();
    for size in [500, 450, 50] {
        fx.chunks.set_chunk_size(Some(size * SZ_1M));
        groups.push(fx.manager.force_chunk_alloc(BlockGroupFlags::DATA).unwrap());
    }
    fx.commit();
    let si = Arc::clone(groups[0].space_info());
    assert_eq!(si.snapshot().total_bytes, 1000 * SZ_1M);
    si.reserve(790 * SZ_1M);

    // 5% of the family still fits.
    fx.manager
        .mark_readonly(&groups[2], ReadOnlyRequest::default())
        .unwrap();
    assert!(groups[2].is_readonly());

    // Half of it does not, and the devices have nothing left to add.
    let req = ReadOnlyRequest {
        force: false,
        do_chunk_alloc: true,
    };
    assert!(matches!(
        fx.manager.mark_readonly(&groups[0], req),
        Err(FfsError::NoSpace)
    ));
    assert_eq!(groups[0].phase(), GroupPhase::Active);
    assert!(si.is_full());

    // Forcing skips the check.
    fx.manager
        .mark_readonly(
            &groups[0],
            ReadOnlyRequest {
                force: true,
                do_chunk_alloc: false,
            },
        )
        .unwrap();
    assert!(groups[0].is_readonly());
}

#[test]
fn readonly_nesting_reverses_accounting() {
    let fx = MemFixture::new();
    let bg = active_data_group(&fx);
    fx.allocate(&bg, 8 * SZ_1M).unwrap();
    let before = bg.space_info().snapshot();

    const N: usize = 4;
    for _ in 0..N {
        fx.manager
            .mark_readonly(&bg, ReadOnlyRequest::default())
            .unwrap();
    }
    for _ in 0..N - 1 {
        fx.manager.clear_readonly(&bg).unwrap();
        assert!(bg.is_readonly());
    }
    fx.manager.clear_readonly(&bg).unwrap();
    assert_eq!(bg.phase(), GroupPhase::Active);
    assert_eq!(bg.space_info().snapshot(), before);
}

#[test]
fn reservation_on_readonly_group_is_busy() {
    let fx = MemFixture::new();
    let bg = active_data_group(&fx);
    fx.manager
        .mark_readonly(&bg, ReadOnlyRequest::default())
        .unwrap();
    assert!(matches!(
        fx.manager.find_and_reserve(&bg, SZ_4K, ReserveOptions::default()),
        Err(FfsError::Busy(_))
    ));
    let free = bg.free_space().free_bytes();
    assert_eq!(free, bg.length() - bg.bytes_super(), "failed reservation must not leak");
}

#[test]
fn swap_extents_block_readonly() {
    let fx = MemFixture::new();
    let bg = active_data_group(&fx);
    fx.manager.inc_swap_extents(&bg).unwrap();
    assert!(matches!(
        fx.manager.mark_readonly(&bg, ReadOnlyRequest::default()),
        Err(FfsError::SwapActive(start)) if start == bg.start()
    ));
    fx.manager.dec_swap_extents(&bg).unwrap();
    fx.manager
        .mark_readonly(&bg, ReadOnlyRequest::default())
        .unwrap();
}

// ── Concurrency ────────────────────────────────────────────────────────────

#[test]
fn racing_reservations_of_one_range_have_one_winner() {
    let fx = MemFixture::new();
    let bg = active_data_group(&fx);
    let at = bg.start() + SZ_1M;

    for _ in 0..16 {
        let barrier = Barrier::new(2);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        fx.manager
                            .reserve_extent(&bg, at, SZ_4K, ReserveOptions::default())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(FfsError::Busy(_)))));
        assert_eq!(bg.lock().reserved, SZ_4K);
        fx.manager.release_extent(&bg, at, SZ_4K, false).unwrap();
        assert_conserved(&bg);
    }
}

// ── Unused deletion ────────────────────────────────────────────────────────

#[test]
fn last_member_of_family_survives_sweep() {
    let fx = MemFixture::new();
    let bg = active_data_group(&fx);
    let at = fx.allocate(&bg, SZ_1M).unwrap();
    fx.commit();
    fx.free(at, SZ_1M).unwrap();
    fx.commit();
    assert_eq!(bg.used(), 0);

    fx.manager.delete_unused_bgs();
    assert!(Arc::ptr_eq(&fx.manager.get_block_group(bg.start()).unwrap(), &bg));
    assert_eq!(bg.phase(), GroupPhase::Active);
    assert_eq!(fx.manager.stats().unused_deleted, 0);
}

#[test]
fn empty_group_is_deleted_with_its_items_and_chunk() {
    let fx = MemFixture::new();
    let keep = active_data_group(&fx);
    fx.allocate(&keep, SZ_1M).unwrap();
    let doomed = active_data_group(&fx);
    let si = Arc::clone(doomed.space_info());
    let total_before = si.snapshot().total_bytes;
    assert!(fx.store.get(&BtrfsKey::block_group(doomed.start(), doomed.length())).is_some());

    fx.manager.delete_unused_bgs();

    assert_eq!(doomed.phase(), GroupPhase::Removed);
    assert!(matches!(
        fx.manager.get_block_group(doomed.start()),
        Err(FfsError::NotFound(_))
    ));
    assert_eq!(si.snapshot().total_bytes, total_before - doomed.length());
    assert_eq!(si.member_count(), 1);
    assert!(fx.store.get(&BtrfsKey::block_group(doomed.start(), doomed.length())).is_none());
    assert!(fx.store.get(&BtrfsKey::free_space_header(doomed.start())).is_none());
    assert!(fx.chunks.find_chunk(doomed.start()).is_none());
    assert_eq!(keep.phase(), GroupPhase::Active);
    let stats = fx.manager.stats();
    assert_eq!((stats.unused_deleted, stats.groups_removed), (1, 1));
    assert!(si.snapshot().ro_groups.is_empty());
}

#[test]
fn empty_group_with_pinned_bytes_waits_for_commit() {
    let fx = MemFixture::new();
    let keep = active_data_group(&fx);
    fx.allocate(&keep, SZ_1M).unwrap();
    let bg = active_data_group(&fx);
    let at = fx.allocate(&bg, SZ_1M).unwrap();
    fx.commit();
    fx.free(at, SZ_1M).unwrap();
    assert_eq!(bg.lock().list, ListMembership::Unused);

    fx.manager.delete_unused_bgs();
    assert_eq!(bg.phase(), GroupPhase::Active);
    assert_eq!(bg.lock().list, ListMembership::Unused);

    fx.commit();
    fx.manager.delete_unused_bgs();
    assert_eq!(bg.phase(), GroupPhase::Removed);
}

#[test]
fn pending_discard_defers_deletion() {
    let config = AllocConfig {
        discard_async: true,
        ..AllocConfig::default()
    };
    let fx = MemFixture::with_config(config);
    let keep = active_data_group(&fx);
    fx.allocate(&keep, SZ_1M).unwrap();
    let bg = active_data_group(&fx);
    let at = fx.allocate(&bg, SZ_1M).unwrap();
    fx.commit();
    // The sweep drops the now-busy group from the list it joined at creation.
    fx.manager.delete_unused_bgs();
    assert_eq!(bg.lock().list, ListMembership::None);

    fx.free(at, SZ_1M).unwrap();
    fx.commit();
    assert_eq!(fx.discard.queued(), vec![bg.start()]);
    assert_eq!(bg.lock().list, ListMembership::None);
    fx.manager.delete_unused_bgs();
    assert_eq!(bg.phase(), GroupPhase::Active);

    fx.finish_discard(&bg);
    assert_eq!(bg.lock().list, ListMembership::Unused);
    fx.manager.delete_unused_bgs();
    assert_eq!(bg.phase(), GroupPhase::Removed);
}

#[test]
fn trimmed_group_that_filled_again_stays_off_the_list() {
    let config = AllocConfig {
        discard_async: true,
        ..AllocConfig::default()
    };
    let fx = MemFixture::with_config(config);
    let bg = active_data_group(&fx);
    let at = fx.allocate(&bg, SZ_1M).unwrap();
    fx.commit();
    fx.manager.delete_unused_bgs();

    fx.free(at, SZ_1M).unwrap();
    fx.commit();
    fx.allocate(&bg, SZ_1M).unwrap();
    fx.finish_discard(&bg);
    assert_eq!(bg.lock().list, ListMembership::None);
}

#[test]
fn synchronous_discard_holds_chunk_until_commit() {
    let config = AllocConfig {
        discard_sync: true,
        ..AllocConfig::default()
    };
    let fx = MemFixture::with_config(config);
    let keep = active_data_group(&fx);
    fx.allocate(&keep, SZ_1M).unwrap();
    let bg = active_data_group(&fx);

    fx.manager.delete_unused_bgs();
    assert_eq!(bg.phase(), GroupPhase::Removed);
    assert!(bg.is_frozen());
    assert!(fx.chunks.find_chunk(bg.start()).is_some());

    fx.commit();
    assert!(!bg.is_frozen());
    assert!(fx.chunks.find_chunk(bg.start()).is_none());
    assert_eq!(fx.discard.trimmed_removed(), vec![bg.start()]);
}

// ── Reclaim ────────────────────────────────────────────────────────────────

fn reclaim_candidate(fx: &MemFixture) -> (Arc<BlockGroup>, Arc<BlockGroup>) {
    let bg = active_data_group(fx);
    let keep = fx.allocate(&bg, 700 * SZ_1M).unwrap();
    let freed = fx.allocate(&bg, 100 * SZ_1M).unwrap();
    fx.commit();
    assert_ne!(keep, freed);
    // New groups start on the unused list; a sweep drops the busy one.
    fx.manager.delete_unused_bgs();
    assert_eq!(bg.lock().list, ListMembership::None);

    fx.free(freed, 100 * SZ_1M).unwrap();
    assert_eq!(bg.lock().list, ListMembership::Reclaim);
    let target = active_data_group(fx);
    (bg, target)
}

#[test]
fn reclaim_moves_live_data_and_removes_group() {
    let fx = MemFixture::new();
    let (bg, target) = reclaim_candidate(&fx);

    fx.manager.reclaim_bgs();

    assert_eq!(bg.phase(), GroupPhase::Removed);
    assert_eq!(target.used(), 700 * SZ_1M);
    assert_eq!(fx.manager.registry().len(), 1);
    assert_eq!(fx.manager.stats().reclaimed, 1);
    let c = target.space_info().snapshot();
    assert_eq!(c.bytes_used, 700 * SZ_1M);
    assert_eq!(c.total_bytes, target.length());
    assert_conserved(&target);
}

#[test]
fn failed_relocation_restores_group() {
    let fx = MemFixture::new();
    let (bg, _target) = reclaim_candidate(&fx);
    let before = bg.space_info().snapshot();
    fx.relocator.set_fail(true);

    fx.manager.reclaim_bgs();

    assert_eq!(bg.phase(), GroupPhase::Active);
    assert_eq!(bg.lock().list, ListMembership::Reclaim);
    assert_eq!(bg.space_info().snapshot(), before);
    assert_eq!(fx.manager.stats().relocation_failures, 1);
}

#[test]
fn sweeps_stop_once_closing() {
    let fx = MemFixture::new();
    let keep = active_data_group(&fx);
    fx.allocate(&keep, SZ_1M).unwrap();
    let bg = active_data_group(&fx);
    fx.manager.unmount();
    fx.manager.delete_unused_bgs();
    assert_eq!(bg.phase(), GroupPhase::Active);
    assert_eq!(fx.manager.stats().unused_deleted, 0);
}

// ── Conservation ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Alloc(u64),
    Free(usize),
    Commit,
    ToggleReadOnly,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1_u64..256).prop_map(|blocks| Op::Alloc(blocks * SZ_4K)),
        3 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Commit),
        1 => Just(Op::ToggleReadOnly),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn counters_are_conserved(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let fx = MemFixture::new();
        let bg = active_data_group(&fx);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(len) => match fx.allocate(&bg, len) {
                    Ok(at) => live.push((at, len)),
                    Err(err) => prop_assert!(matches!(err, FfsError::Busy(_) | FfsError::NoSpace)),
                },
                Op::Free(pick) if !live.is_empty() => {
                    let (at, len) = live.swap_remove(pick % live.len());
                    fx.free(at, len).unwrap();
                }
                Op::Free(_) => {}
                Op::Commit => fx.commit(),
                Op::ToggleReadOnly => {
                    if bg.is_readonly() {
                        fx.manager.clear_readonly(&bg).unwrap();
                    } else {
                        fx.manager.inc_block_group_ro(&bg, true).unwrap();
                    }
                }
            }

            let stats = bg.stats();
            prop_assert!(stats.is_conserved(), "{:?}", stats);
            let c = bg.space_info().snapshot();
            prop_assert_eq!(c.bytes_used, stats.used);
            prop_assert_eq!(c.bytes_pinned, stats.pinned);
            prop_assert_eq!(c.bytes_reserved, stats.reserved);
            let live_bytes: u64 = live.iter().map(|&(_, len)| len).sum();
            prop_assert_eq!(stats.used, live_bytes);
            let index_bytes = bg.free_space().free_bytes();
            prop_assert_eq!(
                index_bytes + stats.used + stats.pinned + stats.reserved + bg.bytes_super(),
                bg.length()
            );
        }
    }
}
