#![forbid(unsafe_code)]
//! Per-family space accounting.
//!
//! One [`SpaceInfo`] exists per profile family (data, metadata, system, or
//! mixed). Its counters are the single source of truth for "is there
//! enough space"; they are mirrored from per-group counters and always
//! updated under the space-info lock first, then the group lock.
//!
//! Membership lists (which groups belong to the family, per RAID type) sit
//! behind a separate reader/writer lock: they change rarely and must not
//! serialise the counter hot path.

use crate::block_group::BlockGroup;
use crate::profile::{BlockGroupFlags, NR_RAID_TYPES, RaidType};
use ffs_error::{FfsError, Result};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

/// How hard a chunk allocation request pushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkAllocForce {
    #[default]
    NoForce,
    /// Allocate only if unallocated headroom in the family is low.
    Limited,
    Force,
}

/// Aggregate counters, guarded by the space-info lock.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceCounters {
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub bytes_reserved: u64,
    pub bytes_pinned: u64,
    pub bytes_readonly: u64,
    pub bytes_zone_unusable: u64,
    /// Speculative reservations not yet tied to an extent.
    pub bytes_may_use: u64,
    /// Raw device bytes, i.e. counters multiplied by the profile factor.
    pub disk_used: u64,
    pub disk_total: u64,
    pub full: bool,
    pub chunk_alloc: bool,
    pub force_alloc: ChunkAllocForce,
    /// Starts of groups currently read-only.
    pub ro_groups: Vec<u64>,
}

impl SpaceCounters {
    /// Bytes not available for new allocation: used, reserved, pinned,
    /// read-only and zone-unusable, plus speculative reservations when
    /// `include_may_use` is set.
    #[must_use]
    pub fn used(&self, include_may_use: bool) -> u64 {
        let base = self.bytes_used
            + self.bytes_reserved
            + self.bytes_pinned
            + self.bytes_readonly
            + self.bytes_zone_unusable;
        if include_may_use {
            base + self.bytes_may_use
        } else {
            base
        }
    }
}

/// Subtract `delta` from a counter, failing instead of wrapping.
pub(crate) fn sub_counter(value: &mut u64, counter: &'static str, delta: u64) -> Result<()> {
    match value.checked_sub(delta) {
        Some(v) => {
            *value = v;
            Ok(())
        }
        None => {
            error!(
                target: "ffs::alloc::space",
                counter,
                current = *value,
                delta,
                "accounting underflow"
            );
            Err(FfsError::AccountingUnderflow {
                counter,
                current: *value,
                delta,
            })
        }
    }
}

pub struct SpaceInfo {
    flags: BlockGroupFlags,
    counters: Mutex<SpaceCounters>,
    groups: RwLock<Vec<Vec<Weak<BlockGroup>>>>,
    reclaim_threshold: AtomicU8,
}

impl SpaceInfo {
    #[must_use]
    pub fn new(flags: BlockGroupFlags, reclaim_threshold_percent: u8) -> Self {
        Self {
            flags: flags.type_bits(),
            counters: Mutex::new(SpaceCounters::default()),
            groups: RwLock::new(vec![Vec::new(); NR_RAID_TYPES]),
            reclaim_threshold: AtomicU8::new(reclaim_threshold_percent),
        }
    }

    /// Type bits of this family.
    #[must_use]
    pub fn flags(&self) -> BlockGroupFlags {
        self.flags
    }

    /// Acquire the counter lock. Must be taken before any group lock.
    pub fn lock(&self) -> MutexGuard<'_, SpaceCounters> {
        self.counters.lock()
    }

    #[must_use]
    pub fn snapshot(&self) -> SpaceCounters {
        self.counters.lock().clone()
    }

    /// Advisory point-in-time usage; see [`SpaceCounters::used`].
    #[must_use]
    pub fn used(&self, include_reservations: bool) -> u64 {
        self.counters.lock().used(include_reservations)
    }

    /// Record a speculative reservation. Never fails: overcommit is allowed
    /// and admission is decided by the caller's flushing policy.
    pub fn reserve(&self, bytes: u64) {
        let mut c = self.counters.lock();
        c.bytes_may_use = c.bytes_may_use.saturating_add(bytes);
    }

    pub fn release_reservation(&self, bytes: u64) -> Result<()> {
        let mut c = self.counters.lock();
        sub_counter(&mut c.bytes_may_use, "bytes_may_use", bytes)
    }

    pub fn mark_full(&self) {
        self.counters.lock().full = true;
    }

    pub fn clear_full(&self) {
        self.counters.lock().full = false;
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.counters.lock().full
    }

    #[must_use]
    pub fn reclaim_threshold(&self) -> u8 {
        self.reclaim_threshold.load(Ordering::Relaxed)
    }

    pub fn set_reclaim_threshold(&self, percent: u8) {
        self.reclaim_threshold.store(percent.min(100), Ordering::Relaxed);
    }

    // ── Membership ─────────────────────────────────────────────────────────

    /// Take the membership write lock, excluding concurrent list changes
    /// while a sweep decides whether a group is the family's last.
    pub(crate) fn groups_write(&self) -> RwLockWriteGuard<'_, Vec<Vec<Weak<BlockGroup>>>> {
        self.groups.write()
    }

    /// Add `bg` to this family: membership list plus counters.
    pub(crate) fn add_group(&self, bg: &Arc<BlockGroup>) {
        let raid = bg.flags().raid_type();
        let factor = raid.factor();
        {
            let mut c = self.counters.lock();
            let st = bg.lock();
            c.total_bytes += bg.length();
            c.disk_total += bg.length() * factor;
            c.bytes_used += st.used;
            c.disk_used += st.used * factor;
            c.bytes_readonly += bg.bytes_super();
            c.bytes_zone_unusable += st.zone_unusable;
            if bg.length() > 0 {
                c.full = false;
            }
        }
        self.groups.write()[raid.index()].push(Arc::downgrade(bg));
    }

    /// Drop `bg` from the membership list. Returns true if its RAID type
    /// list became empty. The caller must hold `groups_write()` guard
    /// `lists`.
    pub(crate) fn unlink_group(lists: &mut [Vec<Weak<BlockGroup>>], bg: &BlockGroup) -> bool {
        let list = &mut lists[bg.flags().raid_type().index()];
        list.retain(|w| w.upgrade().is_some_and(|g| g.start() != bg.start()));
        list.is_empty()
    }

    /// Number of live member groups across all RAID types.
    #[must_use]
    pub fn member_count(&self) -> usize {
        Self::count_members(&self.groups.read())
    }

    pub(crate) fn count_members(lists: &[Vec<Weak<BlockGroup>>]) -> usize {
        lists
            .iter()
            .map(|l| l.iter().filter(|w| w.strong_count() > 0).count())
            .sum()
    }

    #[must_use]
    pub fn members(&self, raid: RaidType) -> Vec<Arc<BlockGroup>> {
        self.groups.read()[raid.index()]
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    #[must_use]
    pub fn all_members(&self) -> Vec<Arc<BlockGroup>> {
        self.groups
            .read()
            .iter()
            .flat_map(|l| l.iter().filter_map(Weak::upgrade))
            .collect()
    }
}

impl fmt::Debug for SpaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceInfo")
            .field("flags", &self.flags.to_string())
            .field("counters", &*self.counters.lock())
            .finish_non_exhaustive()
    }
}
