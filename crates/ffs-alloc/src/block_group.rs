#![forbid(unsafe_code)]
//! One block group: a contiguous logical region of one allocation profile.
//!
//! ## Design
//!
//! Immutable geometry (start, length, flags, superblock exclusions, chunk
//! placement) lives directly on [`BlockGroup`]; everything that changes at
//! runtime lives in [`GroupState`] behind the group's mutex. The caching
//! and lifecycle state machines are tagged enums whose transitions are
//! validated where they happen, so a group can never be both cached and
//! caching, or removed while still writable.
//!
//! Handles are `Arc<BlockGroup>`: a group that has been erased from the
//! registry stays alive until the last holder drops it.

use crate::caching::CachingControl;
use crate::collab::ChunkPlacement;
use crate::free_space::FreeSpaceIndex;
use crate::profile::BlockGroupFlags;
use crate::space_info::SpaceInfo;
use ffs_error::{FfsError, Result};
use ffs_types::{SZ_128K, SZ_8M};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ── State machines ──────────────────────────────────────────────────────────

/// Free-space population state. `Started` owns the single in-flight
/// control; `Finished` and `Error` are terminal.
#[derive(Debug, Clone)]
pub enum CachingState {
    NotCached,
    Started(Arc<CachingControl>),
    Finished,
    Error,
}

impl CachingState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotCached => "not_cached",
            Self::Started(_) => "started",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

/// Operational lifecycle. `ReadOnly` and `Removing` carry the read-only
/// nesting count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupPhase {
    /// Usable in memory, item not yet persisted.
    Creating,
    Active,
    ReadOnly(u32),
    Removing(u32),
    Removed,
}

impl GroupPhase {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::ReadOnly(_) => "read_only",
            Self::Removing(_) => "removing",
            Self::Removed => "removed",
        }
    }

    #[must_use]
    pub fn ro_count(self) -> u32 {
        match self {
            Self::ReadOnly(n) | Self::Removing(n) => n,
            Self::Creating | Self::Active | Self::Removed => 0,
        }
    }

    fn allows(self, to: Self) -> bool {
        match (self, to) {
            (Self::Creating, Self::Active) | (Self::Active, Self::ReadOnly(1)) => true,
            (Self::ReadOnly(1), Self::Active) => true,
            (Self::ReadOnly(n), Self::ReadOnly(m)) => n >= 1 && m >= 1 && n.abs_diff(m) == 1,
            (Self::ReadOnly(n), Self::Removing(m)) | (Self::Removing(n), Self::ReadOnly(m)) => {
                n == m && n >= 1
            }
            (Self::Removing(_), Self::Removed) => true,
            _ => false,
        }
    }
}

/// Coarse extent-size classification used to keep similar allocations
/// together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeClass {
    #[default]
    None,
    Small,
    Medium,
    Large,
}

impl SizeClass {
    #[must_use]
    pub fn from_size(size: u64) -> Self {
        if size <= SZ_128K {
            Self::Small
        } else if size <= SZ_8M {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

/// Which sweep list a group currently sits on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListMembership {
    #[default]
    None,
    Unused,
    Reclaim,
}

// ── Mutable state ───────────────────────────────────────────────────────────

/// Runtime counters and state of a group, guarded by the group lock.
#[derive(Debug)]
pub struct GroupState {
    pub used: u64,
    pub reserved: u64,
    pub pinned: u64,
    /// Extents freed but not yet unpinned, start to length. Sums to
    /// `pinned`.
    pub pinned_ranges: BTreeMap<u64, u64>,
    pub zone_unusable: u64,
    pub delalloc_bytes: u64,
    /// `used` as of the last persisted item.
    pub commit_used: u64,
    pub alloc_offset: u64,
    pub zone_capacity: u64,
    pub phase: GroupPhase,
    pub caching: CachingState,
    pub size_class: SizeClass,
    pub list: ListMembership,
    /// On the running transaction's dirty list.
    pub dirty: bool,
    /// Allocated from or freed into since the group was loaded, so its
    /// persisted free-space state no longer applies.
    pub changed_since_load: bool,
    pub swap_extents: u32,
}

impl GroupState {
    pub(crate) fn new(length: u64, phase: GroupPhase, caching: CachingState) -> Self {
        Self {
            used: 0,
            reserved: 0,
            pinned: 0,
            pinned_ranges: BTreeMap::new(),
            zone_unusable: 0,
            delalloc_bytes: 0,
            commit_used: 0,
            alloc_offset: 0,
            zone_capacity: length,
            phase,
            caching,
            size_class: SizeClass::None,
            list: ListMembership::None,
            dirty: false,
            changed_since_load: false,
            swap_extents: 0,
        }
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.phase.ro_count() > 0
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, start: u64, to: GroupPhase) -> Result<()> {
        if !self.phase.allows(to) {
            return Err(FfsError::InvalidTransition {
                start,
                from: self.phase.name(),
                to: to.name(),
            });
        }
        self.phase = to;
        Ok(())
    }
}

// ── BlockGroup ──────────────────────────────────────────────────────────────

pub struct BlockGroup {
    start: u64,
    length: u64,
    flags: BlockGroupFlags,
    bytes_super: u64,
    /// Superblock ranges never handed to the free-space index.
    excluded: Vec<(u64, u64)>,
    placement: ChunkPlacement,
    space_info: Arc<SpaceInfo>,
    state: Mutex<GroupState>,
    free_space: Box<dyn FreeSpaceIndex>,
    frozen: AtomicU32,
}

impl BlockGroup {
    pub(crate) fn new(
        placement: ChunkPlacement,
        excluded: Vec<(u64, u64)>,
        space_info: Arc<SpaceInfo>,
        free_space: Box<dyn FreeSpaceIndex>,
        state: GroupState,
    ) -> Self {
        let bytes_super = excluded.iter().map(|(_, len)| len).sum();
        Self {
            start: placement.start,
            length: placement.length,
            flags: placement.flags,
            bytes_super,
            excluded,
            placement,
            space_info,
            state: Mutex::new(state),
            free_space,
            frozen: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    #[must_use]
    pub fn flags(&self) -> BlockGroupFlags {
        self.flags
    }

    #[must_use]
    pub fn bytes_super(&self) -> u64 {
        self.bytes_super
    }

    #[must_use]
    pub fn excluded(&self) -> &[(u64, u64)] {
        &self.excluded
    }

    #[must_use]
    pub fn placement(&self) -> &ChunkPlacement {
        &self.placement
    }

    #[must_use]
    pub fn space_info(&self) -> &Arc<SpaceInfo> {
        &self.space_info
    }

    #[must_use]
    pub fn free_space(&self) -> &dyn FreeSpaceIndex {
        self.free_space.as_ref()
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Acquire the group lock. Callers that also need the space-info lock
    /// must take that one first.
    pub fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock()
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.lock().is_readonly()
    }

    #[must_use]
    pub fn phase(&self) -> GroupPhase {
        self.lock().phase
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self.lock().caching, CachingState::Finished)
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.lock().used
    }

    #[must_use]
    pub fn size_class(&self) -> SizeClass {
        self.lock().size_class
    }

    pub(crate) fn freeze(&self) {
        self.frozen.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this dropped the last freeze.
    pub(crate) fn unfreeze(&self) -> bool {
        self.frozen.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire) > 0
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn stats(&self) -> BlockGroupStats {
        let st = self.lock();
        BlockGroupStats {
            start: self.start,
            length: self.length,
            flags: self.flags,
            used: st.used,
            reserved: st.reserved,
            pinned: st.pinned,
            bytes_super: self.bytes_super,
            zone_unusable: st.zone_unusable,
            ro: st.phase.ro_count(),
            phase: st.phase,
            caching: st.caching.name(),
            size_class: st.size_class,
            free: self.free_space.free_bytes(),
        }
    }
}

impl fmt::Debug for BlockGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGroup")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("flags", &self.flags.to_string())
            .finish_non_exhaustive()
    }
}

/// Snapshot of one group's accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockGroupStats {
    pub start: u64,
    pub length: u64,
    pub flags: BlockGroupFlags,
    pub used: u64,
    pub reserved: u64,
    pub pinned: u64,
    pub bytes_super: u64,
    pub zone_unusable: u64,
    pub ro: u32,
    pub phase: GroupPhase,
    pub caching: &'static str,
    pub size_class: SizeClass,
    pub free: u64,
}

impl BlockGroupStats {
    /// `used + reserved + pinned + bytes_super + zone_unusable <= length`.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.used
            .checked_add(self.reserved)
            .and_then(|v| v.checked_add(self.pinned))
            .and_then(|v| v.checked_add(self.bytes_super))
            .and_then(|v| v.checked_add(self.zone_unusable))
            .is_some_and(|total| total <= self.length)
    }

    /// Bytes that would move into `bytes_readonly` on the 0→1 read-only
    /// transition.
    #[must_use]
    pub fn unreserved_free(&self) -> u64 {
        self.length
            .saturating_sub(self.used)
            .saturating_sub(self.reserved)
            .saturating_sub(self.pinned)
            .saturating_sub(self.bytes_super)
            .saturating_sub(self.zone_unusable)
    }
}
