#![forbid(unsafe_code)]
//! Chunk allocation and block-group creation.
//!
//! A new group is usable in memory as soon as it is registered, but its
//! item is only inserted at commit by `create_pending_block_groups`.
//! Creation updates the space info before the registry so a lookup never
//! finds a group missing its accounting.

use crate::block_group::{BlockGroup, CachingState, GroupPhase, GroupState};
use crate::collab::{ChunkPlacement, super_stripe_ranges};
use crate::config::AllocConfig;
use crate::manager::BlockGroupManager;
use crate::profile::BlockGroupFlags;
use crate::space_info::{ChunkAllocForce, SpaceCounters};
use crate::transaction::TransHandle;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{BlockGroupItem, BtrfsKey, FIRST_CHUNK_TREE_OBJECTID};
use ffs_types::{human_bytes, mult_perc};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Whether a family with counters `c` should get a new chunk.
///
/// `Force` always allocates. `Limited` allocates when the family's free
/// headroom drops below `max(limited_alloc_floor, limited_alloc_percent of
/// fs_total_bytes)`. Otherwise a chunk is added once usage plus slack
/// reaches `chunk_alloc_percent` of the family's total.
#[must_use]
pub fn should_alloc_chunk(
    config: &AllocConfig,
    c: &SpaceCounters,
    force: ChunkAllocForce,
    fs_total_bytes: u64,
) -> bool {
    let bytes_used = c.used(false);
    if force == ChunkAllocForce::Force {
        return true;
    }
    if force == ChunkAllocForce::Limited {
        let thresh = config
            .limited_alloc_floor
            .max(mult_perc(fs_total_bytes, u64::from(config.limited_alloc_percent)));
        if c.total_bytes.saturating_sub(bytes_used) < thresh {
            return true;
        }
    }
    bytes_used + config.chunk_alloc_slack
        >= mult_perc(c.total_bytes, u64::from(config.chunk_alloc_percent))
}

impl BlockGroupManager {
    /// Allocate a chunk of profile `flags` if the family needs one.
    ///
    /// Returns the new group, or `None` when no chunk was needed. Fails with
    /// `NoSpace` if the devices are full, which also marks the family full.
    pub fn chunk_alloc(
        &self,
        trans: &TransHandle,
        flags: BlockGroupFlags,
        force: ChunkAllocForce,
    ) -> Result<Option<Arc<BlockGroup>>> {
        trans.check_aborted()?;
        let si = self.find_or_create_space_info(flags);
        let fs_total = self.collab.chunks.total_bytes();

        loop {
            let mut c = si.lock();
            let force = force.max(c.force_alloc);
            let should = should_alloc_chunk(&self.config, &c, force, fs_total);
            if c.full {
                return if should { Err(FfsError::NoSpace) } else { Ok(None) };
            }
            if !should {
                return Ok(None);
            }
            if c.chunk_alloc {
                // Someone else is allocating; wait for them and re-check.
                drop(c);
                drop(self.chunk_mutex.lock());
                std::thread::yield_now();
                continue;
            }
            c.chunk_alloc = true;
            break;
        }

        let result = {
            let _chunk = self.chunk_mutex.lock();
            if flags.is_data() && self.config.metadata_ratio > 0 {
                let n = self.data_chunk_allocations.fetch_add(1, Ordering::Relaxed) + 1;
                if n % self.config.metadata_ratio == 0 {
                    self.force_metadata_allocation();
                }
            }
            self.do_chunk_alloc(trans, flags)
        };

        let mut c = si.lock();
        c.chunk_alloc = false;
        match result {
            Ok(bg) => {
                c.force_alloc = ChunkAllocForce::NoForce;
                c.full = false;
                Ok(Some(bg))
            }
            Err(FfsError::NoSpace) => {
                c.full = true;
                c.force_alloc = ChunkAllocForce::NoForce;
                Err(FfsError::NoSpace)
            }
            Err(err) => Err(err),
        }
    }

    /// Create a group of the current profile for `type_flags` regardless of
    /// usage thresholds.
    pub fn force_chunk_alloc(&self, type_flags: BlockGroupFlags) -> Result<Arc<BlockGroup>> {
        let tm = &self.collab.transactions;
        let trans = tm.join()?;
        let flags = self
            .profiles
            .get_alloc_profile(type_flags.type_bits(), self.collab.chunks.rw_devices());
        let result = self.chunk_alloc(&trans, flags, ChunkAllocForce::Force);
        let ended = tm.end(&trans);
        let bg = result?.ok_or(FfsError::NoSpace)?;
        ended?;
        Ok(bg)
    }

    fn force_metadata_allocation(&self) {
        for si in self.space_infos.read().iter() {
            if si.flags().is_metadata() {
                si.lock().force_alloc = ChunkAllocForce::Force;
            }
        }
    }

    fn do_chunk_alloc(&self, trans: &TransHandle, flags: BlockGroupFlags) -> Result<Arc<BlockGroup>> {
        let placement = self.collab.chunks.allocate_device_extents(flags, None)?;
        match self.make_block_group(trans, placement.clone()) {
            Ok(bg) => Ok(bg),
            Err(err) => {
                if let Err(free_err) = self.collab.chunks.free_device_extents(&placement) {
                    warn!(target: "ffs::alloc::lifecycle", start = placement.start, error = %free_err, "leaked device extents");
                }
                Err(err)
            }
        }
    }

    /// Build a group for a freshly placed chunk and make it usable
    /// immediately. Its item is inserted at commit.
    pub(crate) fn make_block_group(
        &self,
        trans: &TransHandle,
        placement: ChunkPlacement,
    ) -> Result<Arc<BlockGroup>> {
        let start = placement.start;
        let length = placement.length;
        let flags = placement.flags;
        if let Some(existing) = self.registry.lookup_containing(start) {
            return Err(FfsError::Exists(format!(
                "chunk {start} overlaps block group {}",
                existing.start()
            )));
        }

        let si = self.find_or_create_space_info(flags);
        let excluded = if self.config.zoned {
            Vec::new()
        } else {
            super_stripe_ranges(&placement)
        };
        let mut state = GroupState::new(length, GroupPhase::Creating, CachingState::Finished);
        if self.config.zoned {
            if let Some(zone) = self.collab.chunks.zone_info(start) {
                state.alloc_offset = zone.alloc_offset;
                state.zone_capacity = zone.capacity.min(length);
            }
            state.zone_unusable =
                state.alloc_offset + length.saturating_sub(state.zone_capacity);
        }
        let free_space = (self.collab.free_space_factory)(start, length);
        let bg = Arc::new(BlockGroup::new(placement, excluded, Arc::clone(&si), free_space, state));

        let (free_start, free_end) = if self.config.zoned {
            let st = bg.lock();
            (start + st.alloc_offset, start + st.zone_capacity)
        } else {
            (start, bg.end())
        };
        if free_end > free_start {
            self.add_new_free_space(&bg, free_start, free_end)?;
        }

        si.add_group(&bg);
        self.profiles.set_avail_alloc_bits(flags);
        if let Err(err) = self.registry.insert(Arc::clone(&bg)) {
            self.unlink_from_space_info(&bg)?;
            return Err(err);
        }
        trans.push_new(Arc::clone(&bg));
        self.stats.groups_created.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "ffs::alloc::lifecycle",
            start,
            length = %human_bytes(length),
            flags = %flags,
            "block group created"
        );
        Ok(bg)
    }

    /// Persist the items of groups created in `trans` and activate them.
    pub fn create_pending_block_groups(&self, trans: &TransHandle) -> Result<()> {
        for bg in trans.take_new() {
            if trans.abort_reason().is_some() {
                continue;
            }
            let used = bg.used();
            let item = BlockGroupItem {
                used,
                chunk_objectid: FIRST_CHUNK_TREE_OBJECTID,
                flags: bg.flags().bits(),
            };
            let key = BtrfsKey::block_group(bg.start(), bg.length());
            if let Err(err) = self.collab.store.insert_item(key, item.to_bytes()) {
                self.abort_transaction(trans, &err);
                continue;
            }

            // Free-space state is written with the dirty groups that follow.
            let unused = {
                let mut st = bg.lock();
                st.commit_used = used;
                st.transition(bg.start(), GroupPhase::Active)?;
                if !st.dirty {
                    st.dirty = true;
                    trans.push_dirty(Arc::clone(&bg));
                }
                st.used == 0 && st.reserved == 0 && st.pinned == 0
            };
            debug!(target: "ffs::alloc::lifecycle", start = bg.start(), "pending block group persisted");
            if unused {
                self.mark_unused(&bg);
            }
        }
        trans.check_aborted()
    }
}
