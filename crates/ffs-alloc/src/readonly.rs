#![forbid(unsafe_code)]
//! Read-only transitions.
//!
//! The read-only count nests. Only the 0→1 and 1→0 edges move bytes: the
//! group's unreserved free space is parked in `bytes_readonly` so the
//! family's capacity shrinks while the group is excluded from allocation.
//! Both edges run with the space-info lock held, then the group lock.

use crate::block_group::{BlockGroup, GroupPhase, GroupState};
use crate::manager::BlockGroupManager;
use crate::space_info::{ChunkAllocForce, SpaceCounters, sub_counter};
use ffs_error::{FfsError, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// How [`BlockGroupManager::mark_readonly`] may satisfy the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOnlyRequest {
    /// Skip the free-space check.
    pub force: bool,
    /// On `NoSpace`, allocate a chunk for the family and retry once.
    pub do_chunk_alloc: bool,
}

/// Direction of a zone-unusable migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMigration {
    /// 0→1 read-only edge: zone-unusable bytes become read-only bytes.
    IntoReadOnly,
    /// 1→0 edge: recompute zone-unusable from the write pointer and take it
    /// back out of read-only bytes.
    OutOfReadOnly,
}

impl BlockGroupManager {
    /// Make `bg` read-only, waiting out the dirty-group writeout phase of a
    /// committing transaction first.
    pub fn mark_readonly(self: &Arc<Self>, bg: &Arc<BlockGroup>, req: ReadOnlyRequest) -> Result<()> {
        let tm = &self.collab.transactions;
        let (trans, guard) = loop {
            let trans = tm.join()?;
            let guard = self.ro_block_group_mutex.lock();
            if trans.dirty_bg_running() {
                drop(guard);
                let id = trans.id();
                tm.end(&trans)?;
                tm.wait_for_commit(id)?;
                continue;
            }
            break (trans, guard);
        };

        let mut result = self.inc_block_group_ro(bg, req.force);
        if matches!(result, Err(FfsError::NoSpace)) && req.do_chunk_alloc {
            let flags = self
                .profiles
                .get_alloc_profile(bg.flags().type_bits(), self.collab.chunks.rw_devices());
            debug!(target: "ffs::alloc::lifecycle", start = bg.start(), "read-only needs a chunk");
            result = match self.chunk_alloc(&trans, flags, ChunkAllocForce::Force) {
                Ok(_) => self.inc_block_group_ro(bg, req.force),
                Err(err) => Err(err),
            };
        }
        drop(guard);
        let ended = tm.end(&trans);
        result?;
        ended
    }

    /// Bump the read-only count of `bg`.
    ///
    /// Without `force`, the family must still fit its usage (including
    /// speculative reservations) once the group's free bytes are gone.
    /// Metadata families that do not fit may still overcommit against
    /// unallocated device space.
    pub fn inc_block_group_ro(&self, bg: &BlockGroup, force: bool) -> Result<()> {
        let si = bg.space_info();
        let mut c = si.lock();
        let mut st = bg.lock();

        if st.swap_extents > 0 {
            return Err(FfsError::SwapActive(bg.start()));
        }
        match st.phase {
            GroupPhase::ReadOnly(n) => {
                return st.transition(bg.start(), GroupPhase::ReadOnly(n + 1));
            }
            GroupPhase::Creating | GroupPhase::Removing(_) | GroupPhase::Removed => {
                return Err(FfsError::Busy(format!(
                    "block group {} is {}",
                    bg.start(),
                    st.phase.name()
                )));
            }
            GroupPhase::Active => {}
        }

        let num_bytes = unreserved_free(bg, &st);
        let fits = force
            || c.used(true) + num_bytes <= c.total_bytes
            || (!si.flags().is_data() && self.can_overcommit(&c, bg, num_bytes));
        if !fits {
            debug!(
                target: "ffs::alloc::lifecycle",
                start = bg.start(),
                num_bytes,
                used = c.used(true),
                total = c.total_bytes,
                "no room to make block group read-only"
            );
            return Err(FfsError::NoSpace);
        }

        st.transition(bg.start(), GroupPhase::ReadOnly(1))?;
        c.bytes_readonly += num_bytes;
        self.migrate_zone_unusable(&mut c, bg, &mut st, ZoneMigration::IntoReadOnly)?;
        c.ro_groups.push(bg.start());
        Ok(())
    }

    /// Drop one read-only reference. The last one returns the parked bytes.
    pub fn clear_readonly(&self, bg: &BlockGroup) -> Result<()> {
        let si = bg.space_info();
        let mut c = si.lock();
        let mut st = bg.lock();

        match st.phase {
            GroupPhase::ReadOnly(1) => {}
            GroupPhase::ReadOnly(n) => return st.transition(bg.start(), GroupPhase::ReadOnly(n - 1)),
            other => {
                return Err(FfsError::InvalidTransition {
                    start: bg.start(),
                    from: other.name(),
                    to: GroupPhase::Active.name(),
                });
            }
        }

        self.migrate_zone_unusable(&mut c, bg, &mut st, ZoneMigration::OutOfReadOnly)?;
        let num_bytes = unreserved_free(bg, &st);
        sub_counter(&mut c.bytes_readonly, "bytes_readonly", num_bytes)?;
        st.transition(bg.start(), GroupPhase::Active)?;
        c.ro_groups.retain(|&s| s != bg.start());
        Ok(())
    }

    /// The only place zone-unusable bytes move in or out of the read-only
    /// counter. A no-op on conventional media.
    pub(crate) fn migrate_zone_unusable(
        &self,
        c: &mut SpaceCounters,
        bg: &BlockGroup,
        st: &mut GroupState,
        direction: ZoneMigration,
    ) -> Result<()> {
        if !self.config.zoned {
            return Ok(());
        }
        match direction {
            ZoneMigration::IntoReadOnly => {
                let moved = st.zone_unusable;
                sub_counter(&mut c.bytes_zone_unusable, "bytes_zone_unusable", moved)?;
                c.bytes_readonly += moved;
                st.zone_unusable = 0;
            }
            ZoneMigration::OutOfReadOnly => {
                let unusable = st
                    .alloc_offset
                    .saturating_sub(st.used)
                    .saturating_sub(st.pinned)
                    .saturating_sub(st.reserved)
                    + bg.length().saturating_sub(st.zone_capacity);
                sub_counter(&mut c.bytes_readonly, "bytes_readonly", unusable)?;
                c.bytes_zone_unusable += unusable;
                st.zone_unusable = unusable;
            }
        }
        Ok(())
    }

    /// Metadata may promise more than is allocated, up to half of the
    /// unallocated raw space scaled by the profile's copy count.
    fn can_overcommit(&self, c: &SpaceCounters, bg: &BlockGroup, bytes: u64) -> bool {
        let profile = self
            .profiles
            .get_alloc_profile(bg.flags().type_bits(), self.collab.chunks.rw_devices());
        let factor = profile.raid_type().factor().max(1);
        let avail = (self.collab.chunks.unallocated_bytes() / factor) >> 1;
        c.used(true) + bytes < c.total_bytes + avail
    }

    /// Forced read-only for chunks the device layer will not write to.
    pub(crate) fn mark_unwritable_readonly(&self, bg: &BlockGroup) -> Result<()> {
        self.inc_block_group_ro(bg, true)?;
        info!(target: "ffs::alloc::lifecycle", start = bg.start(), "block group on unwritable chunk marked read-only");
        Ok(())
    }
}

/// Bytes neither used, reserved, pinned, superblock nor zone-unusable.
fn unreserved_free(bg: &BlockGroup, st: &GroupState) -> u64 {
    bg.length()
        .saturating_sub(st.used)
        .saturating_sub(st.reserved)
        .saturating_sub(st.pinned)
        .saturating_sub(bg.bytes_super())
        .saturating_sub(st.zone_unusable)
}
