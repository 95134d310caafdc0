#![forbid(unsafe_code)]
//! Unused-group deletion, reclaim and final removal.
//!
//! ## Design
//!
//! Two lists feed the background sweeps: groups that dropped to zero used
//! bytes, and groups whose usage fell below the reclaim threshold. A group
//! sits on at most one list, recorded in its `ListMembership`. The list
//! lock is always taken before any group lock.
//!
//! Removal is strictly ordered: the group is read-only first, its pinned
//! records are dropped, its persisted items are deleted, it leaves the
//! registry, then the space info, and only then are its device extents
//! released. Sweep failures are logged and the group is retried on a later
//! pass; deferring cleanup is always safe.

use crate::block_group::{BlockGroup, CachingState, GroupPhase, ListMembership};
use crate::manager::BlockGroupManager;
use crate::space_info::{SpaceInfo, sub_counter};
use crate::transaction::TransHandle;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{BtrfsKey, FREE_SPACE_EXTENT_KEY, FREE_SPACE_INFO_KEY};
use ffs_types::mult_perc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Groups waiting for a sweep.
#[derive(Debug, Default)]
pub(crate) struct SweepLists {
    pub(crate) unused: VecDeque<Arc<BlockGroup>>,
    pub(crate) reclaim: VecDeque<Arc<BlockGroup>>,
}

/// Whether a free that moved `old_used` to `new_used` crossed the reclaim
/// threshold downward. A group that was already below it (typically a new
/// group) is left alone.
#[must_use]
pub fn should_reclaim(threshold_percent: u8, length: u64, old_used: u64, new_used: u64) -> bool {
    if threshold_percent == 0 {
        return false;
    }
    let thresh = mult_perc(length, u64::from(threshold_percent));
    old_used >= thresh && new_used < thresh
}

impl BlockGroupManager {
    /// Queue `bg` for unused deletion. A group on the reclaim list moves
    /// over.
    pub fn mark_unused(&self, bg: &Arc<BlockGroup>) {
        let mut lists = self.sweep.lock();
        let mut st = bg.lock();
        match st.list {
            ListMembership::Unused => {}
            ListMembership::Reclaim => {
                lists.reclaim.retain(|g| !Arc::ptr_eq(g, bg));
                lists.unused.push_back(Arc::clone(bg));
                st.list = ListMembership::Unused;
            }
            ListMembership::None => {
                lists.unused.push_back(Arc::clone(bg));
                st.list = ListMembership::Unused;
            }
        }
        debug!(target: "ffs::alloc::sweep", start = bg.start(), "block group marked unused");
    }

    /// The discard scheduler finished trimming `bg`. A group that is still
    /// empty goes on the unused list.
    pub fn discard_finished(&self, bg: &Arc<BlockGroup>) {
        let empty = {
            let st = bg.lock();
            st.phase == GroupPhase::Active && st.used == 0
        };
        if empty {
            self.mark_unused(bg);
        }
    }

    /// Queue `bg` for reclaim unless it is already on a list.
    pub fn mark_to_reclaim(&self, bg: &Arc<BlockGroup>) {
        let mut lists = self.sweep.lock();
        let mut st = bg.lock();
        if st.list == ListMembership::None {
            lists.reclaim.push_back(Arc::clone(bg));
            st.list = ListMembership::Reclaim;
            debug!(target: "ffs::alloc::sweep", start = bg.start(), used = st.used, "block group marked for reclaim");
        }
    }

    fn pop_list(&self, reclaim: bool) -> Option<Arc<BlockGroup>> {
        let mut lists = self.sweep.lock();
        let bg = if reclaim {
            lists.reclaim.pop_front()
        } else {
            lists.unused.pop_front()
        }?;
        bg.lock().list = ListMembership::None;
        Some(bg)
    }

    fn forget_sweep(&self, bg: &Arc<BlockGroup>) {
        let mut lists = self.sweep.lock();
        lists.unused.retain(|g| !Arc::ptr_eq(g, bg));
        lists.reclaim.retain(|g| !Arc::ptr_eq(g, bg));
        bg.lock().list = ListMembership::None;
    }

    /// Run both sweeps on the work queue.
    pub fn schedule_sweeps(self: &Arc<Self>) -> Result<()> {
        let mgr = Arc::clone(self);
        self.collab.work_queue.submit(Box::new(move || {
            mgr.delete_unused_bgs();
            mgr.reclaim_bgs();
        }))
    }

    // ── Unused deletion ────────────────────────────────────────────────────

    /// Delete every queued group that is still empty, writable and not the
    /// last of its family. Groups skipped for a transient reason go back on
    /// the list for the next pass.
    pub fn delete_unused_bgs(&self) {
        if self.is_closing() {
            return;
        }
        let _reclaim = self.reclaim_lock.lock();
        let mut retry = Vec::new();

        while let Some(bg) = self.pop_list(false) {
            if self.is_closing() {
                retry.push(bg);
                break;
            }
            match self.try_delete_unused(&bg) {
                Ok(true) => {
                    self.stats.unused_deleted.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(err) if err.is_transient() => retry.push(bg),
                Err(err) => {
                    warn!(target: "ffs::alloc::sweep", start = bg.start(), error = %err, "unused block group deletion failed");
                    retry.push(bg);
                }
            }
        }
        for bg in retry {
            self.mark_unused(&bg);
        }
    }

    /// Returns `Ok(false)` if the group no longer qualifies and should be
    /// dropped from the list.
    fn try_delete_unused(&self, bg: &Arc<BlockGroup>) -> Result<bool> {
        let si = Arc::clone(bg.space_info());
        if self.config.discard_async {
            if self.collab.discard.is_queued(bg) || !self.collab.discard.is_trimmed(bg) {
                debug!(target: "ffs::alloc::sweep", start = bg.start(), "waiting for discard");
                return Err(FfsError::Busy(format!("block group {} not trimmed", bg.start())));
            }
        } else {
            self.collab.discard.cancel_discard(bg);
        }

        {
            // Exclude membership changes while deciding if this is the last
            // group of its family.
            let members = si.groups_write();
            let c = si.lock();
            let st = bg.lock();
            if st.used == 0 && st.reserved == 0 && st.pinned > 0 {
                // Empty once the freeing transaction commits.
                return Err(FfsError::Busy(format!("block group {} has pinned bytes", bg.start())));
            }
            let in_use = st.used > 0 || st.reserved > 0;
            if in_use
                || st.phase != GroupPhase::Active
                || SpaceInfo::count_members(&members) <= 1
            {
                debug!(
                    target: "ffs::alloc::sweep",
                    start = bg.start(),
                    used = st.used,
                    phase = st.phase.name(),
                    "skipping unused block group"
                );
                return Ok(false);
            }
            // Someone may have reserved space counting on this group.
            if c.total_bytes - bg.length() < c.used(true) && st.zone_unusable < bg.length() {
                debug!(target: "ffs::alloc::sweep", start = bg.start(), "outstanding reservations, retrying later");
                return Err(FfsError::Busy(format!(
                    "family still relies on block group {}",
                    bg.start()
                )));
            }
            drop(st);
            drop(c);
            if let Err(err) = self.inc_block_group_ro(bg, false) {
                debug!(target: "ffs::alloc::sweep", start = bg.start(), error = %err, "could not make unused group read-only");
                return Ok(false);
            }
            drop(members);
        }

        self.delete_readonly_group(bg)?;
        Ok(true)
    }

    /// Remove a group that is already read-only and empty. Shared tail of
    /// unused deletion and successful reclaim. If the group never reached
    /// the removing phase, the read-only mark is undone on failure.
    pub fn delete_readonly_group(&self, bg: &Arc<BlockGroup>) -> Result<()> {
        if self.config.zoned {
            if let Err(err) = self.collab.chunks.finish_zone(bg.start()) {
                self.clear_readonly(bg)?;
                return Err(err);
            }
        }
        let tm = &self.collab.transactions;
        let trans = match tm.start() {
            Ok(trans) => trans,
            Err(err) => {
                self.clear_readonly(bg)?;
                return Err(err);
            }
        };
        let result = self.delete_readonly_group_in(&trans, bg);
        let ended = tm.end(&trans);
        if let Err(err) = result {
            if matches!(bg.phase(), GroupPhase::ReadOnly(_)) {
                self.clear_readonly(bg)?;
            }
            return Err(err);
        }
        ended
    }

    fn delete_readonly_group_in(&self, trans: &TransHandle, bg: &Arc<BlockGroup>) -> Result<()> {
        let (start, end) = (bg.start(), bg.end());
        trans.clear_pinned_in(start, end);
        if let Some(prev) = self.collab.transactions.previous(trans) {
            prev.clear_pinned_in(start, end);
        }

        if self.collab.discard.is_queued(bg) {
            return Err(FfsError::Busy(format!("block group {start} is being discarded")));
        }

        {
            // Pinned records are gone; park the bytes as read-only.
            let si = bg.space_info();
            let mut c = si.lock();
            let mut st = bg.lock();
            let pinned = st.pinned;
            sub_counter(&mut c.bytes_pinned, "bytes_pinned", pinned)?;
            c.bytes_readonly += pinned;
            st.pinned = 0;
            st.pinned_ranges.clear();
        }

        let trimming = self.config.discard_sync || self.config.zoned;
        if trimming {
            self.freeze_block_group(bg);
        }
        if let Err(err) = self.remove_block_group(trans, bg) {
            if trimming {
                self.unfreeze_block_group(bg)?;
            }
            return Err(err);
        }
        if trimming {
            trans.push_deleted(Arc::clone(bg));
        }
        Ok(())
    }

    /// Remove a read-only, empty group: persisted items, registry, space
    /// info, free-space index, then device extents.
    pub fn remove_block_group(&self, trans: &TransHandle, bg: &Arc<BlockGroup>) -> Result<()> {
        let start = bg.start();
        {
            let mut st = bg.lock();
            if st.used > 0 || st.reserved > 0 || st.pinned > 0 {
                return Err(FfsError::Busy(format!(
                    "block group {start} still holds {} used, {} reserved, {} pinned bytes",
                    st.used, st.reserved, st.pinned
                )));
            }
            let GroupPhase::ReadOnly(n) = st.phase else {
                return Err(FfsError::InvalidTransition {
                    start,
                    from: st.phase.name(),
                    to: GroupPhase::Removing(1).name(),
                });
            };
            st.transition(start, GroupPhase::Removing(n))?;
        }

        // A running population must not outlive the group.
        let ctl = match &bg.lock().caching {
            CachingState::Started(ctl) => Some(Arc::clone(ctl)),
            _ => None,
        };
        if let Some(ctl) = ctl {
            ctl.wait_done();
        }

        if let Err(err) = self.delete_group_items(bg) {
            self.abort_transaction(trans, &err);
            return Err(err);
        }

        self.registry.remove(start)?;
        trans.forget_dirty(start);
        self.forget_sweep(bg);
        self.unlink_from_space_info(bg)?;

        bg.free_space().clear();
        {
            let mut st = bg.lock();
            st.dirty = false;
            st.transition(start, GroupPhase::Removed)?;
        }

        if bg.is_frozen() {
            debug!(target: "ffs::alloc::sweep", start, "device extents held until unfreeze");
        } else {
            self.release_chunk(bg)?;
        }
        self.stats.groups_removed.fetch_add(1, Ordering::Relaxed);
        info!(target: "ffs::alloc::lifecycle", start, length = bg.length(), flags = %bg.flags(), "block group removed");
        Ok(())
    }

    /// Delete the block-group item, the free-space snapshot and any
    /// free-space tree items of `bg`.
    fn delete_group_items(&self, bg: &BlockGroup) -> Result<()> {
        let store = &self.collab.store;
        store.delete_item(&BtrfsKey::block_group(bg.start(), bg.length()))?;
        self.delete_free_space_snapshot(bg)?;
        self.delete_free_space_tree(bg)
    }

    pub(crate) fn delete_free_space_tree(&self, bg: &BlockGroup) -> Result<()> {
        let store = &self.collab.store;
        let mut doomed = Vec::new();
        let mut key = BtrfsKey::new(bg.start(), 0, 0);
        while let Some((found, _)) = store.next_item(&key)? {
            if found.objectid >= bg.end() {
                break;
            }
            if matches!(found.item_type, FREE_SPACE_INFO_KEY | FREE_SPACE_EXTENT_KEY) {
                doomed.push(found);
            }
            let Some(next) = found.successor() else { break };
            key = next;
        }
        for key in doomed {
            store.delete_item(&key)?;
        }
        Ok(())
    }

    /// Take `bg` out of its space info's counters and membership list.
    pub(crate) fn unlink_from_space_info(&self, bg: &BlockGroup) -> Result<()> {
        let si = bg.space_info();
        let factor = bg.flags().raid_type().factor();
        {
            let mut c = si.lock();
            let st = bg.lock();
            let mut total = c.total_bytes;
            sub_counter(&mut total, "total_bytes", bg.length())?;
            let mut disk_total = c.disk_total;
            sub_counter(&mut disk_total, "disk_total", bg.length() * factor)?;
            // A group that never went read-only only parked its superblock
            // copies.
            let parked = if st.phase.ro_count() > 0 {
                bg.length().saturating_sub(st.zone_unusable)
            } else {
                bg.bytes_super()
            };
            let mut readonly = c.bytes_readonly;
            sub_counter(&mut readonly, "bytes_readonly", parked)?;
            let mut zone_unusable = c.bytes_zone_unusable;
            sub_counter(&mut zone_unusable, "bytes_zone_unusable", st.zone_unusable)?;
            c.total_bytes = total;
            c.disk_total = disk_total;
            c.bytes_readonly = readonly;
            c.bytes_zone_unusable = zone_unusable;
            c.ro_groups.retain(|&s| s != bg.start());
        }
        let emptied = SpaceInfo::unlink_group(&mut si.groups_write(), bg);
        if emptied {
            self.profiles.clear_avail_alloc_bits(bg.flags());
        }
        Ok(())
    }

    /// Hand the device extents of a removed group back to the chunk layer.
    pub(crate) fn release_chunk(&self, bg: &BlockGroup) -> Result<()> {
        self.collab.chunks.free_device_extents(bg.placement())
    }

    // ── Reclaim ────────────────────────────────────────────────────────────

    /// Relocate queued groups whose usage is still below the threshold,
    /// emptiest first. A failed relocation undoes the read-only mark and
    /// requeues the group.
    pub fn reclaim_bgs(&self) {
        if self.is_closing() {
            return;
        }
        let _reclaim = self.reclaim_lock.lock();

        let mut candidates = Vec::new();
        while let Some(bg) = self.pop_list(true) {
            candidates.push(bg);
        }
        candidates.sort_by_key(|bg| bg.used());

        let mut retry = Vec::new();
        let mut pending = candidates.into_iter();
        for bg in pending.by_ref() {
            if self.is_closing() {
                retry.push(bg);
                break;
            }
            match self.reclaim_one(&bg) {
                Ok(()) => {}
                Err(err) if err.is_transient() => retry.push(bg),
                Err(err) => {
                    warn!(target: "ffs::alloc::sweep", start = bg.start(), error = %err, "block group reclaim failed");
                    retry.push(bg);
                }
            }
        }
        retry.extend(pending);
        for bg in retry {
            self.mark_to_reclaim(&bg);
        }
    }

    fn reclaim_one(&self, bg: &Arc<BlockGroup>) -> Result<()> {
        {
            let st = bg.lock();
            if st.phase != GroupPhase::Active {
                debug!(target: "ffs::alloc::sweep", start = bg.start(), phase = st.phase.name(), "reclaim candidate not active, dropping");
                return Ok(());
            }
            if st.reserved > 0 || st.pinned > 0 {
                return Err(FfsError::Busy(format!(
                    "reclaim candidate {} has reserved or pinned bytes",
                    bg.start()
                )));
            }
            if st.used == 0 {
                drop(st);
                self.mark_unused(bg);
                return Ok(());
            }
            // Usage may have grown back since the group was queued.
            let threshold = bg.space_info().reclaim_threshold();
            if threshold == 0 || st.used >= mult_perc(bg.length(), u64::from(threshold)) {
                return Ok(());
            }
        }

        self.inc_block_group_ro(bg, false)?;
        info!(target: "ffs::alloc::lifecycle", start = bg.start(), used = bg.used(), "reclaiming block group");

        if let Err(err) = self.collab.relocator.relocate(self, bg) {
            self.clear_readonly(bg)?;
            self.stats.relocation_failures.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        self.delete_readonly_group(bg)?;
        self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
