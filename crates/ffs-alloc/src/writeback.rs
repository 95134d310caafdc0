#![forbid(unsafe_code)]
//! Commit-time writeback of block-group items and free-space state.
//!
//! ## Design
//!
//! The transaction manager calls [`BlockGroupManager::run_commit_hooks`]
//! before persisting and [`BlockGroupManager::finish_transaction`] once the
//! commit is durable. While dirty groups are written out the transaction
//! carries a flag that `mark_readonly` waits on, so a group never changes
//! read-only state halfway through its writeout.
//!
//! Only dirty groups are written. A clean group's snapshot and tree items
//! still describe it, however old the commit that wrote them. A dirty
//! group that is not fully cached cannot be described, so whatever it had
//! persisted is deleted and the next mount scans it.

use crate::block_group::{BlockGroup, CachingState, GroupPhase};
use crate::manager::BlockGroupManager;
use crate::transaction::TransHandle;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{
    BlockGroupItem, BtrfsKey, FIRST_CHUNK_TREE_OBJECTID, FreeSpaceEntry, FreeSpaceInfo,
    FreeSpaceSnapshot,
};
use tracing::{debug, trace, warn};

impl BlockGroupManager {
    /// Everything the block-group layer persists for a committing
    /// transaction.
    pub fn run_commit_hooks(&self, trans: &TransHandle) -> Result<()> {
        self.create_pending_block_groups(trans)?;
        {
            let _ro = self.ro_block_group_mutex.lock();
            trans.set_dirty_bg_run(true);
        }
        let result = self.write_dirty_block_groups(trans);
        trans.set_dirty_bg_run(false);
        result
    }

    /// Persist dirty group items and refresh their free-space state.
    pub fn write_dirty_block_groups(&self, trans: &TransHandle) -> Result<()> {
        let dirty = trans.take_dirty();
        for bg in &dirty {
            if bg.phase() == GroupPhase::Removed {
                continue;
            }
            if let Err(err) = self.write_dirty_group(trans, bg) {
                self.abort_transaction(trans, &err);
                return Err(err);
            }
            bg.lock().dirty = false;
        }
        debug!(target: "ffs::alloc::lifecycle", txn = trans.id().0, dirty = dirty.len(), "dirty block groups written");
        trans.check_aborted()
    }

    fn write_dirty_group(&self, trans: &TransHandle, bg: &BlockGroup) -> Result<()> {
        self.update_block_group_item(bg)?;
        let ranges = {
            let st = bg.lock();
            matches!(st.caching, CachingState::Finished).then(|| merged_free_ranges(bg, trans))
        };
        if self.config.free_space_tree {
            match &ranges {
                Some(ranges) => self.write_free_space_tree(bg, ranges)?,
                None => self.delete_free_space_tree(bg)?,
            }
        }
        if self.config.space_cache {
            match ranges {
                Some(ranges) => self.write_free_space_snapshot(trans, bg, ranges)?,
                None => self.delete_free_space_snapshot(bg)?,
            }
        }
        Ok(())
    }

    /// Update the persisted item if `used` moved since the last commit. On
    /// failure the committed value is left as it was.
    fn update_block_group_item(&self, bg: &BlockGroup) -> Result<()> {
        let (used, previous) = {
            let mut st = bg.lock();
            if st.used == st.commit_used {
                return Ok(());
            }
            let previous = st.commit_used;
            st.commit_used = st.used;
            (st.used, previous)
        };
        let item = BlockGroupItem {
            used,
            chunk_objectid: FIRST_CHUNK_TREE_OBJECTID,
            flags: bg.flags().bits(),
        };
        let key = BtrfsKey::block_group(bg.start(), bg.length());
        if let Err(err) = self.collab.store.update_item(&key, item.to_bytes()) {
            bg.lock().commit_used = previous;
            return Err(err);
        }
        trace!(target: "ffs::alloc::accounting", start = bg.start(), used, "block group item updated");
        Ok(())
    }

    /// Write the snapshot of a fully cached group, stamped with the
    /// committing transaction.
    fn write_free_space_snapshot(
        &self,
        trans: &TransHandle,
        bg: &BlockGroup,
        ranges: Vec<(u64, u64)>,
    ) -> Result<()> {
        let snapshot = FreeSpaceSnapshot {
            generation: trans.id().0,
            entries: ranges
                .into_iter()
                .map(|(offset, bytes)| FreeSpaceEntry { offset, bytes })
                .collect(),
        };
        let key = BtrfsKey::free_space_header(bg.start());
        let store = &self.collab.store;
        match store.update_item(&key, snapshot.to_bytes()) {
            Ok(()) => Ok(()),
            Err(FfsError::NotFound(_)) => store.insert_item(key, snapshot.to_bytes()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn delete_free_space_snapshot(&self, bg: &BlockGroup) -> Result<()> {
        match self
            .collab
            .store
            .delete_item(&BtrfsKey::free_space_header(bg.start()))
        {
            Ok(()) | Err(FfsError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Replace the free-space tree items of `bg` with `ranges`.
    fn write_free_space_tree(&self, bg: &BlockGroup, ranges: &[(u64, u64)]) -> Result<()> {
        self.delete_free_space_tree(bg)?;
        let store = &self.collab.store;
        let count = u32::try_from(ranges.len()).map_err(|_| FfsError::Format(format!(
            "block group {} has too many free extents for the tree",
            bg.start()
        )))?;
        let info = FreeSpaceInfo {
            extent_count: count,
            flags: 0,
        };
        store.insert_item(BtrfsKey::free_space_info(bg.start(), bg.length()), info.to_bytes())?;
        for &(start, len) in ranges {
            store.insert_item(BtrfsKey::free_space_extent(start, len), Vec::new())?;
        }
        Ok(())
    }

    /// Post-commit work: return pinned bytes and finish deferred removals.
    pub fn finish_transaction(&self, trans: &TransHandle) -> Result<()> {
        self.unpin_extents(trans)?;
        for bg in trans.take_deleted() {
            if self.config.discard_sync {
                if let Err(err) = self.collab.discard.trim_removed(&bg) {
                    warn!(target: "ffs::alloc::lifecycle", start = bg.start(), error = %err, "trim of removed block group failed");
                }
            }
            self.unfreeze_block_group(&bg)?;
        }
        Ok(())
    }
}

/// Index ranges plus ranges pinned in `trans`, sorted and coalesced. Pinned
/// ranges are free once the commit lands.
fn merged_free_ranges(bg: &BlockGroup, trans: &TransHandle) -> Vec<(u64, u64)> {
    let mut ranges = bg.free_space().ranges();
    ranges.extend(trans.pinned_in(bg.start(), bg.end()));
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, len) in ranges {
        match merged.last_mut() {
            Some((s, l)) if *s + *l == start => *l += len,
            _ => merged.push((start, len)),
        }
    }
    merged
}
