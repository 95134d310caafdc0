#![forbid(unsafe_code)]
//! Free-space caching engine.
//!
//! Populates a group's [`FreeSpaceIndex`](crate::FreeSpaceIndex) the first
//! time its free space is needed.
//!
//! ## Design
//!
//! `ensure_cached` flips the group's caching state from `NotCached` to
//! `Started` under the group lock, which makes the caller that wins the
//! flip the only one that creates a [`CachingControl`] and submits work.
//! Everyone else attaches to the control stored in the state.
//!
//! Population prefers, in order:
//!
//! 1. the persisted free-space snapshot, if it was committed (its
//!    generation is not past the last committed one) and its byte count
//!    agrees with the group counters;
//! 2. free-space tree items, when the tree is enabled and has an info item
//!    for the group;
//! 3. a scan of extent records, where every gap is free space.
//!
//! The scan signals progress every `caching_wake_bytes` so waiters that
//! only need a little space can proceed early. The control's cursor marks
//! how far the scan has got. Each scan step adds its gap and moves the
//! cursor under the group lock, leaving out ranges the group still has
//! pinned; unpin reads the cursor under the same lock. Ranges unpinned
//! below the cursor go straight back into the index, ranges above it are
//! deferred to the control and added by the scan once it passes them.

use crate::block_group::{BlockGroup, CachingState, GroupState, SizeClass};
use crate::free_space::FreeSpaceIndex;
use crate::manager::BlockGroupManager;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{
    BtrfsKey, EXTENT_ITEM_KEY, FREE_SPACE_EXTENT_KEY, FreeSpaceInfo, FreeSpaceSnapshot,
    METADATA_ITEM_KEY,
};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

// ── CachingControl ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct CtlState {
    /// Incremented on every progress signal.
    progress: u64,
    /// Absolute address below which the index is populated.
    cursor: u64,
    done: bool,
    /// Unpinned ranges at or above the cursor, waiting for the scan.
    deferred: Vec<(u64, u64)>,
}

/// One in-flight population of a group's free-space index.
pub struct CachingControl {
    start: u64,
    group: Weak<BlockGroup>,
    state: Mutex<CtlState>,
    cond: Condvar,
}

impl CachingControl {
    pub(crate) fn new(bg: &Arc<BlockGroup>) -> Arc<Self> {
        Arc::new(Self {
            start: bg.start(),
            group: Arc::downgrade(bg),
            state: Mutex::new(CtlState {
                progress: 0,
                cursor: bg.start(),
                done: false,
                deferred: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Start of the group being cached.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The group, if it is still alive.
    #[must_use]
    pub fn group(&self) -> Option<Arc<BlockGroup>> {
        self.group.upgrade()
    }

    #[must_use]
    pub fn progress(&self) -> u64 {
        self.state.lock().progress
    }

    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Move the cursor without waking anyone.
    pub(crate) fn advance(&self, cursor: u64) {
        let mut st = self.state.lock();
        st.cursor = st.cursor.max(cursor);
    }

    pub(crate) fn signal_progress(&self, cursor: u64) {
        let mut st = self.state.lock();
        st.progress += 1;
        st.cursor = st.cursor.max(cursor);
        self.cond.notify_all();
    }

    /// Hand `[start, start + len)` to the scan. Called under the group lock.
    pub(crate) fn defer(&self, start: u64, len: u64) {
        self.state.lock().deferred.push((start, len));
    }

    /// Forget deferred ranges inside `[start, end)`; the scan is adding
    /// that gap whole.
    fn forget_deferred_in(&self, start: u64, end: u64) {
        self.state
            .lock()
            .deferred
            .retain(|&(s, len)| s < start || s + len > end);
    }

    /// Deferred ranges the cursor has passed.
    fn take_passed(&self) -> Vec<(u64, u64)> {
        let mut st = self.state.lock();
        let cursor = st.cursor;
        let (passed, waiting) = std::mem::take(&mut st.deferred)
            .into_iter()
            .partition(|&(start, len)| start + len <= cursor);
        st.deferred = waiting;
        passed
    }

    pub(crate) fn finish(&self) {
        let mut st = self.state.lock();
        st.done = true;
        self.cond.notify_all();
    }

    /// Block until population reaches a terminal state.
    pub fn wait_done(&self) {
        let mut st = self.state.lock();
        while !st.done {
            self.cond.wait(&mut st);
        }
    }

    /// Block until `free_space` holds at least `num_bytes` free bytes or
    /// population finishes. Re-checks after every wake-up.
    pub fn wait_progress(&self, free_space: &dyn FreeSpaceIndex, num_bytes: u64) {
        let mut st = self.state.lock();
        loop {
            if st.done || free_space.free_bytes() >= num_bytes {
                return;
            }
            self.cond.wait(&mut st);
        }
    }
}

impl fmt::Debug for CachingControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("CachingControl")
            .field("start", &self.start)
            .field("progress", &st.progress)
            .field("cursor", &st.cursor)
            .field("done", &st.done)
            .field("deferred", &st.deferred.len())
            .finish()
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

impl BlockGroupManager {
    /// Make sure `bg`'s free-space index is (being) populated.
    ///
    /// With `wait` set, blocks until caching is terminal and fails with
    /// `CachingFailed` if it ended in error. Without it, returns as soon as
    /// work is scheduled; the caller must re-check the state before
    /// trusting the index.
    pub fn ensure_cached(self: &Arc<Self>, bg: &Arc<BlockGroup>, wait: bool) -> Result<()> {
        let (ctl, fresh) = {
            let mut st = bg.lock();
            match &st.caching {
                CachingState::Finished => return Ok(()),
                CachingState::Error => return Err(caching_failed(bg.start())),
                CachingState::Started(ctl) => (Arc::clone(ctl), false),
                CachingState::NotCached => {
                    let ctl = CachingControl::new(bg);
                    st.caching = CachingState::Started(Arc::clone(&ctl));
                    (ctl, true)
                }
            }
        };

        if fresh {
            self.caching_controls.lock().push(Arc::clone(&ctl));
            self.stats.caching_runs.fetch_add(1, Ordering::Relaxed);
            debug!(target: "ffs::alloc::caching", start = bg.start(), "caching started");

            let mgr = Arc::clone(self);
            let job_bg = Arc::clone(bg);
            let job_ctl = Arc::clone(&ctl);
            let submitted = self.collab.work_queue.submit(Box::new(move || {
                mgr.caching_work(&job_bg, &job_ctl);
            }));
            if let Err(err) = submitted {
                self.finish_caching(bg, &ctl, Err(err));
            }
        }

        if !wait {
            return Ok(());
        }
        ctl.wait_done();
        match bg.lock().caching {
            CachingState::Error => Err(caching_failed(bg.start())),
            _ => Ok(()),
        }
    }

    /// Block until `bg` has at least `num_bytes` free or caching is done.
    pub fn wait_for_progress(self: &Arc<Self>, bg: &Arc<BlockGroup>, num_bytes: u64) -> Result<()> {
        self.ensure_cached(bg, false)?;
        let ctl = match &bg.lock().caching {
            CachingState::Started(ctl) => Some(Arc::clone(ctl)),
            CachingState::Error => return Err(caching_failed(bg.start())),
            CachingState::NotCached | CachingState::Finished => None,
        };
        if let Some(ctl) = ctl {
            ctl.wait_progress(bg.free_space(), num_bytes);
        }
        match bg.lock().caching {
            CachingState::Error => Err(caching_failed(bg.start())),
            _ => Ok(()),
        }
    }

    fn caching_work(&self, bg: &Arc<BlockGroup>, ctl: &Arc<CachingControl>) {
        let result = self.populate_free_space(bg, ctl);
        self.finish_caching(bg, ctl, result);
    }

    fn finish_caching(&self, bg: &BlockGroup, ctl: &Arc<CachingControl>, result: Result<()>) {
        {
            let mut st = bg.lock();
            match &result {
                Ok(()) => st.caching = CachingState::Finished,
                Err(err) => {
                    bg.free_space().clear();
                    st.caching = CachingState::Error;
                    error!(
                        target: "ffs::alloc::caching",
                        start = bg.start(),
                        error = %err,
                        "free space caching failed"
                    );
                }
            }
        }
        if result.is_err() {
            self.stats.caching_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.caching_controls.lock().retain(|c| !Arc::ptr_eq(c, ctl));
        ctl.signal_progress(bg.end());
        ctl.finish();
        debug!(
            target: "ffs::alloc::caching",
            start = bg.start(),
            free = bg.free_space().free_bytes(),
            ok = result.is_ok(),
            "caching finished"
        );
    }

    fn populate_free_space(&self, bg: &BlockGroup, ctl: &CachingControl) -> Result<()> {
        if self.config.size_class_samples > 0 && bg.flags().is_data() && !self.config.zoned {
            self.sample_size_class(bg)?;
        }
        if self.config.space_cache && self.load_free_space_snapshot(bg, ctl)? {
            return Ok(());
        }
        if self.config.free_space_tree && self.load_free_space_tree(bg, ctl)? {
            return Ok(());
        }
        self.scan_extents(bg, ctl)
    }

    /// Add `[start, end)` to `bg`'s index, skipping superblock ranges.
    /// Returns the bytes added.
    pub(crate) fn add_new_free_space(&self, bg: &BlockGroup, start: u64, end: u64) -> Result<u64> {
        let mut cursor = start;
        let mut added = 0;
        for &(ex_start, ex_len) in bg.excluded() {
            let ex_end = ex_start + ex_len;
            if ex_end <= cursor {
                continue;
            }
            if ex_start >= end {
                break;
            }
            if ex_start > cursor {
                bg.free_space().add_free(cursor, ex_start - cursor)?;
                added += ex_start - cursor;
            }
            cursor = cursor.max(ex_end);
        }
        if cursor < end {
            bg.free_space().add_free(cursor, end - cursor)?;
            added += end - cursor;
        }
        Ok(added)
    }

    /// Estimate the size class from evenly spaced extent records; keeps
    /// the minimum observed size.
    fn sample_size_class(&self, bg: &BlockGroup) -> Result<()> {
        let samples = u64::from(self.config.size_class_samples);
        let step = bg.length() / (samples + 1);
        let mut min_size: Option<u64> = None;
        for i in 1..=samples {
            let at = bg.start() + step * i;
            if let Some((_, len)) = self.next_extent(bg, at)? {
                min_size = Some(min_size.map_or(len, |m| m.min(len)));
            }
        }
        if let Some(size) = min_size {
            let mut st = bg.lock();
            if st.size_class == SizeClass::None {
                st.size_class = SizeClass::from_size(size);
                trace!(target: "ffs::alloc::caching", start = bg.start(), size, class = ?st.size_class, "size class sampled");
            }
        }
        Ok(())
    }

    /// First extent record at or after `from` inside `bg`, as `(start, len)`.
    fn next_extent(&self, bg: &BlockGroup, from: u64) -> Result<Option<(u64, u64)>> {
        let mut key = BtrfsKey::new(from, 0, 0);
        loop {
            let Some((found, _)) = self.collab.store.next_item(&key)? else {
                return Ok(None);
            };
            if found.objectid >= bg.end() {
                return Ok(None);
            }
            match found.item_type {
                EXTENT_ITEM_KEY => return Ok(Some((found.objectid, found.offset))),
                METADATA_ITEM_KEY => return Ok(Some((found.objectid, self.config.nodesize))),
                _ => {}
            }
            let Some(next) = found.successor() else {
                return Ok(None);
            };
            key = next;
        }
    }

    /// Trust the persisted snapshot if it is current and consistent.
    ///
    /// The counter check and the insertion happen under the group lock so
    /// no unpin can slip between them.
    fn load_free_space_snapshot(&self, bg: &BlockGroup, ctl: &CachingControl) -> Result<bool> {
        let Some(raw) = self
            .collab
            .store
            .search(&BtrfsKey::free_space_header(bg.start()))?
        else {
            return Ok(false);
        };
        let snapshot = match FreeSpaceSnapshot::parse(&raw) {
            Ok(s) => s,
            Err(err) => {
                warn!(target: "ffs::alloc::caching", start = bg.start(), error = %err, "discarding unreadable free space snapshot");
                return Ok(false);
            }
        };
        let generation = self.collab.transactions.generation();
        // Clean groups keep the snapshot of the commit that last touched them.
        if snapshot.generation > generation.0 {
            warn!(
                target: "ffs::alloc::caching",
                start = bg.start(),
                snapshot = snapshot.generation,
                committed = generation.0,
                "discarding uncommitted free space snapshot"
            );
            return Ok(false);
        }

        let st = bg.lock();
        if st.changed_since_load {
            debug!(target: "ffs::alloc::caching", start = bg.start(), "group changed since load, ignoring free space snapshot");
            return Ok(false);
        }
        let expected = bg
            .length()
            .saturating_sub(st.used)
            .saturating_sub(st.pinned)
            .saturating_sub(bg.bytes_super())
            .saturating_sub(st.zone_unusable);
        if snapshot.free_bytes() != expected {
            warn!(
                target: "ffs::alloc::caching",
                start = bg.start(),
                snapshot = snapshot.free_bytes(),
                expected,
                "free space snapshot disagrees with group counters"
            );
            return Ok(false);
        }
        for entry in &snapshot.entries {
            let in_bounds = entry.offset >= bg.start()
                && entry
                    .offset
                    .checked_add(entry.bytes)
                    .is_some_and(|end| end <= bg.end());
            if !in_bounds || bg.free_space().add_free(entry.offset, entry.bytes).is_err() {
                warn!(target: "ffs::alloc::caching", start = bg.start(), offset = entry.offset, "discarding inconsistent free space snapshot");
                bg.free_space().clear();
                return Ok(false);
            }
        }
        ctl.signal_progress(bg.end());
        drop(st);
        debug!(target: "ffs::alloc::caching", start = bg.start(), entries = snapshot.entries.len(), "loaded free space snapshot");
        Ok(true)
    }

    /// Populate from free-space tree items. Returns false if the group has
    /// no tree info item.
    fn load_free_space_tree(&self, bg: &BlockGroup, ctl: &CachingControl) -> Result<bool> {
        let store = &self.collab.store;
        let Some(raw) = store.search(&BtrfsKey::free_space_info(bg.start(), bg.length()))? else {
            return Ok(false);
        };
        let info = FreeSpaceInfo::parse(&raw).map_err(|e| FfsError::CachingFailed {
            start: bg.start(),
            detail: e.to_string(),
        })?;

        let mut extents = Vec::new();
        let mut key = BtrfsKey::new(bg.start(), 0, 0);
        while let Some((found, _)) = store.next_item(&key)? {
            if found.objectid >= bg.end() {
                break;
            }
            if found.item_type == FREE_SPACE_EXTENT_KEY {
                if found.objectid + found.offset > bg.end() {
                    return Err(FfsError::CachingFailed {
                        start: bg.start(),
                        detail: format!("free space extent {} overruns group", found.objectid),
                    });
                }
                extents.push((found.objectid, found.offset));
            }
            let Some(next) = found.successor() else { break };
            key = next;
        }
        if extents.len() != info.extent_count as usize {
            return Err(FfsError::CachingFailed {
                start: bg.start(),
                detail: format!(
                    "free space tree has {} extents, info records {}",
                    extents.len(),
                    info.extent_count
                ),
            });
        }

        let st = bg.lock();
        if st.changed_since_load {
            debug!(target: "ffs::alloc::caching", start = bg.start(), "group changed since load, ignoring free space tree");
            return Ok(false);
        }
        for (start, len) in extents {
            bg.free_space().add_free(start, len)?;
        }
        ctl.signal_progress(bg.end());
        drop(st);
        Ok(true)
    }

    /// Every gap between extent records is free, except what the group
    /// still has pinned.
    fn scan_extents(&self, bg: &BlockGroup, ctl: &CachingControl) -> Result<()> {
        let wake_every = self.config.caching_wake_bytes;
        let mut last = bg.start();
        let mut since_wake = 0_u64;
        let mut key = BtrfsKey::new(bg.start(), 0, 0);

        loop {
            if self.is_closing() {
                return Err(FfsError::Cancelled);
            }
            let Some((found, _)) = self.collab.store.next_item(&key)? else {
                break;
            };
            if found.objectid >= bg.end() {
                break;
            }
            let len = match found.item_type {
                EXTENT_ITEM_KEY => Some(found.offset),
                METADATA_ITEM_KEY => Some(self.config.nodesize),
                _ => None,
            };
            if let Some(len) = len {
                let st = bg.lock();
                if found.objectid > last {
                    ctl.forget_deferred_in(last, found.objectid);
                    since_wake += self.add_unpinned_gap(bg, &st, last, found.objectid)?;
                }
                last = last.max(found.objectid + len);
                ctl.advance(last);
                self.add_passed_deferred(bg, ctl)?;
                drop(st);
                if since_wake >= wake_every {
                    since_wake = 0;
                    ctl.signal_progress(last);
                    std::thread::yield_now();
                }
            }
            let Some(next) = found.successor() else { break };
            key = next;
        }

        let st = bg.lock();
        if last < bg.end() {
            ctl.forget_deferred_in(last, bg.end());
            self.add_unpinned_gap(bg, &st, last, bg.end())?;
        }
        ctl.advance(bg.end());
        self.add_passed_deferred(bg, ctl)
    }

    /// Add the gap `[start, end)` minus the group's pinned ranges.
    fn add_unpinned_gap(&self, bg: &BlockGroup, st: &GroupState, start: u64, end: u64) -> Result<u64> {
        let mut cursor = start;
        let mut added = 0;
        for (&pin_start, &pin_len) in st.pinned_ranges.range(..end) {
            let pin_end = pin_start + pin_len;
            if pin_end <= cursor {
                continue;
            }
            if pin_start > cursor {
                added += self.add_new_free_space(bg, cursor, pin_start)?;
            }
            cursor = pin_end;
        }
        if cursor < end {
            added += self.add_new_free_space(bg, cursor, end)?;
        }
        Ok(added)
    }

    /// Index deferred unpins the cursor has passed. These are ranges the
    /// scan saw as allocated. Called under the group lock.
    fn add_passed_deferred(&self, bg: &BlockGroup, ctl: &CachingControl) -> Result<()> {
        for (start, len) in ctl.take_passed() {
            bg.free_space().add_free(start, len)?;
        }
        Ok(())
    }
}

fn caching_failed(start: u64) -> FfsError {
    FfsError::CachingFailed {
        start,
        detail: "group is in the error caching state".to_owned(),
    }
}
