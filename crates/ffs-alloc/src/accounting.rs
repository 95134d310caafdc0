#![forbid(unsafe_code)]
//! Per-extent accounting: reservations, allocation, frees and unpinning.
//!
//! Every counter move here takes the space-info lock first and the group
//! lock second, and checks for underflow before mutating anything so a
//! failed update leaves both sides untouched.

use crate::block_group::{BlockGroup, CachingState, GroupPhase, ListMembership, SizeClass};
use crate::manager::BlockGroupManager;
use crate::space_info::sub_counter;
use crate::sweep::should_reclaim;
use crate::transaction::TransHandle;
use ffs_error::{FfsError, Result};
use std::sync::Arc;
use tracing::trace;

/// Options for [`BlockGroupManager::reserve_bytes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReserveOptions {
    /// Speculative bytes (`bytes_may_use`) this reservation converts.
    pub ram_bytes: u64,
    pub delalloc: bool,
    /// Size class of the requesting allocation.
    pub size_class: SizeClass,
    /// Accept a group of a different size class.
    pub force_wrong_size_class: bool,
}

impl BlockGroupManager {
    /// Account `num_bytes` as reserved in `bg`.
    ///
    /// Fails with `Busy` if the group went read-only or belongs to another
    /// size class; the caller should try another group. An unclassified
    /// group adopts the requester's class.
    pub fn reserve_bytes(&self, bg: &BlockGroup, num_bytes: u64, opts: ReserveOptions) -> Result<()> {
        let si = bg.space_info();
        let mut c = si.lock();
        let mut st = bg.lock();

        if st.is_readonly() || matches!(st.phase, GroupPhase::Removed) {
            return Err(FfsError::Busy(format!("block group {} is read-only", bg.start())));
        }
        if opts.size_class != SizeClass::None {
            if st.size_class == SizeClass::None {
                st.size_class = opts.size_class;
            } else if st.size_class != opts.size_class && !opts.force_wrong_size_class {
                return Err(FfsError::Busy(format!(
                    "block group {} holds {:?} extents",
                    bg.start(),
                    st.size_class
                )));
            }
        }
        if opts.ram_bytes > 0 {
            sub_counter(&mut c.bytes_may_use, "bytes_may_use", opts.ram_bytes)?;
        }

        st.reserved += num_bytes;
        c.bytes_reserved += num_bytes;
        if opts.delalloc {
            st.delalloc_bytes += num_bytes;
        }
        trace!(target: "ffs::alloc::accounting", start = bg.start(), num_bytes, "reserved bytes");
        Ok(())
    }

    /// Undo [`reserve_bytes`](Self::reserve_bytes). Bytes released from a
    /// read-only group count as read-only.
    pub fn free_reserved_bytes(&self, bg: &BlockGroup, num_bytes: u64, delalloc: bool) -> Result<()> {
        let si = bg.space_info();
        let mut c = si.lock();
        let mut st = bg.lock();

        let mut g_reserved = st.reserved;
        sub_counter(&mut g_reserved, "reserved", num_bytes)?;
        let mut s_reserved = c.bytes_reserved;
        sub_counter(&mut s_reserved, "bytes_reserved", num_bytes)?;
        if delalloc {
            sub_counter(&mut st.delalloc_bytes, "delalloc_bytes", num_bytes)?;
        }
        st.reserved = g_reserved;
        c.bytes_reserved = s_reserved;
        if st.is_readonly() {
            c.bytes_readonly += num_bytes;
        }
        Ok(())
    }

    /// Carve `[bytenr, bytenr + len)` out of `bg`'s index and reserve it.
    ///
    /// Exactly one of two racing callers for the same range succeeds; the
    /// other sees `Busy`.
    pub fn reserve_extent(
        &self,
        bg: &BlockGroup,
        bytenr: u64,
        len: u64,
        opts: ReserveOptions,
    ) -> Result<()> {
        if bytenr < bg.start() || bytenr.saturating_add(len) > bg.end() {
            return Err(FfsError::NotFound(format!(
                "[{bytenr}, +{len}) is outside block group {}",
                bg.start()
            )));
        }
        bg.free_space().remove_free(bytenr, len)?;
        if let Err(err) = self.reserve_bytes(bg, len, opts) {
            bg.free_space().add_free(bytenr, len)?;
            return Err(err);
        }
        Ok(())
    }

    /// First-fit search in `bg`, then [`reserve_extent`](Self::reserve_extent).
    /// Returns the reserved start.
    pub fn find_and_reserve(
        self: &Arc<Self>,
        bg: &Arc<BlockGroup>,
        len: u64,
        opts: ReserveOptions,
    ) -> Result<u64> {
        self.ensure_cached(bg, true)?;
        loop {
            let Some(at) = bg.free_space().find_free(len, bg.start()) else {
                return Err(FfsError::NoSpace);
            };
            if bg.free_space().remove_free(at, len).is_err() {
                // Another reserver took the range first.
                continue;
            }
            if let Err(err) = self.reserve_bytes(bg, len, opts) {
                bg.free_space().add_free(at, len)?;
                return Err(err);
            }
            return Ok(at);
        }
    }

    /// Drop a reservation without allocating, returning the range to the
    /// index.
    pub fn release_extent(&self, bg: &BlockGroup, bytenr: u64, len: u64, delalloc: bool) -> Result<()> {
        self.free_reserved_bytes(bg, len, delalloc)?;
        bg.free_space().add_free(bytenr, len)
    }

    /// Apply one completed extent allocation (`alloc`) or free to the
    /// counters of every group the range touches.
    ///
    /// Allocation converts reserved bytes into used bytes. A free turns used
    /// bytes into pinned bytes, recorded in `trans` until it commits. A
    /// group that drops to zero is queued for unused deletion (through the
    /// discard scheduler first with `discard_async`); one that crosses the
    /// reclaim threshold downward is queued for reclaim.
    pub fn update_on_allocation(
        &self,
        trans: &TransHandle,
        bytenr: u64,
        num_bytes: u64,
        alloc: bool,
    ) -> Result<()> {
        let mut bytenr = bytenr;
        let mut left = num_bytes;
        while left > 0 {
            let bg = self.get_block_group(bytenr)?;
            let n = left.min(bg.end() - bytenr);
            let factor = bg.flags().raid_type().factor();
            let si = Arc::clone(bg.space_info());

            let (now_unused, reclaim) = {
                let mut c = si.lock();
                let mut st = bg.lock();
                let (mut now_unused, mut reclaim) = (false, false);
                if alloc {
                    let mut g_reserved = st.reserved;
                    sub_counter(&mut g_reserved, "reserved", n)?;
                    let mut s_reserved = c.bytes_reserved;
                    sub_counter(&mut s_reserved, "bytes_reserved", n)?;
                    st.reserved = g_reserved;
                    c.bytes_reserved = s_reserved;
                    st.used += n;
                    c.bytes_used += n;
                    c.disk_used += n * factor;
                } else {
                    let end = bytenr + n;
                    if let Some((&s, &l)) = st.pinned_ranges.range(..end).next_back() {
                        if s + l > bytenr {
                            return Err(FfsError::Corruption {
                                start: bytenr,
                                detail: format!(
                                    "[{bytenr}, {end}) freed while [{s}, {}) is still pinned",
                                    s + l
                                ),
                            });
                        }
                    }
                    let mut g_used = st.used;
                    sub_counter(&mut g_used, "used", n)?;
                    let mut s_used = c.bytes_used;
                    sub_counter(&mut s_used, "bytes_used", n)?;
                    let mut s_disk = c.disk_used;
                    sub_counter(&mut s_disk, "disk_used", n * factor)?;
                    trans.pin(bytenr, n)?;
                    let old_used = st.used;
                    st.used = g_used;
                    c.bytes_used = s_used;
                    c.disk_used = s_disk;
                    st.pinned += n;
                    st.pinned_ranges.insert(bytenr, n);
                    c.bytes_pinned += n;

                    if st.used == 0 {
                        now_unused = true;
                    } else if !self.config.zoned && st.list == ListMembership::None {
                        reclaim = should_reclaim(si.reclaim_threshold(), bg.length(), old_used, st.used);
                    }
                }
                st.changed_since_load = true;
                if !st.dirty {
                    st.dirty = true;
                    trans.push_dirty(Arc::clone(&bg));
                }
                (now_unused, reclaim)
            };

            trace!(
                target: "ffs::alloc::accounting",
                start = bg.start(),
                bytenr,
                num_bytes = n,
                alloc,
                "block group updated"
            );

            if now_unused {
                // A queued discard marks the group unused once it is trimmed.
                if self.config.discard_async {
                    self.collab.discard.queue_for_discard(&bg);
                }
                if !self.collab.discard.is_queued(&bg) {
                    self.mark_unused(&bg);
                }
            } else if reclaim {
                self.mark_to_reclaim(&bg);
            }

            bytenr += n;
            left -= n;
        }
        Ok(())
    }

    /// Return the extents pinned by `trans` to circulation once it has
    /// committed.
    pub(crate) fn unpin_extents(&self, trans: &TransHandle) -> Result<()> {
        for (start, len) in trans.take_pinned() {
            self.unpin_range(start, len)?;
        }
        Ok(())
    }

    /// Unpin one range recorded by a free. Frees record one range per
    /// group, so the range never crosses a group boundary.
    ///
    /// While the group is being cached, the part the scan has already passed
    /// goes straight to the index and the rest is handed to the scan, which
    /// adds it once its cursor moves past.
    fn unpin_range(&self, start: u64, len: u64) -> Result<()> {
        let Some(bg) = self.registry.lookup_containing(start) else {
            // The group was deleted along with its pinned records.
            return Ok(());
        };
        let si = bg.space_info();
        let mut c = si.lock();
        let mut st = bg.lock();
        if st.pinned_ranges.get(&start) != Some(&len) {
            return Err(FfsError::Corruption {
                start,
                detail: format!("unpinning [{start}, {}) that the group never pinned", start + len),
            });
        }

        let mut g_pinned = st.pinned;
        sub_counter(&mut g_pinned, "pinned", len)?;
        let mut s_pinned = c.bytes_pinned;
        sub_counter(&mut s_pinned, "bytes_pinned", len)?;
        st.pinned = g_pinned;
        c.bytes_pinned = s_pinned;
        st.pinned_ranges.remove(&start);

        if st.is_readonly() {
            c.bytes_readonly += len;
        } else if self.config.zoned {
            st.zone_unusable += len;
            c.bytes_zone_unusable += len;
        }
        // Read-only groups keep their index so clearing ro needs no rescan.
        if !self.config.zoned {
            let end = start + len;
            match &st.caching {
                CachingState::Finished => bg.free_space().add_free(start, len)?,
                CachingState::Started(ctl) => {
                    let split = ctl.cursor().clamp(start, end);
                    if split > start {
                        bg.free_space().add_free(start, split - start)?;
                    }
                    if split < end {
                        ctl.defer(split, end - split);
                    }
                }
                // The scan will find the range free.
                CachingState::NotCached | CachingState::Error => {}
            }
        }
        c.full = false;
        Ok(())
    }

    // ── Swap extents and freezing ──────────────────────────────────────────

    /// Pin `bg` as backing an active swap file. Fails on read-only groups.
    pub fn inc_swap_extents(&self, bg: &BlockGroup) -> Result<()> {
        let mut st = bg.lock();
        if st.is_readonly() {
            return Err(FfsError::Busy(format!("block group {} is read-only", bg.start())));
        }
        st.swap_extents += 1;
        Ok(())
    }

    pub fn dec_swap_extents(&self, bg: &BlockGroup) -> Result<()> {
        let mut st = bg.lock();
        st.swap_extents = st.swap_extents.checked_sub(1).ok_or(FfsError::AccountingUnderflow {
            counter: "swap_extents",
            current: 0,
            delta: 1,
        })?;
        Ok(())
    }

    /// Hold `bg`'s chunk mapping alive across removal.
    pub fn freeze_block_group(&self, bg: &BlockGroup) {
        bg.freeze();
    }

    /// Drop one freeze. The last unfreeze of a removed group releases its
    /// device extents.
    pub fn unfreeze_block_group(&self, bg: &BlockGroup) -> Result<()> {
        if !bg.is_frozen() {
            return Err(FfsError::AccountingUnderflow {
                counter: "frozen",
                current: 0,
                delta: 1,
            });
        }
        if bg.unfreeze() && bg.phase() == GroupPhase::Removed {
            self.release_chunk(bg)?;
        }
        Ok(())
    }
}
