#![forbid(unsafe_code)]
//! Per-group free-space index.
//!
//! The allocator only relies on the narrow [`FreeSpaceIndex`] contract; the
//! default [`RangeFreeSpace`] keeps free extents in an ordered map keyed by
//! start offset, merging neighbours on insert and splitting on carve-out.

use ffs_error::{FfsError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;

/// Set of unallocated sub-ranges of one block group, in absolute logical
/// bytes. Implementations are internally synchronised.
pub trait FreeSpaceIndex: Send + Sync + fmt::Debug {
    /// Mark `[start, start + len)` free. Overlap with an already-free range
    /// is a double free and is reported as corruption.
    fn add_free(&self, start: u64, len: u64) -> Result<()>;

    /// Carve `[start, start + len)` out of the free set. Fails with `Busy`
    /// unless the whole range is currently free.
    fn remove_free(&self, start: u64, len: u64) -> Result<()>;

    /// First free offset at or after `hint` with `len` contiguous bytes,
    /// wrapping to the beginning of the group.
    fn find_free(&self, len: u64, hint: u64) -> Option<u64>;

    /// `[start, start + len)` is entirely free.
    fn is_free(&self, start: u64, len: u64) -> bool;

    fn free_bytes(&self) -> u64;

    fn extent_count(&self) -> usize;

    /// Largest free extent, used as a clustering hint.
    fn largest_free(&self) -> Option<(u64, u64)>;

    /// Snapshot of all free ranges as `(start, len)` in ascending order.
    fn ranges(&self) -> Vec<(u64, u64)>;

    fn clear(&self);
}

/// Builds the index for a new group covering `[start, start + length)`.
pub type FreeSpaceFactory = fn(u64, u64) -> Box<dyn FreeSpaceIndex>;

#[derive(Debug, Default)]
struct RangeState {
    /// start -> len, never overlapping, never adjacent.
    ranges: BTreeMap<u64, u64>,
    free: u64,
}

/// Ordered-map implementation of [`FreeSpaceIndex`].
#[derive(Default)]
pub struct RangeFreeSpace {
    state: Mutex<RangeState>,
}

impl RangeFreeSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// [`FreeSpaceFactory`] producing an empty `RangeFreeSpace`.
    #[must_use]
    pub fn boxed(_start: u64, _length: u64) -> Box<dyn FreeSpaceIndex> {
        Box::new(Self::new())
    }
}

impl fmt::Debug for RangeFreeSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RangeFreeSpace")
            .field("extents", &state.ranges.len())
            .field("free", &state.free)
            .finish()
    }
}

impl FreeSpaceIndex for RangeFreeSpace {
    fn add_free(&self, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = start.checked_add(len).ok_or_else(|| FfsError::Corruption {
            start,
            detail: format!("free range overflows: len {len}"),
        })?;

        let mut state = self.state.lock();
        let mut new_start = start;
        let mut new_end = end;

        if let Some((&prev_start, &prev_len)) = state.ranges.range(..=start).next_back() {
            let prev_end = prev_start + prev_len;
            if prev_end > start {
                return Err(FfsError::Corruption {
                    start,
                    detail: format!(
                        "double free: [{start}, {end}) overlaps free [{prev_start}, {prev_end})"
                    ),
                });
            }
            if prev_end == start {
                new_start = prev_start;
            }
        }
        if let Some((&next_start, &next_len)) = state.ranges.range(start..).next() {
            if next_start < end {
                return Err(FfsError::Corruption {
                    start,
                    detail: format!(
                        "double free: [{start}, {end}) overlaps free [{next_start}, {})",
                        next_start + next_len
                    ),
                });
            }
            if next_start == end {
                state.ranges.remove(&next_start);
                new_end = end + next_len;
            }
        }
        if new_start != start {
            state.ranges.remove(&new_start);
        }
        state.ranges.insert(new_start, new_end - new_start);
        state.free += len;
        Ok(())
    }

    fn remove_free(&self, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = start
            .checked_add(len)
            .ok_or_else(|| FfsError::Busy(format!("range at {start} overflows")))?;

        let mut state = self.state.lock();
        let Some((&ext_start, &ext_len)) = state.ranges.range(..=start).next_back() else {
            return Err(FfsError::Busy(format!("[{start}, {end}) is not free")));
        };
        let ext_end = ext_start + ext_len;
        if ext_end < end {
            return Err(FfsError::Busy(format!("[{start}, {end}) is not free")));
        }

        state.ranges.remove(&ext_start);
        if ext_start < start {
            state.ranges.insert(ext_start, start - ext_start);
        }
        if end < ext_end {
            state.ranges.insert(end, ext_end - end);
        }
        state.free -= len;
        Ok(())
    }

    fn find_free(&self, len: u64, hint: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        let state = self.state.lock();
        // An extent starting before the hint may still cover it.
        if let Some((&s, &l)) = state.ranges.range(..hint).next_back() {
            if s + l >= hint.saturating_add(len) {
                return Some(hint);
            }
        }
        state
            .ranges
            .range(hint..)
            .chain(state.ranges.range(..hint))
            .find(|(_, l)| **l >= len)
            .map(|(s, _)| *s)
    }

    fn is_free(&self, start: u64, len: u64) -> bool {
        let state = self.state.lock();
        state
            .ranges
            .range(..=start)
            .next_back()
            .is_some_and(|(&s, &l)| s + l >= start.saturating_add(len))
    }

    fn free_bytes(&self) -> u64 {
        self.state.lock().free
    }

    fn extent_count(&self) -> usize {
        self.state.lock().ranges.len()
    }

    fn largest_free(&self) -> Option<(u64, u64)> {
        let state = self.state.lock();
        state
            .ranges
            .iter()
            .max_by_key(|(s, l)| (**l, std::cmp::Reverse(**s)))
            .map(|(s, l)| (*s, *l))
    }

    fn ranges(&self) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .ranges
            .iter()
            .map(|(s, l)| (*s, *l))
            .collect()
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.ranges.clear();
        state.free = 0;
    }
}
