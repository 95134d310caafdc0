#![forbid(unsafe_code)]
//! Ordered index of all block groups keyed by start offset.
//!
//! The structural lock is a reader/writer lock over the whole map and is
//! held only for the duration of one lookup or edit; it is never taken
//! while a group lock is held. Lookups hand out `Arc<BlockGroup>` clones so
//! a group erased from the index stays valid for whoever still holds it.

use crate::block_group::BlockGroup;
use ffs_error::{FfsError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct BlockGroupRegistry {
    groups: RwLock<BTreeMap<u64, Arc<BlockGroup>>>,
}

impl BlockGroupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `bg`. Fails with `Exists` on a duplicate start or on overlap
    /// with a neighbour.
    pub fn insert(&self, bg: Arc<BlockGroup>) -> Result<()> {
        let mut groups = self.groups.write();
        if groups.contains_key(&bg.start()) {
            return Err(FfsError::Exists(format!(
                "block group at {} already registered",
                bg.start()
            )));
        }
        if let Some((_, prev)) = groups.range(..bg.start()).next_back() {
            if prev.end() > bg.start() {
                return Err(FfsError::Exists(format!(
                    "block group [{}, {}) overlaps [{}, {})",
                    bg.start(),
                    bg.end(),
                    prev.start(),
                    prev.end()
                )));
            }
        }
        if let Some((_, next)) = groups.range(bg.start()..).next() {
            if next.start() < bg.end() {
                return Err(FfsError::Exists(format!(
                    "block group [{}, {}) overlaps [{}, {})",
                    bg.start(),
                    bg.end(),
                    next.start(),
                    next.end()
                )));
            }
        }
        groups.insert(bg.start(), bg);
        Ok(())
    }

    /// The group whose range contains `addr`.
    #[must_use]
    pub fn lookup_containing(&self, addr: u64) -> Option<Arc<BlockGroup>> {
        let groups = self.groups.read();
        groups
            .range(..=addr)
            .next_back()
            .filter(|(_, bg)| bg.contains(addr))
            .map(|(_, bg)| Arc::clone(bg))
    }

    /// The group with the smallest start `>= addr`.
    #[must_use]
    pub fn lookup_first_at_or_after(&self, addr: u64) -> Option<Arc<BlockGroup>> {
        self.groups
            .read()
            .range(addr..)
            .next()
            .map(|(_, bg)| Arc::clone(bg))
    }

    /// Group following `bg` in address order. Works even if `bg` has been
    /// removed in the meantime, since it re-queries by `bg`'s end.
    #[must_use]
    pub fn next(&self, bg: &BlockGroup) -> Option<Arc<BlockGroup>> {
        self.lookup_first_at_or_after(bg.end())
    }

    /// Erase the group starting at `start`, returning it.
    pub fn remove(&self, start: u64) -> Result<Arc<BlockGroup>> {
        self.groups
            .write()
            .remove(&start)
            .ok_or_else(|| FfsError::NotFound(format!("block group at {start}")))
    }

    /// Cursor over all groups in address order, tolerant of concurrent edits.
    #[must_use]
    pub fn iter_from(&self, addr: u64) -> RegistryCursor<'_> {
        RegistryCursor {
            registry: self,
            next_addr: Some(addr),
        }
    }

    /// Point-in-time copy of every registered group.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<BlockGroup>> {
        self.groups.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Remove every group, returning them in address order.
    pub(crate) fn drain(&self) -> Vec<Arc<BlockGroup>> {
        std::mem::take(&mut *self.groups.write())
            .into_values()
            .collect()
    }
}

/// Address-ordered walk that re-queries by the next expected address
/// instead of holding a reference into the map.
pub struct RegistryCursor<'a> {
    registry: &'a BlockGroupRegistry,
    next_addr: Option<u64>,
}

impl Iterator for RegistryCursor<'_> {
    type Item = Arc<BlockGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next_addr?;
        let bg = self.registry.lookup_first_at_or_after(addr)?;
        self.next_addr = Some(bg.end());
        Some(bg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_group::{CachingState, GroupPhase, GroupState};
    use crate::collab::{ChunkPlacement, DeviceExtent};
    use crate::free_space::RangeFreeSpace;
    use crate::profile::BlockGroupFlags;
    use crate::space_info::SpaceInfo;
    use ffs_types::{DeviceId, SZ_1M};
    use proptest::prelude::*;

    fn group(start: u64, length: u64) -> Arc<BlockGroup> {
        let placement = ChunkPlacement {
            start,
            length,
            flags: BlockGroupFlags::DATA,
            stripes: vec![DeviceExtent {
                devid: DeviceId(1),
                physical: start,
                length,
            }],
        };
        Arc::new(BlockGroup::new(
            placement,
            Vec::new(),
            Arc::new(SpaceInfo::new(BlockGroupFlags::DATA, 0)),
            Box::new(RangeFreeSpace::new()),
            GroupState::new(length, GroupPhase::Active, CachingState::Finished),
        ))
    }

    // ── Lookup ─────────────────────────────────────────────────────────────

    #[test]
    fn lookup_containing_respects_bounds() {
        let reg = BlockGroupRegistry::new();
        reg.insert(group(SZ_1M, SZ_1M)).unwrap();
        reg.insert(group(4 * SZ_1M, SZ_1M)).unwrap();

        assert!(reg.lookup_containing(SZ_1M - 1).is_none());
        assert_eq!(reg.lookup_containing(SZ_1M).unwrap().start(), SZ_1M);
        assert_eq!(reg.lookup_containing(2 * SZ_1M - 1).unwrap().start(), SZ_1M);
        assert!(reg.lookup_containing(2 * SZ_1M).is_none());
        assert_eq!(reg.lookup_containing(4 * SZ_1M + 7).unwrap().start(), 4 * SZ_1M);
    }

    #[test]
    fn first_at_or_after_skips_gaps() {
        let reg = BlockGroupRegistry::new();
        reg.insert(group(SZ_1M, SZ_1M)).unwrap();
        reg.insert(group(4 * SZ_1M, SZ_1M)).unwrap();
        assert_eq!(reg.lookup_first_at_or_after(0).unwrap().start(), SZ_1M);
        assert_eq!(
            reg.lookup_first_at_or_after(SZ_1M + 1).unwrap().start(),
            4 * SZ_1M
        );
        assert!(reg.lookup_first_at_or_after(4 * SZ_1M + 1).is_none());
    }

    // ── Insert / remove ────────────────────────────────────────────────────

    #[test]
    fn duplicate_and_overlapping_inserts_fail() {
        let reg = BlockGroupRegistry::new();
        reg.insert(group(SZ_1M, 2 * SZ_1M)).unwrap();
        assert!(matches!(
            reg.insert(group(SZ_1M, SZ_1M)),
            Err(FfsError::Exists(_))
        ));
        assert!(matches!(
            reg.insert(group(2 * SZ_1M, SZ_1M)),
            Err(FfsError::Exists(_))
        ));
        assert!(matches!(
            reg.insert(group(0, SZ_1M + 1)),
            Err(FfsError::Exists(_))
        ));
        reg.insert(group(3 * SZ_1M, SZ_1M)).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn removed_group_outlives_registry_entry() {
        let reg = BlockGroupRegistry::new();
        reg.insert(group(SZ_1M, SZ_1M)).unwrap();
        let held = reg.lookup_containing(SZ_1M).unwrap();
        let removed = reg.remove(SZ_1M).unwrap();
        assert!(Arc::ptr_eq(&held, &removed));
        assert!(reg.lookup_containing(SZ_1M).is_none());
        assert_eq!(held.length(), SZ_1M);
        assert!(matches!(reg.remove(SZ_1M), Err(FfsError::NotFound(_))));
    }

    #[test]
    fn cursor_survives_removal_of_current() {
        let reg = BlockGroupRegistry::new();
        for i in 0..4 {
            reg.insert(group(i * SZ_1M, SZ_1M)).unwrap();
        }
        let mut seen = Vec::new();
        for bg in reg.iter_from(0) {
            if bg.start() == SZ_1M {
                reg.remove(bg.start()).unwrap();
            }
            seen.push(bg.start());
        }
        assert_eq!(seen, vec![0, SZ_1M, 2 * SZ_1M, 3 * SZ_1M]);
        assert_eq!(reg.len(), 3);

        let bg = reg.lookup_containing(0).unwrap();
        assert_eq!(reg.next(&bg).unwrap().start(), 2 * SZ_1M);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn registry_never_holds_overlapping_groups(
            ops in proptest::collection::vec((0_u64..64, 1_u64..8, any::<bool>()), 1..64),
        ) {
            let reg = BlockGroupRegistry::new();
            for (slot, len, remove) in ops {
                let start = slot * SZ_1M;
                if remove {
                    let _ = reg.remove(start);
                } else {
                    let _ = reg.insert(group(start, len * SZ_1M));
                }
                let all = reg.snapshot();
                for pair in all.windows(2) {
                    prop_assert!(pair[0].end() <= pair[1].start());
                }
            }
        }
    }
}
