#![forbid(unsafe_code)]
//! Loading block groups from persisted items at mount.
//!
//! Every item must match a chunk of the same start, length and profile,
//! and every chunk must have an item. Either mismatch is corruption and
//! fails the mount; nothing is repaired here.

use crate::block_group::{BlockGroup, CachingState, GroupPhase, GroupState};
use crate::collab::{ChunkPlacement, super_stripe_ranges};
use crate::manager::BlockGroupManager;
use crate::profile::{BlockGroupFlags, RaidType};
use ffs_error::{FfsError, Result};
use ffs_ondisk::{BLOCK_GROUP_ITEM_KEY, BlockGroupItem, BtrfsKey, FREE_SPACE_OBJECTID};
use std::sync::Arc;
use tracing::{debug, info};

const MIRRORED: [RaidType; 6] = [
    RaidType::Raid1,
    RaidType::Raid1C3,
    RaidType::Raid1C4,
    RaidType::Raid10,
    RaidType::Raid5,
    RaidType::Raid6,
];

impl BlockGroupManager {
    /// Build the registry from persisted block-group items.
    pub fn read_block_groups(self: &Arc<Self>) -> Result<()> {
        let store = &self.collab.store;
        let mut key = BtrfsKey::new(0, BLOCK_GROUP_ITEM_KEY, 0);
        let mut loaded = 0_usize;
        while let Some((found, raw)) = store.next_item(&key)? {
            if found.objectid >= FREE_SPACE_OBJECTID {
                break;
            }
            if found.item_type == BLOCK_GROUP_ITEM_KEY {
                let item = BlockGroupItem::parse(&raw).map_err(|e| FfsError::Corruption {
                    start: found.objectid,
                    detail: format!("unreadable block group item: {e}"),
                })?;
                self.read_one_block_group(found, &item)?;
                loaded += 1;
            }
            let Some(next) = found.successor() else { break };
            key = next;
        }

        self.check_chunk_mappings()?;
        self.force_unmirrored_readonly()?;
        info!(target: "ffs::alloc::lifecycle", groups = loaded, "block groups loaded");
        Ok(())
    }

    fn read_one_block_group(self: &Arc<Self>, key: BtrfsKey, item: &BlockGroupItem) -> Result<()> {
        let (start, length) = (key.objectid, key.offset);
        let flags = BlockGroupFlags(item.flags);
        let placement = self.check_against_chunk(start, length, flags)?;
        if flags.is_mixed() && !self.config.mixed_groups {
            return Err(FfsError::Corruption {
                start,
                detail: "mixed data and metadata group without mixed mode".into(),
            });
        }
        if item.used > length {
            return Err(FfsError::Corruption {
                start,
                detail: format!("used {} exceeds length {length}", item.used),
            });
        }

        let si = self.find_or_create_space_info(flags);
        let excluded = if self.config.zoned {
            Vec::new()
        } else {
            super_stripe_ranges(&placement)
        };
        let bytes_super: u64 = excluded.iter().map(|(_, len)| len).sum();

        let mut state = GroupState::new(length, GroupPhase::Active, CachingState::NotCached);
        state.used = item.used;
        state.commit_used = item.used;
        // (free range to add, whether the group starts cached)
        let mut free_range = None;
        if self.config.zoned {
            if let Some(zone) = self.collab.chunks.zone_info(start) {
                state.alloc_offset = zone.alloc_offset.min(length);
                state.zone_capacity = zone.capacity.min(length);
            }
            state.zone_unusable = state.alloc_offset.saturating_sub(item.used)
                + length.saturating_sub(state.zone_capacity);
            state.caching = CachingState::Finished;
            free_range = Some((start + state.alloc_offset, start + state.zone_capacity));
        } else if item.used + bytes_super >= length {
            state.caching = CachingState::Finished;
        } else if item.used == 0 {
            state.caching = CachingState::Finished;
            free_range = Some((start, start + length));
        }

        let free_space = (self.collab.free_space_factory)(start, length);
        let bg = Arc::new(BlockGroup::new(placement, excluded, Arc::clone(&si), free_space, state));
        if let Some((free_start, free_end)) = free_range {
            if free_end > free_start {
                self.add_new_free_space(&bg, free_start, free_end)?;
            }
        }

        si.add_group(&bg);
        self.profiles.set_avail_alloc_bits(flags);
        if let Err(err) = self.registry.insert(Arc::clone(&bg)) {
            self.unlink_from_space_info(&bg)?;
            return Err(FfsError::Corruption {
                start,
                detail: err.to_string(),
            });
        }
        debug!(target: "ffs::alloc::lifecycle", start, used = item.used, flags = %flags, "block group loaded");

        if !self.collab.chunks.is_writeable(start) {
            self.mark_unwritable_readonly(&bg)?;
        } else if item.used == 0 {
            if self.config.discard_async {
                self.collab.discard.queue_for_discard(&bg);
            }
            if !self.collab.discard.is_queued(&bg) {
                self.mark_unused(&bg);
            }
        }
        Ok(())
    }

    fn check_against_chunk(
        &self,
        start: u64,
        length: u64,
        flags: BlockGroupFlags,
    ) -> Result<ChunkPlacement> {
        let Some(chunk) = self.collab.chunks.find_chunk(start) else {
            return Err(FfsError::Corruption {
                start,
                detail: format!("block group length {length} has no chunk"),
            });
        };
        if chunk.length != length {
            return Err(FfsError::Corruption {
                start,
                detail: format!("chunk length {} != block group length {length}", chunk.length),
            });
        }
        let chunk_bits = chunk.flags.type_bits().bits() | chunk.flags.profile_bits().bits();
        let group_bits = flags.type_bits().bits() | flags.profile_bits().bits();
        if chunk_bits != group_bits {
            return Err(FfsError::Corruption {
                start,
                detail: format!("chunk flags {} != block group flags {flags}", chunk.flags),
            });
        }
        Ok(chunk)
    }

    /// Every chunk must be backed by exactly one group of the same extent.
    fn check_chunk_mappings(&self) -> Result<()> {
        for chunk in self.collab.chunks.chunks() {
            match self.registry.lookup_containing(chunk.start) {
                Some(bg) if bg.start() == chunk.start && bg.length() == chunk.length => {}
                Some(bg) => {
                    return Err(FfsError::Corruption {
                        start: chunk.start,
                        detail: format!(
                            "chunk length {} maps onto block group {} length {}",
                            chunk.length,
                            bg.start(),
                            bg.length()
                        ),
                    });
                }
                None => {
                    return Err(FfsError::Corruption {
                        start: chunk.start,
                        detail: format!("chunk length {} has no block group", chunk.length),
                    });
                }
            }
        }
        Ok(())
    }

    /// In a family that has mirrored groups, single and striped groups are
    /// leftovers from a conversion and must not take new allocations.
    fn force_unmirrored_readonly(&self) -> Result<()> {
        let infos: Vec<_> = self.space_infos.read().clone();
        for si in infos {
            let mirrored = MIRRORED.iter().any(|&raid| !si.members(raid).is_empty());
            if !mirrored {
                continue;
            }
            for raid in [RaidType::Raid0, RaidType::Single] {
                for bg in si.members(raid) {
                    if !bg.is_readonly() {
                        self.inc_block_group_ro(&bg, true)?;
                        info!(target: "ffs::alloc::lifecycle", start = bg.start(), "unmirrored block group marked read-only");
                    }
                }
            }
        }
        Ok(())
    }
}
