#![forbid(unsafe_code)]
//! Contracts of the external collaborators the allocator drives: the
//! persisted-metadata store, the chunk/device-extent layer, the discard
//! scheduler and the relocation routine.

use crate::block_group::BlockGroup;
use crate::manager::BlockGroupManager;
use crate::profile::BlockGroupFlags;
use ffs_error::Result;
use ffs_ondisk::BtrfsKey;
use ffs_types::{
    DeviceId, STRIPE_LEN, SUPER_INFO_OFFSET, SUPER_MIRROR_MAX, align_down, super_mirror_offset,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Ordered key/value store holding persisted items.
pub trait MetadataStore: Send + Sync + fmt::Debug {
    /// Insert a new item. Fails with `Exists` if the key is present.
    fn insert_item(&self, key: BtrfsKey, value: Vec<u8>) -> Result<()>;

    /// Overwrite an existing item. Fails with `NotFound` if absent.
    fn update_item(&self, key: &BtrfsKey, value: Vec<u8>) -> Result<()>;

    fn search(&self, key: &BtrfsKey) -> Result<Option<Vec<u8>>>;

    /// Delete an item. Fails with `NotFound` if absent.
    fn delete_item(&self, key: &BtrfsKey) -> Result<()>;

    /// First item whose key is `>= from`.
    fn next_item(&self, from: &BtrfsKey) -> Result<Option<(BtrfsKey, Vec<u8>)>>;
}

/// One device extent backing part of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceExtent {
    pub devid: DeviceId,
    pub physical: u64,
    pub length: u64,
}

/// Physical placement of one chunk: the logical range it backs and the
/// device extents holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlacement {
    pub start: u64,
    pub length: u64,
    pub flags: BlockGroupFlags,
    pub stripes: Vec<DeviceExtent>,
}

impl ChunkPlacement {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Zone write pointer state for a group on zoned media, relative to the
/// group start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneInfo {
    pub alloc_offset: u64,
    pub capacity: u64,
}

/// Chunk-to-device mapping layer.
pub trait ChunkAllocator: Send + Sync + fmt::Debug {
    /// Place a new chunk of profile `flags`. `size_hint` overrides the
    /// per-type default size. Fails with `NoSpace` when devices are full.
    fn allocate_device_extents(
        &self,
        flags: BlockGroupFlags,
        size_hint: Option<u64>,
    ) -> Result<ChunkPlacement>;

    fn free_device_extents(&self, placement: &ChunkPlacement) -> Result<()>;

    /// Chunk whose logical range starts exactly at `start`.
    fn find_chunk(&self, start: u64) -> Option<ChunkPlacement>;

    fn chunks(&self) -> Vec<ChunkPlacement>;

    /// Number of writable devices.
    fn rw_devices(&self) -> u64;

    /// Raw capacity of all writable devices.
    fn total_bytes(&self) -> u64;

    /// Raw capacity not yet assigned to any chunk.
    fn unallocated_bytes(&self) -> u64;

    /// Whether new allocations may land in the chunk at `start`.
    fn is_writeable(&self, _start: u64) -> bool {
        true
    }

    fn zone_info(&self, _start: u64) -> Option<ZoneInfo> {
        None
    }

    /// Finish the zone(s) of the group at `start` before its removal.
    fn finish_zone(&self, _start: u64) -> Result<()> {
        Ok(())
    }
}

/// Asynchronous trim of unused groups.
pub trait DiscardScheduler: Send + Sync + fmt::Debug {
    /// Queue an empty group for trimming. Once it is trimmed the scheduler
    /// hands it back through
    /// [`BlockGroupManager::discard_finished`](crate::BlockGroupManager::discard_finished).
    fn queue_for_discard(&self, group: &Arc<BlockGroup>);

    fn cancel_discard(&self, group: &BlockGroup);

    /// Still waiting on the discard list.
    fn is_queued(&self, group: &BlockGroup) -> bool;

    /// Every free byte of the group has been trimmed.
    fn is_trimmed(&self, _group: &BlockGroup) -> bool {
        true
    }

    /// Trim a removed group synchronously.
    fn trim_removed(&self, _group: &BlockGroup) -> Result<()> {
        Ok(())
    }
}

/// Discard scheduler for devices without trim support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscard;

impl DiscardScheduler for NoDiscard {
    fn queue_for_discard(&self, _group: &Arc<BlockGroup>) {}

    fn cancel_discard(&self, _group: &BlockGroup) {}

    fn is_queued(&self, _group: &BlockGroup) -> bool {
        false
    }
}

/// Moves the live extents of a read-only group elsewhere. On success the
/// group's `used` must have dropped to zero.
pub trait Relocator: Send + Sync + fmt::Debug {
    fn relocate(&self, manager: &BlockGroupManager, group: &Arc<BlockGroup>) -> Result<()>;
}

/// Logical ranges of `placement` that hold superblock copies, merged and
/// sorted. Everything below the first superblock is excluded as well.
///
/// Assumes every stripe maps the whole logical range, which holds for
/// single and mirrored layouts.
#[must_use]
pub fn super_stripe_ranges(placement: &ChunkPlacement) -> Vec<(u64, u64)> {
    let end = placement.end();
    let mut ranges = Vec::new();

    if placement.start < SUPER_INFO_OFFSET {
        let len = (SUPER_INFO_OFFSET - placement.start).min(placement.length);
        ranges.push((placement.start, len));
    }

    for mirror in 0..SUPER_MIRROR_MAX {
        let bytenr = super_mirror_offset(mirror);
        for stripe in &placement.stripes {
            if bytenr < stripe.physical || bytenr >= stripe.physical + stripe.length {
                continue;
            }
            let Some(rel) = align_down(bytenr - stripe.physical, STRIPE_LEN) else {
                continue;
            };
            let logical = placement.start + rel;
            if logical >= end {
                continue;
            }
            ranges.push((logical, STRIPE_LEN.min(end - logical)));
        }
    }

    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, len) in ranges {
        if let Some(last) = merged.last_mut() {
            let last_end = last.0 + last.1;
            if start <= last_end {
                last.1 = last_end.max(start + len) - last.0;
                continue;
            }
        }
        merged.push((start, len));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_types::{SZ_1G, SZ_1M, SZ_64K, SZ_64M};

    fn single(start: u64, length: u64, physical: u64) -> ChunkPlacement {
        ChunkPlacement {
            start,
            length,
            flags: BlockGroupFlags::DATA,
            stripes: vec![DeviceExtent {
                devid: DeviceId(1),
                physical,
                length,
            }],
        }
    }

    #[test]
    fn chunk_above_mirrors_excludes_nothing() {
        assert!(super_stripe_ranges(&single(SZ_1G, SZ_1G, SZ_1G)).is_empty());
    }

    #[test]
    fn first_chunk_excludes_reserved_head_and_mirror_zero() {
        let ranges = super_stripe_ranges(&single(0, 8 * SZ_1M, 0));
        assert_eq!(ranges, vec![(0, 2 * SZ_64K)]);
    }

    #[test]
    fn second_mirror_maps_through_physical_offset() {
        // Logical 1GiB mapped at physical 32MiB; mirror 1 sits 32MiB in.
        let ranges = super_stripe_ranges(&single(SZ_1G, 64 * SZ_1M, 32 * SZ_1M));
        assert_eq!(ranges, vec![(SZ_1G + (SZ_64M - 32 * SZ_1M), SZ_64K)]);
    }

    #[test]
    fn dup_stripes_on_one_device_merge() {
        let placement = ChunkPlacement {
            start: 0,
            length: SZ_1M,
            flags: BlockGroupFlags::METADATA | BlockGroupFlags::DUP,
            stripes: vec![
                DeviceExtent {
                    devid: DeviceId(1),
                    physical: 0,
                    length: SZ_1M,
                },
                DeviceExtent {
                    devid: DeviceId(1),
                    physical: SZ_64M - SZ_64K,
                    length: SZ_1M,
                },
            ],
        };
        assert_eq!(super_stripe_ranges(&placement), vec![(0, 2 * SZ_64K)]);
    }
}
