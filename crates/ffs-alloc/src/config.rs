#![forbid(unsafe_code)]
//! Allocator tuning knobs and feature switches.

use ffs_error::{FfsError, Result};
use ffs_types::{SZ_16K, SZ_2M, SZ_64M};
use serde::{Deserialize, Serialize};

/// Configuration for one mounted filesystem's block-group allocator.
///
/// The numeric thresholds are heuristics; the defaults match long-standing
/// behaviour and each can be tuned independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    /// Used-fraction (percent) below which a group becomes a reclaim
    /// candidate. Zero disables reclaim.
    pub reclaim_threshold_percent: u8,
    /// Extent samples taken when estimating a group's size class.
    pub size_class_samples: u32,
    /// Bytes scanned between progress wake-ups during extent-scan caching.
    pub caching_wake_bytes: u64,
    /// Usage percentage of a space family beyond which a chunk is added.
    pub chunk_alloc_percent: u8,
    /// Slack added to usage before comparing against `chunk_alloc_percent`.
    pub chunk_alloc_slack: u64,
    /// Minimum free headroom when allocation is forced in limited mode.
    pub limited_alloc_floor: u64,
    /// Percentage of the filesystem used as limited-mode headroom.
    pub limited_alloc_percent: u8,
    /// Force a metadata chunk every N data chunks. Zero disables.
    pub metadata_ratio: u64,
    /// Bytes attributed to a metadata extent record (tree block size).
    pub nodesize: u64,
    /// Load and write the persisted per-group free-space snapshot.
    pub space_cache: bool,
    /// Populate free space from free-space tree items.
    pub free_space_tree: bool,
    /// Hand unused groups to the discard scheduler before deletion.
    pub discard_async: bool,
    /// Trim removed groups synchronously at transaction finish.
    pub discard_sync: bool,
    pub zoned: bool,
    /// Permit groups that hold both data and metadata.
    pub mixed_groups: bool,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            reclaim_threshold_percent: 75,
            size_class_samples: 5,
            caching_wake_bytes: SZ_2M,
            chunk_alloc_percent: 80,
            chunk_alloc_slack: SZ_2M,
            limited_alloc_floor: SZ_64M,
            limited_alloc_percent: 1,
            metadata_ratio: 0,
            nodesize: SZ_16K,
            space_cache: true,
            free_space_tree: false,
            discard_async: false,
            discard_sync: false,
            zoned: false,
            mixed_groups: false,
        }
    }
}

impl AllocConfig {
    /// Reject values no filesystem can run with.
    pub fn validate(&self) -> Result<()> {
        if self.reclaim_threshold_percent > 100 {
            return Err(FfsError::InvalidConfig(format!(
                "reclaim_threshold_percent {} exceeds 100",
                self.reclaim_threshold_percent
            )));
        }
        if self.chunk_alloc_percent == 0 || self.chunk_alloc_percent > 100 {
            return Err(FfsError::InvalidConfig(format!(
                "chunk_alloc_percent {} outside 1..=100",
                self.chunk_alloc_percent
            )));
        }
        if self.limited_alloc_percent > 100 {
            return Err(FfsError::InvalidConfig(format!(
                "limited_alloc_percent {} exceeds 100",
                self.limited_alloc_percent
            )));
        }
        if self.size_class_samples == 0 {
            return Err(FfsError::InvalidConfig(
                "size_class_samples must be non-zero".to_owned(),
            ));
        }
        if self.caching_wake_bytes == 0 {
            return Err(FfsError::InvalidConfig(
                "caching_wake_bytes must be non-zero".to_owned(),
            ));
        }
        if !self.nodesize.is_power_of_two() {
            return Err(FfsError::InvalidConfig(format!(
                "nodesize {} is not a power of two",
                self.nodesize
            )));
        }
        if self.zoned && self.space_cache {
            return Err(FfsError::InvalidConfig(
                "space_cache snapshots are not used on zoned media".to_owned(),
            ));
        }
        if self.discard_async && self.discard_sync {
            return Err(FfsError::InvalidConfig(
                "discard_async and discard_sync are mutually exclusive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Defaults adjusted for zoned media.
    #[must_use]
    pub fn zoned() -> Self {
        Self {
            zoned: true,
            space_cache: false,
            ..Self::default()
        }
    }
}
