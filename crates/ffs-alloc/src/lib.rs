#![forbid(unsafe_code)]
//! Block-group allocation.
//!
//! Carves the logical address space into block groups, each backed by one
//! chunk of a single allocation profile, and tracks how every byte of every
//! group is spent.
//!
//! ## Design
//!
//! The subsystem is layered:
//!
//! 1. **Profiles**: flag bits, RAID attributes and profile reduction.
//! 2. **Free-space index**: per-group set of free ranges.
//! 3. **Registry**: ordered map from start offset to group.
//! 4. **Space info**: per-family counters and membership lists.
//! 5. **Caching engine**: lazy, single-flight population of the index.
//! 6. **Lifecycle**: creation, read-only transitions, unused deletion,
//!    reclaim and removal, driven through [`BlockGroupManager`].
//!
//! Lock order, outermost first: sweep lists, space-info membership,
//! space-info counters, block group, free-space index, caching control.
//! The registry lock is never held while taking any of them.

pub mod accounting;
pub mod block_group;
pub mod caching;
pub mod chunk;
pub mod collab;
pub mod config;
pub mod executor;
pub mod free_space;
pub mod manager;
pub mod mem;
pub mod mount;
pub mod profile;
pub mod readonly;
pub mod registry;
pub mod space_info;
pub mod sweep;
pub mod transaction;
pub mod writeback;

pub use accounting::ReserveOptions;
pub use block_group::{
    BlockGroup, BlockGroupStats, CachingState, GroupPhase, GroupState, ListMembership, SizeClass,
};
pub use caching::CachingControl;
pub use chunk::should_alloc_chunk;
pub use collab::{
    ChunkAllocator, ChunkPlacement, DeviceExtent, DiscardScheduler, MetadataStore, NoDiscard,
    Relocator, ZoneInfo,
};
pub use config::AllocConfig;
pub use executor::{InlineQueue, Job, WorkQueue, WorkerPool};
pub use free_space::{FreeSpaceFactory, FreeSpaceIndex, RangeFreeSpace};
pub use manager::{BlockGroupManager, Collaborators, ManagerStats};
pub use profile::{
    AllocProfiles, BlockGroupFlags, NR_RAID_TYPES, RaidAttr, RaidType, RestripeTargets,
    reduce_alloc_profile,
};
pub use readonly::{ReadOnlyRequest, ZoneMigration};
pub use registry::{BlockGroupRegistry, RegistryCursor};
pub use space_info::{ChunkAllocForce, SpaceCounters, SpaceInfo};
pub use sweep::should_reclaim;
pub use transaction::{TransHandle, Transaction, TransactionManager};
