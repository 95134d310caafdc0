#![forbid(unsafe_code)]
//! The per-filesystem block-group context.
//!
//! ## Design
//!
//! [`BlockGroupManager`] owns the registry, the space infos, the avail
//! profile bits and the in-flight caching controls of one mounted
//! filesystem. Nothing here is process-global: every operation goes through
//! a manager handle, so several filesystems (or tests) can coexist.
//!
//! The manager's operations are spread over modules by concern:
//!
//! | Module | Operations |
//! |--------|------------|
//! | `caching` | `ensure_cached`, `wait_for_progress` |
//! | `accounting` | `reserve_bytes`, `update_on_allocation`, extent reservation, swap/freeze counters |
//! | `readonly` | `mark_readonly`, `inc_block_group_ro`, `clear_readonly` |
//! | `chunk` | `chunk_alloc`, `force_chunk_alloc`, `create_pending_block_groups` |
//! | `sweep` | unused deletion, reclaim, `remove_block_group` |
//! | `writeback` | commit hooks |
//! | `mount` | `read_block_groups` |

use crate::block_group::{BlockGroup, ListMembership};
use crate::caching::CachingControl;
use crate::collab::{ChunkAllocator, DiscardScheduler, MetadataStore, Relocator};
use crate::config::AllocConfig;
use crate::executor::WorkQueue;
use crate::free_space::FreeSpaceFactory;
use crate::profile::{AllocProfiles, BlockGroupFlags};
use crate::registry::BlockGroupRegistry;
use crate::space_info::SpaceInfo;
use crate::sweep::SweepLists;
use crate::transaction::{TransHandle, TransactionManager};
use ffs_error::{FfsError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{error, info, warn};

/// Services the block-group layer consumes from the rest of the
/// filesystem.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MetadataStore>,
    pub transactions: Arc<dyn TransactionManager>,
    pub chunks: Arc<dyn ChunkAllocator>,
    pub discard: Arc<dyn DiscardScheduler>,
    pub relocator: Arc<dyn Relocator>,
    pub work_queue: Arc<dyn WorkQueue>,
    /// Builds the free-space index for a new group.
    pub free_space_factory: FreeSpaceFactory,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("store", &self.store)
            .field("transactions", &self.transactions)
            .field("chunks", &self.chunks)
            .field("work_queue", &self.work_queue)
            .finish_non_exhaustive()
    }
}

// ── Statistics ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct ManagerCounters {
    pub(crate) groups_created: AtomicU64,
    pub(crate) groups_removed: AtomicU64,
    pub(crate) caching_runs: AtomicU64,
    pub(crate) caching_failures: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
    pub(crate) relocation_failures: AtomicU64,
    pub(crate) unused_deleted: AtomicU64,
}

/// Point-in-time copy of the manager's event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub groups_created: u64,
    pub groups_removed: u64,
    pub caching_runs: u64,
    pub caching_failures: u64,
    pub reclaimed: u64,
    pub relocation_failures: u64,
    pub unused_deleted: u64,
}

// ── Manager ─────────────────────────────────────────────────────────────────

pub struct BlockGroupManager {
    pub(crate) config: AllocConfig,
    pub(crate) collab: Collaborators,
    pub(crate) registry: BlockGroupRegistry,
    pub(crate) space_infos: RwLock<Vec<Arc<SpaceInfo>>>,
    pub(crate) profiles: AllocProfiles,
    pub(crate) caching_controls: Mutex<Vec<Arc<CachingControl>>>,
    pub(crate) sweep: Mutex<SweepLists>,
    /// Serialises the unused and reclaim sweeps.
    pub(crate) reclaim_lock: Mutex<()>,
    pub(crate) ro_block_group_mutex: Mutex<()>,
    pub(crate) chunk_mutex: Mutex<()>,
    pub(crate) closing: AtomicBool,
    pub(crate) fs_error: Mutex<Option<String>>,
    pub(crate) data_chunk_allocations: AtomicU64,
    pub(crate) stats: ManagerCounters,
}

impl BlockGroupManager {
    /// Create an empty manager. Fails on an invalid configuration.
    pub fn new(config: AllocConfig, collab: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            collab,
            registry: BlockGroupRegistry::new(),
            space_infos: RwLock::new(Vec::new()),
            profiles: AllocProfiles::new(),
            caching_controls: Mutex::new(Vec::new()),
            sweep: Mutex::new(SweepLists::default()),
            reclaim_lock: Mutex::new(()),
            ro_block_group_mutex: Mutex::new(()),
            chunk_mutex: Mutex::new(()),
            closing: AtomicBool::new(false),
            fs_error: Mutex::new(None),
            data_chunk_allocations: AtomicU64::new(0),
            stats: ManagerCounters::default(),
        }))
    }

    /// Create a manager and load the persisted block groups.
    pub fn mount(config: AllocConfig, collab: Collaborators) -> Result<Arc<Self>> {
        let mgr = Self::new(config, collab)?;
        let families: &[BlockGroupFlags] = if mgr.config.mixed_groups {
            &[BlockGroupFlags::SYSTEM, BlockGroupFlags::MIXED]
        } else {
            &[
                BlockGroupFlags::SYSTEM,
                BlockGroupFlags::METADATA,
                BlockGroupFlags::DATA,
            ]
        };
        for &flags in families {
            mgr.find_or_create_space_info(flags);
        }
        mgr.read_block_groups()?;
        Ok(mgr)
    }

    #[must_use]
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &BlockGroupRegistry {
        &self.registry
    }

    #[must_use]
    pub fn profiles(&self) -> &AllocProfiles {
        &self.profiles
    }

    /// The group containing `addr`.
    pub fn get_block_group(&self, addr: u64) -> Result<Arc<BlockGroup>> {
        self.registry
            .lookup_containing(addr)
            .ok_or_else(|| FfsError::NotFound(format!("no block group contains {addr}")))
    }

    /// Space info of the family `flags` belongs to, created on first use.
    /// In mixed mode data and metadata share one family.
    pub(crate) fn find_or_create_space_info(&self, flags: BlockGroupFlags) -> Arc<SpaceInfo> {
        let family = self.family_of(flags);
        if let Some(si) = self.lookup_space_info(family) {
            return si;
        }
        let mut infos = self.space_infos.write();
        if let Some(si) = infos.iter().find(|si| si.flags() == family) {
            return Arc::clone(si);
        }
        let si = Arc::new(SpaceInfo::new(family, self.config.reclaim_threshold_percent));
        infos.push(Arc::clone(&si));
        si
    }

    /// Space info of the family `flags` belongs to, if it exists.
    #[must_use]
    pub fn space_info_for(&self, flags: BlockGroupFlags) -> Option<Arc<SpaceInfo>> {
        self.lookup_space_info(self.family_of(flags))
    }

    #[must_use]
    pub fn space_infos(&self) -> Vec<Arc<SpaceInfo>> {
        self.space_infos.read().clone()
    }

    fn family_of(&self, flags: BlockGroupFlags) -> BlockGroupFlags {
        let type_bits = flags.type_bits();
        if self.config.mixed_groups && !type_bits.is_system() {
            BlockGroupFlags::MIXED
        } else {
            type_bits
        }
    }

    fn lookup_space_info(&self, family: BlockGroupFlags) -> Option<Arc<SpaceInfo>> {
        self.space_infos
            .read()
            .iter()
            .find(|si| si.flags() == family)
            .map(Arc::clone)
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Abort `trans` after a failed persisted write. The first error is kept
    /// as the filesystem error.
    pub fn abort_transaction(&self, trans: &TransHandle, err: &FfsError) {
        let reason = err.to_string();
        trans.mark_aborted(&reason);
        self.collab.transactions.abort(trans, err);
        let mut fs_error = self.fs_error.lock();
        if fs_error.is_none() {
            *fs_error = Some(reason);
        }
        error!(target: "ffs::alloc::lifecycle", txn = trans.id().0, error = %err, "transaction aborted");
    }

    /// The error that forced the filesystem read-only, if any.
    #[must_use]
    pub fn fs_error(&self) -> Option<String> {
        self.fs_error.lock().clone()
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let s = &self.stats;
        ManagerStats {
            groups_created: s.groups_created.load(Ordering::Relaxed),
            groups_removed: s.groups_removed.load(Ordering::Relaxed),
            caching_runs: s.caching_runs.load(Ordering::Relaxed),
            caching_failures: s.caching_failures.load(Ordering::Relaxed),
            reclaimed: s.reclaimed.load(Ordering::Relaxed),
            relocation_failures: s.relocation_failures.load(Ordering::Relaxed),
            unused_deleted: s.unused_deleted.load(Ordering::Relaxed),
        }
    }

    /// Tear down all in-memory state. In-flight caching is waited for,
    /// sweep lists are dropped and every group leaves the registry.
    pub fn unmount(&self) {
        self.closing.store(true, Ordering::Release);

        let controls: Vec<_> = self.caching_controls.lock().clone();
        for ctl in controls {
            ctl.wait_done();
        }

        {
            let mut guard = self.sweep.lock();
            let lists = &mut *guard;
            for bg in lists.unused.drain(..).chain(lists.reclaim.drain(..)) {
                bg.lock().list = ListMembership::None;
            }
        }

        let groups = self.registry.drain();
        for bg in &groups {
            let st = bg.lock();
            if st.reserved > 0 || st.pinned > 0 || st.delalloc_bytes > 0 {
                warn!(
                    target: "ffs::alloc::lifecycle",
                    start = bg.start(),
                    reserved = st.reserved,
                    pinned = st.pinned,
                    delalloc = st.delalloc_bytes,
                    "block group torn down with outstanding bytes"
                );
            }
            drop(st);
            bg.free_space().clear();
        }

        for si in self.space_infos.write().drain(..) {
            let c = si.snapshot();
            if c.bytes_reserved > 0 || c.bytes_pinned > 0 || c.bytes_may_use > 0 {
                warn!(
                    target: "ffs::alloc::lifecycle",
                    flags = %si.flags(),
                    reserved = c.bytes_reserved,
                    pinned = c.bytes_pinned,
                    may_use = c.bytes_may_use,
                    "space info torn down with outstanding reservations"
                );
            }
        }
        info!(target: "ffs::alloc::lifecycle", groups = groups.len(), "block groups released");
    }
}

impl fmt::Debug for BlockGroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGroupManager")
            .field("groups", &self.registry.len())
            .field("space_infos", &self.space_infos.read().len())
            .field("closing", &self.is_closing())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemFixture;

    #[test]
    fn lookup_misses_with_not_found() {
        let fx = MemFixture::new();
        assert!(matches!(
            fx.manager.get_block_group(12_345),
            Err(FfsError::NotFound(_))
        ));
    }

    #[test]
    fn mixed_mode_shares_one_family() {
        let config = AllocConfig {
            mixed_groups: true,
            ..AllocConfig::default()
        };
        let fx = MemFixture::with_config(config);
        let data = fx.manager.find_or_create_space_info(BlockGroupFlags::DATA);
        let meta = fx.manager.find_or_create_space_info(BlockGroupFlags::METADATA);
        let sys = fx.manager.find_or_create_space_info(BlockGroupFlags::SYSTEM);
        assert!(Arc::ptr_eq(&data, &meta));
        assert!(!Arc::ptr_eq(&data, &sys));
        assert_eq!(data.flags(), BlockGroupFlags::MIXED);
    }

    #[test]
    fn unmount_empties_everything() {
        let fx = MemFixture::new();
        fx.manager.force_chunk_alloc(BlockGroupFlags::DATA).unwrap();
        fx.commit();
        fx.manager.unmount();
        assert!(fx.manager.registry().is_empty());
        assert!(fx.manager.space_infos().is_empty());
        assert!(fx.manager.is_closing());
    }

    #[test]
    fn stats_serialize() {
        let fx = MemFixture::new();
        fx.manager.force_chunk_alloc(BlockGroupFlags::DATA).unwrap();
        let json = serde_json::to_value(fx.manager.stats()).unwrap();
        assert_eq!(json["groups_created"], 1);
    }
}
