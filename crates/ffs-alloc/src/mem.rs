#![forbid(unsafe_code)]
//! In-memory collaborators.
//!
//! Metadata store, transaction manager, chunk allocator, discard scheduler
//! and relocator backed by plain maps, plus [`MemFixture`] wiring them to a
//! [`BlockGroupManager`]. Used by unit tests, integration tests and
//! benchmarks; nothing here touches a device.

use crate::accounting::ReserveOptions;
use crate::block_group::{BlockGroup, GroupPhase};
use crate::collab::{
    ChunkAllocator, ChunkPlacement, DeviceExtent, DiscardScheduler, MetadataStore, Relocator,
    ZoneInfo,
};
use crate::config::AllocConfig;
use crate::executor::{InlineQueue, WorkQueue};
use crate::free_space::RangeFreeSpace;
use crate::manager::{BlockGroupManager, Collaborators};
use crate::profile::BlockGroupFlags;
use crate::transaction::{TransHandle, Transaction, TransactionManager};
use ffs_error::{FfsError, Result};
use ffs_ondisk::{BtrfsKey, EXTENT_ITEM_KEY};
use ffs_types::{DeviceId, Generation, SZ_1G, SZ_1M, SZ_32M, SZ_256M, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

fn injected(what: &str) -> FfsError {
    FfsError::Io(std::io::Error::other(format!("injected {what} failure")))
}

// ── Metadata store ──────────────────────────────────────────────────────────

/// Ordered key/value store standing in for the metadata trees.
#[derive(Default)]
pub struct MemMetadataStore {
    items: Mutex<BTreeMap<BtrfsKey, Vec<u8>>>,
    fail_writes: AtomicU32,
    /// `next_item` calls from this objectid on block until cleared.
    read_gate: Mutex<Option<u64>>,
    read_gate_cond: Condvar,
}

impl MemMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &BtrfsKey) -> Option<Vec<u8>> {
        self.items.lock().get(key).cloned()
    }

    /// Drop an item behind the allocator's back.
    pub fn remove(&self, key: &BtrfsKey) -> Option<Vec<u8>> {
        self.items.lock().remove(key)
    }

    /// Overwrite or create an item without failure injection.
    pub fn put(&self, key: BtrfsKey, value: Vec<u8>) {
        self.items.lock().insert(key, value);
    }

    /// Record a data extent.
    pub fn add_extent(&self, start: u64, len: u64) {
        self.put(BtrfsKey::extent(start, len), Vec::new());
    }

    /// Data extents starting inside `[start, end)`.
    #[must_use]
    pub fn extents_in(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.items
            .lock()
            .range(BtrfsKey::new(start, 0, 0)..BtrfsKey::new(end, 0, 0))
            .filter(|(k, _)| k.item_type == EXTENT_ITEM_KEY)
            .map(|(k, _)| (k.objectid, k.offset))
            .collect()
    }

    /// Fail the next insert, update or delete with an I/O error.
    pub fn fail_next_write(&self) {
        self.fail_writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Hold every ordered read starting at or past `objectid` until
    /// [`resume_reads`](Self::resume_reads).
    pub fn pause_reads_from(&self, objectid: u64) {
        *self.read_gate.lock() = Some(objectid);
    }

    pub fn resume_reads(&self) {
        *self.read_gate.lock() = None;
        self.read_gate_cond.notify_all();
    }

    fn wait_read_gate(&self, from: &BtrfsKey) {
        let mut gate = self.read_gate.lock();
        while gate.is_some_and(|at| from.objectid >= at) {
            self.read_gate_cond.wait(&mut gate);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn check_write(&self) -> Result<()> {
        let armed = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed { Err(injected("write")) } else { Ok(()) }
    }
}

impl MetadataStore for MemMetadataStore {
    fn insert_item(&self, key: BtrfsKey, value: Vec<u8>) -> Result<()> {
        self.check_write()?;
        let mut items = self.items.lock();
        if items.contains_key(&key) {
            return Err(FfsError::Exists(format!("item {key:?}")));
        }
        items.insert(key, value);
        Ok(())
    }

    fn update_item(&self, key: &BtrfsKey, value: Vec<u8>) -> Result<()> {
        self.check_write()?;
        let mut items = self.items.lock();
        let Some(slot) = items.get_mut(key) else {
            return Err(FfsError::NotFound(format!("item {key:?}")));
        };
        *slot = value;
        Ok(())
    }

    fn search(&self, key: &BtrfsKey) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key))
    }

    fn delete_item(&self, key: &BtrfsKey) -> Result<()> {
        self.check_write()?;
        self.items
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| FfsError::NotFound(format!("item {key:?}")))
    }

    fn next_item(&self, from: &BtrfsKey) -> Result<Option<(BtrfsKey, Vec<u8>)>> {
        self.wait_read_gate(from);
        Ok(self
            .items
            .lock()
            .range(*from..)
            .next()
            .map(|(k, v)| (*k, v.clone())))
    }
}

impl fmt::Debug for MemMetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemMetadataStore")
            .field("items", &self.items.lock().len())
            .finish_non_exhaustive()
    }
}

// ── Transaction manager ─────────────────────────────────────────────────────

/// Single running transaction; commit is driven explicitly by the test.
pub struct MemTransactionManager {
    generation: Mutex<u64>,
    committed: Condvar,
    current: Mutex<TransHandle>,
    aborted: AtomicBool,
}

impl MemTransactionManager {
    /// `generation` is the last committed generation.
    #[must_use]
    pub fn new(generation: u64) -> Self {
        Self {
            generation: Mutex::new(generation),
            committed: Condvar::new(),
            current: Mutex::new(Transaction::new(TxnId(generation + 1))),
            aborted: AtomicBool::new(false),
        }
    }

    /// The running transaction.
    #[must_use]
    pub fn current(&self) -> TransHandle {
        self.current.lock().clone()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Commit the running transaction: block-group commit hooks, then the
    /// generation bump, then post-commit unpinning.
    pub fn commit(&self, manager: &BlockGroupManager) -> Result<()> {
        let trans = self.current();
        manager.run_commit_hooks(&trans)?;
        trans.check_aborted()?;
        {
            let mut generation = self.generation.lock();
            *generation = trans.id().0;
            *self.current.lock() = Transaction::new(TxnId(trans.id().0 + 1));
        }
        self.committed.notify_all();
        debug!(target: "ffs::alloc::lifecycle", txn = trans.id().0, "transaction committed");
        manager.finish_transaction(&trans)
    }
}

impl TransactionManager for MemTransactionManager {
    fn start(&self) -> Result<TransHandle> {
        if self.is_aborted() {
            return Err(FfsError::ReadOnly);
        }
        Ok(self.current())
    }

    fn join(&self) -> Result<TransHandle> {
        self.start()
    }

    fn end(&self, _trans: &TransHandle) -> Result<()> {
        Ok(())
    }

    fn abort(&self, _trans: &TransHandle, _err: &FfsError) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn generation(&self) -> Generation {
        Generation(*self.generation.lock())
    }

    fn wait_for_commit(&self, id: TxnId) -> Result<()> {
        let mut generation = self.generation.lock();
        while *generation < id.0 {
            if self.is_aborted() {
                return Err(FfsError::ReadOnly);
            }
            self.committed.wait(&mut generation);
        }
        Ok(())
    }
}

impl fmt::Debug for MemTransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTransactionManager")
            .field("generation", &*self.generation.lock())
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

// ── Chunk allocator ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct ChunkState {
    capacity: u64,
    allocated: u64,
    next_logical: u64,
    next_physical: u64,
    chunks: BTreeMap<u64, ChunkPlacement>,
    unwritable: BTreeSet<u64>,
    chunk_size: Option<u64>,
    zone_capacity: Option<u64>,
    zones: BTreeMap<u64, ZoneInfo>,
    finished_zones: BTreeSet<u64>,
}

/// Linear device-space allocator over `num_devices` equal devices.
///
/// Logical addresses start at 1 GiB and grow; freed device space is
/// returned to the capacity pool but logical addresses are never reused.
#[derive(Debug)]
pub struct MemChunkAllocator {
    num_devices: u64,
    state: Mutex<ChunkState>,
}

impl MemChunkAllocator {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self::with_devices(capacity, 1)
    }

    #[must_use]
    pub fn with_devices(capacity: u64, num_devices: u64) -> Self {
        Self {
            num_devices: num_devices.max(1),
            state: Mutex::new(ChunkState {
                capacity,
                allocated: 0,
                next_logical: SZ_1G,
                next_physical: SZ_1M,
                chunks: BTreeMap::new(),
                unwritable: BTreeSet::new(),
                chunk_size: None,
                zone_capacity: None,
                zones: BTreeMap::new(),
                finished_zones: BTreeSet::new(),
            }),
        }
    }

    fn default_size(flags: BlockGroupFlags) -> u64 {
        if flags.is_system() {
            SZ_32M
        } else if flags.is_metadata() {
            SZ_256M
        } else {
            SZ_1G
        }
    }

    /// Forget the mapping of the chunk at `start` without freeing it.
    pub fn forget_chunk(&self, start: u64) -> Option<ChunkPlacement> {
        self.state.lock().chunks.remove(&start)
    }

    pub fn set_writeable(&self, start: u64, writeable: bool) {
        let mut st = self.state.lock();
        if writeable {
            st.unwritable.remove(&start);
        } else {
            st.unwritable.insert(start);
        }
    }

    /// Size of every chunk allocated from now on, overriding the per-type
    /// defaults. `None` restores them.
    pub fn set_chunk_size(&self, size: Option<u64>) {
        self.state.lock().chunk_size = size;
    }

    /// Give every chunk allocated from now on a zone of `capacity` bytes.
    pub fn set_zone_capacity(&self, capacity: Option<u64>) {
        self.state.lock().zone_capacity = capacity;
    }

    /// Move the write pointer of the zone backing `start`.
    pub fn set_zone_info(&self, start: u64, info: ZoneInfo) {
        self.state.lock().zones.insert(start, info);
    }

    #[must_use]
    pub fn zone_finished(&self, start: u64) -> bool {
        self.state.lock().finished_zones.contains(&start)
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated
    }
}

impl ChunkAllocator for MemChunkAllocator {
    fn allocate_device_extents(
        &self,
        flags: BlockGroupFlags,
        size_hint: Option<u64>,
    ) -> Result<ChunkPlacement> {
        let factor = flags.raid_type().factor().max(1);
        let mut st = self.state.lock();
        let unallocated = st.capacity.saturating_sub(st.allocated);
        let length = size_hint
            .or(st.chunk_size)
            .unwrap_or_else(|| Self::default_size(flags))
            .min(unallocated / factor);
        let length = length - length % SZ_1M;
        if length < SZ_1M {
            return Err(FfsError::NoSpace);
        }

        let start = st.next_logical;
        let mut stripes = Vec::with_capacity(usize::try_from(factor).unwrap_or(1));
        for i in 0..factor {
            let devid = if self.num_devices > 1 { i % self.num_devices + 1 } else { 1 };
            stripes.push(DeviceExtent {
                devid: DeviceId(devid),
                physical: st.next_physical,
                length,
            });
            if self.num_devices == 1 {
                st.next_physical += length;
            }
        }
        if self.num_devices > 1 {
            st.next_physical += length;
        }
        st.next_logical += length;
        st.allocated += length * factor;

        let placement = ChunkPlacement {
            start,
            length,
            flags,
            stripes,
        };
        st.chunks.insert(start, placement.clone());
        if let Some(capacity) = st.zone_capacity {
            st.zones.insert(
                start,
                ZoneInfo {
                    alloc_offset: 0,
                    capacity: capacity.min(length),
                },
            );
        }
        Ok(placement)
    }

    fn free_device_extents(&self, placement: &ChunkPlacement) -> Result<()> {
        let mut st = self.state.lock();
        if st.chunks.remove(&placement.start).is_none() {
            return Err(FfsError::NotFound(format!("chunk {}", placement.start)));
        }
        let raw: u64 = placement.stripes.iter().map(|s| s.length).sum();
        st.allocated = st.allocated.saturating_sub(raw);
        st.zones.remove(&placement.start);
        Ok(())
    }

    fn find_chunk(&self, start: u64) -> Option<ChunkPlacement> {
        self.state.lock().chunks.get(&start).cloned()
    }

    fn chunks(&self) -> Vec<ChunkPlacement> {
        self.state.lock().chunks.values().cloned().collect()
    }

    fn rw_devices(&self) -> u64 {
        self.num_devices
    }

    fn total_bytes(&self) -> u64 {
        self.state.lock().capacity
    }

    fn unallocated_bytes(&self) -> u64 {
        let st = self.state.lock();
        st.capacity.saturating_sub(st.allocated)
    }

    fn is_writeable(&self, start: u64) -> bool {
        !self.state.lock().unwritable.contains(&start)
    }

    fn zone_info(&self, start: u64) -> Option<ZoneInfo> {
        self.state.lock().zones.get(&start).copied()
    }

    fn finish_zone(&self, start: u64) -> Result<()> {
        self.state.lock().finished_zones.insert(start);
        Ok(())
    }
}

// ── Discard scheduler ───────────────────────────────────────────────────────

/// Records discard requests; trimming completes when the test says so.
#[derive(Debug, Default)]
pub struct MemDiscard {
    queued: Mutex<BTreeSet<u64>>,
    trimmed_removed: Mutex<Vec<u64>>,
}

impl MemDiscard {
    /// Finish the discard of the group at `start`.
    pub fn complete(&self, start: u64) {
        self.queued.lock().remove(&start);
    }

    #[must_use]
    pub fn queued(&self) -> Vec<u64> {
        self.queued.lock().iter().copied().collect()
    }

    /// Starts of removed groups trimmed synchronously.
    #[must_use]
    pub fn trimmed_removed(&self) -> Vec<u64> {
        self.trimmed_removed.lock().clone()
    }
}

impl DiscardScheduler for MemDiscard {
    fn queue_for_discard(&self, group: &Arc<BlockGroup>) {
        self.queued.lock().insert(group.start());
    }

    fn cancel_discard(&self, group: &BlockGroup) {
        self.queued.lock().remove(&group.start());
    }

    fn is_queued(&self, group: &BlockGroup) -> bool {
        self.queued.lock().contains(&group.start())
    }

    fn trim_removed(&self, group: &BlockGroup) -> Result<()> {
        self.trimmed_removed.lock().push(group.start());
        Ok(())
    }
}

// ── Relocator ───────────────────────────────────────────────────────────────

/// Moves the data extents recorded in a [`MemMetadataStore`] to other
/// cached groups of the same family.
#[derive(Debug)]
pub struct MemRelocator {
    store: Arc<MemMetadataStore>,
    fail: AtomicBool,
}

impl MemRelocator {
    #[must_use]
    pub fn new(store: Arc<MemMetadataStore>) -> Self {
        Self {
            store,
            fail: AtomicBool::new(false),
        }
    }

    /// Make every relocation fail with `NoSpace`.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn pick_target(
        manager: &BlockGroupManager,
        group: &Arc<BlockGroup>,
        len: u64,
    ) -> Option<(Arc<BlockGroup>, u64)> {
        manager.registry().snapshot().into_iter().find_map(|bg| {
            if Arc::ptr_eq(&bg, group)
                || !Arc::ptr_eq(bg.space_info(), group.space_info())
                || bg.phase() != GroupPhase::Active
                || !bg.is_cached()
            {
                return None;
            }
            let at = bg.free_space().find_free(len, bg.start())?;
            Some((bg, at))
        })
    }

    fn move_extents(
        &self,
        manager: &BlockGroupManager,
        trans: &TransHandle,
        group: &Arc<BlockGroup>,
    ) -> Result<()> {
        for (start, len) in self.store.extents_in(group.start(), group.end()) {
            let (target, at) = Self::pick_target(manager, group, len).ok_or(FfsError::NoSpace)?;
            manager.reserve_extent(&target, at, len, ReserveOptions::default())?;
            manager.update_on_allocation(trans, at, len, true)?;
            manager.update_on_allocation(trans, start, len, false)?;
            self.store.remove(&BtrfsKey::extent(start, len));
            self.store.add_extent(at, len);
        }
        Ok(())
    }
}

impl Relocator for MemRelocator {
    fn relocate(&self, manager: &BlockGroupManager, group: &Arc<BlockGroup>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FfsError::NoSpace);
        }
        let tm = &manager.collab.transactions;
        let trans = tm.join()?;
        let result = self.move_extents(manager, &trans, group);
        let ended = tm.end(&trans);
        result?;
        ended
    }
}

// ── Fixture ─────────────────────────────────────────────────────────────────

/// A manager wired to in-memory collaborators.
pub struct MemFixture {
    pub manager: Arc<BlockGroupManager>,
    pub store: Arc<MemMetadataStore>,
    pub transactions: Arc<MemTransactionManager>,
    pub chunks: Arc<MemChunkAllocator>,
    pub discard: Arc<MemDiscard>,
    pub relocator: Arc<MemRelocator>,
    config: AllocConfig,
    work_queue: Arc<dyn WorkQueue>,
}

impl MemFixture {
    /// Default configuration, 100 GiB of device space, inline work queue.
    ///
    /// # Panics
    ///
    /// Never with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AllocConfig::default())
    }

    /// # Panics
    ///
    /// If `config` does not validate.
    #[must_use]
    pub fn with_config(config: AllocConfig) -> Self {
        Self::build(config, 100 * SZ_1G, Arc::new(InlineQueue))
            .unwrap_or_else(|err| panic!("fixture setup failed: {err}"))
    }

    /// # Panics
    ///
    /// Never with the default configuration.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self::build(AllocConfig::default(), capacity, Arc::new(InlineQueue))
            .unwrap_or_else(|err| panic!("fixture setup failed: {err}"))
    }

    /// Fully specified fixture on `capacity` bytes of a single device.
    pub fn build(
        config: AllocConfig,
        capacity: u64,
        work_queue: Arc<dyn WorkQueue>,
    ) -> Result<Self> {
        let store = Arc::new(MemMetadataStore::new());
        let transactions = Arc::new(MemTransactionManager::new(1));
        let chunks = Arc::new(MemChunkAllocator::new(capacity));
        let discard = Arc::new(MemDiscard::default());
        let relocator = Arc::new(MemRelocator::new(Arc::clone(&store)));
        let manager = BlockGroupManager::new(
            config.clone(),
            Self::collaborators(&store, &transactions, &chunks, &discard, &relocator, &work_queue),
        )?;
        Ok(Self {
            manager,
            store,
            transactions,
            chunks,
            discard,
            relocator,
            config,
            work_queue,
        })
    }

    fn collaborators(
        store: &Arc<MemMetadataStore>,
        transactions: &Arc<MemTransactionManager>,
        chunks: &Arc<MemChunkAllocator>,
        discard: &Arc<MemDiscard>,
        relocator: &Arc<MemRelocator>,
        work_queue: &Arc<dyn WorkQueue>,
    ) -> Collaborators {
        Collaborators {
            store: Arc::clone(store) as Arc<dyn MetadataStore>,
            transactions: Arc::clone(transactions) as Arc<dyn TransactionManager>,
            chunks: Arc::clone(chunks) as Arc<dyn ChunkAllocator>,
            discard: Arc::clone(discard) as Arc<dyn DiscardScheduler>,
            relocator: Arc::clone(relocator) as Arc<dyn Relocator>,
            work_queue: Arc::clone(work_queue),
            free_space_factory: RangeFreeSpace::boxed,
        }
    }

    /// Mount a fresh manager over the same store and devices, as after a
    /// clean unmount.
    pub fn remount(&self) -> Result<Self> {
        let transactions = Arc::new(MemTransactionManager::new(
            self.transactions.generation().0,
        ));
        let manager = BlockGroupManager::mount(
            self.config.clone(),
            Self::collaborators(
                &self.store,
                &transactions,
                &self.chunks,
                &self.discard,
                &self.relocator,
                &self.work_queue,
            ),
        )?;
        Ok(Self {
            manager,
            store: Arc::clone(&self.store),
            transactions,
            chunks: Arc::clone(&self.chunks),
            discard: Arc::clone(&self.discard),
            relocator: Arc::clone(&self.relocator),
            config: self.config.clone(),
            work_queue: Arc::clone(&self.work_queue),
        })
    }

    pub fn try_commit(&self) -> Result<()> {
        self.transactions.commit(&self.manager)
    }

    /// # Panics
    ///
    /// If the commit fails.
    pub fn commit(&self) {
        if let Err(err) = self.try_commit() {
            panic!("commit failed: {err}");
        }
    }

    /// Complete the queued discard of `bg` the way a discard worker does.
    pub fn finish_discard(&self, bg: &Arc<BlockGroup>) {
        self.discard.complete(bg.start());
        self.manager.discard_finished(bg);
    }

    /// Reserve and allocate `len` bytes in `bg` within the running
    /// transaction, recording the extent. Returns its start.
    pub fn allocate(&self, bg: &Arc<BlockGroup>, len: u64) -> Result<u64> {
        let at = self.manager.find_and_reserve(bg, len, ReserveOptions::default())?;
        self.manager
            .update_on_allocation(&self.transactions.current(), at, len, true)?;
        self.store.add_extent(at, len);
        Ok(at)
    }

    /// Free an extent made by [`allocate`](Self::allocate).
    pub fn free(&self, bytenr: u64, len: u64) -> Result<()> {
        self.manager
            .update_on_allocation(&self.transactions.current(), bytenr, len, false)?;
        self.store.remove(&BtrfsKey::extent(bytenr, len));
        Ok(())
    }
}

impl Default for MemFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemFixture")
            .field("manager", &self.manager)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
