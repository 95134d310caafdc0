#![forbid(unsafe_code)]
//! Transaction seam.
//!
//! The transaction manager itself is external; this module defines the
//! per-transaction state the allocator hangs off a running transaction
//! (dirty groups, groups created in it, groups deleted in it, extents
//! pinned by frees) and the [`TransactionManager`] contract.

use crate::block_group::BlockGroup;
use ffs_error::{FfsError, Result};
use ffs_types::{Generation, TxnId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type TransHandle = Arc<Transaction>;

/// Allocator-visible state of one running transaction.
pub struct Transaction {
    id: TxnId,
    dirty_bgs: Mutex<Vec<Arc<BlockGroup>>>,
    new_bgs: Mutex<Vec<Arc<BlockGroup>>>,
    deleted_bgs: Mutex<Vec<Arc<BlockGroup>>>,
    /// start -> len of extents freed in this transaction.
    pinned: Mutex<BTreeMap<u64, u64>>,
    dirty_bg_run: AtomicBool,
    aborted: Mutex<Option<String>>,
}

impl Transaction {
    #[must_use]
    pub fn new(id: TxnId) -> TransHandle {
        Arc::new(Self {
            id,
            dirty_bgs: Mutex::new(Vec::new()),
            new_bgs: Mutex::new(Vec::new()),
            deleted_bgs: Mutex::new(Vec::new()),
            pinned: Mutex::new(BTreeMap::new()),
            dirty_bg_run: AtomicBool::new(false),
            aborted: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub(crate) fn push_dirty(&self, bg: Arc<BlockGroup>) {
        self.dirty_bgs.lock().push(bg);
    }

    pub(crate) fn take_dirty(&self) -> Vec<Arc<BlockGroup>> {
        std::mem::take(&mut *self.dirty_bgs.lock())
    }

    pub(crate) fn forget_dirty(&self, start: u64) {
        self.dirty_bgs.lock().retain(|bg| bg.start() != start);
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty_bgs.lock().len()
    }

    pub(crate) fn push_new(&self, bg: Arc<BlockGroup>) {
        self.new_bgs.lock().push(bg);
    }

    pub(crate) fn take_new(&self) -> Vec<Arc<BlockGroup>> {
        std::mem::take(&mut *self.new_bgs.lock())
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.new_bgs.lock().len()
    }

    pub(crate) fn push_deleted(&self, bg: Arc<BlockGroup>) {
        self.deleted_bgs.lock().push(bg);
    }

    pub(crate) fn take_deleted(&self) -> Vec<Arc<BlockGroup>> {
        std::mem::take(&mut *self.deleted_bgs.lock())
    }

    /// Record `[start, start + len)` as freed in this transaction.
    ///
    /// A range overlapping one already pinned is a double free.
    pub(crate) fn pin(&self, start: u64, len: u64) -> Result<()> {
        let mut pinned = self.pinned.lock();
        if let Some((&s, &l)) = pinned.range(..start + len).next_back() {
            if s + l > start {
                return Err(FfsError::Corruption {
                    start,
                    detail: format!(
                        "[{start}, {}) freed twice: overlaps pinned [{s}, {})",
                        start + len,
                        s + l
                    ),
                });
            }
        }
        pinned.insert(start, len);
        Ok(())
    }

    pub(crate) fn take_pinned(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut *self.pinned.lock()).into_iter().collect()
    }

    /// Pinned extents inside `[start, end)`.
    #[must_use]
    pub fn pinned_in(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.pinned
            .lock()
            .range(start..end)
            .map(|(s, l)| (*s, *l))
            .collect()
    }

    /// Drop pinned records inside `[start, end)`, returning the bytes dropped.
    pub(crate) fn clear_pinned_in(&self, start: u64, end: u64) -> u64 {
        let mut pinned = self.pinned.lock();
        let doomed: Vec<u64> = pinned.range(start..end).map(|(s, _)| *s).collect();
        doomed.iter().filter_map(|s| pinned.remove(s)).sum()
    }

    /// Mark the dirty-group writeout phase of the commit as running.
    pub fn set_dirty_bg_run(&self, running: bool) {
        self.dirty_bg_run.store(running, Ordering::Release);
    }

    #[must_use]
    pub fn dirty_bg_running(&self) -> bool {
        self.dirty_bg_run.load(Ordering::Acquire)
    }

    pub fn mark_aborted(&self, reason: &str) {
        let mut aborted = self.aborted.lock();
        if aborted.is_none() {
            *aborted = Some(reason.to_owned());
        }
    }

    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        self.aborted.lock().clone()
    }

    /// Fail with `TransactionAborted` if this transaction was aborted.
    pub fn check_aborted(&self) -> Result<()> {
        match self.abort_reason() {
            Some(reason) => Err(FfsError::TransactionAborted(reason)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("dirty", &self.dirty_bgs.lock().len())
            .field("new", &self.new_bgs.lock().len())
            .field("pinned", &self.pinned.lock().len())
            .field("aborted", &self.aborted.lock().is_some())
            .finish()
    }
}

/// External transaction manager.
///
/// At commit the manager calls back into
/// [`BlockGroupManager::run_commit_hooks`](crate::BlockGroupManager::run_commit_hooks)
/// before persisting, and
/// [`BlockGroupManager::finish_transaction`](crate::BlockGroupManager::finish_transaction)
/// after the commit is durable.
pub trait TransactionManager: Send + Sync + fmt::Debug {
    /// Start a transaction that may reserve new metadata space.
    fn start(&self) -> Result<TransHandle>;

    /// Join the running transaction, starting one if none is running.
    fn join(&self) -> Result<TransHandle>;

    /// Release the caller's hold on `trans`.
    fn end(&self, trans: &TransHandle) -> Result<()>;

    /// Abort `trans`; the filesystem goes read-only.
    fn abort(&self, trans: &TransHandle, err: &FfsError);

    /// Generation of the last committed transaction.
    fn generation(&self) -> Generation;

    /// Block until transaction `id` has committed.
    fn wait_for_commit(&self, id: TxnId) -> Result<()>;

    /// The previous transaction if it is still committing.
    fn previous(&self, _trans: &TransHandle) -> Option<TransHandle> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_ranges_are_scoped() {
        let trans = Transaction::new(TxnId(3));
        trans.pin(100, 10).unwrap();
        trans.pin(200, 10).unwrap();
        trans.pin(300, 10).unwrap();
        assert_eq!(trans.pinned_in(150, 301), vec![(200, 10), (300, 10)]);
        assert_eq!(trans.clear_pinned_in(150, 250), 10);
        assert_eq!(trans.take_pinned(), vec![(100, 10), (300, 10)]);
        assert!(trans.take_pinned().is_empty());
    }

    #[test]
    fn overlapping_pin_is_rejected() {
        let trans = Transaction::new(TxnId(4));
        trans.pin(100, 10).unwrap();
        assert!(matches!(
            trans.pin(100, 20),
            Err(FfsError::Corruption { start: 100, .. })
        ));
        assert!(matches!(
            trans.pin(95, 10),
            Err(FfsError::Corruption { start: 95, .. })
        ));
        // Adjacent ranges are separate frees.
        trans.pin(110, 5).unwrap();
        assert_eq!(trans.take_pinned(), vec![(100, 10), (110, 5)]);
    }

    #[test]
    fn abort_keeps_first_reason() {
        let trans = Transaction::new(TxnId(1));
        trans.check_aborted().unwrap();
        trans.mark_aborted("item write failed");
        trans.mark_aborted("second");
        assert_eq!(trans.abort_reason().as_deref(), Some("item write failed"));
        assert!(matches!(
            trans.check_aborted(),
            Err(FfsError::TransactionAborted(r)) if r == "item write failed"
        ));
    }

    #[test]
    fn dirty_bg_run_flag() {
        let trans = Transaction::new(TxnId(1));
        assert!(!trans.dirty_bg_running());
        trans.set_dirty_bg_run(true);
        assert!(trans.dirty_bg_running());
    }
}
