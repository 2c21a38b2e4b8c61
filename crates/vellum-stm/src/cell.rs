//! Versioned transactional cells.
//!
//! A [`TCell`] holds a history of `(stamp, value)` entries, a write-lock
//! flag naming the committing transaction that owns its publication slot,
//! and weak back-references to the conditional watchers whose predicate
//! read it last. The typed wrapper erases values to
//! `Arc<dyn Any + Send + Sync>` so the engine can treat heterogeneous
//! cells uniformly; identity is the allocated [`CellId`], never the value.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use vellum_error::Result;
use vellum_types::{CellId, Stamp, TxnId, WatcherId};

use crate::runtime;
use crate::txn::{self, ApplyFn, DynValue};
use crate::watch::WatcherCore;

/// One committed history entry.
pub(crate) struct Version {
    pub(crate) stamp: Stamp,
    pub(crate) value: DynValue,
}

/// The untyped shared state behind a [`TCell`].
pub(crate) struct CellCore {
    id: CellId,
    /// History entries in ascending stamp order. Never empty: index 0 is
    /// the oldest retained entry, the last is the newest committed value.
    history: RwLock<Vec<Version>>,
    /// Raw id of the transaction holding the write lock, or 0 when free.
    /// Held only across commit validation and publication.
    writer: AtomicU64,
    /// Watchers whose predicate read this cell on its last evaluation.
    watchers: Mutex<SmallVec<[(WatcherId, Weak<WatcherCore>); 2]>>,
}

impl CellCore {
    pub(crate) fn new(initial: DynValue) -> Arc<Self> {
        Arc::new(Self {
            id: runtime::alloc_cell_id(),
            history: RwLock::new(vec![Version {
                stamp: Stamp::ZERO,
                value: initial,
            }]),
            writer: AtomicU64::new(0),
            watchers: Mutex::new(SmallVec::new()),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    /// Try to take the write lock for `txn`. Non-waiting.
    pub(crate) fn try_lock_writer(&self, txn: TxnId) -> bool {
        self.writer
            .compare_exchange(0, txn.get(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take the write lock for `txn`, waiting out the current holder.
    ///
    /// Used only for commute-only publication, where serializing behind
    /// the holder is correct and aborting would forfeit the no-conflict
    /// property.
    pub(crate) fn lock_writer_waiting(&self, txn: TxnId) {
        while !self.try_lock_writer(txn) {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Release the write lock held by `txn`.
    pub(crate) fn unlock_writer(&self, txn: TxnId) {
        let prev = self.writer.swap(0, Ordering::AcqRel);
        debug_assert_eq!(prev, txn.get(), "write lock released by non-holder");
    }

    /// Whether a transaction other than `txn` holds the write lock.
    pub(crate) fn locked_by_other(&self, txn: TxnId) -> bool {
        let holder = self.writer.load(Ordering::Acquire);
        holder != 0 && holder != txn.get()
    }

    /// Stamp of the newest committed entry.
    pub(crate) fn newest_stamp(&self) -> Stamp {
        self.history
            .read()
            .last()
            .expect("cell history is never empty")
            .stamp
    }

    /// Newest committed value, regardless of any snapshot.
    pub(crate) fn latest_value(&self) -> DynValue {
        self.history
            .read()
            .last()
            .expect("cell history is never empty")
            .value
            .clone()
    }

    /// The newest value with stamp at or below `stamp`, as seen by
    /// transaction `reader`.
    ///
    /// If another transaction holds the write lock its commit stamp is
    /// already assigned but its entry may not be appended yet, so the
    /// read waits for the flag to clear before selecting. The flag spans
    /// only validation and publication, never user code.
    pub(crate) fn read_at(&self, stamp: Stamp, reader: TxnId) -> DynValue {
        loop {
            {
                let history = self.history.read();
                let holder = self.writer.load(Ordering::Acquire);
                if holder == 0 || holder == reader.get() {
                    let idx = history.partition_point(|v| v.stamp <= stamp);
                    assert!(
                        idx > 0,
                        "{}: history pruned below active read stamp {stamp}",
                        self.id
                    );
                    return history[idx - 1].value.clone();
                }
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Append a committed entry and prune everything unreachable below
    /// `horizon`. Caller holds the write lock.
    pub(crate) fn publish(&self, stamp: Stamp, value: DynValue, horizon: Stamp) {
        let mut history = self.history.write();
        let newest = history.last().expect("cell history is never empty").stamp;
        assert!(
            newest < stamp,
            "{}: commit stamp {stamp} not newer than history head {newest}",
            self.id
        );
        history.push(Version { stamp, value });
        // Keep the newest entry at or below the horizon; everything older
        // is invisible to every live and future snapshot.
        let cut = history.partition_point(|v| v.stamp <= horizon);
        if cut > 1 {
            history.drain(0..cut - 1);
        }
    }

    /// Number of retained history entries.
    pub(crate) fn history_depth(&self) -> usize {
        self.history.read().len()
    }

    /// Register a watcher dependency on this cell.
    pub(crate) fn attach_watcher(&self, id: WatcherId, watcher: Weak<WatcherCore>) {
        let mut watchers = self.watchers.lock();
        if !watchers.iter().any(|(wid, _)| *wid == id) {
            watchers.push((id, watcher));
        }
    }

    /// Drop a watcher dependency.
    pub(crate) fn detach_watcher(&self, id: WatcherId) {
        self.watchers.lock().retain(|(wid, _)| *wid != id);
    }

    /// Collect the live watchers of this cell into `out`, deduplicating
    /// by watcher id and pruning dead back-references in passing.
    pub(crate) fn collect_watchers(&self, out: &mut Vec<Arc<WatcherCore>>) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|(id, weak)| match weak.upgrade() {
            Some(watcher) => {
                if !out.iter().any(|w| w.id() == *id) {
                    out.push(watcher);
                }
                true
            }
            None => false,
        });
    }
}

impl std::fmt::Debug for CellCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellCore")
            .field("id", &self.id)
            .field("history_depth", &self.history.read().len())
            .field("writer", &self.writer.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A transactional memory cell.
///
/// Cloning a `TCell` clones the handle, not the value: all clones name the
/// same cell. Values are stored behind `Arc`, so `T` should be cheap to
/// clone or wrapped accordingly by the caller.
pub struct TCell<T> {
    core: Arc<CellCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TCell<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TCell").field("id", &self.core.id()).finish()
    }
}

fn downcast<T: Clone + 'static>(value: &DynValue) -> T {
    value
        .downcast_ref::<T>()
        .expect("cell value downcast to its declared type")
        .clone()
}

/// Outcome of the staged-state lookup performed at the top of a read.
enum ReadPath {
    /// The cell has a tentative value in the write set.
    Tentative(DynValue),
    /// The cell has pending commutes; materialize them against the
    /// snapshot value.
    Materialize {
        pending: Vec<ApplyFn>,
        read_stamp: Stamp,
        reader: TxnId,
    },
    /// Plain snapshot read.
    Snapshot { read_stamp: Stamp, reader: TxnId },
}

impl<T: Clone + Send + Sync + 'static> TCell<T> {
    /// Create a cell holding `initial` at stamp 0.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            core: CellCore::new(Arc::new(initial)),
            _marker: PhantomData,
        }
    }

    /// Read the cell inside the current transaction.
    ///
    /// Returns the tentative value if this transaction already wrote the
    /// cell (reads observe their own writes); otherwise records the read
    /// and returns the newest committed value at or below the
    /// transaction's read stamp. Pending commutes on the cell are
    /// materialized first, which downgrades them to an ordinary
    /// read-modify-write.
    ///
    /// # Errors
    ///
    /// [`StmError::NoTransaction`] outside an atomic block;
    /// [`StmError::CommuteCellAccess`] inside a commute function.
    pub fn read(&self) -> Result<T> {
        let path = txn::with_active(|ctx| {
            if let Some(entry) = ctx.writes.get(&self.core.id()) {
                return ReadPath::Tentative(entry.value.clone());
            }
            let pending = ctx.take_commutes_for(self.core.id());
            if pending.is_empty() {
                ReadPath::Snapshot {
                    read_stamp: ctx.read_stamp,
                    reader: ctx.id,
                }
            } else {
                ReadPath::Materialize {
                    pending,
                    read_stamp: ctx.read_stamp,
                    reader: ctx.id,
                }
            }
        })?;

        match path {
            ReadPath::Tentative(value) => Ok(downcast(&value)),
            ReadPath::Snapshot { read_stamp, reader } => {
                let value = self.core.read_at(read_stamp, reader);
                txn::with_active(|ctx| ctx.record_read(Arc::clone(&self.core)))?;
                Ok(downcast(&value))
            }
            ReadPath::Materialize {
                pending,
                read_stamp,
                reader,
            } => {
                let base = self.core.read_at(read_stamp, reader);
                let value = txn::with_commute_guard(|| {
                    pending.into_iter().fold(base, |cur, apply| apply(&cur))
                });
                txn::with_active(|ctx| {
                    ctx.record_write(Arc::clone(&self.core), value.clone(), true);
                })?;
                Ok(downcast(&value))
            }
        }
    }

    /// Write a tentative value inside the current transaction.
    ///
    /// Becomes visible to other transactions only if the commit succeeds.
    /// Discards any pending commutes on the cell.
    ///
    /// # Errors
    ///
    /// See [`TCell::read`].
    pub fn write(&self, value: T) -> Result<()> {
        let value: DynValue = Arc::new(value);
        txn::with_active(|ctx| ctx.record_write(Arc::clone(&self.core), value, false))
    }

    /// Read-modify-write. Conflicts at commit with any other writer of
    /// this cell.
    ///
    /// # Errors
    ///
    /// See [`TCell::read`].
    pub fn modify(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        let mut value = self.read()?;
        f(&mut value);
        self.write(value)
    }

    /// Queue a commutative update.
    ///
    /// `f` must be associative and commutative with itself and must not
    /// touch any other transactional state: it is applied to the live
    /// value at publication time, under the cell's lock. Transactions
    /// that only commute a cell never conflict with each other on it.
    ///
    /// If this transaction already read or wrote the cell the update is
    /// applied immediately as an ordinary read-modify-write, and the
    /// no-conflict property is lost.
    ///
    /// # Errors
    ///
    /// See [`TCell::read`].
    pub fn commute(&self, f: impl FnOnce(&mut T) + 'static) -> Result<()> {
        let staged = txn::with_active(|ctx| ctx.is_staged(self.core.id()))?;
        if staged {
            let mut value = self.read()?;
            txn::with_commute_guard(|| f(&mut value));
            return self.write(value);
        }
        let apply: ApplyFn = Box::new(move |cur: &DynValue| -> DynValue {
            let mut value = downcast::<T>(cur);
            f(&mut value);
            Arc::new(value)
        });
        txn::with_active(|ctx| ctx.record_commute(Arc::clone(&self.core), apply))
    }

    /// Unsynchronized snapshot of the newest committed value.
    ///
    /// Does not require or register with a transaction; intended for
    /// display and diagnostics. Inside a transaction it deliberately
    /// bypasses the snapshot and the write set.
    #[must_use]
    pub fn latest(&self) -> T {
        downcast(&self.core.latest_value())
    }

    /// This cell's stable identity.
    #[must_use]
    pub fn id(&self) -> CellId {
        self.core.id()
    }

    /// Number of history entries currently retained (diagnostics).
    #[must_use]
    pub fn history_depth(&self) -> usize {
        self.core.history_depth()
    }
}
