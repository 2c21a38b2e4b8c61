//! Per-thread transaction context.
//!
//! A context captures one attempt of an atomic block: the read stamp, the
//! read set, the write set (tentative values), the pending commute queue,
//! and the deferred side-effect queues. It lives in thread-local storage
//! for the duration of the attempt; cell operations look it up and fail
//! with [`StmError::NoTransaction`] when none is installed.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use vellum_error::{Result, StmError};
use vellum_types::{CellId, Stamp, TxnId, TxnState};

use crate::cell::CellCore;

/// A committed or tentative cell value, type-erased.
///
/// The typed [`TCell`](crate::TCell) wrapper is the only constructor, so a
/// downcast back to `T` can only fail on engine corruption.
pub(crate) type DynValue = Arc<dyn Any + Send + Sync>;

/// A queued commute function: current value in, replacement value out.
pub(crate) type ApplyFn = Box<dyn FnOnce(&DynValue) -> DynValue>;

/// A deferred side-effect callback.
pub(crate) type EffectFn = Box<dyn FnOnce()>;

/// A tentative write buffered in the context.
pub(crate) struct WriteEntry {
    pub(crate) cell: Arc<CellCore>,
    pub(crate) value: DynValue,
    /// Whether the cell was read before (or while) being written. Such
    /// entries are stamp-validated at commit like plain reads; blind
    /// writes are not.
    pub(crate) validate_stamp: bool,
}

/// A pending commute on a cell that the transaction has not read or
/// written. Applied against the live value at publication time.
pub(crate) struct CommuteEntry {
    pub(crate) cell: Arc<CellCore>,
    pub(crate) apply: ApplyFn,
}

/// One attempt of an atomic block.
pub(crate) struct TxnCtx {
    pub(crate) id: TxnId,
    pub(crate) read_stamp: Stamp,
    pub(crate) state: TxnState,
    /// Cells read but not written.
    pub(crate) reads: HashMap<CellId, Arc<CellCore>>,
    /// Cells written (possibly also read first).
    pub(crate) writes: HashMap<CellId, WriteEntry>,
    /// Pending commutes, in registration order.
    pub(crate) commutes: SmallVec<[CommuteEntry; 4]>,
    /// Commit-time callbacks, FIFO.
    pub(crate) on_commit: Vec<EffectFn>,
    /// Rollback-time callbacks, FIFO.
    pub(crate) on_rollback: Vec<EffectFn>,
}

impl TxnCtx {
    pub(crate) fn new(id: TxnId, read_stamp: Stamp) -> Self {
        Self {
            id,
            read_stamp,
            state: TxnState::Active,
            reads: HashMap::new(),
            writes: HashMap::new(),
            commutes: SmallVec::new(),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    /// Record a read of `cell` (unless it is already staged).
    pub(crate) fn record_read(&mut self, cell: Arc<CellCore>) {
        let id = cell.id();
        if self.writes.contains_key(&id) {
            return;
        }
        self.reads.entry(id).or_insert(cell);
    }

    /// Buffer a tentative value for `cell`.
    ///
    /// Promotes the cell out of the read set (keeping it stamp-validated)
    /// and discards any still-pending commutes on it: a direct write
    /// determines the cell's value regardless of queued updates.
    pub(crate) fn record_write(&mut self, cell: Arc<CellCore>, value: DynValue, validate: bool) {
        let id = cell.id();
        if let Some(entry) = self.writes.get_mut(&id) {
            entry.value = value;
            entry.validate_stamp |= validate;
            return;
        }
        let promoted = self.reads.remove(&id).is_some();
        self.commutes.retain(|entry| entry.cell.id() != id);
        self.writes.insert(
            id,
            WriteEntry {
                cell,
                value,
                validate_stamp: promoted || validate,
            },
        );
    }

    /// Queue a commute on a cell that is in neither the read nor the
    /// write set.
    pub(crate) fn record_commute(&mut self, cell: Arc<CellCore>, apply: ApplyFn) {
        debug_assert!(
            !self.is_staged(cell.id()),
            "commute queued for a staged cell"
        );
        self.commutes.push(CommuteEntry { cell, apply });
    }

    /// Whether the cell is in the read or write set.
    pub(crate) fn is_staged(&self, id: CellId) -> bool {
        self.reads.contains_key(&id) || self.writes.contains_key(&id)
    }

    /// Remove and return the pending commute functions for `id`, in
    /// registration order. Reading a commuted cell materializes them.
    pub(crate) fn take_commutes_for(&mut self, id: CellId) -> Vec<ApplyFn> {
        let mut taken = Vec::new();
        let mut remaining = SmallVec::new();
        for entry in self.commutes.drain(..) {
            if entry.cell.id() == id {
                taken.push(entry.apply);
            } else {
                remaining.push(entry);
            }
        }
        self.commutes = remaining;
        taken
    }

    /// Drain pending commutes grouped by cell, preserving per-cell order.
    ///
    /// Every returned cell is commute-only: it appears in neither the read
    /// nor the write set.
    pub(crate) fn drain_commute_groups(&mut self) -> Vec<(Arc<CellCore>, Vec<ApplyFn>)> {
        let mut groups: Vec<(Arc<CellCore>, Vec<ApplyFn>)> = Vec::new();
        for entry in self.commutes.drain(..) {
            match groups.iter_mut().find(|(cell, _)| cell.id() == entry.cell.id()) {
                Some((_, fns)) => fns.push(entry.apply),
                None => groups.push((entry.cell, vec![entry.apply])),
            }
        }
        groups
    }

    /// Run the rollback callbacks in FIFO order.
    pub(crate) fn run_rollback_effects(&mut self) {
        for effect in self.on_rollback.drain(..) {
            effect();
        }
        self.on_commit.clear();
    }

    /// Run the commit callbacks in FIFO order.
    pub(crate) fn run_commit_effects(&mut self) {
        for effect in self.on_commit.drain(..) {
            effect();
        }
        self.on_rollback.clear();
    }
}

thread_local! {
    /// The transaction currently bound to this thread, if any.
    static ACTIVE: RefCell<Option<TxnCtx>> = const { RefCell::new(None) };

    /// Set while a commute function is being materialized on this thread.
    /// Commute functions are cell-local; any cell access under this flag
    /// is a contract violation.
    static COMMUTE_GUARD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is inside an atomic block.
#[must_use]
pub fn is_in_transaction() -> bool {
    ACTIVE.with(|slot| slot.borrow().is_some())
}

/// Run `f` against the installed context, or fail.
pub(crate) fn with_active<R>(f: impl FnOnce(&mut TxnCtx) -> R) -> Result<R> {
    if COMMUTE_GUARD.with(Cell::get) {
        return Err(StmError::CommuteCellAccess);
    }
    ACTIVE.with(|slot| match slot.borrow_mut().as_mut() {
        Some(ctx) => Ok(f(ctx)),
        None => Err(StmError::NoTransaction),
    })
}

/// Install a fresh context on this thread.
pub(crate) fn install(ctx: TxnCtx) {
    ACTIVE.with(|slot| {
        let prev = slot.borrow_mut().replace(ctx);
        debug_assert!(prev.is_none(), "installed over a live transaction context");
    });
}

/// Remove the installed context, if any.
pub(crate) fn take() -> Option<TxnCtx> {
    ACTIVE.with(|slot| slot.borrow_mut().take())
}

/// Run `f` with the commute guard raised. The guard drops on unwind so a
/// panicking commute function cannot poison the thread.
pub(crate) fn with_commute_guard<R>(f: impl FnOnce() -> R) -> R {
    struct Lower;
    impl Drop for Lower {
        fn drop(&mut self) {
            COMMUTE_GUARD.with(|flag| flag.set(false));
        }
    }
    COMMUTE_GUARD.with(|flag| flag.set(true));
    let _lower = Lower;
    f()
}

/// Enqueue a commit-time side effect on the current transaction.
///
/// The callback runs after the commit publishes and releases its locks,
/// before `atomically` returns. If the attempt aborts for any reason the
/// callback is discarded.
///
/// # Errors
///
/// Fails with [`StmError::NoTransaction`] outside an atomic block.
pub fn side_effect(on_commit: impl FnOnce() + 'static) -> Result<()> {
    with_active(|ctx| ctx.on_commit.push(Box::new(on_commit)))
}

/// Enqueue paired commit/rollback side effects on the current transaction.
///
/// Exactly one of the two callbacks eventually runs for this attempt: the
/// commit callback after a successful publish, the rollback callback when
/// the attempt aborts on a user error or a commit conflict. Callbacks run
/// in registration (FIFO) order.
///
/// # Errors
///
/// Fails with [`StmError::NoTransaction`] outside an atomic block.
pub fn side_effect_with_rollback(
    on_commit: impl FnOnce() + 'static,
    on_rollback: impl FnOnce() + 'static,
) -> Result<()> {
    with_active(|ctx| {
        ctx.on_commit.push(Box::new(on_commit));
        ctx.on_rollback.push(Box::new(on_rollback));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx() -> TxnCtx {
        TxnCtx::new(TxnId::new(1).expect("nonzero"), Stamp::ZERO)
    }

    #[test]
    fn side_effect_outside_transaction_fails() {
        assert!(matches!(
            side_effect(|| {}),
            Err(StmError::NoTransaction)
        ));
        assert!(!is_in_transaction());
    }

    #[test]
    fn install_take_roundtrip() {
        install(test_ctx());
        assert!(is_in_transaction());
        let ctx = take().expect("installed context");
        assert_eq!(ctx.state, TxnState::Active);
        assert!(!is_in_transaction());
    }

    #[test]
    fn commute_guard_blocks_cell_access() {
        install(test_ctx());
        let inside = with_commute_guard(|| side_effect(|| {}));
        assert!(matches!(inside, Err(StmError::CommuteCellAccess)));
        // The guard is scoped: access works again afterwards.
        assert!(side_effect(|| {}).is_ok());
        take();
    }

    #[test]
    fn rollback_effects_run_fifo_and_clear_commit_queue() {
        let order = Arc::new(AtomicUsize::new(0));
        let mut ctx = test_ctx();
        let (a, b) = (order.clone(), order.clone());
        ctx.on_rollback.push(Box::new(move || {
            assert_eq!(a.fetch_add(1, Ordering::SeqCst), 0);
        }));
        ctx.on_rollback.push(Box::new(move || {
            assert_eq!(b.fetch_add(1, Ordering::SeqCst), 1);
        }));
        ctx.on_commit.push(Box::new(|| panic!("commit effect ran on rollback")));
        ctx.run_rollback_effects();
        assert_eq!(order.load(Ordering::SeqCst), 2);
        assert!(ctx.on_commit.is_empty());
    }
}
