//! Process-wide engine state: the version clock, monotonic id allocation,
//! the active-snapshot registry, and the commit sequencer.
//!
//! The clock and the id counters are lock-free atomics. The active-snapshot
//! registry is the one piece of shared mutable bookkeeping: it tracks the
//! read stamp of every in-flight transaction so history pruning knows which
//! versions are still reachable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use vellum_error::{Result, StmError};
use vellum_types::{CellId, Stamp, TxnId, WatcherId};

/// The version clock. Stamp 0 is "before any commit"; the first commit
/// publishes stamp 1.
static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Next transaction id. Ids start at 1; 0 is the free write-lock sentinel.
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Next cell id. Never reused; the total order on cell ids is the commit
/// coordinator's lock-acquisition order.
static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Next watcher id.
static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Read stamps of in-flight transactions, with a count per stamp.
///
/// The minimum key is the GC horizon: no live transaction can select a
/// history entry older than the newest entry at or below it.
static ACTIVE_SNAPSHOTS: Mutex<BTreeMap<u64, u32>> = Mutex::new(BTreeMap::new());

/// Serializes the lock/validate/stamp/publish section of every writing
/// commit. Validation and publication must be atomic with respect to each
/// other, otherwise two transactions that each read what the other writes
/// could both pass validation and publish a non-serializable pair.
static COMMIT_SEQUENCER: Mutex<()> = Mutex::new(());

/// The current value of the version clock.
///
/// This is the stamp a transaction starting now would read at.
#[must_use]
pub fn current_stamp() -> Stamp {
    Stamp::new(CLOCK.load(Ordering::Acquire))
}

/// Advance the clock and return the new stamp.
///
/// Called only by the commit coordinator, under the commit sequencer, so
/// successful commits observe strictly increasing stamps.
pub(crate) fn tick() -> Stamp {
    Stamp::new(CLOCK.fetch_add(1, Ordering::AcqRel) + 1)
}

/// Allocate the next transaction id via a CAS loop.
///
/// The counter only ever increases, so ids are strictly increasing and a
/// write-lock slot can never confuse two holders.
pub(crate) fn alloc_txn_id() -> Result<TxnId> {
    loop {
        let current = NEXT_TXN_ID.load(Ordering::Acquire);
        let next = current.checked_add(1).ok_or(StmError::TxnIdExhausted)?;
        if NEXT_TXN_ID
            .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return TxnId::new(current).ok_or(StmError::TxnIdExhausted);
        }
        // CAS lost to another thread; retry.
    }
}

/// Allocate a fresh cell id.
pub(crate) fn alloc_cell_id() -> CellId {
    CellId::new(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
}

/// Allocate a fresh watcher id.
pub(crate) fn alloc_watcher_id() -> WatcherId {
    WatcherId::new(NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Register a new transaction's snapshot and return its read stamp.
///
/// The clock is read while the registry lock is held: otherwise a commit
/// could compute a GC horizon between our clock read and our registration
/// and prune history entries the new snapshot is about to depend on.
pub(crate) fn register_snapshot() -> Stamp {
    let mut active = ACTIVE_SNAPSHOTS.lock();
    let stamp = CLOCK.load(Ordering::Acquire);
    *active.entry(stamp).or_insert(0) += 1;
    Stamp::new(stamp)
}

/// Drop a transaction's snapshot registration.
pub(crate) fn release_snapshot(stamp: Stamp) {
    let mut active = ACTIVE_SNAPSHOTS.lock();
    let raw = stamp.get();
    match active.get_mut(&raw) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            active.remove(&raw);
        }
        None => debug_assert!(false, "released snapshot {stamp} was not registered"),
    }
}

/// The pruning horizon: the oldest read stamp any live transaction holds,
/// or the clock value when no transaction is in flight.
///
/// Every history entry strictly older than the newest entry at or below
/// the horizon is unreachable and may be pruned.
pub(crate) fn gc_horizon() -> Stamp {
    let active = ACTIVE_SNAPSHOTS.lock();
    match active.keys().next() {
        Some(&oldest) => Stamp::new(oldest),
        None => current_stamp(),
    }
}

/// The commit sequencer mutex.
pub(crate) fn commit_sequencer() -> &'static Mutex<()> {
    &COMMIT_SEQUENCER
}
