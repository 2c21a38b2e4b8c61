//! The commit coordinator.
//!
//! Two-phase commit with optimistic read validation: materialize the
//! commute queue, take write locks in cell-id order, validate the read
//! set, assign the commit stamp, publish, release. The lock/validate/
//! publish section runs under the process-wide commit sequencer so that
//! validation is always against fully-published state.
//!
//! A failed commit is not an error: it yields [`CommitOutcome::Conflict`],
//! which the retry driver consumes. Nothing here ever surfaces to the
//! user block.

use std::fmt;
use std::sync::Arc;

use vellum_types::{CellId, Stamp, TxnState};

use crate::cell::CellCore;
use crate::runtime;
use crate::txn::{ApplyFn, DynValue, TxnCtx};

/// Result of a commit attempt.
pub(crate) enum CommitOutcome {
    /// Writes are published. `stamp` is `None` for a read-only commit,
    /// which neither ticks the clock nor touches any cell.
    Committed {
        stamp: Option<Stamp>,
        /// Cells whose value changed; their watchers need re-evaluation.
        touched: Vec<Arc<CellCore>>,
    },
    /// Validation failed; the attempt must be discarded and re-run.
    Conflict(ConflictCause),
}

/// Why a commit attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictCause {
    /// Another transaction holds the cell's write lock.
    LockBusy(CellId),
    /// The cell was committed to after this transaction's read stamp.
    StaleRead(CellId),
}

impl fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockBusy(id) => write!(f, "write lock busy on {id}"),
            Self::StaleRead(id) => write!(f, "stale read of {id}"),
        }
    }
}

/// What a locked cell is about to receive.
enum Publication {
    /// A buffered tentative value.
    Write { value: DynValue },
    /// Pending commute functions, applied to the live value in order.
    CommuteOnly { fns: Vec<ApplyFn> },
}

/// Attempt to commit `ctx`.
///
/// On conflict every lock taken is released and no cell is modified; the
/// context's side-effect queues are left intact for the rollback dispatch
/// in the retry driver.
pub(crate) fn commit(ctx: &mut TxnCtx) -> CommitOutcome {
    debug_assert_eq!(ctx.state, TxnState::Active, "commit of a non-active context");
    ctx.state = TxnState::Committing;

    let commute_groups = ctx.drain_commute_groups();

    // A transaction that wrote nothing and commuted nothing commits
    // trivially: its reads were taken from a consistent snapshot.
    if ctx.writes.is_empty() && commute_groups.is_empty() {
        ctx.state = TxnState::Committed;
        return CommitOutcome::Committed {
            stamp: None,
            touched: Vec::new(),
        };
    }

    // Lock plan: every written and commute-only cell, in ascending cell-id
    // order. The fixed order keeps the mixed try/wait acquisition below
    // free of lock cycles.
    let mut plan: Vec<(Arc<CellCore>, bool, Publication)> = Vec::with_capacity(
        ctx.writes.len() + commute_groups.len(),
    );
    for (_, entry) in ctx.writes.drain() {
        plan.push((
            entry.cell,
            entry.validate_stamp,
            Publication::Write { value: entry.value },
        ));
    }
    for (cell, fns) in commute_groups {
        plan.push((cell, false, Publication::CommuteOnly { fns }));
    }
    plan.sort_unstable_by_key(|(cell, _, _)| cell.id());

    let sequencer = runtime::commit_sequencer().lock();

    // Phase B: acquire write locks. Write-set locks are non-waiting (a
    // busy lock aborts this attempt, never the holder); commute-only
    // locks wait out the holder, which is what makes concurrent commutes
    // conflict-free.
    let mut acquired = 0usize;
    for (cell, _, publication) in &plan {
        let ok = match publication {
            Publication::Write { .. } => cell.try_lock_writer(ctx.id),
            Publication::CommuteOnly { .. } => {
                cell.lock_writer_waiting(ctx.id);
                true
            }
        };
        if !ok {
            let busy = cell.id();
            release_locks(&plan[..acquired], ctx);
            drop(sequencer);
            return CommitOutcome::Conflict(ConflictCause::LockBusy(busy));
        }
        acquired += 1;
    }

    // Phase C: validate the read set and every read-then-written cell
    // against the read stamp.
    let stale = ctx
        .reads
        .values()
        .find(|cell| {
            cell.locked_by_other(ctx.id) || cell.newest_stamp() > ctx.read_stamp
        })
        .map(|cell| cell.id())
        .or_else(|| {
            plan.iter()
                .filter(|(_, validate, _)| *validate)
                .find(|(cell, _, _)| cell.newest_stamp() > ctx.read_stamp)
                .map(|(cell, _, _)| cell.id())
        });
    if let Some(cell_id) = stale {
        release_locks(&plan[..acquired], ctx);
        drop(sequencer);
        return CommitOutcome::Conflict(ConflictCause::StaleRead(cell_id));
    }

    // Phases D and E: stamp, then publish. Commute-only cells apply their
    // queued functions to the newest committed value, so they absorb every
    // commit that happened since this transaction started.
    let stamp = runtime::tick();
    let horizon = runtime::gc_horizon();
    let mut touched = Vec::with_capacity(plan.len());
    for (cell, _, publication) in plan {
        match publication {
            Publication::Write { value } => cell.publish(stamp, value, horizon),
            Publication::CommuteOnly { fns } => {
                let live = cell.latest_value();
                let value = crate::txn::with_commute_guard(|| {
                    fns.into_iter().fold(live, |cur, apply| apply(&cur))
                });
                cell.publish(stamp, value, horizon);
            }
        }
        touched.push(cell);
    }
    ctx.state = TxnState::Committed;

    // Phase F: release.
    for cell in &touched {
        cell.unlock_writer(ctx.id);
    }
    drop(sequencer);

    tracing::debug!(
        txn_id = %ctx.id,
        stamp = stamp.get(),
        cells = touched.len(),
        "transaction committed"
    );
    CommitOutcome::Committed {
        stamp: Some(stamp),
        touched,
    }
}

fn release_locks(locked: &[(Arc<CellCore>, bool, Publication)], ctx: &TxnCtx) {
    for (cell, _, _) in locked {
        cell.unlock_writer(ctx.id);
    }
}
