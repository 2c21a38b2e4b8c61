//! The retry driver.
//!
//! [`atomically`] wraps a user block in the unbounded optimistic retry
//! loop: fresh context, run, commit; on conflict, discard and re-run
//! after a short deterministic backoff. Conflicts never surface; user
//! errors abort the attempt, fire the rollback effects, and propagate
//! without retrying.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vellum_error::StmError;
use vellum_types::TxnState;

use crate::cell::CellCore;
use crate::commit::{self, CommitOutcome};
use crate::runtime;
use crate::txn::{self, TxnCtx};
use crate::watch;

/// Backoff ladder indexed by (attempt - 1), capped at the last entry.
/// Attempt 1 retries immediately after a yield.
const RETRY_WAITS_MS: [u64; 8] = [0, 1, 2, 5, 10, 20, 50, 100];

/// Run `block` as an atomic transaction.
///
/// Every cell read inside the block observes one consistent snapshot;
/// writes become visible all at once on commit, or not at all. The block
/// may run any number of times, so it must not perform side effects
/// directly; use [`side_effect`](crate::side_effect) to defer them past
/// the commit.
///
/// Calling `atomically` inside a transaction does not open a new one:
/// the block joins the enclosing transaction and commits with it.
///
/// # Errors
///
/// An `Err` from the block aborts the attempt (rollback effects fire in
/// FIFO order) and is returned as-is; there is no retry. Engine misuse
/// errors ([`StmError`]) convert into `E` the same way.
pub fn atomically<R, E, F>(mut block: F) -> Result<R, E>
where
    E: From<StmError>,
    F: FnMut() -> Result<R, E>,
{
    if txn::is_in_transaction() {
        return block();
    }
    run_new_transaction(block, false).map(|(value, _)| value)
}

/// Run `block` as a fresh transaction and return the cells it read.
///
/// The watcher subsystem uses this to rebuild a predicate's dependency
/// set on every evaluation.
pub(crate) fn atomically_capturing_reads<R, E, F>(
    block: F,
) -> Result<(R, Vec<Arc<CellCore>>), E>
where
    E: From<StmError>,
    F: FnMut() -> Result<R, E>,
{
    debug_assert!(
        !txn::is_in_transaction(),
        "watcher evaluation inside a transaction"
    );
    run_new_transaction(block, true)
}

/// Uninstalls the context and releases its snapshot registration if the
/// block unwinds.
struct AttemptGuard {
    armed: bool,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(ctx) = txn::take() {
                runtime::release_snapshot(ctx.read_stamp);
            }
        }
    }
}

fn run_new_transaction<R, E, F>(
    mut block: F,
    capture_reads: bool,
) -> Result<(R, Vec<Arc<CellCore>>), E>
where
    E: From<StmError>,
    F: FnMut() -> Result<R, E>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let ctx = begin().map_err(E::from)?;
        let txn_id = ctx.id;
        txn::install(ctx);
        let mut guard = AttemptGuard { armed: true };

        let result = block();

        let mut ctx = txn::take().expect("transaction context missing after block");
        guard.armed = false;

        match result {
            Err(err) => {
                runtime::release_snapshot(ctx.read_stamp);
                ctx.state = TxnState::Aborted;
                ctx.run_rollback_effects();
                return Err(err);
            }
            Ok(value) => {
                let deps = if capture_reads {
                    ctx.reads
                        .values()
                        .cloned()
                        .chain(ctx.writes.values().map(|entry| Arc::clone(&entry.cell)))
                        .collect()
                } else {
                    Vec::new()
                };
                match commit::commit(&mut ctx) {
                    CommitOutcome::Committed { touched, .. } => {
                        runtime::release_snapshot(ctx.read_stamp);
                        ctx.run_commit_effects();
                        watch::notify_cells(&touched);
                        return Ok((value, deps));
                    }
                    CommitOutcome::Conflict(cause) => {
                        runtime::release_snapshot(ctx.read_stamp);
                        ctx.state = TxnState::Aborted;
                        ctx.run_rollback_effects();
                        tracing::trace!(
                            txn_id = %txn_id,
                            attempt,
                            cause = %cause,
                            "commit conflict; retrying"
                        );
                        backoff(attempt);
                    }
                }
            }
        }
    }
}

fn begin() -> vellum_error::Result<TxnCtx> {
    let id = runtime::alloc_txn_id()?;
    let read_stamp = runtime::register_snapshot();
    tracing::trace!(txn_id = %id, read_stamp = read_stamp.get(), "transaction begun");
    Ok(TxnCtx::new(id, read_stamp))
}

fn backoff(attempt: u32) {
    let idx = ((attempt - 1) as usize).min(RETRY_WAITS_MS.len() - 1);
    let wait_ms = RETRY_WAITS_MS[idx];
    if wait_ms == 0 {
        thread::yield_now();
    } else {
        thread::sleep(Duration::from_millis(wait_ms));
    }
}
