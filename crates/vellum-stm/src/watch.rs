//! Conditional watchers.
//!
//! A watcher pairs a read-only predicate with a reactor. The predicate
//! runs in a fresh transaction; the cells it reads become the watcher's
//! dependency set. Whenever a commit touches a dependency the watcher
//! re-evaluates (rebuilding the dependency set), and when the predicate
//! holds the reactor runs in its own transaction. A reactor that returns
//! `false`, and any predicate or reactor that fails, deregisters the
//! watcher.
//!
//! Re-evaluation happens synchronously on the committing thread after the
//! commit's locks are released. Triggers are coalesced through a pending
//! flag: any number of commits between evaluations collapse into one
//! re-evaluation, and a reactor that triggers its own watcher is drained
//! by the evaluation already on the stack instead of recursing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use vellum_error::Result;
use vellum_types::WatcherId;

use crate::cell::CellCore;
use crate::retry;
use crate::runtime;
use crate::txn;

type WatcherFn = Box<dyn FnMut() -> Result<bool> + Send>;

/// Shared watcher state. Cells hold weak references; the global registry
/// holds the strong reference for as long as the watcher is active.
pub(crate) struct WatcherCore {
    id: WatcherId,
    active: AtomicBool,
    /// Set by a triggering commit; cleared by the evaluation that serves it.
    pending: AtomicBool,
    state: Mutex<WatcherState>,
}

struct WatcherState {
    predicate: WatcherFn,
    reactor: WatcherFn,
    /// Cells read by the most recent predicate evaluation.
    deps: Vec<Arc<CellCore>>,
}

impl WatcherCore {
    pub(crate) fn id(&self) -> WatcherId {
        self.id
    }
}

/// Active watchers, keyed by id.
static REGISTRY: Mutex<BTreeMap<u64, Arc<WatcherCore>>> = Mutex::new(BTreeMap::new());

/// Handle to a registered watcher.
///
/// Dropping the handle does not deregister the watcher; it stays active
/// until its reactor returns `false`, it fails, or [`Conditional::cancel`]
/// is called.
pub struct Conditional {
    core: Arc<WatcherCore>,
}

impl Conditional {
    /// This watcher's registry id.
    #[must_use]
    pub fn id(&self) -> WatcherId {
        self.core.id
    }

    /// Whether the watcher is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.active.load(Ordering::Acquire)
    }

    /// Deregister the watcher explicitly.
    ///
    /// An evaluation already in flight finishes; no further evaluation
    /// starts after `cancel` returns.
    pub fn cancel(&self) {
        self.core.active.store(false, Ordering::Release);
        REGISTRY.lock().remove(&self.core.id.get());
        if let Some(mut state) = self.core.state.try_lock() {
            for cell in state.deps.drain(..) {
                cell.detach_watcher(self.core.id);
            }
        }
        // If the state lock is held, the running evaluation observes the
        // cleared active flag and stops; stale cell back-references are
        // pruned lazily on the next collect.
    }
}

impl fmt::Debug for Conditional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conditional")
            .field("id", &self.core.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Register a conditional watcher.
///
/// The predicate must be read-only: it runs inside a transaction and its
/// read set becomes the watcher's dependency set. It is evaluated once on
/// registration; if it returns `Ok(true)` the reactor runs immediately in
/// a following transaction.
///
/// When called inside a transaction, registration (and the initial
/// evaluation) is deferred until that transaction commits; a conflicting
/// attempt registers nothing.
pub fn conditional<P, A>(predicate: P, reactor: A) -> Conditional
where
    P: FnMut() -> Result<bool> + Send + 'static,
    A: FnMut() -> Result<bool> + Send + 'static,
{
    let core = Arc::new(WatcherCore {
        id: runtime::alloc_watcher_id(),
        active: AtomicBool::new(false),
        pending: AtomicBool::new(false),
        state: Mutex::new(WatcherState {
            predicate: Box::new(predicate),
            reactor: Box::new(reactor),
            deps: Vec::new(),
        }),
    });
    if txn::is_in_transaction() {
        let deferred = Arc::clone(&core);
        txn::side_effect(move || activate(&deferred))
            .expect("registration deferral inside an active transaction");
    } else {
        activate(&core);
    }
    Conditional { core }
}

fn activate(core: &Arc<WatcherCore>) {
    REGISTRY.lock().insert(core.id.get(), Arc::clone(core));
    core.active.store(true, Ordering::Release);
    tracing::debug!(watcher = %core.id, "watcher registered");
    notify(core);
}

/// Re-evaluate the watchers of every touched cell. Called by the retry
/// driver after a successful commit, with no locks held.
pub(crate) fn notify_cells(touched: &[Arc<CellCore>]) {
    if touched.is_empty() {
        return;
    }
    let mut watchers = Vec::new();
    for cell in touched {
        cell.collect_watchers(&mut watchers);
    }
    for watcher in watchers {
        notify(&watcher);
    }
}

/// Mark the watcher pending and drain it if no evaluation is running.
///
/// When the state lock is held the holder is an evaluation further up the
/// stack (or on another thread); its drain loop observes the pending flag
/// after it finishes, so the trigger is never lost.
fn notify(core: &Arc<WatcherCore>) {
    core.pending.store(true, Ordering::Release);
    while core.active.load(Ordering::Acquire) && core.pending.load(Ordering::Acquire) {
        let Some(mut state) = core.state.try_lock() else {
            return;
        };
        if !core.pending.swap(false, Ordering::AcqRel) {
            return;
        }
        evaluate(core, &mut state);
    }
}

fn evaluate(core: &Arc<WatcherCore>, state: &mut WatcherState) {
    match retry::atomically_capturing_reads(|| (state.predicate)()) {
        Err(err) => {
            tracing::warn!(
                watcher = %core.id,
                error = %err,
                "watcher predicate failed; deregistering"
            );
            deregister(core, state);
        }
        Ok((holds, deps)) => {
            rebind_deps(core, state, deps);
            if !holds {
                return;
            }
            match retry::atomically(|| (state.reactor)()) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(watcher = %core.id, "reactor finished; deregistering");
                    deregister(core, state);
                }
                Err(err) => {
                    tracing::warn!(
                        watcher = %core.id,
                        error = %err,
                        "watcher reactor failed; deregistering"
                    );
                    deregister(core, state);
                }
            }
        }
    }
}

/// Swap the dependency set. Cells present in both the old and new sets
/// stay attached throughout, so a commit racing with the evaluation can
/// never slip between a detach and a re-attach of a stable dependency.
fn rebind_deps(core: &Arc<WatcherCore>, state: &mut WatcherState, deps: Vec<Arc<CellCore>>) {
    for cell in &deps {
        cell.attach_watcher(core.id, Arc::downgrade(core));
    }
    for old in state.deps.drain(..) {
        if !deps.iter().any(|cell| cell.id() == old.id()) {
            old.detach_watcher(core.id);
        }
    }
    state.deps = deps;
}

fn deregister(core: &Arc<WatcherCore>, state: &mut WatcherState) {
    core.active.store(false, Ordering::Release);
    for cell in state.deps.drain(..) {
        cell.detach_watcher(core.id);
    }
    REGISTRY.lock().remove(&core.id.get());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use vellum_error::StmError;

    use crate::cell::TCell;
    use crate::retry::atomically;

    #[test]
    fn fires_immediately_when_predicate_holds() {
        let x = TCell::new(5u32);
        let fired = Arc::new(AtomicUsize::new(0));

        let (xp, f) = (x.clone(), fired.clone());
        let watcher = conditional(
            move || Ok(xp.read()? > 0),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
        );

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Reactor returned false: the watcher is done.
        assert!(!watcher.is_active());
    }

    #[test]
    fn fires_when_a_dependency_commit_makes_predicate_true() {
        let x = TCell::new(0u32);
        let fired = Arc::new(AtomicUsize::new(0));
        let evals = Arc::new(AtomicUsize::new(0));

        let (xp, f, e) = (x.clone(), fired.clone(), evals.clone());
        let watcher = conditional(
            move || {
                e.fetch_add(1, Ordering::SeqCst);
                Ok(xp.read()? >= 3)
            },
            move || {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            },
        );
        assert_eq!(evals.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            atomically(|| x.modify(|n| *n += 1)).unwrap();
        }

        assert_eq!(evals.load(Ordering::SeqCst), 4, "one evaluation per commit");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(watcher.is_active(), "reactor returned true; watcher persists");
        watcher.cancel();
    }

    #[test]
    fn reactor_false_deregisters_and_stops_future_triggers() {
        let x = TCell::new(10u32);
        let fired = Arc::new(AtomicUsize::new(0));

        let (xp, f) = (x.clone(), fired.clone());
        let watcher = conditional(
            move || Ok(xp.read()? > 0),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watcher.is_active());

        atomically(|| x.write(20)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "deregistered watcher must not fire");
    }

    #[test]
    fn predicate_error_deregisters_without_disturbing_commits() {
        let x = TCell::new(0u32);
        let xp = x.clone();
        let watcher = conditional(
            move || {
                let _ = xp.read()?;
                Err(StmError::invariant("predicate exploded"))
            },
            move || Ok(true),
        );
        assert!(!watcher.is_active());

        // Commits to the former dependency proceed normally.
        atomically(|| x.write(1)).unwrap();
        assert_eq!(x.latest(), 1);
    }

    #[test]
    fn dependency_set_is_rebuilt_each_evaluation() {
        let selector = TCell::new(true);
        let a = TCell::new(1u32);
        let b = TCell::new(0u32);
        let evals = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));

        let (s, ap, bp, e, f) = (
            selector.clone(),
            a.clone(),
            b.clone(),
            evals.clone(),
            fired.clone(),
        );
        let watcher = conditional(
            move || {
                e.fetch_add(1, Ordering::SeqCst);
                if s.read()? {
                    Ok(false)
                } else {
                    Ok(bp.read()? > 0)
                }
            },
            move || {
                f.fetch_add(1, Ordering::SeqCst);
                let _ = ap.read()?;
                Ok(true)
            },
        );
        assert_eq!(evals.load(Ordering::SeqCst), 1);

        // `b` is not a dependency while the selector is true.
        atomically(|| b.write(5)).unwrap();
        assert_eq!(evals.load(Ordering::SeqCst), 1);

        // Flipping the selector re-evaluates and rebinds to {selector, b}.
        atomically(|| selector.write(false)).unwrap();
        assert_eq!(evals.load(Ordering::SeqCst), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Now `b` commits do trigger.
        atomically(|| b.write(6)).unwrap();
        assert_eq!(evals.load(Ordering::SeqCst), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        watcher.cancel();
        assert!(!watcher.is_active());
    }

    #[test]
    fn registration_inside_a_transaction_defers_to_commit() {
        let x = TCell::new(7u32);
        let fired = Arc::new(AtomicUsize::new(0));

        let (xp, f) = (x.clone(), fired.clone());
        let handle = atomically(move || {
            let xq = xp.clone();
            let fq = f.clone();
            let handle = conditional(
                move || Ok(xq.read()? > 0),
                move || {
                    fq.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                },
            );
            assert!(!handle.is_active(), "activation waits for the commit");
            Ok::<_, StmError>(handle)
        })
        .unwrap();

        assert!(handle.is_active());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        handle.cancel();
    }
}
