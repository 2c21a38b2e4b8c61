//! History pruning against the active-snapshot registry.
//!
//! These assertions depend on the process-wide snapshot registry being
//! otherwise quiet, so they live in their own test binary and run
//! sequentially.

use std::sync::mpsc;
use std::thread;

use vellum::{atomically, StmError, TCell};

#[test]
fn history_is_pruned_when_snapshots_retire() {
    let x = TCell::new(0u32);

    for i in 1..=10u32 {
        atomically(|| x.write(i)).unwrap();
    }
    assert!(
        x.history_depth() <= 2,
        "no live snapshot, history must stay shallow (depth {})",
        x.history_depth()
    );

    // Pin a snapshot in a second thread: it reads the cell, reports in,
    // and then sits inside its transaction until released.
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let pin = {
        let x = x.clone();
        thread::spawn(move || {
            atomically(|| {
                let v = x.read()?;
                started_tx.send(v).unwrap();
                release_rx.recv().unwrap();
                Ok::<_, StmError>(())
            })
            .unwrap();
        })
    };
    let pinned_at = started_rx.recv().unwrap();
    assert_eq!(pinned_at, 10);

    for i in 11..=20u32 {
        atomically(|| x.write(i)).unwrap();
    }
    assert!(
        x.history_depth() >= 10,
        "pinned snapshot must retain history (depth {})",
        x.history_depth()
    );
    release_tx.send(()).unwrap();
    pin.join().unwrap();

    atomically(|| x.write(99)).unwrap();
    assert!(
        x.history_depth() <= 2,
        "after the snapshot retires pruning must catch up (depth {})",
        x.history_depth()
    );
    assert_eq!(x.latest(), 99);
}
