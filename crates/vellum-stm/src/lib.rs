//! Versioned-cell software transactional memory.
//!
//! Concurrent tasks read and mutate shared state through atomic, isolated,
//! optimistically-concurrent transactions. A transaction is a closure that
//! observes a consistent snapshot of every [`TCell`] it touches and either
//! commits all of its writes atomically or conflicts and re-runs with no
//! visible side effect.
//!
//! ```
//! use vellum_stm::{atomically, TCell};
//!
//! let balance = TCell::new(100_i64);
//! atomically(|| balance.modify(|b| *b -= 30)).unwrap();
//! assert_eq!(balance.latest(), 70);
//! ```
//!
//! The engine is built from:
//!
//! - a process-wide version clock producing commit stamps ([`runtime`]);
//! - versioned cells holding a stamped value history ([`cell`]);
//! - a per-thread transaction context buffering reads, writes, commutative
//!   updates, and deferred side effects ([`txn`]);
//! - a two-phase commit coordinator with optimistic read validation
//!   ([`commit`]);
//! - an unbounded retry driver ([`retry`]);
//! - conditional watchers that re-evaluate a predicate whenever a cell it
//!   read is committed to ([`watch`]).

mod cell;
mod commit;
mod retry;
mod runtime;
mod txn;
mod watch;

pub use cell::TCell;
pub use retry::atomically;
pub use runtime::current_stamp;
pub use txn::{is_in_transaction, side_effect, side_effect_with_rollback};
pub use watch::{conditional, Conditional};

pub use vellum_error::{Result, StmError};
pub use vellum_types::{CellId, Stamp, TxnId, TxnState, WatcherId};
