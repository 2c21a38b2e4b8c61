//! Public API facade for Vellum.
//!
//! Vellum is a software transactional memory runtime: shared state lives
//! in versioned [`TCell`]s, and concurrent tasks mutate it through
//! atomic, isolated, optimistically-concurrent transactions.
//!
//! ```
//! use vellum::{atomically, StmError, TCell};
//!
//! let cats = TCell::new(1u32);
//! let dogs = TCell::new(1u32);
//!
//! atomically(|| {
//!     if cats.read()? + dogs.read()? < 3 {
//!         cats.modify(|n| *n += 1)?;
//!     }
//!     Ok::<_, StmError>(())
//! })
//! .unwrap();
//!
//! assert_eq!(cats.latest() + dogs.latest(), 3);
//! ```
//!
//! Beyond reads and writes, transactions can queue commutative updates
//! ([`TCell::commute`]) that never conflict with each other, defer side
//! effects past the commit ([`side_effect`]), and register conditional
//! watchers ([`conditional`]) that react when a predicate over cells
//! becomes true. [`TDict`] and [`TList`] are transactional containers
//! composed from cells.

pub use vellum_error::{Result, StmError};
pub use vellum_types::{CellId, Stamp, TxnId, TxnState, WatcherId};

pub use vellum_stm::{
    atomically, conditional, current_stamp, is_in_transaction, side_effect,
    side_effect_with_rollback, Conditional, TCell,
};

pub use vellum_collections::{TDict, TList};
