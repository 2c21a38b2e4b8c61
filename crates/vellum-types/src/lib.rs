//! Cross-cutting types for the Vellum STM runtime.
//!
//! This crate defines the identifier newtypes and the transaction state
//! machine shared by the engine and the derived containers: commit stamps,
//! transaction ids, cell ids, and watcher ids.

use std::fmt;
use std::num::NonZeroU64;

// ---------------------------------------------------------------------------
// Stamp
// ---------------------------------------------------------------------------

/// Monotonically increasing commit stamp drawn from the process-wide
/// version clock.
///
/// Stamp 0 means "before any commit": every cell's initial value carries it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Stamp(u64);

impl Stamp {
    /// The pre-history stamp carried by initial cell values.
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The successor stamp.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v#{}", self.get())
    }
}

// ---------------------------------------------------------------------------
// TxnId
// ---------------------------------------------------------------------------

/// Monotonically increasing transaction identifier.
///
/// Zero is reserved: cell write-lock slots store the holder's raw id in an
/// atomic word and use 0 for "free", so a real transaction id is never 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(NonZeroU64);

impl TxnId {
    /// Construct a `TxnId` if `raw` is nonzero.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.get())
    }
}

impl TryFrom<u64> for TxnId {
    type Error = InvalidTxnId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTxnId { raw: value })
    }
}

/// Error returned when attempting to construct an out-of-domain `TxnId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTxnId {
    raw: u64,
}

impl fmt::Display for InvalidTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid TxnId {} (must be nonzero)", self.raw)
    }
}

impl std::error::Error for InvalidTxnId {}

// ---------------------------------------------------------------------------
// CellId
// ---------------------------------------------------------------------------

/// Stable identity of a transactional cell.
///
/// Allocated once at cell creation and never reused. The total order on
/// cell ids is the deterministic lock-acquisition order during commit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct CellId(u64);

impl CellId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.get())
    }
}

// ---------------------------------------------------------------------------
// WatcherId
// ---------------------------------------------------------------------------

/// Identity of a conditional watcher in the watcher registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct WatcherId(u64);

impl WatcherId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w#{}", self.get())
    }
}

// ---------------------------------------------------------------------------
// TxnState
// ---------------------------------------------------------------------------

/// Transaction context state machine.
///
/// `Active → Committing → Committed` on success; `Active → Aborted` (or
/// `Committing → Aborted` on validation failure). Terminal states freeze
/// the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxnState {
    /// The user block is executing; reads and writes are being buffered.
    Active,
    /// The commit coordinator holds the context.
    Committing,
    /// Writes are published; the context is frozen.
    Committed,
    /// The attempt was discarded; nothing was published.
    Aborted,
}

impl TxnState {
    /// Whether the context can accept further reads and writes.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the context is frozen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Committing => f.write_str("committing"),
            Self::Committed => f.write_str("committed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}
