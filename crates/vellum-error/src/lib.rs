use thiserror::Error;

/// Primary error type for Vellum STM operations.
///
/// Commit-time validation failures are deliberately *not* representable
/// here: the retry driver consumes them internally and re-runs the block,
/// so user code can never observe (or accidentally swallow) one. What
/// remains are API-misuse errors, which are fatal at the call site, and
/// internal failures.
#[derive(Error, Debug)]
pub enum StmError {
    /// A transactional operation was invoked outside `atomically`.
    #[error("no transaction is active on this thread")]
    NoTransaction,

    /// A commute function touched a transactional cell.
    ///
    /// Commute functions are cell-local by contract: they may read and
    /// mutate the value handed to them and nothing else.
    #[error("cell access inside a commute function")]
    CommuteCellAccess,

    /// The monotonic transaction id space is exhausted.
    #[error("transaction id space exhausted")]
    TxnIdExhausted,

    /// Internal invariant failure (e.g. a cell history out of stamp order).
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl StmError {
    /// Whether this error signals API misuse rather than an engine fault.
    ///
    /// Misuse errors are deterministic at the call site; retrying the same
    /// call cannot succeed.
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(self, Self::NoTransaction | Self::CommuteCellAccess)
    }

    /// Create an internal invariant error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}

/// Result type alias using `StmError`.
pub type Result<T> = std::result::Result<T, StmError>;
