//! Primary error type for the Granite storage engine.
//!
//! One flat enum with structured variants, split into the two taxonomies the
//! engine distinguishes: caller-facing lock errors (synchronous, detected
//! before any state mutation, never blocking) and engine-internal storage and
//! recovery errors (invariant violations that refuse to proceed).

use thiserror::Error;

/// Error type shared across all Granite crates.
#[derive(Error, Debug)]
pub enum GraniteError {
    // === Lock errors (caller-facing, synchronous) ===
    /// The transaction already holds a lock on the resource it is requesting.
    #[error("transaction {transaction} already holds a lock on {resource}")]
    DuplicateLockRequest { transaction: u64, resource: String },

    /// The transaction holds no lock on the resource it tried to release,
    /// promote, or escalate.
    #[error("transaction {transaction} holds no lock on {resource}")]
    NoLockHeld { transaction: u64, resource: String },

    /// The request would put the lock hierarchy in an invalid state.
    #[error("invalid lock request: {reason}")]
    InvalidLock { reason: String },

    /// The operation is not available on this object (e.g. a read-only lock
    /// context, or redo of a non-redoable log record).
    #[error("unsupported operation: {reason}")]
    UnsupportedOperation { reason: String },

    // === Storage errors ===
    /// The partition has not been allocated.
    #[error("partition {partition} is not allocated")]
    PartitionNotAllocated { partition: u32 },

    /// The partition is already allocated.
    #[error("partition {partition} is already allocated")]
    PartitionAlreadyAllocated { partition: u32 },

    /// The page has not been allocated.
    #[error("page {page} is not allocated")]
    PageNotAllocated { page: u64 },

    /// The page is already allocated.
    #[error("page {page} is already allocated")]
    PageAlreadyAllocated { page: u64 },

    /// A page read or write fell outside the usable page area.
    #[error("access of {len} bytes at offset {offset} is out of bounds for page {page}")]
    PageOutOfBounds { page: u64, offset: usize, len: usize },

    // === Log and recovery errors (fatal) ===
    /// The log has no master record; the database cannot be opened.
    #[error("log has no master record")]
    MissingMasterRecord,

    /// A log record failed to decode.
    #[error("corrupt log record at LSN {lsn}: {detail}")]
    CorruptLogRecord { lsn: u64, detail: String },

    /// A log record's stored checksum does not match its payload.
    #[error("log record checksum mismatch at LSN {lsn}")]
    LogChecksumMismatch { lsn: u64 },

    /// An LSN outside the bounds of the log was referenced.
    #[error("LSN {lsn} is out of range for the log")]
    LsnOutOfRange { lsn: u64 },

    /// The transaction is not present in the transaction table.
    #[error("transaction {transaction} is not in the transaction table")]
    TransactionNotFound { transaction: u64 },

    /// The named savepoint does not exist for the transaction.
    #[error("transaction {transaction} has no savepoint named '{name}'")]
    SavepointNotFound { transaction: u64, name: String },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GraniteError>;

impl GraniteError {
    /// Whether this error belongs to the caller-facing lock taxonomy.
    ///
    /// Lock errors are reported to the requesting transaction, which may
    /// retry with a different type or abort; everything else is an engine
    /// invariant violation.
    #[must_use]
    pub const fn is_lock_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateLockRequest { .. }
                | Self::NoLockHeld { .. }
                | Self::InvalidLock { .. }
                | Self::UnsupportedOperation { .. }
        )
    }
}
