//! Public API facade for the Granite storage engine core.
//!
//! Re-exports the concurrency-control and recovery surface consumed by the
//! query executor and transaction driver:
//!
//! - locking: [`LockManager`], [`LockContext`], [`LockUtil`], [`LockType`]
//! - recovery: [`AriesRecoveryManager`] over [`LogManager`]
//! - storage contracts: [`DiskSpaceManager`], [`BufferManager`] and the
//!   in-memory reference implementations

pub use granite_concurrency::{
    release_all_locks, Lock, LockContext, LockManager, LockType, LockUtil, ResourceName,
};
pub use granite_error::{GraniteError, Result};
pub use granite_recovery::{AriesRecoveryManager, NewTransactionFn, TransactionTableEntry};
pub use granite_storage::{
    BufferManager, DiskSpaceManager, MemBufferManager, MemDiskManager, EFFECTIVE_PAGE_SIZE,
    LOG_PARTITION, PAGE_SIZE,
};
pub use granite_types::{
    Lsn, PageNum, PartitionNum, Transaction, TransactionId, TransactionStatus,
};
pub use granite_wal::{LogEntry, LogManager, LogRecord};
