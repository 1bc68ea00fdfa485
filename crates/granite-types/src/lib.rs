//! Core cross-cutting types for the Granite storage engine.
//!
//! This crate defines the identifiers shared by every subsystem ([`PageNum`],
//! [`Lsn`], [`TransactionId`]), the transaction status state machine, the
//! [`Transaction`] handle with the parking primitive used by the lock
//! manager, and little-endian wire encoding helpers.

pub mod encoding;
mod transaction;

pub use transaction::{Transaction, TransactionStatus};

use std::fmt;

/// Monotonically increasing transaction number, assigned by the transaction
/// driver (and restored from the log during recovery).
pub type TransactionId = u64;

/// Log sequence number: the byte offset of a record in the logical log
/// stream. LSN 0 is always the master record.
pub type Lsn = u64;

/// Partition number. Partition 0 is reserved for the log.
pub type PartitionNum = u32;

/// A 64-bit virtual page number with the owning partition in the high 32
/// bits and the page index within the partition in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNum(u64);

impl PageNum {
    /// Build a virtual page number from a partition and a page index.
    #[inline]
    #[must_use]
    pub const fn new(partition: PartitionNum, index: u32) -> Self {
        Self(((partition as u64) << 32) | index as u64)
    }

    /// Reconstruct a page number from its raw u64 form.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The partition this page belongs to.
    #[inline]
    #[must_use]
    pub const fn partition(self) -> PartitionNum {
        (self.0 >> 32) as PartitionNum
    }

    /// The page index within its partition.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Whether this page lives in the log partition.
    #[inline]
    #[must_use]
    pub const fn is_log_page(self) -> bool {
        self.partition() == 0
    }
}

impl fmt::Display for PageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PageNum> for u64 {
    fn from(value: PageNum) -> Self {
        value.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_num_partition_split() {
        let page = PageNum::new(3, 17);
        assert_eq!(page.partition(), 3);
        assert_eq!(page.index(), 17);
        assert_eq!(page.get(), (3_u64 << 32) | 17);
        assert_eq!(PageNum::from_raw(page.get()), page);
    }

    #[test]
    fn test_log_partition_detection() {
        assert!(PageNum::new(0, 5).is_log_page());
        assert!(!PageNum::new(1, 0).is_log_page());
    }
}
