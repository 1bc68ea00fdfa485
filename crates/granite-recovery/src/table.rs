//! Transaction table entries.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use granite_types::{Lsn, PageNum, Transaction};

/// Per-transaction bookkeeping inside the recovery manager: the tail of
/// the transaction's log-record chain, the pages it touched, and its
/// savepoints.
pub struct TransactionTableEntry {
    pub transaction: Arc<Transaction>,
    /// LSN of the transaction's most recent log record (0 before the
    /// first).
    pub last_lsn: Lsn,
    pub touched_pages: BTreeSet<PageNum>,
    savepoints: HashMap<String, Lsn>,
}

impl TransactionTableEntry {
    #[must_use]
    pub fn new(transaction: Arc<Transaction>) -> Self {
        Self {
            transaction,
            last_lsn: 0,
            touched_pages: BTreeSet::new(),
            savepoints: HashMap::new(),
        }
    }

    /// Record a savepoint at the current `last_lsn`, replacing any
    /// previous savepoint of the same name.
    pub fn add_savepoint(&mut self, name: &str) {
        self.savepoints.insert(name.to_owned(), self.last_lsn);
    }

    #[must_use]
    pub fn get_savepoint(&self, name: &str) -> Option<Lsn> {
        self.savepoints.get(name).copied()
    }

    /// Delete a savepoint; returns whether it existed.
    pub fn delete_savepoint(&mut self, name: &str) -> bool {
        self.savepoints.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoints_overwrite_by_name() {
        let mut entry = TransactionTableEntry::new(Arc::new(Transaction::new(1)));
        entry.last_lsn = 10;
        entry.add_savepoint("a");
        entry.last_lsn = 20;
        entry.add_savepoint("a");
        assert_eq!(entry.get_savepoint("a"), Some(20));
        assert!(entry.delete_savepoint("a"));
        assert!(!entry.delete_savepoint("a"));
        assert_eq!(entry.get_savepoint("a"), None);
    }
}
