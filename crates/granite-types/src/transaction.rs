//! Transaction handle and status state machine.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::TransactionId;

/// Lifecycle status of a transaction.
///
/// Statuses only ever advance:
///
/// ```text
/// Running -> {Committing, Aborting, RecoveryAborting} -> Complete
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionStatus {
    /// Actively running forward operations.
    Running,
    /// Commit record written; waiting for the driver to finish up.
    Committing,
    /// Abort requested; rollback happens when the transaction ends.
    Aborting,
    /// Marked for rollback by restart recovery.
    RecoveryAborting,
    /// Finished, either committed or fully rolled back.
    Complete,
}

impl TransactionStatus {
    /// Whether a transaction in this status may move to `next`.
    ///
    /// Used when merging checkpoint snapshots during restart analysis: the
    /// checkpoint may be stale, so only forward transitions are applied.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if next == Self::Complete && self != Self::Running {
            return true;
        }
        self == Self::Running && next != Self::Complete
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Committing => "COMMITTING",
            Self::Aborting => "ABORTING",
            Self::RecoveryAborting => "RECOVERY_ABORTING",
            Self::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// A transaction handle.
///
/// Carries the transaction number, the current status, and the parking
/// primitive the lock manager uses to block the transaction's thread while a
/// lock request waits in a queue. Each transaction runs single-threaded, so
/// at most one thread ever parks on a given handle.
///
/// Handles are passed explicitly through every locking call; there is no
/// thread-local "current transaction".
pub struct Transaction {
    id: TransactionId,
    status: Mutex<TransactionStatus>,
    blocked: AtomicBool,
    park: Mutex<bool>,
    unparked: Condvar,
}

impl Transaction {
    /// Create a handle in the `Running` state.
    #[must_use]
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            status: Mutex::new(TransactionStatus::Running),
            blocked: AtomicBool::new(false),
            park: Mutex::new(false),
            unparked: Condvar::new(),
        }
    }

    /// The transaction number.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    /// Set the status. The caller is responsible for only advancing the
    /// state machine; see [`TransactionStatus::can_transition_to`].
    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    /// Whether the transaction is currently blocked on (or about to block
    /// on) a lock request.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Arm the parking flag. Called by the lock manager under its monitor,
    /// before the request is placed on a wait queue, so that a grant racing
    /// with [`block`](Self::block) is never lost.
    pub fn prepare_block(&self) {
        *self.park.lock() = true;
        self.blocked.store(true, Ordering::Release);
    }

    /// Park the calling thread until [`unblock`](Self::unblock) runs.
    /// Called outside the lock manager's monitor. Returns immediately if the
    /// grant already happened.
    pub fn block(&self) {
        let mut parked = self.park.lock();
        while *parked {
            self.unparked.wait(&mut parked);
        }
    }

    /// Release a parked transaction. Called when its queued request is
    /// granted or cancelled.
    pub fn unblock(&self) {
        let mut parked = self.park.lock();
        *parked = false;
        self.blocked.store(false, Ordering::Release);
        self.unparked.notify_all();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_status_transitions_only_advance() {
        use TransactionStatus::*;
        assert!(Running.can_transition_to(Committing));
        assert!(Running.can_transition_to(Aborting));
        assert!(Running.can_transition_to(RecoveryAborting));
        assert!(Committing.can_transition_to(Complete));
        assert!(Aborting.can_transition_to(Complete));
        assert!(RecoveryAborting.can_transition_to(Complete));

        assert!(!Running.can_transition_to(Complete));
        assert!(!Committing.can_transition_to(Running));
        assert!(!Complete.can_transition_to(Running));
        assert!(!Aborting.can_transition_to(Committing));
    }

    #[test]
    fn test_block_unblock_handshake() {
        let txn = Arc::new(Transaction::new(1));
        txn.prepare_block();
        assert!(txn.is_blocked());

        let waiter = {
            let txn = Arc::clone(&txn);
            std::thread::spawn(move || txn.block())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        txn.unblock();
        waiter.join().unwrap();
        assert!(!txn.is_blocked());
    }

    #[test]
    fn test_unblock_before_block_does_not_park() {
        let txn = Transaction::new(2);
        txn.prepare_block();
        txn.unblock();
        // The grant landed before the caller reached block(); it must not park.
        txn.block();
        assert!(!txn.is_blocked());
    }
}
