//! The lock manager: per-resource granted sets and strict-FIFO wait queues.
//!
//! All state lives under one process-wide monitor. Public operations
//! validate synchronously (before any mutation), then either mutate and
//! return or enqueue the request and park the calling thread *outside* the
//! monitor on the transaction's condition variable.
//!
//! Queue discipline is strict FIFO: a compatible later request never
//! overtakes a blocked earlier request on the same resource. Promotions
//! (and the acquire-and-release used by escalation) enter at the queue
//! head instead of the tail but still wait for compatibility with the
//! currently granted set.
//!
//! The lock manager knows nothing about the resource hierarchy; the
//! multigranularity rules live in [`crate::LockContext`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use granite_error::{GraniteError, Result};
use granite_types::{Transaction, TransactionId};

use crate::{LockType, ResourceName};

/// A granted lock: a resource, a non-NL type, and the owning transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub name: ResourceName,
    pub lock_type: LockType,
    pub transaction_id: TransactionId,
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T{} {} ({})",
            self.transaction_id, self.lock_type, self.name
        )
    }
}

/// A pending request on a resource's wait queue. `release` names the locks
/// to drop in the same critical section in which the request is granted.
struct LockRequest {
    transaction: Arc<Transaction>,
    lock: Lock,
    release: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    granted: Vec<Lock>,
    queue: VecDeque<LockRequest>,
}

impl ResourceEntry {
    /// Whether `lock_type` is compatible with every granted lock, ignoring
    /// locks held by `except` (a transaction never conflicts with itself).
    fn check_compatible(&self, lock_type: LockType, except: TransactionId) -> bool {
        self.granted
            .iter()
            .filter(|lock| lock.transaction_id != except)
            .all(|lock| LockType::compatible(lock.lock_type, lock_type))
    }
}

#[derive(Default)]
struct ManagerState {
    resources: HashMap<ResourceName, ResourceEntry>,
    transaction_locks: HashMap<TransactionId, Vec<Lock>>,
}

impl ManagerState {
    fn lock_type(&self, transaction_id: TransactionId, name: &ResourceName) -> LockType {
        self.transaction_locks
            .get(&transaction_id)
            .and_then(|locks| locks.iter().find(|lock| &lock.name == name))
            .map_or(LockType::NL, |lock| lock.lock_type)
    }

    /// Insert `lock` into the granted set, or update the held type in place
    /// if the transaction already holds a lock on the resource (promotion).
    fn grant_or_update(&mut self, lock: Lock) {
        let entry = self.resources.entry(lock.name.clone()).or_default();
        if let Some(existing) = entry
            .granted
            .iter_mut()
            .find(|held| held.transaction_id == lock.transaction_id)
        {
            existing.lock_type = lock.lock_type;
        } else {
            entry.granted.push(lock.clone());
        }

        let index = self.transaction_locks.entry(lock.transaction_id).or_default();
        if let Some(existing) = index.iter_mut().find(|held| held.name == lock.name) {
            existing.lock_type = lock.lock_type;
        } else {
            index.push(lock);
        }
    }

    /// Remove the transaction's lock on `name` from both indexes. Returns
    /// whether a lock was actually removed.
    fn remove_lock(&mut self, transaction_id: TransactionId, name: &ResourceName) -> bool {
        let mut removed = false;
        if let Some(entry) = self.resources.get_mut(name) {
            let before = entry.granted.len();
            entry
                .granted
                .retain(|lock| lock.transaction_id != transaction_id);
            removed = entry.granted.len() != before;
        }
        if let Some(index) = self.transaction_locks.get_mut(&transaction_id) {
            index.retain(|lock| &lock.name != name);
        }
        removed
    }
}

/// Drain the head of `name`'s queue: grant as long as the front request is
/// compatible with the (updated) granted set, stopping at the first that is
/// not. Granting a request also releases the locks it carried and drains
/// their queues in turn.
fn process_queue(state: &mut ManagerState, name: &ResourceName) {
    loop {
        let grantable = {
            let Some(entry) = state.resources.get(name) else {
                return;
            };
            let Some(front) = entry.queue.front() else {
                return;
            };
            entry.check_compatible(front.lock.lock_type, front.lock.transaction_id)
        };
        if !grantable {
            return;
        }
        let Some(request) = state
            .resources
            .get_mut(name)
            .and_then(|entry| entry.queue.pop_front())
        else {
            return;
        };
        debug!(lock = %request.lock, "granting queued request");
        state.grant_or_update(request.lock.clone());
        for released in &request.release {
            if released == name {
                continue;
            }
            if state.remove_lock(request.lock.transaction_id, released) {
                process_queue(state, released);
            }
        }
        request.transaction.unblock();
    }
}

/// Process-wide lock manager.
#[derive(Default)]
pub struct LockManager {
    state: Mutex<ManagerState>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `lock_type` on `name` for `transaction`, blocking until the
    /// lock is granted if the resource's granted set is incompatible or its
    /// queue is non-empty.
    ///
    /// # Errors
    ///
    /// `DuplicateLockRequest` if the transaction already holds any lock on
    /// `name`.
    pub fn acquire(
        &self,
        transaction: &Arc<Transaction>,
        name: &ResourceName,
        lock_type: LockType,
    ) -> Result<()> {
        let transaction_id = transaction.id();
        let should_block = {
            let mut state = self.state.lock();
            if state.lock_type(transaction_id, name) != LockType::NL {
                return Err(GraniteError::DuplicateLockRequest {
                    transaction: transaction_id,
                    resource: name.to_string(),
                });
            }
            let lock = Lock {
                name: name.clone(),
                lock_type,
                transaction_id,
            };
            let entry = state.resources.entry(name.clone()).or_default();
            if entry.queue.is_empty() && entry.check_compatible(lock_type, transaction_id) {
                debug!(lock = %lock, "acquire granted");
                state.grant_or_update(lock);
                false
            } else {
                debug!(lock = %lock, "acquire queued");
                transaction.prepare_block();
                entry.queue.push_back(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    release: Vec::new(),
                });
                true
            }
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Release `transaction`'s lock on `name` and drain the wait queue.
    ///
    /// # Errors
    ///
    /// `NoLockHeld` if the transaction holds no lock on `name`.
    pub fn release(&self, transaction: &Arc<Transaction>, name: &ResourceName) -> Result<()> {
        let transaction_id = transaction.id();
        let mut state = self.state.lock();
        if state.lock_type(transaction_id, name) == LockType::NL {
            return Err(GraniteError::NoLockHeld {
                transaction: transaction_id,
                resource: name.to_string(),
            });
        }
        state.remove_lock(transaction_id, name);
        debug!(transaction = transaction_id, resource = %name, "released lock");
        process_queue(&mut state, name);
        Ok(())
    }

    /// Atomically acquire `lock_type` on `name` while releasing every lock
    /// named in `release`. The request enters at the *front* of processing:
    /// if the granted set is incompatible, it waits at the queue head.
    ///
    /// If `name` itself appears in `release`, the held lock on `name` is
    /// replaced in place (promotion semantics, no duplicate error).
    ///
    /// # Errors
    ///
    /// `DuplicateLockRequest` if the transaction holds a lock on `name` that
    /// is not being released; `NoLockHeld` if any name in `release` is not
    /// held.
    pub fn acquire_and_release(
        &self,
        transaction: &Arc<Transaction>,
        name: &ResourceName,
        lock_type: LockType,
        release: Vec<ResourceName>,
    ) -> Result<()> {
        let transaction_id = transaction.id();
        let should_block = {
            let mut state = self.state.lock();
            let held = state.lock_type(transaction_id, name);
            if held != LockType::NL && !release.contains(name) {
                return Err(GraniteError::DuplicateLockRequest {
                    transaction: transaction_id,
                    resource: name.to_string(),
                });
            }
            for released in &release {
                if state.lock_type(transaction_id, released) == LockType::NL {
                    return Err(GraniteError::NoLockHeld {
                        transaction: transaction_id,
                        resource: released.to_string(),
                    });
                }
            }
            let lock = Lock {
                name: name.clone(),
                lock_type,
                transaction_id,
            };
            let entry = state.resources.entry(name.clone()).or_default();
            if entry.check_compatible(lock_type, transaction_id) {
                debug!(lock = %lock, releasing = release.len(), "acquire-and-release granted");
                state.grant_or_update(lock);
                for released in &release {
                    if released == name {
                        continue;
                    }
                    if state.remove_lock(transaction_id, released) {
                        process_queue(&mut state, released);
                    }
                }
                process_queue(&mut state, name);
                false
            } else {
                debug!(lock = %lock, "acquire-and-release queued at head");
                transaction.prepare_block();
                entry.queue.push_front(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    release,
                });
                true
            }
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Promote `transaction`'s lock on `name` to `new_type`. A blocked
    /// promotion waits at the head of the queue.
    ///
    /// # Errors
    ///
    /// `NoLockHeld` if nothing is held; `DuplicateLockRequest` if the held
    /// type already is `new_type`; `InvalidLock` if `new_type` is not a
    /// strict upgrade under substitutability.
    pub fn promote(
        &self,
        transaction: &Arc<Transaction>,
        name: &ResourceName,
        new_type: LockType,
    ) -> Result<()> {
        let transaction_id = transaction.id();
        let should_block = {
            let mut state = self.state.lock();
            let held = state.lock_type(transaction_id, name);
            if held == LockType::NL {
                return Err(GraniteError::NoLockHeld {
                    transaction: transaction_id,
                    resource: name.to_string(),
                });
            }
            if held == new_type {
                return Err(GraniteError::DuplicateLockRequest {
                    transaction: transaction_id,
                    resource: name.to_string(),
                });
            }
            if !LockType::substitutable(new_type, held) {
                return Err(GraniteError::InvalidLock {
                    reason: format!(
                        "promotion from {held} to {new_type} on {name} is not an upgrade"
                    ),
                });
            }
            let lock = Lock {
                name: name.clone(),
                lock_type: new_type,
                transaction_id,
            };
            let entry = state.resources.entry(name.clone()).or_default();
            if entry.check_compatible(new_type, transaction_id) {
                debug!(lock = %lock, from = %held, "promotion granted");
                state.grant_or_update(lock);
                false
            } else {
                debug!(lock = %lock, from = %held, "promotion queued at head");
                transaction.prepare_block();
                entry.queue.push_front(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    release: Vec::new(),
                });
                true
            }
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Remove every queued request of `transaction` and unpark it. Used by
    /// the transaction driver to abort a blocked transaction; granted locks
    /// are untouched (the abort path releases those).
    pub fn cancel_pending(&self, transaction: &Arc<Transaction>) {
        let transaction_id = transaction.id();
        let mut state = self.state.lock();
        let affected: Vec<ResourceName> = state
            .resources
            .iter_mut()
            .filter_map(|(name, entry)| {
                let before = entry.queue.len();
                entry
                    .queue
                    .retain(|request| request.lock.transaction_id != transaction_id);
                (entry.queue.len() != before).then(|| name.clone())
            })
            .collect();
        // Removing a blocked head may let the requests behind it through.
        for name in &affected {
            process_queue(&mut state, name);
        }
        drop(state);
        if !affected.is_empty() {
            debug!(transaction = transaction_id, "cancelled pending lock requests");
        }
        transaction.unblock();
    }

    /// The type `transaction` holds on `name`, or NL.
    #[must_use]
    pub fn get_lock_type(&self, transaction_id: TransactionId, name: &ResourceName) -> LockType {
        self.state.lock().lock_type(transaction_id, name)
    }

    /// Snapshot of the locks granted on `name`, in grant order.
    #[must_use]
    pub fn get_locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|entry| entry.granted.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the locks `transaction` holds, in acquisition order.
    #[must_use]
    pub fn get_transaction_locks(&self, transaction_id: TransactionId) -> Vec<Lock> {
        self.state
            .lock()
            .transaction_locks
            .get(&transaction_id)
            .cloned()
            .unwrap_or_default()
    }
}
