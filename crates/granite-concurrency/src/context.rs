//! Hierarchy nodes over the lock manager.
//!
//! A `LockContext` represents one point in the resource tree (database,
//! partition, page). It enforces the multigranularity rules — intent locks
//! on ancestors, SIX redundancy, bottom-up release — and keeps the
//! per-transaction count of locks held below each node exact.
//!
//! Nodes are shared `Arc`s with a `Weak` back-pointer to the parent;
//! children are materialized lazily and cached, so a path always resolves
//! to the same node and two contexts never alias one resource name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use granite_error::{GraniteError, Result};
use granite_types::{Transaction, TransactionId};

use crate::{Lock, LockManager, LockType, ResourceName};

pub struct LockContext {
    manager: Arc<LockManager>,
    parent: Weak<LockContext>,
    name: ResourceName,
    readonly: bool,
    child_locks_disabled: AtomicBool,
    num_child_locks: Mutex<HashMap<TransactionId, usize>>,
    children: Mutex<HashMap<u64, Arc<LockContext>>>,
}

impl LockContext {
    /// The root context for the whole database.
    #[must_use]
    pub fn database(manager: Arc<LockManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            parent: Weak::new(),
            name: ResourceName::root("database", 0),
            readonly: false,
            child_locks_disabled: AtomicBool::new(false),
            num_child_locks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// The child context for `(label, id)`, created on first use. Children
    /// of a readonly context (or one with child locks disabled) are
    /// readonly.
    #[must_use]
    pub fn child(self: &Arc<Self>, label: &str, id: u64) -> Arc<Self> {
        let mut children = self.children.lock();
        Arc::clone(children.entry(id).or_insert_with(|| {
            Arc::new(Self {
                manager: Arc::clone(&self.manager),
                parent: Arc::downgrade(self),
                name: self.name.child(label, id),
                readonly: self.readonly || self.child_locks_disabled.load(Ordering::Acquire),
                child_locks_disabled: AtomicBool::new(false),
                num_child_locks: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
            })
        }))
    }

    /// This context's resource name.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// The parent context, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.upgrade()
    }

    /// The underlying lock manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    /// Mark all *new* child contexts readonly. Used for indexes and
    /// temporary tables, where finer-grained locks are disallowed.
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, Ordering::Release);
    }

    /// The number of locks `transaction` holds on descendants of this node.
    #[must_use]
    pub fn get_num_children(&self, transaction_id: TransactionId) -> usize {
        self.num_child_locks
            .lock()
            .get(&transaction_id)
            .copied()
            .unwrap_or(0)
    }

    /// Acquire `lock_type` here, enforcing the multigranularity
    /// preconditions against the ancestors.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a readonly context; `InvalidLock` if the
    /// parent's lock does not admit this child lock or an ancestor SIX
    /// makes it redundant; `DuplicateLockRequest` from the lock manager.
    pub fn acquire(self: &Arc<Self>, transaction: &Arc<Transaction>, lock_type: LockType) -> Result<()> {
        self.check_writable()?;
        self.check_multigranularity(transaction.id(), lock_type)?;
        self.manager.acquire(transaction, &self.name, lock_type)?;
        if let Some(parent) = self.parent() {
            parent.add_child_locks(transaction.id(), 1);
        }
        Ok(())
    }

    /// Release the lock held here. Locks must be released bottom-up.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a readonly context; `InvalidLock` if the
    /// transaction still holds locks below this node; `NoLockHeld` from the
    /// lock manager.
    pub fn release(self: &Arc<Self>, transaction: &Arc<Transaction>) -> Result<()> {
        self.check_writable()?;
        if self.get_num_children(transaction.id()) > 0 {
            return Err(GraniteError::InvalidLock {
                reason: format!(
                    "cannot release {} before the locks below it",
                    self.name
                ),
            });
        }
        self.manager.release(transaction, &self.name)?;
        if let Some(parent) = self.parent() {
            parent.remove_child_locks(transaction.id(), 1);
        }
        Ok(())
    }

    /// Promote the lock held here to `new_type`.
    ///
    /// Promotion to SIX (valid from IS, IX, or S) atomically releases every
    /// S and IS lock the transaction holds below this node, since SIX makes
    /// them redundant.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a readonly context; `InvalidLock` if the
    /// new type violates multigranularity, is not an upgrade, or an
    /// ancestor already holds SIX; `NoLockHeld` / `DuplicateLockRequest`
    /// as for the lock manager.
    pub fn promote(
        self: &Arc<Self>,
        transaction: &Arc<Transaction>,
        new_type: LockType,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_multigranularity(transaction.id(), new_type)?;

        if new_type != LockType::SIX {
            return self.manager.promote(transaction, &self.name, new_type);
        }

        if self.has_six_ancestor(transaction.id()) {
            return Err(GraniteError::InvalidLock {
                reason: format!(
                    "an ancestor of {} already holds SIX; promotion is redundant",
                    self.name
                ),
            });
        }
        let held = self.manager.get_lock_type(transaction.id(), &self.name);
        match held {
            LockType::NL => {
                return Err(GraniteError::NoLockHeld {
                    transaction: transaction.id(),
                    resource: self.name.to_string(),
                })
            }
            LockType::SIX => {
                return Err(GraniteError::DuplicateLockRequest {
                    transaction: transaction.id(),
                    resource: self.name.to_string(),
                })
            }
            LockType::IS | LockType::IX | LockType::S => {}
            LockType::X => {
                return Err(GraniteError::InvalidLock {
                    reason: format!("promotion from X to SIX on {} is not an upgrade", self.name),
                })
            }
        }

        // SIX subsumes every S/IS below; swap them out in one critical
        // section so no other transaction observes the intermediate state.
        let redundant: Vec<ResourceName> = self
            .descendant_locks(transaction.id())
            .into_iter()
            .filter(|lock| matches!(lock.lock_type, LockType::S | LockType::IS))
            .map(|lock| lock.name)
            .collect();
        let mut release = redundant.clone();
        release.push(self.name.clone());
        self.manager
            .acquire_and_release(transaction, &self.name, LockType::SIX, release)?;
        debug!(transaction = transaction.id(), context = %self.name, released = redundant.len(),
            "promoted to SIX");
        for name in &redundant {
            if let Some(parent_name) = name.parent() {
                self.resolve(&parent_name)
                    .remove_child_locks(transaction.id(), 1);
            }
        }
        Ok(())
    }

    /// Replace this node's intent lock and every descendant lock with a
    /// single S or X here: S when the current lock and all descendant locks
    /// are substitutable by S, X otherwise. A no-op when S or X is already
    /// held; exactly one mutating lock-manager call otherwise.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a readonly context; `NoLockHeld` if the
    /// transaction holds nothing at this level.
    pub fn escalate(self: &Arc<Self>, transaction: &Arc<Transaction>) -> Result<()> {
        self.check_writable()?;
        let held = self.manager.get_lock_type(transaction.id(), &self.name);
        if held == LockType::NL {
            return Err(GraniteError::NoLockHeld {
                transaction: transaction.id(),
                resource: self.name.to_string(),
            });
        }
        if matches!(held, LockType::S | LockType::X) {
            return Ok(());
        }

        let descendants = self.descendant_locks(transaction.id());
        let mut target = if LockType::substitutable(LockType::S, held) {
            LockType::S
        } else {
            LockType::X
        };
        if descendants
            .iter()
            .any(|lock| !LockType::substitutable(LockType::S, lock.lock_type))
        {
            target = LockType::X;
        }

        let mut release: Vec<ResourceName> =
            descendants.into_iter().map(|lock| lock.name).collect();
        release.push(self.name.clone());
        self.manager
            .acquire_and_release(transaction, &self.name, target, release)?;
        self.clear_child_counts(transaction.id());
        debug!(transaction = transaction.id(), context = %self.name, target = %target,
            "escalated subtree");
        Ok(())
    }

    /// The lock `transaction` holds exactly at this level, or NL.
    #[must_use]
    pub fn get_explicit_lock_type(&self, transaction_id: TransactionId) -> LockType {
        self.manager.get_lock_type(transaction_id, &self.name)
    }

    /// The lock `transaction` effectively has here: the explicit lock if it
    /// is a real (non-intent) lock, otherwise the first non-intent ancestor
    /// lock (with an ancestor SIX counting as S).
    #[must_use]
    pub fn get_effective_lock_type(&self, transaction_id: TransactionId) -> LockType {
        let explicit = self.get_explicit_lock_type(transaction_id);
        if explicit == LockType::NL || explicit.is_intent() {
            if let Some(parent) = self.parent() {
                let inherited = parent.get_effective_lock_type(transaction_id);
                if !inherited.is_intent() {
                    return inherited;
                }
                if inherited == LockType::SIX {
                    return LockType::S;
                }
            }
        }
        explicit
    }

    /// Whether any strict ancestor holds SIX for `transaction`.
    #[must_use]
    pub fn has_six_ancestor(&self, transaction_id: TransactionId) -> bool {
        let mut current = self.parent();
        while let Some(ctx) = current {
            if ctx.get_explicit_lock_type(transaction_id) == LockType::SIX {
                return true;
            }
            current = ctx.parent();
        }
        false
    }

    /// Every lock `transaction` holds strictly below this node, found
    /// through the lock manager's per-transaction index (the materialized
    /// children map may not cover all of them).
    fn descendant_locks(&self, transaction_id: TransactionId) -> Vec<Lock> {
        self.manager
            .get_transaction_locks(transaction_id)
            .into_iter()
            .filter(|lock| lock.name.is_descendant_of(&self.name))
            .collect()
    }

    /// Resolve a name at or below this node to its context, materializing
    /// intermediate children as needed.
    fn resolve(self: &Arc<Self>, name: &ResourceName) -> Arc<Self> {
        debug_assert!(name == &self.name || name.is_descendant_of(&self.name));
        let mut ctx = Arc::clone(self);
        for level in &name.levels()[self.name.depth()..] {
            ctx = ctx.child(&level.label, level.id);
        }
        ctx
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(GraniteError::UnsupportedOperation {
                reason: format!("lock context for {} is read-only", self.name),
            });
        }
        Ok(())
    }

    /// The multigranularity preconditions on an acquire or promote:
    /// S and IS need IS/IX on the parent and no SIX ancestor; X, IX and
    /// SIX need IX/SIX on the parent. The root has no parent check.
    fn check_multigranularity(&self, transaction_id: TransactionId, lock_type: LockType) -> Result<()> {
        let Some(parent) = self.parent() else {
            return Ok(());
        };
        let parent_held = parent.get_explicit_lock_type(transaction_id);
        match lock_type {
            LockType::S | LockType::IS => {
                if self.has_six_ancestor(transaction_id) {
                    return Err(GraniteError::InvalidLock {
                        reason: format!(
                            "an ancestor of {} holds SIX; {lock_type} here is redundant",
                            self.name
                        ),
                    });
                }
                if !matches!(parent_held, LockType::IS | LockType::IX) {
                    return Err(GraniteError::InvalidLock {
                        reason: format!(
                            "{lock_type} on {} requires IS or IX on the parent (held: {parent_held})",
                            self.name
                        ),
                    });
                }
            }
            LockType::X | LockType::IX | LockType::SIX => {
                if !matches!(parent_held, LockType::IX | LockType::SIX) {
                    return Err(GraniteError::InvalidLock {
                        reason: format!(
                            "{lock_type} on {} requires IX or SIX on the parent (held: {parent_held})",
                            self.name
                        ),
                    });
                }
            }
            LockType::NL => {}
        }
        Ok(())
    }

    fn add_child_locks(&self, transaction_id: TransactionId, n: usize) {
        *self.num_child_locks.lock().entry(transaction_id).or_insert(0) += n;
    }

    fn remove_child_locks(&self, transaction_id: TransactionId, n: usize) {
        let mut counts = self.num_child_locks.lock();
        if let Some(count) = counts.get_mut(&transaction_id) {
            *count = count.saturating_sub(n);
        }
    }

    /// Zero the transaction's child-lock counts across this whole subtree.
    fn clear_child_counts(&self, transaction_id: TransactionId) {
        self.num_child_locks.lock().remove(&transaction_id);
        for child in self.children.lock().values() {
            child.clear_child_counts(transaction_id);
        }
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name.to_string())
            .field("readonly", &self.readonly)
            .finish()
    }
}

/// Release every lock `transaction` holds under (and including) `root`,
/// deepest first so the bottom-up rule is never violated. Used when a
/// transaction is cleaned up during recovery.
///
/// # Errors
///
/// Propagates lock-manager errors; with a quiescent transaction these do
/// not occur.
pub fn release_all_locks(root: &Arc<LockContext>, transaction: &Arc<Transaction>) -> Result<()> {
    let mut locks = root
        .manager()
        .get_transaction_locks(transaction.id());
    locks.sort_by(|a, b| b.name.depth().cmp(&a.name.depth()));
    for lock in locks {
        if lock.name == *root.name() || lock.name.is_descendant_of(root.name()) {
            root.resolve(&lock.name).release(transaction)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<LockContext>, Arc<Transaction>) {
        let db = LockContext::database(Arc::new(LockManager::new()));
        (db, Arc::new(Transaction::new(0)))
    }

    #[test]
    fn test_child_requires_parent_intent() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        assert!(matches!(
            table.acquire(&t0, LockType::S),
            Err(GraniteError::InvalidLock { .. })
        ));
        db.acquire(&t0, LockType::IS).unwrap();
        table.acquire(&t0, LockType::S).unwrap();
        assert_eq!(db.get_num_children(0), 1);
    }

    #[test]
    fn test_release_is_bottom_up() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        db.acquire(&t0, LockType::IS).unwrap();
        table.acquire(&t0, LockType::S).unwrap();

        assert!(matches!(
            db.release(&t0),
            Err(GraniteError::InvalidLock { .. })
        ));
        table.release(&t0).unwrap();
        assert_eq!(db.get_num_children(0), 0);
        db.release(&t0).unwrap();
    }

    #[test]
    fn test_six_makes_descendant_shared_locks_redundant() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        let page = table.child("page", 2);
        db.acquire(&t0, LockType::SIX).unwrap();
        assert!(matches!(
            table.acquire(&t0, LockType::IS),
            Err(GraniteError::InvalidLock { .. })
        ));
        // Writes below SIX are still fine.
        table.acquire(&t0, LockType::IX).unwrap();
        page.acquire(&t0, LockType::X).unwrap();
    }

    #[test]
    fn test_promote_to_six_releases_sis_descendants() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        db.acquire(&t0, LockType::IX).unwrap();
        table.acquire(&t0, LockType::S).unwrap();

        db.promote(&t0, LockType::SIX).unwrap();
        assert_eq!(db.get_explicit_lock_type(0), LockType::SIX);
        assert_eq!(table.get_explicit_lock_type(0), LockType::NL);
        assert_eq!(db.get_num_children(0), 0);
    }

    #[test]
    fn test_effective_lock_type_inherits() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        let page = table.child("page", 2);

        db.acquire(&t0, LockType::SIX).unwrap();
        table.acquire(&t0, LockType::IX).unwrap();
        // SIX above an intent chain reads as S below.
        assert_eq!(page.get_effective_lock_type(0), LockType::S);
        assert_eq!(table.get_effective_lock_type(0), LockType::S);

        page.acquire(&t0, LockType::X).unwrap();
        assert_eq!(page.get_effective_lock_type(0), LockType::X);
    }

    #[test]
    fn test_escalate_minimality() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        db.acquire(&t0, LockType::IS).unwrap();
        table.acquire(&t0, LockType::IS).unwrap();
        let p1 = table.child("page", 1);
        let p2 = table.child("page", 2);
        p1.acquire(&t0, LockType::S).unwrap();
        p2.acquire(&t0, LockType::S).unwrap();

        // Only S/IS below: escalation picks S.
        table.escalate(&t0).unwrap();
        assert_eq!(table.get_explicit_lock_type(0), LockType::S);
        assert_eq!(p1.get_explicit_lock_type(0), LockType::NL);
        assert_eq!(p2.get_explicit_lock_type(0), LockType::NL);
        assert_eq!(table.get_num_children(0), 0);

        // Second call is a no-op.
        table.escalate(&t0).unwrap();
        assert_eq!(table.get_explicit_lock_type(0), LockType::S);
    }

    #[test]
    fn test_escalate_with_exclusive_descendant_yields_x() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        db.acquire(&t0, LockType::IX).unwrap();
        table.acquire(&t0, LockType::IX).unwrap();
        let p1 = table.child("page", 1);
        let p2 = table.child("page", 2);
        p1.acquire(&t0, LockType::S).unwrap();
        p2.acquire(&t0, LockType::X).unwrap();

        table.escalate(&t0).unwrap();
        assert_eq!(table.get_explicit_lock_type(0), LockType::X);
        assert_eq!(p1.get_explicit_lock_type(0), LockType::NL);
        assert_eq!(p2.get_explicit_lock_type(0), LockType::NL);
    }

    #[test]
    fn test_escalate_without_lock_rejected() {
        let (db, t0) = setup();
        assert!(matches!(
            db.escalate(&t0),
            Err(GraniteError::NoLockHeld { .. })
        ));
    }

    #[test]
    fn test_readonly_context_rejects_mutation() {
        let (db, t0) = setup();
        db.disable_child_locks();
        let index = db.child("index", 9);
        db.acquire(&t0, LockType::IX).unwrap();
        assert!(matches!(
            index.acquire(&t0, LockType::X),
            Err(GraniteError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            index.release(&t0),
            Err(GraniteError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            index.escalate(&t0),
            Err(GraniteError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_release_all_locks_is_bottom_up() {
        let (db, t0) = setup();
        let table = db.child("table", 1);
        let page = table.child("page", 5);
        db.acquire(&t0, LockType::IX).unwrap();
        table.acquire(&t0, LockType::IX).unwrap();
        page.acquire(&t0, LockType::X).unwrap();

        release_all_locks(&db, &t0).unwrap();
        assert!(db.manager().get_transaction_locks(0).is_empty());
        assert_eq!(db.get_num_children(0), 0);
    }
}
