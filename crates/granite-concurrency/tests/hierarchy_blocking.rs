//! Cross-transaction scenarios over the full locking stack: lock manager,
//! contexts, and the declarative facade together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use granite_concurrency::{release_all_locks, LockContext, LockManager, LockType, LockUtil};
use granite_types::Transaction;

fn wait_until(pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn test_reader_blocks_table_writer_until_released() {
    let db = LockContext::database(Arc::new(LockManager::new()));
    let t1 = Arc::new(Transaction::new(1));
    let t2 = Arc::new(Transaction::new(2));

    // T1 reads a page; the path picks up IS/IS/S.
    let page = db.child("table", 1).child("page", 4);
    LockUtil::ensure_sufficient(&t1, &page, LockType::S).unwrap();

    // T2 wants the whole table exclusively. Its db-level IX is compatible
    // with T1's IS, but table X conflicts with T1's IS there.
    let writer = {
        let db = Arc::clone(&db);
        let t2 = Arc::clone(&t2);
        std::thread::spawn(move || {
            let table = db.child("table", 1);
            LockUtil::ensure_sufficient(&t2, &table, LockType::X)
        })
    };
    assert!(wait_until(|| t2.is_blocked()));
    assert_eq!(
        db.child("table", 1).get_explicit_lock_type(2),
        LockType::NL
    );

    // T1 finishing up unblocks the writer.
    release_all_locks(&db, &t1).unwrap();
    writer.join().unwrap().unwrap();
    assert_eq!(db.child("table", 1).get_explicit_lock_type(2), LockType::X);
    assert_eq!(
        db.child("table", 1).get_effective_lock_type(2),
        LockType::X
    );
}

#[test]
fn test_two_readers_share_table_after_escalation() {
    let db = LockContext::database(Arc::new(LockManager::new()));
    let t1 = Arc::new(Transaction::new(1));
    let t2 = Arc::new(Transaction::new(2));
    let table = db.child("table", 1);

    LockUtil::ensure_sufficient(&t1, &table.child("page", 1), LockType::S).unwrap();
    LockUtil::ensure_sufficient(&t2, &table.child("page", 2), LockType::S).unwrap();

    // T1 escalates its page locks into a table-level S; T2's IS at the
    // table is compatible, so no blocking.
    table.escalate(&t1).unwrap();
    assert_eq!(table.get_explicit_lock_type(1), LockType::S);
    assert_eq!(table.child("page", 1).get_explicit_lock_type(1), LockType::NL);
    assert_eq!(table.child("page", 2).get_explicit_lock_type(2), LockType::S);
}
