//! End-to-end restart recovery scenarios: forward workloads, simulated
//! crashes (volatile state dropped, durable pages kept), and the three-phase
//! restart.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;

use granite_concurrency::{LockContext, LockManager, LockType};
use granite_recovery::AriesRecoveryManager;
use granite_storage::{
    BufferManager, DiskSpaceManager, MemBufferManager, MemDiskManager, EFFECTIVE_PAGE_SIZE,
};
use granite_types::{Lsn, PageNum, Transaction, TransactionStatus};
use granite_wal::{LogManager, LogRecord};

/// Transaction number used for the committed setup transaction that
/// allocates test pages; keeps allocations out of the workload
/// transactions' undo chains.
const SETUP_TXN: u64 = 9;

/// One engine instance over a (possibly pre-existing) disk. Dropping it and
/// opening a new one over the same disk is a crash if nothing was flushed.
struct Engine {
    disk: Arc<MemDiskManager>,
    buffer: Arc<MemBufferManager>,
    log: Arc<LogManager>,
    db: Arc<LockContext>,
    recovery: Arc<AriesRecoveryManager>,
    /// Transactions materialized by restart analysis, in creation order.
    recovered: Arc<Mutex<Vec<Arc<Transaction>>>>,
}

impl Engine {
    fn open(disk: Arc<MemDiskManager>) -> Self {
        let buffer = Arc::new(MemBufferManager::new(
            Arc::clone(&disk) as Arc<dyn DiskSpaceManager>
        ));
        let log = Arc::new(
            LogManager::open(Arc::clone(&disk) as Arc<dyn DiskSpaceManager>).unwrap(),
        );
        let db = LockContext::database(Arc::new(LockManager::new()));
        let recovered: Arc<Mutex<Vec<Arc<Transaction>>>> = Arc::new(Mutex::new(Vec::new()));
        let new_transaction = {
            let recovered = Arc::clone(&recovered);
            Box::new(move |id| {
                let txn = Arc::new(Transaction::new(id));
                recovered.lock().push(Arc::clone(&txn));
                txn
            })
        };
        let recovery = Arc::new(AriesRecoveryManager::new(
            Arc::clone(&db),
            Arc::clone(&disk) as Arc<dyn DiskSpaceManager>,
            Arc::clone(&buffer) as Arc<dyn BufferManager>,
            Arc::clone(&log),
            new_transaction,
            Arc::new(AtomicU64::new(10)),
        ));
        {
            let recovery = Arc::clone(&recovery);
            buffer.set_page_flush_hook(Arc::new(move |lsn| {
                recovery.page_flush_hook(lsn).unwrap();
            }));
        }
        {
            let recovery = Arc::clone(&recovery);
            buffer.set_disk_io_hook(Arc::new(move |page| recovery.disk_io_hook(page)));
        }
        Self {
            disk,
            buffer,
            log,
            db,
            recovery,
            recovered,
        }
    }

    fn fresh() -> Self {
        let engine = Self::open(Arc::new(MemDiskManager::new()));
        engine.recovery.initialize().unwrap();
        engine
    }

    fn begin(&self, id: u64) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(id));
        self.recovery.start_transaction(Arc::clone(&txn));
        txn
    }

    /// Allocate `count` data pages in `partition` under a committed setup
    /// transaction, so workload aborts do not free them again.
    fn setup_pages(&self, partition: u32, count: usize) -> Vec<PageNum> {
        self.begin(SETUP_TXN);
        let pages = (0..count)
            .map(|_| self.alloc_page(SETUP_TXN, partition))
            .collect();
        self.recovery.commit(SETUP_TXN).unwrap();
        self.recovery.end(SETUP_TXN).unwrap();
        pages
    }

    /// Allocate a data page under `txn` and return it.
    fn alloc_page(&self, txn: u64, partition: u32) -> PageNum {
        if !self.disk.partition_allocated(partition) {
            self.disk.alloc_partition_at(partition).unwrap();
            self.recovery.log_alloc_partition(txn, partition).unwrap();
        }
        let page = self.disk.alloc_page(partition).unwrap();
        self.recovery.log_alloc_page(txn, page).unwrap();
        page
    }

    /// A logged page write applied through the buffer manager.
    fn write(&self, txn: u64, page: PageNum, offset: u16, after: &[u8]) -> Lsn {
        let mut before = vec![0_u8; after.len()];
        self.buffer
            .read_page(page, usize::from(offset), &mut before)
            .unwrap();
        let lsn = self
            .recovery
            .log_page_write(txn, page, offset, &before, after)
            .unwrap();
        self.buffer
            .write_page(page, usize::from(offset), after, lsn)
            .unwrap();
        lsn
    }

    fn read(&self, page: PageNum, offset: u16, len: usize) -> Vec<u8> {
        let mut out = vec![0_u8; len];
        self.buffer
            .read_page(page, usize::from(offset), &mut out)
            .unwrap();
        out
    }

    /// Crash: volatile buffer frames and the unflushed log tail are lost;
    /// the disk survives into the next `Engine::open`.
    fn crash(self) -> Arc<MemDiskManager> {
        self.buffer.drop_volatile();
        self.disk
    }

    fn log_records(&self) -> Vec<LogRecord> {
        self.log
            .scan_from(0)
            .unwrap()
            .map(|entry| entry.unwrap().record)
            .collect()
    }
}

#[test]
fn test_restart_reverts_loser_and_keeps_committed() {
    let engine = Engine::fresh();
    let pages = engine.setup_pages(1, 2);
    let (p1, p2) = (pages[0], pages[1]);
    let _t1 = engine.begin(1);
    let _t2 = engine.begin(2);

    engine.write(1, p1, 100, &[0xaa; 8]);
    engine.write(2, p2, 0, &[0xbb; 8]);
    engine.recovery.commit(2).unwrap();
    engine.recovery.end(2).unwrap();

    // Crash with T1 still running. T1's update is durable anyway: T2's
    // commit flushed the log past it.
    let disk = engine.crash();
    let engine = Engine::open(disk);
    let finish = engine.recovery.restart().unwrap();
    finish().unwrap();

    // T2's write survives, T1's is rolled back.
    assert_eq!(engine.read(p2, 0, 8), vec![0xbb; 8]);
    assert_eq!(engine.read(p1, 100, 8), vec![0_u8; 8]);

    // T1 was recovery-aborted to completion: a CLR chained back to the
    // start of its chain, and end records for both transactions.
    let records = engine.log_records();
    let t1_clrs: Vec<&LogRecord> = records
        .iter()
        .filter(|record| {
            matches!(
                record,
                LogRecord::UndoUpdatePage {
                    transaction_id: 1,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(t1_clrs.len(), 1);
    assert_eq!(t1_clrs[0].undo_next_lsn(), Some(0));
    assert!(records
        .iter()
        .any(|record| matches!(record, LogRecord::End { transaction_id: 1, .. })));
    assert!(records
        .iter()
        .any(|record| matches!(record, LogRecord::End { transaction_id: 2, .. })));

    // The transaction table is empty after the post-undo checkpoint.
    assert!(engine.recovery.transaction_table().is_empty());
}

#[test]
fn test_restart_is_idempotent() {
    let engine = Engine::fresh();
    let p1 = engine.setup_pages(1, 1)[0];
    let _t1 = engine.begin(1);
    engine.write(1, p1, 0, &[5; 4]);
    engine.recovery.commit(1).unwrap();

    let disk = engine.crash();
    let engine = Engine::open(disk);
    let finish = engine.recovery.restart().unwrap();
    finish().unwrap();
    let after_first = engine.read(p1, 0, 4);
    assert_eq!(after_first, vec![5; 4]);

    // Clean shutdown: pages flushed, final checkpoint taken.
    engine.buffer.flush_all().unwrap();
    engine.recovery.close().unwrap();
    let records_before = engine.log_records().len();

    // A second restart over the cleanly shut-down state finds nothing to
    // do: no pending transactions, no dirty pages, same page bytes.
    let disk = engine.crash();
    let engine = Engine::open(disk);
    let finish = engine.recovery.restart().unwrap();
    finish().unwrap();
    assert_eq!(engine.read(p1, 0, 4), after_first);
    assert!(engine.recovery.transaction_table().is_empty());
    assert!(engine.recovery.dirty_page_table().is_empty());
    // The second restart adds only its own checkpoint records, no CLRs.
    let new_records = engine.log_records().split_off(records_before);
    assert!(!new_records.is_empty());
    assert!(new_records.iter().all(|record| matches!(
        record,
        LogRecord::BeginCheckpoint { .. } | LogRecord::EndCheckpoint { .. }
    )));
}

#[test]
fn test_forward_abort_restores_page_bytes() {
    let engine = Engine::fresh();
    let p1 = engine.setup_pages(1, 1)[0];
    let _t1 = engine.begin(1);

    engine.write(1, p1, 10, &[1, 1, 1]);
    engine.write(1, p1, 10, &[2, 2, 2]);
    engine.recovery.abort(1).unwrap();
    engine.recovery.end(1).unwrap();

    assert_eq!(engine.read(p1, 10, 3), vec![0, 0, 0]);
    // Two compensations, walking the chain backwards to LSN 0.
    let records = engine.log_records();
    let clr_targets: Vec<Lsn> = records
        .iter()
        .filter_map(|record| match record {
            LogRecord::UndoUpdatePage { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        })
        .collect();
    assert_eq!(clr_targets.len(), 2);
    assert!(clr_targets[0] > clr_targets[1]);
    assert_eq!(clr_targets[1], 0);
    assert!(engine.recovery.transaction_table().is_empty());
}

#[test]
fn test_savepoint_partial_rollback() {
    let engine = Engine::fresh();
    let p1 = engine.setup_pages(1, 1)[0];
    let _t1 = engine.begin(1);

    engine.write(1, p1, 0, &[1; 4]);
    engine.recovery.savepoint(1, "mid").unwrap();
    engine.write(1, p1, 0, &[2; 4]);
    engine.write(1, p1, 4, &[3; 4]);

    engine.recovery.rollback_to_savepoint(1, "mid").unwrap();
    assert_eq!(engine.read(p1, 0, 4), vec![1; 4]);
    assert_eq!(engine.read(p1, 4, 4), vec![0; 4]);

    // The transaction keeps running after the partial rollback.
    engine.write(1, p1, 0, &[9; 4]);
    engine.recovery.commit(1).unwrap();
    engine.recovery.end(1).unwrap();
    assert_eq!(engine.read(p1, 0, 4), vec![9; 4]);

    engine.recovery.release_savepoint(1, "gone").unwrap_err();
}

#[test]
fn test_oversized_write_splits_into_undo_and_redo_halves() {
    let engine = Engine::fresh();
    let p1 = engine.setup_pages(1, 1)[0];
    let _t1 = engine.begin(1);

    let len = EFFECTIVE_PAGE_SIZE / 2 + 1;
    let payload = vec![0xcd_u8; len];
    engine.write(1, p1, 0, &payload);

    let records = engine.log_records();
    let halves: Vec<&LogRecord> = records
        .iter()
        .filter(|record| matches!(record, LogRecord::UpdatePage { transaction_id: 1, .. }))
        .collect();
    assert_eq!(halves.len(), 2);
    match (halves[0], halves[1]) {
        (
            LogRecord::UpdatePage {
                before: b0,
                after: a0,
                ..
            },
            LogRecord::UpdatePage {
                before: b1,
                after: a1,
                ..
            },
        ) => {
            // Undo-only record first, redo-only second.
            assert!(!b0.is_empty() && a0.is_empty());
            assert!(b1.is_empty() && !a1.is_empty());
        }
        _ => unreachable!(),
    }

    // The DPT recLSN points at the first (undo-only) record.
    let dpt = engine.recovery.dirty_page_table();
    let entry = engine.log.fetch(dpt[&p1]).unwrap();
    assert!(matches!(
        entry.record,
        LogRecord::UpdatePage { ref after, .. } if after.is_empty()
    ));
}

#[test]
fn test_checkpoint_packs_within_record_budget() {
    let engine = Engine::fresh();
    let _t1 = engine.begin(1);
    // Dirty enough pages that the DPT alone overflows one record.
    for i in 0..600_u32 {
        let page = engine.alloc_page(1, i / 120 + 1);
        engine.write(1, page, 0, &[i as u8; 2]);
    }
    engine.recovery.checkpoint().unwrap();

    let end_checkpoints: Vec<LogRecord> = engine
        .log_records()
        .into_iter()
        .filter(|record| matches!(record, LogRecord::EndCheckpoint { .. }))
        .collect();
    assert!(end_checkpoints.len() > 2, "DPT should span several records");
    for record in &end_checkpoints {
        assert!(record.encode().len() <= EFFECTIVE_PAGE_SIZE);
    }

    // A crash right after the checkpoint recovers the full DPT from the
    // split records.
    let dpt_before = engine.recovery.dirty_page_table();
    let disk = engine.crash();
    let engine = Engine::open(disk);
    let _finish = engine.recovery.restart().unwrap();
    let dpt_after = engine.recovery.dirty_page_table();
    for (page, rec_lsn) in dpt_before {
        assert_eq!(dpt_after.get(&page), Some(&rec_lsn));
    }
}

#[test]
fn test_wal_rule_on_buffer_flush() {
    let engine = Engine::fresh();
    let p1 = engine.setup_pages(1, 1)[0];
    let _t1 = engine.begin(1);
    let lsn = engine.write(1, p1, 0, &[4; 4]);

    assert!(engine.log.flushed_lsn() <= lsn);
    engine.buffer.flush_all().unwrap();
    // The page hit disk, so the log is durable past its pageLSN and the
    // page left the dirty page table.
    assert!(engine.log.flushed_lsn() > lsn);
    assert!(!engine.recovery.dirty_page_table().contains_key(&p1));
}

#[test]
fn test_redo_starts_at_min_rec_lsn() {
    let engine = Engine::fresh();
    let pages = engine.setup_pages(1, 2);
    let (p1, p2) = (pages[0], pages[1]);
    let _t1 = engine.begin(1);

    engine.write(1, p1, 0, &[1; 2]);
    engine.write(1, p2, 0, &[2; 2]);
    // Both pages reach disk; the DPT drains.
    engine.buffer.flush_all().unwrap();
    assert!(engine.recovery.dirty_page_table().is_empty());

    // Only the third write is left to repeat after a crash.
    let lsn3 = engine.write(1, p2, 0, &[3; 2]);
    assert_eq!(engine.recovery.dirty_page_table()[&p2], lsn3);
    engine.recovery.commit(1).unwrap();

    let disk = engine.crash();
    let engine = Engine::open(disk);
    let finish = engine.recovery.restart().unwrap();
    finish().unwrap();
    assert_eq!(engine.read(p1, 0, 2), vec![1; 2]);
    assert_eq!(engine.read(p2, 0, 2), vec![3; 2]);
}

#[test]
fn test_uninitialized_log_refuses_restart() {
    let engine = Engine::open(Arc::new(MemDiskManager::new()));
    assert!(matches!(
        engine.recovery.restart(),
        Err(granite_error::GraniteError::MissingMasterRecord)
    ));
}

#[test]
fn test_loser_reacquires_locks_and_rolls_back() {
    let engine = Engine::fresh();
    let p1 = engine.setup_pages(1, 1)[0];
    let _t1 = engine.begin(1);
    engine.write(1, p1, 0, &[8; 2]);
    // Make the update durable without committing.
    engine.log.flush_all().unwrap();

    let disk = engine.crash();
    let engine = Engine::open(disk);
    let finish = engine.recovery.restart().unwrap();

    // Between analysis and undo: T1 is a loser and holds X on its page
    // again (re-acquired during analysis).
    let table = engine.recovery.transaction_table();
    assert_eq!(table.len(), 1);
    assert_eq!(table[&1].0, TransactionStatus::RecoveryAborting);
    let page_context = engine
        .db
        .child("partition", u64::from(p1.partition()))
        .child("page", p1.get());
    assert_eq!(page_context.get_explicit_lock_type(1), LockType::X);
    let loser = engine
        .recovered
        .lock()
        .iter()
        .find(|txn| txn.id() == 1)
        .cloned()
        .unwrap();

    finish().unwrap();
    assert!(engine.recovery.transaction_table().is_empty());
    assert_eq!(engine.read(p1, 0, 2), vec![0; 2]);
    assert_eq!(loser.status(), TransactionStatus::Complete);
    // Cleanup released the loser's locks.
    assert_eq!(page_context.get_explicit_lock_type(1), LockType::NL);
}
