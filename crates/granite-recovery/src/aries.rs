//! The ARIES recovery manager.
//!
//! Forward processing appends log records ahead of every page or
//! allocation change and keeps the dirty page table and transaction table
//! current. Restart runs analysis (rebuild the tables from the last
//! checkpoint, re-acquiring page locks), redo (repeat history from the
//! smallest recLSN), and undo (roll back every loser transaction in
//! descending LSN order), then checkpoints.

use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use granite_concurrency::{release_all_locks, LockContext, LockType, LockUtil};
use granite_error::{GraniteError, Result};
use granite_storage::traits::{BufferManager, DiskSpaceManager};
use granite_storage::{EFFECTIVE_PAGE_SIZE, LOG_PARTITION};
use granite_types::{
    Lsn, PageNum, PartitionNum, Transaction, TransactionId, TransactionStatus,
};
use granite_wal::{LogEntry, LogManager, LogRecord};

use crate::TransactionTableEntry;

/// Creates the transaction handle for a transaction number discovered in
/// the log during restart.
pub type NewTransactionFn = Box<dyn Fn(TransactionId) -> Arc<Transaction> + Send + Sync>;

struct RecoveryState {
    dirty_page_table: BTreeMap<PageNum, Lsn>,
    transaction_table: BTreeMap<TransactionId, TransactionTableEntry>,
}

pub struct AriesRecoveryManager {
    db_context: Arc<LockContext>,
    disk: Arc<dyn DiskSpaceManager>,
    buffer: Arc<dyn BufferManager>,
    log: Arc<LogManager>,
    new_transaction: NewTransactionFn,
    /// Highest transaction number handed out; checkpoints persist it and
    /// analysis restores it.
    transaction_counter: Arc<AtomicU64>,
    state: Mutex<RecoveryState>,
}

impl AriesRecoveryManager {
    #[must_use]
    pub fn new(
        db_context: Arc<LockContext>,
        disk: Arc<dyn DiskSpaceManager>,
        buffer: Arc<dyn BufferManager>,
        log: Arc<LogManager>,
        new_transaction: NewTransactionFn,
        transaction_counter: Arc<AtomicU64>,
    ) -> Self {
        Self {
            db_context,
            disk,
            buffer,
            log,
            new_transaction,
            transaction_counter,
            state: Mutex::new(RecoveryState {
                dirty_page_table: BTreeMap::new(),
                transaction_table: BTreeMap::new(),
            }),
        }
    }

    /// Set up the log of a brand-new database: master record plus an
    /// initial checkpoint.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` if the log already has records.
    pub fn initialize(&self) -> Result<()> {
        if !self.log.is_empty() {
            return Err(GraniteError::UnsupportedOperation {
                reason: "log is already initialized".to_owned(),
            });
        }
        self.log.append(&LogRecord::Master {
            last_checkpoint_lsn: 0,
        });
        self.checkpoint()
    }

    /// The write-ahead hook for the buffer manager: flush the log through
    /// the pageLSN of the page about to be written out. Never called on
    /// log pages.
    ///
    /// # Errors
    ///
    /// Log flush errors propagate.
    pub fn page_flush_hook(&self, page_lsn: Lsn) -> Result<()> {
        self.log.flush_to_lsn(page_lsn)
    }

    /// Called after a page reaches disk: the page is clean, drop it from
    /// the dirty page table.
    pub fn disk_io_hook(&self, page: PageNum) {
        self.state.lock().dirty_page_table.remove(&page);
    }

    // === Forward processing ===

    /// Register a freshly started transaction.
    pub fn start_transaction(&self, transaction: Arc<Transaction>) {
        let mut state = self.state.lock();
        state
            .transaction_table
            .insert(transaction.id(), TransactionTableEntry::new(transaction));
    }

    /// Append the commit record, flush the log through it, and mark the
    /// transaction committing.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn commit(&self, transaction_id: TransactionId) -> Result<Lsn> {
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        let lsn = self.log.append(&LogRecord::Commit {
            transaction_id,
            prev_lsn: entry.last_lsn,
        });
        self.log.flush_to_lsn(lsn)?;
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Committing);
        debug!(transaction = transaction_id, lsn, "commit logged");
        Ok(lsn)
    }

    /// Append the abort record and mark the transaction aborting. The
    /// rollback itself happens at [`end`](Self::end).
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn abort(&self, transaction_id: TransactionId) -> Result<Lsn> {
        let mut state = self.state.lock();
        self.abort_locked(&mut state, transaction_id)
    }

    /// Finish a transaction: roll back its changes if it is aborting,
    /// remove it from the table, and append the end record.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn end(&self, transaction_id: TransactionId) -> Result<Lsn> {
        let mut state = self.state.lock();
        self.end_locked(&mut state, transaction_id)
    }

    /// Log a page write. Oversized writes (after-image larger than half a
    /// page) split into an undo-only record followed by a redo-only
    /// record so either alone fits comfortably in a log page.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn log_page_write(
        &self,
        transaction_id: TransactionId,
        page: PageNum,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> Result<Lsn> {
        debug_assert_eq!(before.len(), after.len());
        debug_assert!(!page.is_log_page());

        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        let (last_lsn, rec_lsn) = if after.len() > EFFECTIVE_PAGE_SIZE / 2 {
            let undo_lsn = self.log.append(&LogRecord::UpdatePage {
                transaction_id,
                page_num: page,
                prev_lsn: entry.last_lsn,
                offset,
                before: before.to_vec(),
                after: Vec::new(),
            });
            let redo_lsn = self.log.append(&LogRecord::UpdatePage {
                transaction_id,
                page_num: page,
                prev_lsn: undo_lsn,
                offset,
                before: Vec::new(),
                after: after.to_vec(),
            });
            (redo_lsn, undo_lsn)
        } else {
            let lsn = self.log.append(&LogRecord::UpdatePage {
                transaction_id,
                page_num: page,
                prev_lsn: entry.last_lsn,
                offset,
                before: before.to_vec(),
                after: after.to_vec(),
            });
            (lsn, lsn)
        };
        entry.last_lsn = last_lsn;
        entry.touched_pages.insert(page);
        state.dirty_page_table.entry(page).or_insert(rec_lsn);
        Ok(last_lsn)
    }

    /// Log a page allocation and flush: the allocation is visible on disk
    /// as soon as this returns. Log-partition pages are not logged.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn log_alloc_page(
        &self,
        transaction_id: TransactionId,
        page: PageNum,
    ) -> Result<Option<Lsn>> {
        if page.is_log_page() {
            return Ok(None);
        }
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        let lsn = self.log.append(&LogRecord::AllocPage {
            transaction_id,
            page_num: page,
            prev_lsn: entry.last_lsn,
        });
        entry.last_lsn = lsn;
        entry.touched_pages.insert(page);
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    /// Log a page free and flush. The page leaves the dirty page table:
    /// freeing is applied directly on disk.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn log_free_page(
        &self,
        transaction_id: TransactionId,
        page: PageNum,
    ) -> Result<Option<Lsn>> {
        if page.is_log_page() {
            return Ok(None);
        }
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        let lsn = self.log.append(&LogRecord::FreePage {
            transaction_id,
            page_num: page,
            prev_lsn: entry.last_lsn,
        });
        entry.last_lsn = lsn;
        entry.touched_pages.insert(page);
        state.dirty_page_table.remove(&page);
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    /// Log a partition allocation and flush.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn log_alloc_partition(
        &self,
        transaction_id: TransactionId,
        partition: PartitionNum,
    ) -> Result<Option<Lsn>> {
        if partition == LOG_PARTITION {
            return Ok(None);
        }
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        let lsn = self.log.append(&LogRecord::AllocPartition {
            transaction_id,
            partition,
            prev_lsn: entry.last_lsn,
        });
        entry.last_lsn = lsn;
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    /// Log a partition free and flush.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn log_free_partition(
        &self,
        transaction_id: TransactionId,
        partition: PartitionNum,
    ) -> Result<Option<Lsn>> {
        if partition == LOG_PARTITION {
            return Ok(None);
        }
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        let lsn = self.log.append(&LogRecord::FreePartition {
            transaction_id,
            partition,
            prev_lsn: entry.last_lsn,
        });
        entry.last_lsn = lsn;
        self.log.flush_to_lsn(lsn)?;
        Ok(Some(lsn))
    }

    /// Record a savepoint at the transaction's current position,
    /// replacing a previous savepoint of the same name.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not in the table.
    pub fn savepoint(&self, transaction_id: TransactionId, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        entry.add_savepoint(name);
        Ok(())
    }

    /// Delete a savepoint.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` / `SavepointNotFound`.
    pub fn release_savepoint(&self, transaction_id: TransactionId, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        if !entry.delete_savepoint(name) {
            return Err(GraniteError::SavepointNotFound {
                transaction: transaction_id,
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    /// Undo everything the transaction did after the savepoint, emitting
    /// CLRs. Status is unchanged.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` / `SavepointNotFound`; undo errors propagate.
    pub fn rollback_to_savepoint(&self, transaction_id: TransactionId, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = table_entry(&mut state, transaction_id)?;
        let target = entry
            .get_savepoint(name)
            .ok_or_else(|| GraniteError::SavepointNotFound {
                transaction: transaction_id,
                name: name.to_owned(),
            })?;
        self.rollback_locked(&mut state, transaction_id, target)
    }

    /// Take a fuzzy checkpoint: begin record, end-checkpoint records
    /// packed greedily (DPT entries, then transaction statuses, then
    /// touched pages), each flushed, and finally the master record
    /// rewrite.
    ///
    /// # Errors
    ///
    /// Log errors propagate.
    pub fn checkpoint(&self) -> Result<()> {
        let begin_lsn = self.log.append(&LogRecord::BeginCheckpoint {
            max_transaction_id: self.transaction_counter.load(Ordering::SeqCst),
        });

        // Snapshot both tables under the monitor; packing and flushing run
        // on the copies.
        let (dpt, txns) = {
            let state = self.state.lock();
            let dpt = state.dirty_page_table.clone();
            let txns: BTreeMap<TransactionId, (TransactionStatus, Lsn, Vec<PageNum>)> = state
                .transaction_table
                .iter()
                .map(|(id, entry)| {
                    (
                        *id,
                        (
                            entry.transaction.status(),
                            entry.last_lsn,
                            entry.touched_pages.iter().copied().collect(),
                        ),
                    )
                })
                .collect();
            (dpt, txns)
        };

        let mut packer = CheckpointPacker::default();
        for (page, rec_lsn) in dpt {
            if !LogRecord::fits_in_one_record(
                packer.dirty_pages.len() + 1,
                packer.transactions.len(),
                packer.touched_keys(),
                packer.touched_total,
            ) {
                packer.emit(&self.log)?;
            }
            packer.dirty_pages.insert(page, rec_lsn);
        }
        for (transaction_id, (status, last_lsn, touched)) in txns {
            if !LogRecord::fits_in_one_record(
                packer.dirty_pages.len(),
                packer.transactions.len() + 1,
                packer.touched_keys(),
                packer.touched_total,
            ) {
                packer.emit(&self.log)?;
            }
            packer.transactions.insert(transaction_id, (status, last_lsn));
            for page in touched {
                let new_key = usize::from(!packer.touched_pages.contains_key(&transaction_id));
                if !LogRecord::fits_in_one_record(
                    packer.dirty_pages.len(),
                    packer.transactions.len(),
                    packer.touched_keys() + new_key,
                    packer.touched_total + 1,
                ) {
                    packer.emit(&self.log)?;
                }
                packer
                    .touched_pages
                    .entry(transaction_id)
                    .or_default()
                    .push(page);
                packer.touched_total += 1;
            }
        }
        // Always at least one end-checkpoint record, even when empty.
        packer.emit(&self.log)?;

        self.log.rewrite_master_record(&LogRecord::Master {
            last_checkpoint_lsn: begin_lsn,
        })?;
        info!(begin_lsn, "checkpoint complete");
        Ok(())
    }

    /// Checkpoint and flush everything for a clean shutdown.
    ///
    /// # Errors
    ///
    /// Log errors propagate.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()?;
        self.log.flush_all()
    }

    // === Restart recovery ===

    /// Run restart recovery: analysis, redo, and a dirty-page-table scrub
    /// happen before this returns; the returned continuation performs
    /// undo and the final checkpoint. New transactions may start as soon
    /// as this returns.
    ///
    /// # Errors
    ///
    /// `MissingMasterRecord` on an uninitialized log; corrupt-log and
    /// storage errors are fatal.
    pub fn restart(self: &Arc<Self>) -> Result<Box<dyn FnOnce() -> Result<()> + Send>> {
        self.restart_analysis()?;
        self.restart_redo()?;
        self.clean_dirty_page_table();
        let this = Arc::clone(self);
        Ok(Box::new(move || {
            this.restart_undo()?;
            this.checkpoint()
        }))
    }

    /// Test/inspection view of the dirty page table.
    #[must_use]
    pub fn dirty_page_table(&self) -> BTreeMap<PageNum, Lsn> {
        self.state.lock().dirty_page_table.clone()
    }

    /// Test/inspection view of the transaction table: status and lastLSN
    /// per live transaction.
    #[must_use]
    pub fn transaction_table(&self) -> BTreeMap<TransactionId, (TransactionStatus, Lsn)> {
        self.state
            .lock()
            .transaction_table
            .iter()
            .map(|(id, entry)| (*id, (entry.transaction.status(), entry.last_lsn)))
            .collect()
    }

    fn restart_analysis(&self) -> Result<()> {
        let master = self
            .log
            .fetch(0)
            .map_err(|_| GraniteError::MissingMasterRecord)?;
        let LogRecord::Master {
            last_checkpoint_lsn,
        } = master.record
        else {
            return Err(GraniteError::MissingMasterRecord);
        };
        info!(last_checkpoint_lsn, "restart analysis");

        let mut state = self.state.lock();
        for entry in self.log.scan_from(last_checkpoint_lsn)? {
            let entry = entry?;
            if let Some(transaction_id) = entry.record.transaction_id() {
                let transaction = {
                    let table_entry = state
                        .transaction_table
                        .entry(transaction_id)
                        .or_insert_with(|| {
                            TransactionTableEntry::new((self.new_transaction)(transaction_id))
                        });
                    table_entry.last_lsn = table_entry.last_lsn.max(entry.lsn);
                    Arc::clone(&table_entry.transaction)
                };

                if let Some(page) = entry.record.page_num() {
                    self.analyze_page_record(&mut state, &entry, &transaction, page)?;
                }

                match entry.record {
                    LogRecord::Commit { .. } => {
                        transaction.set_status(TransactionStatus::Committing);
                    }
                    LogRecord::Abort { .. } => {
                        transaction.set_status(TransactionStatus::RecoveryAborting);
                    }
                    LogRecord::End { .. } => {
                        self.cleanup_transaction(&transaction)?;
                        transaction.set_status(TransactionStatus::Complete);
                        state.transaction_table.remove(&transaction_id);
                    }
                    _ => {}
                }
            }

            match &entry.record {
                LogRecord::BeginCheckpoint { max_transaction_id } => {
                    self.transaction_counter
                        .fetch_max(*max_transaction_id, Ordering::SeqCst);
                }
                LogRecord::EndCheckpoint {
                    dirty_pages,
                    transactions,
                    touched_pages,
                } => {
                    self.merge_end_checkpoint(&mut state, dirty_pages, transactions, touched_pages)?;
                }
                _ => {}
            }
        }

        // Terminal handling: committers finish, runners become losers,
        // completed transactions leave the table.
        let ids: Vec<TransactionId> = state.transaction_table.keys().copied().collect();
        for transaction_id in ids {
            let Some(entry) = state.transaction_table.get(&transaction_id) else {
                continue;
            };
            let transaction = Arc::clone(&entry.transaction);
            match transaction.status() {
                TransactionStatus::Committing => {
                    self.cleanup_transaction(&transaction)?;
                    self.end_locked(&mut state, transaction_id)?;
                }
                TransactionStatus::Running => {
                    self.abort_locked(&mut state, transaction_id)?;
                    transaction.set_status(TransactionStatus::RecoveryAborting);
                }
                TransactionStatus::Complete => {
                    state.transaction_table.remove(&transaction_id);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Analysis handling for a page-tagged record: track the touched
    /// page, re-acquire the transaction's X lock on it, and apply the DPT
    /// rule (updates dirty, frees clean, allocations leave it alone).
    fn analyze_page_record(
        &self,
        state: &mut RecoveryState,
        entry: &LogEntry,
        transaction: &Arc<Transaction>,
        page: PageNum,
    ) -> Result<()> {
        if let Some(table_entry) = state.transaction_table.get_mut(&transaction.id()) {
            table_entry.touched_pages.insert(page);
        }
        self.acquire_page_lock(transaction, page)?;
        match entry.record {
            LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                state.dirty_page_table.entry(page).or_insert(entry.lsn);
            }
            LogRecord::FreePage { .. } | LogRecord::UndoAllocPage { .. } => {
                state.dirty_page_table.remove(&page);
            }
            _ => {}
        }
        Ok(())
    }

    /// Merge one end-checkpoint record into the live tables. Checkpoint
    /// DPT entries overwrite; statuses advance only along legal
    /// transitions (a checkpointed ABORTING becomes RECOVERY_ABORTING).
    fn merge_end_checkpoint(
        &self,
        state: &mut RecoveryState,
        dirty_pages: &BTreeMap<PageNum, Lsn>,
        transactions: &BTreeMap<TransactionId, (TransactionStatus, Lsn)>,
        touched_pages: &BTreeMap<TransactionId, Vec<PageNum>>,
    ) -> Result<()> {
        for (page, rec_lsn) in dirty_pages {
            state.dirty_page_table.insert(*page, *rec_lsn);
        }
        for (transaction_id, (status, last_lsn)) in transactions {
            let table_entry = state
                .transaction_table
                .entry(*transaction_id)
                .or_insert_with(|| {
                    TransactionTableEntry::new((self.new_transaction)(*transaction_id))
                });
            table_entry.last_lsn = table_entry.last_lsn.max(*last_lsn);
            let status = if *status == TransactionStatus::Aborting {
                TransactionStatus::RecoveryAborting
            } else {
                *status
            };
            if table_entry.transaction.status().can_transition_to(status) {
                table_entry.transaction.set_status(status);
            }
        }
        for (transaction_id, pages) in touched_pages {
            let Some(table_entry) = state.transaction_table.get_mut(transaction_id) else {
                continue;
            };
            let transaction = Arc::clone(&table_entry.transaction);
            for page in pages {
                table_entry.touched_pages.insert(*page);
            }
            for page in pages {
                self.acquire_page_lock(&transaction, *page)?;
            }
        }
        Ok(())
    }

    fn restart_redo(&self) -> Result<()> {
        let state = self.state.lock();
        let Some(start) = state.dirty_page_table.values().min().copied() else {
            info!("restart redo: dirty page table empty, nothing to repeat");
            return Ok(());
        };
        info!(start, "restart redo");
        for entry in self.log.scan_from(start)? {
            let entry = entry?;
            if !entry.record.is_redoable() {
                continue;
            }
            match &entry.record {
                // Partition records and page allocations redo
                // unconditionally; they converge idempotently.
                LogRecord::AllocPartition { .. }
                | LogRecord::UndoAllocPartition { .. }
                | LogRecord::FreePartition { .. }
                | LogRecord::UndoFreePartition { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::UndoFreePage { .. } => {
                    entry.redo(&*self.disk, &*self.buffer)?;
                }
                LogRecord::UpdatePage { page_num, .. }
                | LogRecord::UndoUpdatePage { page_num, .. }
                | LogRecord::FreePage { page_num, .. }
                | LogRecord::UndoAllocPage { page_num, .. } => {
                    let gate = state
                        .dirty_page_table
                        .get(page_num)
                        .is_some_and(|rec_lsn| *rec_lsn <= entry.lsn);
                    if gate && self.buffer.page_lsn(*page_num)? < entry.lsn {
                        entry.redo(&*self.disk, &*self.buffer)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Between redo and undo: drop DPT entries for pages that are not
    /// actually dirty in the buffer manager.
    fn clean_dirty_page_table(&self) {
        let mut dirty = HashSet::new();
        self.buffer.iter_page_nums(&mut |page, is_dirty| {
            if is_dirty {
                dirty.insert(page);
            }
        });
        let mut state = self.state.lock();
        state.dirty_page_table.retain(|page, _| dirty.contains(page));
    }

    fn restart_undo(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut to_undo: BinaryHeap<(Lsn, TransactionId)> = state
            .transaction_table
            .iter()
            .filter(|(_, entry)| {
                entry.transaction.status() == TransactionStatus::RecoveryAborting
            })
            .map(|(id, entry)| (entry.last_lsn, *id))
            .collect();
        info!(losers = to_undo.len(), "restart undo");

        while let Some((lsn, transaction_id)) = to_undo.pop() {
            let entry = self.log.fetch(lsn)?;
            let next = if entry.record.is_undoable() {
                self.undo_record(&mut state, &entry)?
            } else {
                entry
                    .record
                    .undo_next_lsn()
                    .or_else(|| entry.record.prev_lsn())
                    .unwrap_or(0)
            };
            if next == 0 {
                if let Some(table_entry) = state.transaction_table.get(&transaction_id) {
                    let transaction = Arc::clone(&table_entry.transaction);
                    self.cleanup_transaction(&transaction)?;
                }
                self.end_locked(&mut state, transaction_id)?;
            } else {
                to_undo.push((next, transaction_id));
            }
        }
        Ok(())
    }

    // === Internals ===

    fn abort_locked(
        &self,
        state: &mut RecoveryState,
        transaction_id: TransactionId,
    ) -> Result<Lsn> {
        let entry = table_entry(state, transaction_id)?;
        let lsn = self.log.append(&LogRecord::Abort {
            transaction_id,
            prev_lsn: entry.last_lsn,
        });
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Aborting);
        debug!(transaction = transaction_id, lsn, "abort logged");
        Ok(lsn)
    }

    fn end_locked(&self, state: &mut RecoveryState, transaction_id: TransactionId) -> Result<Lsn> {
        let status = table_entry(state, transaction_id)?.transaction.status();
        if matches!(
            status,
            TransactionStatus::Aborting | TransactionStatus::RecoveryAborting
        ) {
            self.rollback_locked(state, transaction_id, 0)?;
        }
        let Some(entry) = state.transaction_table.remove(&transaction_id) else {
            return Err(GraniteError::TransactionNotFound {
                transaction: transaction_id,
            });
        };
        let lsn = self.log.append(&LogRecord::End {
            transaction_id,
            prev_lsn: entry.last_lsn,
        });
        entry.transaction.set_status(TransactionStatus::Complete);
        debug!(transaction = transaction_id, lsn, "transaction ended");
        Ok(lsn)
    }

    /// Undo the transaction's records from its `last_lsn` back to (but not
    /// including) `target`, emitting a CLR for each undoable record and
    /// physically applying the compensation.
    fn rollback_locked(
        &self,
        state: &mut RecoveryState,
        transaction_id: TransactionId,
        target: Lsn,
    ) -> Result<()> {
        let last_lsn = table_entry(state, transaction_id)?.last_lsn;
        let last = self.log.fetch(last_lsn)?;
        // If the chain already ends in a CLR, skip what is undone.
        let mut current = last.record.undo_next_lsn().unwrap_or(last.lsn);
        while current > target {
            let entry = self.log.fetch(current)?;
            current = if entry.record.is_undoable() {
                self.undo_record(state, &entry)?
            } else {
                entry.record.prev_lsn().unwrap_or(0)
            };
        }
        Ok(())
    }

    /// One undo step: append the CLR (flushing when the compensation is
    /// disk-visible), maintain the tables, and apply the compensation.
    /// Returns the next LSN in the chain left to undo.
    fn undo_record(&self, state: &mut RecoveryState, entry: &LogEntry) -> Result<Lsn> {
        let transaction_id =
            entry
                .record
                .transaction_id()
                .ok_or_else(|| GraniteError::CorruptLogRecord {
                    lsn: entry.lsn,
                    detail: "undoable record without a transaction".to_owned(),
                })?;
        let last_lsn = table_entry(state, transaction_id)?.last_lsn;
        let Some((clr, flush_needed)) = entry.record.undo(last_lsn) else {
            return Err(GraniteError::UnsupportedOperation {
                reason: format!("log record at LSN {} is not undoable", entry.lsn),
            });
        };
        let clr_lsn = self.log.append(&clr);
        if flush_needed {
            self.log.flush_to_lsn(clr_lsn)?;
        }
        table_entry(state, transaction_id)?.last_lsn = clr_lsn;
        match entry.record {
            // Compensating an update redirties the page.
            LogRecord::UpdatePage { page_num, .. } => {
                state.dirty_page_table.entry(page_num).or_insert(clr_lsn);
            }
            // Compensating an allocation frees the page again.
            LogRecord::AllocPage { page_num, .. } => {
                state.dirty_page_table.remove(&page_num);
            }
            _ => {}
        }
        let next = clr.undo_next_lsn().unwrap_or(0);
        LogEntry {
            lsn: clr_lsn,
            record: clr,
        }
        .redo(&*self.disk, &*self.buffer)?;
        Ok(next)
    }

    /// Release every lock the transaction still holds, deepest first.
    fn cleanup_transaction(&self, transaction: &Arc<Transaction>) -> Result<()> {
        release_all_locks(&self.db_context, transaction)
    }

    /// Re-acquire the X lock a recovered transaction held on `page`,
    /// with ancestor intents.
    fn acquire_page_lock(&self, transaction: &Arc<Transaction>, page: PageNum) -> Result<()> {
        let context = self
            .db_context
            .child("partition", u64::from(page.partition()))
            .child("page", page.get());
        LockUtil::ensure_sufficient(transaction, &context, LockType::X)
    }
}

fn table_entry(
    state: &mut RecoveryState,
    transaction_id: TransactionId,
) -> Result<&mut TransactionTableEntry> {
    state
        .transaction_table
        .get_mut(&transaction_id)
        .ok_or(GraniteError::TransactionNotFound {
            transaction: transaction_id,
        })
}

/// Accumulates one end-checkpoint record's worth of table entries.
#[derive(Default)]
struct CheckpointPacker {
    dirty_pages: BTreeMap<PageNum, Lsn>,
    transactions: BTreeMap<TransactionId, (TransactionStatus, Lsn)>,
    touched_pages: BTreeMap<TransactionId, Vec<PageNum>>,
    touched_total: usize,
}

impl CheckpointPacker {
    fn touched_keys(&self) -> usize {
        self.touched_pages.len()
    }

    /// Append the accumulated record, flush through it, and reset.
    fn emit(&mut self, log: &LogManager) -> Result<()> {
        let record = LogRecord::EndCheckpoint {
            dirty_pages: std::mem::take(&mut self.dirty_pages),
            transactions: std::mem::take(&mut self.transactions),
            touched_pages: std::mem::take(&mut self.touched_pages),
        };
        self.touched_total = 0;
        let lsn = log.append(&record);
        log.flush_to_lsn(lsn)
    }
}
