//! The append-only log.
//!
//! The log is a logical byte stream chunked into `PAGE_SIZE` pages of
//! partition 0, written through the disk space manager directly (log pages
//! never go through the buffer pool and never appear in the dirty page
//! table). A record's LSN is its byte offset in the stream, so LSNs are
//! strictly increasing and the master record sits at LSN 0.
//!
//! Durability is tracked exactly: `flushed_lsn` is the first non-durable
//! byte. Flushing writes whole pages but zeroes everything past the
//! boundary, so a crash never surfaces a record that was not flushed.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use granite_error::{GraniteError, Result};
use granite_storage::{DiskSpaceManager, LOG_PARTITION, PAGE_SIZE};
use granite_types::{Lsn, PageNum};

use crate::{LogEntry, LogRecord, MASTER_RECORD_LEN};

struct LogState {
    /// The full logical log image. Bytes at `flushed_lsn` and beyond are
    /// volatile.
    log: Vec<u8>,
    flushed_lsn: Lsn,
}

/// Append-only LSN-assigning log over partition 0.
pub struct LogManager {
    disk: Arc<dyn DiskSpaceManager>,
    state: Mutex<LogState>,
}

impl LogManager {
    /// Open the log stored in partition 0, replaying the durable byte
    /// stream up to the end-of-log sentinel. A fresh database yields an
    /// empty log.
    ///
    /// # Errors
    ///
    /// `CorruptLogRecord` / `LogChecksumMismatch` if the durable prefix
    /// fails to decode.
    pub fn open(disk: Arc<dyn DiskSpaceManager>) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut index = 0_u32;
        loop {
            let page = PageNum::new(LOG_PARTITION, index);
            if !disk.page_allocated(page) {
                break;
            }
            let mut buf = vec![0_u8; PAGE_SIZE];
            disk.read_page(page, &mut buf)?;
            bytes.extend_from_slice(&buf);
            index += 1;
        }

        // Find the end of the record stream; everything after it is
        // zero padding from the last flush.
        let mut pos = 0_usize;
        while pos < bytes.len() && bytes[pos] != 0 {
            let (_, len) = LogRecord::decode(&bytes[pos..], pos as Lsn)?;
            pos += len;
        }
        bytes.truncate(pos);
        info!(durable_bytes = pos, "opened log");
        Ok(Self {
            disk,
            state: Mutex::new(LogState {
                log: bytes,
                flushed_lsn: pos as Lsn,
            }),
        })
    }

    /// Append a record, assigning it the next LSN. The record stays
    /// volatile until a flush covers it.
    pub fn append(&self, record: &LogRecord) -> Lsn {
        let mut state = self.state.lock();
        let lsn = state.log.len() as Lsn;
        state.log.extend_from_slice(&record.encode());
        debug!(lsn, "appended log record");
        lsn
    }

    /// Make the log durable through the *end* of the record at `lsn`.
    /// Monotonic: flushing behind the current boundary is a no-op.
    ///
    /// # Errors
    ///
    /// `LsnOutOfRange` if no record starts at `lsn`.
    pub fn flush_to_lsn(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn < state.flushed_lsn {
            return Ok(());
        }
        let (_, len) = decode_at(&state.log, lsn)?;
        let target = lsn + len as Lsn;
        flush_bytes(&*self.disk, &mut state, target)
    }

    /// Flush the entire log.
    ///
    /// # Errors
    ///
    /// Storage errors propagate.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.log.len() as Lsn;
        flush_bytes(&*self.disk, &mut state, target)
    }

    /// The current durability boundary (first non-durable byte).
    #[must_use]
    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    /// Whether the log contains no records at all (a never-initialized
    /// database).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().log.is_empty()
    }

    /// Fetch the record at `lsn`.
    ///
    /// # Errors
    ///
    /// `LsnOutOfRange` if no record starts there; decode errors propagate.
    pub fn fetch(&self, lsn: Lsn) -> Result<LogEntry> {
        let state = self.state.lock();
        let (record, _) = decode_at(&state.log, lsn)?;
        Ok(LogEntry { lsn, record })
    }

    /// A forward iterator over the records starting at `lsn`, on a
    /// snapshot of the log taken now.
    ///
    /// # Errors
    ///
    /// `LsnOutOfRange` if `lsn` is past the end of the log.
    pub fn scan_from(&self, lsn: Lsn) -> Result<LogScan> {
        let state = self.state.lock();
        if lsn > state.log.len() as Lsn {
            return Err(GraniteError::LsnOutOfRange { lsn });
        }
        Ok(LogScan {
            bytes: state.log.clone(),
            pos: lsn as usize,
        })
    }

    /// Overwrite the master record at LSN 0 and flush it. The encoded
    /// sizes always match, so the rest of the log is untouched.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` if `record` is not a master record;
    /// `MissingMasterRecord` if the log was never initialized.
    pub fn rewrite_master_record(&self, record: &LogRecord) -> Result<()> {
        if !matches!(record, LogRecord::Master { .. }) {
            return Err(GraniteError::UnsupportedOperation {
                reason: "only the master record can be rewritten in place".to_owned(),
            });
        }
        let mut state = self.state.lock();
        if state.log.len() < MASTER_RECORD_LEN {
            return Err(GraniteError::MissingMasterRecord);
        }
        let encoded = record.encode();
        state.log[..MASTER_RECORD_LEN].copy_from_slice(&encoded);

        // Rewrite the durable prefix of page 0 with the new master bytes.
        let covered = (state.flushed_lsn as usize).clamp(MASTER_RECORD_LEN, PAGE_SIZE);
        write_log_page(&*self.disk, &state.log, 0, covered)?;
        state.flushed_lsn = state.flushed_lsn.max(covered as Lsn);
        debug!("rewrote master record");
        Ok(())
    }
}

fn decode_at(log: &[u8], lsn: Lsn) -> Result<(LogRecord, usize)> {
    let pos = lsn as usize;
    if pos >= log.len() {
        return Err(GraniteError::LsnOutOfRange { lsn });
    }
    LogRecord::decode(&log[pos..], lsn)
}

/// Write page `index` of the log from the byte image, carrying `covered`
/// bytes of page content (the rest zeroed).
fn write_log_page(disk: &dyn DiskSpaceManager, log: &[u8], index: u32, covered: usize) -> Result<()> {
    let page = PageNum::new(LOG_PARTITION, index);
    if !disk.page_allocated(page) {
        disk.alloc_page_at(page)?;
    }
    let start = index as usize * PAGE_SIZE;
    let end = (start + covered).min(log.len());
    let mut buf = vec![0_u8; PAGE_SIZE];
    if end > start {
        buf[..end - start].copy_from_slice(&log[start..end]);
    }
    disk.write_page(page, &buf)
}

fn flush_bytes(disk: &dyn DiskSpaceManager, state: &mut LogState, target: Lsn) -> Result<()> {
    if target <= state.flushed_lsn {
        return Ok(());
    }
    let first_page = (state.flushed_lsn as usize) / PAGE_SIZE;
    let last_page = (target as usize - 1) / PAGE_SIZE;
    for index in first_page..=last_page {
        let page_end = (index + 1) * PAGE_SIZE;
        let covered = (target as usize).min(page_end) - index * PAGE_SIZE;
        write_log_page(disk, &state.log, index as u32, covered)?;
    }
    debug!(from = state.flushed_lsn, to = target, "flushed log");
    state.flushed_lsn = target;
    Ok(())
}

/// Forward scan over a snapshot of the log.
pub struct LogScan {
    bytes: Vec<u8>,
    pos: usize,
}

impl Iterator for LogScan {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let lsn = self.pos as Lsn;
        match LogRecord::decode(&self.bytes[self.pos..], lsn) {
            Ok((record, len)) => {
                self.pos += len;
                Some(Ok(LogEntry { lsn, record }))
            }
            Err(err) => {
                self.pos = self.bytes.len();
                Some(Err(err))
            }
        }
    }
}
