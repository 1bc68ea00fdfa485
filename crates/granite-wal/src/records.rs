//! Log record model.
//!
//! Records are self-delimited on the wire: a one-byte tag, the fields,
//! and a trailing xxh3 checksum over everything before it. Decoding
//! verifies the checksum, so a torn or corrupted record surfaces as a
//! fatal error rather than silently wrong recovery.

use std::collections::BTreeMap;

use xxhash_rust::xxh3::xxh3_64;

use granite_error::{GraniteError, Result};
use granite_storage::traits::{BufferManager, DiskSpaceManager};
use granite_storage::EFFECTIVE_PAGE_SIZE;
use granite_types::encoding::{
    append_u16_le, append_u32_le, append_u64_le, append_u8, read_u16_le, read_u32_le, read_u64_le,
    read_u8,
};
use granite_types::{Lsn, PageNum, PartitionNum, TransactionId, TransactionStatus};

/// Wire size of the master record (tag + LSN + checksum). Fixed so it can
/// be rewritten in place at LSN 0.
pub const MASTER_RECORD_LEN: usize = 1 + 8 + 8;

const CHECKSUM_LEN: usize = 8;

mod tag {
    pub const MASTER: u8 = 1;
    pub const ALLOC_PAGE: u8 = 2;
    pub const UPDATE_PAGE: u8 = 3;
    pub const FREE_PAGE: u8 = 4;
    pub const ALLOC_PART: u8 = 5;
    pub const FREE_PART: u8 = 6;
    pub const COMMIT: u8 = 7;
    pub const ABORT: u8 = 8;
    pub const END: u8 = 9;
    pub const BEGIN_CHECKPOINT: u8 = 10;
    pub const END_CHECKPOINT: u8 = 11;
    pub const UNDO_ALLOC_PAGE: u8 = 12;
    pub const UNDO_UPDATE_PAGE: u8 = 13;
    pub const UNDO_FREE_PAGE: u8 = 14;
    pub const UNDO_ALLOC_PART: u8 = 15;
    pub const UNDO_FREE_PART: u8 = 16;
}

/// A log record. `prev_lsn` threads each transaction's records into a
/// chain terminating at 0; the `undo_next_lsn` on compensation records
/// (CLRs) skips over work already undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// LSN 0 only: points at the most recent complete begin-checkpoint.
    Master { last_checkpoint_lsn: Lsn },
    /// Start of a fuzzy checkpoint; carries the transaction counter.
    BeginCheckpoint { max_transaction_id: TransactionId },
    /// Checkpoint payload: DPT entries, transaction statuses, touched
    /// pages. Large tables split across several of these.
    EndCheckpoint {
        dirty_pages: BTreeMap<PageNum, Lsn>,
        transactions: BTreeMap<TransactionId, (TransactionStatus, Lsn)>,
        touched_pages: BTreeMap<TransactionId, Vec<PageNum>>,
    },
    Commit {
        transaction_id: TransactionId,
        prev_lsn: Lsn,
    },
    Abort {
        transaction_id: TransactionId,
        prev_lsn: Lsn,
    },
    End {
        transaction_id: TransactionId,
        prev_lsn: Lsn,
    },
    /// A page write. An empty `before` makes it redo-only, an empty
    /// `after` undo-only (the two halves of an oversized write).
    UpdatePage {
        transaction_id: TransactionId,
        page_num: PageNum,
        prev_lsn: Lsn,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// CLR for `UpdatePage`; `after` holds the restored before-image.
    UndoUpdatePage {
        transaction_id: TransactionId,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        offset: u16,
        after: Vec<u8>,
    },
    AllocPage {
        transaction_id: TransactionId,
        page_num: PageNum,
        prev_lsn: Lsn,
    },
    UndoAllocPage {
        transaction_id: TransactionId,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    FreePage {
        transaction_id: TransactionId,
        page_num: PageNum,
        prev_lsn: Lsn,
    },
    UndoFreePage {
        transaction_id: TransactionId,
        page_num: PageNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    AllocPartition {
        transaction_id: TransactionId,
        partition: PartitionNum,
        prev_lsn: Lsn,
    },
    UndoAllocPartition {
        transaction_id: TransactionId,
        partition: PartitionNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    FreePartition {
        transaction_id: TransactionId,
        partition: PartitionNum,
        prev_lsn: Lsn,
    },
    UndoFreePartition {
        transaction_id: TransactionId,
        partition: PartitionNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
}

impl LogRecord {
    /// The transaction this record belongs to, if any.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Self::Master { .. } | Self::BeginCheckpoint { .. } | Self::EndCheckpoint { .. } => None,
            Self::Commit { transaction_id, .. }
            | Self::Abort { transaction_id, .. }
            | Self::End { transaction_id, .. }
            | Self::UpdatePage { transaction_id, .. }
            | Self::UndoUpdatePage { transaction_id, .. }
            | Self::AllocPage { transaction_id, .. }
            | Self::UndoAllocPage { transaction_id, .. }
            | Self::FreePage { transaction_id, .. }
            | Self::UndoFreePage { transaction_id, .. }
            | Self::AllocPartition { transaction_id, .. }
            | Self::UndoAllocPartition { transaction_id, .. }
            | Self::FreePartition { transaction_id, .. }
            | Self::UndoFreePartition { transaction_id, .. } => Some(*transaction_id),
        }
    }

    /// The page this record touches, if any.
    #[must_use]
    pub fn page_num(&self) -> Option<PageNum> {
        match self {
            Self::UpdatePage { page_num, .. }
            | Self::UndoUpdatePage { page_num, .. }
            | Self::AllocPage { page_num, .. }
            | Self::UndoAllocPage { page_num, .. }
            | Self::FreePage { page_num, .. }
            | Self::UndoFreePage { page_num, .. } => Some(*page_num),
            _ => None,
        }
    }

    /// The partition this record touches, if any.
    #[must_use]
    pub fn partition(&self) -> Option<PartitionNum> {
        match self {
            Self::AllocPartition { partition, .. }
            | Self::UndoAllocPartition { partition, .. }
            | Self::FreePartition { partition, .. }
            | Self::UndoFreePartition { partition, .. } => Some(*partition),
            _ => None,
        }
    }

    /// The previous record of the same transaction, if any (0 = chain end).
    #[must_use]
    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            Self::Master { .. } | Self::BeginCheckpoint { .. } | Self::EndCheckpoint { .. } => None,
            Self::Commit { prev_lsn, .. }
            | Self::Abort { prev_lsn, .. }
            | Self::End { prev_lsn, .. }
            | Self::UpdatePage { prev_lsn, .. }
            | Self::UndoUpdatePage { prev_lsn, .. }
            | Self::AllocPage { prev_lsn, .. }
            | Self::UndoAllocPage { prev_lsn, .. }
            | Self::FreePage { prev_lsn, .. }
            | Self::UndoFreePage { prev_lsn, .. }
            | Self::AllocPartition { prev_lsn, .. }
            | Self::UndoAllocPartition { prev_lsn, .. }
            | Self::FreePartition { prev_lsn, .. }
            | Self::UndoFreePartition { prev_lsn, .. } => Some(*prev_lsn),
        }
    }

    /// On CLRs, the next LSN of the original chain left to undo.
    #[must_use]
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match self {
            Self::UndoUpdatePage { undo_next_lsn, .. }
            | Self::UndoAllocPage { undo_next_lsn, .. }
            | Self::UndoFreePage { undo_next_lsn, .. }
            | Self::UndoAllocPartition { undo_next_lsn, .. }
            | Self::UndoFreePartition { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    /// Whether redo applies this record. Status records, checkpoints and
    /// the master record describe bookkeeping, not page state.
    #[must_use]
    pub fn is_redoable(&self) -> bool {
        match self {
            Self::UpdatePage { after, .. } => !after.is_empty(),
            Self::UndoUpdatePage { .. }
            | Self::AllocPage { .. }
            | Self::UndoAllocPage { .. }
            | Self::FreePage { .. }
            | Self::UndoFreePage { .. }
            | Self::AllocPartition { .. }
            | Self::UndoAllocPartition { .. }
            | Self::FreePartition { .. }
            | Self::UndoFreePartition { .. } => true,
            _ => false,
        }
    }

    /// Whether rollback can compensate this record. CLRs are never undone.
    #[must_use]
    pub fn is_undoable(&self) -> bool {
        match self {
            Self::UpdatePage { before, .. } => !before.is_empty(),
            Self::AllocPage { .. }
            | Self::FreePage { .. }
            | Self::AllocPartition { .. }
            | Self::FreePartition { .. } => true,
            _ => false,
        }
    }

    /// Build the CLR compensating this record, chained onto the undoing
    /// transaction's `last_lsn`. The second element is true when the CLR
    /// must be flushed before returning (compensations of allocation
    /// records change the disk immediately).
    ///
    /// Returns `None` for non-undoable records.
    #[must_use]
    pub fn undo(&self, last_lsn: Lsn) -> Option<(LogRecord, bool)> {
        match self {
            Self::UpdatePage {
                transaction_id,
                page_num,
                prev_lsn,
                offset,
                before,
                ..
            } => {
                if before.is_empty() {
                    return None;
                }
                Some((
                    Self::UndoUpdatePage {
                        transaction_id: *transaction_id,
                        page_num: *page_num,
                        prev_lsn: last_lsn,
                        undo_next_lsn: *prev_lsn,
                        offset: *offset,
                        after: before.clone(),
                    },
                    false,
                ))
            }
            Self::AllocPage {
                transaction_id,
                page_num,
                prev_lsn,
            } => Some((
                Self::UndoAllocPage {
                    transaction_id: *transaction_id,
                    page_num: *page_num,
                    prev_lsn: last_lsn,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            Self::FreePage {
                transaction_id,
                page_num,
                prev_lsn,
            } => Some((
                Self::UndoFreePage {
                    transaction_id: *transaction_id,
                    page_num: *page_num,
                    prev_lsn: last_lsn,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            Self::AllocPartition {
                transaction_id,
                partition,
                prev_lsn,
            } => Some((
                Self::UndoAllocPartition {
                    transaction_id: *transaction_id,
                    partition: *partition,
                    prev_lsn: last_lsn,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            Self::FreePartition {
                transaction_id,
                partition,
                prev_lsn,
            } => Some((
                Self::UndoFreePartition {
                    transaction_id: *transaction_id,
                    partition: *partition,
                    prev_lsn: last_lsn,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            _ => None,
        }
    }

    /// Whether an end-checkpoint record with the given table sizes still
    /// fits in one log record: `dpt` DPT entries, `txns` transaction
    /// entries, `touched_keys` touched-page map keys holding
    /// `touched_pages` page numbers in total.
    #[must_use]
    pub fn fits_in_one_record(
        dpt: usize,
        txns: usize,
        touched_keys: usize,
        touched_pages: usize,
    ) -> bool {
        end_checkpoint_size(dpt, txns, touched_keys, touched_pages) <= EFFECTIVE_PAGE_SIZE
    }

    /// Serialize to the self-delimited wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Master { last_checkpoint_lsn } => {
                append_u8(&mut buf, tag::MASTER);
                append_u64_le(&mut buf, *last_checkpoint_lsn);
            }
            Self::BeginCheckpoint { max_transaction_id } => {
                append_u8(&mut buf, tag::BEGIN_CHECKPOINT);
                append_u64_le(&mut buf, *max_transaction_id);
            }
            Self::EndCheckpoint {
                dirty_pages,
                transactions,
                touched_pages,
            } => {
                append_u8(&mut buf, tag::END_CHECKPOINT);
                append_u32_le(&mut buf, dirty_pages.len() as u32);
                for (page, rec_lsn) in dirty_pages {
                    append_u64_le(&mut buf, page.get());
                    append_u64_le(&mut buf, *rec_lsn);
                }
                append_u32_le(&mut buf, transactions.len() as u32);
                for (txn, (status, last_lsn)) in transactions {
                    append_u64_le(&mut buf, *txn);
                    append_u8(&mut buf, encode_status(*status));
                    append_u64_le(&mut buf, *last_lsn);
                }
                append_u32_le(&mut buf, touched_pages.len() as u32);
                for (txn, pages) in touched_pages {
                    append_u64_le(&mut buf, *txn);
                    append_u32_le(&mut buf, pages.len() as u32);
                    for page in pages {
                        append_u64_le(&mut buf, page.get());
                    }
                }
            }
            Self::Commit {
                transaction_id,
                prev_lsn,
            } => encode_status_record(&mut buf, tag::COMMIT, *transaction_id, *prev_lsn),
            Self::Abort {
                transaction_id,
                prev_lsn,
            } => encode_status_record(&mut buf, tag::ABORT, *transaction_id, *prev_lsn),
            Self::End {
                transaction_id,
                prev_lsn,
            } => encode_status_record(&mut buf, tag::END, *transaction_id, *prev_lsn),
            Self::UpdatePage {
                transaction_id,
                page_num,
                prev_lsn,
                offset,
                before,
                after,
            } => {
                append_u8(&mut buf, tag::UPDATE_PAGE);
                append_u64_le(&mut buf, *transaction_id);
                append_u64_le(&mut buf, page_num.get());
                append_u64_le(&mut buf, *prev_lsn);
                append_u16_le(&mut buf, *offset);
                append_u16_le(&mut buf, before.len() as u16);
                buf.extend_from_slice(before);
                append_u16_le(&mut buf, after.len() as u16);
                buf.extend_from_slice(after);
            }
            Self::UndoUpdatePage {
                transaction_id,
                page_num,
                prev_lsn,
                undo_next_lsn,
                offset,
                after,
            } => {
                append_u8(&mut buf, tag::UNDO_UPDATE_PAGE);
                append_u64_le(&mut buf, *transaction_id);
                append_u64_le(&mut buf, page_num.get());
                append_u64_le(&mut buf, *prev_lsn);
                append_u64_le(&mut buf, *undo_next_lsn);
                append_u16_le(&mut buf, *offset);
                append_u16_le(&mut buf, after.len() as u16);
                buf.extend_from_slice(after);
            }
            Self::AllocPage {
                transaction_id,
                page_num,
                prev_lsn,
            } => encode_page_record(&mut buf, tag::ALLOC_PAGE, *transaction_id, *page_num, *prev_lsn),
            Self::FreePage {
                transaction_id,
                page_num,
                prev_lsn,
            } => encode_page_record(&mut buf, tag::FREE_PAGE, *transaction_id, *page_num, *prev_lsn),
            Self::UndoAllocPage {
                transaction_id,
                page_num,
                prev_lsn,
                undo_next_lsn,
            } => encode_undo_page_record(
                &mut buf,
                tag::UNDO_ALLOC_PAGE,
                *transaction_id,
                *page_num,
                *prev_lsn,
                *undo_next_lsn,
            ),
            Self::UndoFreePage {
                transaction_id,
                page_num,
                prev_lsn,
                undo_next_lsn,
            } => encode_undo_page_record(
                &mut buf,
                tag::UNDO_FREE_PAGE,
                *transaction_id,
                *page_num,
                *prev_lsn,
                *undo_next_lsn,
            ),
            Self::AllocPartition {
                transaction_id,
                partition,
                prev_lsn,
            } => encode_part_record(&mut buf, tag::ALLOC_PART, *transaction_id, *partition, *prev_lsn),
            Self::FreePartition {
                transaction_id,
                partition,
                prev_lsn,
            } => encode_part_record(&mut buf, tag::FREE_PART, *transaction_id, *partition, *prev_lsn),
            Self::UndoAllocPartition {
                transaction_id,
                partition,
                prev_lsn,
                undo_next_lsn,
            } => encode_undo_part_record(
                &mut buf,
                tag::UNDO_ALLOC_PART,
                *transaction_id,
                *partition,
                *prev_lsn,
                *undo_next_lsn,
            ),
            Self::UndoFreePartition {
                transaction_id,
                partition,
                prev_lsn,
                undo_next_lsn,
            } => encode_undo_part_record(
                &mut buf,
                tag::UNDO_FREE_PART,
                *transaction_id,
                *partition,
                *prev_lsn,
                *undo_next_lsn,
            ),
        }
        let checksum = xxh3_64(&buf);
        append_u64_le(&mut buf, checksum);
        buf
    }

    /// Decode the record starting at the beginning of `buf`, returning it
    /// with the number of bytes consumed. `lsn` is only used in errors.
    ///
    /// # Errors
    ///
    /// `CorruptLogRecord` on a malformed record, `LogChecksumMismatch` if
    /// the payload does not match its checksum.
    pub fn decode(buf: &[u8], lsn: Lsn) -> Result<(Self, usize)> {
        let corrupt = |detail: &str| GraniteError::CorruptLogRecord {
            lsn,
            detail: detail.to_owned(),
        };
        let record_tag = read_u8(buf, 0).ok_or_else(|| corrupt("empty buffer"))?;
        let mut pos = 1;
        let u64_field = |pos: &mut usize| -> Result<u64> {
            let v = read_u64_le(buf, *pos).ok_or_else(|| corrupt("truncated u64 field"))?;
            *pos += 8;
            Ok(v)
        };
        let record = match record_tag {
            tag::MASTER => Self::Master {
                last_checkpoint_lsn: u64_field(&mut pos)?,
            },
            tag::BEGIN_CHECKPOINT => Self::BeginCheckpoint {
                max_transaction_id: u64_field(&mut pos)?,
            },
            tag::END_CHECKPOINT => {
                let mut dirty_pages = BTreeMap::new();
                let n = read_u32_le(buf, pos).ok_or_else(|| corrupt("truncated DPT count"))?;
                pos += 4;
                for _ in 0..n {
                    let page = PageNum::from_raw(u64_field(&mut pos)?);
                    let rec_lsn = u64_field(&mut pos)?;
                    dirty_pages.insert(page, rec_lsn);
                }
                let mut transactions = BTreeMap::new();
                let n = read_u32_le(buf, pos).ok_or_else(|| corrupt("truncated txn count"))?;
                pos += 4;
                for _ in 0..n {
                    let txn = u64_field(&mut pos)?;
                    let status_raw =
                        read_u8(buf, pos).ok_or_else(|| corrupt("truncated txn status"))?;
                    pos += 1;
                    let status = decode_status(status_raw)
                        .ok_or_else(|| corrupt("unknown transaction status"))?;
                    let last_lsn = u64_field(&mut pos)?;
                    transactions.insert(txn, (status, last_lsn));
                }
                let mut touched_pages = BTreeMap::new();
                let n = read_u32_le(buf, pos).ok_or_else(|| corrupt("truncated touched count"))?;
                pos += 4;
                for _ in 0..n {
                    let txn = u64_field(&mut pos)?;
                    let pages_n =
                        read_u32_le(buf, pos).ok_or_else(|| corrupt("truncated page count"))?;
                    pos += 4;
                    let mut pages = Vec::with_capacity(pages_n as usize);
                    for _ in 0..pages_n {
                        pages.push(PageNum::from_raw(u64_field(&mut pos)?));
                    }
                    touched_pages.insert(txn, pages);
                }
                Self::EndCheckpoint {
                    dirty_pages,
                    transactions,
                    touched_pages,
                }
            }
            tag::COMMIT | tag::ABORT | tag::END => {
                let transaction_id = u64_field(&mut pos)?;
                let prev_lsn = u64_field(&mut pos)?;
                match record_tag {
                    tag::COMMIT => Self::Commit {
                        transaction_id,
                        prev_lsn,
                    },
                    tag::ABORT => Self::Abort {
                        transaction_id,
                        prev_lsn,
                    },
                    _ => Self::End {
                        transaction_id,
                        prev_lsn,
                    },
                }
            }
            tag::UPDATE_PAGE => {
                let transaction_id = u64_field(&mut pos)?;
                let page_num = PageNum::from_raw(u64_field(&mut pos)?);
                let prev_lsn = u64_field(&mut pos)?;
                let offset = read_u16_le(buf, pos).ok_or_else(|| corrupt("truncated offset"))?;
                pos += 2;
                let before = read_bytes(buf, &mut pos).ok_or_else(|| corrupt("truncated before image"))?;
                let after = read_bytes(buf, &mut pos).ok_or_else(|| corrupt("truncated after image"))?;
                Self::UpdatePage {
                    transaction_id,
                    page_num,
                    prev_lsn,
                    offset,
                    before,
                    after,
                }
            }
            tag::UNDO_UPDATE_PAGE => {
                let transaction_id = u64_field(&mut pos)?;
                let page_num = PageNum::from_raw(u64_field(&mut pos)?);
                let prev_lsn = u64_field(&mut pos)?;
                let undo_next_lsn = u64_field(&mut pos)?;
                let offset = read_u16_le(buf, pos).ok_or_else(|| corrupt("truncated offset"))?;
                pos += 2;
                let after = read_bytes(buf, &mut pos).ok_or_else(|| corrupt("truncated after image"))?;
                Self::UndoUpdatePage {
                    transaction_id,
                    page_num,
                    prev_lsn,
                    undo_next_lsn,
                    offset,
                    after,
                }
            }
            tag::ALLOC_PAGE | tag::FREE_PAGE => {
                let transaction_id = u64_field(&mut pos)?;
                let page_num = PageNum::from_raw(u64_field(&mut pos)?);
                let prev_lsn = u64_field(&mut pos)?;
                if record_tag == tag::ALLOC_PAGE {
                    Self::AllocPage {
                        transaction_id,
                        page_num,
                        prev_lsn,
                    }
                } else {
                    Self::FreePage {
                        transaction_id,
                        page_num,
                        prev_lsn,
                    }
                }
            }
            tag::UNDO_ALLOC_PAGE | tag::UNDO_FREE_PAGE => {
                let transaction_id = u64_field(&mut pos)?;
                let page_num = PageNum::from_raw(u64_field(&mut pos)?);
                let prev_lsn = u64_field(&mut pos)?;
                let undo_next_lsn = u64_field(&mut pos)?;
                if record_tag == tag::UNDO_ALLOC_PAGE {
                    Self::UndoAllocPage {
                        transaction_id,
                        page_num,
                        prev_lsn,
                        undo_next_lsn,
                    }
                } else {
                    Self::UndoFreePage {
                        transaction_id,
                        page_num,
                        prev_lsn,
                        undo_next_lsn,
                    }
                }
            }
            tag::ALLOC_PART | tag::FREE_PART => {
                let transaction_id = u64_field(&mut pos)?;
                let partition =
                    read_u32_le(buf, pos).ok_or_else(|| corrupt("truncated partition"))?;
                pos += 4;
                let prev_lsn = u64_field(&mut pos)?;
                if record_tag == tag::ALLOC_PART {
                    Self::AllocPartition {
                        transaction_id,
                        partition,
                        prev_lsn,
                    }
                } else {
                    Self::FreePartition {
                        transaction_id,
                        partition,
                        prev_lsn,
                    }
                }
            }
            tag::UNDO_ALLOC_PART | tag::UNDO_FREE_PART => {
                let transaction_id = u64_field(&mut pos)?;
                let partition =
                    read_u32_le(buf, pos).ok_or_else(|| corrupt("truncated partition"))?;
                pos += 4;
                let prev_lsn = u64_field(&mut pos)?;
                let undo_next_lsn = u64_field(&mut pos)?;
                if record_tag == tag::UNDO_ALLOC_PART {
                    Self::UndoAllocPartition {
                        transaction_id,
                        partition,
                        prev_lsn,
                        undo_next_lsn,
                    }
                } else {
                    Self::UndoFreePartition {
                        transaction_id,
                        partition,
                        prev_lsn,
                        undo_next_lsn,
                    }
                }
            }
            _ => return Err(corrupt("unknown record tag")),
        };
        let stored = read_u64_le(buf, pos).ok_or_else(|| corrupt("truncated checksum"))?;
        if stored != xxh3_64(&buf[..pos]) {
            return Err(GraniteError::LogChecksumMismatch { lsn });
        }
        Ok((record, pos + CHECKSUM_LEN))
    }
}

/// A record together with the LSN it occupies in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub record: LogRecord,
}

impl LogEntry {
    /// Idempotently re-apply this record's effect: page updates rewrite
    /// the after-image and stamp the pageLSN; allocation records converge
    /// the disk to the recorded state.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a non-redoable record; storage errors
    /// propagate.
    pub fn redo(&self, disk: &dyn DiskSpaceManager, buffer: &dyn BufferManager) -> Result<()> {
        match &self.record {
            LogRecord::UpdatePage {
                page_num,
                offset,
                after,
                ..
            } if !after.is_empty() => {
                buffer.write_page(*page_num, usize::from(*offset), after, self.lsn)
            }
            LogRecord::UndoUpdatePage {
                page_num,
                offset,
                after,
                ..
            } => buffer.write_page(*page_num, usize::from(*offset), after, self.lsn),
            LogRecord::AllocPage { page_num, .. } | LogRecord::UndoFreePage { page_num, .. } => {
                if !disk.page_allocated(*page_num) {
                    disk.alloc_page_at(*page_num)?;
                }
                Ok(())
            }
            LogRecord::FreePage { page_num, .. } | LogRecord::UndoAllocPage { page_num, .. } => {
                buffer.discard_page(*page_num);
                if disk.page_allocated(*page_num) {
                    disk.free_page(*page_num)?;
                }
                Ok(())
            }
            LogRecord::AllocPartition { partition, .. }
            | LogRecord::UndoFreePartition { partition, .. } => {
                if !disk.partition_allocated(*partition) {
                    disk.alloc_partition_at(*partition)?;
                }
                Ok(())
            }
            LogRecord::FreePartition { partition, .. }
            | LogRecord::UndoAllocPartition { partition, .. } => {
                if disk.partition_allocated(*partition) {
                    disk.free_partition(*partition)?;
                }
                Ok(())
            }
            _ => Err(GraniteError::UnsupportedOperation {
                reason: format!("log record at LSN {} is not redoable", self.lsn),
            }),
        }
    }
}

fn encode_status_record(buf: &mut Vec<u8>, record_tag: u8, txn: TransactionId, prev: Lsn) {
    append_u8(buf, record_tag);
    append_u64_le(buf, txn);
    append_u64_le(buf, prev);
}

fn encode_page_record(buf: &mut Vec<u8>, record_tag: u8, txn: TransactionId, page: PageNum, prev: Lsn) {
    append_u8(buf, record_tag);
    append_u64_le(buf, txn);
    append_u64_le(buf, page.get());
    append_u64_le(buf, prev);
}

fn encode_undo_page_record(
    buf: &mut Vec<u8>,
    record_tag: u8,
    txn: TransactionId,
    page: PageNum,
    prev: Lsn,
    undo_next: Lsn,
) {
    encode_page_record(buf, record_tag, txn, page, prev);
    append_u64_le(buf, undo_next);
}

fn encode_part_record(
    buf: &mut Vec<u8>,
    record_tag: u8,
    txn: TransactionId,
    partition: PartitionNum,
    prev: Lsn,
) {
    append_u8(buf, record_tag);
    append_u64_le(buf, txn);
    append_u32_le(buf, partition);
    append_u64_le(buf, prev);
}

fn encode_undo_part_record(
    buf: &mut Vec<u8>,
    record_tag: u8,
    txn: TransactionId,
    partition: PartitionNum,
    prev: Lsn,
    undo_next: Lsn,
) {
    encode_part_record(buf, record_tag, txn, partition, prev);
    append_u64_le(buf, undo_next);
}

fn read_bytes(buf: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let len = usize::from(read_u16_le(buf, *pos)?);
    *pos += 2;
    let bytes = buf.get(*pos..pos.checked_add(len)?)?.to_vec();
    *pos += len;
    Some(bytes)
}

const fn encode_status(status: TransactionStatus) -> u8 {
    match status {
        TransactionStatus::Running => 0,
        TransactionStatus::Committing => 1,
        TransactionStatus::Aborting => 2,
        TransactionStatus::RecoveryAborting => 3,
        TransactionStatus::Complete => 4,
    }
}

const fn decode_status(raw: u8) -> Option<TransactionStatus> {
    match raw {
        0 => Some(TransactionStatus::Running),
        1 => Some(TransactionStatus::Committing),
        2 => Some(TransactionStatus::Aborting),
        3 => Some(TransactionStatus::RecoveryAborting),
        4 => Some(TransactionStatus::Complete),
        _ => None,
    }
}

/// Encoded size of an end-checkpoint record with the given table sizes.
/// Kept in lockstep with `encode`; the round-trip test pins them together.
fn end_checkpoint_size(dpt: usize, txns: usize, touched_keys: usize, touched_pages: usize) -> usize {
    1 + CHECKSUM_LEN
        + 4
        + dpt * 16
        + 4
        + txns * 17
        + 4
        + touched_keys * 12
        + touched_pages * 8
}
