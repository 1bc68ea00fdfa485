//! Trait contracts for the disk space manager and buffer manager.
//!
//! The recovery manager holds both behind `Arc<dyn ...>`, so every method is
//! object-safe. Page access is expressed as single calls (pin, operate,
//! unpin folded together) rather than guard objects; implementations pin
//! internally for the duration of the call.

use std::sync::Arc;

use granite_error::Result;
use granite_types::{Lsn, PageNum, PartitionNum};

/// Allocates and frees partitions and pages, identified by 64-bit virtual
/// page numbers with the partition in the high bits.
///
/// Partition 0 belongs to the log and is pre-allocated at creation.
pub trait DiskSpaceManager: Send + Sync {
    /// Allocate a fresh partition and return its number.
    fn alloc_partition(&self) -> Result<PartitionNum>;

    /// Allocate a specific partition. Fails if it already exists. Used by
    /// redo, which must recreate exactly the partition the record names.
    fn alloc_partition_at(&self, partition: PartitionNum) -> Result<PartitionNum>;

    /// Free a partition and every page in it.
    fn free_partition(&self, partition: PartitionNum) -> Result<()>;

    /// Allocate a fresh page in `partition` and return its virtual number.
    fn alloc_page(&self, partition: PartitionNum) -> Result<PageNum>;

    /// Allocate a specific page. Fails if it already exists.
    fn alloc_page_at(&self, page: PageNum) -> Result<PageNum>;

    /// Free a page.
    fn free_page(&self, page: PageNum) -> Result<()>;

    /// Read a full page into `buf` (must be `PAGE_SIZE` bytes).
    fn read_page(&self, page: PageNum, buf: &mut [u8]) -> Result<()>;

    /// Write a full page from `buf` (must be `PAGE_SIZE` bytes).
    fn write_page(&self, page: PageNum, buf: &[u8]) -> Result<()>;

    /// Whether the partition currently exists.
    fn partition_allocated(&self, partition: PartitionNum) -> bool;

    /// Whether the page currently exists.
    fn page_allocated(&self, page: PageNum) -> bool;
}

/// Invoked with a page's pageLSN before the page is written out; the
/// recovery manager flushes the log through that LSN (write-ahead rule).
pub type PageFlushHook = Arc<dyn Fn(Lsn) + Send + Sync>;

/// Invoked after a page has been written to disk; the recovery manager
/// drops the page from the dirty page table.
pub type DiskIoHook = Arc<dyn Fn(PageNum) + Send + Sync>;

/// Caches data pages in memory and tracks each page's LSN and dirty bit.
///
/// Offsets are relative to the usable page area (`EFFECTIVE_PAGE_SIZE`
/// bytes); the pageLSN lives in the reserved header and is maintained
/// through [`write_page`](Self::write_page).
pub trait BufferManager: Send + Sync {
    /// The LSN stamped on the page by its most recent logged write.
    fn page_lsn(&self, page: PageNum) -> Result<Lsn>;

    /// Read `buf.len()` bytes at `offset` in the usable page area.
    fn read_page(&self, page: PageNum, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset` in the usable page area, stamping the page
    /// with `lsn` and marking the frame dirty.
    fn write_page(&self, page: PageNum, offset: usize, data: &[u8], lsn: Lsn) -> Result<()>;

    /// Drop the page's frame without flushing (the page was freed).
    fn discard_page(&self, page: PageNum);

    /// Visit every cached page with its dirty bit.
    fn iter_page_nums(&self, visit: &mut dyn FnMut(PageNum, bool));

    /// Flush every dirty frame to disk, honoring the page-flush hook before
    /// each write and the disk-IO hook after.
    fn flush_all(&self) -> Result<()>;
}
