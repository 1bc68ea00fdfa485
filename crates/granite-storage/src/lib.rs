//! Storage contracts for the Granite engine.
//!
//! The disk space manager and buffer manager are external collaborators of
//! the concurrency and recovery core. This crate defines their trait
//! contracts plus in-memory reference implementations used by the test
//! harness, including crash simulation (volatile frames dropped, durable
//! pages kept).

mod mem_buffer;
mod mem_disk;
pub mod traits;

pub use mem_buffer::MemBufferManager;
pub use mem_disk::MemDiskManager;
pub use traits::{BufferManager, DiskIoHook, DiskSpaceManager, PageFlushHook};

/// Size of a page on disk, including the reserved header area.
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved at the front of every data page (pageLSN plus headroom for
/// the buffer manager's bookkeeping).
pub const RESERVED_SPACE: usize = 36;

/// Usable bytes per data page; all caller-visible page offsets are relative
/// to this area.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - RESERVED_SPACE;

/// The partition reserved for the write-ahead log.
pub const LOG_PARTITION: granite_types::PartitionNum = 0;
