//! In-memory buffer manager.
//!
//! Frames cache whole pages keyed by virtual page number. The pageLSN is
//! stored in the first eight bytes of the reserved header so it survives a
//! flush and a crash. Flushing runs the write-ahead hooks: page-flush hook
//! (with the frame's pageLSN) before the disk write, disk-IO hook after.
//! Hooks are invoked outside the frame-table lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use granite_error::{GraniteError, Result};
use granite_types::encoding::read_u64_le;
use granite_types::{Lsn, PageNum};

use crate::{BufferManager, DiskIoHook, DiskSpaceManager, PageFlushHook};
use crate::{EFFECTIVE_PAGE_SIZE, PAGE_SIZE, RESERVED_SPACE};

struct Frame {
    data: Box<[u8]>,
    dirty: bool,
}

impl Frame {
    fn page_lsn(&self) -> Lsn {
        read_u64_le(&self.data, 0).unwrap_or(0)
    }

    fn set_page_lsn(&mut self, lsn: Lsn) {
        self.data[..8].copy_from_slice(&lsn.to_le_bytes());
    }
}

/// Heap-backed [`BufferManager`] over a [`DiskSpaceManager`].
pub struct MemBufferManager {
    disk: Arc<dyn DiskSpaceManager>,
    frames: Mutex<HashMap<PageNum, Frame>>,
    page_flush_hook: Mutex<Option<PageFlushHook>>,
    disk_io_hook: Mutex<Option<DiskIoHook>>,
}

impl MemBufferManager {
    #[must_use]
    pub fn new(disk: Arc<dyn DiskSpaceManager>) -> Self {
        Self {
            disk,
            frames: Mutex::new(HashMap::new()),
            page_flush_hook: Mutex::new(None),
            disk_io_hook: Mutex::new(None),
        }
    }

    /// Install the write-ahead hook run before each dirty-frame write-out.
    pub fn set_page_flush_hook(&self, hook: PageFlushHook) {
        *self.page_flush_hook.lock() = Some(hook);
    }

    /// Install the hook run after a page reaches disk.
    pub fn set_disk_io_hook(&self, hook: DiskIoHook) {
        *self.disk_io_hook.lock() = Some(hook);
    }

    /// Drop every frame without flushing. Simulates a crash: dirty in-memory
    /// state is lost while the disk keeps whatever was already written.
    pub fn drop_volatile(&self) {
        let dropped = {
            let mut frames = self.frames.lock();
            let n = frames.len();
            frames.clear();
            n
        };
        debug!(frames = dropped, "dropped volatile buffer state");
    }

    fn with_frame<T>(&self, page: PageNum, op: impl FnOnce(&mut Frame) -> T) -> Result<T> {
        let mut frames = self.frames.lock();
        if !frames.contains_key(&page) {
            let mut data = vec![0_u8; PAGE_SIZE].into_boxed_slice();
            self.disk.read_page(page, &mut data)?;
            frames.insert(page, Frame { data, dirty: false });
        }
        let frame = frames
            .get_mut(&page)
            .ok_or(GraniteError::PageNotAllocated { page: page.get() })?;
        Ok(op(frame))
    }
}

fn check_bounds(page: PageNum, offset: usize, len: usize) -> Result<()> {
    if offset.saturating_add(len) > EFFECTIVE_PAGE_SIZE {
        return Err(GraniteError::PageOutOfBounds {
            page: page.get(),
            offset,
            len,
        });
    }
    Ok(())
}

impl BufferManager for MemBufferManager {
    fn page_lsn(&self, page: PageNum) -> Result<Lsn> {
        self.with_frame(page, |frame| frame.page_lsn())
    }

    fn read_page(&self, page: PageNum, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_bounds(page, offset, buf.len())?;
        self.with_frame(page, |frame| {
            let start = RESERVED_SPACE + offset;
            buf.copy_from_slice(&frame.data[start..start + buf.len()]);
        })
    }

    fn write_page(&self, page: PageNum, offset: usize, data: &[u8], lsn: Lsn) -> Result<()> {
        check_bounds(page, offset, data.len())?;
        self.with_frame(page, |frame| {
            let start = RESERVED_SPACE + offset;
            frame.data[start..start + data.len()].copy_from_slice(data);
            frame.set_page_lsn(lsn);
            frame.dirty = true;
        })
    }

    fn discard_page(&self, page: PageNum) {
        self.frames.lock().remove(&page);
    }

    fn iter_page_nums(&self, visit: &mut dyn FnMut(PageNum, bool)) {
        for (page, frame) in self.frames.lock().iter() {
            visit(*page, frame.dirty);
        }
    }

    fn flush_all(&self) -> Result<()> {
        // Snapshot dirty frames so the hooks run without the table lock.
        let to_flush: Vec<(PageNum, Lsn, Box<[u8]>)> = {
            let mut frames = self.frames.lock();
            frames
                .iter_mut()
                .filter(|(_, frame)| frame.dirty)
                .map(|(page, frame)| {
                    frame.dirty = false;
                    (*page, frame.page_lsn(), frame.data.clone())
                })
                .collect()
        };
        let flush_hook = self.page_flush_hook.lock().clone();
        let io_hook = self.disk_io_hook.lock().clone();
        for (page, page_lsn, data) in to_flush {
            if let Some(hook) = &flush_hook {
                hook(page_lsn);
            }
            self.disk.write_page(page, &data)?;
            if let Some(hook) = &io_hook {
                hook(page);
            }
            debug!(page = page.get(), page_lsn, "flushed page");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::MemDiskManager;

    fn setup() -> (Arc<MemDiskManager>, MemBufferManager, PageNum) {
        let disk = Arc::new(MemDiskManager::new());
        let part = disk.alloc_partition().unwrap();
        let page = disk.alloc_page(part).unwrap();
        let buffer = MemBufferManager::new(Arc::clone(&disk) as Arc<dyn DiskSpaceManager>);
        (disk, buffer, page)
    }

    #[test]
    fn test_write_sets_page_lsn_and_dirty() {
        let (_disk, buffer, page) = setup();
        buffer.write_page(page, 10, b"hello", 42).unwrap();
        assert_eq!(buffer.page_lsn(page).unwrap(), 42);

        let mut out = [0_u8; 5];
        buffer.read_page(page, 10, &mut out).unwrap();
        assert_eq!(&out, b"hello");

        let mut dirty = Vec::new();
        buffer.iter_page_nums(&mut |p, d| dirty.push((p, d)));
        assert_eq!(dirty, vec![(page, true)]);
    }

    #[test]
    fn test_flush_runs_hooks_and_persists_lsn() {
        let (disk, buffer, page) = setup();
        let flushed_through = Arc::new(AtomicU64::new(0));
        let io_pages = Arc::new(AtomicU64::new(0));
        {
            let flushed_through = Arc::clone(&flushed_through);
            buffer.set_page_flush_hook(Arc::new(move |lsn| {
                flushed_through.store(lsn, Ordering::SeqCst);
            }));
        }
        {
            let io_pages = Arc::clone(&io_pages);
            buffer.set_disk_io_hook(Arc::new(move |p| {
                io_pages.store(p.get(), Ordering::SeqCst);
            }));
        }

        buffer.write_page(page, 0, b"abc", 99).unwrap();
        buffer.flush_all().unwrap();
        assert_eq!(flushed_through.load(Ordering::SeqCst), 99);
        assert_eq!(io_pages.load(Ordering::SeqCst), page.get());

        // The pageLSN survives a crash: a fresh buffer manager re-reads it.
        buffer.drop_volatile();
        let fresh = MemBufferManager::new(disk as Arc<dyn DiskSpaceManager>);
        assert_eq!(fresh.page_lsn(page).unwrap(), 99);
    }

    #[test]
    fn test_out_of_bounds_write_rejected() {
        let (_disk, buffer, page) = setup();
        let err = buffer
            .write_page(page, EFFECTIVE_PAGE_SIZE - 2, b"xyz", 1)
            .unwrap_err();
        assert!(matches!(err, GraniteError::PageOutOfBounds { .. }));
    }
}
