//! In-memory disk space manager.
//!
//! Pages live in per-partition hash maps and survive simulated crashes (the
//! harness keeps the `Arc<MemDiskManager>` while dropping every volatile
//! component). Allocation hands out the lowest never-used index per
//! partition so freed numbers are not immediately reused.

use std::collections::HashMap;

use parking_lot::Mutex;

use granite_error::{GraniteError, Result};
use granite_types::{PageNum, PartitionNum};

use crate::{DiskSpaceManager, LOG_PARTITION, PAGE_SIZE};

#[derive(Default)]
struct Partition {
    pages: HashMap<u32, Box<[u8]>>,
    next_index: u32,
}

struct DiskState {
    partitions: HashMap<PartitionNum, Partition>,
    next_partition: PartitionNum,
}

/// Heap-backed [`DiskSpaceManager`].
pub struct MemDiskManager {
    state: Mutex<DiskState>,
}

impl MemDiskManager {
    /// Create a manager with the log partition pre-allocated.
    #[must_use]
    pub fn new() -> Self {
        let mut partitions = HashMap::new();
        partitions.insert(LOG_PARTITION, Partition::default());
        Self {
            state: Mutex::new(DiskState {
                partitions,
                next_partition: LOG_PARTITION + 1,
            }),
        }
    }
}

impl Default for MemDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

fn partition_mut(state: &mut DiskState, partition: PartitionNum) -> Result<&mut Partition> {
    state
        .partitions
        .get_mut(&partition)
        .ok_or(GraniteError::PartitionNotAllocated { partition })
}

impl DiskSpaceManager for MemDiskManager {
    fn alloc_partition(&self) -> Result<PartitionNum> {
        let mut state = self.state.lock();
        let partition = state.next_partition;
        state.next_partition += 1;
        state.partitions.insert(partition, Partition::default());
        Ok(partition)
    }

    fn alloc_partition_at(&self, partition: PartitionNum) -> Result<PartitionNum> {
        let mut state = self.state.lock();
        if state.partitions.contains_key(&partition) {
            return Err(GraniteError::PartitionAlreadyAllocated { partition });
        }
        state.partitions.insert(partition, Partition::default());
        state.next_partition = state.next_partition.max(partition + 1);
        Ok(partition)
    }

    fn free_partition(&self, partition: PartitionNum) -> Result<()> {
        let mut state = self.state.lock();
        state
            .partitions
            .remove(&partition)
            .map(|_| ())
            .ok_or(GraniteError::PartitionNotAllocated { partition })
    }

    fn alloc_page(&self, partition: PartitionNum) -> Result<PageNum> {
        let mut state = self.state.lock();
        let part = partition_mut(&mut state, partition)?;
        let index = part.next_index;
        part.next_index += 1;
        part.pages.insert(index, zeroed_page());
        Ok(PageNum::new(partition, index))
    }

    fn alloc_page_at(&self, page: PageNum) -> Result<PageNum> {
        let mut state = self.state.lock();
        let part = partition_mut(&mut state, page.partition())?;
        if part.pages.contains_key(&page.index()) {
            return Err(GraniteError::PageAlreadyAllocated { page: page.get() });
        }
        part.pages.insert(page.index(), zeroed_page());
        part.next_index = part.next_index.max(page.index() + 1);
        Ok(page)
    }

    fn free_page(&self, page: PageNum) -> Result<()> {
        let mut state = self.state.lock();
        let part = partition_mut(&mut state, page.partition())?;
        part.pages
            .remove(&page.index())
            .map(|_| ())
            .ok_or(GraniteError::PageNotAllocated { page: page.get() })
    }

    fn read_page(&self, page: PageNum, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(GraniteError::PageOutOfBounds {
                page: page.get(),
                offset: 0,
                len: buf.len(),
            });
        }
        let state = self.state.lock();
        let data = state
            .partitions
            .get(&page.partition())
            .and_then(|p| p.pages.get(&page.index()))
            .ok_or(GraniteError::PageNotAllocated { page: page.get() })?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_page(&self, page: PageNum, buf: &[u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(GraniteError::PageOutOfBounds {
                page: page.get(),
                offset: 0,
                len: buf.len(),
            });
        }
        let mut state = self.state.lock();
        let part = partition_mut(&mut state, page.partition())?;
        let data = part
            .pages
            .get_mut(&page.index())
            .ok_or(GraniteError::PageNotAllocated { page: page.get() })?;
        data.copy_from_slice(buf);
        Ok(())
    }

    fn partition_allocated(&self, partition: PartitionNum) -> bool {
        self.state.lock().partitions.contains_key(&partition)
    }

    fn page_allocated(&self, page: PageNum) -> bool {
        self.state
            .lock()
            .partitions
            .get(&page.partition())
            .is_some_and(|p| p.pages.contains_key(&page.index()))
    }
}

fn zeroed_page() -> Box<[u8]> {
    vec![0_u8; PAGE_SIZE].into_boxed_slice()
}
