use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::passthru::Passthru;

/// Host memory page size; also the device-visible PRP granule.
pub(crate) const PAGE_SIZE: usize = 4096;

/// One device-visible memory region, page-aligned in both address spaces.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DmaRegion {
    pub vaddr: usize,
    pub iova: u64,
    pub len: usize,
}

/// Per-session slab of DMA regions.
///
/// Every region handed out is mapped through the pass-through facility and
/// stays device-reachable at its IOVA until freed. Regions are keyed by
/// virtual base so PRP construction can translate any interior address.
pub(crate) struct MemoryPool {
    dev: Arc<dyn Passthru>,
    regions: Mutex<BTreeMap<usize, DmaRegion>>,
}

impl MemoryPool {
    pub fn new(dev: Arc<dyn Passthru>) -> Self {
        Self {
            dev,
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocate a zeroed region of at least `size` bytes, rounded up to a
    /// page multiple, and map it for device access.
    pub fn alloc(&self, size: usize) -> Result<DmaRegion> {
        if size == 0 {
            return Err(Error::BadArg("zero-length allocation"));
        }
        let len = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| Error::OutOfMemory)?;

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory);
        }

        let vaddr = ptr as usize;
        let iova = match self.dev.map(vaddr, len) {
            Ok(iova) => iova,
            Err(e) => {
                unsafe { dealloc(ptr, layout) };
                log::error!("DMA map of {len} bytes failed: {e}");
                return Err(Error::OutOfMemory);
            }
        };

        let region = DmaRegion { vaddr, iova, len };
        self.regions.lock().insert(vaddr, region);
        Ok(region)
    }

    /// Unmap and release the region whose base is `vaddr`.
    pub fn free(&self, vaddr: usize) -> Result<()> {
        let region = self.regions.lock().remove(&vaddr).ok_or(Error::NotOwned)?;
        self.dev.unmap(region.vaddr)?;
        let layout = Layout::from_size_align(region.len, PAGE_SIZE).expect("pool kept a valid region");
        unsafe { dealloc(region.vaddr as *mut u8, layout) };
        Ok(())
    }

    /// Translate an address inside a pooled region to its IOVA.
    pub fn iova_of(&self, vaddr: usize) -> Result<u64> {
        let regions = self.regions.lock();
        let (_, region) = regions.range(..=vaddr).next_back().ok_or(Error::NotOwned)?;
        if vaddr >= region.vaddr + region.len {
            return Err(Error::NotOwned);
        }
        Ok(region.iova + (vaddr - region.vaddr) as u64)
    }

    /// True if `[vaddr, vaddr + len)` lies within one pooled region.
    pub fn owns(&self, vaddr: usize, len: usize) -> bool {
        let regions = self.regions.lock();
        match regions.range(..=vaddr).next_back() {
            Some((_, region)) => vaddr + len <= region.vaddr + region.len,
            None => false,
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let regions = std::mem::take(&mut *self.regions.lock());
        for region in regions.values() {
            if let Err(e) = self.dev.unmap(region.vaddr) {
                log::warn!("leaking {} byte mapping at close: {e}", region.len);
                continue;
            }
            let layout = Layout::from_size_align(region.len, PAGE_SIZE).expect("pool kept a valid region");
            unsafe { dealloc(region.vaddr as *mut u8, layout) };
        }
    }
}

/// A caller-owned I/O buffer backed by the session pool.
pub struct DmaBuf {
    addr: *mut u8,
    len: usize,
    iova: u64,
}

unsafe impl Send for DmaBuf {}

impl DmaBuf {
    pub(crate) fn new(region: DmaRegion) -> Self {
        Self {
            addr: region.vaddr as *mut u8,
            len: region.len,
            iova: region.iova,
        }
    }

    /// Buffer length in bytes (the requested size rounded up to pages).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the first byte.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub(crate) fn vaddr(&self) -> usize {
        self.addr as usize
    }
}

impl AsRef<[u8]> for DmaBuf {
    fn as_ref(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.addr, self.len) }
    }
}

impl AsMut<[u8]> for DmaBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.addr, self.len) }
    }
}

/// One page reserved for a PRP list.
#[derive(Debug)]
pub(crate) struct PrpPage {
    pub vaddr: usize,
    pub iova: u64,
}

impl PrpPage {
    /// Store the `index`-th list entry.
    pub fn set_entry(&self, index: usize, iova: u64) {
        debug_assert!(index < PAGE_SIZE / 8);
        unsafe { (self.vaddr as *mut u64).add(index).write_volatile(iova) }
    }
}

/// Per-queue slab of PRP-list pages, one per descriptor slot.
///
/// Pre-allocating at queue creation keeps allocation off the submission
/// hot path; recycling goes through a lock-free queue.
pub(crate) struct PrpPagePool {
    pages: ArrayQueue<PrpPage>,
}

impl PrpPagePool {
    pub fn new(pool: &MemoryPool, count: usize) -> Result<Self> {
        let slab = pool.alloc(count * PAGE_SIZE)?;
        let pages = ArrayQueue::new(count);
        for i in 0..count {
            let page = PrpPage {
                vaddr: slab.vaddr + i * PAGE_SIZE,
                iova: slab.iova + (i * PAGE_SIZE) as u64,
            };
            pages.push(page).expect("fresh slab cannot overflow");
        }
        Ok(Self { pages })
    }

    pub fn take(&self) -> Option<PrpPage> {
        self.pages.pop()
    }

    pub fn put(&self, page: PrpPage) {
        // capacity equals the number of pages ever created
        let _ = self.pages.push(page);
    }
}
