use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;
use medulla_shared::mem::PAGE_FRAME_SIZE;

/// The physical page pool backing user frames.
///
/// Pages come out zero-filled; `release_page` returns a page previously
/// acquired from the same pool.
pub trait FramePool {
    fn acquire_zeroed_page(&mut self) -> Option<NonNull<u8>>;
    fn release_page(&mut self, kva: NonNull<u8>);
}

/// Fixed-capacity pool of heap-backed pages.
///
/// Stands in for the boot-time user pool when running on the host; the page
/// boxes never move, so handed-out pointers stay valid until the pool drops.
pub struct PoolAllocator {
    backing: Vec<Box<[u8; PAGE_FRAME_SIZE]>>,
    // kernel address of each page -> index into `backing`
    index: BTreeMap<usize, usize>,
    free: Vec<usize>,
}

impl PoolAllocator {
    pub fn new(frames: usize) -> Self {
        let mut backing = Vec::with_capacity(frames);
        let mut index = BTreeMap::new();
        for i in 0..frames {
            let mut page = Box::new([0u8; PAGE_FRAME_SIZE]);
            index.insert(page.as_mut_ptr() as usize, i);
            backing.push(page);
        }
        let free = (0..frames).rev().collect();
        PoolAllocator {
            backing,
            index,
            free,
        }
    }

    /// Number of pages currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl FramePool for PoolAllocator {
    fn acquire_zeroed_page(&mut self) -> Option<NonNull<u8>> {
        let slot = self.free.pop()?;
        let page = &mut self.backing[slot];
        page.fill(0);
        NonNull::new(page.as_mut_ptr())
    }

    fn release_page(&mut self, kva: NonNull<u8>) {
        let Some(&slot) = self.index.get(&(kva.as_ptr() as usize)) else {
            panic!("released page does not belong to this pool");
        };
        if self.free.contains(&slot) {
            panic!("double release of pool page {}", slot);
        }
        self.free.push(slot);
    }
}
