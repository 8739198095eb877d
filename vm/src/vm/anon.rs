//! Anonymous pages and the swap store behind them.
//!
//! Anonymous memory has no backing file; when its frame is evicted the
//! content moves to a slot on the swap device and comes back on the next
//! fault. A slot covers exactly one page worth of sectors.

use super::{Backend, FrameId, PageId, SlotId, Vm};
use crate::block::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::vec::Vec;
use core::mem;
use core::ptr::NonNull;
use log::trace;
use medulla_shared::mem::PAGE_FRAME_SIZE;

pub const SECTORS_PER_SLOT: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// One page-sized region of the swap device.
pub struct SwapSlot {
    start_sector: BlockSector,
    /// Every swapped-out page whose content lives in this slot. The frame's
    /// whole sharing group lands in one slot, so a slot can hold several
    /// pages.
    pub pages: Vec<PageId>,
}

/// The swap device, partitioned into page-sized slots at startup.
pub struct SwapStore {
    device: Block,
    slots: Vec<SwapSlot>,
    free: Vec<SlotId>,
}

impl SwapStore {
    pub fn new(device: Block) -> Self {
        let count = device.size() as usize / SECTORS_PER_SLOT;
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(SwapSlot {
                start_sector: (i * SECTORS_PER_SLOT) as BlockSector,
                pages: Vec::new(),
            });
        }
        let free = (0..count).rev().map(SlotId).collect();
        SwapStore {
            device,
            slots,
            free,
        }
    }

    pub fn allocate(&mut self) -> Option<SlotId> {
        self.free.pop()
    }

    /// Return `slot` to the free list, wiping its sectors so stale user data
    /// never leaks into the next occupant.
    pub fn release(&mut self, slot: SlotId) {
        let start = self.slots[slot.0].start_sector;
        let zeroes = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_SLOT {
            self.device.write(start + i as BlockSector, &zeroes);
        }
        self.slots[slot.0].pages.clear();
        self.free.push(slot);
    }

    pub fn slot_mut(&mut self, slot: SlotId) -> &mut SwapSlot {
        &mut self.slots[slot.0]
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Write one frame's worth of memory at `kva` into `slot`.
    pub fn write_frame(&mut self, slot: SlotId, kva: NonNull<u8>) {
        let start = self.slots[slot.0].start_sector;
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_SLOT {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    kva.as_ptr().add(i * BLOCK_SECTOR_SIZE),
                    buf.as_mut_ptr(),
                    BLOCK_SECTOR_SIZE,
                );
            }
            self.device.write(start + i as BlockSector, &buf);
        }
    }

    /// Read `slot` into one frame's worth of memory at `kva`.
    pub fn read_frame(&mut self, slot: SlotId, kva: NonNull<u8>) {
        let start = self.slots[slot.0].start_sector;
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_SLOT {
            self.device.read(start + i as BlockSector, &mut buf);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    kva.as_ptr().add(i * BLOCK_SECTOR_SIZE),
                    BLOCK_SECTOR_SIZE,
                );
            }
        }
    }
}

impl Vm {
    /// Evict the anonymous frame `fid`: write its content to a fresh swap
    /// slot and detach every sharer.
    pub(super) fn anon_swap_out(&mut self, fid: FrameId) {
        let Some(slot) = self.swap.allocate() else {
            panic!("out of swap slots");
        };
        let kva = self.frames.get(fid).kva();
        self.swap.write_frame(slot, kva);
        let members = mem::take(&mut self.frames.get_mut(fid).pages);
        trace!("swap out frame {:?} to slot {:?}", fid, slot);
        for pid in members {
            let page = self.page_mut(pid);
            page.frame = None;
            let Backend::Anon(anon) = &mut page.backend else {
                panic!("anonymous eviction of a non-anonymous page");
            };
            anon.slot = Some(slot);
            let (space, va) = (page.space, page.va);
            self.swap.slot_mut(slot).pages.push(pid);
            self.clear_mapping(space, va);
        }
    }

    /// Fill the fresh frame `fid` from the swap slot holding `pid`, then
    /// free the slot. Restores every page of the slot, not just the
    /// faulting one.
    pub(super) fn anon_swap_in(&mut self, pid: PageId, fid: FrameId) {
        let slot = {
            let Backend::Anon(anon) = &mut self.page_mut(pid).backend else {
                panic!("anonymous restore of a non-anonymous page");
            };
            match anon.slot {
                Some(slot) => slot,
                None => panic!("swap-in of a page with no slot"),
            }
        };
        let kva = self.frames.get(fid).kva();
        self.swap.read_frame(slot, kva);
        let members = mem::take(&mut self.swap.slot_mut(slot).pages);
        trace!("swap in slot {:?} to frame {:?}", slot, fid);
        for member in members {
            let page = self.page_mut(member);
            page.frame = Some(fid);
            let Backend::Anon(anon) = &mut page.backend else {
                panic!("anonymous restore of a non-anonymous page");
            };
            anon.slot = None;
            let (space, va, writable) = (page.space, page.va, page.writable);
            self.frames.get_mut(fid).pages.push(member);
            if !self.install_mapping(space, va, kva, writable) {
                // eviction cleared this mapping, so it cannot be occupied
                panic!("stale mapping for restored page");
            }
        }
        self.swap.release(slot);
    }

    /// Drop the anonymous page `pid`, wherever its content currently lives.
    pub(super) fn anon_destroy(&mut self, pid: PageId) {
        let page = self.page(pid);
        let (space, va, frame) = (page.space, page.va, page.frame);
        let Backend::Anon(anon) = &page.backend else {
            panic!("anonymous destroy of a non-anonymous page");
        };
        let slot = anon.slot;
        if let Some(fid) = frame {
            self.unlink_from_frame(pid, fid);
            self.clear_mapping(space, va);
        } else if let Some(slot) = slot {
            let remaining = {
                let pages = &mut self.swap.slot_mut(slot).pages;
                pages.retain(|p| *p != pid);
                pages.len()
            };
            if remaining == 0 {
                self.swap.release(slot);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::RamDisk;

    #[test]
    fn partitioning_and_allocation() {
        let mut swap = SwapStore::new(RamDisk::block(32));
        assert_eq!(swap.free_slots(), 4);
        let a = swap.allocate().unwrap();
        let b = swap.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(swap.free_slots(), 2);
        swap.release(a);
        assert_eq!(swap.free_slots(), 3);
    }

    #[test]
    fn frame_round_trip() {
        let mut swap = SwapStore::new(RamDisk::block(16));
        let mut page = alloc::boxed::Box::new([0u8; PAGE_FRAME_SIZE]);
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let kva = NonNull::new(page.as_mut_ptr()).unwrap();
        let slot = swap.allocate().unwrap();
        swap.write_frame(slot, kva);
        page.fill(0);
        swap.read_frame(slot, kva);
        assert!(page.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    #[test]
    fn release_wipes_slot() {
        let mut swap = SwapStore::new(RamDisk::block(8));
        let mut page = alloc::boxed::Box::new([0x5au8; PAGE_FRAME_SIZE]);
        let kva = NonNull::new(page.as_mut_ptr()).unwrap();
        let slot = swap.allocate().unwrap();
        swap.write_frame(slot, kva);
        swap.release(slot);
        let slot = swap.allocate().unwrap();
        swap.read_frame(slot, kva);
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion() {
        let mut swap = SwapStore::new(RamDisk::block(8));
        assert!(swap.allocate().is_some());
        assert!(swap.allocate().is_none());
    }
}
