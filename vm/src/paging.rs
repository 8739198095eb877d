use crate::sync::SpinLock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use medulla_shared::mem::{page_offset, page_round_down};
use medulla_shared::paging::PageTableEntry;

/// The architecture's virtual-to-physical mapping table for one address
/// space, reduced to the operations the memory manager needs. On real
/// hardware this is the pml4 walk plus TLB shootdowns; accessed and dirty
/// bits are maintained by the MMU.
pub trait MappingTable {
    /// Install a user mapping from `va` to `pa`. Fails if `va` is already
    /// mapped.
    fn install(&mut self, va: usize, pa: usize, writable: bool) -> bool;
    fn clear(&mut self, va: usize);
    fn query_accessed(&self, va: usize) -> bool;
    fn reset_accessed(&mut self, va: usize);
    fn query_dirty(&self, va: usize) -> bool;
    fn reset_dirty(&mut self, va: usize);
}

/// Software page table keyed by page-aligned virtual address.
///
/// Serves as the host-side mapping table; `mark_accessed` and `mark_dirty`
/// play the MMU's role when tests simulate user loads and stores.
#[derive(Default)]
pub struct SoftPageTable {
    entries: BTreeMap<usize, PageTableEntry>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel address the (possibly unaligned) `va` currently maps to.
    pub fn translate(&self, va: usize) -> Option<usize> {
        let pte = self.entries.get(&page_round_down(va))?;
        Some(pte.physical_address() + page_offset(va))
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.entries.contains_key(&page_round_down(va))
    }

    /// Simulate the MMU recording a load from `va`.
    pub fn mark_accessed(&mut self, va: usize) {
        if let Some(pte) = self.entries.get_mut(&page_round_down(va)) {
            *pte = pte.with_accessed(true);
        }
    }

    /// Simulate the MMU recording a store to `va`.
    pub fn mark_dirty(&mut self, va: usize) {
        if let Some(pte) = self.entries.get_mut(&page_round_down(va)) {
            *pte = pte.with_accessed(true).with_dirty(true);
        }
    }
}

impl MappingTable for SoftPageTable {
    fn install(&mut self, va: usize, pa: usize, writable: bool) -> bool {
        let va = page_round_down(va);
        if self.entries.contains_key(&va) {
            return false;
        }
        self.entries.insert(va, PageTableEntry::map(pa, writable));
        true
    }

    fn clear(&mut self, va: usize) {
        self.entries.remove(&page_round_down(va));
    }

    fn query_accessed(&self, va: usize) -> bool {
        self.entries
            .get(&page_round_down(va))
            .is_some_and(|pte| pte.accessed())
    }

    fn reset_accessed(&mut self, va: usize) {
        if let Some(pte) = self.entries.get_mut(&page_round_down(va)) {
            *pte = pte.with_accessed(false);
        }
    }

    fn query_dirty(&self, va: usize) -> bool {
        self.entries
            .get(&page_round_down(va))
            .is_some_and(|pte| pte.dirty())
    }

    fn reset_dirty(&mut self, va: usize) {
        if let Some(pte) = self.entries.get_mut(&page_round_down(va)) {
            *pte = pte.with_dirty(false);
        }
    }
}

/// Cloneable handle onto one [`SoftPageTable`], so the VM manager can own
/// the mapping table of an address space while the simulated MMU (or the
/// test acting as it) keeps a view of the same entries.
#[derive(Clone, Default)]
pub struct SharedPageTable(Arc<SpinLock<SoftPageTable>>);

impl SharedPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&self, va: usize) -> Option<usize> {
        self.0.lock().translate(va)
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.0.lock().is_mapped(va)
    }

    pub fn mark_accessed(&self, va: usize) {
        self.0.lock().mark_accessed(va);
    }

    pub fn mark_dirty(&self, va: usize) {
        self.0.lock().mark_dirty(va);
    }
}

impl MappingTable for SharedPageTable {
    fn install(&mut self, va: usize, pa: usize, writable: bool) -> bool {
        self.0.lock().install(va, pa, writable)
    }
    fn clear(&mut self, va: usize) {
        self.0.lock().clear(va);
    }
    fn query_accessed(&self, va: usize) -> bool {
        self.0.lock().query_accessed(va)
    }
    fn reset_accessed(&mut self, va: usize) {
        self.0.lock().reset_accessed(va);
    }
    fn query_dirty(&self, va: usize) -> bool {
        self.0.lock().query_dirty(va)
    }
    fn reset_dirty(&mut self, va: usize) {
        self.0.lock().reset_dirty(va);
    }
}
