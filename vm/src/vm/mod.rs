//! The virtual memory manager.
//!
//! One [`Vm`] instance owns every address space's supplemental page table,
//! the global frame table, the swap store and the physical frame pool. All
//! state lives in arenas addressed by small copyable ids, so pages, frames
//! and swap slots can point at each other without reference cycles.

mod anon;
mod file;
mod frame;
mod page;

pub use anon::{SwapStore, SECTORS_PER_SLOT};
pub use frame::{Frame, FrameTable};
pub use page::{AnonPage, Backend, DeferredPage, FilePage, InitSpec, Page, PageKind, PageState};

use crate::block::Block;
use crate::palloc::FramePool;
use crate::paging::MappingTable;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::mem;
use core::ptr::NonNull;
use log::debug;
use medulla_shared::mem::{
    is_user_vaddr, page_offset, page_round_down, MAX_STACK_SIZE, PAGE_FRAME_SIZE, USER_STACK,
};

/// Width of a stack push, for the stack growth heuristic.
const WORD: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SpaceId(pub(crate) usize);

/// Machine state captured at the faulting instruction.
pub struct FaultContext {
    /// User stack pointer at the time of the fault.
    pub rsp: usize,
}

/// One address space: its hardware mapping table plus the supplemental page
/// table tracking every page the space has reserved, resident or not.
struct Space {
    table: Box<dyn MappingTable>,
    /// Page-aligned virtual address to page id.
    spt: BTreeMap<usize, PageId>,
    /// Stack pointer saved on the last user-to-kernel transition, used when
    /// a fault arrives from kernel mode.
    user_rsp: usize,
}

/// The memory manager.
pub struct Vm {
    pages: Vec<Option<Page>>,
    page_free: Vec<usize>,
    frames: FrameTable,
    swap: SwapStore,
    pool: Box<dyn FramePool>,
    spaces: BTreeMap<SpaceId, Space>,
    next_space: usize,
}

impl Vm {
    pub fn new(pool: Box<dyn FramePool>, swap_device: Block) -> Self {
        Vm {
            pages: Vec::new(),
            page_free: Vec::new(),
            frames: FrameTable::new(),
            swap: SwapStore::new(swap_device),
            pool,
            spaces: BTreeMap::new(),
            next_space: 0,
        }
    }

    /// Register a new address space around its mapping table.
    pub fn create_space(&mut self, table: Box<dyn MappingTable>) -> SpaceId {
        let id = SpaceId(self.next_space);
        self.next_space += 1;
        self.spaces.insert(
            id,
            Space {
                table,
                spt: BTreeMap::new(),
                user_rsp: 0,
            },
        );
        id
    }

    /// Tear down `space`: every page is destroyed, dirty file pages are
    /// written back, and all frames and swap slots it held are released.
    pub fn destroy_space(&mut self, space: SpaceId) {
        let Some(sp) = self.spaces.get(&space) else {
            return;
        };
        let vas: Vec<usize> = sp.spt.keys().copied().collect();
        for va in vas {
            self.remove_page(space, va);
        }
        self.spaces.remove(&space);
    }

    /// Record the user stack pointer on entry to the kernel, so faults
    /// taken in kernel mode can still run the stack growth heuristic.
    pub fn set_user_rsp(&mut self, space: SpaceId, rsp: usize) {
        if let Some(sp) = self.spaces.get_mut(&space) {
            sp.user_rsp = rsp;
        }
    }

    pub fn find_page(&self, space: SpaceId, va: usize) -> Option<PageId> {
        self.spaces.get(&space)?.spt.get(&page_round_down(va)).copied()
    }

    /// Reserve the page at `va` without allocating a frame. The page stays
    /// deferred until the first fault runs `init`.
    pub fn alloc_page_with_initializer(
        &mut self,
        space: SpaceId,
        va: usize,
        writable: bool,
        kind: PageKind,
        init: InitSpec,
    ) -> bool {
        let va = page_round_down(va);
        if va == 0 || !is_user_vaddr(va) {
            return false;
        }
        match (kind, &init) {
            (PageKind::Anon, InitSpec::Zeroed) => {}
            (PageKind::File, InitSpec::LoadFile {
                read_bytes,
                zero_bytes,
                ..
            }) => {
                if read_bytes + zero_bytes != PAGE_FRAME_SIZE {
                    return false;
                }
            }
            _ => return false,
        }
        if !self.spaces.contains_key(&space) || self.find_page(space, va).is_some() {
            return false;
        }
        let pid = self.alloc_page_slot(Page {
            va,
            writable,
            space,
            frame: None,
            backend: Backend::Deferred(DeferredPage { kind, init }),
        });
        if let Some(sp) = self.spaces.get_mut(&space) {
            sp.spt.insert(va, pid);
        }
        true
    }

    /// Reserve a zero-filled anonymous page at `va`.
    pub fn alloc_page(&mut self, space: SpaceId, va: usize, writable: bool) -> bool {
        self.alloc_page_with_initializer(space, va, writable, PageKind::Anon, InitSpec::Zeroed)
    }

    /// Immediately back the page at `va` with a frame, as the fault handler
    /// would. Fails if the page does not exist or is already resident.
    pub fn claim_page(&mut self, space: SpaceId, va: usize) -> bool {
        match self.find_page(space, va) {
            Some(pid) => self.do_claim(pid),
            None => false,
        }
    }

    /// Resolve a page fault. Returns false when the access is fatal and the
    /// faulting thread should be killed.
    pub fn handle_fault(
        &mut self,
        space: SpaceId,
        ctx: &FaultContext,
        addr: usize,
        user: bool,
        write: bool,
        not_present: bool,
    ) -> bool {
        let va = page_round_down(addr);
        if va == 0 || !is_user_vaddr(addr) {
            return false;
        }
        if !not_present {
            // the mapping is present, so this is a protection violation
            return false;
        }
        let rsp = if user {
            ctx.rsp
        } else {
            match self.spaces.get(&space) {
                Some(sp) => sp.user_rsp,
                None => return false,
            }
        };
        match self.find_page(space, addr) {
            Some(pid) => {
                if write && !self.page(pid).writable {
                    return false;
                }
                self.do_claim(pid)
            }
            None => {
                if Self::is_stack_growth(addr, rsp) {
                    debug!("grow stack to {:#x} in {:?}", va, space);
                    self.alloc_page(space, va, true) && self.claim_page(space, va)
                } else {
                    false
                }
            }
        }
    }

    /// An unmapped access counts as stack growth when it lands inside the
    /// stack window and is either the push the faulting instruction is about
    /// to make or an access above the current stack pointer.
    fn is_stack_growth(addr: usize, rsp: usize) -> bool {
        let in_window = |a: usize| (USER_STACK - MAX_STACK_SIZE..USER_STACK).contains(&a);
        in_window(addr) && (addr + WORD == rsp || (in_window(rsp) && rsp <= addr))
    }

    /// Kernel address currently backing the (possibly unaligned) user
    /// address `addr`, if the page is resident.
    pub fn translate(&self, space: SpaceId, addr: usize) -> Option<NonNull<u8>> {
        let pid = self.find_page(space, addr)?;
        let fid = self.page(pid).frame?;
        let kva = self.frames.get(fid).kva();
        NonNull::new(unsafe { kva.as_ptr().add(page_offset(addr)) })
    }

    /// Destroy the page at `va` and forget it. Dirty file pages are written
    /// back; frames and swap slots with no remaining users are released.
    pub fn remove_page(&mut self, space: SpaceId, va: usize) {
        let Some(pid) = self.find_page(space, va) else {
            return;
        };
        self.destroy_page(pid);
        if let Some(sp) = self.spaces.get_mut(&space) {
            sp.spt.remove(&page_round_down(va));
        }
        self.free_page_slot(pid);
    }

    /// Duplicate every page of `src` into `dst`. Deferred pages copy their
    /// recipe, anonymous pages copy bytes into a fresh frame, file pages
    /// share the frame of the original.
    pub fn copy_space(&mut self, dst: SpaceId, src: SpaceId) -> bool {
        if !self.spaces.contains_key(&dst) {
            return false;
        }
        let pids: Vec<PageId> = match self.spaces.get(&src) {
            Some(sp) => sp.spt.values().copied().collect(),
            None => return false,
        };
        for pid in pids {
            let ok = match self.page(pid).state() {
                PageState::Deferred => self.copy_deferred(dst, pid),
                PageState::Anon => self.copy_anon(dst, pid),
                PageState::File => self.copy_file(dst, pid),
            };
            if !ok {
                return false;
            }
        }
        let rsp = self.spaces.get(&src).map_or(0, |sp| sp.user_rsp);
        self.set_user_rsp(dst, rsp);
        true
    }

    fn copy_deferred(&mut self, dst: SpaceId, pid: PageId) -> bool {
        let (va, writable, kind, init) = {
            let page = self.page(pid);
            let Backend::Deferred(d) = &page.backend else {
                return false;
            };
            (page.va, page.writable, d.kind, d.init.duplicate())
        };
        self.alloc_page_with_initializer(dst, va, writable, kind, init)
    }

    fn copy_anon(&mut self, dst: SpaceId, pid: PageId) -> bool {
        if self.page(pid).frame.is_none() && !self.do_claim(pid) {
            return false;
        }
        let (va, writable, src_fid) = {
            let page = self.page(pid);
            match page.frame {
                Some(fid) => (page.va, page.writable, fid),
                None => return false,
            }
        };
        // keep the source resident while the copy's own claim may evict
        self.frames.get_mut(src_fid).set_pinned(true);
        let ok = self.alloc_page(dst, va, writable) && self.claim_page(dst, va);
        if ok {
            let src_kva = self.frames.get(src_fid).kva();
            let dst_kva = match self
                .find_page(dst, va)
                .and_then(|p| self.page(p).frame)
            {
                Some(fid) => self.frames.get(fid).kva(),
                None => {
                    self.frames.get_mut(src_fid).set_pinned(false);
                    return false;
                }
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src_kva.as_ptr(),
                    dst_kva.as_ptr(),
                    PAGE_FRAME_SIZE,
                );
            }
        }
        self.frames.get_mut(src_fid).set_pinned(false);
        ok
    }

    fn copy_file(&mut self, dst: SpaceId, pid: PageId) -> bool {
        if self.page(pid).frame.is_none() && !self.do_claim(pid) {
            return false;
        }
        let (va, writable, fid) = {
            let page = self.page(pid);
            match page.frame {
                Some(fid) => (page.va, page.writable, fid),
                None => return false,
            }
        };
        // a colliding page in the destination is a refusal, as it is for
        // the other backends
        match self.spaces.get(&dst) {
            Some(sp) if !sp.spt.contains_key(&va) => {}
            _ => return false,
        }
        let backend = {
            let Backend::File(fp) = &self.page(pid).backend else {
                return false;
            };
            Backend::File(FilePage {
                file: crate::fs::reopen(fp.file.as_ref()),
                offset: fp.offset,
                read_bytes: fp.read_bytes,
                zero_bytes: fp.zero_bytes,
                total_length: fp.total_length,
                group: Vec::new(),
            })
        };
        let dst_pid = self.alloc_page_slot(Page {
            va,
            writable,
            space: dst,
            frame: Some(fid),
            backend,
        });
        let Some(sp) = self.spaces.get_mut(&dst) else {
            self.free_page_slot(dst_pid);
            return false;
        };
        sp.spt.insert(va, dst_pid);
        self.frames.get_mut(fid).pages.push(dst_pid);
        let kva = self.frames.get(fid).kva();
        self.install_mapping(dst, va, kva, writable)
    }

    // ------------------------------------------------------------------
    // Fault resolution internals

    /// Back `pid` with a frame and fill it from wherever its content lives.
    fn do_claim(&mut self, pid: PageId) -> bool {
        if self.page(pid).frame.is_some() {
            return false;
        }
        let Some(fid) = self.get_frame() else {
            return false;
        };
        let kva = self.frames.get(fid).kva();
        match self.page(pid).state() {
            PageState::Deferred => {
                let (space, va, writable) = {
                    let page = self.page_mut(pid);
                    page.frame = Some(fid);
                    (page.space, page.va, page.writable)
                };
                if !self.install_mapping(space, va, kva, writable) {
                    self.page_mut(pid).frame = None;
                    self.release_frame(fid);
                    return false;
                }
                self.resolve_deferred(pid, fid);
                true
            }
            PageState::Anon => {
                self.anon_swap_in(pid, fid);
                true
            }
            PageState::File => {
                self.file_swap_in(pid, fid);
                true
            }
        }
    }

    /// Transition a deferred page to its concrete backend, running its
    /// initializer against the freshly mapped frame.
    fn resolve_deferred(&mut self, pid: PageId, fid: FrameId) {
        let kva = self.frames.get(fid).kva();
        let placeholder = Backend::Anon(AnonPage { slot: None });
        let page = self.page_mut(pid);
        let Backend::Deferred(d) = mem::replace(&mut page.backend, placeholder) else {
            panic!("deferred resolution of a concrete page");
        };
        match (d.kind, d.init) {
            (PageKind::Anon, InitSpec::Zeroed) => {
                // the pool hands out zeroed frames, nothing to do
            }
            (PageKind::File, InitSpec::LoadFile {
                file,
                offset,
                read_bytes,
                zero_bytes,
                total_length,
            }) => {
                let buf =
                    unsafe { core::slice::from_raw_parts_mut(kva.as_ptr(), read_bytes) };
                let n = crate::fs::read_at(file.as_ref(), buf, offset);
                unsafe {
                    core::ptr::write_bytes(kva.as_ptr().add(n), 0, PAGE_FRAME_SIZE - n);
                }
                self.page_mut(pid).backend = Backend::File(FilePage {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                    total_length,
                    group: Vec::new(),
                });
            }
            _ => panic!("mismatched page kind and initializer"),
        }
        self.frames.get_mut(fid).pages.push(pid);
    }

    /// Produce an empty frame, evicting a victim if the pool is exhausted.
    fn get_frame(&mut self) -> Option<FrameId> {
        if let Some(kva) = self.pool.acquire_zeroed_page() {
            return Some(self.frames.insert(Frame::new(kva)));
        }
        let victim = self.pick_victim()?;
        debug!("evict frame {:?}", victim);
        self.swap_out_frame(victim);
        let frame = self.frames.remove(victim);
        let kva = frame.kva();
        // the next occupant must not see the victim's bytes
        unsafe { core::ptr::write_bytes(kva.as_ptr(), 0, PAGE_FRAME_SIZE) };
        Some(self.frames.insert(Frame::new(kva)))
    }

    /// Second-chance scan: skip pinned frames, give recently accessed
    /// frames another pass by clearing their accessed bits, take the first
    /// frame nobody touched. If every frame was accessed, take the oldest
    /// eligible one.
    fn pick_victim(&mut self) -> Option<FrameId> {
        let order: Vec<FrameId> = self.frames.scan_order().to_vec();
        let mut fallback = None;
        for fid in order {
            let (pinned, sharers) = {
                let frame = self.frames.get(fid);
                (frame.pinned(), frame.pages.clone())
            };
            if pinned || sharers.is_empty() {
                continue;
            }
            if fallback.is_none() {
                fallback = Some(fid);
            }
            let locations: Vec<(SpaceId, usize)> = sharers
                .iter()
                .map(|&p| {
                    let page = self.page(p);
                    (page.space, page.va)
                })
                .collect();
            if locations.iter().any(|&(s, va)| self.query_accessed(s, va)) {
                for &(s, va) in &locations {
                    self.reset_accessed(s, va);
                }
            } else {
                return Some(fid);
            }
        }
        fallback
    }

    /// Push the frame's content out through whichever backend its pages use.
    fn swap_out_frame(&mut self, fid: FrameId) {
        let rep = match self.frames.get(fid).pages.first() {
            Some(&pid) => pid,
            None => return,
        };
        match self.page(rep).state() {
            PageState::Anon => self.anon_swap_out(fid),
            PageState::File => self.file_swap_out(fid),
            PageState::Deferred => panic!("deferred page mapped to a frame"),
        }
    }

    fn destroy_page(&mut self, pid: PageId) {
        match self.page(pid).state() {
            PageState::Deferred => {
                // no frame and no slot; dropping the recipe closes its file
            }
            PageState::Anon => self.anon_destroy(pid),
            PageState::File => self.file_destroy(pid),
        }
    }

    /// Detach `pid` from `fid`, releasing the frame once its page set
    /// empties.
    fn unlink_from_frame(&mut self, pid: PageId, fid: FrameId) {
        let frame = self.frames.get_mut(fid);
        frame.pages.retain(|p| *p != pid);
        if frame.pages.is_empty() {
            self.release_frame(fid);
        }
    }

    fn release_frame(&mut self, fid: FrameId) {
        let frame = self.frames.remove(fid);
        self.pool.release_page(frame.kva());
    }

    // ------------------------------------------------------------------
    // Mapping table plumbing

    fn install_mapping(&mut self, space: SpaceId, va: usize, kva: NonNull<u8>, writable: bool) -> bool {
        match self.spaces.get_mut(&space) {
            Some(sp) => sp.table.install(va, kva.as_ptr() as usize, writable),
            None => false,
        }
    }

    fn clear_mapping(&mut self, space: SpaceId, va: usize) {
        if let Some(sp) = self.spaces.get_mut(&space) {
            sp.table.clear(va);
        }
    }

    fn query_accessed(&self, space: SpaceId, va: usize) -> bool {
        self.spaces
            .get(&space)
            .is_some_and(|sp| sp.table.query_accessed(va))
    }

    fn reset_accessed(&mut self, space: SpaceId, va: usize) {
        if let Some(sp) = self.spaces.get_mut(&space) {
            sp.table.reset_accessed(va);
        }
    }

    fn query_dirty(&self, space: SpaceId, va: usize) -> bool {
        self.spaces
            .get(&space)
            .is_some_and(|sp| sp.table.query_dirty(va))
    }

    // ------------------------------------------------------------------
    // Page arena

    fn page(&self, pid: PageId) -> &Page {
        self.pages[pid.0].as_ref().expect("stale page id")
    }

    fn page_mut(&mut self, pid: PageId) -> &mut Page {
        self.pages[pid.0].as_mut().expect("stale page id")
    }

    fn alloc_page_slot(&mut self, page: Page) -> PageId {
        match self.page_free.pop() {
            Some(slot) => {
                self.pages[slot] = Some(page);
                PageId(slot)
            }
            None => {
                self.pages.push(Some(page));
                PageId(self.pages.len() - 1)
            }
        }
    }

    fn free_page_slot(&mut self, pid: PageId) {
        if self.pages[pid.0].take().is_none() {
            panic!("stale page id");
        }
        self.page_free.push(pid.0);
    }

    // ------------------------------------------------------------------
    // Introspection

    /// Number of frames currently in use.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The frame backing `va`, if resident.
    pub fn frame_of(&self, space: SpaceId, va: usize) -> Option<FrameId> {
        self.page(self.find_page(space, va)?).frame
    }

    /// Number of pages sharing `fid`.
    pub fn frame_ref_count(&self, fid: FrameId) -> usize {
        self.frames.get(fid).pages.len()
    }

    /// Backend the page at `va` is currently in.
    pub fn page_state(&self, space: SpaceId, va: usize) -> Option<PageState> {
        Some(self.page(self.find_page(space, va)?).state())
    }

    /// Number of unoccupied swap slots.
    pub fn free_swap_slots(&self) -> usize {
        self.swap.free_slots()
    }
}
