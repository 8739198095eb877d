//! File-backed pages: mmap, munmap and dirty write-back.
//!
//! A file page's eviction target is the file itself. Clean pages are simply
//! dropped on eviction and re-read on the next fault; dirty pages are
//! written back first. When several pages share one frame they are evicted
//! and restored together as a group.

use super::{Backend, DeferredPage, FrameId, InitSpec, PageId, PageKind, SpaceId, Vm};
use crate::fs::{self, File};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;
use log::{debug, trace};
use medulla_shared::mem::{is_user_vaddr, page_offset, PAGE_FRAME_SIZE};

impl Vm {
    /// Evict the file-backed frame `fid`, writing each dirty sharer's bytes
    /// back to its file.
    pub(super) fn file_swap_out(&mut self, fid: FrameId) {
        let kva = self.frames.get(fid).kva();
        let members = mem::take(&mut self.frames.get_mut(fid).pages);
        trace!("write out file frame {:?} ({} sharers)", fid, members.len());
        for &pid in &members {
            let page = self.page_mut(pid);
            let (space, va) = (page.space, page.va);
            page.frame = None;
            let Backend::File(fp) = &mut page.backend else {
                panic!("file eviction of a non-file page");
            };
            let (offset, read_bytes) = (fp.offset, fp.read_bytes);
            if self.query_dirty(space, va) {
                let Backend::File(fp) = &mut self.page_mut(pid).backend else {
                    unreachable!();
                };
                let bytes =
                    unsafe { core::slice::from_raw_parts(kva.as_ptr(), read_bytes) };
                fs::write_at(fp.file.as_mut(), bytes, offset);
            }
            self.clear_mapping(space, va);
        }
        // every member remembers the whole group so whichever page faults
        // first can restore all of them
        for &pid in &members {
            let Backend::File(fp) = &mut self.page_mut(pid).backend else {
                unreachable!();
            };
            fp.group = members.clone();
        }
    }

    /// Fill the fresh frame `fid` from `pid`'s file region and re-attach the
    /// whole eviction group to it.
    pub(super) fn file_swap_in(&mut self, pid: PageId, fid: FrameId) {
        let members = {
            let Backend::File(fp) = &mut self.page_mut(pid).backend else {
                panic!("file restore of a non-file page");
            };
            let group = mem::take(&mut fp.group);
            if group.is_empty() {
                vec![pid]
            } else {
                group
            }
        };
        let kva = self.frames.get(fid).kva();
        {
            let Backend::File(fp) = &self.page(pid).backend else {
                unreachable!();
            };
            let (offset, read_bytes) = (fp.offset, fp.read_bytes);
            let buf =
                unsafe { core::slice::from_raw_parts_mut(kva.as_ptr(), read_bytes) };
            let n = fs::read_at(fp.file.as_ref(), buf, offset);
            unsafe {
                core::ptr::write_bytes(kva.as_ptr().add(n), 0, PAGE_FRAME_SIZE - n);
            }
        }
        trace!("read in file frame {:?} ({} sharers)", fid, members.len());
        for member in members {
            let page = self.page_mut(member);
            page.frame = Some(fid);
            let Backend::File(fp) = &mut page.backend else {
                panic!("file restore of a non-file page");
            };
            fp.group.clear();
            let (space, va, writable) = (page.space, page.va, page.writable);
            self.frames.get_mut(fid).pages.push(member);
            if !self.install_mapping(space, va, kva, writable) {
                // eviction cleared this mapping, so it cannot be occupied
                panic!("stale mapping for restored page");
            }
        }
    }

    /// Drop the file page `pid`, writing its bytes back first if the
    /// mapping is dirty.
    pub(super) fn file_destroy(&mut self, pid: PageId) {
        let page = self.page(pid);
        let (space, va, frame) = (page.space, page.va, page.frame);
        if let Some(fid) = frame {
            let kva = self.frames.get(fid).kva();
            if self.query_dirty(space, va) {
                let Backend::File(fp) = &mut self.page_mut(pid).backend else {
                    panic!("file destroy of a non-file page");
                };
                let read_bytes = fp.read_bytes;
                let offset = fp.offset;
                let bytes =
                    unsafe { core::slice::from_raw_parts(kva.as_ptr(), read_bytes) };
                fs::write_at(fp.file.as_mut(), bytes, offset);
            }
            self.unlink_from_frame(pid, fid);
            self.clear_mapping(space, va);
        } else {
            // evicted as part of a group; the survivors must forget us
            let Backend::File(fp) = &self.page(pid).backend else {
                panic!("file destroy of a non-file page");
            };
            let group: Vec<PageId> = fp.group.iter().copied().filter(|p| *p != pid).collect();
            for member in group {
                let Backend::File(fp) = &mut self.page_mut(member).backend else {
                    continue;
                };
                fp.group.retain(|p| *p != pid);
            }
        }
    }

    /// Map `length` bytes of `file` starting at `offset` into `space` at
    /// `addr`. Pages are created deferred and load lazily on first fault.
    /// Returns the mapping's base address, or `None` on a bad request.
    pub fn mmap(
        &mut self,
        space: SpaceId,
        addr: usize,
        length: usize,
        writable: bool,
        file: Box<dyn File>,
        offset: u64,
    ) -> Option<usize> {
        if addr == 0 || page_offset(addr) != 0 || page_offset(offset as usize) != 0 {
            return None;
        }
        if length == 0 || offset > fs::length(file.as_ref()) {
            return None;
        }
        let count = length.div_ceil(PAGE_FRAME_SIZE);
        let end = addr.checked_add(count * PAGE_FRAME_SIZE)?;
        if !is_user_vaddr(end - 1) {
            return None;
        }
        // refuse the whole mapping up front rather than unwinding a partial one
        for i in 0..count {
            if self.find_page(space, addr + i * PAGE_FRAME_SIZE).is_some() {
                return None;
            }
        }
        debug!("mmap {} pages at {:#x} in {:?}", count, addr, space);
        let mut remaining = length;
        for i in 0..count {
            let read_bytes = remaining.min(PAGE_FRAME_SIZE);
            let init = InitSpec::LoadFile {
                file: fs::reopen(file.as_ref()),
                offset: offset + (i * PAGE_FRAME_SIZE) as u64,
                read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - read_bytes,
                total_length: length,
            };
            if !self.alloc_page_with_initializer(
                space,
                addr + i * PAGE_FRAME_SIZE,
                writable,
                PageKind::File,
                init,
            ) {
                panic!("mmap range changed during setup");
            }
            remaining -= read_bytes;
        }
        Some(addr)
    }

    /// Tear down the mapping created by [`Vm::mmap`] at `addr`. A no-op if
    /// `addr` is not the start of a live mapping.
    pub fn munmap(&mut self, space: SpaceId, addr: usize) {
        if page_offset(addr) != 0 {
            return;
        }
        let Some(pid) = self.find_page(space, addr) else {
            return;
        };
        let total_length = match &self.page(pid).backend {
            Backend::File(fp) => fp.total_length,
            Backend::Deferred(DeferredPage {
                kind: PageKind::File,
                init: InitSpec::LoadFile { total_length, .. },
            }) => *total_length,
            _ => return,
        };
        let count = total_length.div_ceil(PAGE_FRAME_SIZE);
        debug!("munmap {} pages at {:#x} in {:?}", count, addr, space);
        for i in 0..count {
            self.remove_page(space, addr + i * PAGE_FRAME_SIZE);
        }
    }
}
