use super::{FrameId, PageId, SlotId, SpaceId};
use crate::fs::{self, File};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Concrete backend a deferred page turns into on its first fault.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Anon,
    File,
}

/// Which backend a page is currently in. A page starts deferred and moves to
/// exactly one concrete backend, once, at first fault.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageState {
    Deferred,
    Anon,
    File,
}

/// Recipe for populating a deferred page's first frame.
pub enum InitSpec {
    /// Fresh zero-filled memory (stack growth, heap).
    Zeroed,
    /// Read `read_bytes` from `file` at `offset`, zero the remaining
    /// `zero_bytes`. `total_length` spans the whole mmap call the page
    /// belongs to, so munmap can find every sibling from the first page.
    LoadFile {
        file: Box<dyn File>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        total_length: usize,
    },
}

impl InitSpec {
    /// Deep copy for address-space duplication; the original may be freed
    /// independently, so a file recipe gets its own reopened handle.
    pub fn duplicate(&self) -> InitSpec {
        match self {
            InitSpec::Zeroed => InitSpec::Zeroed,
            InitSpec::LoadFile {
                file,
                offset,
                read_bytes,
                zero_bytes,
                total_length,
            } => InitSpec::LoadFile {
                file: fs::reopen(file.as_ref()),
                offset: *offset,
                read_bytes: *read_bytes,
                zero_bytes: *zero_bytes,
                total_length: *total_length,
            },
        }
    }
}

/// A page that has been reserved but never faulted in.
pub struct DeferredPage {
    pub kind: PageKind,
    pub init: InitSpec,
}

/// Anonymous memory; `slot` is set only while the content sits on the swap
/// device.
pub struct AnonPage {
    pub slot: Option<SlotId>,
}

/// One page of a memory-mapped file.
pub struct FilePage {
    pub file: Box<dyn File>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Byte length of the whole mapping this page belongs to.
    pub total_length: usize,
    /// Sharers of the frame this page occupied when it was evicted, self
    /// included. Empty while resident. Every member carries the full group
    /// so whichever sharer faults first can rebuild it.
    pub group: Vec<PageId>,
}

pub enum Backend {
    Deferred(DeferredPage),
    Anon(AnonPage),
    File(FilePage),
}

/// One virtual page of one address space.
pub struct Page {
    pub va: usize,
    pub writable: bool,
    pub space: SpaceId,
    /// Present only while the page is resident.
    pub frame: Option<FrameId>,
    pub backend: Backend,
}

impl Page {
    pub fn state(&self) -> PageState {
        match self.backend {
            Backend::Deferred(_) => PageState::Deferred,
            Backend::Anon(_) => PageState::Anon,
            Backend::File(_) => PageState::File,
        }
    }
}
