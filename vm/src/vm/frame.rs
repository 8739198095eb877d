use super::{FrameId, PageId};
use alloc::vec::Vec;
use core::ptr::NonNull;

/// One physical page of user memory.
///
/// The page set holds back-pointers to every virtual page currently mapped
/// to this frame; its length is the frame's reference count. The frame is
/// returned to the pool only when the set empties.
pub struct Frame {
    kva: NonNull<u8>,
    pub pages: Vec<PageId>,
    pinned: bool,
}

impl Frame {
    pub fn new(kva: NonNull<u8>) -> Self {
        Frame {
            kva,
            pages: Vec::new(),
            pinned: false,
        }
    }

    pub fn kva(&self) -> NonNull<u8> {
        self.kva
    }

    pub fn pinned(&self) -> bool {
        self.pinned
    }

    /// A pinned frame is skipped by victim selection.
    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }
}

/// Global table of every in-use frame.
///
/// Frames live in an arena addressed by stable ids; `order` preserves
/// insertion order for the second-chance scan, with recycled frames
/// re-registered at the back.
#[derive(Default)]
pub struct FrameTable {
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
    order: Vec<FrameId>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame: Frame) -> FrameId {
        let id = match self.free.pop() {
            Some(slot) => {
                self.frames[slot] = Some(frame);
                FrameId(slot)
            }
            None => {
                self.frames.push(Some(frame));
                FrameId(self.frames.len() - 1)
            }
        };
        self.order.push(id);
        id
    }

    pub fn remove(&mut self, id: FrameId) -> Frame {
        let frame = self.frames[id.0].take().expect("stale frame id");
        self.order.retain(|f| *f != id);
        self.free.push(id.0);
        frame
    }

    pub fn get(&self, id: FrameId) -> &Frame {
        self.frames[id.0].as_ref().expect("stale frame id")
    }

    pub fn get_mut(&mut self, id: FrameId) -> &mut Frame {
        self.frames[id.0].as_mut().expect("stale frame id")
    }

    /// Frames in second-chance scan order.
    pub fn scan_order(&self) -> &[FrameId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_frame() -> Frame {
        Frame::new(NonNull::new(0x1000 as *mut u8).unwrap())
    }

    #[test]
    fn insert_remove_preserves_order() {
        let mut table = FrameTable::new();
        let a = table.insert(dummy_frame());
        let b = table.insert(dummy_frame());
        let c = table.insert(dummy_frame());
        assert_eq!(table.scan_order(), &[a, b, c]);
        table.remove(b);
        assert_eq!(table.scan_order(), &[a, c]);
        // recycled slots re-register at the back of the scan order
        let d = table.insert(dummy_frame());
        assert_eq!(table.scan_order(), &[a, c, d]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    #[should_panic(expected = "stale frame id")]
    fn stale_id() {
        let mut table = FrameTable::new();
        let a = table.insert(dummy_frame());
        table.remove(a);
        table.get(a);
    }
}
