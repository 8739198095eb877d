// https://wiki.osdev.org/Paging
//
// 64-bit 4KB page-table entry. Only the bits the memory manager inspects are
// named; bits 52..63 hold software/NX state we never touch.

use arbitrary_int::u40;
use bitbybit::bitfield;

#[bitfield(u64, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=51, rw)]
    page_frame_number: u40,
}

impl PageTableEntry {
    /// Entry mapping a user page at physical address `pa`.
    pub fn map(pa: usize, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_number(u40::new((pa >> 12) as u64))
    }

    pub fn physical_address(&self) -> usize {
        (self.page_frame_number().value() as usize) << 12
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn map_sets_flags() {
        let pte = PageTableEntry::map(0x7f00_1000, true);
        assert!(pte.present());
        assert!(pte.read_write());
        assert!(pte.user_supervisor());
        assert!(!pte.accessed());
        assert!(!pte.dirty());
        assert_eq!(pte.physical_address(), 0x7f00_1000);
    }

    #[test]
    fn read_only_mapping() {
        let pte = PageTableEntry::map(0x4000, false);
        assert!(!pte.read_write());
        assert_eq!(pte.physical_address(), 0x4000);
    }

    #[test]
    fn accessed_and_dirty_round_trip() {
        let pte = PageTableEntry::map(0x4000, true)
            .with_accessed(true)
            .with_dirty(true);
        assert!(pte.accessed() && pte.dirty());
        let pte = pte.with_accessed(false).with_dirty(false);
        assert!(!pte.accessed() && !pte.dirty());
        // clearing status bits must not disturb the frame number
        assert_eq!(pte.physical_address(), 0x4000);
    }
}
