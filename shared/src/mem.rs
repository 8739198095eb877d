use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// The user stack grows down from the kernel boundary.
pub const USER_STACK: usize = OFFSET;

// How far below USER_STACK the stack is allowed to grow.
pub const MAX_STACK_SIZE: usize = MB;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_FRAME_SIZE - 1) & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_down(0x1000), 0x1000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x1000), 0x1000);
        assert_eq!(page_offset(0x1234), 0x234);
    }

    #[test]
    fn user_region() {
        assert!(is_user_vaddr(0x1000));
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
        assert!(USER_STACK - MAX_STACK_SIZE < USER_STACK);
    }
}
