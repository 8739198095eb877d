//! Global access to the memory manager.
//!
//! The kernel builds a [`Vm`] during boot, once the frame pool and swap
//! device exist, and registers it here. Fault handlers and syscalls reach
//! it through [`vm`] without threading a reference through every call.

use crate::sync::{SpinLock, SpinLockGuard};
use crate::vm::{FaultContext, SpaceId, Vm};
use alloc::boxed::Box;
use once_cell::race::OnceBox;

static VM: OnceBox<SpinLock<Vm>> = OnceBox::new();

/// Register the memory manager. Called once during boot.
///
/// Panics if a manager is already registered.
pub fn vm_init(manager: Vm) {
    if VM.set(Box::new(SpinLock::new(manager))).is_err() {
        panic!("memory manager initialized twice");
    }
}

/// Lock and return the memory manager.
///
/// Panics before [`vm_init`] has run.
pub fn vm() -> SpinLockGuard<'static, Vm> {
    match VM.get() {
        Some(lock) => lock.lock(),
        None => panic!("memory manager used before initialization"),
    }
}

/// Entry point for the architecture's page fault handler.
pub fn handle_fault(
    space: SpaceId,
    ctx: &FaultContext,
    addr: usize,
    user: bool,
    write: bool,
    not_present: bool,
) -> bool {
    vm().handle_fault(space, ctx, addr, user, write, not_present)
}

/// Duplicate `src` into `dst` for process creation.
pub fn copy_space(dst: SpaceId, src: SpaceId) -> bool {
    vm().copy_space(dst, src)
}
