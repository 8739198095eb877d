//! Demand-paged virtual memory for MedullaOS.
//!
//! This crate owns the machinery between a page fault and a populated
//! mapping: per-address-space supplemental page tables, the global frame
//! table with its second-chance eviction policy, the swap store for evicted
//! anonymous data, and lazily-loaded memory-mapped files. The scheduler,
//! syscall dispatch, filesystem internals and device drivers live elsewhere
//! and are reached through the traits in [`block`], [`fs`], [`palloc`] and
//! [`paging`].

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod fs;
pub mod palloc;
pub mod paging;
pub mod sync;
pub mod system;
pub mod vm;
