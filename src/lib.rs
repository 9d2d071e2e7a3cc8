//! Sv39 memory-management core for a small RISC-V teaching kernel.
//!
//! This crate provides the physical and virtual memory machinery a Unix-like
//! kernel builds processes on: two physical pools (reference-counted 4KiB
//! frames and indivisible 2MiB superframes), a software walker over 3-level
//! Sv39 page tables with superpage leaves at level 1, mapping installation
//! and removal with copy-based superpage demotion, the address-space
//! lifecycle (create, grow, shrink, fork-copy, destroy), and the boundary
//! copies the syscall layer uses to marshal user memory.
//!
//! Physical RAM is modeled by an in-crate arena ([`phys::PhysMemory`]) so
//! the whole subsystem runs and tests on a host as it would against an
//! identity map. Concurrency contract: each pool serializes itself behind
//! its own lock; page tables are not independently locked, so the process
//! manager must serialize all mutation of any one address space.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod error;
pub mod hart;
pub mod layout;
pub mod page_table;
pub mod phys;
pub mod uaccess;
pub mod vm;

pub use error::{Fault, Result, VmError};
pub use layout::{MemoryLayout, PhysAddr, VirtAddr, MAXVA, PGSIZE, SUPERPGSIZE};
pub use page_table::{PageTable, Pte, PteFlags};
pub use phys::{FrameAllocator, MemoryManager, PhysMemory, SuperframeAllocator};
pub use uaccess::{copyin, copyinstr, copyout};
pub use vm::{clear_user_access, grow, map_range, shrink, unmap_pages, AddressSpace, PageSize};
