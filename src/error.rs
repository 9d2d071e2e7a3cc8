//! Error types for the memory-management core.
//!
//! Failures split into two classes. [`VmError`] covers conditions the
//! immediate caller is expected to handle: pool exhaustion and bad input
//! from user space. [`Fault`] covers invariant violations that indicate a
//! bug in a caller (double free, remap, misaligned superpage work); they
//! are never handled, only reported, and carry enough context to identify
//! the offending call. `Fault` rides inside `VmError` so multi-step
//! operations can propagate either with `?`.

use core::fmt;

use crate::layout::{PhysAddr, VirtAddr};

/// Recoverable failure reported to the immediate caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The base-frame pool is empty.
    OutOfFrames,
    /// The superframe pool is empty.
    OutOfSuperframes,
    /// A user virtual address was unmapped, not user-accessible, or past
    /// the end of the architecture's address space.
    BadAddress(VirtAddr),
    /// Copy-out would write through a page mapped read-only.
    ReadOnly(VirtAddr),
    /// No NUL terminator within the byte budget of a string copy.
    NoNulTerminator,
    /// The bootstrap image does not fit in a single page.
    ImageTooLarge(usize),
    /// An invariant violation surfaced through a fallible operation.
    Fault(Fault),
}

/// Unrecoverable invariant violation: a bug in a caller, not a runtime
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Boot-time layout is misaligned or out of order.
    BadLayout(&'static str),
    /// Frame address is not page-aligned.
    FrameUnaligned(PhysAddr),
    /// Frame address is outside the managed pool.
    FrameOutOfRange(PhysAddr),
    /// Frame freed while its reference count was already zero.
    FreeOfFree(PhysAddr),
    /// Reference taken on a frame with no existing references.
    RetainUnreferenced(PhysAddr),
    /// Superframe address is not 2MiB-aligned.
    SuperUnaligned(PhysAddr),
    /// Superframe address is outside the superframe pool.
    SuperOutOfRange(PhysAddr),
    /// Superframe freed while already on the freelist.
    SuperFreeOfFree(PhysAddr),
    /// Virtual address at or above MAXVA handed to the walker.
    VirtOutOfRange(VirtAddr),
    /// Mapping over an entry that is already valid.
    Remap(VirtAddr),
    /// Map or unmap request misaligned for its granularity.
    Misaligned(VirtAddr),
    /// Zero-length map request.
    EmptyRange(VirtAddr),
    /// Unmap of a page that was never mapped.
    UnmapMissing(VirtAddr),
    /// Unmap found a valid non-leaf entry where a leaf was required.
    UnmapNonLeaf(VirtAddr),
    /// Recursive table free found a leftover leaf entry.
    FreeWalkLeaf(PhysAddr),
    /// Recursive table free found a child pointer that is not a table.
    FreeWalkBadChild(PhysAddr),
    /// User-bit clear on an address with no 4KiB mapping.
    ClearUnmapped(VirtAddr),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::BadLayout(msg) => write!(f, "bad memory layout: {}", msg),
            Fault::FrameUnaligned(pa) => write!(f, "frame pa {} not page-aligned", pa),
            Fault::FrameOutOfRange(pa) => write!(f, "frame pa {} outside managed pool", pa),
            Fault::FreeOfFree(pa) => write!(f, "kfree: pa {} already free", pa),
            Fault::RetainUnreferenced(pa) => write!(f, "krefer: pa {} has no references", pa),
            Fault::SuperUnaligned(pa) => write!(f, "superfree: unaligned pa {}", pa),
            Fault::SuperOutOfRange(pa) => write!(f, "superfree: pa {} outside pool", pa),
            Fault::SuperFreeOfFree(pa) => write!(f, "superfree: pa {} already free", pa),
            Fault::VirtOutOfRange(va) => write!(f, "walk: va {} beyond MAXVA", va),
            Fault::Remap(va) => write!(f, "map: va {} already mapped", va),
            Fault::Misaligned(va) => write!(f, "map: va {} misaligned for granularity", va),
            Fault::EmptyRange(va) => write!(f, "map: empty range at va {}", va),
            Fault::UnmapMissing(va) => write!(f, "unmap: va {} not mapped", va),
            Fault::UnmapNonLeaf(va) => write!(f, "unmap: va {} is not a leaf", va),
            Fault::FreeWalkLeaf(pa) => write!(f, "free_walk: leaf left in table {}", pa),
            Fault::FreeWalkBadChild(pa) => write!(f, "free_walk: child {} is not a table", pa),
            Fault::ClearUnmapped(va) => write!(f, "clear_user_access: va {} not mapped", va),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "out of physical frames"),
            VmError::OutOfSuperframes => write!(f, "out of superframes"),
            VmError::BadAddress(va) => write!(f, "bad user address {}", va),
            VmError::ReadOnly(va) => write!(f, "write to read-only page at {}", va),
            VmError::NoNulTerminator => write!(f, "string not NUL-terminated within budget"),
            VmError::ImageTooLarge(n) => write!(f, "initial image of {} bytes exceeds one page", n),
            VmError::Fault(fault) => write!(f, "invariant violation: {}", fault),
        }
    }
}

impl From<Fault> for VmError {
    fn from(fault: Fault) -> Self {
        VmError::Fault(fault)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, VmError>;
