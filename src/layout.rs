//! Physical and virtual memory layout.
//!
//! The machine model is RISC-V Sv39: three translation levels of 512
//! entries each, 4KiB base pages and 2MiB superpages at level 1. Physical
//! memory is split at boot into a base-frame pool and a superframe pool;
//! the split point is fixed for the life of the kernel.

use core::fmt;

use static_assertions::const_assert_eq;

use crate::error::{Fault, VmError};

/// Base page size (4KiB).
pub const PGSIZE: usize = 4096;
/// log2 of [`PGSIZE`].
pub const PGSHIFT: usize = 12;

/// Superpage size (2MiB): one level-1 leaf spans a full level-0 table.
pub const SUPERPGSIZE: usize = PGSIZE << 9;
/// log2 of [`SUPERPGSIZE`].
pub const SUPERPGSHIFT: usize = PGSHIFT + 9;

/// Entries per page-table page.
pub const PTE_COUNT: usize = 512;

/// One past the highest virtual address Sv39 can map.
///
/// Sv39 has 39 significant bits; the kernel stays out of the sign-extended
/// upper half, so addresses at or above `1 << 38` are rejected.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

const_assert_eq!(PGSIZE * PTE_COUNT, SUPERPGSIZE);
const_assert_eq!(1 << SUPERPGSHIFT, SUPERPGSIZE);
const_assert_eq!(MAXVA % SUPERPGSIZE, 0);

/// Align `addr` down to a page boundary.
#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Align `addr` up to a page boundary.
#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

/// Align `addr` down to a superpage boundary.
#[inline]
pub const fn super_round_down(addr: usize) -> usize {
    addr & !(SUPERPGSIZE - 1)
}

/// Check alignment of `addr` against `align` (power of two).
#[inline]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

/// A physical byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Offset within the containing base page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PGSIZE - 1)
    }

    /// True if aligned to a base page.
    pub const fn is_page_aligned(self) -> bool {
        is_aligned(self.0, PGSIZE)
    }

    /// True if aligned to a superpage.
    pub const fn is_super_aligned(self) -> bool {
        is_aligned(self.0, SUPERPGSIZE)
    }

    /// Address `bytes` past this one.
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A virtual byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Offset within the containing base page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PGSIZE - 1)
    }

    /// True if aligned to a base page.
    pub const fn is_page_aligned(self) -> bool {
        is_aligned(self.0, PGSIZE)
    }

    /// True if aligned to a superpage.
    pub const fn is_super_aligned(self) -> bool {
        is_aligned(self.0, SUPERPGSIZE)
    }

    /// Nine-bit page-table index for `level` (2, 1 or 0).
    pub const fn index(self, level: usize) -> usize {
        (self.0 >> (PGSHIFT + 9 * level)) & (PTE_COUNT - 1)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Boot-time description of usable physical memory.
///
/// `[kernel_end, super_base)` seeds the base-frame pool and
/// `[super_base, phys_top)` is carved into 2MiB superframes. The split is
/// immutable once the pools are seeded.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// First usable byte after the kernel image. Page-aligned.
    pub kernel_end: PhysAddr,
    /// Start of the superframe region. Superpage-aligned.
    pub super_base: PhysAddr,
    /// One past the last usable physical byte. Superpage-aligned.
    pub phys_top: PhysAddr,
}

impl MemoryLayout {
    /// Validate alignment and ordering of the three boundaries.
    pub fn new(kernel_end: PhysAddr, super_base: PhysAddr, phys_top: PhysAddr) -> Result<Self, VmError> {
        if !kernel_end.is_page_aligned() {
            return Err(Fault::BadLayout("kernel_end not page-aligned").into());
        }
        if !super_base.is_super_aligned() || !phys_top.is_super_aligned() {
            return Err(Fault::BadLayout("superframe region not 2MiB-aligned").into());
        }
        if kernel_end > super_base || super_base > phys_top {
            return Err(Fault::BadLayout("layout boundaries out of order").into());
        }
        Ok(Self { kernel_end, super_base, phys_top })
    }

    /// Bytes of modeled physical memory.
    pub const fn span(&self) -> usize {
        self.phys_top.0 - self.kernel_end.0
    }

    /// Number of base frames in the normal pool.
    pub const fn frame_count(&self) -> usize {
        (self.super_base.0 - self.kernel_end.0) / PGSIZE
    }

    /// Number of superframes in the superframe pool.
    pub const fn superframe_count(&self) -> usize {
        (self.phys_top.0 - self.super_base.0) / SUPERPGSIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Fault, VmError};

    #[test]
    fn layout_accepts_aligned_boundaries() {
        let l = MemoryLayout::new(
            PhysAddr(0x8020_0000 - 16 * PGSIZE),
            PhysAddr(0x8020_0000),
            PhysAddr(0x8020_0000 + 2 * SUPERPGSIZE),
        )
        .unwrap();
        assert_eq!(l.frame_count(), 16);
        assert_eq!(l.superframe_count(), 2);
    }

    #[test]
    fn layout_rejects_misaligned_super_base() {
        let err = MemoryLayout::new(
            PhysAddr(0x8000_0000),
            PhysAddr(0x8000_1000),
            PhysAddr(0x8040_0000),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::Fault(Fault::BadLayout(_))));
    }

    #[test]
    fn va_indices_decompose() {
        let va = VirtAddr((3 << 30) | (5 << 21) | (7 << 12) | 0x123);
        assert_eq!(va.index(2), 3);
        assert_eq!(va.index(1), 5);
        assert_eq!(va.index(0), 7);
        assert_eq!(va.page_offset(), 0x123);
    }
}
