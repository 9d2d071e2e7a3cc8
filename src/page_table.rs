//! Sv39 page-table entries and the software walker.
//!
//! A table page holds 512 64-bit entries. A valid entry with any of R/W/X
//! set is a leaf and terminates translation at its level: level 0 maps a
//! 4KiB page, level 1 a 2MiB superpage. A valid entry with none of R/W/X
//! points to the child table one level down. Each non-leaf entry
//! exclusively owns its child table; tables are ordinary frames from the
//! base pool.

use core::fmt;

use bitflags::bitflags;

use crate::error::{Fault, Result};
use crate::layout::{MAXVA, PGSHIFT, PGSIZE, PTE_COUNT, PhysAddr, VirtAddr};
use crate::phys::{MemoryManager, PhysMemory};

bitflags! {
    /// PTE permission bits. Absence of R/W/X on a valid entry marks a
    /// non-leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// Accessible from user mode.
        const U = 1 << 4;
    }
}

impl PteFlags {
    /// The bits that make a valid entry a leaf.
    pub const LEAF: PteFlags = PteFlags::R.union(PteFlags::W).union(PteFlags::X);
    /// Permission bits carried over when a mapping is copied or rebuilt.
    pub const PERM: PteFlags = PteFlags::LEAF.union(PteFlags::U);
}

/// Number of physical-page-number bits in an entry.
const PPN_BITS: u64 = 44;
/// Bit position of the PPN field.
const PPN_SHIFT: u64 = 10;

/// One page-table entry, kept as its raw Sv39 encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// The all-zero (invalid) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Encode `pa` and `flags` into an entry. V is not implied.
    pub fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Self(((pa.0 as u64 >> PGSHIFT) << PPN_SHIFT) | flags.bits())
    }

    /// Rebuild an entry from its raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw Sv39 encoding.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// The physical address this entry points at (frame or child table).
    pub fn pa(self) -> PhysAddr {
        PhysAddr((((self.0 >> PPN_SHIFT) & ((1 << PPN_BITS) - 1)) << PGSHIFT) as usize)
    }

    /// The flag bits of this entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Valid bit set.
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// Valid and carrying at least one of R/W/X.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::LEAF)
    }

    /// Writable bit set.
    pub fn writable(self) -> bool {
        self.flags().contains(PteFlags::W)
    }

    /// User bit set.
    pub fn user(self) -> bool {
        self.flags().contains(PteFlags::U)
    }
}

/// Location of one entry inside the tree: which table page, which index,
/// and the level the walk terminated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteSlot {
    table: PhysAddr,
    index: usize,
    level: usize,
}

impl PteSlot {
    /// The level this slot sits at (2, 1 or 0).
    pub fn level(&self) -> usize {
        self.level
    }

    /// Read the entry.
    pub fn load(&self, mem: &PhysMemory) -> Pte {
        Pte::from_bits(mem.pte_load(self.table, self.index))
    }

    /// Overwrite the entry.
    pub fn store(&self, mem: &PhysMemory, pte: Pte) {
        mem.pte_store(self.table, self.index, pte.bits());
    }
}

/// A page-table tree identified by its root table page.
///
/// The handle is plain data; all state lives in physical memory. The
/// process manager serializes mutation of any one tree, which is why the
/// handle is freely copyable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    /// Allocate an empty root table.
    pub fn alloc(mm: &MemoryManager) -> Result<Self> {
        let root = mm.kalloc()?;
        mm.phys().fill(root, PGSIZE, 0);
        Ok(Self { root })
    }

    /// Wrap an existing root table page.
    pub const fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    /// The root table page.
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Find the entry for `va`, descending from level 2 toward level 0.
    ///
    /// A leaf met at level 2 or 1 is returned as-is; callers that expect
    /// 4KiB granularity must check [`PteSlot::level`]. With `alloc`,
    /// missing intermediate tables are created zero-filled from the base
    /// pool; without it the walk reports `None` instead. A virtual address
    /// at or above MAXVA is a caller bug.
    pub fn walk(&self, mm: &MemoryManager, va: VirtAddr, alloc: bool) -> Result<Option<PteSlot>> {
        if va.0 >= MAXVA {
            return Err(Fault::VirtOutOfRange(va).into());
        }
        let mem = mm.phys();
        let mut table = self.root;
        for level in [2, 1] {
            let index = va.index(level);
            let pte = Pte::from_bits(mem.pte_load(table, index));
            if pte.is_valid() {
                if pte.is_leaf() {
                    return Ok(Some(PteSlot { table, index, level }));
                }
                table = pte.pa();
            } else {
                if !alloc {
                    return Ok(None);
                }
                let child = mm.kalloc()?;
                mem.fill(child, PGSIZE, 0);
                mem.pte_store(table, index, Pte::new(child, PteFlags::V).bits());
                table = child;
            }
        }
        Ok(Some(PteSlot { table, index: va.index(0), level: 0 }))
    }

    /// Like [`walk`](Self::walk) but stop at level 1, where superpage
    /// leaves live.
    pub fn walk_level1(&self, mm: &MemoryManager, va: VirtAddr, alloc: bool) -> Result<Option<PteSlot>> {
        if va.0 >= MAXVA {
            return Err(Fault::VirtOutOfRange(va).into());
        }
        let mem = mm.phys();
        let index = va.index(2);
        let pte = Pte::from_bits(mem.pte_load(self.root, index));
        let table = if pte.is_valid() {
            if pte.is_leaf() {
                return Ok(Some(PteSlot { table: self.root, index, level: 2 }));
            }
            pte.pa()
        } else {
            if !alloc {
                return Ok(None);
            }
            let child = mm.kalloc()?;
            mem.fill(child, PGSIZE, 0);
            mem.pte_store(self.root, index, Pte::new(child, PteFlags::V).bits());
            child
        };
        Ok(Some(PteSlot { table, index: va.index(1), level: 1 }))
    }

    /// Resolve `va` to a physical address, honoring leaves at any level.
    ///
    /// Only user-accessible mappings resolve; kernel callers probing user
    /// memory must fail on kernel-only entries rather than read through
    /// them. Unmapped or out-of-range addresses yield `None`.
    pub fn translate(&self, mm: &MemoryManager, va: VirtAddr) -> Option<PhysAddr> {
        if va.0 >= MAXVA {
            return None;
        }
        let mem = mm.phys();
        let mut table = self.root;
        for level in (0..=2).rev() {
            let pte = Pte::from_bits(mem.pte_load(table, va.index(level)));
            if !pte.is_valid() {
                return None;
            }
            if pte.is_leaf() || level == 0 {
                if !pte.user() {
                    return None;
                }
                let offset_mask = (1usize << (PGSHIFT + 9 * level)) - 1;
                return Some(PhysAddr(pte.pa().0 + (va.0 & offset_mask)));
            }
            table = pte.pa();
        }
        unreachable!("walk past level 0")
    }

    /// The level of the leaf mapping `va`, if any. Diagnostic: tells a
    /// superpage mapping (1) from a base mapping (0) without resolving
    /// permissions.
    pub fn leaf_level(&self, mm: &MemoryManager, va: VirtAddr) -> Option<usize> {
        if va.0 >= MAXVA {
            return None;
        }
        let mem = mm.phys();
        let mut table = self.root;
        for level in (0..=2).rev() {
            let pte = Pte::from_bits(mem.pte_load(table, va.index(level)));
            if !pte.is_valid() {
                return None;
            }
            if pte.is_leaf() {
                return Some(level);
            }
            if level == 0 {
                return None;
            }
            table = pte.pa();
        }
        unreachable!("walk past level 0")
    }

    /// Recursively free every table page of the tree, bottom-up.
    ///
    /// All leaf mappings must already have been unmapped; a leftover leaf,
    /// or a child pointer that does not resolve to a frame-pool page,
    /// means unmap did not run to completion and is a caller bug.
    pub(crate) fn free_walk(&self, mm: &MemoryManager) -> Result<()> {
        self.free_walk_table(mm, self.root)
    }

    fn free_walk_table(&self, mm: &MemoryManager, table: PhysAddr) -> Result<()> {
        let mem = mm.phys();
        for index in 0..PTE_COUNT {
            let pte = Pte::from_bits(mem.pte_load(table, index));
            if !pte.is_valid() {
                continue;
            }
            if pte.is_leaf() {
                return Err(Fault::FreeWalkLeaf(table).into());
            }
            let child = pte.pa();
            if !child.is_page_aligned() || !mm.frames().contains(child) {
                return Err(Fault::FreeWalkBadChild(child).into());
            }
            self.free_walk_table(mm, child)?;
            mem.pte_store(table, index, 0);
        }
        mm.kfree(table)
    }

    /// Write a recursive dump of the tree: one line per valid entry with
    /// its reconstructed virtual address, raw bits and physical address,
    /// indented by depth.
    pub fn dump<W: fmt::Write>(&self, mm: &MemoryManager, out: &mut W) -> fmt::Result {
        writeln!(out, "page table {}", self.root)?;
        self.dump_table(mm, out, self.root, 2, 0)
    }

    fn dump_table<W: fmt::Write>(
        &self,
        mm: &MemoryManager,
        out: &mut W,
        table: PhysAddr,
        level: usize,
        va_prefix: usize,
    ) -> fmt::Result {
        let mem = mm.phys();
        for index in 0..PTE_COUNT {
            let pte = Pte::from_bits(mem.pte_load(table, index));
            if !pte.is_valid() {
                continue;
            }
            let mut va = va_prefix | (index << (PGSHIFT + 9 * level));
            // Sign-extend top-half addresses the way the hardware reads them.
            if level == 2 && index >= PTE_COUNT / 2 {
                va |= usize::MAX << 39;
            }
            for _ in 0..(2 - level) + 1 {
                write!(out, " ..")?;
            }
            writeln!(out, "{:#x}: pte {:#x} pa {}", va, pte.bits(), pte.pa())?;
            if level > 0 && !pte.is_leaf() {
                self.dump_table(mm, out, pte.pa(), level - 1, va)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{MemoryLayout, SUPERPGSIZE};
    use crate::phys::MemoryManager;

    fn mm(frames: usize, superframes: usize) -> MemoryManager {
        let super_base = PhysAddr(0x8020_0000);
        MemoryManager::new(
            MemoryLayout::new(
                PhysAddr(super_base.0 - frames * PGSIZE),
                super_base,
                super_base.add(superframes * SUPERPGSIZE),
            )
            .unwrap(),
        )
    }

    #[test]
    fn pte_round_trips_address_and_flags() {
        let pa = PhysAddr(0x8019_d000);
        let pte = Pte::new(pa, PteFlags::V | PteFlags::R | PteFlags::U);
        assert_eq!(pte.pa(), pa);
        assert!(pte.is_valid());
        assert!(pte.is_leaf());
        assert!(pte.user());
        assert!(!pte.writable());
    }

    #[test]
    fn valid_entry_without_permissions_is_not_a_leaf() {
        let pte = Pte::new(PhysAddr(0x8000_0000), PteFlags::V);
        assert!(pte.is_valid());
        assert!(!pte.is_leaf());
    }

    #[test]
    fn walk_with_alloc_builds_intermediate_tables() {
        let m = mm(8, 0);
        let pt = PageTable::alloc(&m).unwrap();
        let before = m.free_frames();
        let slot = pt.walk(&m, VirtAddr(0x40_0000), true).unwrap().unwrap();
        assert_eq!(slot.level(), 0);
        // Two intermediate tables were created under the root.
        assert_eq!(m.free_frames(), before - 2);
        // Second walk finds them without allocating.
        pt.walk(&m, VirtAddr(0x40_0000), false).unwrap().unwrap();
        assert_eq!(m.free_frames(), before - 2);
    }

    #[test]
    fn walk_without_alloc_reports_missing_path() {
        let m = mm(4, 0);
        let pt = PageTable::alloc(&m).unwrap();
        assert!(pt.walk(&m, VirtAddr(0x1000), false).unwrap().is_none());
    }

    #[test]
    fn walk_rejects_va_at_or_above_maxva() {
        let m = mm(4, 0);
        let pt = PageTable::alloc(&m).unwrap();
        let va = VirtAddr(MAXVA);
        assert_eq!(
            pt.walk(&m, va, true),
            Err(Fault::VirtOutOfRange(va).into())
        );
    }

    #[test]
    fn walk_stops_early_on_superpage_leaf() {
        let m = mm(8, 1);
        let pt = PageTable::alloc(&m).unwrap();
        let sf = m.superalloc().unwrap();
        let slot = pt.walk_level1(&m, VirtAddr(0), true).unwrap().unwrap();
        slot.store(m.phys(), Pte::new(sf, PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::U));
        // A plain walk into the middle of the superpage surfaces the
        // level-1 leaf instead of descending.
        let slot = pt.walk(&m, VirtAddr(0x1234_5), false).unwrap().unwrap();
        assert_eq!(slot.level(), 1);
        assert!(slot.load(m.phys()).is_leaf());
    }

    #[test]
    fn translate_applies_per_level_offsets() {
        let m = mm(8, 1);
        let pt = PageTable::alloc(&m).unwrap();
        // 4KiB page at va 0x3000.
        let frame = m.kalloc().unwrap();
        let slot = pt.walk(&m, VirtAddr(0x3000), true).unwrap().unwrap();
        slot.store(m.phys(), Pte::new(frame, PteFlags::V | PteFlags::R | PteFlags::U));
        assert_eq!(
            pt.translate(&m, VirtAddr(0x3abc)),
            Some(frame.add(0xabc))
        );
        // Superpage at va 2MiB.
        let sf = m.superalloc().unwrap();
        let slot = pt.walk_level1(&m, VirtAddr(SUPERPGSIZE), true).unwrap().unwrap();
        slot.store(m.phys(), Pte::new(sf, PteFlags::V | PteFlags::R | PteFlags::U));
        assert_eq!(
            pt.translate(&m, VirtAddr(SUPERPGSIZE + 0x12_3456)),
            Some(sf.add(0x12_3456))
        );
        assert_eq!(pt.leaf_level(&m, VirtAddr(SUPERPGSIZE)), Some(1));
        assert_eq!(pt.leaf_level(&m, VirtAddr(0x3000)), Some(0));
    }

    #[test]
    fn translate_refuses_kernel_only_mappings() {
        let m = mm(8, 0);
        let pt = PageTable::alloc(&m).unwrap();
        let frame = m.kalloc().unwrap();
        let slot = pt.walk(&m, VirtAddr(0), true).unwrap().unwrap();
        slot.store(m.phys(), Pte::new(frame, PteFlags::V | PteFlags::R | PteFlags::W));
        assert_eq!(pt.translate(&m, VirtAddr(0)), None);
    }

    #[test]
    fn dump_lists_every_valid_entry_with_depth() {
        let m = mm(8, 0);
        let pt = PageTable::alloc(&m).unwrap();
        let frame = m.kalloc().unwrap();
        let slot = pt.walk(&m, VirtAddr(0x5000), true).unwrap().unwrap();
        slot.store(m.phys(), Pte::new(frame, PteFlags::V | PteFlags::R | PteFlags::U));
        let mut out = String::new();
        pt.dump(&m, &mut out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4, "root header + one entry per level");
        assert!(lines[1].starts_with(" .."));
        assert!(lines[3].starts_with(" .. .. .."));
        assert!(lines[3].contains("0x5000"));
    }
}
