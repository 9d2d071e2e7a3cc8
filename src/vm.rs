//! Mapping management and the address-space lifecycle.
//!
//! [`map_range`]/[`unmap_pages`] install and remove leaf entries, with the
//! granularity an explicit [`PageSize`] parameter rather than something
//! inferred from address magnitude. Partial unmap of a superpage goes
//! through copy-based demotion: the 2MiB region is re-backed by 512 fresh
//! base frames behind a new level-0 table, the level-1 entry is switched
//! over, and only then does the original superframe return to its pool.
//!
//! [`AddressSpace`] composes those primitives into the operations the
//! process manager calls: create, bootstrap-load, grow, shrink, fork-copy
//! and destroy. Growth and fork are all-or-nothing: any failure unwinds
//! what the call had already mapped.

use alloc::vec::Vec;

use crate::error::{Fault, Result, VmError};
use crate::layout::{
    is_aligned, pg_round_up, super_round_down, PGSIZE, PTE_COUNT, PhysAddr, SUPERPGSIZE, VirtAddr,
};
use crate::page_table::{PageTable, Pte, PteFlags};
use crate::phys::MemoryManager;

/// Mapping granularity, stated explicitly at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4KiB leaf at level 0.
    Base,
    /// 2MiB leaf at level 1.
    Super,
}

impl PageSize {
    /// Bytes covered by one leaf of this size.
    pub const fn bytes(self) -> usize {
        match self {
            PageSize::Base => PGSIZE,
            PageSize::Super => SUPERPGSIZE,
        }
    }
}

// ============================================================================
// Mapping manager
// ============================================================================

/// Install leaves covering `[va, va+size)` -> `[pa, pa+size)`.
///
/// `va`, `pa` and `size` must all be aligned to the requested granularity,
/// and no entry in the range may already be valid; both are caller bugs.
/// Walker allocation failure is recoverable and leaves entries installed
/// so far in place for the caller to unwind.
pub fn map_range(
    mm: &MemoryManager,
    pt: PageTable,
    va: VirtAddr,
    size: usize,
    pa: PhysAddr,
    perm: PteFlags,
    page: PageSize,
) -> Result<()> {
    let gran = page.bytes();
    if !is_aligned(va.0, gran) || !is_aligned(pa.0, gran) || !is_aligned(size, gran) {
        return Err(Fault::Misaligned(va).into());
    }
    if size == 0 {
        return Err(Fault::EmptyRange(va).into());
    }
    let mem = mm.phys();
    let mut off = 0;
    while off < size {
        let v = VirtAddr(va.0 + off);
        let found = match page {
            PageSize::Base => pt.walk(mm, v, true)?,
            PageSize::Super => pt.walk_level1(mm, v, true)?,
        };
        let Some(slot) = found else {
            unreachable!("walk with alloc neither failed nor found a slot")
        };
        if slot.load(mem).is_valid() {
            return Err(Fault::Remap(v).into());
        }
        slot.store(mem, Pte::new(pa.add(off), perm | PteFlags::V));
        off += gran;
    }
    Ok(())
}

/// Remove `npages` 4KiB-granularity mappings starting at `va`, optionally
/// returning the backing frames to their pools.
///
/// A superpage wholly inside the range is released as one unit. A
/// superpage the range only grazes is first demoted to 512 base pages so
/// the covered subset can be removed without disturbing the rest.
pub fn unmap_pages(
    mm: &MemoryManager,
    pt: PageTable,
    va: VirtAddr,
    npages: usize,
    free: bool,
) -> Result<()> {
    if !va.is_page_aligned() {
        return Err(Fault::Misaligned(va).into());
    }
    let mem = mm.phys();
    let end = va.0 + npages * PGSIZE;
    let mut a = va.0;
    while a < end {
        if let Some(slot) = pt.walk_level1(mm, VirtAddr(a), false)? {
            let pte = slot.load(mem);
            if slot.level() == 1 && pte.is_leaf() {
                let start = super_round_down(a);
                let next = start + SUPERPGSIZE;
                if a == start && next <= end {
                    // The whole superpage is being removed; no demotion.
                    if free {
                        mm.superfree(pte.pa())?;
                    }
                    slot.store(mem, Pte::empty());
                    a = next;
                    continue;
                }
                // Partial coverage: demote, then retry this address on the
                // 4KiB path below.
                demote_superpage(mm, pt, VirtAddr(a))?;
            }
        }
        let v = VirtAddr(a);
        let slot = pt
            .walk(mm, v, false)?
            .ok_or(VmError::from(Fault::UnmapMissing(v)))?;
        let pte = slot.load(mem);
        if !pte.is_valid() {
            return Err(Fault::UnmapMissing(v).into());
        }
        if !pte.is_leaf() {
            return Err(Fault::UnmapNonLeaf(v).into());
        }
        if free {
            mm.kfree(pte.pa())?;
        }
        slot.store(mem, Pte::empty());
        a += PGSIZE;
    }
    Ok(())
}

/// Rewrite the level-1 leaf covering `va` as a level-0 table of 512 base
/// pages carrying a copy of the superpage's data, then return the
/// superframe to its pool.
///
/// The level-1 entry switches to the new table before the superframe is
/// freed, so the data is reachable at every point. If the base pool
/// cannot supply the copy, everything allocated here is returned and the
/// superpage is left untouched.
fn demote_superpage(mm: &MemoryManager, pt: PageTable, va: VirtAddr) -> Result<()> {
    let mem = mm.phys();
    let Some(slot) = pt.walk_level1(mm, va, false)? else {
        return Ok(());
    };
    let pte = slot.load(mem);
    if slot.level() != 1 || !pte.is_leaf() {
        return Ok(());
    }
    let super_pa = pte.pa();
    let perm = pte.flags() & PteFlags::PERM;

    let unwind = |pages: &[PhysAddr], table: PhysAddr| -> Result<()> {
        for &page in pages {
            mm.kfree(page)?;
        }
        mm.kfree(table)
    };

    let table = mm.kalloc()?;
    mem.fill(table, PGSIZE, 0);
    let mut pages: Vec<PhysAddr> = Vec::with_capacity(PTE_COUNT);
    for i in 0..PTE_COUNT {
        let page = match mm.kalloc() {
            Ok(page) => page,
            Err(e) => {
                unwind(&pages, table)?;
                return Err(e);
            }
        };
        mem.copy(page, super_pa.add(i * PGSIZE), PGSIZE);
        mem.pte_store(table, i, Pte::new(page, perm | PteFlags::V).bits());
        pages.push(page);
    }

    log::debug!(
        "demoting superpage at va {:#x} (pa {})",
        super_round_down(va.0),
        super_pa
    );
    slot.store(mem, Pte::new(table, PteFlags::V));
    mm.superfree(super_pa)
}

/// Strip the user-access bit from the 4KiB page containing `va`, demoting
/// a covering superpage first so only that page is affected. Used for
/// stack guard pages.
pub fn clear_user_access(mm: &MemoryManager, pt: PageTable, va: VirtAddr) -> Result<()> {
    let mem = mm.phys();
    if let Some(slot) = pt.walk_level1(mm, va, false)? {
        let pte = slot.load(mem);
        if slot.level() == 1 && pte.is_leaf() {
            demote_superpage(mm, pt, va)?;
        }
    }
    let slot = pt
        .walk(mm, va, false)?
        .ok_or(VmError::from(Fault::ClearUnmapped(va)))?;
    let pte = slot.load(mem);
    if !pte.is_valid() {
        return Err(Fault::ClearUnmapped(va).into());
    }
    slot.store(mem, Pte::from_bits(pte.bits() & !PteFlags::U.bits()));
    Ok(())
}

// ============================================================================
// Growth and shrinkage
// ============================================================================

/// Grow a space from `old_size` to `new_size` bytes, preferring superpages
/// for aligned 2MiB spans and falling back to base pages when the
/// superframe pool runs dry. All-or-nothing: any failure unwinds to
/// `old_size` before the error is reported.
pub fn grow(
    mm: &MemoryManager,
    pt: PageTable,
    old_size: usize,
    new_size: usize,
    xperm: PteFlags,
) -> Result<usize> {
    if new_size < old_size {
        return Ok(old_size);
    }
    let perm = PteFlags::R | PteFlags::W | PteFlags::U | xperm;
    let mut a = pg_round_up(old_size);
    while a < new_size {
        match grow_step(mm, pt, a, new_size, perm) {
            Ok(step) => a += step,
            Err(e) => {
                shrink(mm, pt, a, old_size)?;
                return Err(e);
            }
        }
    }
    Ok(new_size)
}

fn grow_step(
    mm: &MemoryManager,
    pt: PageTable,
    a: usize,
    new_size: usize,
    perm: PteFlags,
) -> Result<usize> {
    if is_aligned(a, SUPERPGSIZE) && a + SUPERPGSIZE <= new_size {
        match mm.superalloc() {
            Ok(sf) => {
                mm.phys().fill(sf, SUPERPGSIZE, 0);
                if let Err(e) = map_range(mm, pt, VirtAddr(a), SUPERPGSIZE, sf, perm, PageSize::Super) {
                    mm.superfree(sf)?;
                    return Err(e);
                }
                return Ok(SUPERPGSIZE);
            }
            Err(VmError::OutOfSuperframes) => {
                log::debug!("grow: superframe pool empty, 4KiB fallback at va {:#x}", a);
            }
            Err(e) => return Err(e),
        }
    }
    let frame = mm.kalloc()?;
    mm.phys().fill(frame, PGSIZE, 0);
    if let Err(e) = map_range(mm, pt, VirtAddr(a), PGSIZE, frame, perm, PageSize::Base) {
        mm.kfree(frame)?;
        return Err(e);
    }
    Ok(PGSIZE)
}

/// Shrink a space from `old_size` to `new_size` bytes, freeing the backing
/// frames of every whole page no longer covered.
pub fn shrink(mm: &MemoryManager, pt: PageTable, old_size: usize, new_size: usize) -> Result<usize> {
    if new_size >= old_size {
        return Ok(old_size);
    }
    if pg_round_up(new_size) < pg_round_up(old_size) {
        let npages = (pg_round_up(old_size) - pg_round_up(new_size)) / PGSIZE;
        unmap_pages(mm, pt, VirtAddr(pg_round_up(new_size)), npages, true)?;
    }
    Ok(new_size)
}

// ============================================================================
// Address-space lifecycle
// ============================================================================

/// A process's private mapping: one page-table root plus the current
/// logical size in bytes.
#[derive(Debug)]
pub struct AddressSpace {
    /// Root of the translation tree.
    pub table: PageTable,
    /// Highest valid byte offset plus one.
    pub size: usize,
}

impl AddressSpace {
    /// Create an empty space: one zero-filled root table, size 0.
    pub fn new(mm: &MemoryManager) -> Result<Self> {
        Ok(Self { table: PageTable::alloc(mm)?, size: 0 })
    }

    /// Map one full-permission page at virtual address 0 and copy the
    /// bootstrap image into it. One-time path for the first process; the
    /// image must fit inside a single page.
    pub fn load_initcode(&mut self, mm: &MemoryManager, image: &[u8]) -> Result<()> {
        if image.len() >= PGSIZE {
            return Err(VmError::ImageTooLarge(image.len()));
        }
        let frame = mm.kalloc()?;
        mm.phys().fill(frame, PGSIZE, 0);
        map_range(
            mm,
            self.table,
            VirtAddr(0),
            PGSIZE,
            frame,
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
            PageSize::Base,
        )?;
        mm.phys().write(frame, image);
        self.size = PGSIZE;
        Ok(())
    }

    /// Grow to `new_size` bytes. See [`grow`].
    pub fn grow(&mut self, mm: &MemoryManager, new_size: usize, xperm: PteFlags) -> Result<usize> {
        self.size = grow(mm, self.table, self.size, new_size, xperm)?;
        Ok(self.size)
    }

    /// Shrink to `new_size` bytes. See [`shrink`].
    pub fn shrink(&mut self, mm: &MemoryManager, new_size: usize) -> Result<usize> {
        self.size = shrink(mm, self.table, self.size, new_size)?;
        Ok(self.size)
    }

    /// Deep-copy this space for a fork. Whole superpages are bulk-copied
    /// into fresh superframes; everything else goes page by page through
    /// [`PageTable::translate`], which resolves the right offset even when
    /// a byte range lands inside a superpage. On any failure the
    /// half-built child is torn down before the error is reported.
    pub fn fork(&self, mm: &MemoryManager) -> Result<AddressSpace> {
        let dst = PageTable::alloc(mm)?;
        let mut copied = 0usize;
        while copied < self.size {
            match copy_step(mm, self.table, dst, copied, self.size) {
                Ok(step) => copied += step,
                Err(e) => {
                    if let Err(teardown) = free_space(mm, dst, copied) {
                        log::error!("fork unwind faulted: {}", teardown);
                    }
                    return Err(e);
                }
            }
        }
        Ok(AddressSpace { table: dst, size: self.size })
    }

    /// Unmap everything, free the backing frames, then free every table
    /// page bottom-up. Consumes the space.
    pub fn destroy(self, mm: &MemoryManager) -> Result<()> {
        free_space(mm, self.table, self.size)
    }

    /// See [`clear_user_access`].
    pub fn clear_user_access(&mut self, mm: &MemoryManager, va: VirtAddr) -> Result<()> {
        clear_user_access(mm, self.table, va)
    }
}

fn copy_step(
    mm: &MemoryManager,
    src: PageTable,
    dst: PageTable,
    at: usize,
    size: usize,
) -> Result<usize> {
    let mem = mm.phys();
    if is_aligned(at, SUPERPGSIZE) && at + SUPERPGSIZE <= size {
        if let Some(slot) = src.walk_level1(mm, VirtAddr(at), false)? {
            let pte = slot.load(mem);
            if slot.level() == 1 && pte.is_leaf() {
                let perm = pte.flags() & PteFlags::PERM;
                let sf = mm.superalloc()?;
                mem.copy(sf, pte.pa(), SUPERPGSIZE);
                if let Err(e) = map_range(mm, dst, VirtAddr(at), SUPERPGSIZE, sf, perm, PageSize::Super) {
                    mm.superfree(sf)?;
                    return Err(e);
                }
                return Ok(SUPERPGSIZE);
            }
        }
    }
    let v = VirtAddr(at);
    let slot = src
        .walk(mm, v, false)?
        .ok_or(VmError::BadAddress(v))?;
    let pte = slot.load(mem);
    if !pte.is_valid() {
        return Err(VmError::BadAddress(v));
    }
    let perm = pte.flags() & PteFlags::PERM;
    // translate() resolves the intra-superpage offset when this 4KiB slice
    // lives inside a level-1 leaf.
    let pa = src.translate(mm, v).ok_or(VmError::BadAddress(v))?;
    let frame = mm.kalloc()?;
    mem.copy(frame, pa, PGSIZE);
    if let Err(e) = map_range(mm, dst, v, PGSIZE, frame, perm, PageSize::Base) {
        mm.kfree(frame)?;
        return Err(e);
    }
    Ok(PGSIZE)
}

/// Free user pages of `[0, size)`, then the table tree itself.
fn free_space(mm: &MemoryManager, pt: PageTable, size: usize) -> Result<()> {
    if size > 0 {
        unmap_pages(mm, pt, VirtAddr(0), pg_round_up(size) / PGSIZE, true)?;
    }
    pt.free_walk(mm)
}
