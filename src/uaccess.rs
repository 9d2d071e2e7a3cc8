//! Byte copies across the kernel/user boundary.
//!
//! Each copy proceeds page by page: translate the page's virtual address,
//! move the sub-page remainder, step to the next page. Failures here are
//! caller-input errors (bad syscall arguments), never faults: an unmapped
//! or kernel-only page, or a write through a read-only mapping, is
//! reported and nothing more of the transfer happens.

use crate::error::{Result, VmError};
use crate::layout::{pg_round_down, MAXVA, PGSIZE, VirtAddr};
use crate::page_table::PageTable;
use crate::phys::MemoryManager;

/// Copy `src` into user memory at `dstva`.
///
/// The destination page must be writable as well as user-accessible;
/// refusing read-only pages keeps user-visible text regions intact. The
/// check runs before any byte of that page moves.
pub fn copyout(mm: &MemoryManager, pt: PageTable, dstva: VirtAddr, src: &[u8]) -> Result<()> {
    let mem = mm.phys();
    let mut dst = dstva.0;
    let mut copied = 0;
    while copied < src.len() {
        let va0 = pg_round_down(dst);
        if va0 >= MAXVA {
            return Err(VmError::BadAddress(VirtAddr(dst)));
        }
        let slot = pt
            .walk(mm, VirtAddr(va0), false)?
            .ok_or(VmError::BadAddress(VirtAddr(dst)))?;
        let pte = slot.load(mem);
        if !pte.is_valid() {
            return Err(VmError::BadAddress(VirtAddr(dst)));
        }
        if !pte.writable() {
            return Err(VmError::ReadOnly(VirtAddr(dst)));
        }
        let pa0 = pt
            .translate(mm, VirtAddr(va0))
            .ok_or(VmError::BadAddress(VirtAddr(dst)))?;
        let n = (PGSIZE - (dst - va0)).min(src.len() - copied);
        mem.write(pa0.add(dst - va0), &src[copied..copied + n]);
        copied += n;
        dst = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy `dst.len()` bytes out of user memory at `srcva` into `dst`.
pub fn copyin(mm: &MemoryManager, pt: PageTable, dst: &mut [u8], srcva: VirtAddr) -> Result<()> {
    let mem = mm.phys();
    let mut src = srcva.0;
    let mut copied = 0;
    while copied < dst.len() {
        let va0 = pg_round_down(src);
        let pa0 = pt
            .translate(mm, VirtAddr(va0))
            .ok_or(VmError::BadAddress(VirtAddr(src)))?;
        let n = (PGSIZE - (src - va0)).min(dst.len() - copied);
        mem.read(pa0.add(src - va0), &mut dst[copied..copied + n]);
        copied += n;
        src = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy a NUL-terminated string out of user memory at `srcva`.
///
/// `dst.len()` is the byte budget, counting the terminator. Returns the
/// string length (terminator excluded). If no NUL shows up within the
/// budget the copy fails; nothing is ever written past the budget.
pub fn copyinstr(mm: &MemoryManager, pt: PageTable, dst: &mut [u8], srcva: VirtAddr) -> Result<usize> {
    let mem = mm.phys();
    let max = dst.len();
    let mut src = srcva.0;
    let mut copied = 0;
    while copied < max {
        let va0 = pg_round_down(src);
        let pa0 = pt
            .translate(mm, VirtAddr(va0))
            .ok_or(VmError::BadAddress(VirtAddr(src)))?;
        let n = (PGSIZE - (src - va0)).min(max - copied);
        let chunk = &mut dst[copied..copied + n];
        mem.read(pa0.add(src - va0), chunk);
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            return Ok(copied + nul);
        }
        copied += n;
        src = va0 + PGSIZE;
    }
    Err(VmError::NoNulTerminator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{MemoryLayout, PhysAddr, SUPERPGSIZE};
    use crate::page_table::PteFlags;
    use crate::vm::{map_range, AddressSpace, PageSize};

    fn mm(frames: usize, superframes: usize) -> MemoryManager {
        let super_base = PhysAddr(0x8100_0000);
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
    fn copyout_copyin_round_trip_across_pages() {
        let m = mm(16, 0);
        let mut space = AddressSpace::new(&m).unwrap();
        space.grow(&m, 3 * PGSIZE, PteFlags::empty()).unwrap();
        let msg: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        // Straddle the first page boundary.
        let va = VirtAddr(PGSIZE - 100);
        copyout(&m, space.table, va, &msg).unwrap();
        let mut back = vec![0u8; msg.len()];
        copyin(&m, space.table, &mut back, va).unwrap();
        assert_eq!(back, msg);
        space.destroy(&m).unwrap();
    }

    #[test]
    fn copyout_to_read_only_page_changes_nothing() {
        let m = mm(16, 0);
        let pt = crate::page_table::PageTable::alloc(&m).unwrap();
        let frame = m.kalloc().unwrap();
        map_range(
            &m,
            pt,
            VirtAddr(0),
            PGSIZE,
            frame,
            PteFlags::R | PteFlags::U,
            PageSize::Base,
        )
        .unwrap();
        let mut before = [0u8; PGSIZE];
        m.phys().read(frame, &mut before);
        assert_eq!(
            copyout(&m, pt, VirtAddr(16), b"scribble"),
            Err(VmError::ReadOnly(VirtAddr(16)))
        );
        let mut after = [0u8; PGSIZE];
        m.phys().read(frame, &mut after);
        assert_eq!(before[..], after[..], "frame untouched by rejected copy");
    }

    #[test]
    fn copyin_from_unmapped_page_fails() {
        let m = mm(16, 0);
        let mut space = AddressSpace::new(&m).unwrap();
        space.grow(&m, PGSIZE, PteFlags::empty()).unwrap();
        let mut buf = [0u8; 64];
        // Read starts in the mapped page but runs off its end.
        let err = copyin(&m, space.table, &mut buf, VirtAddr(PGSIZE - 8)).unwrap_err();
        assert_eq!(err, VmError::BadAddress(VirtAddr(PGSIZE)));
        space.destroy(&m).unwrap();
    }

    #[test]
    fn copyinstr_stops_at_nul() {
        let m = mm(16, 0);
        let mut space = AddressSpace::new(&m).unwrap();
        space.grow(&m, PGSIZE, PteFlags::empty()).unwrap();
        copyout(&m, space.table, VirtAddr(0), b"sv39\0junk").unwrap();
        let mut dst = [0xffu8; 32];
        let len = copyinstr(&m, space.table, &mut dst, VirtAddr(0)).unwrap();
        assert_eq!(len, 4);
        assert_eq!(&dst[..5], b"sv39\0");
        space.destroy(&m).unwrap();
    }

    #[test]
    fn copyinstr_without_nul_respects_budget() {
        let m = mm(16, 0);
        let mut space = AddressSpace::new(&m).unwrap();
        space.grow(&m, PGSIZE, PteFlags::empty()).unwrap();
        copyout(&m, space.table, VirtAddr(0), b"0123456789abcdef").unwrap();
        let mut dst = [0xeeu8; 9];
        let err = copyinstr(&m, space.table, &mut dst[..8], VirtAddr(0)).unwrap_err();
        assert_eq!(err, VmError::NoNulTerminator);
        assert_eq!(dst[8], 0xee, "byte past the budget untouched");
        space.destroy(&m).unwrap();
    }
}
