//! Per-hart translation control.
//!
//! Switching the active translation root needs ordering barriers on both
//! sides of the `satp` write: one to let outstanding page-table stores
//! land before the MMU can observe the new root, one to drop stale cached
//! translations afterwards. On non-RISC-V hosts these compile to ordering
//! stubs so the sequencing is still exercised.

use crate::layout::{PGSHIFT, PhysAddr};
use crate::page_table::PageTable;

/// Sv39 mode field of the `satp` register.
const SATP_SV39: usize = 8 << 60;

/// Encode a page-table root into an Sv39 `satp` value.
pub fn make_satp(root: PhysAddr) -> usize {
    SATP_SV39 | (root.0 >> PGSHIFT)
}

#[cfg(target_arch = "riscv64")]
mod arch {
    /// Flush every cached translation on this hart.
    pub fn sfence_vma() {
        unsafe { core::arch::asm!("sfence.vma zero, zero") };
    }

    /// Write the translation-root register.
    pub fn write_satp(value: usize) {
        unsafe { core::arch::asm!("csrw satp, {}", in(reg) value) };
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod arch {
    use core::sync::atomic::{compiler_fence, Ordering};

    /// Ordering stub standing in for `sfence.vma`.
    pub fn sfence_vma() {
        compiler_fence(Ordering::SeqCst);
    }

    /// Ordering stub standing in for the `satp` CSR write.
    pub fn write_satp(_value: usize) {
        compiler_fence(Ordering::SeqCst);
    }
}

pub use arch::sfence_vma;

/// Make `pt` the active translation root, fenced on both sides.
pub fn install_root(pt: PageTable) {
    // Let any page-table writes finish before the switch.
    arch::sfence_vma();
    arch::write_satp(make_satp(pt.root()));
    // Drop translations cached under the old root.
    arch::sfence_vma();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PhysAddr;

    #[test]
    fn satp_encodes_mode_and_root_ppn() {
        let satp = make_satp(PhysAddr(0x8020_3000));
        assert_eq!(satp >> 60, 8);
        assert_eq!((satp << 4) >> 4, 0x8020_3000 >> 12);
    }
}
