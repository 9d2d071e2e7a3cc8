//! Physical memory: the modeled RAM arena and the two frame pools.
//!
//! [`PhysMemory`] stands in for the identity-mapped physical RAM a kernel
//! would touch directly; every byte and PTE access in the crate funnels
//! through it, keeping the raw-pointer work in one place.
//!
//! [`FrameAllocator`] hands out 4KiB frames from `[kernel_end, super_base)`
//! with a per-frame reference count. [`SuperframeAllocator`] hands out
//! whole 2MiB chunks from `[super_base, phys_top)` with no internal
//! sharing. Each pool owns exactly one lock; the lock is released before
//! any junk fill so it never spans a data copy.

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;

use spin::Mutex;

use crate::error::{Fault, Result, VmError};
use crate::layout::{MemoryLayout, PhysAddr, PGSIZE, SUPERPGSIZE};

/// Byte pattern written into a frame when it is handed out.
pub const JUNK_ALLOC: u8 = 0x05;
/// Byte pattern written into a frame when it returns to the freelist.
pub const JUNK_FREE: u8 = 0x01;

// ============================================================================
// Modeled physical memory
// ============================================================================

/// The physical RAM the pools carve up, as one contiguous byte arena
/// covering `[kernel_end, phys_top)`.
///
/// Interior mutability with `&self` mirrors how kernel code addresses
/// physical memory through a shared identity map. Soundness relies on the
/// concurrency contract from the crate docs: allocator state is behind the
/// pool locks, and callers serialize all mutation of any one address
/// space's tables and data pages.
pub struct PhysMemory {
    layout: MemoryLayout,
    storage: Vec<UnsafeCell<u8>>,
}

// Shared access is governed by the pool locks and the per-address-space
// serialization contract.
unsafe impl Sync for PhysMemory {}
unsafe impl Send for PhysMemory {}

impl PhysMemory {
    /// Build a zero-filled arena for `layout`.
    pub fn new(layout: MemoryLayout) -> Self {
        let mut storage = Vec::with_capacity(layout.span());
        storage.resize_with(layout.span(), || UnsafeCell::new(0));
        Self { layout, storage }
    }

    /// The boot-time layout this arena models.
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    fn ptr(&self, pa: PhysAddr, len: usize) -> *mut u8 {
        let off = pa.0.checked_sub(self.layout.kernel_end.0);
        let off = match off {
            Some(off) if off + len <= self.storage.len() => off,
            _ => panic!("physical access {}+{:#x} outside modeled RAM", pa, len),
        };
        self.storage[off].get()
    }

    /// Copy `buf.len()` bytes out of physical memory starting at `pa`.
    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let src = self.ptr(pa, buf.len());
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    /// Copy `src.len()` bytes into physical memory starting at `pa`.
    pub fn write(&self, pa: PhysAddr, src: &[u8]) {
        let dst = self.ptr(pa, src.len());
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }

    /// Fill `[pa, pa+len)` with `byte`.
    pub fn fill(&self, pa: PhysAddr, len: usize, byte: u8) {
        let dst = self.ptr(pa, len);
        unsafe { ptr::write_bytes(dst, byte, len) };
    }

    /// Copy `len` bytes from one physical range to another.
    pub fn copy(&self, dst: PhysAddr, src: PhysAddr, len: usize) {
        let s = self.ptr(src, len);
        let d = self.ptr(dst, len);
        unsafe { ptr::copy(s, d, len) };
    }

    /// Load raw PTE `index` of the table page at `table`.
    pub(crate) fn pte_load(&self, table: PhysAddr, index: usize) -> u64 {
        let mut raw = [0u8; 8];
        self.read(table.add(index * 8), &mut raw);
        u64::from_ne_bytes(raw)
    }

    /// Store raw PTE `index` of the table page at `table`.
    pub(crate) fn pte_store(&self, table: PhysAddr, index: usize, value: u64) {
        self.write(table.add(index * 8), &value.to_ne_bytes());
    }
}

// ============================================================================
// Base-frame allocator
// ============================================================================

struct FramePool {
    freelist: Vec<PhysAddr>,
    ref_count: Vec<u16>,
}

/// Allocator for 4KiB frames with per-frame reference counting.
///
/// A count of 0 means the frame is on the freelist; a count of n >= 1 means
/// n mappings reference it. Misuse (double free, foreign or unaligned
/// address, retain of an unreferenced frame) is a [`Fault`].
pub struct FrameAllocator {
    base: PhysAddr,
    limit: PhysAddr,
    inner: Mutex<FramePool>,
}

impl FrameAllocator {
    /// Seed the pool with every frame in `[base, limit)`, junk-filled as
    /// if freed.
    pub fn new(mem: &PhysMemory, base: PhysAddr, limit: PhysAddr) -> Self {
        let count = (limit.0 - base.0) / PGSIZE;
        let mut freelist = Vec::with_capacity(count);
        for i in (0..count).rev() {
            let pa = base.add(i * PGSIZE);
            mem.fill(pa, PGSIZE, JUNK_FREE);
            freelist.push(pa);
        }
        log::info!("frame pool: {} frames in [{}, {})", count, base, limit);
        Self {
            base,
            limit,
            inner: Mutex::new(FramePool { freelist, ref_count: alloc::vec![0; count] }),
        }
    }

    /// True if `pa` lies inside the managed range.
    pub(crate) fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa < self.limit
    }

    fn index(&self, pa: PhysAddr) -> usize {
        (pa.0 - self.base.0) / PGSIZE
    }

    fn check(&self, pa: PhysAddr) -> Result<usize> {
        if !pa.is_page_aligned() {
            return Err(Fault::FrameUnaligned(pa).into());
        }
        if !self.contains(pa) {
            return Err(Fault::FrameOutOfRange(pa).into());
        }
        Ok(self.index(pa))
    }

    /// Pop a frame, set its reference count to 1 and junk-fill it.
    pub fn allocate(&self, mem: &PhysMemory) -> Result<PhysAddr> {
        let pa = {
            let mut pool = self.inner.lock();
            let pa = pool.freelist.pop().ok_or(VmError::OutOfFrames)?;
            let index = self.index(pa);
            debug_assert_eq!(pool.ref_count[index], 0);
            pool.ref_count[index] = 1;
            pa
        };
        mem.fill(pa, PGSIZE, JUNK_ALLOC);
        Ok(pa)
    }

    /// Drop one reference to `pa`; the frame returns to the freelist only
    /// when the last reference goes.
    pub fn free(&self, mem: &PhysMemory, pa: PhysAddr) -> Result<()> {
        let index = self.check(pa)?;
        let last = {
            let mut pool = self.inner.lock();
            if pool.ref_count[index] == 0 {
                return Err(Fault::FreeOfFree(pa).into());
            }
            pool.ref_count[index] -= 1;
            pool.ref_count[index] == 0
        };
        if last {
            // Junk-fill outside the lock; nothing references the frame now.
            mem.fill(pa, PGSIZE, JUNK_FREE);
            self.inner.lock().freelist.push(pa);
        }
        Ok(())
    }

    /// Take an additional reference to an already-allocated frame.
    pub fn retain(&self, pa: PhysAddr) -> Result<()> {
        let index = self.check(pa)?;
        let mut pool = self.inner.lock();
        if pool.ref_count[index] == 0 {
            return Err(Fault::RetainUnreferenced(pa).into());
        }
        pool.ref_count[index] += 1;
        Ok(())
    }

    /// Frames currently on the freelist.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().freelist.len()
    }
}

// ============================================================================
// Superframe allocator
// ============================================================================

struct SuperPool {
    freelist: Vec<PhysAddr>,
    allocated: Vec<bool>,
}

/// Allocator for indivisible 2MiB superframes.
///
/// No reference counting: a superframe is never shared while it remains a
/// superpage. It either sits whole on the freelist or backs exactly one
/// level-1 leaf.
pub struct SuperframeAllocator {
    base: PhysAddr,
    limit: PhysAddr,
    inner: Mutex<SuperPool>,
}

impl SuperframeAllocator {
    /// Seed the pool with every superframe in `[base, limit)`.
    pub fn new(base: PhysAddr, limit: PhysAddr) -> Self {
        let count = (limit.0 - base.0) / SUPERPGSIZE;
        let mut freelist = Vec::with_capacity(count);
        for i in (0..count).rev() {
            freelist.push(base.add(i * SUPERPGSIZE));
        }
        log::info!("superframe pool: {} superframes in [{}, {})", count, base, limit);
        Self {
            base,
            limit,
            inner: Mutex::new(SuperPool { freelist, allocated: alloc::vec![false; count] }),
        }
    }

    /// True if `pa` lies inside the managed range.
    pub(crate) fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa < self.limit
    }

    fn check(&self, pa: PhysAddr) -> Result<usize> {
        if !pa.is_super_aligned() {
            return Err(Fault::SuperUnaligned(pa).into());
        }
        if !self.contains(pa) {
            return Err(Fault::SuperOutOfRange(pa).into());
        }
        Ok((pa.0 - self.base.0) / SUPERPGSIZE)
    }

    /// Pop a whole superframe.
    pub fn allocate(&self) -> Result<PhysAddr> {
        let mut pool = self.inner.lock();
        let pa = pool.freelist.pop().ok_or(VmError::OutOfSuperframes)?;
        let index = (pa.0 - self.base.0) / SUPERPGSIZE;
        pool.allocated[index] = true;
        Ok(pa)
    }

    /// Return a whole superframe to the pool.
    pub fn free(&self, pa: PhysAddr) -> Result<()> {
        let index = self.check(pa)?;
        let mut pool = self.inner.lock();
        if !pool.allocated[index] {
            return Err(Fault::SuperFreeOfFree(pa).into());
        }
        pool.allocated[index] = false;
        pool.freelist.push(pa);
        Ok(())
    }

    /// Superframes currently on the freelist.
    pub fn free_superframes(&self) -> usize {
        self.inner.lock().freelist.len()
    }
}

// ============================================================================
// The bundle handed to mapping code
// ============================================================================

/// Modeled RAM plus both pools, constructed once at boot and passed by
/// shared reference to all mapping code.
pub struct MemoryManager {
    mem: PhysMemory,
    frames: FrameAllocator,
    supers: SuperframeAllocator,
}

impl MemoryManager {
    /// Build the arena and seed both pools from `layout`.
    pub fn new(layout: MemoryLayout) -> Self {
        let mem = PhysMemory::new(layout);
        let frames = FrameAllocator::new(&mem, layout.kernel_end, layout.super_base);
        let supers = SuperframeAllocator::new(layout.super_base, layout.phys_top);
        Self { mem, frames, supers }
    }

    /// The modeled physical memory.
    pub fn phys(&self) -> &PhysMemory {
        &self.mem
    }

    /// The base-frame pool.
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// The superframe pool.
    pub fn superframes(&self) -> &SuperframeAllocator {
        &self.supers
    }

    /// Allocate one 4KiB frame.
    pub fn kalloc(&self) -> Result<PhysAddr> {
        self.frames.allocate(&self.mem)
    }

    /// Release one reference to a 4KiB frame.
    pub fn kfree(&self, pa: PhysAddr) -> Result<()> {
        self.frames.free(&self.mem, pa)
    }

    /// Take an extra reference to a 4KiB frame.
    pub fn krefer(&self, pa: PhysAddr) -> Result<()> {
        self.frames.retain(pa)
    }

    /// Allocate one 2MiB superframe.
    pub fn superalloc(&self) -> Result<PhysAddr> {
        self.supers.allocate()
    }

    /// Return one 2MiB superframe.
    pub fn superfree(&self, pa: PhysAddr) -> Result<()> {
        self.supers.free(pa)
    }

    /// Frames currently free in the base pool.
    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    /// Superframes currently free.
    pub fn free_superframes(&self) -> usize {
        self.supers.free_superframes()
    }
}
