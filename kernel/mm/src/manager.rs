//! The memory manager: owned bootstrap context and global veneer.
//!
//! [`MemoryManager`] owns the frame allocator, the page table walker, the
//! kernel address space and the kernel heap cursor. Everything is a method
//! on the owned struct, so tests run independent instances side by side;
//! the `spin::Mutex<Option<_>>` global below is a thin veneer for kernel
//! code that has nowhere to thread the context through.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::paging::PhysFrame;

use crate::layout::{IDENTITY_MAP_LIMIT, KERNEL_HEAP};
use crate::mapper::{self, MapFlags};
use crate::pmm::BitmapAllocator;
use crate::region::RegionAllocator;
use crate::space::{self, AddressSpaceHandle};
use crate::walker::PageTableMapper;
use crate::{MmError, PAGE_SIZE, PmmError, VmmError, vmm};

/// Owns all memory management state for one machine.
pub struct MemoryManager {
    pmm: BitmapAllocator,
    mapper: PageTableMapper,
    kernel_space: AddressSpaceHandle,
    kernel_heap: RegionAllocator,
    active: AddressSpaceHandle,
}

impl MemoryManager {
    /// Bootstraps memory management over `total_memory` bytes of physical
    /// memory reachable at `phys_offset`.
    ///
    /// Initializes the frame allocator, builds the kernel address space
    /// with its identity window, and activates it through the registered
    /// root-load hook.
    pub fn new(total_memory: u64, phys_offset: usize) -> Result<Self, MmError> {
        // SAFETY: Bootstrap contract: the window at `phys_offset` maps all
        // of installed physical memory, and nothing else owns the
        // boot-reserved region yet.
        let mut pmm = unsafe { BitmapAllocator::new(total_memory, phys_offset)? };
        let mapper = PageTableMapper::new(phys_offset);
        let kernel_space = space::init_kernel_space(&mapper, &mut pmm, total_memory)?;

        log::info!(
            "mm: {} KiB total, {} frames free, identity window {} KiB",
            total_memory / 1024,
            pmm.free_frames_count(),
            IDENTITY_MAP_LIMIT.min(total_memory) / 1024,
        );

        let mut mm = Self {
            pmm,
            mapper,
            kernel_space,
            kernel_heap: RegionAllocator::new(KERNEL_HEAP),
            active: kernel_space,
        };
        mm.switch_to(kernel_space);
        Ok(mm)
    }

    // --- frame level ---

    /// Allocates one physical frame.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.pmm.allocate_frame()
    }

    /// Allocates `count` physically contiguous frames, returning the first.
    pub fn allocate_frames(&mut self, count: usize) -> Option<PhysFrame> {
        self.pmm.allocate_frames(count)
    }

    /// Returns a frame to the allocator.
    ///
    /// # Safety
    /// The frame must not be referenced by any live mapping.
    pub unsafe fn free_frame(&mut self, addr: PhysAddr) {
        unsafe { self.pmm.free_frame(addr) }
    }

    /// Returns `count` contiguous frames starting at `addr`.
    ///
    /// # Safety
    /// As [`MemoryManager::free_frame`], for the whole range.
    pub unsafe fn free_frames(&mut self, addr: PhysAddr, count: usize) {
        unsafe { self.pmm.free_frames(addr, count) }
    }

    /// Number of free frames.
    pub fn free_frames_count(&self) -> usize {
        self.pmm.free_frames_count()
    }

    /// Number of frames in use, including the boot reservation.
    pub fn used_frames(&self) -> usize {
        self.pmm.used_frames()
    }

    /// Total frames managed.
    pub fn total_frames(&self) -> usize {
        self.pmm.total_frames()
    }

    // --- kernel heap ---

    /// Allocates `size` bytes of zeroed kernel heap memory.
    pub fn allocate(&mut self, size: u32, flags: MapFlags) -> Result<VirtAddr, VmmError> {
        vmm::allocate(
            &self.mapper,
            &mut self.pmm,
            &mut self.kernel_heap,
            self.kernel_space.root(),
            size,
            flags,
        )
    }

    /// Frees kernel heap memory previously returned by
    /// [`MemoryManager::allocate`].
    pub fn free(&mut self, base: VirtAddr, size: u32) {
        vmm::free(&self.mapper, &mut self.pmm, self.kernel_space.root(), base, size);
    }

    // --- per-space operations ---

    /// Allocates zeroed memory in `space`, drawing virtual addresses from
    /// the caller's `cursor`.
    pub fn allocate_in(
        &mut self,
        space: AddressSpaceHandle,
        cursor: &mut RegionAllocator,
        size: u32,
        flags: MapFlags,
    ) -> Result<VirtAddr, VmmError> {
        vmm::allocate(&self.mapper, &mut self.pmm, cursor, space.root(), size, flags)
    }

    /// Frees memory in `space`, returning the backing frames.
    pub fn free_in(&mut self, space: AddressSpaceHandle, base: VirtAddr, size: u32) {
        vmm::free(&self.mapper, &mut self.pmm, space.root(), base, size);
    }

    /// Maps a fixed virtual range in `space` onto caller-owned physical
    /// memory. Contents are left untouched.
    pub fn map_fixed(
        &mut self,
        space: AddressSpaceHandle,
        virt: VirtAddr,
        phys: PhysAddr,
        size: u32,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        vmm::map_fixed(&self.mapper, &mut self.pmm, space.root(), virt, phys, size, flags)
    }

    /// Unmaps a fixed range in `space` without freeing frames.
    pub fn unmap_fixed(&mut self, space: AddressSpaceHandle, virt: VirtAddr, size: u32) {
        vmm::unmap_fixed(&self.mapper, space.root(), virt, size);
    }

    /// Translates `virt` through `space`.
    pub fn translate(&self, space: AddressSpaceHandle, virt: VirtAddr) -> Option<PhysAddr> {
        vmm::translate(&self.mapper, space.root(), virt)
    }

    // --- address spaces ---

    /// The kernel address space.
    pub fn kernel_space(&self) -> AddressSpaceHandle {
        self.kernel_space
    }

    /// The currently active address space.
    pub fn active_space(&self) -> AddressSpaceHandle {
        self.active
    }

    /// Creates a new address space cloned from the kernel space.
    pub fn create_address_space(&mut self) -> Result<AddressSpaceHandle, PmmError> {
        space::create_address_space(&self.mapper, &mut self.pmm, self.kernel_space.root())
    }

    /// Destroys `space`, reclaiming its private page tables and directory.
    ///
    /// If `space` is active, the kernel space is activated first. The
    /// kernel space itself cannot be destroyed.
    pub fn destroy_address_space(&mut self, space: AddressSpaceHandle) {
        if space == self.active {
            self.switch_to(self.kernel_space);
        }
        space::destroy_address_space(&self.mapper, &mut self.pmm, space, self.kernel_space.root());
    }

    /// Activates `space` through the registered root-load hook.
    pub fn switch_to(&mut self, space: AddressSpaceHandle) {
        self.active = space;
        mapper::arch_load_root(space.root());
    }

    // --- bulk kernel pages ---

    /// Allocates `count` contiguous frames and identity-maps them into the
    /// kernel space, returning the physical (and virtual) base address.
    pub fn allocate_kernel_pages(&mut self, count: usize) -> Option<PhysAddr> {
        let first = self.pmm.allocate_frames(count)?;
        let base = first.start_address();
        let size = (count * PAGE_SIZE) as u32;
        let mapped = vmm::map_fixed(
            &self.mapper,
            &mut self.pmm,
            self.kernel_space.root(),
            VirtAddr::new(base.as_u32()),
            base,
            size,
            MapFlags::WRITABLE | MapFlags::GLOBAL,
        );
        match mapped {
            Ok(()) => Some(base),
            Err(_) => {
                // SAFETY: The frames were allocated above and the failed
                // mapping was rolled back.
                unsafe { self.pmm.free_frames(base, count) };
                None
            }
        }
    }

    /// Unmaps and frees `count` pages obtained from
    /// [`MemoryManager::allocate_kernel_pages`].
    ///
    /// # Safety
    /// The range must come from `allocate_kernel_pages` and no longer be in
    /// use.
    pub unsafe fn free_kernel_pages(&mut self, addr: PhysAddr, count: usize) {
        let size = (count * PAGE_SIZE) as u32;
        vmm::unmap_fixed(
            &self.mapper,
            self.kernel_space.root(),
            VirtAddr::new(addr.as_u32()),
            size,
        );
        unsafe { self.pmm.free_frames(addr, count) };
    }

    pub(crate) fn mapper(&self) -> &PageTableMapper {
        &self.mapper
    }
}

// --- global veneer ---

static MM: spin::Mutex<Option<MemoryManager>> = spin::Mutex::new(None);

/// Initializes the global memory manager.
pub fn init(total_memory: u64, phys_offset: usize) -> Result<(), MmError> {
    let mut guard = MM.lock();
    if guard.is_some() {
        return Err(MmError::Pmm(PmmError::AlreadyInitialized));
    }
    *guard = Some(MemoryManager::new(total_memory, phys_offset)?);
    Ok(())
}

/// Runs `f` against the global memory manager.
///
/// # Panics
/// Panics if [`init`] has not been called.
pub fn with<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> R {
    let mut guard = MM.lock();
    match guard.as_mut() {
        Some(mm) => f(mm),
        None => panic!("memory manager not initialized"),
    }
}

/// Runs `f` against the global memory manager if it is initialized and not
/// currently locked. Used from the fault path, where blocking on the lock
/// could deadlock.
pub fn try_with<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> Option<R> {
    let mut guard = MM.try_lock()?;
    guard.as_mut().map(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::USER_HEAP;
    use crate::test_util::manager_over_arena;

    const ARENA_FRAMES: usize = 768;

    #[test]
    fn bootstrap_reports_sane_counts() {
        let (_arena, mm) = manager_over_arena(ARENA_FRAMES);
        assert_eq!(mm.total_frames(), ARENA_FRAMES);
        // 512 boot-reserved plus the kernel directory and one identity
        // window page table.
        assert_eq!(mm.free_frames_count(), ARENA_FRAMES - 512 - 2);
        assert_eq!(mm.active_space(), mm.kernel_space());
    }

    #[test]
    fn kernel_heap_roundtrip() {
        let (_arena, mut mm) = manager_over_arena(ARENA_FRAMES);
        let before = mm.free_frames_count();

        let base = mm.allocate(8192, MapFlags::WRITABLE).unwrap();
        assert!(mm.translate(mm.kernel_space(), base).is_some());

        mm.free(base, 8192);
        assert!(mm.translate(mm.kernel_space(), base).is_none());
        // The heap page table stays resident.
        assert_eq!(mm.free_frames_count(), before - 1);
    }

    #[test]
    fn address_spaces_are_isolated() {
        let (_arena, mut mm) = manager_over_arena(ARENA_FRAMES);
        let a = mm.create_address_space().unwrap();
        let b = mm.create_address_space().unwrap();

        let mut cursor_a = RegionAllocator::new(USER_HEAP);
        let mut cursor_b = RegionAllocator::new(USER_HEAP);
        let va = mm
            .allocate_in(a, &mut cursor_a, 4096, MapFlags::WRITABLE | MapFlags::USER)
            .unwrap();
        let vb = mm
            .allocate_in(b, &mut cursor_b, 4096, MapFlags::WRITABLE | MapFlags::USER)
            .unwrap();

        assert_eq!(va, vb, "both cursors start at the user heap base");
        let pa = mm.translate(a, va).unwrap();
        let pb = mm.translate(b, vb).unwrap();
        assert_ne!(pa, pb, "same virtual page, different frames");
        assert!(mm.translate(mm.kernel_space(), va).is_none());
    }

    #[test]
    fn destroy_restores_free_frames() {
        let (_arena, mut mm) = manager_over_arena(ARENA_FRAMES);
        let before = mm.free_frames_count();

        let space = mm.create_address_space().unwrap();
        let mut cursor = RegionAllocator::new(USER_HEAP);
        let base = mm
            .allocate_in(space, &mut cursor, 4096 * 2, MapFlags::WRITABLE | MapFlags::USER)
            .unwrap();

        mm.free_in(space, base, 4096 * 2);
        mm.destroy_address_space(space);
        assert_eq!(mm.free_frames_count(), before);
    }

    #[test]
    fn destroying_active_space_switches_to_kernel() {
        let (_arena, mut mm) = manager_over_arena(ARENA_FRAMES);
        let space = mm.create_address_space().unwrap();
        mm.switch_to(space);
        assert_eq!(mm.active_space(), space);

        mm.destroy_address_space(space);
        assert_eq!(mm.active_space(), mm.kernel_space());
    }

    #[test]
    fn exhaustion_boundary() {
        let (_arena, mut mm) = manager_over_arena(ARENA_FRAMES);
        let free = mm.free_frames_count();

        let mut frames = Vec::new();
        for _ in 0..free {
            frames.push(mm.allocate_frame().unwrap());
        }
        assert!(mm.allocate_frame().is_none());

        let victim = frames.pop().unwrap();
        unsafe { mm.free_frame(victim.start_address()) };
        assert_eq!(mm.allocate_frame(), Some(victim));
    }

    #[test]
    fn kernel_pages_are_identity_mapped() {
        let (_arena, mut mm) = manager_over_arena(ARENA_FRAMES);
        let before = mm.free_frames_count();

        let base = mm.allocate_kernel_pages(4).unwrap();
        let virt = VirtAddr::new(base.as_u32());
        for i in 0..4u32 {
            assert_eq!(
                mm.translate(mm.kernel_space(), virt + i * 4096),
                Some(base + i * 4096)
            );
        }

        unsafe { mm.free_kernel_pages(base, 4) };
        assert_eq!(mm.free_frames_count(), before);
        assert!(mm.translate(mm.kernel_space(), virt).is_none());
    }
}
