//! Address space lifecycle.
//!
//! Every address space is a page directory frame. New spaces are cloned
//! from the kernel space by copying the whole directory, so a fresh space
//! sees the identity window and the kernel half exactly as the kernel does.
//! (Copying all 1024 entries rather than only the kernel half means the
//! user half shares page tables with the kernel space until the first
//! user mapping replaces a directory entry. Mappings made through the
//! kernel root below `KERNEL_BASE` therefore leak into cloned spaces.)
//!
//! Destroying a space walks its directory and returns every page table the
//! space owns privately, then the directory frame itself. A directory entry
//! is privately owned when its bits differ from the kernel root's entry at
//! the same index.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::arch::x86::structures::PageTable;
use muon_core::paging::{Page, PhysFrame};

use crate::layout::IDENTITY_MAP_LIMIT;
use crate::mapper::{MapFlags, PageMapper, PhysAccess};
use crate::pmm::BitmapAllocator;
use crate::walker::PageTableMapper;
use crate::{FrameDeallocator, PAGE_SIZE, PmmError, zero_frame};

/// Opaque handle to an address space.
///
/// Internally this is the physical address of the space's page directory,
/// but callers only ever pass handles back to the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceHandle(PhysAddr);

impl AddressSpaceHandle {
    pub(crate) fn new(root: PhysAddr) -> Self {
        Self(root)
    }

    pub(crate) fn root(self) -> PhysAddr {
        self.0
    }
}

/// Builds the kernel address space: a fresh directory with the low
/// `min(IDENTITY_MAP_LIMIT, total_memory)` bytes identity mapped.
///
/// Identity pages are `WRITABLE | GLOBAL` and kernel-only. The directory is
/// not loaded; the caller activates it once bootstrap completes.
pub fn init_kernel_space(
    mapper: &PageTableMapper,
    pmm: &mut BitmapAllocator,
    total_memory: u64,
) -> Result<AddressSpaceHandle, PmmError> {
    let dir_frame = pmm.allocate_frame().ok_or(PmmError::OutOfMemory)?;
    let root = dir_frame.start_address();
    // SAFETY: The frame was just allocated and the window covers it.
    unsafe { zero_frame(mapper.frame_ptr(root)) };

    let identity_end = IDENTITY_MAP_LIMIT.min(total_memory) as u32;
    let flags = MapFlags::WRITABLE | MapFlags::GLOBAL;
    let mut addr = 0u32;
    while addr < identity_end {
        let page = Page::containing_address(VirtAddr::new(addr));
        let frame = PhysFrame::containing_address(PhysAddr::new(addr));
        // SAFETY: root is a valid directory built above; the space is not
        // active, so no TLB flush is needed.
        let flush = unsafe {
            mapper
                .map(root, page, frame, flags, &mut || pmm.allocate_frame())
                .map_err(|_| PmmError::OutOfMemory)?
        };
        flush.ignore();
        addr += PAGE_SIZE as u32;
    }

    Ok(AddressSpaceHandle::new(root))
}

/// Creates a new address space cloned from the kernel root.
pub fn create_address_space(
    mapper: &PageTableMapper,
    pmm: &mut BitmapAllocator,
    kernel_root: PhysAddr,
) -> Result<AddressSpaceHandle, PmmError> {
    let dir_frame = pmm.allocate_frame().ok_or(PmmError::OutOfMemory)?;
    let root = dir_frame.start_address();

    // SAFETY: Both frames are page tables accessible through the window and
    // they are distinct frames.
    unsafe {
        let src = mapper.frame_ptr(kernel_root);
        let dst = mapper.frame_ptr(root);
        core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
    }

    Ok(AddressSpaceHandle::new(root))
}

/// Destroys an address space, returning its privately owned page tables and
/// its directory frame to the allocator.
///
/// Leaf frames are not touched; the caller frees those through the virtual
/// allocator before destroying the space. Destroying the kernel space is
/// refused.
pub fn destroy_address_space(
    mapper: &PageTableMapper,
    pmm: &mut BitmapAllocator,
    space: AddressSpaceHandle,
    kernel_root: PhysAddr,
) {
    let root = space.root();
    if root == kernel_root {
        log::warn!("refusing to destroy the kernel address space");
        return;
    }

    // SAFETY: Both roots are valid page directories accessible through the
    // window.
    let dir = unsafe { &*(mapper.frame_ptr(root) as *const PageTable) };
    let kernel_dir = unsafe { &*(mapper.frame_ptr(kernel_root) as *const PageTable) };

    for i in 0..dir.entries.len() {
        let entry = dir.entries[i];
        if !entry.is_present() {
            continue;
        }
        // Sharing is decided by the table address alone. Flag bits diverge
        // on shared entries after the clone (USER propagation into the
        // kernel root, CPU-set ACCESSED on one copy of the entry), so a
        // raw-bit comparison would free tables the kernel root still
        // references.
        let kernel_entry = kernel_dir.entries[i];
        if kernel_entry.is_present() && kernel_entry.address() == entry.address() {
            continue;
        }
        let table_frame = PhysFrame::containing_address(entry.address());
        // SAFETY: The table frame is privately owned by this space and no
        // longer reachable once the directory is freed below.
        unsafe { pmm.deallocate_frame(table_frame) };
    }

    // SAFETY: The directory itself is no longer referenced.
    unsafe { pmm.deallocate_frame(PhysFrame::containing_address(root)) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::PageTranslator;
    use crate::test_util::TestArena;

    const ARENA_FRAMES: usize = 768; // 3 MiB: 512 reserved + 256 usable

    fn setup() -> (TestArena, PageTableMapper, BitmapAllocator) {
        let arena = TestArena::new(ARENA_FRAMES);
        let mapper = PageTableMapper::new(arena.phys_offset());
        // SAFETY: The arena backs the whole tracked range.
        let pmm = unsafe { BitmapAllocator::new(arena.size(), arena.phys_offset()) }.unwrap();
        (arena, mapper, pmm)
    }

    #[test]
    fn kernel_space_identity_maps_low_memory() {
        let (_arena, mapper, mut pmm) = setup();
        let kernel = init_kernel_space(&mapper, &mut pmm, ARENA_FRAMES as u64 * 4096).unwrap();

        // The window is clamped to total memory, so the last arena frame is
        // mapped and the first address past it is not.
        let virt = VirtAddr::new((ARENA_FRAMES as u32 - 1) * 4096);
        let phys = unsafe { mapper.translate_addr(kernel.root(), virt) }.unwrap();
        assert_eq!(phys.as_u32(), virt.as_u32());
        assert!(
            unsafe { mapper.translate_addr(kernel.root(), VirtAddr::new(ARENA_FRAMES as u32 * 4096)) }
                .is_none()
        );
    }

    #[test]
    fn created_space_sees_kernel_mappings() {
        let (_arena, mapper, mut pmm) = setup();
        let total = ARENA_FRAMES as u64 * 4096;
        let kernel = init_kernel_space(&mapper, &mut pmm, total).unwrap();
        let space = create_address_space(&mapper, &mut pmm, kernel.root()).unwrap();

        assert_ne!(space, kernel);
        let virt = VirtAddr::new(0x20_0000);
        let phys = unsafe { mapper.translate_addr(space.root(), virt) }.unwrap();
        assert_eq!(phys.as_u32(), 0x20_0000);
    }

    #[test]
    fn destroy_reclaims_private_tables() {
        let (_arena, mapper, mut pmm) = setup();
        let total = ARENA_FRAMES as u64 * 4096;
        let kernel = init_kernel_space(&mapper, &mut pmm, total).unwrap();
        let before = pmm.free_frames_count();

        let space = create_address_space(&mapper, &mut pmm, kernel.root()).unwrap();
        // A private mapping outside the identity window forces a new page
        // table into the space's directory.
        let data = pmm.allocate_frame().unwrap();
        let flush = unsafe {
            mapper
                .map(
                    space.root(),
                    Page::containing_address(VirtAddr::new(0x1000_0000)),
                    data,
                    MapFlags::WRITABLE | MapFlags::USER,
                    &mut || pmm.allocate_frame(),
                )
                .unwrap()
        };
        flush.ignore();

        // Return the leaf frame first, as a caller would.
        unsafe { pmm.deallocate_frame(data) };
        destroy_address_space(&mapper, &mut pmm, space, kernel.root());
        assert_eq!(pmm.free_frames_count(), before);
    }

    #[test]
    fn destroy_keeps_tables_shared_with_kernel_root() {
        let (_arena, mapper, mut pmm) = setup();
        let total = ARENA_FRAMES as u64 * 4096;
        let kernel = init_kernel_space(&mapper, &mut pmm, total).unwrap();
        let space = create_address_space(&mapper, &mut pmm, kernel.root()).unwrap();

        // A USER mapping through the kernel root inside the identity window
        // ORs USER into the kernel root's directory entry, so its flag bits
        // no longer match the clone's copy while the table stays shared.
        let frame = pmm.allocate_frame().unwrap();
        let flush = unsafe {
            mapper
                .map(
                    kernel.root(),
                    Page::containing_address(VirtAddr::new(0x30_0000)),
                    frame,
                    MapFlags::WRITABLE | MapFlags::USER,
                    &mut || pmm.allocate_frame(),
                )
                .unwrap()
        };
        flush.ignore();

        let kernel_dir = unsafe { &*(mapper.frame_ptr(kernel.root()) as *const PageTable) };
        let shared_table = kernel_dir.entries[0].address();
        let before = pmm.free_frames_count();

        destroy_address_space(&mapper, &mut pmm, space, kernel.root());

        // Only the clone's directory frame comes back; the shared table
        // survives and kernel translations still work.
        assert_eq!(pmm.free_frames_count(), before + 1);
        assert!(!pmm.is_free(shared_table));
        assert_eq!(
            unsafe { mapper.translate_addr(kernel.root(), VirtAddr::new(0x20_0000)) },
            Some(PhysAddr::new(0x20_0000))
        );
    }

    #[test]
    fn destroy_refuses_kernel_space() {
        let (_arena, mapper, mut pmm) = setup();
        let total = ARENA_FRAMES as u64 * 4096;
        let kernel = init_kernel_space(&mapper, &mut pmm, total).unwrap();
        let before = pmm.free_frames_count();

        destroy_address_space(&mapper, &mut pmm, kernel, kernel.root());
        assert_eq!(pmm.free_frames_count(), before);
    }
}
