//! Virtual memory allocation.
//!
//! Page-granular allocation over a bump cursor: reserve a virtual range,
//! then back it page by page with freshly allocated frames. Fresh pages are
//! always zeroed through the physical window, so callers never observe
//! stale frame contents regardless of which space the mapping lives in.
//!
//! A failure partway through an allocation unwinds completely: pages mapped
//! so far are unmapped, their frames returned, and the cursor retracted.
//! Page tables created along the way stay in the directory; the next
//! allocation in the same 4 MiB window reuses them.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::paging::{Page, PhysFrame};

use crate::mapper::{MapFlags, PageMapper, PageTranslator, PhysAccess};
use crate::pmm::BitmapAllocator;
use crate::region::{RegionAllocator, page_align_up};
use crate::walker::PageTableMapper;
use crate::{FrameDeallocator, PAGE_SIZE, VmmError, zero_frame};

/// Allocates `size` bytes of zeroed, page-backed virtual memory from
/// `cursor`, mapping into the directory at `root`.
///
/// Returns the base of the reserved range. On any failure the call has no
/// effect: everything mapped so far is unmapped and freed, and the cursor
/// is retracted.
pub fn allocate(
    mapper: &PageTableMapper,
    pmm: &mut BitmapAllocator,
    cursor: &mut RegionAllocator,
    root: PhysAddr,
    size: u32,
    flags: MapFlags,
) -> Result<VirtAddr, VmmError> {
    if size == 0 {
        return Err(VmmError::InvalidSize);
    }
    let base = cursor.allocate(size).ok_or(VmmError::RegionExhausted)?;
    let pages = (page_align_up(size) / PAGE_SIZE as u64) as u32;

    for i in 0..pages {
        let virt = base + i * PAGE_SIZE as u32;
        let Some(frame) = pmm.allocate_frame() else {
            unwind(mapper, pmm, cursor, root, base, i);
            return Err(VmmError::OutOfMemory);
        };

        // SAFETY: root is a valid directory and virt was just reserved.
        let mapped = unsafe {
            mapper.map(
                root,
                Page::containing_address(virt),
                frame,
                flags,
                &mut || pmm.allocate_frame(),
            )
        };
        match mapped {
            Ok(flush) => flush.ignore(),
            Err(_) => {
                // SAFETY: frame was allocated above and never mapped.
                unsafe { pmm.deallocate_frame(frame) };
                unwind(mapper, pmm, cursor, root, base, i);
                return Err(VmmError::OutOfMemory);
            }
        }

        // SAFETY: The frame is reachable through the window and now owned
        // by this mapping.
        unsafe { zero_frame(mapper.frame_ptr(frame.start_address())) };
    }

    Ok(base)
}

/// Unwinds a partially completed allocation: unmaps and frees the first
/// `mapped` pages and retracts the cursor to `base`.
fn unwind(
    mapper: &PageTableMapper,
    pmm: &mut BitmapAllocator,
    cursor: &mut RegionAllocator,
    root: PhysAddr,
    base: VirtAddr,
    mapped: u32,
) {
    for i in 0..mapped {
        let virt = base + i * PAGE_SIZE as u32;
        // SAFETY: These pages were mapped by the failed allocation.
        if let Ok((frame, flush)) = unsafe { mapper.unmap(root, Page::containing_address(virt)) } {
            flush.flush();
            // SAFETY: The frame is no longer mapped.
            unsafe { pmm.deallocate_frame(frame) };
        }
    }
    cursor.retract(base);
}

/// Frees `size` bytes of virtual memory at `base`: every mapped page in the
/// range is unmapped and its frame returned to the allocator.
///
/// Unmapped pages in the range and a zero `size` are silently skipped, so
/// the call is safe to repeat.
pub fn free(
    mapper: &PageTableMapper,
    pmm: &mut BitmapAllocator,
    root: PhysAddr,
    base: VirtAddr,
    size: u32,
) {
    let base = base.align_down(PAGE_SIZE as u32);
    let pages = (page_align_up(size) / PAGE_SIZE as u64) as u32;
    for i in 0..pages {
        let virt = base + i * PAGE_SIZE as u32;
        // SAFETY: root is a valid directory; frames owned by the mapping
        // are returned only after the unmap succeeds.
        if let Ok((frame, flush)) = unsafe { mapper.unmap(root, Page::containing_address(virt)) } {
            flush.flush();
            // SAFETY: The frame is no longer mapped.
            unsafe { pmm.deallocate_frame(frame) };
        }
    }
}

/// Maps `size` bytes at a fixed virtual address onto caller-owned physical
/// memory. The contents are left untouched (the range may be device
/// memory).
///
/// On failure, pages mapped by this call are unmapped again; the physical
/// range still belongs to the caller.
pub fn map_fixed(
    mapper: &PageTableMapper,
    pmm: &mut BitmapAllocator,
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    size: u32,
    flags: MapFlags,
) -> Result<(), VmmError> {
    if size == 0 {
        return Err(VmmError::InvalidSize);
    }
    let pages = (page_align_up(size) / PAGE_SIZE as u64) as u32;
    for i in 0..pages {
        let page_virt = virt + i * PAGE_SIZE as u32;
        let page_phys = phys + i * PAGE_SIZE as u32;
        // SAFETY: root is a valid directory; the caller vouches for the
        // physical range.
        let mapped = unsafe {
            mapper.map(
                root,
                Page::containing_address(page_virt),
                PhysFrame::containing_address(page_phys),
                flags,
                &mut || pmm.allocate_frame(),
            )
        };
        match mapped {
            Ok(flush) => flush.flush(),
            Err(_) => {
                unmap_fixed(mapper, root, virt, i * PAGE_SIZE as u32);
                return Err(VmmError::OutOfMemory);
            }
        }
    }
    Ok(())
}

/// Unmaps `size` bytes at `virt` without freeing the backing frames.
///
/// The counterpart to [`map_fixed`]; unmapped pages in the range are
/// skipped.
pub fn unmap_fixed(mapper: &PageTableMapper, root: PhysAddr, virt: VirtAddr, size: u32) {
    let virt = virt.align_down(PAGE_SIZE as u32);
    let pages = (page_align_up(size) / PAGE_SIZE as u64) as u32;
    for i in 0..pages {
        let page_virt = virt + i * PAGE_SIZE as u32;
        // SAFETY: root is a valid directory.
        if let Ok((_, flush)) = unsafe { mapper.unmap(root, Page::containing_address(page_virt)) } {
            flush.flush();
        }
    }
}

/// Translates `virt` through the directory at `root`.
pub fn translate(mapper: &PageTableMapper, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    // SAFETY: root is a valid directory.
    unsafe { mapper.translate_addr(root, virt) }
}
