//! Page table walker: walks and builds i686 two-level page tables through
//! the physical window.
//!
//! A virtual address selects a page directory entry (bits 22..31), a page
//! table entry (bits 12..21), and a byte offset (bits 0..11). Page table
//! frames are read and written via `phys_offset + phys_addr`, so the walker
//! works against any directory, active or not.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::arch::x86::structures::{PageTable, PageTableEntry, PageTableFlags};
use muon_core::paging::{Page, PhysFrame};

use crate::PAGE_SIZE;
use crate::mapper::{self, MapError, MapFlags, MapFlush, UnmapError};

/// Utility for walking and building page tables via the physical window.
///
/// On the real machine `phys_offset` is 0 (low memory is identity mapped);
/// hosted tests point it at a heap-backed arena.
#[derive(Debug, Clone, Copy)]
pub struct PageTableMapper {
    phys_offset: usize,
}

impl PageTableMapper {
    /// Creates a new mapper with the given physical-window offset.
    pub fn new(phys_offset: usize) -> Self {
        Self { phys_offset }
    }

    /// Converts a physical address to its window virtual address.
    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        let p = phys.as_u32() as usize;
        match self.phys_offset.checked_add(p) {
            Some(v) => v as *mut u8,
            None => panic!(
                "phys_to_virt: physical address {:#x} overflows window (offset {:#x})",
                p, self.phys_offset,
            ),
        }
    }

    /// Returns a mutable reference to the [`PageTable`] at `phys`.
    ///
    /// # Safety
    /// `phys` must point to a valid, 4 KiB-aligned physical frame that is
    /// accessible through the window.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures the directory entry at `index` points to a valid page table,
    /// allocating one if it is not present. Returns the physical address of
    /// the page table.
    ///
    /// `intermediate_flags` are applied to the entry (`PRESENT | WRITABLE`,
    /// with `USER` added for user-accessible mappings). If the entry already
    /// exists, any missing flags from `intermediate_flags` are OR'd in.
    ///
    /// Newly allocated frames are zeroed before use so that no stale data is
    /// misinterpreted as present page table entries.
    ///
    /// # Safety
    /// The caller must ensure `dir_phys` is valid and accessible through the
    /// window.
    unsafe fn ensure_table(
        &self,
        dir_phys: PhysAddr,
        index: usize,
        intermediate_flags: PageTableFlags,
        alloc: &mut (impl FnMut() -> Option<PhysFrame> + ?Sized),
    ) -> Result<PhysAddr, MapError> {
        let dir = unsafe { self.table_at(dir_phys) };
        let entry = dir.entries[index];
        if entry.is_present() {
            // OR in any new flags (e.g. USER for mixed kernel/user tables).
            let combined = entry.flags() | intermediate_flags;
            if combined != entry.flags() {
                dir.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            Ok(entry.address())
        } else {
            let new_frame = alloc()
                .ok_or(MapError::FrameAllocationFailed)?
                .start_address();
            // SAFETY: The frame was just allocated and is accessible through
            // the window. Zeroing ensures no stale PTEs are misinterpreted as
            // present entries.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(new_frame), 0, PAGE_SIZE);
            }
            dir.entries[index] = PageTableEntry::new(new_frame, intermediate_flags);
            Ok(new_frame)
        }
    }

    /// Maps a 4 KiB page, allocating the page table if needed.
    ///
    /// An existing mapping at `virt_addr` is silently replaced; the caller
    /// is responsible for TLB invalidation.
    ///
    /// # Safety
    /// `root_phys` must point to a valid page directory.
    pub unsafe fn map_page(
        &self,
        root_phys: PhysAddr,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut (impl FnMut() -> Option<PhysFrame> + ?Sized),
    ) -> Result<(), MapError> {
        let dir_idx = virt_addr.directory_index();
        let table_idx = virt_addr.table_index();

        let intermediate = Self::intermediate_flags_for(flags);
        let table_phys = unsafe { self.ensure_table(root_phys, dir_idx, intermediate, alloc)? };

        let table = unsafe { self.table_at(table_phys) };
        table.entries[table_idx] = PageTableEntry::new(phys_addr, flags);
        Ok(())
    }

    /// Unmaps a 4 KiB page and returns the physical frame that was mapped.
    ///
    /// Does NOT flush the TLB; the caller must do that.
    ///
    /// # Safety
    /// - `root_phys` must point to a valid page directory.
    /// - The caller must flush the TLB for `virt_addr` after unmapping.
    pub unsafe fn unmap_page(
        &self,
        root_phys: PhysAddr,
        virt_addr: VirtAddr,
    ) -> Result<PhysFrame, UnmapError> {
        let dir_idx = virt_addr.directory_index();
        let table_idx = virt_addr.table_index();

        let dir = unsafe { self.table_at(root_phys) };
        let dir_entry = dir.entries[dir_idx];
        if !dir_entry.is_present() {
            return Err(UnmapError::NotMapped);
        }

        let table = unsafe { self.table_at(dir_entry.address()) };
        let entry = table.entries[table_idx];
        if !entry.is_present() {
            return Err(UnmapError::NotMapped);
        }

        let frame = PhysFrame::containing_address(entry.address());
        table.entries[table_idx] = PageTableEntry::empty();
        Ok(frame)
    }

    /// Translates a virtual address, returning the backing frame and its
    /// leaf flags, or `None` if not mapped.
    ///
    /// # Safety
    /// `root_phys` must point to a valid page directory.
    pub unsafe fn translate(
        &self,
        root_phys: PhysAddr,
        virt_addr: VirtAddr,
    ) -> Option<(PhysFrame, PageTableFlags)> {
        let dir = unsafe { self.table_at(root_phys) };
        let dir_entry = dir.entries[virt_addr.directory_index()];
        if !dir_entry.is_present() {
            return None;
        }

        let table = unsafe { self.table_at(dir_entry.address()) };
        let entry = table.entries[virt_addr.table_index()];
        if !entry.is_present() {
            return None;
        }

        Some((PhysFrame::containing_address(entry.address()), entry.flags()))
    }

    /// Returns `true` if `virt_addr` has a present leaf mapping.
    ///
    /// # Safety
    /// `root_phys` must point to a valid page directory.
    pub unsafe fn is_mapped(&self, root_phys: PhysAddr, virt_addr: VirtAddr) -> bool {
        unsafe { self.translate(root_phys, virt_addr) }.is_some()
    }

    /// Updates the flags of a mapped page.
    ///
    /// Does NOT flush the TLB; the caller must do that.
    ///
    /// # Safety
    /// - `root_phys` must point to a valid page directory.
    /// - The caller must flush the TLB for `virt_addr` after updating flags.
    pub unsafe fn update_flags_page(
        &self,
        root_phys: PhysAddr,
        virt_addr: VirtAddr,
        new_flags: PageTableFlags,
    ) -> Result<(), UnmapError> {
        let dir_idx = virt_addr.directory_index();
        let table_idx = virt_addr.table_index();

        let dir = unsafe { self.table_at(root_phys) };
        let dir_entry = dir.entries[dir_idx];
        if !dir_entry.is_present() {
            return Err(UnmapError::NotMapped);
        }

        let table = unsafe { self.table_at(dir_entry.address()) };
        let entry = table.entries[table_idx];
        if !entry.is_present() {
            return Err(UnmapError::NotMapped);
        }

        table.entries[table_idx] = PageTableEntry::new(entry.address(), new_flags);
        Ok(())
    }

    /// Computes page directory entry flags from leaf flags.
    ///
    /// Directory entries are always `PRESENT | WRITABLE` so that leaf flags
    /// alone govern write access. If the leaf flags include `USER`, the
    /// directory entry also gets `USER` so that ring 3 can traverse the walk.
    fn intermediate_flags_for(leaf_flags: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf_flags.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }

    /// Converts arch-independent [`MapFlags`] to i686 [`PageTableFlags`].
    fn map_flags_to_native(flags: MapFlags) -> PageTableFlags {
        let mut native = PageTableFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            native |= PageTableFlags::WRITABLE;
        }
        if flags.contains(MapFlags::USER) {
            native |= PageTableFlags::USER;
        }
        if flags.contains(MapFlags::GLOBAL) {
            native |= PageTableFlags::GLOBAL;
        }
        if flags.contains(MapFlags::CACHE_DISABLE) {
            native |= PageTableFlags::CACHE_DISABLE;
        }
        native
    }
}

// SAFETY: `PageTableMapper` correctly manipulates i686 two-level page tables
// via the physical window.
unsafe impl mapper::PageMapper for PageTableMapper {
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page,
        frame: PhysFrame,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> Option<PhysFrame>,
    ) -> Result<MapFlush, MapError> {
        let native = Self::map_flags_to_native(flags);
        let virt = page.start_address();
        // SAFETY: Caller guarantees root is valid.
        unsafe { self.map_page(root, virt, frame.start_address(), native, alloc)? };
        Ok(MapFlush::new(virt))
    }

    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page,
    ) -> Result<(PhysFrame, MapFlush), UnmapError> {
        let virt = page.start_address();
        // SAFETY: Caller guarantees root is valid.
        let frame = unsafe { self.unmap_page(root, virt)? };
        Ok((frame, MapFlush::new(virt)))
    }

    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page,
        flags: MapFlags,
    ) -> Result<MapFlush, UnmapError> {
        let virt = page.start_address();
        let native = Self::map_flags_to_native(flags);
        // SAFETY: Caller guarantees root is valid.
        unsafe { self.update_flags_page(root, virt, native)? };
        Ok(MapFlush::new(virt))
    }
}

// SAFETY: `PageTableMapper` correctly walks i686 two-level page tables for
// address translation via the physical window.
unsafe impl mapper::PageTranslator for PageTableMapper {
    unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Caller guarantees root is valid.
        let (frame, _) = unsafe { self.translate(root, virt) }?;
        Some(frame.start_address() + virt.page_offset())
    }
}

// SAFETY: The window covers all of physical memory at a fixed offset, so the
// returned pointer is valid for the whole frame.
unsafe impl mapper::PhysAccess for PageTableMapper {
    unsafe fn frame_ptr(&self, phys: PhysAddr) -> *mut u8 {
        self.phys_to_virt(phys.align_down(PAGE_SIZE as u32))
    }
}
