//! Architecture-independent page mapping interface.
//!
//! Provides [`MapFlags`], [`MapFlush`], and the [`PageMapper`] /
//! [`PageTranslator`] / [`PhysAccess`] traits so that higher-level code
//! (the VMM, address-space lifecycle, the manager) can manipulate page
//! tables without knowing the underlying architecture.
//!
//! # Hardware hook decoupling
//!
//! The two privileged operations the mapping layer needs, single-page TLB
//! invalidation and page-directory (CR3) loads, are registered at boot via
//! [`register_tlb_flush`] and [`register_root_load`]. Before registration
//! both are no-ops, which is safe for early boot (no stale TLB entries
//! exist yet) and lets hosted tests drive the full mapping stack.

use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::paging::{Page, PhysFrame};

bitflags::bitflags! {
    /// Architecture-independent page mapping flags.
    ///
    /// Readable and present are implied for every mapping; i686 two-level
    /// paging has no execute-disable, so there is no executable bit either.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is accessible from user mode.
        const USER          = 1 << 1;
        /// Global page (not flushed on address-space switch).
        const GLOBAL        = 1 << 2;
        /// Caching disabled for this page.
        const CACHE_DISABLE = 1 << 3;
    }
}

/// Error from map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A page table frame could not be allocated.
    FrameAllocationFailed,
}

/// Error from unmap / update_flags operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page is not mapped.
    NotMapped,
}

// ---------------------------------------------------------------------------
// Registered hardware callbacks
// ---------------------------------------------------------------------------

/// Registered TLB flush function. Set to no-op by default.
static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

/// Registered page-directory load function. Set to no-op by default.
static ROOT_LOAD_FN: AtomicPtr<()> = AtomicPtr::new(nop_load as fn(PhysAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}
fn nop_load(_root: PhysAddr) {}

/// Registers the architecture-specific TLB flush function.
///
/// Must be called during early boot before any page table modifications that
/// require TLB invalidation. On i686, this is typically set to `invlpg`.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the architecture-specific page-directory load function.
///
/// On i686 this writes CR3, which also flushes all non-global TLB entries.
pub fn register_root_load(f: fn(PhysAddr)) {
    ROOT_LOAD_FN.store(f as *mut (), Ordering::Release);
}

/// Dispatches a single-page TLB flush through the registered callback.
#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: The pointer was stored via `register_tlb_flush` which takes a
    // valid `fn(VirtAddr)`, or it's the initial `nop_flush`.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// Wires both hooks to the i686 instructions.
///
/// Called once during arch bring-up, after the boot directory the kernel is
/// running on has been installed.
#[cfg(target_arch = "x86")]
pub fn register_arch_callbacks() {
    register_tlb_flush(muon_core::arch::x86::instructions::flush);
    register_root_load(load_cr3);
}

#[cfg(target_arch = "x86")]
fn load_cr3(root: PhysAddr) {
    // SAFETY: Roots passed to the hook come from the address-space layer,
    // which only hands out directories that map the kernel.
    unsafe { muon_core::arch::x86::instructions::write_cr3(root) };
}

/// Dispatches a page-directory load through the registered callback.
#[inline]
pub(crate) fn arch_load_root(root: PhysAddr) {
    let ptr = ROOT_LOAD_FN.load(Ordering::Acquire);
    // SAFETY: The pointer was stored via `register_root_load` which takes a
    // valid `fn(PhysAddr)`, or it's the initial `nop_load`.
    let f: fn(PhysAddr) = unsafe { core::mem::transmute(ptr) };
    f(root);
}

// ---------------------------------------------------------------------------
// MapFlush
// ---------------------------------------------------------------------------

/// A pending TLB flush for a single page.
///
/// Created by page table modification operations. Flushes the TLB entry
/// on drop unless [`.flush()`](Self::flush) or [`.ignore()`](Self::ignore)
/// is called first.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    needs_flush: bool,
}

impl MapFlush {
    /// Creates a new pending flush for the given virtual address.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            needs_flush: true,
        }
    }

    /// Flush the TLB entry immediately.
    pub fn flush(mut self) {
        self.needs_flush = false;
        arch_flush_page(self.virt);
    }

    /// Explicitly opt out of flushing (e.g. fresh mappings not yet in TLB,
    /// or mappings in a directory that is not the active one).
    pub fn ignore(mut self) {
        self.needs_flush = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.needs_flush {
            arch_flush_page(self.virt);
        }
    }
}

// ---------------------------------------------------------------------------
// PageMapper, PageTranslator, PhysAccess traits
// ---------------------------------------------------------------------------

/// Architecture-independent page table mapping interface for 4 KiB pages.
///
/// # Safety
///
/// Implementations must correctly manipulate hardware page tables.
pub unsafe trait PageMapper {
    /// Maps a virtual page to a physical frame with the given flags,
    /// silently replacing any previous mapping of the page.
    ///
    /// Allocates intermediate page table frames as needed via `alloc`; if
    /// `alloc` returns `None` mid-walk, [`MapError::FrameAllocationFailed`]
    /// is returned and the leaf entry is left unwritten.
    ///
    /// Returns a [`MapFlush`] that the caller must either `.flush()` or
    /// `.ignore()`. Dropping the `MapFlush` without calling either will
    /// flush automatically.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid page directory.
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page,
        frame: PhysFrame,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> Option<PhysFrame>,
    ) -> Result<MapFlush, MapError>;

    /// Unmaps a page and returns the physical frame that was mapped,
    /// along with a [`MapFlush`] for TLB invalidation.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid page directory.
    unsafe fn unmap(&self, root: PhysAddr, page: Page)
    -> Result<(PhysFrame, MapFlush), UnmapError>;

    /// Updates the flags of a mapped page, keeping its frame.
    ///
    /// Returns a [`MapFlush`] for TLB invalidation.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid page directory.
    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page,
        flags: MapFlags,
    ) -> Result<MapFlush, UnmapError>;
}

/// Architecture-independent virtual address translation.
///
/// # Safety
///
/// Implementations must correctly walk hardware page tables.
pub unsafe trait PageTranslator {
    /// Translates a virtual address to physical, preserving the page offset.
    ///
    /// Returns `None` if the address is not mapped.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid page directory.
    unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr>;
}

/// Access to physical frames through the physical window.
///
/// Used for zero-filling freshly allocated pages and copying directory
/// contents without requiring the target address space to be active.
///
/// # Safety
///
/// Implementations must return pointers that are valid for `PAGE_SIZE`
/// bytes for every RAM-backed frame.
pub unsafe trait PhysAccess {
    /// Returns a pointer to the start of the frame containing `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must lie within installed physical memory.
    unsafe fn frame_ptr(&self, phys: PhysAddr) -> *mut u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapflags_default_empty() {
        let flags = MapFlags::empty();
        assert!(flags.is_empty());
        assert_eq!(flags.bits(), 0);
    }

    #[test]
    fn mapflags_combination() {
        let flags = MapFlags::WRITABLE | MapFlags::USER;
        assert!(flags.contains(MapFlags::WRITABLE));
        assert!(flags.contains(MapFlags::USER));
        assert!(!flags.contains(MapFlags::GLOBAL));
    }

    #[test]
    fn mapflags_all_bits_distinct() {
        let all = [
            MapFlags::WRITABLE,
            MapFlags::USER,
            MapFlags::GLOBAL,
            MapFlags::CACHE_DISABLE,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert!((*a & *b).is_empty(), "{a:?} and {b:?} share bits");
                }
            }
        }
    }

    #[test]
    fn map_flush_ignore_does_not_flush() {
        // With the no-op default registered, this just exercises the token
        // paths for drop correctness.
        MapFlush::new(VirtAddr::new(0x1000)).ignore();
        MapFlush::new(VirtAddr::new(0x2000)).flush();
        drop(MapFlush::new(VirtAddr::new(0x3000)));
    }
}
