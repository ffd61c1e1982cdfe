//! Memory management for the Muon kernel.
//!
//! Three cooperating components, bottom-up:
//!
//! - [`pmm`]: bitmap physical frame allocator (4 KiB frames).
//! - [`walker`] / [`mapper`] / [`space`]: two-level i686 page tables,
//!   address-space lifecycle, TLB bookkeeping.
//! - [`vmm`] / [`region`]: page-granular virtual range allocation.
//!
//! [`manager`] ties the three together into an owned [`manager::MemoryManager`]
//! context so the whole subsystem can be instantiated independently (and
//! exercised by hosted tests). All physical memory is accessed through a
//! configurable physical-window offset; on the real machine the window is
//! the identity mapping (offset 0), in tests it is a heap-backed arena.

#![cfg_attr(not(test), no_std)]

pub mod fault;
pub mod layout;
pub mod manager;
pub mod mapper;
pub mod pmm;
pub mod region;
pub mod selftest;
pub mod space;
pub mod vmm;
pub mod walker;

#[cfg(test)]
mod test_util;

use core::fmt;

use muon_core::paging::PhysFrame;

/// Standard 4 KiB page size.
pub const PAGE_SIZE: usize = 4096;

/// Page offset mask (lower 12 bits).
pub const PAGE_MASK: usize = 0xFFF;

/// Zeroes a single page-sized region.
///
/// # Safety
///
/// `ptr` must point to a valid, writable, page-aligned region of at least
/// [`PAGE_SIZE`] bytes.
#[inline]
pub unsafe fn zero_frame(ptr: *mut u8) {
    unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
}

/// A physical frame allocator.
///
/// # Safety
///
/// Implementations must return unique, properly-aligned physical frames that
/// are not in use elsewhere.
pub unsafe trait FrameAllocator {
    /// Allocates a single physical frame, returning `None` if out of memory.
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
}

/// A physical frame deallocator.
///
/// # Safety
///
/// Implementations must only deallocate frames that were previously allocated
/// by the corresponding allocator and are no longer in use.
pub unsafe trait FrameDeallocator {
    /// Returns a physical frame to the allocator.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame);
}

/// PMM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No free frames available.
    OutOfMemory,
    /// The frame address is invalid or out of range.
    InvalidFrame,
    /// The PMM has already been initialized.
    AlreadyInitialized,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmmError::OutOfMemory => write!(f, "out of physical memory"),
            PmmError::InvalidFrame => write!(f, "invalid frame address"),
            PmmError::AlreadyInitialized => write!(f, "PMM already initialized"),
        }
    }
}

/// VMM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// The virtual address region is exhausted.
    RegionExhausted,
    /// Out of physical memory (PMM returned None).
    OutOfMemory,
    /// The page is not mapped.
    NotMapped,
    /// A zero-sized request was made.
    InvalidSize,
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmError::RegionExhausted => write!(f, "virtual region exhausted"),
            VmmError::OutOfMemory => write!(f, "out of physical memory"),
            VmmError::NotMapped => write!(f, "page not mapped"),
            VmmError::InvalidSize => write!(f, "zero-sized request"),
        }
    }
}

/// Errors from whole-subsystem initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Physical frame allocator error.
    Pmm(PmmError),
    /// Virtual memory error.
    Vmm(VmmError),
}

impl From<PmmError> for MmError {
    fn from(e: PmmError) -> Self {
        MmError::Pmm(e)
    }
}

impl From<VmmError> for MmError {
    fn from(e: VmmError) -> Self {
        MmError::Vmm(e)
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmError::Pmm(e) => write!(f, "{e}"),
            MmError::Vmm(e) => write!(f, "{e}"),
        }
    }
}
