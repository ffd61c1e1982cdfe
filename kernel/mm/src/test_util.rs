//! Hosted test support.
//!
//! Tests run on the host, so "physical memory" is a page-aligned heap arena
//! and the physical window offset is simply the arena's base address. All
//! physical addresses used in tests are offsets into the arena.

use std::alloc::{self, Layout};

use crate::PAGE_SIZE;
use crate::manager::MemoryManager;

/// A page-aligned, zeroed heap arena standing in for physical memory.
pub struct TestArena {
    ptr: *mut u8,
    layout: Layout,
    frames: usize,
}

impl TestArena {
    /// Allocates an arena of `frames` zeroed 4 KiB frames.
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE)
            .expect("arena layout");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "arena allocation failed");
        Self { ptr, layout, frames }
    }

    /// The physical-window offset for this arena.
    pub fn phys_offset(&self) -> usize {
        self.ptr as usize
    }

    /// Total arena size in bytes.
    pub fn size(&self) -> u64 {
        (self.frames * PAGE_SIZE) as u64
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        // SAFETY: ptr/layout come from alloc_zeroed above.
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

/// Builds a [`MemoryManager`] over a fresh arena of `frames` frames.
///
/// The arena must be at least 768 frames (3 MiB) so that the 2 MiB boot
/// reservation leaves room for the kernel directory and identity window.
pub fn manager_over_arena(frames: usize) -> (TestArena, MemoryManager) {
    let arena = TestArena::new(frames);
    let mm = MemoryManager::new(arena.size(), arena.phys_offset())
        .expect("manager bootstrap");
    (arena, mm)
}
