//! Virtual address region allocation.
//!
//! Provides [`RegionAllocator`], the bump cursor behind both the kernel heap
//! and per-process heaps. Virtual ranges are never recycled; freeing pages
//! returns their frames but leaves the cursor where it is.

use muon_core::addr::VirtAddr;

use crate::layout::VirtRegion;

/// Page-align `size` upward (round to next 4 KiB boundary).
///
/// Returns the result as `u64` so that sizes near `u32::MAX` cannot wrap.
#[inline]
pub(crate) fn page_align_up(size: u32) -> u64 {
    (size as u64 + crate::PAGE_MASK as u64) & !(crate::PAGE_MASK as u64)
}

/// A simple bump allocator for virtual address ranges.
///
/// Allocates contiguous ranges by advancing a cursor. Does not support
/// deallocation, except for rolling back the most recent allocation via
/// [`retract`](Self::retract).
#[derive(Debug)]
pub struct RegionAllocator {
    region: VirtRegion,
    /// Watermark, kept as `u64`: a region ending at the top of the 32-bit
    /// space pushes the cursor to `1 << 32`, which must read as exhausted
    /// rather than wrap back to zero.
    next: u64,
}

impl RegionAllocator {
    /// Creates a new allocator covering the given virtual region.
    pub fn new(region: VirtRegion) -> Self {
        Self {
            next: region.base().as_u32() as u64,
            region,
        }
    }

    /// Allocates `size` bytes (rounded up to page alignment) from the region.
    /// Returns the base address of the allocated range, or `None` if the
    /// region is exhausted or `size` is zero.
    pub fn allocate(&mut self, size: u32) -> Option<VirtAddr> {
        if size == 0 {
            return None;
        }
        let aligned_size = page_align_up(size);
        let end = self.next + aligned_size;

        if end > self.region.end() {
            return None;
        }

        // end <= 1 << 32 and aligned_size > 0, so the base still fits.
        let base = self.next as u32;
        self.next = end;
        Some(VirtAddr::new(base))
    }

    /// Rolls the cursor back to `base`, undoing the most recent allocation.
    ///
    /// Only valid when `base` was returned by the last call to
    /// [`allocate`](Self::allocate) and nothing was allocated since.
    pub fn retract(&mut self, base: VirtAddr) {
        debug_assert!(
            base.as_u32() >= self.region.base().as_u32() && (base.as_u32() as u64) <= self.next,
            "retract outside allocated range"
        );
        self.next = base.as_u32() as u64;
    }

    /// Returns the number of bytes already allocated.
    pub fn used(&self) -> u32 {
        (self.next - self.region.base().as_u32() as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(base: u32, max_size: u32) -> RegionAllocator {
        RegionAllocator::new(VirtRegion::new(VirtAddr::new(base), max_size))
    }

    #[test]
    fn allocations_are_page_aligned_and_contiguous() {
        let mut r = allocator(0x8000_0000, 0x10_0000);
        let a = r.allocate(1).unwrap();
        let b = r.allocate(4096).unwrap();
        let c = r.allocate(4097).unwrap();
        assert_eq!(a.as_u32(), 0x8000_0000);
        assert_eq!(b.as_u32(), 0x8000_1000);
        assert_eq!(c.as_u32(), 0x8000_2000);
        assert_eq!(r.used(), 0x4000);
    }

    #[test]
    fn zero_size_fails() {
        let mut r = allocator(0x8000_0000, 0x10_0000);
        assert!(r.allocate(0).is_none());
        assert_eq!(r.used(), 0);
    }

    #[test]
    fn exhaustion_at_region_end() {
        let mut r = allocator(0x8000_0000, 0x3000);
        assert!(r.allocate(0x2000).is_some());
        assert!(r.allocate(0x2000).is_none());
        assert!(r.allocate(0x1000).is_some());
        assert!(r.allocate(1).is_none());
    }

    #[test]
    fn retract_undoes_last_allocation() {
        let mut r = allocator(0x8000_0000, 0x10_0000);
        let a = r.allocate(0x3000).unwrap();
        r.retract(a);
        let b = r.allocate(0x1000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn region_ending_at_address_space_top() {
        let mut r = allocator(0xFFFF_E000, 0x2000);
        let a = r.allocate(0x2000).unwrap();
        assert_eq!(a.as_u32(), 0xFFFF_E000);
        // The cursor sits at 1 << 32; it must not wrap to zero and start
        // issuing addresses outside the region.
        assert!(r.allocate(1).is_none());
        assert!(r.allocate(0x1000).is_none());
        assert_eq!(r.used(), 0x2000);
    }

    #[test]
    fn oversized_request_does_not_wrap() {
        let mut r = allocator(0x8000_0000, 0x1000);
        assert!(r.allocate(u32::MAX).is_none());
        assert_eq!(r.used(), 0);
    }
}
