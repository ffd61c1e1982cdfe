//! Typed page and frame abstractions.
//!
//! Provides [`Page`] and [`PhysFrame`] types whose contained addresses are
//! always 4 KiB aligned. Two-level i686 paging only maps 4 KiB pages, so the
//! types are not parameterised over a page size.

use core::fmt;
use core::iter::FusedIterator;
use core::ops::{Add, Sub};

use crate::addr::{PhysAddr, VirtAddr};

/// The only page size supported by the two-level tables: 4 KiB.
pub const PAGE_SIZE: u32 = 4096;

/// Bit shift corresponding to [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// A 4 KiB virtual memory page.
///
/// The contained [`VirtAddr`] is guaranteed to be aligned to [`PAGE_SIZE`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    start: VirtAddr,
}

/// Error type returned when an address is not properly aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressNotAligned;

impl Page {
    /// Returns the page that contains the given virtual address (aligns down).
    #[inline]
    pub const fn containing_address(addr: VirtAddr) -> Self {
        Self {
            start: addr.align_down(PAGE_SIZE),
        }
    }

    /// Creates a page from an already-aligned start address.
    ///
    /// Returns `Err(AddressNotAligned)` if the address is not aligned to the
    /// page size.
    #[inline]
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self { start: addr })
    }

    /// Returns the start address of this page.
    #[inline]
    pub const fn start_address(&self) -> VirtAddr {
        self.start
    }

    /// Creates an iterator over a range of pages `[start, end)`.
    #[inline]
    pub fn range(start: Page, end: Page) -> PageRange {
        PageRange { start, end }
    }
}

impl Add<u32> for Page {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self {
        Page::containing_address(self.start + rhs * PAGE_SIZE)
    }
}

impl Sub<u32> for Page {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self {
        Page::containing_address(self.start - rhs * PAGE_SIZE)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x})", self.start.as_u32())
    }
}

// ---------------------------------------------------------------------------
// PhysFrame
// ---------------------------------------------------------------------------

/// A 4 KiB physical memory frame.
///
/// The contained [`PhysAddr`] is guaranteed to be aligned to [`PAGE_SIZE`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    start: PhysAddr,
}

impl PhysFrame {
    /// Returns the frame that contains the given physical address (aligns
    /// down).
    #[inline]
    pub const fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(PAGE_SIZE),
        }
    }

    /// Creates a frame from an already-aligned start address.
    ///
    /// Returns `Err(AddressNotAligned)` if the address is not aligned to the
    /// frame size.
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self { start: addr })
    }

    /// Returns the start address of this frame.
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.start
    }

    /// Creates an iterator over a range of frames `[start, end)`.
    #[inline]
    pub fn range(start: PhysFrame, end: PhysFrame) -> PhysFrameRange {
        PhysFrameRange { start, end }
    }
}

impl Add<u32> for PhysFrame {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self {
        PhysFrame::containing_address(self.start + rhs * PAGE_SIZE)
    }
}

impl Sub<u32> for PhysFrame {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self {
        PhysFrame::containing_address(self.start - rhs * PAGE_SIZE)
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.start.as_u32())
    }
}

// ---------------------------------------------------------------------------
// Range iterators
// ---------------------------------------------------------------------------

/// An iterator over a range of [`Page`]s.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    start: Page,
    end: Page,
}

impl Iterator for PageRange {
    type Item = Page;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start.as_u32() < self.end.start.as_u32() {
            let page = self.start;
            self.start = self.start + 1;
            Some(page)
        } else {
            None
        }
    }
}

impl FusedIterator for PageRange {}

/// An iterator over a range of [`PhysFrame`]s.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysFrameRange {
    start: PhysFrame,
    end: PhysFrame,
}

impl Iterator for PhysFrameRange {
    type Item = PhysFrame;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start.as_u32() < self.end.start.as_u32() {
            let frame = self.start;
            self.start = self.start + 1;
            Some(frame)
        } else {
            None
        }
    }
}

impl FusedIterator for PhysFrameRange {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PhysAddr, VirtAddr};

    #[test]
    fn page_containing_address() {
        let page = Page::containing_address(VirtAddr::new(0x1234));
        assert_eq!(page.start_address().as_u32(), 0x1000);
    }

    #[test]
    fn page_from_start_aligned() {
        let page = Page::from_start_address(VirtAddr::new(0x2000));
        assert!(page.is_ok());
        assert_eq!(page.unwrap().start_address().as_u32(), 0x2000);
    }

    #[test]
    fn page_from_start_unaligned() {
        let page = Page::from_start_address(VirtAddr::new(0x2001));
        assert_eq!(page.unwrap_err(), AddressNotAligned);
    }

    #[test]
    fn page_add_sub() {
        let page = Page::containing_address(VirtAddr::new(0x1000));
        assert_eq!((page + 3).start_address().as_u32(), 0x4000);
        assert_eq!((page + 3 - 1).start_address().as_u32(), 0x3000);
    }

    #[test]
    fn phys_frame_containing_address() {
        let frame = PhysFrame::containing_address(PhysAddr::new(0x5678));
        assert_eq!(frame.start_address().as_u32(), 0x5000);
    }

    #[test]
    fn phys_frame_from_start_unaligned() {
        let frame = PhysFrame::from_start_address(PhysAddr::new(0x3001));
        assert_eq!(frame.unwrap_err(), AddressNotAligned);
    }

    #[test]
    fn page_range_iterator() {
        let start = Page::containing_address(VirtAddr::new(0x1000));
        let end = Page::containing_address(VirtAddr::new(0x4000));
        let pages: Vec<_> = Page::range(start, end).collect();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].start_address().as_u32(), 0x1000);
        assert_eq!(pages[1].start_address().as_u32(), 0x2000);
        assert_eq!(pages[2].start_address().as_u32(), 0x3000);
    }

    #[test]
    fn frame_range_iterator() {
        let start = PhysFrame::containing_address(PhysAddr::new(0x0));
        let end = PhysFrame::containing_address(PhysAddr::new(0x2000));
        let frames: Vec<_> = PhysFrame::range(start, end).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].start_address().as_u32(), 0x0);
        assert_eq!(frames[1].start_address().as_u32(), 0x1000);
    }

    #[test]
    fn empty_range() {
        let page = Page::containing_address(VirtAddr::new(0x1000));
        let pages: Vec<_> = Page::range(page, page).collect();
        assert!(pages.is_empty());
    }
}
