//! Typed virtual and physical address wrappers.
//!
//! Provides [`VirtAddr`] and [`PhysAddr`] newtypes that prevent mixing virtual
//! and physical addresses at the type level.

use core::fmt;
use core::ops::{Add, Sub};

/// A 32-bit virtual address.
///
/// On i686 with two-level paging, every 32-bit value is a valid virtual
/// address, so no canonicalization is required. The split is
/// directory index (bits 22..31), table index (bits 12..21), page offset
/// (bits 0..11).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

/// A 32-bit physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// Mask for the 12-bit page offset (bits 0..11).
const PAGE_OFFSET_MASK: u32 = 0xFFF;

/// Mask for a 10-bit page table index (used by both paging levels).
const PAGE_TABLE_INDEX_MASK: usize = 0x3FF;

impl VirtAddr {
    /// Creates a new `VirtAddr`.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u32` value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Converts this address to a raw pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts this address to a raw mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` if the address is aligned to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: u32) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_down(self, align: u32) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align`, wrapping to zero past the top of the
    /// address space.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_up(self, align: u32) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0.wrapping_add(align - 1) & !(align - 1))
    }

    /// Returns the page offset (bits 0..11).
    #[inline]
    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the page directory index (bits 22..31).
    #[inline]
    pub const fn directory_index(self) -> usize {
        ((self.0 >> 22) as usize) & PAGE_TABLE_INDEX_MASK
    }

    /// Returns the page table index (bits 12..21).
    #[inline]
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) as usize) & PAGE_TABLE_INDEX_MASK
    }
}

impl Add<u32> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<u32> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: VirtAddr) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// PhysAddr
// ---------------------------------------------------------------------------

impl PhysAddr {
    /// Creates a new `PhysAddr`.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u32` value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` if the address is aligned to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: u32) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_down(self, align: u32) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align`, wrapping to zero past the top of the
    /// address space.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_up(self, align: u32) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0.wrapping_add(align - 1) & !(align - 1))
    }

    /// Returns the page offset (bits 0..11).
    #[inline]
    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_OFFSET_MASK
    }
}

impl Add<u32> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<u32> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self {
        Self(self.0 - rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u32 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_zero() {
        assert_eq!(VirtAddr::zero().as_u32(), 0);
    }

    #[test]
    fn virt_addr_align_down() {
        let addr = VirtAddr::new(0x1234);
        assert_eq!(addr.align_down(4096).as_u32(), 0x1000);
    }

    #[test]
    fn virt_addr_align_up() {
        let addr = VirtAddr::new(0x1001);
        assert_eq!(addr.align_up(4096).as_u32(), 0x2000);
    }

    #[test]
    fn virt_addr_already_aligned() {
        let addr = VirtAddr::new(0x2000);
        assert!(addr.is_aligned(4096));
        assert_eq!(addr.align_up(4096).as_u32(), 0x2000);
        assert_eq!(addr.align_down(4096).as_u32(), 0x2000);
    }

    #[test]
    fn virt_addr_page_indices() {
        // 0xC040_3123: directory 0x301, table 0x3, offset 0x123.
        let addr = VirtAddr::new(0xC040_3123);
        assert_eq!(addr.directory_index(), 0x301);
        assert_eq!(addr.table_index(), 0x3);
        assert_eq!(addr.page_offset(), 0x123);
    }

    #[test]
    fn virt_addr_index_bounds() {
        let addr = VirtAddr::new(0xFFFF_FFFF);
        assert_eq!(addr.directory_index(), 1023);
        assert_eq!(addr.table_index(), 1023);
        assert_eq!(addr.page_offset(), 0xFFF);
    }

    #[test]
    fn virt_addr_add_sub() {
        let addr = VirtAddr::new(0x1000);
        assert_eq!((addr + 0x500).as_u32(), 0x1500);
        assert_eq!((addr - 0x500).as_u32(), 0x0B00);
    }

    #[test]
    fn virt_addr_sub_virt_addr() {
        let a = VirtAddr::new(0x2000);
        let b = VirtAddr::new(0x1000);
        assert_eq!(a - b, 0x1000);
    }

    #[test]
    fn phys_addr_zero() {
        assert_eq!(PhysAddr::zero().as_u32(), 0);
    }

    #[test]
    fn phys_addr_alignment() {
        let addr = PhysAddr::new(0x3456);
        assert!(!addr.is_aligned(4096));
        assert_eq!(addr.align_down(4096).as_u32(), 0x3000);
        assert_eq!(addr.align_up(4096).as_u32(), 0x4000);
    }

    #[test]
    fn phys_addr_add_sub() {
        let addr = PhysAddr::new(0x2000);
        assert_eq!((addr + 0x100).as_u32(), 0x2100);
        assert_eq!((addr - 0x100).as_u32(), 0x1F00);
    }
}
