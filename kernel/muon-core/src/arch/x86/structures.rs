//! i686 page table structures.
//!
//! Provides types for manipulating two-level page tables
//! (page directory -> page table).

use crate::addr::PhysAddr;

/// Physical address mask: bits 12..31 of a page table entry.
pub const ADDR_MASK: u32 = 0xFFFF_F000;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u32 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on write (leaf entries only).
        const DIRTY         = 1 << 6;
        /// Global page (not flushed on CR3 switch when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Page fault error code flags pushed by the CPU.
    ///
    /// Bits 0-4 describe the nature of the fault. The remaining bits are
    /// reserved and are not decoded here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// 1 = protection violation, 0 = not-present page.
        const PRESENT          = 1 << 0;
        /// 1 = write access caused the fault.
        const WRITE            = 1 << 1;
        /// 1 = fault occurred in user mode.
        const USER             = 1 << 2;
        /// 1 = a reserved bit was set in a page table entry.
        const RESERVED_WRITE   = 1 << 3;
        /// 1 = fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// A single page table entry (32 bits).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys_addr` with the given `flags`.
    pub const fn new(phys_addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys_addr.as_u32() & ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Returns the raw bits of this entry.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// A 4 KiB-aligned page table containing 1024 entries.
///
/// The same layout serves as the page directory: a directory is a table
/// whose entries point to page tables instead of data frames.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 1024 entries of this page table.
    pub entries: [PageTableEntry; 1024],
}

impl PageTable {
    /// Zero-initializes all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}
