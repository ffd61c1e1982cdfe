//! Privileged paging instructions (INVLPG, CR3, CR0).
//!
//! Only compiled for the i686 target; hosted test builds drive the paging
//! code through the registered hardware hooks instead.

use crate::addr::{PhysAddr, VirtAddr};

/// Flushes the TLB entry for the given virtual address (INVLPG).
#[inline]
pub fn flush(addr: VirtAddr) {
    // SAFETY: INVLPG only invalidates a single TLB entry and has no other
    // side effects.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) addr.as_u32(),
            options(nostack, preserves_flags),
        );
    }
}

/// Flushes the entire TLB by reloading CR3.
#[inline]
pub fn flush_all() {
    // SAFETY: Writing back the same CR3 value only flushes non-global TLB
    // entries. The page table root remains unchanged.
    unsafe { write_cr3(read_cr3()) };
}

/// Returns the physical address of the active page directory from CR3.
#[inline]
pub fn read_cr3() -> PhysAddr {
    let value: u32;
    // SAFETY: Reading CR3 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    PhysAddr::new(value & 0xFFFF_F000)
}

/// Loads `root` into CR3, switching the active page directory.
///
/// # Safety
///
/// `root` must be the physical address of a valid, page-aligned page
/// directory that maps the currently executing code.
#[inline]
pub unsafe fn write_cr3(root: PhysAddr) {
    // SAFETY: Precondition is the caller's responsibility.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u32(), options(nostack, preserves_flags));
    }
}

/// Sets CR0.PG, turning on paged address translation.
///
/// # Safety
///
/// CR3 must already point at a page directory that identity-maps (or
/// otherwise correctly maps) the currently executing code, or the next
/// instruction fetch will fault.
#[inline]
pub unsafe fn enable_paging() {
    // SAFETY: Precondition is the caller's responsibility.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
}
