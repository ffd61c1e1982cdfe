//! Virtual address space layout for the 32-bit kernel.
//!
//! The map is fixed (no KASLR):
//!
//! ```text
//! 0x0000_0000 .. identity limit   kernel identity window (low RAM)
//! 0x0804_8000 ..                  user code and data
//! 0x1000_0000 ..                  user heap (bump, grows up)
//! 0x8000_0000 .. 0xC000_0000      kernel heap (bump, grows up)
//! 0xBFFF_0000 .. 0xC000_0000      user stack (grows down)
//! 0xC000_0000 ..                  kernel base (nothing user-accessible above)
//! ```

use muon_core::addr::VirtAddr;

/// Kernel/user split: addresses at or above this are kernel-only.
pub const KERNEL_BASE: VirtAddr = VirtAddr::new(0xC000_0000);

/// Base of the kernel heap region.
pub const KERNEL_HEAP_BASE: VirtAddr = VirtAddr::new(0x8000_0000);

/// Maximum kernel heap size: 1 GiB (heap base up to [`KERNEL_BASE`]).
pub const KERNEL_HEAP_MAX_SIZE: u32 = 0x4000_0000;

/// Upper bound of the boot identity window: low physical memory is mapped
/// one-to-one up to `min(IDENTITY_MAP_LIMIT, total RAM)`.
pub const IDENTITY_MAP_LIMIT: u64 = 64 * 1024 * 1024;

/// Physical memory below this is never handed out by the frame allocator
/// (BIOS data, kernel image, boot structures).
pub const BOOT_RESERVED: u64 = 2 * 1024 * 1024;

/// Base address where user program images are loaded.
pub const USER_CODE_BASE: VirtAddr = VirtAddr::new(0x0804_8000);

/// Base of the user heap region.
pub const USER_HEAP_BASE: VirtAddr = VirtAddr::new(0x1000_0000);

/// Base of the user stack region. The stack occupies
/// `[USER_STACK_BASE, USER_STACK_BASE + USER_STACK_SIZE)` and grows down
/// from the top of that range.
pub const USER_STACK_BASE: VirtAddr = VirtAddr::new(0xBFFF_0000);

/// Size of a user stack: 64 KiB.
pub const USER_STACK_SIZE: u32 = 64 * 1024;

/// Returns `true` if `addr` lies in the kernel half of the address space.
#[inline]
pub const fn is_kernel_address(addr: VirtAddr) -> bool {
    addr.as_u32() >= KERNEL_BASE.as_u32()
}

/// A virtual address region with a base and maximum size.
#[derive(Debug, Clone, Copy)]
pub struct VirtRegion {
    base: VirtAddr,
    max_size: u32,
}

impl VirtRegion {
    /// Creates a new virtual region.
    pub const fn new(base: VirtAddr, max_size: u32) -> Self {
        Self { base, max_size }
    }

    /// Returns the base address of this region.
    #[inline]
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    /// Returns the maximum size of this region.
    #[inline]
    pub const fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Returns the end address (base + max_size) as a 64-bit value, since a
    /// region may extend to the very top of the 32-bit space.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.base.as_u32() as u64 + self.max_size as u64
    }

    /// Returns true if `addr` falls within this region.
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        (addr.as_u32() as u64) >= (self.base.as_u32() as u64)
            && (addr.as_u32() as u64) < self.end()
    }
}

/// The kernel heap region served by the kernel's bump cursor.
pub const KERNEL_HEAP: VirtRegion = VirtRegion::new(KERNEL_HEAP_BASE, KERNEL_HEAP_MAX_SIZE);

/// The user heap region (cursor owned by the process subsystem).
pub const USER_HEAP: VirtRegion =
    VirtRegion::new(USER_HEAP_BASE, KERNEL_HEAP_BASE.as_u32() - USER_HEAP_BASE.as_u32());

/// Identifies which part of the address map a faulting address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRegion {
    /// Low identity-mapped physical memory.
    IdentityWindow,
    /// User program image.
    UserCode,
    /// User heap.
    UserHeap,
    /// User stack.
    UserStack,
    /// Kernel heap.
    KernelHeap,
    /// Kernel half above the split.
    KernelSpace,
    /// Not covered by any defined region.
    Unmapped,
}

impl FaultRegion {
    /// Classifies a virtual address against the fixed layout.
    pub fn identify(addr: VirtAddr) -> Self {
        let a = addr.as_u32();
        if a >= KERNEL_BASE.as_u32() {
            FaultRegion::KernelSpace
        } else if a >= USER_STACK_BASE.as_u32() {
            FaultRegion::UserStack
        } else if KERNEL_HEAP.contains(addr) {
            FaultRegion::KernelHeap
        } else if USER_HEAP.contains(addr) {
            FaultRegion::UserHeap
        } else if a >= USER_CODE_BASE.as_u32() {
            FaultRegion::UserCode
        } else if (a as u64) < IDENTITY_MAP_LIMIT {
            FaultRegion::IdentityWindow
        } else {
            FaultRegion::Unmapped
        }
    }

    /// Human-readable region name for fault reports.
    pub fn as_str(self) -> &'static str {
        match self {
            FaultRegion::IdentityWindow => "identity window",
            FaultRegion::UserCode => "user code",
            FaultRegion::UserHeap => "user heap",
            FaultRegion::UserStack => "user stack",
            FaultRegion::KernelHeap => "kernel heap",
            FaultRegion::KernelSpace => "kernel space",
            FaultRegion::Unmapped => "unmapped hole",
        }
    }
}
