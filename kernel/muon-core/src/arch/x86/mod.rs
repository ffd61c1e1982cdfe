//! i686 architecture support.

#[cfg(target_arch = "x86")]
pub mod instructions;
pub mod structures;

// Re-export commonly used types for ergonomic imports.
pub use structures::{PageFaultErrorCode, PageTable, PageTableEntry, PageTableFlags};
