//! Architecture-specific support.

pub mod x86;
