//! Core library for the Muon kernel, providing the typed address and paging
//! primitives shared by the memory-management crates.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod paging;
