#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

pub mod address;
pub mod frame;
#[cfg(target_os = "none")]
pub mod heap;
