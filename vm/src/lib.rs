#![cfg_attr(not(test), no_std)]

//! Per-process virtual memory.
//!
//! This crate maintains, per address space, the set of mapped virtual
//! memory areas and the hardware page table entries behind them, and it
//! services page faults — including copy-on-write faults — concurrently on
//! multiple harts without a per-address-space lock.
//!
//! Three pieces of mutable state are bound together by the concurrency
//! protocol:
//!
//! - the [`range_map`]: a concurrent, range-keyed map of areas with
//!   lock-free readers (under [`epoch`] reclamation) and span-exclusive
//!   writers;
//! - the [`page_table`]: entries shared with the MMU and mutated only via
//!   compare-and-swap under the software lock bit ([`arch::pte`]);
//! - the backing [`vm_node`]s: reference-counted frame arrays shared
//!   between areas by copy-on-write, with frames published per slot by
//!   compare-and-swap.
//!
//! [`addr_space`] ties the three together and [`fault`] resolves faults
//! against them. `fork`, `mmap`, `munmap`, demand loading, copy-on-write
//! splits and fault-in may all run concurrently on one address space;
//! faults on disjoint regions proceed in parallel.

extern crate alloc;

pub mod addr_space;
pub mod backing;
pub mod epoch;
pub mod fault;
pub mod page_table;
pub mod range_map;
pub mod vm_area;
pub mod vm_node;

#[cfg(test)]
mod test_support;

pub use addr_space::{AddressSpace, HartShared, KShared};
pub use backing::BackingFile;
pub use fault::{FaultOutcome, pagefault};
pub use page_table::PageTable;
pub use range_map::{ConcurrentRangeMap, MapGuard, SpanHandle};
pub use vm_area::{VmArea, VmaFlags};
pub use vm_node::{Backing, NodeKind, VmNode};

/// One-time initialization of the subsystem's collaborators: hands the
/// machine's RAM window to the frame allocator. The embedding kernel calls
/// this once at boot, before the first address space is built.
pub fn init() {
    mm::frame::init_frame_allocator();
}
