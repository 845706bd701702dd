//! Memory layout of the machine the subsystem runs on.
//!
//! The kernel direct-maps all physical memory at [`DIRECT_MAP_OFFSET`], so
//! converting between a physical address and its kernel-visible counterpart
//! is an offset computation. On the simulated machine used by hosted builds
//! and the test suite the offset is zero and "physical" addresses are host
//! addresses inside a reserved RAM window; on bare metal the window comes
//! from the linker script.

/// Page size
pub const PAGE_SIZE: usize = 4096;
/// Width of page offset
pub const PAGE_OFFSET_WIDTH: usize = 12;
/// Number of entries in one page table
pub const PTE_PER_TABLE: usize = PAGE_SIZE / 8;
/// Number of page-table levels
pub const PT_LEVELS: usize = 4;
/// Width of a virtual address (4-level paging, sign-extended above bit 47)
pub const VA_WIDTH: usize = 48;
/// Width of a physical address
pub const PA_WIDTH: usize = 52;

/// First virtual address that user mappings may not reach.
///
/// User VMAs live entirely in `[0, USER_CEILING)`.
pub const USER_CEILING: usize = 0x7fff_ffff_f000;

/// Ceiling on the number of pages a single backing node may carry.
pub const NODE_MAX_PAGES: usize = 128;

/// Virtual address at which the per-address-space kernel-shared page is
/// installed. Lies in the kernel half, above any user mapping.
pub const KSHARED_BASE: usize = 0xffff_ff80_0000_0000;

/// Maximum number of harts the kernel-shared region carries slots for.
pub const MAX_HARTS: usize = 8;

/// Offset between a physical address and its kernel direct-map address.
pub const DIRECT_MAP_OFFSET: usize = 0;

/// Size of the allocatable RAM window.
pub const RAM_SIZE: usize = 64 * 1024 * 1024;

/// Size of kernel heap (bare metal only)
pub const KERNEL_HEAP_SIZE: usize = 16 * 1024 * 1024;

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        unsafe extern "C" {
            fn _ekernel();
            fn _eram();
        }

        /// Start of allocatable physical memory.
        pub fn ram_start_phys() -> usize {
            _ekernel as usize
        }

        /// End of allocatable physical memory.
        pub fn ram_end_phys() -> usize {
            _eram as usize
        }
    } else {
        use alloc::alloc::{alloc_zeroed, Layout};

        lazy_static::lazy_static! {
            /// The simulated RAM window, reserved once and leaked for the
            /// lifetime of the process.
            static ref SIM_RAM_BASE: usize = {
                let layout = Layout::from_size_align(RAM_SIZE, PAGE_SIZE)
                    .expect("bad RAM window layout");
                // SAFETY: layout has non-zero size.
                let base = unsafe { alloc_zeroed(layout) };
                assert!(!base.is_null(), "cannot reserve the simulated RAM window");
                base as usize
            };
        }

        /// Start of allocatable physical memory.
        pub fn ram_start_phys() -> usize {
            *SIM_RAM_BASE
        }

        /// End of allocatable physical memory.
        pub fn ram_end_phys() -> usize {
            *SIM_RAM_BASE + RAM_SIZE
        }
    }
}
