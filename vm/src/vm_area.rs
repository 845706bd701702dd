//! Memory areas: contiguous mapped ranges of user virtual addresses.
//!
//! A [`VmArea`] carries `(range, flags, node)` and one reference to its
//! backing node, nothing more. Areas are immutable after publication into
//! the range map; every logical mutation replaces the area with a fresh
//! one, and the map tombstones the old area through its `deleted` flag so
//! readers can detect the swap before the storage is reclaimed.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use config::mm::{PAGE_SIZE, USER_CEILING};
use mm::address::VirtAddr;

use crate::vm_node::VmNode;

bitflags! {
    /// Mapping mode of an area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u8 {
        /// The area owns its node exclusively; faults map pages writable.
        const PRIVATE = 1 << 0;
        /// The node is shared copy-on-write; the first write splits the
        /// area onto a private copy.
        const COW = 1 << 1;
    }
}

/// A half-open range `[start, end)` of user virtual addresses mapped to one
/// backing node.
pub struct VmArea {
    /// Starting virtual address.
    start: VirtAddr,
    /// Ending virtual address (exclusive).
    end: VirtAddr,
    /// Mapping mode.
    flags: VmaFlags,
    /// Shared reference to the backing node.
    node: Arc<VmNode>,
    /// Set by the range map when this area has been replaced or removed.
    deleted: AtomicBool,
}

impl VmArea {
    /// Builds an area over `[start, end)` backed by `node`.
    ///
    /// The range must be page-aligned, lie below the user ceiling and
    /// cover the node exactly.
    pub fn new(start: VirtAddr, end: VirtAddr, flags: VmaFlags, node: Arc<VmNode>) -> Self {
        debug_assert!(start.is_aligned() && end.is_aligned());
        debug_assert!(start < end && end.to_usize() <= USER_CEILING);
        debug_assert_eq!(end.to_usize() - start.to_usize(), node.npages() * PAGE_SIZE);
        VmArea {
            start,
            end,
            flags,
            node,
            deleted: AtomicBool::new(false),
        }
    }

    /// Returns the starting virtual address of the area.
    pub fn start_va(&self) -> VirtAddr {
        self.start
    }

    /// Returns the ending virtual address of the area.
    pub fn end_va(&self) -> VirtAddr {
        self.end
    }

    /// Returns the mapping mode of the area.
    pub fn flags(&self) -> VmaFlags {
        self.flags
    }

    /// Whether the area maps its node copy-on-write.
    pub fn is_cow(&self) -> bool {
        self.flags.contains(VmaFlags::COW)
    }

    /// Returns the backing node of the area.
    pub fn node(&self) -> &Arc<VmNode> {
        &self.node
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.start && va < self.end
    }

    /// Index into the node of the page covering `va`.
    pub fn page_index(&self, va: VirtAddr) -> usize {
        debug_assert!(self.contains(va));
        (va.round_down().to_usize() - self.start.to_usize()) / PAGE_SIZE
    }

    /// Whether the area has been replaced or removed from its map.
    ///
    /// A reader holding an epoch guard may still dereference a deleted
    /// area; the flag tells it the area no longer represents the mapping.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Tombstones the area. Called by the range map only, while it unlinks
    /// the area under its span lock.
    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}

impl core::fmt::Debug for VmArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmArea")
            .field("start", &format_args!("{:#x}", self.start.to_usize()))
            .field("end", &format_args!("{:#x}", self.end.to_usize()))
            .field("flags", &self.flags)
            .field("node", &self.node)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
