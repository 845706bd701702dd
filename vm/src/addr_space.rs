//! Address spaces.
//!
//! An [`AddressSpace`] binds together the three pieces of per-process
//! memory state: the range map of areas, the hardware page table, and the
//! kernel-shared region installed into that table. There is no lock over
//! the whole address space; the range map's span locks, the PTE protocol
//! and the epoch reclaimer let `fork`, `mmap`, `munmap` and page faults
//! run concurrently on multiple harts.
//!
//! An address space is shared by every thread of a process; the process
//! layer wraps it in an `Arc` and drops it when the last thread exits.

use alloc::boxed::Box;
use alloc::sync::Arc;

use arch::pte::{FaultCode, PteFlags};
use arch::tlb::tlb_shootdown_all;
use config::mm::{KSHARED_BASE, MAX_HARTS, PAGE_SIZE, USER_CEILING};
use core::sync::atomic::AtomicUsize;
use mm::address::{VirtAddr, v2p};
use systype::{VmError, VmResult};

use crate::fault::{self, FaultOutcome};
use crate::page_table::PageTable;
use crate::range_map::{ConcurrentRangeMap, MapGuard};
use crate::vm_area::{VmArea, VmaFlags};
use crate::vm_node::VmNode;

/// Per-hart slots of the kernel-shared region.
#[derive(Debug, Default)]
#[repr(C)]
pub struct HartShared {
    /// Kernel stack top for traps taken on this hart.
    pub trap_stack: AtomicUsize,
    /// Task currently running on this hart, for diagnostics.
    pub current_task: AtomicUsize,
}

/// The per-address-space kernel-shared page.
///
/// One page of per-hart kernel data every address space maps at
/// [`KSHARED_BASE`], so the trap entry path can reach it before switching
/// page tables.
#[derive(Debug)]
#[repr(C, align(4096))]
pub struct KShared {
    pub hart: [HartShared; MAX_HARTS],
}

const _: () = assert!(core::mem::size_of::<KShared>() == PAGE_SIZE);

impl KShared {
    fn new() -> Box<Self> {
        Box::new(KShared {
            hart: core::array::from_fn(|_| HartShared::default()),
        })
    }
}

/// A virtual address space.
///
/// See the module-level documentation for more information.
#[derive(Debug)]
pub struct AddressSpace {
    /// Areas of the user half, keyed by range.
    ranges: ConcurrentRangeMap,
    /// Hardware page table, exclusively owned by this address space.
    page_table: PageTable,
    /// Kernel-shared region mapped into `page_table`.
    kshared: Box<KShared>,
}

impl AddressSpace {
    /// Creates an empty address space with the kernel half mapped.
    ///
    /// Anything acquired before a failure is released again on the way
    /// out.
    ///
    /// # Errors
    /// Returns [`VmError::OutOfMemory`] if a table frame cannot be
    /// allocated.
    pub fn new() -> VmResult<Self> {
        let page_table = PageTable::build()?;
        page_table.map_kernel();
        let kshared = KShared::new();
        page_table.map_kernel_page(
            VirtAddr::new(KSHARED_BASE),
            v2p(&*kshared as *const KShared),
            PteFlags::P | PteFlags::W | PteFlags::A | PteFlags::D | PteFlags::G,
        )?;
        Ok(AddressSpace {
            ranges: ConcurrentRangeMap::new(),
            page_table,
            kshared,
        })
    }

    /// Enters an epoch critical section on this address space's range map.
    pub fn pin(&self) -> MapGuard<'_> {
        self.ranges.pin()
    }

    /// The hardware page table of this address space.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// The kernel-shared region of this address space.
    pub fn kshared(&self) -> &KShared {
        &self.kshared
    }

    pub(crate) fn ranges(&self) -> &ConcurrentRangeMap {
        &self.ranges
    }

    /// Maps `node` at `start` as a private area.
    ///
    /// The area covers `node.npages()` pages. Any page-table entries left
    /// in the range by earlier mappings are cleared; if any were present
    /// and `do_tlb` is set, stale translations are flushed.
    ///
    /// # Errors
    /// [`VmError::BadAddress`] if the range is unaligned, wraps, or leaves
    /// user space; [`VmError::Overlap`] if the range touches an existing
    /// area (the address space is unchanged).
    pub fn insert(&self, node: Arc<VmNode>, start: VirtAddr, do_tlb: bool) -> VmResult<()> {
        let len = node.npages() * PAGE_SIZE;
        if !start.is_aligned() {
            return Err(VmError::BadAddress);
        }
        let end = start.checked_add(len).ok_or(VmError::BadAddress)?;
        if end.to_usize() > USER_CEILING {
            return Err(VmError::BadAddress);
        }

        let handle = self.ranges.search_lock(start, len);
        if !handle.is_empty() {
            log::info!(
                "insert: [{:#x}, {:#x}) overlaps an existing area",
                start.to_usize(),
                end.to_usize()
            );
            return Err(VmError::Overlap);
        }
        handle.replace(Some(VmArea::new(start, end, VmaFlags::PRIVATE, node)));

        let had_mappings = self.page_table.update_pages(start, end, |_| 0);
        if had_mappings && do_tlb {
            tlb_shootdown_all();
        }
        Ok(())
    }

    /// Unmaps `[start, start + len)`.
    ///
    /// Every area in the span must be fully contained in it; partial
    /// unmaps that would split an area are refused without changing any
    /// state. Covered page-table entries are cleared, and stale
    /// translations flushed if any entry was present.
    ///
    /// # Errors
    /// [`VmError::BadAddress`] on an unaligned or wrapping range,
    /// [`VmError::PartialUnmap`] if an area straddles the span boundary.
    pub fn remove(&self, start: VirtAddr, len: usize) -> VmResult<()> {
        if !start.is_aligned() || len % PAGE_SIZE != 0 {
            return Err(VmError::BadAddress);
        }
        let end = start.checked_add(len).ok_or(VmError::BadAddress)?;

        let handle = self.ranges.search_lock(start, len);
        for area in handle.areas() {
            if area.start_va() < start || area.end_va() > end {
                log::info!(
                    "remove: [{:#x}, {:#x}) covers only part of {:?}",
                    start.to_usize(),
                    end.to_usize(),
                    area
                );
                return Err(VmError::PartialUnmap);
            }
        }
        handle.replace(None);

        if self.page_table.update_pages(start, end, |_| 0) {
            tlb_shootdown_all();
        }
        Ok(())
    }

    /// Finds an area overlapping `[start, start + len)`.
    ///
    /// Returns `None` for wrapping ranges. The reference is valid for the
    /// guard's epoch critical section.
    pub fn lookup<'g>(
        &self,
        start: VirtAddr,
        len: usize,
        guard: &'g MapGuard<'_>,
    ) -> Option<&'g VmArea> {
        self.ranges.search(start, len, guard)
    }

    /// Whether `va` is currently resolvable for user access.
    ///
    /// A quick page-table check for syscall argument validation. Unlike a
    /// fault it has no side effects, and like any unlocked check it can go
    /// stale the instant it returns.
    pub fn probe(&self, va: VirtAddr) -> bool {
        if !va.in_user_space() {
            return false;
        }
        let present = (PteFlags::P | PteFlags::U).bits();
        self.page_table
            .walk(va.page_number())
            .is_some_and(|pte| pte.load() & present == present)
    }

    /// Duplicates this address space into a fresh one.
    ///
    /// With `share` unset every node is deep-copied and the child gets
    /// private areas. With `share` set this is a copy-on-write fork: the
    /// child references the same nodes through copy-on-write areas, areas
    /// of this address space that were still private are republished as
    /// copy-on-write, and every present-writable entry in their ranges is
    /// downgraded to read-only copy-on-write before a single flush.
    ///
    /// # Errors
    /// Returns [`VmError::OutOfMemory`] if the child or a node copy cannot
    /// be allocated.
    pub fn copy(&self, share: bool) -> VmResult<AddressSpace> {
        let child = AddressSpace::new()?;
        let snapshot = {
            let guard = self.pin();
            self.ranges.ranges(&guard)
        };

        for (start, end) in snapshot {
            let len = end.to_usize() - start.to_usize();
            let handle = self.ranges.search_lock(start, len);
            // The snapshot is advisory: the span may have been unmapped or
            // replaced since. Duplicate whatever lives there now.
            let (a_start, a_end, a_node, a_is_cow) = {
                let areas = handle.areas();
                let Some(area) = areas.first() else { continue };
                (
                    area.start_va(),
                    area.end_va(),
                    Arc::clone(area.node()),
                    area.is_cow(),
                )
            };

            if share {
                if !a_is_cow {
                    handle.replace(Some(VmArea::new(
                        a_start,
                        a_end,
                        VmaFlags::COW,
                        Arc::clone(&a_node),
                    )));
                    let writable = (PteFlags::P | PteFlags::W).bits();
                    self.page_table.update_pages(a_start, a_end, |v| {
                        if v & writable == writable {
                            (v & !PteFlags::W.bits()) | PteFlags::COW.bits()
                        } else {
                            v
                        }
                    });
                }
                child.install_area(VmArea::new(a_start, a_end, VmaFlags::COW, a_node));
            } else {
                let node_copy = Arc::new(a_node.try_clone()?);
                child.install_area(VmArea::new(a_start, a_end, VmaFlags::PRIVATE, node_copy));
            }
        }

        if share {
            // Downgraded entries may still be cached writable on any hart
            // running this address space.
            tlb_shootdown_all();
        }
        log::debug!("copied address space (share = {})", share);
        Ok(child)
    }

    /// Copies `buf` into this address space at `va`.
    ///
    /// Walks areas and node pages directly, so it works on address spaces
    /// that are not installed on the calling hart. Pages not yet faulted
    /// in are allocated here; on-demand areas that have never loaded will
    /// overwrite these bytes at their first fault, so callers load such
    /// nodes before seeding them.
    ///
    /// # Errors
    /// [`VmError::BadAddress`] if any byte of the range is unmapped or the
    /// range wraps; [`VmError::OutOfMemory`] if a page cannot be
    /// allocated.
    pub fn copy_out(&self, va: VirtAddr, buf: &[u8]) -> VmResult<()> {
        va.checked_add(buf.len()).ok_or(VmError::BadAddress)?;
        let mut cur = va;
        let mut done = 0;
        while done < buf.len() {
            let guard = self.pin();
            let area = self
                .ranges
                .search(cur, 1, &guard)
                .ok_or(VmError::BadAddress)?;
            let index = area.page_index(cur);
            if area.node().page(index).is_none() {
                area.node().alloc_pages()?;
            }
            let pa = area
                .node()
                .page(index)
                .expect("node page missing after allocation");
            let offset = cur.page_offset();
            let n = usize::min(PAGE_SIZE - offset, buf.len() - done);
            // SAFETY: the slot is published, so the frame belongs to the
            // node; writing user memory through the direct map is the
            // purpose of this call.
            unsafe {
                pa.page_number().as_page_slice_mut()[offset..offset + n]
                    .copy_from_slice(&buf[done..done + n]);
            }
            done += n;
            cur = VirtAddr::new(cur.to_usize() + n);
        }
        Ok(())
    }

    /// Resolves a page fault at `va`. See [`fault::pagefault`].
    pub fn pagefault(&self, va: VirtAddr, code: FaultCode) -> VmResult<FaultOutcome> {
        fault::pagefault(self, va, code)
    }

    /// Drives deferred destruction of replaced areas forward.
    ///
    /// A maintenance hook for quiescent points (scheduler idle, teardown).
    /// Never required for correctness.
    pub fn settle(&self) {
        self.ranges.settle();
    }

    /// Publishes `area` into a span that the caller knows is free.
    fn install_area(&self, area: VmArea) {
        let start = area.start_va();
        let len = area.end_va().to_usize() - start.to_usize();
        let handle = self.ranges.search_lock(start, len);
        debug_assert!(handle.is_empty(), "install into a non-empty span");
        handle.replace(Some(area));
    }
}

// Checked at the boundary rather than assumed: the kshared page must sit
// above every user mapping.
const _: () = assert!(KSHARED_BASE > USER_CEILING);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, MemFile, read_user};
    use crate::vm_node::{Backing, NodeKind};
    use arch::pte::Pte;
    use arch::tlb;

    fn anon_node(npages: usize) -> Arc<VmNode> {
        Arc::new(VmNode::new(npages, NodeKind::Eager, None).unwrap())
    }

    #[test]
    fn insert_then_lookup() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        let node = anon_node(2);
        space.insert(node, VirtAddr::new(0x1000), true).unwrap();

        let guard = space.pin();
        let area = space.lookup(VirtAddr::new(0x1500), 1, &guard).unwrap();
        assert_eq!(area.start_va().to_usize(), 0x1000);
        assert_eq!(area.end_va().to_usize(), 0x3000);
        assert!(space.lookup(VirtAddr::new(0x3000), 1, &guard).is_none());
    }

    #[test]
    fn insert_rejects_overlap() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        space
            .insert(anon_node(2), VirtAddr::new(0x1000), true)
            .unwrap();

        let err = space
            .insert(anon_node(1), VirtAddr::new(0x2000), true)
            .unwrap_err();
        assert_eq!(err, VmError::Overlap);

        // The address space is unchanged.
        let guard = space.pin();
        let area = space.lookup(VirtAddr::new(0x2000), 1, &guard).unwrap();
        assert_eq!(area.start_va().to_usize(), 0x1000);
        assert_eq!(area.end_va().to_usize(), 0x3000);
    }

    #[test]
    fn insert_rejects_bad_ranges() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        assert_eq!(
            space
                .insert(anon_node(1), VirtAddr::new(0x1234), true)
                .unwrap_err(),
            VmError::BadAddress
        );
        assert_eq!(
            space
                .insert(anon_node(2), VirtAddr::new(USER_CEILING - PAGE_SIZE), true)
                .unwrap_err(),
            VmError::BadAddress
        );
    }

    #[test]
    fn remove_requires_full_coverage() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        space
            .insert(anon_node(2), VirtAddr::new(0x1000), true)
            .unwrap();

        let err = space.remove(VirtAddr::new(0x1000), PAGE_SIZE).unwrap_err();
        assert_eq!(err, VmError::PartialUnmap);
        let guard = space.pin();
        assert!(space.lookup(VirtAddr::new(0x1000), 1, &guard).is_some());
    }

    #[test]
    fn insert_remove_round_trip() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        space
            .insert(anon_node(2), VirtAddr::new(0x1000), true)
            .unwrap();
        // Fault a page in so removal also has a PTE to clear.
        space
            .pagefault(VirtAddr::new(0x1000), FaultCode::WRITE)
            .unwrap();
        let flushes_before = tlb::flush_count();

        let guard = space.pin();
        let area = space.lookup(VirtAddr::new(0x1000), 1, &guard).unwrap();
        space.remove(VirtAddr::new(0x1000), 2 * PAGE_SIZE).unwrap();

        assert!(area.is_deleted());
        assert!(space.lookup(VirtAddr::new(0x1000), 1, &guard).is_none());
        assert!(space.lookup(VirtAddr::new(0x2000), 1, &guard).is_none());
        // The present entry forced a flush.
        assert!(tlb::flush_count() > flushes_before);
        let pte = space.page_table().walk(VirtAddr::new(0x1000).page_number());
        assert_eq!(pte.unwrap().load(), 0);

        // The span is free again.
        drop(guard);
        space
            .insert(anon_node(2), VirtAddr::new(0x1000), true)
            .unwrap();
    }

    #[test]
    fn deep_copy_isolates_the_child() {
        test_support::init();
        let parent = AddressSpace::new().unwrap();
        parent
            .insert(anon_node(1), VirtAddr::new(0x1000), true)
            .unwrap();
        parent.copy_out(VirtAddr::new(0x1000), &[0x11]).unwrap();

        let child = parent.copy(false).unwrap();
        parent.copy_out(VirtAddr::new(0x1000), &[0xaa]).unwrap();

        assert_eq!(read_user(&child, VirtAddr::new(0x1000), 1), [0x11]);
        assert_eq!(read_user(&parent, VirtAddr::new(0x1000), 1), [0xaa]);
    }

    #[test]
    fn copy_out_round_trips() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        space
            .insert(anon_node(3), VirtAddr::new(0x1000), true)
            .unwrap();

        // An unaligned span crossing two page boundaries.
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let va = VirtAddr::new(0x1800);
        space.copy_out(va, &data).unwrap();
        assert_eq!(read_user(&space, va, data.len()), data);

        assert_eq!(
            space.copy_out(VirtAddr::new(0x9000), &[0]).unwrap_err(),
            VmError::BadAddress
        );
    }

    #[test]
    fn demand_load_faults_in_file_contents() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        let backing = Backing {
            file: Arc::new(MemFile::new(b"hello")),
            offset: 0,
            len: 5,
        };
        let node = Arc::new(VmNode::new(1, NodeKind::OnDemand, Some(backing)).unwrap());
        space.insert(node, VirtAddr::new(0x1000), true).unwrap();

        let outcome = space
            .pagefault(VirtAddr::new(0x1000), FaultCode::empty())
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Fixed);

        let bytes = read_user(&space, VirtAddr::new(0x1000), PAGE_SIZE);
        assert_eq!(&bytes[..5], b"hello");
        assert!(bytes[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn probe_tracks_fault_resolution() {
        test_support::init();
        let space = AddressSpace::new().unwrap();
        space
            .insert(anon_node(1), VirtAddr::new(0x1000), true)
            .unwrap();

        assert!(!space.probe(VirtAddr::new(0x1000)));
        space
            .pagefault(VirtAddr::new(0x1000), FaultCode::WRITE)
            .unwrap();
        assert!(space.probe(VirtAddr::new(0x1000)));
        assert!(!space.probe(VirtAddr::new(0x2000)));
        assert!(!space.probe(VirtAddr::new(KSHARED_BASE)));
    }

    #[test]
    fn kshared_is_mapped_per_address_space() {
        test_support::init();
        let a = AddressSpace::new().unwrap();
        let b = AddressSpace::new().unwrap();
        let vpn = VirtAddr::new(KSHARED_BASE).page_number();
        let pa_a = Pte::pa_of(a.page_table().walk(vpn).unwrap().load());
        let pa_b = Pte::pa_of(b.page_table().walk(vpn).unwrap().load());
        assert_eq!(pa_a, v2p(a.kshared() as *const KShared).to_usize());
        assert_eq!(pa_b, v2p(b.kshared() as *const KShared).to_usize());
        assert_ne!(pa_a, pa_b);
    }

    #[test]
    fn cow_fork_shares_nodes_and_downgrades_ptes() {
        test_support::init();
        let parent = AddressSpace::new().unwrap();
        let node = anon_node(1);
        parent
            .insert(Arc::clone(&node), VirtAddr::new(0x1000), true)
            .unwrap();
        parent.copy_out(VirtAddr::new(0x1000), &[0x55]).unwrap();
        parent
            .pagefault(VirtAddr::new(0x1000), FaultCode::WRITE)
            .unwrap();

        let child = parent.copy(true).unwrap();
        parent.settle();

        {
            let guard = parent.pin();
            let parent_area = parent.lookup(VirtAddr::new(0x1000), 1, &guard).unwrap();
            assert!(parent_area.is_cow());
            assert!(Arc::ptr_eq(parent_area.node(), &node));
        }
        {
            let guard = child.pin();
            let child_area = child.lookup(VirtAddr::new(0x1000), 1, &guard).unwrap();
            assert!(child_area.is_cow());
            assert!(Arc::ptr_eq(child_area.node(), &node));
        }
        // Our handle, the parent area and the child area: the two
        // copy-on-write areas took the two new references.
        assert_eq!(Arc::strong_count(&node), 3);

        // The parent's writable entry became read-only copy-on-write.
        let value = parent
            .page_table()
            .walk(VirtAddr::new(0x1000).page_number())
            .unwrap()
            .load();
        let flags = Pte::flags_of(value);
        assert!(flags.contains(PteFlags::P | PteFlags::U | PteFlags::COW));
        assert!(!flags.contains(PteFlags::W));
    }
}
