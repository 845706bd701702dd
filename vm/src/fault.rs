//! Page fault resolution.
//!
//! [`pagefault`] turns a faulting user virtual address into a valid page
//! table entry. The handler is a retry loop around one attempt: walk the
//! entry, find the covering area inside an epoch critical section, make
//! sure the backing page exists and is loaded, split copy-on-write areas
//! on write, then publish the translation under the PTE lock bit. Any race
//! it loses — entry locked by another hart, lost CAS, area replaced or
//! removed underneath it — sends it back to re-read the entry.
//!
//! Failures that mean the kernel itself is broken or out of memory on the
//! fault path (there is no graceful return into a faulting instruction)
//! panic instead of returning: this kernel exposes bugs rather than
//! masking them. Unresolvable accesses return
//! [`Fatal`](VmError::Fatal) so the trap layer can kill the task.

use alloc::sync::Arc;

use arch::hart::hart_id;
use arch::pte::{FaultCode, Pte, PteFlags};
use arch::tlb::tlb_shootdown_all;
use crossbeam_utils::Backoff;
use mm::address::VirtAddr;
use systype::{VmError, VmResult};

use crate::addr_space::AddressSpace;
use crate::vm_area::{VmArea, VmaFlags};

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// This call published a new translation.
    Fixed,
    /// Another hart resolved the same fault first; the entry is already
    /// present, user-accessible and writable.
    AlreadyValid,
}

/// Resolves a page fault at `va` in `space`.
///
/// `code` is the hardware error code of the fault; only its write bit
/// influences resolution. Returns [`Fatal`](VmError::Fatal) if `va` is
/// outside user space or no area covers it.
pub fn pagefault(space: &AddressSpace, va: VirtAddr, code: FaultCode) -> VmResult<FaultOutcome> {
    if !va.in_user_space() {
        log::warn!(
            "hart {}: fault above the user ceiling at {:#x}",
            hart_id(),
            va.to_usize()
        );
        return Err(VmError::Fatal);
    }
    let vpn = va.page_number();
    let resolved = (PteFlags::P | PteFlags::U | PteFlags::W).bits();
    let backoff = Backoff::new();
    loop {
        let pte = space
            .page_table()
            .walk_create(vpn)
            .expect("out of memory walking a user page table");
        let ptev = pte.load();

        // Fast path: another hart fully resolved this address already.
        if ptev & resolved == resolved {
            return Ok(FaultOutcome::AlreadyValid);
        }
        // Another hart is publishing this entry right now.
        if ptev & PteFlags::LOCK.bits() != 0 {
            backoff.spin();
            continue;
        }

        let guard = space.pin();
        let Some(area) = space.lookup(va, 1, &guard) else {
            log::warn!(
                "hart {}: fault on unmapped address {:#x} ({:?})",
                hart_id(),
                va.to_usize(),
                code
            );
            return Err(VmError::Fatal);
        };
        let index = area.page_index(va);

        if area.node().page(index).is_none() {
            area.node()
                .alloc_pages()
                .expect("out of memory allocating node pages on the fault path");
        }
        if area.node().is_on_demand() {
            area.node()
                .demand_load()
                .expect("backing read failed on the fault path");
        }

        if area.is_cow() && code.is_write() {
            if pagefault_wcow(space, area) {
                tlb_shootdown_all();
            }
            continue;
        }

        // Publish under the entry lock.
        if !pte.try_set(ptev, ptev | PteFlags::LOCK.bits()) {
            backoff.spin();
            continue;
        }
        if area.is_deleted() {
            // A concurrent remove or replacement won the race between our
            // lookup and the lock; undo and re-read.
            pte.store(ptev);
            backoff.spin();
            continue;
        }
        let pa = area
            .node()
            .page(index)
            .expect("node page missing after allocation")
            .to_usize();
        let value = if area.is_cow() {
            Pte::make(pa, PteFlags::P | PteFlags::U | PteFlags::COW)
        } else {
            // A private area's node is unshared while the area is live and
            // published; the deletion re-check above rules out the window
            // in which a concurrent fork swaps the area out.
            Pte::make(pa, PteFlags::P | PteFlags::U | PteFlags::W)
        };
        pte.store(value);
        log::trace!(
            "hart {}: fault at {:#x} fixed ({:#x})",
            hart_id(),
            va.to_usize(),
            value
        );
        return Ok(FaultOutcome::Fixed);
    }
}

/// Splits a copy-on-write area for a write fault.
///
/// The node is cloned unconditionally: a fork on another thread can raise
/// its reference count at any instant, so "unshared" cannot be tested
/// atomically. The clone is published as a private area in place of
/// `old`; stale entries of the replaced range are cleared so every hart
/// re-faults onto the new node.
///
/// Returns `false` if the replacement raced with another removal or split;
/// the caller retries either way, and flushes only after a successful
/// swap.
fn pagefault_wcow(space: &AddressSpace, old: &VmArea) -> bool {
    let node_copy = old
        .node()
        .try_clone()
        .expect("out of memory cloning a node on the fault path");
    let replacement = VmArea::new(
        old.start_va(),
        old.end_va(),
        VmaFlags::PRIVATE,
        Arc::new(node_copy),
    );
    if !space.ranges().replace_vma(old, replacement) {
        log::trace!(
            "hart {}: copy-on-write split of [{:#x}, {:#x}) raced, retrying",
            hart_id(),
            old.start_va().to_usize(),
            old.end_va().to_usize()
        );
        return false;
    }
    space
        .page_table()
        .update_pages(old.start_va(), old.end_va(), |_| 0);
    log::debug!(
        "hart {}: copy-on-write split of [{:#x}, {:#x})",
        hart_id(),
        old.start_va().to_usize(),
        old.end_va().to_usize()
    );
    true
}
