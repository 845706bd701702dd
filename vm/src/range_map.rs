//! Concurrent, ordered map from address ranges to memory areas.
//!
//! The map is a sorted singly linked list of areas with three access modes:
//!
//! - **Readers** ([`search`]) walk the list without any lock. They run
//!   inside an epoch critical section ([`ConcurrentRangeMap::pin`]), which
//!   keeps every node they can reach allocated until the guard drops.
//! - **Span writers** ([`search_lock`]) take an exclusive write-lock over
//!   an address span. Overlapping span writers serialize against each
//!   other; readers are never blocked. This is what lets faults on
//!   disjoint regions of one address space proceed in parallel.
//! - **Splices**: the physical pointer surgery of a [`SpanHandle::replace`]
//!   runs under one short internal lock, held only across the few loads and
//!   stores that relink the list — never across page-table work or
//!   allocation.
//!
//! Removal tombstones an area (its `deleted` flag), unlinks it, and hands
//! the node to the epoch reclaimer, so a reader that found the area before
//! the removal can still safely inspect it and observe the tombstone.
//!
//! [`search`]: ConcurrentRangeMap::search
//! [`search_lock`]: ConcurrentRangeMap::search_lock

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;
use mm::address::VirtAddr;
use spin::Mutex;

use crate::epoch::{EpochGuard, EpochReclaimer};
use crate::vm_area::VmArea;

/// One list link. Allocated with `Box::into_raw` on insert, reclaimed
/// through the epoch reclaimer on unlink.
pub(crate) struct MapNode {
    area: VmArea,
    next: AtomicPtr<MapNode>,
}

/// An epoch critical section over one map.
///
/// References returned by [`ConcurrentRangeMap::search`] stay valid for the
/// guard's lifetime, even across concurrent removals.
pub struct MapGuard<'a> {
    inner: EpochGuard<'a, MapNode>,
}

/// Ordered map of non-overlapping areas with concurrent lookup and
/// span-locked mutation.
pub struct ConcurrentRangeMap {
    /// Head of the sorted list.
    head: AtomicPtr<MapNode>,
    /// Serializes pointer surgery on the list.
    link_lock: Mutex<()>,
    /// Active span write-locks, as `(start, end)` byte ranges.
    spans: Mutex<Vec<(usize, usize)>>,
    /// Deferred destruction of unlinked nodes.
    reclaimer: EpochReclaimer<MapNode>,
}

impl ConcurrentRangeMap {
    pub const fn new() -> Self {
        ConcurrentRangeMap {
            head: AtomicPtr::new(ptr::null_mut()),
            link_lock: Mutex::new(()),
            spans: Mutex::new(Vec::new()),
            reclaimer: EpochReclaimer::new(),
        }
    }

    /// Enters an epoch critical section on this map.
    pub fn pin(&self) -> MapGuard<'_> {
        MapGuard {
            inner: self.reclaimer.pin(),
        }
    }

    /// Finds a live area overlapping `[start, start + len)`.
    ///
    /// Lock-free; returns `None` on an empty span or if the range wraps.
    /// The reference is valid for the guard's epoch critical section.
    pub fn search<'g>(
        &self,
        start: VirtAddr,
        len: usize,
        guard: &'g MapGuard<'_>,
    ) -> Option<&'g VmArea> {
        let _ = guard;
        let start = start.to_usize();
        let end = start.checked_add(len)?;
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: linked nodes are only freed through the reclaimer,
            // and the caller's guard holds the epoch open.
            let node: &'g MapNode = unsafe { &*cur };
            if node.area.start_va().to_usize() >= end {
                break;
            }
            if node.area.end_va().to_usize() > start && !node.area.is_deleted() {
                return Some(&node.area);
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Snapshot of the ranges of all live areas, in address order.
    pub fn ranges(&self, guard: &MapGuard<'_>) -> Vec<(VirtAddr, VirtAddr)> {
        let _ = guard;
        let mut out = Vec::new();
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: as in `search`.
            let node = unsafe { &*cur };
            if !node.area.is_deleted() {
                out.push((node.area.start_va(), node.area.end_va()));
            }
            cur = node.next.load(Ordering::Acquire);
        }
        out
    }

    /// Acquires an exclusive write-lock over `[start, start + len)`.
    ///
    /// Blocks (spinning) while any overlapping span lock is held. Readers
    /// are unaffected.
    ///
    /// # Panics
    /// If the span wraps the address space; callers validate ranges first.
    pub fn search_lock(&self, start: VirtAddr, len: usize) -> SpanHandle<'_> {
        let start = start.to_usize();
        let end = start.checked_add(len).expect("span wraps the address space");
        let backoff = Backoff::new();
        loop {
            {
                let mut spans = self.spans.lock();
                if !spans.iter().any(|&(s, e)| s < end && e > start) {
                    spans.push((start, end));
                    break;
                }
            }
            backoff.snooze();
        }
        SpanHandle {
            map: self,
            start,
            end,
            guard: self.pin(),
        }
    }

    /// Replaces `old` with `new`, provided the map still contains exactly
    /// `old` over its range.
    ///
    /// Returns `false` if the replacement raced with another removal or
    /// replacement of `old`; the map is unchanged in that case.
    pub fn replace_vma(&self, old: &VmArea, new: VmArea) -> bool {
        let start = old.start_va();
        let len = old.end_va().to_usize() - start.to_usize();
        let handle = self.search_lock(start, len);
        let areas = handle.areas();
        let unchanged =
            areas.len() == 1 && ptr::eq(areas[0], old) && !old.is_deleted();
        if unchanged {
            handle.replace(Some(new));
        }
        unchanged
    }

    /// Nudges deferred destruction forward. Complete once no reader holds
    /// a guard.
    pub fn settle(&self) {
        self.reclaimer.settle();
    }
}

impl core::fmt::Debug for ConcurrentRangeMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let guard = self.pin();
        f.debug_struct("ConcurrentRangeMap")
            .field("ranges", &self.ranges(&guard))
            .finish()
    }
}

impl Drop for ConcurrentRangeMap {
    fn drop(&mut self) {
        // Exclusive access: no guards or span handles can borrow the map.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: every linked node came from `Box::into_raw` and is
            // owned solely by the list here.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
            drop(node);
        }
        self.reclaimer.settle();
    }
}

/// Exclusive write access to one address span of a map.
///
/// Dropping the handle releases the span.
pub struct SpanHandle<'a> {
    map: &'a ConcurrentRangeMap,
    start: usize,
    end: usize,
    guard: MapGuard<'a>,
}

impl SpanHandle<'_> {
    /// The live areas currently inside the locked span, in address order.
    pub fn areas(&self) -> Vec<&VmArea> {
        let mut out = Vec::new();
        let mut cur = self.map.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: the handle's own guard holds the epoch open.
            let node = unsafe { &*cur };
            let ns = node.area.start_va().to_usize();
            if ns >= self.end {
                break;
            }
            if node.area.end_va().to_usize() > self.start && !node.area.is_deleted() {
                out.push(&node.area);
            }
            cur = node.next.load(Ordering::Acquire);
        }
        out
    }

    /// Whether the locked span contains no live area.
    pub fn is_empty(&self) -> bool {
        self.areas().is_empty()
    }

    /// Tombstones and unlinks every area in the span, then installs `new`
    /// (if any) in its place. Removed areas are destroyed once every
    /// reader that may observe them has left its epoch.
    pub fn replace(&self, new: Option<VmArea>) {
        if let Some(area) = &new {
            debug_assert!(
                area.start_va().to_usize() >= self.start && area.end_va().to_usize() <= self.end,
                "replacement {:?} outside the locked span",
                area
            );
        }
        let map = self.map;
        let _link = map.link_lock.lock();

        let mut removed = 0usize;
        let mut prevp: &AtomicPtr<MapNode> = &map.head;
        loop {
            let cur = prevp.load(Ordering::Acquire);
            if cur.is_null() {
                break;
            }
            // SAFETY: the link lock keeps the structure stable and linked
            // nodes alive; unlinked nodes stay allocated via the reclaimer.
            let node: &MapNode = unsafe { &*cur };
            if node.area.start_va().to_usize() >= self.end {
                break;
            }
            if node.area.end_va().to_usize() > self.start {
                // Tombstone first: a reader that already holds the area
                // must see the flag before the storage can go away, and a
                // fault that just locked a PTE re-checks it.
                node.area.mark_deleted();
                prevp.store(node.next.load(Ordering::Acquire), Ordering::Release);
                // SAFETY: `cur` came from `Box::into_raw` and is now
                // unreachable from the list.
                map.reclaimer.retire(unsafe { Box::from_raw(cur) }, &self.guard.inner);
                removed += 1;
                continue;
            }
            prevp = &node.next;
        }

        if let Some(area) = new {
            let start = area.start_va().to_usize();
            log::trace!(
                "range map: replace [{:#x}, {:#x}): -{} areas, +{:?}",
                self.start,
                self.end,
                removed,
                area
            );
            let node = Box::into_raw(Box::new(MapNode {
                area,
                next: AtomicPtr::new(ptr::null_mut()),
            }));
            let mut prevp: &AtomicPtr<MapNode> = &map.head;
            loop {
                let cur = prevp.load(Ordering::Acquire);
                if cur.is_null() || unsafe { (*cur).area.start_va().to_usize() } >= start {
                    // SAFETY: `node` is not yet linked; we own it.
                    unsafe { (*node).next.store(cur, Ordering::Release) };
                    prevp.store(node, Ordering::Release);
                    break;
                }
                // SAFETY: as above.
                prevp = unsafe { &(*cur).next };
            }
        } else if removed > 0 {
            log::trace!(
                "range map: cleared [{:#x}, {:#x}): -{} areas",
                self.start,
                self.end,
                removed
            );
        }
    }
}

impl Drop for SpanHandle<'_> {
    fn drop(&mut self) {
        let mut spans = self.map.spans.lock();
        let index = spans
            .iter()
            .position(|&(s, e)| s == self.start && e == self.end)
            .expect("span lock vanished");
        spans.swap_remove(index);
    }
}
