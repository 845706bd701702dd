//! Backing nodes: the page frames behind one or more memory areas.
//!
//! A [`VmNode`] owns a fixed-capacity array of page slots. Each slot is
//! either empty or holds one zero-initialized frame, published by a single
//! successful compare-and-swap; once published a slot never changes until
//! the node is destroyed. This lets fault handlers on different harts
//! populate different pages of the same node in parallel, and lets the
//! fault path and `copy_out` share one allocation routine.
//!
//! Nodes are shared between areas — across address spaces after a
//! copy-on-write fork, and briefly within one address space while a
//! copy-on-write split replaces an area — so they are handed around as
//! `Arc<VmNode>`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use config::mm::{NODE_MAX_PAGES, PAGE_SIZE};
use mm::address::PhysAddr;
use mm::frame::FrameTracker;
use systype::{VmError, VmResult};

use crate::backing::BackingFile;

/// How a node provides its initial page contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// File contents are read once, when the node is constructed.
    Eager,
    /// File contents are read at fault time.
    OnDemand,
}

/// The file region backing a node.
pub struct Backing {
    /// Handle to the backing store; cloning duplicates the handle.
    pub file: Arc<dyn BackingFile>,
    /// Byte offset of the region inside the file.
    pub offset: usize,
    /// Length of the region in bytes. Pages beyond it stay zero-filled.
    pub len: usize,
}

impl Clone for Backing {
    fn clone(&self) -> Self {
        Backing {
            file: Arc::clone(&self.file),
            offset: self.offset,
            len: self.len,
        }
    }
}

/// One empty-or-published page slot. Holds the frame's physical address,
/// or zero while empty.
struct PageSlot(AtomicUsize);

/// A fixed-capacity array of page frames, optionally backed by a file
/// region.
pub struct VmNode {
    kind: NodeKind,
    backing: Option<Backing>,
    pages: Box<[PageSlot]>,
}

impl VmNode {
    /// Creates a node of `npages` pages.
    ///
    /// An [`Eager`](NodeKind::Eager) node with backing allocates all of its
    /// pages and loads the file region immediately; every other
    /// combination starts with all slots empty.
    ///
    /// # Errors
    /// [`VmError::OutOfCapacity`] if `npages` exceeds the per-node ceiling,
    /// [`VmError::OutOfMemory`] or [`VmError::Io`] if the eager
    /// allocate-and-load fails.
    pub fn new(npages: usize, kind: NodeKind, backing: Option<Backing>) -> VmResult<Self> {
        debug_assert!(npages > 0);
        if npages > NODE_MAX_PAGES {
            return Err(VmError::OutOfCapacity);
        }
        let pages = (0..npages)
            .map(|_| PageSlot(AtomicUsize::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let node = VmNode { kind, backing, pages };
        if node.kind == NodeKind::Eager && node.backing.is_some() {
            node.alloc_pages()?;
            node.demand_load()?;
        }
        Ok(node)
    }

    /// Number of pages the node carries.
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    /// Whether the node loads its backing region at fault time.
    pub fn is_on_demand(&self) -> bool {
        self.kind == NodeKind::OnDemand
    }

    /// The frame behind page `index`, if one has been published.
    pub fn page(&self, index: usize) -> Option<PhysAddr> {
        let raw = self.pages[index].0.load(Ordering::Acquire);
        (raw != 0).then(|| PhysAddr::new(raw))
    }

    /// Ensures every slot holds a frame.
    ///
    /// Empty slots get a zeroed frame published by CAS; a thread that loses
    /// the race frees its speculative frame. Idempotent.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] once the allocator runs dry, leaving the
    /// node half-filled. Callers must tolerate that state; a later call can
    /// complete the node.
    pub fn alloc_pages(&self) -> VmResult<()> {
        for slot in self.pages.iter() {
            if slot.0.load(Ordering::Acquire) != 0 {
                continue;
            }
            let frame = FrameTracker::build_zeroed()?;
            let pa = frame.ppn().address().to_usize();
            match slot
                .0
                .compare_exchange(0, pa, Ordering::AcqRel, Ordering::Acquire)
            {
                // Published: the slot owns the frame from here on.
                Ok(_) => {
                    frame.leak();
                }
                // Another thread published first; drop ours back to the
                // allocator.
                Err(_) => drop(frame),
            }
        }
        Ok(())
    }

    /// Reads the backing region into the node's pages.
    ///
    /// A no-op for anonymous nodes. The affected pages must already be
    /// allocated. Tail bytes of the last page beyond the region keep the
    /// zero fill from allocation.
    ///
    /// Concurrent loads overwrite each other with identical bytes and are
    /// harmless; a file that changes underneath a live mapping is a hazard
    /// the caller inherits from the backing store.
    ///
    /// # Errors
    /// [`VmError::Io`] on a failed or short read.
    pub fn demand_load(&self) -> VmResult<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let mut done = 0;
        let mut index = 0;
        while done < backing.len {
            let chunk = usize::min(PAGE_SIZE, backing.len - done);
            let pa = self
                .page(index)
                .expect("demand load on an unallocated node page");
            // SAFETY: the slot is published, so the frame stays owned by
            // this node; racing loads write identical bytes (see above).
            let page = unsafe { pa.page_number().as_page_slice_mut() };
            let n = backing.file.read_at(backing.offset + done, &mut page[..chunk])?;
            if n != chunk {
                log::error!(
                    "short read from backing store: wanted {} bytes at {:#x}, got {}",
                    chunk,
                    backing.offset + done,
                    n
                );
                return Err(VmError::Io);
            }
            done += chunk;
            index += 1;
        }
        Ok(())
    }

    /// Produces a deep copy of the node.
    ///
    /// If no page has been published into slot 0 yet, the copy starts
    /// empty and repopulates lazily on fault. Otherwise every published
    /// slot is copied frame-by-frame; empty slots stay empty. An on-demand
    /// node's file handle is duplicated so the copy can still load.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a frame for the copy cannot be
    /// allocated; frames copied so far are released.
    pub fn try_clone(&self) -> VmResult<Self> {
        let pages = (0..self.npages())
            .map(|_| PageSlot(AtomicUsize::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let new = VmNode {
            kind: self.kind,
            backing: self.backing.clone(),
            pages,
        };
        if self.page(0).is_none() {
            return Ok(new);
        }
        for index in 0..self.npages() {
            let Some(src) = self.page(index) else {
                continue;
            };
            let frame = FrameTracker::build()?;
            let dst_ppn = frame.ppn();
            // SAFETY: `src` frames are published and stay owned by `self`;
            // the destination frame is exclusively ours until published.
            unsafe {
                dst_ppn
                    .as_page_slice_mut()
                    .copy_from_slice(src.page_number().as_page_slice());
            }
            // The new node is not shared yet, so a plain publish suffices.
            new.pages[index]
                .0
                .store(frame.leak().address().to_usize(), Ordering::Release);
        }
        Ok(new)
    }
}

impl Drop for VmNode {
    fn drop(&mut self) {
        for slot in self.pages.iter() {
            let raw = slot.0.load(Ordering::Acquire);
            if raw != 0 {
                // SAFETY: the slot published exactly one leaked frame;
                // resuming ownership here frees it.
                drop(unsafe { FrameTracker::from_ppn(PhysAddr::new(raw).page_number()) });
            }
        }
    }
}

impl core::fmt::Debug for VmNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmNode")
            .field("kind", &self.kind)
            .field("npages", &self.npages())
            .field("backed", &self.backing.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, MemFile};

    #[test]
    fn alloc_pages_is_idempotent() {
        test_support::init();
        let node = VmNode::new(3, NodeKind::Eager, None).unwrap();
        assert!(node.page(0).is_none());
        node.alloc_pages().unwrap();
        let first = [node.page(0), node.page(1), node.page(2)];
        node.alloc_pages().unwrap();
        assert_eq!(first, [node.page(0), node.page(1), node.page(2)]);
    }

    #[test]
    fn over_capacity_is_rejected() {
        test_support::init();
        let err = VmNode::new(NODE_MAX_PAGES + 1, NodeKind::Eager, None).unwrap_err();
        assert_eq!(err, VmError::OutOfCapacity);
    }

    #[test]
    fn eager_backing_loads_at_construction() {
        test_support::init();
        let backing = Backing {
            file: Arc::new(MemFile::new(b"hello")),
            offset: 0,
            len: 5,
        };
        let node = VmNode::new(1, NodeKind::Eager, Some(backing)).unwrap();
        let pa = node.page(0).unwrap();
        // SAFETY: the frame is owned by `node` for the whole borrow.
        let bytes = unsafe { pa.page_number().as_page_slice() };
        assert_eq!(&bytes[..5], b"hello");
        assert!(bytes[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn short_read_fails_construction() {
        test_support::init();
        let backing = Backing {
            file: Arc::new(MemFile::new(b"hi")),
            offset: 0,
            len: 5,
        };
        let err = VmNode::new(1, NodeKind::Eager, Some(backing)).unwrap_err();
        assert_eq!(err, VmError::Io);
    }

    #[test]
    fn clone_of_unpopulated_node_copies_nothing() {
        test_support::init();
        let backing = Backing {
            file: Arc::new(MemFile::new(b"abc")),
            offset: 0,
            len: 3,
        };
        let node = VmNode::new(1, NodeKind::OnDemand, Some(backing)).unwrap();
        let copy = node.try_clone().unwrap();
        assert!(copy.page(0).is_none());
        assert!(copy.is_on_demand());
        // The duplicated handle still loads.
        copy.alloc_pages().unwrap();
        copy.demand_load().unwrap();
        let pa = copy.page(0).unwrap();
        // SAFETY: the frame is owned by `copy` for the whole borrow.
        assert_eq!(&unsafe { pa.page_number().as_page_slice() }[..3], b"abc");
    }

    #[test]
    fn clone_of_populated_node_is_deep() {
        test_support::init();
        let node = VmNode::new(2, NodeKind::Eager, None).unwrap();
        node.alloc_pages().unwrap();
        // SAFETY: frames owned by `node`; no concurrent access in this test.
        unsafe {
            node.page(0).unwrap().page_number().as_page_slice_mut()[0] = 0x5a;
        }
        let copy = node.try_clone().unwrap();
        assert_ne!(copy.page(0), node.page(0));
        // SAFETY: as above, for `copy`.
        let copied = unsafe { copy.page(0).unwrap().page_number().as_page_slice() };
        assert_eq!(copied[0], 0x5a);
        // Writes to the copy do not reach the original.
        // SAFETY: as above.
        unsafe {
            copy.page(0).unwrap().page_number().as_page_slice_mut()[0] = 0xa5;
        }
        let original = unsafe { node.page(0).unwrap().page_number().as_page_slice() };
        assert_eq!(original[0], 0x5a);
    }
}
