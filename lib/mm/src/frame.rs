//! Module for managing allocatable frames (physical pages).
//!
//! An "allocatable frame" is a frame inside the RAM window that is not part
//! of the kernel image. Frames are tracked by [`FrameTracker`]: constructing
//! one allocates a frame, dropping it deallocates the frame.
//!
//! Backing nodes publish frames into lock-free slots by compare-and-swap,
//! at which point RAII ownership no longer fits; [`FrameTracker::leak`] and
//! [`FrameTracker::from_ppn`] convert between tracked and raw ownership at
//! that boundary.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bitmap_allocator::{BitAlloc, BitAlloc64K};
use spin::Mutex;

use config::mm::{PAGE_SIZE, ram_end_phys, ram_start_phys};
use systype::{VmError, VmResult};

use crate::address::{PhysAddr, PhysPageNum};

/// Global frame allocator. It allocates and deallocates allocatable frames.
///
/// It is protected by a lock to be used in a multi-threaded environment.
static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator {
    allocator: Mutex::new(BitAlloc64K::DEFAULT),
    offset: AtomicUsize::new(0),
    inited: AtomicBool::new(false),
};

/// Frame allocator type.
struct FrameAllocator {
    /// Bitmap allocator.
    allocator: Mutex<BitAlloc64K>,
    /// Offset between PPNs and bit indices.
    offset: AtomicUsize,
    /// Whether the RAM window has been handed to the allocator.
    inited: AtomicBool,
}

impl FrameAllocator {
    /// Gets the offset between PPNs and bit indices.
    fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }
}

/// Initializes the frame allocator over the machine's RAM window.
///
/// Idempotent; only the first call hands the window to the allocator.
pub fn init_frame_allocator() {
    if FRAME_ALLOCATOR.inited.swap(true, Ordering::AcqRel) {
        return;
    }
    let frames_ppn_start = PhysAddr::new(ram_start_phys()).page_number().to_usize();
    let frames_ppn_end = PhysAddr::new(ram_end_phys()).page_number().to_usize();
    let frame_count = frames_ppn_end - frames_ppn_start;
    FRAME_ALLOCATOR
        .offset
        .store(frames_ppn_start, Ordering::Release);
    FRAME_ALLOCATOR.allocator.lock().insert(0..frame_count);
    log::debug!(
        "frame allocator: allocatable frames from {:#x} - {:#x}",
        frames_ppn_start * PAGE_SIZE,
        frames_ppn_end * PAGE_SIZE
    );
}

/// RAII guard for an allocatable frame.
///
/// Constructing a value of this type will allocate a frame from the frame
/// allocator, and the frame will be deallocated when this guard is dropped.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameTracker {
    /// Physical page number of the frame.
    ppn: PhysPageNum,
}

impl FrameTracker {
    /// Allocates a frame.
    ///
    /// The frame's previous contents are unspecified; callers that publish
    /// the frame must zero it first.
    ///
    /// # Errors
    /// Returns [`VmError::OutOfMemory`] if there are no free frames.
    pub fn build() -> VmResult<Self> {
        FRAME_ALLOCATOR
            .allocator
            .lock()
            .alloc()
            .map(|i| FrameTracker {
                ppn: PhysPageNum::new(FRAME_ALLOCATOR.offset() + i),
            })
            .ok_or(VmError::OutOfMemory)
    }

    /// Allocates a frame and fills it with zeroes.
    ///
    /// # Errors
    /// Returns [`VmError::OutOfMemory`] if there are no free frames.
    pub fn build_zeroed() -> VmResult<Self> {
        let frame = Self::build()?;
        // SAFETY: the frame was just allocated and is not yet shared.
        unsafe {
            frame.ppn.as_page_slice_mut().fill(0);
        }
        Ok(frame)
    }

    /// Gets the physical page number of the frame.
    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    /// Gives up RAII ownership of the frame and returns its page number.
    ///
    /// The caller becomes responsible for eventually reconstructing a
    /// tracker with [`FrameTracker::from_ppn`] so the frame is freed.
    pub fn leak(self) -> PhysPageNum {
        let ppn = self.ppn;
        core::mem::forget(self);
        ppn
    }

    /// Resumes RAII ownership of a frame previously released with
    /// [`FrameTracker::leak`].
    ///
    /// # Safety
    /// `ppn` must have come from `leak`, and ownership must not be resumed
    /// twice.
    pub unsafe fn from_ppn(ppn: PhysPageNum) -> Self {
        FrameTracker { ppn }
    }
}

impl Drop for FrameTracker {
    /// Deallocate the frame.
    fn drop(&mut self) {
        FRAME_ALLOCATOR
            .allocator
            .lock()
            .dealloc(self.ppn.to_usize() - FRAME_ALLOCATOR.offset());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_distinct_and_leak_round_trips() {
        init_frame_allocator();
        let f1 = FrameTracker::build().unwrap();
        let f2 = FrameTracker::build().unwrap();
        assert_ne!(f1.ppn(), f2.ppn());

        let ppn = f2.leak();
        // SAFETY: `ppn` came from `leak` and ownership is resumed once.
        let f2 = unsafe { FrameTracker::from_ppn(ppn) };
        assert_eq!(f2.ppn(), ppn);
    }

    #[test]
    fn build_zeroed_clears_the_frame() {
        init_frame_allocator();
        let frame = FrameTracker::build_zeroed().unwrap();
        // SAFETY: the frame is owned by `frame` for the whole borrow.
        let bytes = unsafe { frame.ppn().as_page_slice() };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
