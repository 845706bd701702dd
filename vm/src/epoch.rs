//! Epoch-based reclamation for lock-free readers.
//!
//! The range map hands out references to entries without taking a lock, so
//! an entry that has been unlinked cannot be freed until every reader that
//! may have observed it is gone. Readers enter an epoch critical section by
//! pinning ([`EpochReclaimer::pin`]); writers unlink an entry and then
//! [`retire`](EpochReclaimer::retire) it while themselves pinned.
//!
//! The scheme counts pinned readers per epoch parity and keeps three limbo
//! bins of retired objects, binned by retirement epoch modulo 3. The global
//! epoch `e` may advance to `e + 1` only when no reader from epoch `e - 1`
//! is still pinned; at that moment every object retired in epoch `e - 2` is
//! unobservable (all readers that could have seen it unpinned before the
//! epoch reached `e`, and readers pinned since then started after the
//! unlink became visible), so its bin is freed.
//!
//! Unlike per-thread epoch schemes this one needs no participant
//! registration, which keeps it usable from any kernel thread on any hart
//! at the cost of one shared counter increment per pin.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// Deferred-destruction domain for objects of type `T`.
pub struct EpochReclaimer<T> {
    /// Global epoch.
    epoch: AtomicUsize,
    /// Pinned-reader counts, indexed by epoch parity.
    readers: [AtomicUsize; 2],
    /// Retired objects, binned by retirement epoch modulo 3. Held as raw
    /// pointers: readers may still hold references into the pointees, so
    /// no `Box` is materialized until the grace period has elapsed.
    limbo: [Mutex<Vec<*mut T>>; 3],
}

// SAFETY: the pointers in limbo are uniquely owned garbage awaiting
// destruction; they are never dereferenced through the reclaimer.
unsafe impl<T: Send> Send for EpochReclaimer<T> {}
unsafe impl<T: Send> Sync for EpochReclaimer<T> {}

/// An epoch critical section.
///
/// While a guard is alive, every object reachable when [`pin`] returned
/// stays allocated, even if a writer retires it concurrently.
///
/// [`pin`]: EpochReclaimer::pin
pub struct EpochGuard<'a, T> {
    reclaimer: &'a EpochReclaimer<T>,
    epoch: usize,
}

impl<T> EpochReclaimer<T> {
    pub const fn new() -> Self {
        EpochReclaimer {
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            limbo: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    /// Enters an epoch critical section.
    pub fn pin(&self) -> EpochGuard<'_, T> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            self.readers[epoch & 1].fetch_add(1, Ordering::SeqCst);
            // The count must be registered against the still-current epoch;
            // if the epoch moved underneath us the registration may be in
            // the wrong parity, so undo and retry.
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return EpochGuard { reclaimer: self, epoch };
            }
            self.readers[epoch & 1].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Hands an unlinked object to the reclaimer for deferred destruction.
    ///
    /// The caller must have made the object unreachable for new readers
    /// before retiring it, and must still hold the guard it was pinned with
    /// while unlinking.
    pub fn retire(&self, garbage: Box<T>, guard: &EpochGuard<'_, T>) {
        debug_assert!(core::ptr::eq(guard.reclaimer, self));
        self.limbo[guard.epoch % 3].lock().push(Box::into_raw(garbage));
        self.try_advance();
    }

    /// Attempts one epoch advance, freeing the bin that became
    /// unobservable.
    fn try_advance(&self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.readers[(epoch + 1) & 1].load(Ordering::SeqCst) != 0 {
            return;
        }
        // The bin lock is taken before publishing the new epoch: a reader
        // pinned at `epoch + 1` retires into this same bin index, and must
        // not slip its garbage in front of the drain below.
        let mut bin = self.limbo[(epoch + 1) % 3].lock();
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let garbage = core::mem::take(&mut *bin);
        drop(bin);
        for ptr in garbage {
            // SAFETY: the grace period has elapsed; no reader can still
            // hold a reference into `ptr`, and the pointer came from
            // `Box::into_raw` in `retire`.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }

    /// Drives reclamation to completion from a quiescent point.
    ///
    /// With no guard alive every advance succeeds, so three rounds drain
    /// all bins. Used at teardown and by the test suite; concurrent readers
    /// merely make this a best-effort nudge.
    pub fn settle(&self) {
        for _ in 0..3 {
            self.try_advance();
        }
    }
}

impl<T> Drop for EpochReclaimer<T> {
    fn drop(&mut self) {
        // Exclusive access: no guard can borrow the reclaimer anymore.
        for bin in &self.limbo {
            for ptr in core::mem::take(&mut *bin.lock()) {
                // SAFETY: as in `try_advance`, with exclusivity instead of
                // a grace period.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl<T> Drop for EpochGuard<'_, T> {
    fn drop(&mut self) {
        self.reclaimer.readers[self.epoch & 1].fetch_sub(1, Ordering::SeqCst);
        self.reclaimer.try_advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct Flagged(Arc<AtomicBool>);

    impl Drop for Flagged {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn retired_object_is_freed_after_quiescence() {
        let reclaimer = EpochReclaimer::new();
        let freed = Arc::new(AtomicBool::new(false));
        {
            let guard = reclaimer.pin();
            reclaimer.retire(Box::new(Flagged(Arc::clone(&freed))), &guard);
        }
        reclaimer.settle();
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn pinned_reader_delays_reclamation() {
        let reclaimer = EpochReclaimer::new();
        let freed = Arc::new(AtomicBool::new(false));

        let reader = reclaimer.pin();
        {
            let writer = reclaimer.pin();
            reclaimer.retire(Box::new(Flagged(Arc::clone(&freed))), &writer);
        }
        reclaimer.settle();
        // The reader entered before the retirement; it may still hold a
        // reference, so the object must survive.
        assert!(!freed.load(Ordering::SeqCst));

        drop(reader);
        reclaimer.settle();
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn settle_is_idempotent_when_empty() {
        let reclaimer: EpochReclaimer<Flagged> = EpochReclaimer::new();
        reclaimer.settle();
        reclaimer.settle();
    }
}
