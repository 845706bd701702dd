//! Page table entries and their atomic mutation protocol.
//!
//! A page table entry is shared between the MMU, which walks tables without
//! any software coordination, and kernel threads on every hart. Software
//! mutators therefore follow one discipline, [`Pte::update`]:
//!
//! 1. load the entry;
//! 2. if the [`LOCK`] bit is set, another thread is rewriting the entry
//!    non-atomically — reload and retry;
//! 3. apply the intended transition with a single compare-and-swap against
//!    the observed value, restarting from step 1 on failure.
//!
//! A thread that wins a CAS installing [`LOCK`] owns the entry and may
//! rewrite it with a plain [`Pte::store`] until it clears the bit again.
//! Lock windows must stay short; the only holder in this subsystem is the
//! fault handler while it publishes a new translation.
//!
//! [`LOCK`]: PteFlags::LOCK

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use crossbeam_utils::Backoff;

/// Mask of the physical-frame bits in a page table entry.
pub const PTE_PA_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// Flags of a 4-level page table entry.
    ///
    /// `P`, `W`, `U`, `A`, `D` and `G` are interpreted by the MMU. `LOCK`
    /// and `COW` live in entry bits the hardware ignores and never sets;
    /// they belong entirely to this subsystem.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Global.
        const G = 1 << 8;
        /// Software: one thread holds exclusive access to this entry.
        const LOCK = 1 << 9;
        /// Software: the frame is shared copy-on-write; a write must
        /// upgrade the mapping.
        const COW = 1 << 10;
    }
}

bitflags! {
    /// Hardware error code delivered with a page fault.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// The fault was caused by a protection violation on a present
        /// entry, not by a non-present entry.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access came from user mode.
        const USER = 1 << 2;
    }
}

impl FaultCode {
    /// Whether the faulting access was a write.
    pub fn is_write(self) -> bool {
        self.contains(FaultCode::WRITE)
    }
}

/// One page table entry, mutated only through atomics.
///
/// The MMU reads entries concurrently with software, so an entry is never
/// given out as `&mut u64`; all access goes through this cell.
#[repr(transparent)]
pub struct Pte(AtomicU64);

impl Pte {
    /// An empty (non-present) entry.
    pub const fn empty() -> Self {
        Pte(AtomicU64::new(0))
    }

    /// Builds the raw value of a leaf entry from a frame address and flags.
    pub fn make(pa: usize, flags: PteFlags) -> u64 {
        debug_assert_eq!(pa as u64 & !PTE_PA_MASK, 0, "unaligned or oversized frame address");
        pa as u64 | flags.bits()
    }

    /// Loads the current raw value.
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Installs `new` if the entry still holds `old`.
    ///
    /// This is the single-CAS step of the mutation discipline; callers must
    /// have observed `old` without the `LOCK` bit.
    pub fn try_set(&self, old: u64, new: u64) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Plain store. Only valid while the calling thread holds the `LOCK`
    /// bit of this entry, or before the table page is reachable by others.
    pub fn store(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    /// Applies `transform` to the entry under the mutation discipline and
    /// returns the value that was replaced.
    ///
    /// Spins while the entry is locked. `transform` may run several times
    /// and must be pure; returning the observed value makes the call a
    /// no-op for that observation.
    pub fn update<F>(&self, mut transform: F) -> u64
    where
        F: FnMut(u64) -> u64,
    {
        let backoff = Backoff::new();
        loop {
            let old = self.load();
            if old & PteFlags::LOCK.bits() != 0 {
                backoff.spin();
                continue;
            }
            let new = transform(old);
            if new == old {
                return old;
            }
            if self.try_set(old, new) {
                return old;
            }
            backoff.spin();
        }
    }

    /// Extracts the frame address of a raw entry value.
    pub fn pa_of(value: u64) -> usize {
        (value & PTE_PA_MASK) as usize
    }

    /// Extracts the flags of a raw entry value.
    pub fn flags_of(value: u64) -> PteFlags {
        PteFlags::from_bits_truncate(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_splits_back_into_pa_and_flags() {
        let v = Pte::make(0x1234_5000, PteFlags::P | PteFlags::U | PteFlags::COW);
        assert_eq!(Pte::pa_of(v), 0x1234_5000);
        assert_eq!(Pte::flags_of(v), PteFlags::P | PteFlags::U | PteFlags::COW);
    }

    #[test]
    fn update_applies_cas_transition() {
        let pte = Pte::empty();
        let old = pte.update(|v| v | PteFlags::P.bits());
        assert_eq!(old, 0);
        assert_eq!(pte.load(), PteFlags::P.bits());
        // Identity transform leaves the entry untouched.
        let old = pte.update(|v| v);
        assert_eq!(old, PteFlags::P.bits());
    }

    #[test]
    fn update_waits_for_the_lock_holder() {
        use std::sync::Arc;

        let pte = Arc::new(Pte::empty());
        let locked = Pte::make(0x8000, PteFlags::P | PteFlags::U | PteFlags::LOCK);
        assert!(pte.try_set(0, locked));

        let contender = {
            let pte = Arc::clone(&pte);
            std::thread::spawn(move || pte.update(|v| v | PteFlags::W.bits()))
        };
        // Let the contender reach the spin loop, then release the lock.
        std::thread::sleep(std::time::Duration::from_millis(20));
        pte.store(locked & !PteFlags::LOCK.bits());
        let observed = contender.join().unwrap();
        assert_eq!(observed & PteFlags::LOCK.bits(), 0);
        assert_eq!(
            pte.load(),
            Pte::make(0x8000, PteFlags::P | PteFlags::U | PteFlags::W)
        );
    }
}
