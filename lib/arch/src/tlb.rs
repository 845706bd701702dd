//! TLB maintenance.
//!
//! The MMU caches translations per hart; after software rewrites a page
//! table entry it must force re-observation with a flush. On the simulated
//! machine the flush is a full fence plus an observable counter; on bare
//! metal it additionally touches the hardware.

use core::sync::atomic::{AtomicUsize, Ordering, fence};

static FLUSH_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Full memory fence, ordering page-table stores before a flush.
pub fn mem_fence() {
    fence(Ordering::SeqCst);
}

/// Flushes the current hart's cached translations.
pub fn tlb_flush() {
    mem_fence();
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: reloading CR3 with its current value only drops cached
    // non-global translations.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
    FLUSH_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Flushes cached translations on every hart.
///
/// The simulated machine has a coherent, uncached "TLB", so this is the
/// local flush; a bare-metal port sends shootdown IPIs here.
pub fn tlb_shootdown_all() {
    tlb_flush();
}

/// Number of flushes issued so far. Diagnostic, used by the test suite to
/// observe the flush contract.
pub fn flush_count() -> usize {
    FLUSH_COUNT.load(Ordering::Relaxed)
}
