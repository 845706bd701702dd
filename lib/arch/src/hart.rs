//! Hart identity, for diagnostics.
//!
//! The scheduler layer owns per-hart state; this subsystem only needs an
//! identifier for log lines. The enclosing kernel registers the real
//! accessor at SMP bring-up; until then every caller is hart 0.

use core::sync::atomic::{AtomicUsize, Ordering};

static ID_SOURCE: AtomicUsize = AtomicUsize::new(0);

/// Registers the accessor that reports the calling hart's id.
pub fn register_id_source(source: fn() -> usize) {
    ID_SOURCE.store(source as usize, Ordering::Release);
}

/// Id of the calling hart.
pub fn hart_id() -> usize {
    let raw = ID_SOURCE.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    // SAFETY: the value was stored from a `fn() -> usize` in
    // `register_id_source`.
    let source: fn() -> usize = unsafe { core::mem::transmute(raw) };
    source()
}
