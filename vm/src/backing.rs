//! The backing-store seam of the subsystem.
//!
//! File-backed nodes read their initial contents through this trait; the
//! file system behind it is not this subsystem's concern. Handles are
//! shared as `Arc<dyn BackingFile>`: cloning the `Arc` duplicates the
//! handle, dropping the last clone releases it.

use systype::VmResult;

/// A random-access, read-only view of a backing store.
pub trait BackingFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset` into `buf` and
    /// returns how many bytes were read. Reading at or past the end of the
    /// file returns `Ok(0)`.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> VmResult<usize>;
}
