//! Error kinds of the virtual-memory subsystem.

use core::fmt::{self, Display};

/// Type alias for results of subsystem operations.
pub type VmResult<T> = Result<T, VmError>;

/// Failure conditions surfaced by the virtual-memory subsystem.
///
/// Only conditions a caller can act on are represented here. Conditions that
/// indicate a broken kernel invariant inside the page-fault path do not
/// return an error; they panic, because masking them would hide bugs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmError {
    /// A frame or kernel-object allocation failed.
    OutOfMemory,
    /// A backing node was asked to carry more pages than a node may hold.
    OutOfCapacity,
    /// The requested range overlaps an existing mapping.
    Overlap,
    /// An unmap request covers only part of a mapping.
    PartialUnmap,
    /// The address range is unmapped, wraps, or is otherwise unusable.
    BadAddress,
    /// The backing store failed or returned a short read.
    Io,
    /// The access cannot be resolved; the faulting task must be terminated.
    Fatal,
}

impl Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::OutOfCapacity => write!(f, "node page count over the ceiling"),
            VmError::Overlap => write!(f, "range overlaps an existing mapping"),
            VmError::PartialUnmap => write!(f, "unmap covers part of a mapping"),
            VmError::BadAddress => write!(f, "bad address"),
            VmError::Io => write!(f, "backing store I/O error"),
            VmError::Fatal => write!(f, "unresolvable access"),
        }
    }
}
