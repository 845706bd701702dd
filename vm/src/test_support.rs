//! Shared fixtures for the test suite.
//!
//! The tests run against the simulated machine: the frame allocator is
//! backed by a reserved RAM window in the host process and the direct map
//! is the identity. `read_user` and `write_user` stand in for the MMU —
//! a write resolves the address through the fault handler until the entry
//! is writable, then stores through the translation, exactly as a user
//! instruction would after a trap.

use alloc::sync::Arc;
use alloc::vec::Vec;

use arch::pte::{FaultCode, Pte, PteFlags};
use config::mm::PAGE_SIZE;
use mm::address::{PhysAddr, VirtAddr};
use systype::{VmError, VmResult};

use crate::addr_space::AddressSpace;
use crate::backing::BackingFile;
use crate::vm_area::{VmArea, VmaFlags};
use crate::vm_node::{NodeKind, VmNode};

/// One-time setup of the simulated machine.
pub(crate) fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        logger::init(|args| eprint!("{}", args));
        mm::frame::init_frame_allocator();
    });
}

/// An in-memory backing file.
pub(crate) struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub(crate) fn new(data: &[u8]) -> Self {
        MemFile { data: data.to_vec() }
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> VmResult<usize> {
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = usize::min(buf.len(), self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

/// A fresh private area of `npages` anonymous pages at `start`.
pub(crate) fn area_of_pages(start: usize, npages: usize) -> VmArea {
    let node = Arc::new(VmNode::new(npages, NodeKind::Eager, None).unwrap());
    VmArea::new(
        VirtAddr::new(start),
        VirtAddr::new(start + npages * PAGE_SIZE),
        VmaFlags::PRIVATE,
        node,
    )
}

/// Reads `len` bytes at `va` the way the kernel would: through the areas
/// and their node pages. Panics on unmapped or never-faulted addresses.
pub(crate) fn read_user(space: &AddressSpace, va: VirtAddr, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut cur = va;
    while out.len() < len {
        let guard = space.pin();
        let area = space.lookup(cur, 1, &guard).expect("read_user: unmapped");
        let pa = area
            .node()
            .page(area.page_index(cur))
            .expect("read_user: page not present");
        let offset = cur.page_offset();
        let n = usize::min(PAGE_SIZE - offset, len - out.len());
        // SAFETY: the slot is published, so the frame belongs to the node.
        out.extend_from_slice(unsafe { &pa.page_number().as_page_slice()[offset..offset + n] });
        cur = VirtAddr::new(cur.to_usize() + n);
    }
    out
}

/// Writes `bytes` at `va` the way a user instruction would: resolve
/// through the fault handler until the entry is writable, then store
/// through the translation.
pub(crate) fn write_user(space: &AddressSpace, va: VirtAddr, bytes: &[u8]) {
    let writable = (PteFlags::P | PteFlags::U | PteFlags::W).bits();
    for (i, &byte) in bytes.iter().enumerate() {
        let va = VirtAddr::new(va.to_usize() + i);
        loop {
            match space.pagefault(va, FaultCode::WRITE) {
                Ok(_) => {}
                Err(VmError::Fatal) => panic!("write_user: fatal fault at {:#x}", va.to_usize()),
                Err(e) => panic!("write_user: {:?}", e),
            }
            let pte = space
                .page_table()
                .walk(va.page_number())
                .expect("write_user: no entry after a fixed fault");
            let value = pte.load();
            if value & writable == writable {
                let pa = PhysAddr::new(Pte::pa_of(value));
                // SAFETY: the entry maps a published node page owned by a
                // live area of `space`.
                unsafe {
                    pa.page_number().as_page_slice_mut()[va.page_offset()] = byte;
                }
                break;
            }
            // Resolved read-only (copy-on-write split in progress on
            // another hart); fault again.
        }
    }
}
