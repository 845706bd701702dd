//! Page tables: the hardware side of an address space.
//!
//! A [`PageTable`] owns the root of a 4-level table tree and every table
//! frame below it. Leaf entries are mutated only through the CAS/LOCK
//! discipline of [`arch::pte`]; intermediate entries are installed once by
//! CAS and never changed afterwards, so walks need no locking at all.
//!
//! The top half of the root table is shared kernel state: it is copied
//! from a global template when an address space is created, the way every
//! process maps the same kernel image.

use alloc::vec::Vec;

use arch::pte::{Pte, PteFlags};
use config::mm::{PAGE_SIZE, PTE_PER_TABLE};
use mm::address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use mm::frame::FrameTracker;
use spin::Mutex;
use systype::VmResult;

lazy_static::lazy_static! {
    /// Template whose top half every address space shares.
    ///
    /// A bare-metal port fills it with the kernel image and direct-map
    /// entries at boot; the simulated machine reaches memory directly and
    /// leaves it empty, which still exercises the sharing path.
    static ref KERNEL_TEMPLATE: PageTable =
        PageTable::build().expect("out of memory building the kernel template");
}

/// A 4-level page table and the frames backing it.
pub struct PageTable {
    /// Physical page number of the root table.
    root: PhysPageNum,
    /// Frames allocated for the tables themselves.
    frames: Mutex<Vec<FrameTracker>>,
}

impl PageTable {
    /// Builds a `PageTable` with an empty, zeroed root table.
    ///
    /// # Errors
    /// Returns [`OutOfMemory`](systype::VmError::OutOfMemory) if the root
    /// frame cannot be allocated.
    pub fn build() -> VmResult<Self> {
        let root_frame = FrameTracker::build_zeroed()?;
        let root = root_frame.ppn();
        Ok(PageTable {
            root,
            frames: Mutex::new(alloc::vec![root_frame]),
        })
    }

    /// Physical page number of the root table.
    pub fn root(&self) -> PhysPageNum {
        self.root
    }

    /// Copies the shared kernel half of the root table from the global
    /// template. Called once per address space, before any other mapping.
    pub fn map_kernel(&self) {
        let src = TableMem::new(KERNEL_TEMPLATE.root).as_slice();
        let dst = TableMem::new(self.root).as_slice();
        for index in PTE_PER_TABLE / 2..PTE_PER_TABLE {
            dst[index].store(src[index].load());
        }
    }

    /// Returns the leaf entry mapping `vpn`, if every table on the path
    /// exists. The entry itself may be zero.
    pub fn walk(&self, vpn: VirtPageNum) -> Option<&Pte> {
        let mut ppn = self.root;
        let indices = vpn.indices();
        for (level, &index) in indices.iter().enumerate().rev() {
            let entry = &TableMem::new(ppn).as_slice()[index];
            if level == 0 {
                return Some(entry);
            }
            let value = entry.load();
            if value & PteFlags::P.bits() == 0 {
                return None;
            }
            ppn = PhysAddr::new(Pte::pa_of(value)).page_number();
        }
        unreachable!();
    }

    /// Returns the leaf entry mapping `vpn`, materializing intermediate
    /// tables as needed.
    ///
    /// Concurrent walkers may race to create the same table; the loser's
    /// frame goes back to the allocator. Installed intermediate entries
    /// are immutable, so the winner's table is safe to descend immediately.
    ///
    /// # Errors
    /// Returns [`OutOfMemory`](systype::VmError::OutOfMemory) if a table
    /// frame cannot be allocated.
    pub fn walk_create(&self, vpn: VirtPageNum) -> VmResult<&Pte> {
        let inner_flags = PteFlags::P | PteFlags::W | PteFlags::U;
        let mut ppn = self.root;
        let indices = vpn.indices();
        for (level, &index) in indices.iter().enumerate().rev() {
            let entry = &TableMem::new(ppn).as_slice()[index];
            if level == 0 {
                return Ok(entry);
            }
            loop {
                let value = entry.load();
                if value & PteFlags::P.bits() != 0 {
                    ppn = PhysAddr::new(Pte::pa_of(value)).page_number();
                    break;
                }
                let frame = FrameTracker::build_zeroed()?;
                let next = frame.ppn();
                let installed =
                    Pte::make(next.address().to_usize(), inner_flags);
                if entry.try_set(value, installed) {
                    self.frames.lock().push(frame);
                    ppn = next;
                    break;
                }
                // Lost the race; the frame returns to the allocator and the
                // reload sees the winner's table.
                drop(frame);
            }
        }
        unreachable!();
    }

    /// Applies `transform` to every already-materialized leaf entry
    /// covering `[start, end)` under the CAS/LOCK discipline, and reports
    /// whether any entry held a non-zero value before its transform.
    ///
    /// Entries whose tables were never materialized are zero for every
    /// transform this subsystem applies (clearing and permission
    /// downgrades), so absent tables are skipped rather than allocated.
    pub fn update_pages<F>(&self, start: VirtAddr, end: VirtAddr, mut transform: F) -> bool
    where
        F: FnMut(u64) -> u64,
    {
        debug_assert!(start.is_aligned() && end.is_aligned());
        let mut any_mapped = false;
        let mut va = start;
        while va < end {
            if let Some(pte) = self.walk(va.page_number()) {
                let old = pte.update(&mut transform);
                if old != 0 {
                    any_mapped = true;
                }
            }
            va = VirtAddr::new(va.to_usize() + PAGE_SIZE);
        }
        any_mapped
    }

    /// Installs a kernel mapping `va -> pa` with `flags`.
    ///
    /// Used for the per-address-space kernel-shared page. The entry must
    /// not be present yet.
    pub fn map_kernel_page(&self, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> VmResult<()> {
        debug_assert!(va.is_aligned() && pa.page_offset() == 0);
        let pte = self.walk_create(va.page_number())?;
        debug_assert_eq!(pte.load(), 0, "kernel page mapped twice");
        pte.store(Pte::make(pa.to_usize(), flags));
        Ok(())
    }
}

impl core::fmt::Debug for PageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTable")
            .field("root", &self.root)
            .field("frames", &self.frames.lock().len())
            .finish()
    }
}

/// A borrowed view of one table page through the kernel direct map.
struct TableMem {
    ppn: PhysPageNum,
}

impl TableMem {
    fn new(ppn: PhysPageNum) -> Self {
        TableMem { ppn }
    }

    fn as_slice(&self) -> &'static [Pte; PTE_PER_TABLE] {
        // SAFETY: the page `ppn` points to is an allocated table page, and
        // `Pte` entries are interiorly mutable, so shared references are
        // the only kind ever formed.
        unsafe { &*(self.ppn.address().to_kernel() as *const [Pte; PTE_PER_TABLE]) }
    }
}

// One table page holds exactly PTE_PER_TABLE entries.
const _: () = assert!(core::mem::size_of::<Pte>() * PTE_PER_TABLE == PAGE_SIZE);
