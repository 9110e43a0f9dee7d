//! # Address Space (x86-64, PML4-rooted)
//!
//! A handle to one page-table tree, used to install mappings and translate
//! addresses. Intermediate tables are allocated on demand from a
//! [`FrameAlloc`] and reached through a [`PhysMapper`].
//!
//! ## Design
//!
//! - Links to intermediate tables are created present + writable,
//!   supervisor-only.
//! - Leaves are present + writable; 2 MiB leaves additionally carry the
//!   page-size bit at PML2.
//! - Installing a mapping over an existing one overwrites the entry. No TLB
//!   invalidation is performed; callers that modify the active tree must
//!   `invlpg` or reload CR3 themselves.
//! - Descending through a PML2 entry that holds a 2 MiB leaf replaces the leaf
//!   with a fresh PML1 table.

use crate::page_table::{PageTable, PageTableEntry, PageTableIndices, TableIndex, TableLevel};
use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};
use log::trace;

/// The PML4 frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Size of the leaf installed by [`AddressSpace::map_one`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapSize {
    /// 4 KiB leaf in a PML1 table.
    Page4K,
    /// 2 MiB leaf in a PML2 table.
    Large2M,
}

impl MapSize {
    #[must_use]
    pub const fn from_large(use_large_page: bool) -> Self {
        if use_large_page {
            Self::Large2M
        } else {
            Self::Page4K
        }
    }
}

/// Failure to install a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for an intermediate table; no leaf was written.
    #[error("out of memory allocating a {0} table")]
    OutOfMemory(TableLevel),
}

/// Handle to a single page-table tree.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and clear a fresh PML4.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available for the root.
    pub fn new<A: FrameAlloc>(mapper: &'m M, alloc: &A) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(TableLevel::Pml4))?;
        let aspace = Self { root, mapper };
        aspace.table_mut(root).zero();
        trace!("allocated PML4 at {root}");
        Ok(aspace)
    }

    /// Attach to an existing tree.
    ///
    /// # Safety
    /// `root` and every table reachable from it must be page tables owned by
    /// the caller and writable through `mapper`.
    #[inline]
    #[must_use]
    pub const unsafe fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the PML4.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Borrow the table stored in `frame`.
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: frames handled here are the root or tables linked from it,
        // which the constructors guarantee are writable through the mapper.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Read-only view of the table stored in `frame`, for inspection.
    ///
    /// # Safety
    /// `frame` must be a table of this tree.
    #[must_use]
    pub unsafe fn table(&self, frame: PhysicalPage<Size4K>) -> &PageTable {
        self.table_mut(frame)
    }

    /// Follow `parent[index]` to the next table, allocating it if missing.
    fn next_table<A: FrameAlloc>(
        &self,
        alloc: &A,
        parent: PhysicalPage<Size4K>,
        index: TableIndex,
        level: TableLevel,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let entry = self.table_mut(parent).entry(index);
        if entry.is_table() {
            return Ok(entry.frame());
        }

        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory(level))?;
        self.table_mut(frame).zero();
        self.table_mut(parent)
            .set(index, PageTableEntry::table(frame));
        trace!("allocated {level} table at {frame}");
        Ok(frame)
    }

    /// Map **one** page at `va → pa`.
    ///
    /// For [`MapSize::Large2M`] the 2 MiB region containing `va` maps onto the
    /// 2 MiB region containing `pa`; for [`MapSize::Page4K`] the same holds
    /// at 4 KiB granularity.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if an intermediate table could not be
    /// allocated. Tables allocated before the failure stay linked.
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: MapSize,
    ) -> Result<(), MapError> {
        let idx = PageTableIndices::of(va);

        let pml3 = self.next_table(alloc, self.root, idx.pml4, TableLevel::Pml3)?;
        let pml2 = self.next_table(alloc, pml3, idx.pml3, TableLevel::Pml2)?;

        match size {
            MapSize::Large2M => {
                self.table_mut(pml2)
                    .set(idx.pml2, PageTableEntry::large_leaf(pa.page::<Size2M>()));
            }
            MapSize::Page4K => {
                let pml1 = self.next_table(alloc, pml2, idx.pml2, TableLevel::Pml1)?;
                self.table_mut(pml1)
                    .set(idx.pml1, PageTableEntry::leaf(pa.page::<Size4K>()));
            }
        }
        Ok(())
    }

    /// The leaf entry translating `va` and its size, if mapped.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<(PageTableEntry, MapSize)> {
        let idx = PageTableIndices::of(va);

        let e4 = self.table_mut(self.root).entry(idx.pml4);
        if !e4.is_table() {
            return None;
        }
        let e3 = self.table_mut(e4.frame()).entry(idx.pml3);
        if !e3.is_table() {
            return None;
        }
        let e2 = self.table_mut(e3.frame()).entry(idx.pml2);
        if !e2.present() {
            return None;
        }
        if e2.page_size() {
            return Some((e2, MapSize::Large2M));
        }
        let e1 = self.table_mut(e2.frame()).entry(idx.pml1);
        e1.present().then_some((e1, MapSize::Page4K))
    }

    /// Translate a `VirtualAddress` to a `PhysicalAddress` if mapped,
    /// keeping the in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (entry, size) = self.leaf(va)?;
        Some(match size {
            MapSize::Large2M => entry.large_page().join(va.offset::<Size2M>()),
            MapSize::Page4K => entry.frame().join(va.offset::<Size4K>()),
        })
    }
}
