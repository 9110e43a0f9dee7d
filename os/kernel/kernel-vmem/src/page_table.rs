//! # Page Tables
//!
//! The in-memory format the MMU walks: 4 KiB tables of 512 eight-byte
//! entries, and the split of a virtual address into one 9-bit index per level.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_info::memory::PAGE_TABLE_ENTRIES;
use kernel_memory_addresses::{PhysicalPage, Size2M, Size4K, VirtualAddress};

/// One 64-bit entry, identical in layout at every level.
///
/// | Bits   | Field            |
/// |--------|------------------|
/// | 0      | present          |
/// | 1      | writable         |
/// | 2      | user             |
/// | 3      | write-through    |
/// | 4      | cache-disable    |
/// | 5      | accessed         |
/// | 6      | ignored          |
/// | 7      | page size (PML2: 2 MiB leaf) |
/// | 8–11   | ignored          |
/// | 12–51  | frame number     |
/// | 52–63  | reserved         |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    #[bits(1)]
    __: u8,
    /// Only meaningful in a PML2 entry, where it turns the entry into a 2 MiB leaf.
    pub page_size: bool,
    #[bits(4)]
    __: u8,
    /// Physical address bits 51:12.
    #[bits(40)]
    pub frame_number: u64,
    #[bits(12)]
    __: u16,
}

impl PageTableEntry {
    /// Present, writable, supervisor-only link to the next-level table in `frame`.
    #[must_use]
    pub const fn table(frame: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_number(frame.number())
    }

    /// Present, writable 4 KiB leaf for a PML1 table.
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>) -> Self {
        Self::table(frame)
    }

    /// Present, writable 2 MiB leaf for a PML2 table.
    #[must_use]
    pub const fn large_leaf(page: PhysicalPage<Size2M>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_page_size(true)
            .with_frame_number(page.base().as_u64() >> 12)
    }

    /// The 4 KiB frame this entry refers to (table or leaf).
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.frame_number())
    }

    /// The 2 MiB page a large leaf maps.
    #[must_use]
    pub const fn large_page(&self) -> PhysicalPage<Size2M> {
        PhysicalPage::containing(self.frame().base())
    }

    /// Present and pointing at a next-level table (only valid above PML1).
    #[must_use]
    pub const fn is_table(&self) -> bool {
        self.present() && !self.page_size()
    }

    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }
}

/// One 4 KiB page table at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::new(); PAGE_TABLE_ENTRIES],
        }
    }

    /// Clear every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: TableIndex) -> PageTableEntry {
        self.entries[index.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, index: TableIndex, entry: PageTableEntry) {
        self.entries[index.as_usize()] = entry;
    }

    /// Number of entries with any bit set.
    #[must_use]
    pub fn used(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_unused()).count()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A 9-bit index into a [`PageTable`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// `None` unless `index < 512`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(index: usize) -> Option<Self> {
        if index < PAGE_TABLE_ENTRIES {
            Some(Self(index as u16))
        } else {
            None
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn from_bits(va: VirtualAddress, shift: u32) -> Self {
        Self(((va.as_u64() >> shift) & 0x1FF) as u16)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// The four table levels, root first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TableLevel {
    Pml4,
    Pml3,
    Pml2,
    Pml1,
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pml3 => "PML3",
            Self::Pml2 => "PML2",
            Self::Pml1 => "PML1",
        })
    }
}

/// Per-level indices of a virtual address.
///
/// ```rust
/// # use kernel_memory_addresses::VirtualAddress;
/// # use kernel_vmem::PageTableIndices;
/// let idx = PageTableIndices::of(VirtualAddress::new(0xFFFF_FFFF_8020_3000));
/// assert_eq!(idx.pml4.as_usize(), 511);
/// assert_eq!(idx.pml3.as_usize(), 510);
/// assert_eq!(idx.pml2.as_usize(), 1);
/// assert_eq!(idx.pml1.as_usize(), 3);
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageTableIndices {
    /// Bits 39–47.
    pub pml4: TableIndex,
    /// Bits 30–38.
    pub pml3: TableIndex,
    /// Bits 21–29.
    pub pml2: TableIndex,
    /// Bits 12–20.
    pub pml1: TableIndex,
}

impl PageTableIndices {
    #[must_use]
    pub const fn of(va: VirtualAddress) -> Self {
        Self {
            pml4: TableIndex::from_bits(va, 39),
            pml3: TableIndex::from_bits(va, 30),
            pml2: TableIndex::from_bits(va, 21),
            pml1: TableIndex::from_bits(va, 12),
        }
    }
}
