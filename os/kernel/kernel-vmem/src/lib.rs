//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel memory core.
//!
//! ## What you get
//! - A bit-exact [`PageTableEntry`] and a 4 KiB-aligned [`PageTable`].
//! - [`PageTableIndices`] to split a virtual address into per-level indices.
//! - An [`AddressSpace`] that installs 4 KiB or 2 MiB mappings and translates
//!   addresses, allocating intermediate tables on demand.
//! - The two seams it needs from the rest of the kernel: a [`FrameAlloc`]
//!   handing out table frames and a [`PhysMapper`] to reach them.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PML3 |  PML2 |  PML1 | Offset |
//! ```
//!
//! Each field indexes a table of 512 eight-byte entries:
//!
//! ```text
//!  PML4  →  PML3  →  PML2  →  PML1  →  Physical Page
//!                     │          └───► 4 KiB leaf
//!                     └──────────────► PS=1 → 2 MiB leaf
//! ```
//!
//! A present entry above PML1 without the page-size bit links to the next
//! table; a PML2 entry with the page-size bit, or any present PML1 entry, is a
//! leaf carrying the physical frame.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
mod page_table;

pub use crate::address_space::{AddressSpace, MapError, MapSize, RootPage};
pub use crate::page_table::{PageTable, PageTableEntry, PageTableIndices, TableIndex, TableLevel};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of **physical** 4 KiB frames for page tables.
///
/// Returns `None` when out of memory.
///
/// # Safety
/// Implementations must hand out each frame to at most one owner at a time,
/// and every returned frame must be writable through the [`PhysMapper`] the
/// caller pairs this allocator with.
pub unsafe trait FrameAlloc {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;
}

/// Converts physical addresses to references in the current virtual address
/// space (identity map in tests, HHDM in the kernel).
pub trait PhysMapper {
    /// # Safety
    /// - `pa` must be mapped writable in the current page tables for `'a`.
    /// - The bytes at `pa` must be a valid `T` and not otherwise borrowed.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}
