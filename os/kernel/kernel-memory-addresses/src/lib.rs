//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses the memory core passes
//! around: frame addresses handed out by the physical allocator, virtual
//! addresses fed into the page-table walker and HHDM aliases used to touch
//! physical memory.
//!
//! | Concept | Description |
//! |----------|-------------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | An offset within a page of size `S`. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory or MMIO. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory. |
//!
//! Two page sizes exist, [`Size4K`] (frames and PML1 leaves) and [`Size2M`]
//! (PML2 leaves).
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_3042);
//! let frame = pa.page::<Size4K>();
//! assert_eq!(frame.base(), PhysicalAddress::new(0x0010_3000));
//! assert_eq!(frame.number(), 0x103);
//! assert_eq!(frame.next().map(PhysicalPage::base), Some(PhysicalAddress::new(0x0010_4000)));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod page_size;
mod typed;

pub use memory_address::{MemoryAddress, MemoryAddressOffset, MemoryPage};
pub use page_size::{PageSize, Size2M, Size4K};
pub use typed::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
