//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The memory core of the kernel, in three layers that each only call
//! downwards:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Heap ([`heap`])                      │
//! │    • first-fit free list, 16-byte aligned blocks    │
//! │    • grows by pulling frames on demand              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Virtual Memory Manager ([`vmm`])             │
//! │    • kernel map: kernel image + HHDM                │
//! │    • 4 KiB / 2 MiB mappings, CR3 switch             │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │      Physical Frame Allocator ([`frame_alloc`])     │
//! │    • intrusive free list of 4 KiB frames            │
//! │    • frames zero-filled when handed out             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! All three reach physical memory through the higher-half direct map
//! ([`phys_mapper`]). Each keeps its state behind one spin lock; the heap and
//! the VMM take the frame allocator's lock while holding their own, so the
//! lock order is always heap → frames and VMM → frames.
//!
//! [`kernel_memory`] holds the kernel-wide instances and the boot sequence.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_alloc::frame_alloc::FrameAllocator;
//! use kernel_alloc::heap::HeapAllocator;
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_alloc::vmm::VirtualMemoryManager;
//! use kernel_info::boot::{KernelAddress, MemoryRegion, MemoryRegionKind};
//!
//! let map = [MemoryRegion::new(0x10_0000, 0x100_0000, MemoryRegionKind::Usable)];
//! let mut frames = FrameAllocator::new(HhdmPhysMapper::new(0xFFFF_8000_0000_0000));
//! unsafe { frames.init(&map) };
//!
//! let vmm = VirtualMemoryManager::new(&frames);
//! let kernel = KernelAddress { physical_base: 0x20_0000, virtual_base: 0xFFFF_FFFF_8000_0000 };
//! vmm.init_paging(&map, kernel)?;
//!
//! let heap = HeapAllocator::new();
//! heap.init(&frames, 40960)?;
//! let block = heap.allocate(128)?;
//! unsafe { heap.free(block.as_ptr()) };
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
mod free_list;
pub mod heap;
pub mod kernel_memory;
pub mod phys_mapper;
#[cfg(test)]
mod test_support;
pub mod vmm;

pub use crate::frame_alloc::{FrameAllocator, OutOfMemory};
pub use crate::heap::{HeapAllocator, HeapError};
pub use crate::kernel_memory::{KernelAllocator, MemoryInitError};
pub use crate::phys_mapper::HhdmPhysMapper;
pub use crate::vmm::{PageMap, VirtualMemoryManager, VmmError, VmmState};
