//! # Kernel-wide Memory Instances
//!
//! The frame allocator, the VMM and the heap the rest of the kernel uses,
//! plus [`init_memory`] which brings them up in order:
//!
//! ```text
//! frame allocator ─► kernel map ─► CR3 ─► heap
//! ```
//!
//! Install the heap as the Rust global allocator in the kernel binary:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: kernel_alloc::kernel_memory::KernelAllocator =
//!     kernel_alloc::kernel_memory::KernelAllocator;
//! ```

use crate::frame_alloc::FrameAllocator;
use crate::heap::{HeapAllocator, HeapError};
use crate::vmm::{VirtualMemoryManager, VmmError};
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(target_arch = "x86_64")]
use kernel_info::boot::KernelBootInfo;
use kernel_sync::SyncOnceCell;

static FRAMES: SyncOnceCell<FrameAllocator> = SyncOnceCell::new();
static VMM: SyncOnceCell<VirtualMemoryManager<'static>> = SyncOnceCell::new();
static HEAP: HeapAllocator<'static> = HeapAllocator::new();

static STARTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryInitError {
    #[error("kernel memory is already initialized")]
    AlreadyInitialized,
    #[error("the memory map contains no usable frames")]
    NoUsableMemory,
    #[error("failed to set up paging")]
    Paging(#[from] VmmError),
    #[error("failed to set up the heap")]
    Heap(#[from] HeapError),
}

/// Bring up the frame allocator, build and load the kernel map, and seed
/// the heap with [`INITIAL_HEAP_SIZE`](kernel_info::memory::INITIAL_HEAP_SIZE)
/// bytes.
///
/// # Errors
/// - [`MemoryInitError::AlreadyInitialized`] on every call after the first.
/// - [`MemoryInitError::NoUsableMemory`] if the memory map has no usable frame.
/// - [`MemoryInitError::Paging`] or [`MemoryInitError::Heap`] if a later
///   step fails; the instances brought up before stay in place.
///
/// # Safety
/// - Must run at CPL0 on the boot CPU before any other CPU starts.
/// - `boot` must describe the machine truthfully: usable regions are free
///   RAM, the HHDM offset and the kernel addresses are the ones in effect.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_memory(boot: &KernelBootInfo<'_>) -> Result<(), MemoryInitError> {
    use crate::phys_mapper::HhdmPhysMapper;
    use kernel_info::memory::INITIAL_HEAP_SIZE;
    use log::info;

    if STARTED.swap(true, Ordering::AcqRel) {
        return Err(MemoryInitError::AlreadyInitialized);
    }
    info!(
        "memory map: {} regions, {} KiB usable, HHDM at {:#x}",
        boot.memory_map.len(),
        boot.usable_bytes() / 1024,
        boot.hhdm_offset
    );

    let mut frames = FrameAllocator::new(HhdmPhysMapper::new(boot.hhdm_offset));
    // SAFETY: the caller vouches for the memory map.
    if unsafe { frames.init(boot.memory_map) } == 0 {
        return Err(MemoryInitError::NoUsableMemory);
    }
    let frames = FRAMES
        .set(frames)
        .map_err(|_| MemoryInitError::AlreadyInitialized)?;

    let vmm = VMM
        .set(VirtualMemoryManager::new(frames))
        .map_err(|_| MemoryInitError::AlreadyInitialized)?;
    vmm.init_paging(boot.memory_map, boot.kernel_address)?;
    // SAFETY: the new map covers the kernel image and the HHDM.
    unsafe { vmm.load_kernel_cr3()? };

    HEAP.init(frames, INITIAL_HEAP_SIZE)?;
    info!(
        "memory ready: {} of {} frames free",
        frames.free_frames(),
        frames.total_frames()
    );
    Ok(())
}

/// The kernel's frame allocator, once [`init_memory`] created it.
#[must_use]
pub fn frame_allocator() -> Option<&'static FrameAllocator> {
    FRAMES.get()
}

/// The kernel's VMM, once [`init_memory`] created it.
#[must_use]
pub fn kernel_vmm() -> Option<&'static VirtualMemoryManager<'static>> {
    VMM.get()
}

/// The kernel heap; allocations fail until [`init_memory`] seeded it.
#[must_use]
pub fn kernel_heap() -> &'static HeapAllocator<'static> {
    &HEAP
}

/// `GlobalAlloc` front for the kernel heap.
///
/// Alignments above [`HEAP_ALIGN`](kernel_info::memory::HEAP_ALIGN) are not
/// supported and yield null.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { HEAP.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { HEAP.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { HEAP.realloc(ptr, layout, new_size) }
    }
}
