//! # Physical Frame Allocator
//!
//! Free 4 KiB frames form an intrusive singly linked list: the link to the
//! next free frame is stored in the first bytes of the frame itself, written
//! through its HHDM alias. Pushing and popping are O(1) and need no storage
//! besides the frames being managed.
//!
//! ```text
//! head ─► ┌────────┐    ┌────────┐    ┌────────┐
//!         │ next ──┼──► │ next ──┼──► │ None   │
//!         │        │    │        │    │        │
//!         └────────┘    └────────┘    └────────┘
//!          frame a       frame b       frame c
//! ```
//!
//! The list lock masks interrupts while held. Frames are zero-filled when
//! handed out, after the lock is released.
//!
//! A frame whose HHDM alias is the null address cannot hold a link and is
//! never put on the list.

use crate::phys_mapper::HhdmPhysMapper;
use core::ptr::NonNull;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;
use log::{debug, error, info};

/// No free frame was left.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("out of physical memory")]
pub struct OutOfMemory;

/// The link stored inside every free frame.
#[repr(C)]
struct FreeFrame {
    next: Option<NonNull<FreeFrame>>,
}

struct FreeFrames {
    head: Option<NonNull<FreeFrame>>,
    free: usize,
}

// Safety: the list is only reached through the allocator's lock, and the
// frames it points into are owned by the allocator.
unsafe impl Send for FreeFrames {}

impl FreeFrames {
    const fn new() -> Self {
        Self {
            head: None,
            free: 0,
        }
    }

    /// Returns `false` without touching the frame if its alias is null.
    ///
    /// # Safety
    /// `frame` must be free, not already on the list and writable through `mapper`.
    unsafe fn push(&mut self, mapper: &HhdmPhysMapper, frame: PhysicalPage<Size4K>) -> bool {
        let Some(node) = NonNull::new(mapper.ptr::<FreeFrame>(frame.base())) else {
            return false;
        };
        unsafe { node.write(FreeFrame { next: self.head }) };
        self.head = Some(node);
        self.free += 1;
        true
    }

    fn pop(&mut self, mapper: &HhdmPhysMapper) -> Option<PhysicalPage<Size4K>> {
        let node = self.head?;
        // SAFETY: every node on the list was written by `push`.
        self.head = unsafe { node.as_ptr().read().next };
        self.free -= 1;
        let va = VirtualAddress::from_ptr(node.as_ptr());
        Some(PhysicalPage::containing(mapper.virt_to_phys(va)))
    }
}

/// Hands out and takes back single 4 KiB physical frames.
pub struct FrameAllocator {
    mapper: HhdmPhysMapper,
    frames: SpinLock<FreeFrames>,
    total: usize,
}

impl FrameAllocator {
    /// An allocator without any frames; see [`init`](Self::init).
    #[must_use]
    pub const fn new(mapper: HhdmPhysMapper) -> Self {
        Self {
            mapper,
            frames: SpinLock::new(FreeFrames::new()),
            total: 0,
        }
    }

    /// Push every whole frame of every [`Usable`](kernel_info::boot::MemoryRegionKind::Usable)
    /// region onto the free list and return how many were added.
    ///
    /// Frames are pushed highest-first, so a fresh allocator hands them out
    /// in ascending address order.
    ///
    /// # Safety
    /// - Every usable region must be unused RAM, reachable through the HHDM.
    /// - No region may be passed more than once.
    pub unsafe fn init(&mut self, memory_map: &[MemoryRegion]) -> usize {
        let mapper = self.mapper;
        let list = self.frames.get_mut();

        let mut added = 0;
        for region in memory_map.iter().rev().filter(|r| r.is_usable()) {
            let mut count = 0;
            for frame in region.frames().rev() {
                // SAFETY: usable frames are free RAM per the caller contract.
                if unsafe { list.push(&mapper, frame) } {
                    count += 1;
                } else {
                    debug!("skipping frame {frame}: its HHDM alias is null");
                }
            }
            debug!(
                "usable region {}..{}: {count} frames",
                region.base(),
                region.end()
            );
            added += count;
        }

        self.total += added;
        if added == 0 {
            error!("no usable physical memory in the memory map");
        } else {
            info!(
                "frame allocator ready: {added} frames ({} KiB)",
                added * FRAME_SIZE / 1024
            );
        }
        added
    }

    /// Take one frame off the free list, zero-filled.
    ///
    /// # Errors
    /// [`OutOfMemory`] if no frame is left.
    pub fn allocate_page(&self) -> Result<PhysicalPage<Size4K>, OutOfMemory> {
        let frame = self.frames.lock_irq().pop(&self.mapper).ok_or(OutOfMemory)?;
        // SAFETY: the frame left the list, so nobody else can reach it.
        unsafe {
            self.mapper
                .ptr::<u8>(frame.base())
                .write_bytes(0, FRAME_SIZE);
        }
        Ok(frame)
    }

    /// Return a frame to the free list.
    ///
    /// # Safety
    /// - `frame` must have come from [`allocate_page`](Self::allocate_page)
    ///   of this allocator.
    /// - It must not be freed twice and must not be used afterwards.
    pub unsafe fn free_page(&self, frame: PhysicalPage<Size4K>) {
        let mut frames = self.frames.lock_irq();
        // SAFETY: ownership of the frame returns to the list per the caller contract.
        let pushed = unsafe { frames.push(&self.mapper, frame) };
        debug_assert!(pushed, "allocated frames never alias null");
    }

    /// Frames currently on the free list.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames.lock_irq().free
    }

    /// Frames ever added by [`init`](Self::init).
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total
    }

    /// The HHDM mapper frames are written through.
    #[must_use]
    pub const fn mapper(&self) -> HhdmPhysMapper {
        self.mapper
    }
}

// Safety: each frame leaves the list exactly once until it is freed again,
// and every frame is writable through the allocator's HHDM mapper.
unsafe impl FrameAlloc for FrameAllocator {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_page().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestMemory;
    use kernel_info::boot::MemoryRegionKind;
    use kernel_memory_addresses::PhysicalAddress;
    use std::collections::HashSet;

    #[test]
    fn init_counts_only_usable_frames() {
        let mem = TestMemory::new(8);
        let map = [
            MemoryRegion::new(0, TestMemory::PHYS_BASE, MemoryRegionKind::Reserved),
            mem.usable_region(),
            MemoryRegion::new(0x1000_0000, 0x10_0000, MemoryRegionKind::KernelAndModules),
        ];
        let mut frames = FrameAllocator::new(mem.mapper());
        assert_eq!(unsafe { frames.init(&map) }, 8);
        assert_eq!(frames.total_frames(), 8);
        assert_eq!(frames.free_frames(), 8);
    }

    #[test]
    fn partial_edges_are_trimmed() {
        let mem = TestMemory::new(4);
        let region = MemoryRegion::new(
            TestMemory::PHYS_BASE + 0x10,
            3 * 4096,
            MemoryRegionKind::Usable,
        );
        let mut frames = FrameAllocator::new(mem.mapper());
        assert_eq!(unsafe { frames.init(&[region]) }, 2);
        assert_eq!(
            frames.allocate_page().unwrap().base(),
            PhysicalAddress::new(TestMemory::PHYS_BASE + 0x1000)
        );
    }

    #[test]
    fn fresh_allocator_hands_out_ascending_frames() {
        let mem = TestMemory::new(4);
        let frames = mem.frame_allocator();
        let got: Vec<_> = (0..4)
            .map(|_| frames.allocate_page().unwrap().base().as_u64())
            .collect();
        let base = TestMemory::PHYS_BASE;
        assert_eq!(got, [base, base + 0x1000, base + 0x2000, base + 0x3000]);
    }

    #[test]
    fn allocated_frames_are_unique_and_zeroed() {
        let mem = TestMemory::new(16);
        let frames = mem.frame_allocator();

        let mut seen = HashSet::new();
        while let Ok(frame) = frames.allocate_page() {
            assert!(seen.insert(frame));
            assert!(mem.bytes(frame).iter().all(|&b| b == 0));
        }
        assert_eq!(seen.len(), 16);
        assert_eq!(frames.free_frames(), 0);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mem = TestMemory::new(1);
        let frames = mem.frame_allocator();
        assert!(frames.allocate_page().is_ok());
        assert_eq!(frames.allocate_page(), Err(OutOfMemory));
        assert_eq!(OutOfMemory.to_string(), "out of physical memory");
    }

    #[test]
    fn freed_frame_is_reused_and_zeroed_again() {
        let mem = TestMemory::new(2);
        let frames = mem.frame_allocator();

        let a = frames.allocate_page().unwrap();
        mem.bytes_mut(a).fill(0x5A);
        unsafe { frames.free_page(a) };
        assert_eq!(frames.free_frames(), 2);

        let b = frames.allocate_page().unwrap();
        assert_eq!(a, b);
        assert!(mem.bytes(b).iter().all(|&b| b == 0));
    }

    #[test]
    fn no_usable_memory() {
        let mem = TestMemory::new(1);
        let mut frames = FrameAllocator::new(mem.mapper());
        let map = [MemoryRegion::new(0, 0x10_0000, MemoryRegionKind::Reserved)];
        assert_eq!(unsafe { frames.init(&map) }, 0);
        assert_eq!(frames.allocate_page(), Err(OutOfMemory));
    }

    #[test]
    fn frame_aliased_to_null_is_skipped() {
        let mem = TestMemory::new(2);
        let mapper = mem.mapper();
        let null_frame = 0u64.wrapping_sub(mapper.offset());
        let map = [
            mem.usable_region(),
            MemoryRegion::new(null_frame, FRAME_SIZE as u64, MemoryRegionKind::Usable),
        ];

        let mut frames = FrameAllocator::new(mapper);
        assert_eq!(unsafe { frames.init(&map) }, 2);
        assert_eq!(frames.total_frames(), 2);

        let end = TestMemory::PHYS_BASE + 2 * FRAME_SIZE as u64;
        for _ in 0..2 {
            let pa = frames.allocate_page().unwrap().base().as_u64();
            assert!((TestMemory::PHYS_BASE..end).contains(&pa));
        }
        assert_eq!(frames.allocate_page(), Err(OutOfMemory));
    }

    #[test]
    fn frame_alloc_seam_forwards() {
        let mem = TestMemory::new(1);
        let frames = mem.frame_allocator();
        assert!(frames.alloc_4k().is_some());
        assert!(frames.alloc_4k().is_none());
    }
}
