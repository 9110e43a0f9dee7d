//! Simulated physical RAM for unit tests.

use crate::frame_alloc::FrameAllocator;
use crate::phys_mapper::HhdmPhysMapper;
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalPage, Size4K};

#[repr(C, align(4096))]
struct Frame([u8; FRAME_SIZE]);

/// `frames` consecutive 4 KiB frames posing as physical memory at
/// [`PHYS_BASE`](Self::PHYS_BASE), reachable through [`mapper`](Self::mapper).
pub struct TestMemory {
    frames: *mut [Frame],
}

impl TestMemory {
    pub const PHYS_BASE: u64 = 0x10_0000;

    pub fn new(frames: usize) -> Self {
        // garbage, so missing zero-fills show up
        let buffer: Vec<Frame> = (0..frames).map(|_| Frame([0xCC; FRAME_SIZE])).collect();
        Self {
            frames: Box::into_raw(buffer.into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// HHDM whose offset makes [`PHYS_BASE`](Self::PHYS_BASE) land on the buffer.
    pub fn mapper(&self) -> HhdmPhysMapper {
        let host = self.frames.cast::<Frame>().expose_provenance() as u64;
        HhdmPhysMapper::new(host.wrapping_sub(Self::PHYS_BASE))
    }

    pub fn usable_region(&self) -> MemoryRegion {
        MemoryRegion::new(
            Self::PHYS_BASE,
            (self.len() * FRAME_SIZE) as u64,
            MemoryRegionKind::Usable,
        )
    }

    /// A frame allocator owning every simulated frame.
    pub fn frame_allocator(&self) -> FrameAllocator {
        let mut frames = FrameAllocator::new(self.mapper());
        unsafe { frames.init(&[self.usable_region()]) };
        frames
    }

    pub fn bytes(&self, frame: PhysicalPage<Size4K>) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.mapper().ptr::<u8>(frame.base()), FRAME_SIZE) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self, frame: PhysicalPage<Size4K>) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self.mapper().ptr::<u8>(frame.base()), FRAME_SIZE)
        }
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.frames) });
    }
}
