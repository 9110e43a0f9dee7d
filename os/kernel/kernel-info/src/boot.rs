//! # Kernel Boot Information
//!
//! What the bootloader hands to the memory core: the physical memory map,
//! where the kernel image was loaded, and the HHDM offset.

use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Classification of a memory map entry, as reported by the bootloader.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryRegionKind {
    /// Free RAM, managed by the frame allocator.
    Usable = 0,
    /// Firmware or hardware owned; never allocated.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM.
    BadMemory = 4,
    /// Bootloader data structures.
    BootloaderReclaimable = 5,
    /// The kernel image and boot modules.
    KernelAndModules = 6,
    /// Linear framebuffer memory.
    Framebuffer = 7,
}

/// One entry of the physical memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// One past the last byte, saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.saturating_add(self.length))
    }

    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.kind == MemoryRegionKind::Usable
    }

    /// Every whole 4 KiB frame inside the region.
    ///
    /// The start is rounded up and the end rounded down, so partial frames
    /// at either edge are never produced.
    ///
    /// ```rust
    /// # use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
    /// let region = MemoryRegion::new(0x1800, 0x3000, MemoryRegionKind::Usable);
    /// let frames: Vec<u64> = region.frames().map(|f| f.base().as_u64()).collect();
    /// assert_eq!(frames, [0x2000, 0x3000]);
    /// ```
    #[must_use]
    pub const fn frames(&self) -> RegionFrames {
        let start = match self.base().align_up::<Size4K>() {
            Some(a) => a.as_u64(),
            None => u64::MAX,
        };
        let end = self.end().as_u64();
        RegionFrames::new(start >> Size4K::SHIFT, end >> Size4K::SHIFT)
    }

    /// Every 4 KiB frame the region touches, including partial edge frames.
    ///
    /// ```rust
    /// # use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
    /// let region = MemoryRegion::new(0x1800, 0x3000, MemoryRegionKind::Reserved);
    /// let frames: Vec<u64> = region.covering_frames().map(|f| f.base().as_u64()).collect();
    /// assert_eq!(frames, [0x1000, 0x2000, 0x3000, 0x4000]);
    /// ```
    #[must_use]
    pub const fn covering_frames(&self) -> RegionFrames {
        let first = self.base >> Size4K::SHIFT;
        let last = self.end().as_u64().saturating_add(Size4K::SIZE - 1) >> Size4K::SHIFT;
        RegionFrames::new(first, last)
    }
}

/// Iterator over the frames of a [`MemoryRegion`], by frame number.
#[derive(Debug, Clone)]
pub struct RegionFrames {
    next: u64,
    end: u64,
}

impl RegionFrames {
    const fn new(first: u64, end: u64) -> Self {
        Self {
            next: first,
            end: if end > first { end } else { first },
        }
    }
}

impl Iterator for RegionFrames {
    type Item = PhysicalPage<Size4K>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == self.end {
            return None;
        }
        let frame = PhysicalPage::from_number(self.next);
        self.next += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = usize::try_from(self.end - self.next).unwrap_or(usize::MAX);
        (len, Some(len))
    }
}

impl DoubleEndedIterator for RegionFrames {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.next == self.end {
            return None;
        }
        self.end -= 1;
        Some(PhysicalPage::from_number(self.end))
    }
}

impl ExactSizeIterator for RegionFrames {}

/// Where the kernel image was loaded.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelAddress {
    pub physical_base: u64,
    pub virtual_base: u64,
}

impl KernelAddress {
    /// Virtual alias of a physical address inside the kernel image.
    #[must_use]
    pub const fn virtual_of(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64())
            .wrapping_add(self.virtual_base.wrapping_sub(self.physical_base))
    }
}

/// Everything the memory core consumes at boot.
#[derive(Debug, Copy, Clone)]
pub struct KernelBootInfo<'a> {
    pub memory_map: &'a [MemoryRegion],
    pub kernel_address: KernelAddress,
    /// Offset of the higher-half direct map: `virtual = physical + hhdm_offset`.
    pub hhdm_offset: u64,
}

impl KernelBootInfo<'_> {
    /// Total bytes of [`Usable`](MemoryRegionKind::Usable) memory in the map.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.length)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_trim_partial_edges() {
        let region = MemoryRegion::new(0x1001, 0x3000, MemoryRegionKind::Usable);
        let frames: Vec<_> = region.frames().map(|f| f.base().as_u64()).collect();
        assert_eq!(frames, [0x2000, 0x3000]);
    }

    #[test]
    fn frames_of_tiny_region_are_empty() {
        let region = MemoryRegion::new(0x1800, 0x900, MemoryRegionKind::Usable);
        assert_eq!(region.frames().count(), 0);
        assert_eq!(region.frames().len(), 0);
    }

    #[test]
    fn frames_reverse_iteration() {
        let region = MemoryRegion::new(0x10_0000, 0x3000, MemoryRegionKind::Usable);
        let frames: Vec<_> = region.frames().rev().map(|f| f.base().as_u64()).collect();
        assert_eq!(frames, [0x10_2000, 0x10_1000, 0x10_0000]);
    }

    #[test]
    fn covering_frames_include_partial_edges() {
        let region = MemoryRegion::new(0xF_F800, 0x1000, MemoryRegionKind::Framebuffer);
        let frames: Vec<_> = region.covering_frames().map(|f| f.base().as_u64()).collect();
        assert_eq!(frames, [0xF_F000, 0x10_0000]);
        let empty = MemoryRegion::new(0x5000, 0, MemoryRegionKind::Reserved);
        assert_eq!(empty.covering_frames().count(), 0);
    }

    #[test]
    fn region_end_saturates() {
        let region = MemoryRegion::new(u64::MAX - 0xFFF, 0x2000, MemoryRegionKind::Reserved);
        assert_eq!(region.end().as_u64(), u64::MAX);
        assert_eq!(region.frames().count(), 0);
    }

    #[test]
    fn kernel_virtual_alias_applies_bias() {
        let kernel = KernelAddress {
            physical_base: 0x0020_0000,
            virtual_base: 0xFFFF_FFFF_8000_0000,
        };
        assert_eq!(
            kernel.virtual_of(PhysicalAddress::new(0x0020_3000)),
            VirtualAddress::new(0xFFFF_FFFF_8000_3000)
        );
    }

    #[test]
    fn usable_bytes_ignores_other_kinds() {
        let map = [
            MemoryRegion::new(0x0, 0x1000, MemoryRegionKind::Reserved),
            MemoryRegion::new(0x10_0000, 0x4000, MemoryRegionKind::Usable),
            MemoryRegion::new(0x20_0000, 0x2000, MemoryRegionKind::Usable),
            MemoryRegion::new(0x30_0000, 0x8000, MemoryRegionKind::KernelAndModules),
        ];
        let info = KernelBootInfo {
            memory_map: &map,
            kernel_address: KernelAddress {
                physical_base: 0x30_0000,
                virtual_base: 0xFFFF_FFFF_8000_0000,
            },
            hhdm_offset: 0xFFFF_8000_0000_0000,
        };
        assert_eq!(info.usable_bytes(), 0x6000);
    }
}
