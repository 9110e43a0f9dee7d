//! # Virtual Memory Manager
//!
//! Owns the kernel map: one PML4-rooted page-table tree built at boot from
//! the physical memory map and then loaded into CR3.
//!
//! ```text
//!  Uninitialized ──init_paging──► MapBuilt ──load_kernel_cr3──► Active
//! ```
//!
//! The kernel image is mapped at its link-time bias
//! (`virtual_base - physical_base`); every other region is mapped at the
//! HHDM offset of the [`HhdmPhysMapper`] shared with the [`FrameAllocator`].
//!
//! All page-table mutation runs under one lock, taken with interrupts
//! masked. Page-table frames come from the frame allocator while that lock
//! is held.
//!
//! Mappings are never followed by a TLB flush; changing a mapping of the
//! active tree requires the caller to invalidate it.

use crate::frame_alloc::FrameAllocator;
use crate::phys_mapper::HhdmPhysMapper;
use kernel_info::boot::{KernelAddress, MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, MapError, MapSize, RootPage};
use log::{debug, info};

/// Lifecycle of the kernel map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VmmState {
    /// No kernel map yet.
    Uninitialized,
    /// The kernel map exists but is not loaded.
    MapBuilt,
    /// The kernel map is loaded in CR3.
    Active,
}

#[derive(Debug, Copy, Clone)]
enum KernelMap {
    Uninitialized,
    Built(RootPage),
    Active(RootPage),
}

impl KernelMap {
    const fn root(self) -> Option<RootPage> {
        match self {
            Self::Uninitialized => None,
            Self::Built(root) | Self::Active(root) => Some(root),
        }
    }

    const fn state(self) -> VmmState {
        match self {
            Self::Uninitialized => VmmState::Uninitialized,
            Self::Built(_) => VmmState::MapBuilt,
            Self::Active(_) => VmmState::Active,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    /// No target table was given and the kernel map is not built yet.
    #[error("the kernel map has not been built")]
    KernelMapMissing,
    #[error("the kernel map is already built")]
    AlreadyInitialized,
    /// No frame was available for a top-level table.
    #[error("out of memory allocating a top-level page table")]
    OutOfMemory(#[source] MapError),
    /// An intermediate table could not be allocated; no leaf was written.
    #[error("failed to map {virt:?} to {phys:?}")]
    Mapping {
        virt: VirtualAddress,
        phys: PhysicalAddress,
        #[source]
        source: MapError,
    },
}

/// A page-table tree built apart from the kernel map.
///
/// Created by [`VirtualMemoryManager::create_table`] and passed as the
/// explicit target of [`VirtualMemoryManager::memory_map`]. Its frames are
/// never returned to the frame allocator.
#[derive(Debug)]
pub struct PageMap {
    root: RootPage,
}

impl PageMap {
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// CR3 value that would activate this tree.
    #[must_use]
    pub const fn cr3(&self) -> Cr3 {
        Cr3::for_root(self.root)
    }
}

/// Builds and edits page tables; owns the kernel map.
pub struct VirtualMemoryManager<'f> {
    frames: &'f FrameAllocator,
    mapper: HhdmPhysMapper,
    kernel_map: SpinLock<KernelMap>,
}

impl<'f> VirtualMemoryManager<'f> {
    /// A manager drawing table frames from `frames` and reaching them
    /// through the same HHDM.
    #[must_use]
    pub const fn new(frames: &'f FrameAllocator) -> Self {
        Self {
            frames,
            mapper: frames.mapper(),
            kernel_map: SpinLock::new(KernelMap::Uninitialized),
        }
    }

    #[must_use]
    pub fn state(&self) -> VmmState {
        self.kernel_map.lock_irq().state()
    }

    /// The kernel map's PML4, once built.
    #[must_use]
    pub fn kernel_map(&self) -> Option<RootPage> {
        self.kernel_map.lock_irq().root()
    }

    /// Offset of the higher-half direct map.
    #[must_use]
    pub const fn hhdm_offset(&self) -> u64 {
        self.mapper.offset()
    }

    /// `virtual = physical + hhdm_offset`
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        self.mapper.phys_to_virt(pa)
    }

    /// `physical = virtual - hhdm_offset`
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        self.mapper.virt_to_phys(va)
    }

    /// # Safety
    /// `root` must be the kernel map or the root of a [`PageMap`] built here.
    const unsafe fn address_space(&self, root: RootPage) -> AddressSpace<'_, HhdmPhysMapper> {
        unsafe { AddressSpace::from_root(&self.mapper, root) }
    }

    /// Build the kernel map from the physical memory map.
    ///
    /// Every region except [`BadMemory`](MemoryRegionKind::BadMemory) is
    /// mapped with writable, supervisor-only 4 KiB pages, partial edge frames
    /// included: [`KernelAndModules`](MemoryRegionKind::KernelAndModules) at
    /// the kernel's link-time bias, everything else at the HHDM offset.
    ///
    /// The new tree is recorded as the kernel map but not loaded.
    ///
    /// # Errors
    /// - [`VmmError::AlreadyInitialized`] if the kernel map exists.
    /// - [`VmmError::OutOfMemory`] or [`VmmError::Mapping`] if the frame
    ///   allocator runs dry. Frames taken until then are not returned and
    ///   the kernel map stays unset.
    pub fn init_paging(
        &self,
        memory_map: &[MemoryRegion],
        kernel: KernelAddress,
    ) -> Result<RootPage, VmmError> {
        let mut kernel_map = self.kernel_map.lock_irq();
        if kernel_map.root().is_some() {
            return Err(VmmError::AlreadyInitialized);
        }

        let aspace = AddressSpace::new(&self.mapper, self.frames).map_err(VmmError::OutOfMemory)?;

        for region in memory_map {
            if region.kind == MemoryRegionKind::BadMemory {
                debug!("not mapping bad memory {}..{}", region.base(), region.end());
                continue;
            }
            let kernel_image = region.kind == MemoryRegionKind::KernelAndModules;
            let virtual_of = |pa: PhysicalAddress| {
                if kernel_image {
                    kernel.virtual_of(pa)
                } else {
                    self.mapper.phys_to_virt(pa)
                }
            };

            for frame in region.covering_frames() {
                let phys = frame.base();
                let virt = virtual_of(phys);
                aspace
                    .map_one(self.frames, virt, phys, MapSize::Page4K)
                    .map_err(|source| VmmError::Mapping { virt, phys, source })?;
            }
            info!(
                "mapped {:?} {}..{} at {}",
                region.kind,
                region.base(),
                region.end(),
                virtual_of(region.base())
            );
        }

        let root = aspace.root_page();
        *kernel_map = KernelMap::Built(root);
        info!("kernel map built at {root}");
        Ok(root)
    }

    /// A fresh, empty page-table tree apart from the kernel map.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is available.
    pub fn create_table(&self) -> Result<PageMap, VmmError> {
        let _lock = self.kernel_map.lock_irq();
        let aspace = AddressSpace::new(&self.mapper, self.frames).map_err(VmmError::OutOfMemory)?;
        Ok(PageMap {
            root: aspace.root_page(),
        })
    }

    /// Map one page `virt → phys` in `target`, or in the kernel map if `None`.
    ///
    /// With `use_large_page` a 2 MiB leaf is written at PML2, mapping the
    /// 2 MiB region around `virt` onto the one around `phys`; otherwise a
    /// 4 KiB leaf at PML1. Missing intermediate tables are allocated. An
    /// existing mapping is overwritten without a TLB flush.
    ///
    /// # Errors
    /// - [`VmmError::KernelMapMissing`] for `None` before [`init_paging`](Self::init_paging).
    ///   No frame is consumed.
    /// - [`VmmError::Mapping`] if an intermediate table could not be allocated.
    pub fn memory_map(
        &self,
        target: Option<&PageMap>,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        use_large_page: bool,
    ) -> Result<(), VmmError> {
        let kernel_map = self.kernel_map.lock_irq();
        let root = match target {
            Some(map) => map.root,
            None => kernel_map.root().ok_or(VmmError::KernelMapMissing)?,
        };

        // SAFETY: `root` is the kernel map or a `PageMap` root.
        let aspace = unsafe { self.address_space(root) };
        aspace
            .map_one(self.frames, virt, phys, MapSize::from_large(use_large_page))
            .map_err(|source| VmmError::Mapping { virt, phys, source })
    }

    /// Walk `target` (or the kernel map) and return the physical address
    /// `virt` maps to.
    #[must_use]
    pub fn translate(
        &self,
        target: Option<&PageMap>,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let kernel_map = self.kernel_map.lock_irq();
        let root = target.map_or_else(|| kernel_map.root(), |map| Some(map.root))?;
        // SAFETY: as in `memory_map`
        unsafe { self.address_space(root) }.translate(virt)
    }

    /// CR3 value that activates the kernel map.
    ///
    /// # Errors
    /// [`VmmError::KernelMapMissing`] before [`init_paging`](Self::init_paging).
    pub fn kernel_cr3(&self) -> Result<Cr3, VmmError> {
        self.kernel_map
            .lock_irq()
            .root()
            .map(Cr3::for_root)
            .ok_or(VmmError::KernelMapMissing)
    }

    /// Make the kernel map the live address space.
    ///
    /// # Errors
    /// [`VmmError::KernelMapMissing`] before [`init_paging`](Self::init_paging).
    ///
    /// # Safety
    /// - Must run at CPL0.
    /// - The kernel map must cover the executing code, its stack and every
    ///   address used afterwards, including the HHDM.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn load_kernel_cr3(&self) -> Result<(), VmmError> {
        use kernel_registers::StoreRegisterUnsafe;

        let mut kernel_map = self.kernel_map.lock_irq();
        let root = kernel_map.root().ok_or(VmmError::KernelMapMissing)?;
        // SAFETY: caller contract
        unsafe { Cr3::for_root(root).store_unsafe() };
        *kernel_map = KernelMap::Active(root);
        info!("kernel map {root} loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestMemory;
    use kernel_memory_addresses::{PageSize, Size2M};

    const KERNEL: KernelAddress = KernelAddress {
        physical_base: 0x20_0000,
        virtual_base: 0xFFFF_FFFF_8000_0000,
    };

    #[test]
    fn memory_map_without_kernel_map_consumes_nothing() {
        let mem = TestMemory::new(8);
        let frames = mem.frame_allocator();
        let vmm = VirtualMemoryManager::new(&frames);

        let err = vmm
            .memory_map(
                None,
                VirtualAddress::new(0x1000),
                PhysicalAddress::new(0x2000),
                false,
            )
            .unwrap_err();
        assert_eq!(err, VmmError::KernelMapMissing);
        assert_eq!(frames.free_frames(), 8);
        assert_eq!(vmm.state(), VmmState::Uninitialized);
        assert_eq!(vmm.kernel_cr3(), Err(VmmError::KernelMapMissing));
    }

    #[test]
    fn init_paging_maps_kernel_hhdm_and_skips_bad_memory() {
        let mem = TestMemory::new(64);
        let frames = mem.frame_allocator();
        let vmm = VirtualMemoryManager::new(&frames);
        let hhdm = vmm.hhdm_offset();

        let map = [
            MemoryRegion::new(0x8000, 0x1800, MemoryRegionKind::Reserved),
            MemoryRegion::new(0x20_0000, 0x3000, MemoryRegionKind::KernelAndModules),
            MemoryRegion::new(0x40_0000, 0x1000, MemoryRegionKind::BadMemory),
        ];
        let root = vmm.init_paging(&map, KERNEL).unwrap();
        assert_eq!(vmm.state(), VmmState::MapBuilt);
        assert_eq!(vmm.kernel_map(), Some(root));
        assert_eq!(vmm.kernel_cr3().unwrap().root(), root);

        let kernel = |pa: u64| VirtualAddress::new(0xFFFF_FFFF_8000_0000 + pa - 0x20_0000);
        for pa in [0x20_0000, 0x20_1000, 0x20_2ABC] {
            assert_eq!(
                vmm.translate(None, kernel(pa)),
                Some(PhysicalAddress::new(pa))
            );
        }
        assert_eq!(vmm.translate(None, kernel(0x20_3000)), None);

        let direct = |pa: u64| VirtualAddress::new(pa.wrapping_add(hhdm));
        // the partial last frame of the reserved region is mapped too
        assert_eq!(
            vmm.translate(None, direct(0x9010)),
            Some(PhysicalAddress::new(0x9010))
        );
        assert_eq!(vmm.translate(None, direct(0x40_0000)), None);
        assert_eq!(
            vmm.phys_to_virt(PhysicalAddress::new(0x9010)),
            direct(0x9010)
        );
    }

    #[test]
    fn init_paging_twice_fails() {
        let mem = TestMemory::new(32);
        let frames = mem.frame_allocator();
        let vmm = VirtualMemoryManager::new(&frames);
        vmm.init_paging(&[], KERNEL).unwrap();
        assert_eq!(
            vmm.init_paging(&[], KERNEL),
            Err(VmmError::AlreadyInitialized)
        );
    }

    #[test]
    fn init_paging_out_of_frames() {
        let mem = TestMemory::new(2);
        let frames = mem.frame_allocator();
        let vmm = VirtualMemoryManager::new(&frames);
        let image = MemoryRegion::new(0x20_0000, 0x1000, MemoryRegionKind::KernelAndModules);

        let err = vmm.init_paging(&[image], KERNEL).unwrap_err();
        assert!(matches!(err, VmmError::Mapping { .. }));
        assert_eq!(vmm.state(), VmmState::Uninitialized);
    }

    #[test]
    fn memory_map_into_kernel_map() {
        let mem = TestMemory::new(32);
        let frames = mem.frame_allocator();
        let vmm = VirtualMemoryManager::new(&frames);
        vmm.init_paging(&[], KERNEL).unwrap();

        let va = VirtualAddress::new(0xFFFF_C000_0000_0000);
        vmm.memory_map(None, va, PhysicalAddress::new(0x1234_5000), false)
            .unwrap();
        assert_eq!(
            vmm.translate(None, va + 0x10),
            Some(PhysicalAddress::new(0x1234_5010))
        );

        let large = VirtualAddress::new(0xFFFF_C000_0040_0000);
        vmm.memory_map(None, large, PhysicalAddress::new(0x8000_0000), true)
            .unwrap();
        assert_eq!(
            vmm.translate(None, large + (Size2M::SIZE - 1)),
            Some(PhysicalAddress::new(0x8000_0000 + Size2M::SIZE - 1))
        );
    }

    #[test]
    fn explicit_target_leaves_kernel_map_alone() {
        let mem = TestMemory::new(32);
        let frames = mem.frame_allocator();
        let vmm = VirtualMemoryManager::new(&frames);

        let table = vmm.create_table().unwrap();
        let va = VirtualAddress::new(0x40_0000);
        vmm.memory_map(Some(&table), va, PhysicalAddress::new(0x7000), false)
            .unwrap();

        assert_eq!(
            vmm.translate(Some(&table), va),
            Some(PhysicalAddress::new(0x7000))
        );
        assert_eq!(vmm.translate(None, va), None);
        assert_eq!(vmm.state(), VmmState::Uninitialized);
        assert_eq!(table.cr3().root(), table.root_page());
    }

    #[test]
    fn mapping_error_names_addresses() {
        let mem = TestMemory::new(1);
        let frames = mem.frame_allocator();
        let vmm = VirtualMemoryManager::new(&frames);
        let table = vmm.create_table().unwrap();

        let err = vmm
            .memory_map(
                Some(&table),
                VirtualAddress::new(0x1000),
                PhysicalAddress::new(0x2000),
                false,
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to map VA(0x0000000000001000) to PA(0x0000000000002000)"
        );
        assert!(matches!(
            vmm.create_table(),
            Err(VmmError::OutOfMemory(MapError::OutOfMemory(_)))
        ));
    }
}
