//! # Memory Layout and Allocator Configuration

/// Size of a physical frame and of the smallest mapping.
pub const FRAME_SIZE: usize = 4096;

/// Entries per page table at every paging level.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Where the kernel executes (VMA) on a typical higher-half boot.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Bytes requested for the kernel heap during boot.
pub const INITIAL_HEAP_SIZE: usize = 10 * 4096;

/// Frames pulled from the frame allocator each time the heap runs dry.
pub const HEAP_EXPAND_PAGES: usize = 10;

/// Alignment of every heap payload; also the size of a heap block header.
pub const HEAP_ALIGN: usize = 16;

const _: () = {
    assert!(FRAME_SIZE.is_power_of_two());
    assert!(PAGE_TABLE_ENTRIES * 8 == FRAME_SIZE);
    assert!(INITIAL_HEAP_SIZE.is_multiple_of(FRAME_SIZE));
    assert!(HEAP_EXPAND_PAGES > 0);
    assert!(HEAP_ALIGN.is_power_of_two());
    assert!(KERNEL_BASE.is_multiple_of(FRAME_SIZE as u64));
};
