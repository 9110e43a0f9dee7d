//! # Kernel Heap
//!
//! Variable-sized allocations carved first-fit out of frames pulled from the
//! [`FrameAllocator`]. Frames are reached through the HHDM, so a run of
//! physically contiguous frames is also one contiguous block of heap memory.
//!
//! Every request is rounded up to [`HEAP_ALIGN`] bytes and preceded by a
//! header recording the block size, so payloads are always
//! `HEAP_ALIGN`-aligned and [`free`](HeapAllocator::free) needs no size.
//!
//! A single [`SpinLock`], taken with interrupts masked, covers the free list
//! for every operation. Growing the heap takes the frame allocator's lock
//! while holding it, never the reverse.
//!
//! The heap only grows when the frame allocator has enough free frames for
//! the request at hand, so a request that can never fit fails without
//! draining physical memory.

use crate::frame_alloc::FrameAllocator;
use crate::free_list::{FreeList, HEADER};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};
use kernel_info::memory::{FRAME_SIZE, HEAP_ALIGN, HEAP_EXPAND_PAGES};
use kernel_sync::SpinLock;
use log::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("the heap is not initialized")]
    NotInitialized,
    #[error("the heap is already initialized")]
    AlreadyInitialized,
    /// The free list had no fitting block and the frame allocator could not
    /// provide more frames.
    #[error("out of heap memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
}

struct HeapState<'f> {
    free: FreeList,
    frames: Option<&'f FrameAllocator>,
    expansions: usize,
    arena_bytes: usize,
}

impl<'f> HeapState<'f> {
    const fn new() -> Self {
        Self {
            free: FreeList::new(),
            frames: None,
            expansions: 0,
            arena_bytes: 0,
        }
    }

    fn frames(&self) -> Result<&'f FrameAllocator, HeapError> {
        self.frames.ok_or(HeapError::NotInitialized)
    }

    /// Pull up to `pages` frames and put them on the free list, one block per
    /// contiguous run. Returns the number of frames obtained.
    fn expand(&mut self, pages: usize) -> usize {
        let Some(frames) = self.frames else {
            return 0;
        };
        let mapper = frames.mapper();

        let mut run: Option<(NonNull<u8>, usize)> = None;
        let mut got = 0;
        for _ in 0..pages {
            let Ok(frame) = frames.allocate_page() else {
                break;
            };
            let Some(page) = NonNull::new(mapper.ptr::<u8>(frame.base())) else {
                // SAFETY: the frame was just allocated and is not used.
                unsafe { frames.free_page(frame) };
                break;
            };
            got += 1;

            run = match run {
                Some((start, len)) if start.as_ptr().wrapping_add(len) == page.as_ptr() => {
                    Some((start, len + FRAME_SIZE))
                }
                Some((start, len)) if page.as_ptr().wrapping_add(FRAME_SIZE) == start.as_ptr() => {
                    Some((page, len + FRAME_SIZE))
                }
                Some((start, len)) => {
                    // SAFETY: the run consists of frames we own exclusively.
                    unsafe { self.free.push(start, len) };
                    Some((page, FRAME_SIZE))
                }
                None => Some((page, FRAME_SIZE)),
            };
        }
        if let Some((start, len)) = run {
            // SAFETY: as above
            unsafe { self.free.push(start, len) };
        }

        if got > 0 {
            self.expansions += 1;
            self.arena_bytes += got * FRAME_SIZE;
            debug!(
                "heap grew by {got} frames to {} KiB",
                self.arena_bytes / 1024
            );
        }
        got
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let frames = self.frames()?;
        let oom = HeapError::OutOfMemory { requested: size };
        let rounded = size
            .max(1)
            .checked_next_multiple_of(HEAP_ALIGN)
            .ok_or(oom)?;

        // SAFETY: the list only ever holds blocks pushed by `expand` or
        // released by `free`, all owned by this heap.
        if let Some(p) = unsafe { self.free.take(rounded) } {
            return Ok(p);
        }

        let needed = rounded.saturating_add(HEADER).div_ceil(FRAME_SIZE);
        let available = frames.free_frames();
        if available < needed {
            debug!("heap needs {needed} frames for {size} bytes, {available} free");
            return Err(oom);
        }
        if self.expand(needed.max(HEAP_EXPAND_PAGES)) == 0 {
            return Err(oom);
        }
        // SAFETY: as above
        unsafe { self.free.take(rounded) }.ok_or(oom)
    }
}

/// First-fit kernel heap backed by a [`FrameAllocator`].
pub struct HeapAllocator<'f> {
    state: SpinLock<HeapState<'f>>,
}

impl Default for HeapAllocator<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'f> HeapAllocator<'f> {
    /// A heap without backing memory; every allocation fails with
    /// [`HeapError::NotInitialized`] until [`init`](Self::init) is called.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(HeapState::new()),
        }
    }

    /// Attach the heap to `frames` and seed it with enough frames for
    /// `initial_bytes`, rounded up to whole frames.
    ///
    /// Returns the number of frames obtained. Getting fewer than requested is
    /// not an error; the heap grows on demand later.
    ///
    /// # Errors
    /// [`HeapError::AlreadyInitialized`] on a second call.
    pub fn init(
        &self,
        frames: &'f FrameAllocator,
        initial_bytes: usize,
    ) -> Result<usize, HeapError> {
        let mut state = self.state.lock_irq();
        if state.frames.is_some() {
            return Err(HeapError::AlreadyInitialized);
        }
        state.frames = Some(frames);

        let pages = initial_bytes.div_ceil(FRAME_SIZE);
        if pages == 0 {
            return Ok(0);
        }
        let got = state.expand(pages);
        if got < pages {
            warn!("heap wanted {pages} initial frames but got {got}");
        }
        info!("heap ready with {} KiB", state.arena_bytes / 1024);
        Ok(got)
    }

    /// Grow the heap by up to `pages` frames, returning how many were added.
    pub fn expand_heap(&self, pages: usize) -> usize {
        self.state.lock_irq().expand(pages)
    }

    /// Allocate `size` bytes, aligned to [`HEAP_ALIGN`].
    ///
    /// A zero-byte request still returns a unique pointer.
    ///
    /// # Errors
    /// - [`HeapError::NotInitialized`] before [`init`](Self::init).
    /// - [`HeapError::OutOfMemory`] if the heap cannot grow enough.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.state.lock_irq().allocate(size)
    }

    /// Return a block to the heap. Null is ignored.
    ///
    /// # Safety
    /// `ptr` must be null or come from [`allocate`](Self::allocate) or
    /// [`reallocate`](Self::reallocate) on this heap, and must not be freed
    /// twice or used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let mut state = self.state.lock_irq();
        // SAFETY: caller contract
        unsafe { state.free.release(ptr) };
    }

    /// Move a block into a new one of `new_size` bytes, keeping its
    /// contents up to the smaller of both sizes.
    ///
    /// A null `ptr` behaves like [`allocate`](Self::allocate). On error the
    /// old block is left untouched and still owned by the caller.
    ///
    /// # Errors
    /// Same as [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// Same as [`free`](Self::free).
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let mut state = self.state.lock_irq();
        let new = state.allocate(new_size)?;
        let Some(old) = NonNull::new(ptr) else {
            return Ok(new);
        };
        // SAFETY: caller contract; the new block was just carved from free
        // memory and cannot overlap the live old one.
        unsafe {
            let keep = FreeList::payload_size(old).min(new_size);
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), keep);
            state.free.release(old);
        }
        Ok(new)
    }

    /// How often the heap pulled frames from the frame allocator.
    #[must_use]
    pub fn expansions(&self) -> usize {
        self.state.lock_irq().expansions
    }

    /// Bytes currently on the free list, headers included.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.state.lock_irq().free.free_bytes()
    }

    /// Bytes ever pulled from the frame allocator.
    #[must_use]
    pub fn arena_bytes(&self) -> usize {
        self.state.lock_irq().arena_bytes
    }
}

unsafe impl GlobalAlloc for HeapAllocator<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return null_mut();
        }
        self.allocate(layout.size())
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return null_mut();
        }
        unsafe { self.reallocate(ptr, new_size) }.map_or(null_mut(), NonNull::as_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestMemory;
    use kernel_info::memory::INITIAL_HEAP_SIZE;

    #[test]
    fn allocate_before_init_fails() {
        let heap = HeapAllocator::new();
        assert_eq!(heap.allocate(8), Err(HeapError::NotInitialized));
        assert_eq!(heap.expand_heap(4), 0);
    }

    #[test]
    fn init_twice_fails() {
        let mem = TestMemory::new(4);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        assert_eq!(heap.init(&frames, 4096), Ok(1));
        assert_eq!(heap.init(&frames, 4096), Err(HeapError::AlreadyInitialized));
    }

    #[test]
    fn init_with_zero_bytes_pulls_nothing() {
        let mem = TestMemory::new(4);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        assert_eq!(heap.init(&frames, 0), Ok(0));
        assert_eq!(frames.free_frames(), 4);
        assert_eq!(heap.expansions(), 0);
    }

    #[test]
    fn contiguous_frames_form_one_block() {
        let mem = TestMemory::new(16);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        assert_eq!(heap.init(&frames, INITIAL_HEAP_SIZE), Ok(10));
        assert_eq!(heap.state.lock().free.blocks(), 1);
        assert_eq!(heap.free_bytes(), INITIAL_HEAP_SIZE);
        assert_eq!(heap.arena_bytes(), INITIAL_HEAP_SIZE);
    }

    #[test]
    fn expand_heap_stops_when_frames_run_out() {
        let mem = TestMemory::new(6);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 4096).unwrap();

        assert_eq!(heap.expand_heap(3), 3);
        assert_eq!(heap.expand_heap(8), 2);
        assert_eq!(heap.expand_heap(1), 0);
        assert_eq!(heap.expansions(), 3);
        assert_eq!(heap.arena_bytes(), 6 * FRAME_SIZE);
        assert_eq!(heap.free_bytes(), 6 * FRAME_SIZE);
    }

    #[test]
    fn init_shortfall_is_not_fatal() {
        let mem = TestMemory::new(3);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        assert_eq!(heap.init(&frames, INITIAL_HEAP_SIZE), Ok(3));
        assert!(heap.allocate(100).is_ok());
    }

    #[test]
    fn payloads_are_aligned_and_headers_rounded() {
        let mem = TestMemory::new(16);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 4096).unwrap();

        let a = heap.allocate(1).unwrap();
        let b = heap.allocate(0).unwrap();
        let c = heap.allocate(17).unwrap();
        for p in [a, b, c] {
            assert_eq!(p.as_ptr().addr() % HEAP_ALIGN, 0);
        }
        assert_eq!(b.as_ptr().addr() - a.as_ptr().addr(), HEADER + 16);
        assert_eq!(c.as_ptr().addr() - b.as_ptr().addr(), HEADER + 16);
        assert_eq!(heap.free_bytes(), 4096 - 3 * HEADER - 16 - 16 - 32);
    }

    #[test]
    fn large_request_grows_by_more_than_the_batch() {
        let mem = TestMemory::new(32);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 4096).unwrap();

        let big = 12 * FRAME_SIZE;
        let p = heap.allocate(big).unwrap();
        unsafe { p.as_ptr().write_bytes(0x11, big) };
        assert_eq!(heap.expansions(), 2);
        assert_eq!(frames.free_frames(), 32 - 1 - 13);
    }

    #[test]
    fn exhausted_frames_report_out_of_memory() {
        let mem = TestMemory::new(2);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 8192).unwrap();

        let requested = 3 * FRAME_SIZE;
        let err = heap.allocate(requested).unwrap_err();
        assert_eq!(err, HeapError::OutOfMemory { requested });
        assert_eq!(err.to_string(), "out of heap memory allocating 12288 bytes");

        let requested = usize::MAX;
        assert_eq!(
            heap.allocate(requested),
            Err(HeapError::OutOfMemory { requested })
        );
    }

    #[test]
    fn request_beyond_free_frames_does_not_grow() {
        let mem = TestMemory::new(64);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 4096).unwrap();

        let huge = heap.allocate(1 << 30);
        assert!(matches!(huge, Err(HeapError::OutOfMemory { .. })));
        assert_eq!(frames.free_frames(), 63);
        assert_eq!(heap.arena_bytes(), FRAME_SIZE);
        assert_eq!(heap.expansions(), 1);

        // one frame short once the header is counted
        assert!(heap.allocate(63 * FRAME_SIZE).is_err());
        assert_eq!(frames.free_frames(), 63);

        assert!(heap.allocate(62 * FRAME_SIZE).is_ok());
        assert_eq!(frames.free_frames(), 0);
        assert_eq!(heap.expansions(), 2);
    }

    #[test]
    fn free_makes_block_reusable() {
        let mem = TestMemory::new(4);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 4096).unwrap();

        let a = heap.allocate(64).unwrap();
        unsafe { heap.free(a.as_ptr()) };
        let b = heap.allocate(64).unwrap();
        assert_eq!(a, b);
        unsafe { heap.free(null_mut()) };
    }

    #[test]
    fn reallocate_keeps_prefix() {
        let mem = TestMemory::new(8);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 8192).unwrap();

        let old = heap.allocate(32).unwrap();
        unsafe {
            for i in 0..32u8 {
                old.as_ptr().add(usize::from(i)).write(i);
            }
            let grown = heap.reallocate(old.as_ptr(), 256).unwrap();
            let kept = core::slice::from_raw_parts(grown.as_ptr(), 32);
            assert!(kept.iter().copied().eq(0..32u8));

            let shrunk = heap.reallocate(grown.as_ptr(), 8).unwrap();
            let kept = core::slice::from_raw_parts(shrunk.as_ptr(), 8);
            assert!(kept.iter().copied().eq(0..8u8));
        }
    }

    #[test]
    fn reallocate_null_allocates_and_failure_keeps_old_block() {
        let mem = TestMemory::new(1);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 4096).unwrap();

        let p = unsafe { heap.reallocate(null_mut(), 16) }.unwrap();
        unsafe { p.as_ptr().write_bytes(0x77, 16) };

        let err = unsafe { heap.reallocate(p.as_ptr(), 2 * FRAME_SIZE) };
        assert!(matches!(err, Err(HeapError::OutOfMemory { .. })));
        let still = unsafe { core::slice::from_raw_parts(p.as_ptr(), 16) };
        assert!(still.iter().all(|&b| b == 0x77));
    }

    #[test]
    fn global_alloc_rejects_large_alignment() {
        let mem = TestMemory::new(4);
        let frames = mem.frame_allocator();
        let heap = HeapAllocator::new();
        heap.init(&frames, 4096).unwrap();

        unsafe {
            let layout = Layout::from_size_align(64, 16).unwrap();
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            let q = heap.realloc(p, layout, 128);
            assert!(!q.is_null());
            heap.dealloc(q, Layout::from_size_align(128, 16).unwrap());

            let over_aligned = Layout::from_size_align(64, 64).unwrap();
            assert!(heap.alloc(over_aligned).is_null());
        }
    }
}
