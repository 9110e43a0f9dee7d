use core::ptr::{NonNull, null_mut};
use kernel_info::memory::HEAP_ALIGN;

/// Header stored at the beginning of every block, free or allocated.
///
/// ```text
/// +----------------------+-------------------------+
/// | Node (header)        |      payload            |
/// +----------------------+-------------------------+
/// ^ block                ^ block + HEADER
/// <----------------- size ------------------------->
/// ```
///
/// - `size` is the **total** span of the block, header included.
/// - `next` links free blocks; it is meaningless while the block is allocated.
#[repr(C)]
struct Node {
    size: usize,
    next: *mut Node,
}

/// Bytes in front of every payload.
pub const HEADER: usize = size_of::<Node>();

const _: () = assert!(HEADER == HEAP_ALIGN);

/// A first-fit free list without coalescing.
///
/// Blocks are pushed at the head and carved front-to-back; a remainder big
/// enough for a header goes back on the list in place of the block it was
/// cut from.
///
/// # Invariants
/// - Free blocks do not overlap and lie in memory owned by the heap.
/// - Every block starts `HEAP_ALIGN`-aligned and spans a multiple of `HEAP_ALIGN`.
/// - `head` is a sentinel; the first real block is at `head.next`.
pub struct FreeList {
    head: Node,
}

// Safety: the list is only used behind the heap's lock; the raw pointers
// point into frames owned by the heap.
unsafe impl Send for FreeList {}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: Node {
                size: 0,
                next: null_mut(),
            },
        }
    }

    /// Add a fresh free block of `size` bytes starting at `block`.
    ///
    /// # Safety
    /// - `[block, block + size)` must be writable memory owned by the heap
    ///   and not on the list already.
    /// - `block` must be `HEAP_ALIGN`-aligned and `size` a multiple of
    ///   `HEAP_ALIGN` of at least [`HEADER`].
    pub unsafe fn push(&mut self, block: NonNull<u8>, size: usize) {
        let node = block.as_ptr().cast::<Node>();
        unsafe {
            node.write(Node {
                size,
                next: self.head.next,
            });
        }
        self.head.next = node;
    }

    /// Put an allocated block back, keeping its recorded size.
    ///
    /// # Safety
    /// `payload` must have been returned by [`take`](Self::take) on this list
    /// and not released since.
    pub unsafe fn release(&mut self, payload: NonNull<u8>) {
        unsafe {
            let node = Self::node_of(payload);
            (*node).next = self.head.next;
            self.head.next = node;
        }
    }

    /// Usable bytes of an allocated block.
    ///
    /// # Safety
    /// Same as [`release`](Self::release).
    pub unsafe fn payload_size(payload: NonNull<u8>) -> usize {
        unsafe { (*Self::node_of(payload)).size - HEADER }
    }

    unsafe fn node_of(payload: NonNull<u8>) -> *mut Node {
        unsafe { payload.as_ptr().sub(HEADER).cast::<Node>() }
    }

    /// Carve `size` payload bytes out of the first block that fits.
    ///
    /// `size` must be a multiple of `HEAP_ALIGN`. Returns the payload pointer.
    ///
    /// # Safety
    /// The list invariants must hold.
    pub unsafe fn take(&mut self, size: usize) -> Option<NonNull<u8>> {
        let needed = HEADER.checked_add(size)?;

        let mut prev = &raw mut self.head;
        let mut current = self.head.next;
        while !current.is_null() {
            unsafe {
                let span = (*current).size;
                if span >= needed {
                    if span - needed >= HEADER {
                        let rest = current.cast::<u8>().add(needed).cast::<Node>();
                        rest.write(Node {
                            size: span - needed,
                            next: (*current).next,
                        });
                        (*prev).next = rest;
                        (*current).size = needed;
                    } else {
                        (*prev).next = (*current).next;
                    }
                    (*current).next = null_mut();
                    return NonNull::new(current.cast::<u8>().add(HEADER));
                }
                prev = current;
                current = (*current).next;
            }
        }
        None
    }

    /// Total bytes of all free blocks, headers included.
    pub fn free_bytes(&self) -> usize {
        self.iter().sum()
    }

    /// Number of free blocks.
    pub fn blocks(&self) -> usize {
        self.iter().count()
    }

    /// Sizes of the free blocks, in list order.
    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut current = self.head.next;
        core::iter::from_fn(move || {
            if current.is_null() {
                return None;
            }
            // SAFETY: nodes on the list are valid while `self` is borrowed.
            let node = unsafe { &*current };
            current = node.next;
            Some(node.size)
        })
    }
}
