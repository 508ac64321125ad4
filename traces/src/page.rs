//  Page-aligned allocation, the only path by which the storage acquires memory.

use core::{cmp, ptr::NonNull};

use crate::alloc::alloc::{self, Layout};

/// Alignment and granularity of page allocations, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A source of page-aligned, zero-filled memory regions.
///
/// The storage allocates nothing else: hash tables and arena chunks are both carved out of regions obtained here.
///
/// #   Signal safety.
///
/// The table-growth and chunk-growth slow paths of `put` call `safe_alloc` from whatever context `put` runs in,
/// including signal handlers. The default `SystemPages` implementation goes through the global allocator, which is
/// NOT async-signal-safe; a profiler needing that guarantee supplies an implementation backed by `mmap`, which is
/// async-signal-safe on the platforms such a profiler targets.
pub trait PageAllocator {
    /// Allocates a zero-filled region of at least `size` bytes, aligned to `PAGE_SIZE`.
    ///
    /// Returns `None` when the memory cannot be allocated; never aborts.
    fn safe_alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a region previously obtained from `safe_alloc`.
    ///
    /// #   Safety
    ///
    /// -   `ptr` must have been returned by `safe_alloc` on this same instance, with this same `size`.
    /// -   `ptr` must not have been released already.
    unsafe fn safe_free(&self, ptr: NonNull<u8>, size: usize);
}

/// Page allocation through the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPages;

impl PageAllocator for SystemPages {
    fn safe_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = page_layout(size)?;

        //  Safety:
        //  -   `layout` has a non-zero size.
        let pointer = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(pointer)
    }

    unsafe fn safe_free(&self, ptr: NonNull<u8>, size: usize) {
        let layout = page_layout(size).expect("layout computed at allocation");

        //  Safety:
        //  -   `ptr` was allocated by `alloc_zeroed`, per this trait's contract.
        //  -   `layout` is computed exactly as it was at allocation, since `size` is the same.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

//
//  Implementation
//

fn page_layout(size: usize) -> Option<Layout> {
    let size = cmp::max(size, 1).checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);

    Layout::from_size_align(size, PAGE_SIZE).ok()
}

// mod tests
