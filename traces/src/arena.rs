//  Bump allocation of trace records from large page-aligned chunks.

use core::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::page::PageAllocator;

//  Every allocation is rounded up to this, so trace records are naturally aligned.
const ALIGNMENT: usize = 8;

/// A bump allocator over a chain of fixed-size chunks.
///
/// Chunks are never individually freed: the arena only grows, until `release` returns everything at once. This is
/// what makes `alloc` safe to call concurrently and from signal handlers: the fast path is a single atomic bump,
/// the slow path installs a fresh chunk with a single compare-and-swap.
pub(crate) struct ChunkArena {
    //  Newest chunk; chunks link backwards through their headers. Null until the first allocation.
    current: AtomicPtr<ChunkHeader>,
    chunk_size: usize,
}

#[repr(C)]
struct ChunkHeader {
    prev: *mut ChunkHeader,
    //  Bump cursor, in bytes from the start of the chunk, header included. May overshoot `chunk_size` when racing
    //  allocations lose; readers clamp.
    used: AtomicUsize,
}

const HEADER: usize = mem::size_of::<ChunkHeader>();

impl ChunkArena {
    /// Creates an empty arena; the first chunk is installed by the first allocation.
    pub(crate) fn new(chunk_size: usize) -> Self {
        debug_assert!(chunk_size > HEADER + ALIGNMENT);

        let current = AtomicPtr::new(ptr::null_mut());

        Self { current, chunk_size }
    }

    /// Allocates `size` bytes, aligned to 8 bytes, zero-filled.
    ///
    /// Returns `None` if `size` can never fit in a chunk, or if a fresh chunk could not be obtained from `pages`.
    pub(crate) fn alloc<P>(&self, size: usize, pages: &P) -> Option<NonNull<u8>>
    where
        P: PageAllocator,
    {
        let size = (size.checked_add(ALIGNMENT - 1)?) & !(ALIGNMENT - 1);

        if size > self.chunk_size - HEADER {
            return None;
        }

        let mut chunk = self.current.load(Ordering::Acquire);

        loop {
            if let Some(chunk) = NonNull::new(chunk) {
                if let Some(pointer) = self.bump(chunk, size) {
                    return Some(pointer);
                }
            }

            chunk = self.grow(chunk, pages)?;
        }
    }

    /// Returns the number of bytes of trace data currently allocated.
    pub(crate) fn used(&self) -> usize {
        let mut total = 0;

        let mut chunk = self.current.load(Ordering::Acquire);

        while let Some(header) = NonNull::new(chunk) {
            //  Safety:
            //  -   Chunks stay live until `release`, which requires exclusive access.
            let header = unsafe { header.as_ref() };

            total += header.used.load(Ordering::Relaxed).min(self.chunk_size) - HEADER;
            chunk = header.prev;
        }

        total
    }

    /// Releases every chunk, returning the arena to its empty state.
    ///
    /// Exclusive access guarantees no allocation is in flight.
    pub(crate) fn release<P>(&mut self, pages: &P)
    where
        P: PageAllocator,
    {
        let mut chunk = mem::replace(self.current.get_mut(), ptr::null_mut());

        while let Some(header) = NonNull::new(chunk) {
            //  Safety:
            //  -   The chunk is live, and no longer reachable from `current`.
            let prev = unsafe { header.as_ref().prev };

            //  Safety:
            //  -   The chunk was allocated by `pages` with `chunk_size` bytes, and is not referenced anymore.
            unsafe { pages.safe_free(header.cast(), self.chunk_size) };

            chunk = prev;
        }
    }

    //  Attempts to reserve `size` bytes in `chunk`; fails if the chunk is (or just became) full.
    fn bump(&self, chunk: NonNull<ChunkHeader>, size: usize) -> Option<NonNull<u8>> {
        //  Safety:
        //  -   The chunk is live: chunks are only freed under exclusive access.
        let header = unsafe { chunk.as_ref() };

        //  Quick check to avoid incrementing pointlessly:
        //
        //  -   It's good safety wise, to keep the cursor from running away.
        //  -   It's good performance wise, as pure reads are cheaper than RMW.
        if header.used.load(Ordering::Relaxed).saturating_add(size) > self.chunk_size {
            return None;
        }

        //  Of course, with concurrency, there may still be other threads bumping before we do.
        let offset = header.used.fetch_add(size, Ordering::Relaxed);

        //  Got beaten to the punch; the outer loop will move on to a fresh chunk.
        if offset.saturating_add(size) > self.chunk_size {
            return None;
        }

        //  Exclusive access to `offset..(offset + size)` has been secured.

        //  Safety:
        //  -   `offset` is within the chunk allocation.
        let pointer = unsafe { chunk.as_ptr().cast::<u8>().add(offset) };

        //  Safety:
        //  -   `pointer` derives from a non-null allocation, and `add` did not overflow.
        Some(unsafe { NonNull::new_unchecked(pointer) })
    }

    //  Installs a fresh chunk in front of `current`.
    //
    //  Losing the installation race is fine: the loser frees its chunk and returns the winner's, which the caller
    //  retries on.
    fn grow<P>(&self, current: *mut ChunkHeader, pages: &P) -> Option<*mut ChunkHeader>
    where
        P: PageAllocator,
    {
        let fresh = pages.safe_alloc(self.chunk_size)?.cast::<ChunkHeader>();

        //  Safety:
        //  -   `fresh` is valid for writes and page-aligned, which exceeds header alignment.
        unsafe {
            fresh.as_ptr().write(ChunkHeader {
                prev: current,
                used: AtomicUsize::new(HEADER),
            })
        };

        match self
            .current
            .compare_exchange(current, fresh.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(fresh.as_ptr()),
            Err(winner) => {
                //  Safety:
                //  -   `fresh` was never published.
                unsafe { pages.safe_free(fresh.cast(), self.chunk_size) };

                Some(winner)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::page::{SystemPages, PAGE_SIZE};

    fn fixture() -> (ChunkArena, SystemPages) {
        (ChunkArena::new(PAGE_SIZE), SystemPages)
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let (mut arena, pages) = fixture();

        let first = arena.alloc(24, &pages).unwrap();
        let second = arena.alloc(17, &pages).unwrap();

        assert_eq!(0, first.as_ptr() as usize % ALIGNMENT);
        assert_eq!(0, second.as_ptr() as usize % ALIGNMENT);

        //  17 bytes round up to 24.
        assert_eq!(24, second.as_ptr() as usize - first.as_ptr() as usize);
        assert_eq!(48, arena.used());

        arena.release(&pages);
    }

    #[test]
    fn spills_into_a_fresh_chunk() {
        let (mut arena, pages) = fixture();

        let room = PAGE_SIZE - HEADER;

        let first = arena.alloc(room, &pages).unwrap();
        let second = arena.alloc(room, &pages).unwrap();

        assert_ne!(first, second);
        assert_eq!(2 * room, arena.used());

        arena.release(&pages);
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let (mut arena, pages) = fixture();

        assert!(arena.alloc(PAGE_SIZE, &pages).is_none());
        assert!(arena.alloc(usize::MAX, &pages).is_none());
        assert_eq!(0, arena.used());

        arena.release(&pages);
    }

    #[test]
    fn release_resets_to_empty() {
        let (mut arena, pages) = fixture();

        let _ = arena.alloc(128, &pages).unwrap();

        arena.release(&pages);

        assert_eq!(0, arena.used());

        //  The arena remains usable: the next allocation installs a fresh chunk.
        let _ = arena.alloc(128, &pages).unwrap();

        assert_eq!(128, arena.used());

        arena.release(&pages);
    }
} // mod tests
