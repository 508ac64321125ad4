//  The open-addressed hash tables chained underneath the storage.
//
//  A table never rehashes: when it fills up, a successor of twice its capacity is linked in front of it, and the
//  table lives on, read-only in practice, until the whole chain is cleared. IDs encode slot positions, so this
//  chaining is what keeps every ID ever issued valid.

use core::{
    mem,
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering},
};

use crate::page::PageAllocator;

//  Keeps the contended size counter away from the read-mostly header fields.
#[repr(C, align(64))]
struct CacheAligned<T>(T);

#[repr(C)]
struct Header {
    prev: *mut Header,
    capacity: u32,
    size: CacheAligned<AtomicU32>,
}

//  The key and value arrays follow the header within the same page-aligned allocation.
const KEYS_OFFSET: usize = mem::size_of::<Header>();

/// A handle to one table of the chain.
///
/// The handle is a plain copyable pointer; the allocation behind it lives until `destroy`.
#[derive(Clone, Copy)]
pub(crate) struct Table(NonNull<Header>);

/// Outcome of a `claim`.
pub(crate) enum Claim {
    /// The hash already occupies this slot.
    Hit(u32),
    /// The hash was inserted into this slot, by this very call.
    Fresh(u32),
    /// The probe sequence was exhausted without finding a slot.
    Overflow,
}

impl Table {
    /// Allocates a table of `capacity` slots, chained in front of `prev`.
    ///
    /// The key and value arrays rely on the allocation being zero-filled.
    pub(crate) fn allocate<P>(prev: Option<Table>, capacity: u32, pages: &P) -> Option<Table>
    where
        P: PageAllocator,
    {
        debug_assert_eq!(1, capacity.count_ones());

        let block = pages.safe_alloc(Self::bytes_for(capacity)?)?;

        let header = block.cast::<Header>();
        let prev = prev.map_or(ptr::null_mut(), |table| table.0.as_ptr());

        //  Safety:
        //  -   `header` is valid for writes, freshly allocated.
        //  -   `header` is page-aligned, which exceeds its alignment requirement.
        unsafe {
            header.as_ptr().write(Header {
                prev,
                capacity,
                size: CacheAligned(AtomicU32::new(0)),
            })
        };

        Some(Table(header))
    }

    /// Releases the table's memory, returning its predecessor.
    ///
    /// #   Safety
    ///
    /// -   No concurrent access to the table may be possible.
    /// -   The table, and any handle to it, must not be used afterwards.
    pub(crate) unsafe fn destroy<P>(self, pages: &P) -> Option<Table>
    where
        P: PageAllocator,
    {
        let prev = self.prev();
        let bytes = Self::bytes_for(self.capacity()).expect("sized at allocation");

        //  Safety:
        //  -   The allocation was obtained from `pages` with exactly these bytes.
        //  -   Per this function's contract, nothing references it anymore.
        unsafe { pages.safe_free(self.0.cast(), bytes) };

        prev
    }

    /// Zeroes the keys and values, and resets the size.
    ///
    /// #   Safety
    ///
    /// -   No concurrent access to the table may be possible.
    pub(crate) unsafe fn reset(&self) {
        let capacity = self.capacity() as usize;
        let bytes = capacity * (mem::size_of::<u64>() + mem::size_of::<*mut u8>());

        //  Safety:
        //  -   The allocation covers `bytes` past the keys, and access is exclusive.
        unsafe { ptr::write_bytes(self.keys_pointer() as *mut u8, 0, bytes) };

        self.header().size.0.store(0, Ordering::Relaxed);
    }

    pub(crate) fn prev(&self) -> Option<Table> {
        NonNull::new(self.header().prev).map(Table)
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.header().capacity
    }

    pub(crate) fn size(&self) -> u32 {
        self.header().size.0.load(Ordering::Relaxed)
    }

    /// Records one insertion, returning the new size.
    pub(crate) fn inc_size(&self) -> u32 {
        self.header().size.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read-only lookup, using the same probe sequence as `claim`.
    ///
    /// Returns the published trace pointer, or `None` if the hash is absent or its trace not yet published.
    pub(crate) fn find(&self, hash: u64) -> Option<NonNull<u8>> {
        let keys = self.keys();
        let capacity = self.capacity();
        let mask = capacity - 1;

        let mut slot = (hash & u64::from(mask)) as u32;
        let mut step = 0u32;

        loop {
            //  Safety:
            //  -   `slot` is masked below capacity.
            let key = unsafe { keys.get_unchecked(slot as usize) }.load(Ordering::Acquire);

            if key == hash {
                return self.value(slot);
            }

            if key == 0 {
                return None;
            }

            step += 1;

            if step >= capacity {
                return None;
            }

            slot = (slot + step) & mask;
        }
    }

    /// Inserts `hash` if absent, claiming a slot with a single compare-and-swap.
    ///
    /// Triangular probing visits every slot of the power-of-two table, so `Overflow` only occurs once the table is
    /// truly full, which growth makes vanishingly rare.
    pub(crate) fn claim(&self, hash: u64) -> Claim {
        let keys = self.keys();
        let capacity = self.capacity();
        let mask = capacity - 1;

        let mut slot = (hash & u64::from(mask)) as u32;
        let mut step = 0u32;

        loop {
            //  Safety:
            //  -   `slot` is masked below capacity.
            let key = unsafe { keys.get_unchecked(slot as usize) };

            let current = key.load(Ordering::Acquire);

            if current == hash {
                return Claim::Hit(slot);
            }

            if current == 0 {
                match key.compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return Claim::Fresh(slot),
                    //  Another thread claimed the slot; it may have inserted this very hash, so re-examine it.
                    Err(_) => continue,
                }
            }

            step += 1;

            if step >= capacity {
                //  Very unlikely case of a table overflow.
                return Claim::Overflow;
            }

            //  Improved version of linear probing.
            slot = (slot + step) & mask;
        }
    }

    /// Publishes the trace pointer of a claimed slot.
    pub(crate) fn publish(&self, slot: u32, trace: *mut u8) {
        debug_assert!(slot < self.capacity());

        //  Safety:
        //  -   `slot` is below capacity, per the contract above.
        let value = unsafe { self.values().get_unchecked(slot as usize) };

        value.store(trace, Ordering::Release);
    }

    /// Returns the published trace pointer of a slot, or `None` if not (yet) published.
    pub(crate) fn value(&self, slot: u32) -> Option<NonNull<u8>> {
        debug_assert!(slot < self.capacity());

        //  Safety:
        //  -   `slot` is below capacity, per the contract above.
        let value = unsafe { self.values().get_unchecked(slot as usize) };

        NonNull::new(value.load(Ordering::Acquire))
    }

    /// Iterates over the occupied slots, with their published pointers.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (u32, Option<NonNull<u8>>)> + '_ {
        self.keys()
            .iter()
            .zip(self.values())
            .enumerate()
            .filter_map(|(slot, (key, value))| {
                (key.load(Ordering::Acquire) != 0)
                    .then(|| (slot as u32, NonNull::new(value.load(Ordering::Acquire))))
            })
    }
}

//
//  Implementation
//

impl Table {
    //  Returns the allocation size for `capacity` slots, before page rounding.
    fn bytes_for(capacity: u32) -> Option<usize> {
        let arrays = (capacity as usize).checked_mul(mem::size_of::<u64>() + mem::size_of::<*mut u8>())?;

        KEYS_OFFSET.checked_add(arrays)
    }

    fn header(&self) -> &Header {
        //  Safety:
        //  -   The pointer is live, aligned, and initialized at allocation.
        //  -   Shared access only, and the header fields are read-only or atomic.
        unsafe { self.0.as_ref() }
    }

    fn keys_pointer(&self) -> *const AtomicU64 {
        //  Safety:
        //  -   `KEYS_OFFSET` is within the allocation.
        unsafe { self.0.as_ptr().cast::<u8>().add(KEYS_OFFSET) as *const AtomicU64 }
    }

    fn keys(&self) -> &[AtomicU64] {
        let capacity = self.capacity() as usize;

        //  Safety:
        //  -   The allocation covers `capacity` keys past the header.
        //  -   Zero-filled memory is a valid `AtomicU64`.
        unsafe { slice::from_raw_parts(self.keys_pointer(), capacity) }
    }

    fn values(&self) -> &[AtomicPtr<u8>] {
        let capacity = self.capacity() as usize;

        //  Safety:
        //  -   The value array starts right after the `capacity` keys.
        let pointer = unsafe { self.keys_pointer().add(capacity) } as *const AtomicPtr<u8>;

        //  Safety:
        //  -   The allocation covers `capacity` values past the keys.
        //  -   Zero-filled memory is a valid (null) `AtomicPtr`.
        unsafe { slice::from_raw_parts(pointer, capacity) }
    }
}

/// The head of the table chain.
pub(crate) struct TableChain {
    head: AtomicPtr<Header>,
}

impl TableChain {
    /// Roots the chain at `table`.
    pub(crate) fn new(table: Table) -> Self {
        let head = AtomicPtr::new(table.0.as_ptr());

        Self { head }
    }

    /// Returns the newest table.
    pub(crate) fn head(&self) -> Table {
        let pointer = self.head.load(Ordering::Acquire);

        //  Safety:
        //  -   The head is never null once the chain is constructed.
        Table(unsafe { NonNull::new_unchecked(pointer) })
    }

    /// Swings the head from `current` to `new`, failing if another thread swung it first.
    pub(crate) fn try_swap(&self, current: Table, new: Table) -> Result<(), ()> {
        self.head
            .compare_exchange(current.0.as_ptr(), new.0.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ())
    }

    /// Re-roots the chain at `table`; exclusive access avoids any race.
    pub(crate) fn set_head(&mut self, table: Table) {
        *self.head.get_mut() = table.0.as_ptr();
    }
}

// mod tests
