//  Implementation of the `TraceStorage`.

use core::ptr;

use crate::alloc::collections::BTreeMap;

use crate::{
    arena::ChunkArena,
    error::StorageError,
    hash::murmur64a,
    id::TraceId,
    page::{PageAllocator, SystemPages, PAGE_SIZE},
    table::{Claim, Table, TableChain},
    trace::{raw_bytes, CallFrame, CallTrace},
};

/// Capacity of the original hash table; each successor doubles it.
pub const INITIAL_CAPACITY: u32 = 65536;

/// Size of the arena chunks holding the trace records.
pub const CALL_TRACE_CHUNK: usize = 8 * 1024 * 1024;

/// A deduplicating store of call traces.
///
/// The storage is designed for maximum wait-freedom in the face of parallel insertions, including insertions from
/// signal handlers: `put` takes no lock, never calls the general allocator, and completes in a bounded number of
/// steps.
///
/// `collect` and `clear` are enumeration and maintenance operations; the profiler quiesces sampling around them.
pub struct TraceStorage<P = SystemPages>
where
    P: PageAllocator,
{
    chain: TableChain,
    arena: ChunkArena,
    pages: P,
    initial_capacity: u32,
}

impl TraceStorage<SystemPages> {
    /// Creates a new TraceStorage, with default configuration.
    ///
    /// This may fail if the allocator cannot currently allocate enough memory for the original table.
    ///
    /// To customize the storage, use the `with()` method instead.
    pub fn new() -> Result<Self, StorageError> {
        Self::with(SystemPages).build()
    }
}

impl<P> TraceStorage<P>
where
    P: PageAllocator,
{
    /// Creates a builder for the TraceStorage, allowing finer-grained tuning.
    pub fn with(pages: P) -> StorageBuilder<P> {
        let initial_capacity = INITIAL_CAPACITY;
        let chunk_size = CALL_TRACE_CHUNK;

        StorageBuilder {
            pages,
            initial_capacity,
            chunk_size,
        }
    }

    /// Records a trace, returning its stable ID.
    ///
    /// Identical frame sequences receive identical IDs, whichever thread inserts them and in whatever order:
    /// concurrent insertions of the same novel trace all return the one ID of the slot that won the race. After
    /// the chain grows, the next insertion of a known trace claims a slot in the newer table and thus a new ID;
    /// both IDs stay valid until `clear`, enumerate through `collect`, and share the same underlying record.
    ///
    /// Returns `None` in the vanishingly rare case where the current table is full and could not grow; the sample
    /// is then simply dropped.
    ///
    /// This is the one operation safe to call from a signal handler, subject to the page allocator's own
    /// guarantees on the growth slow path.
    pub fn put(&self, frames: &[CallFrame]) -> Option<TraceId> {
        let hash = murmur64a(raw_bytes(frames));

        let table = self.chain.head();

        match table.claim(hash) {
            Claim::Hit(slot) => Some(self.id_of(table, slot)),
            Claim::Fresh(slot) => {
                //  If the load factor reaches 3/4 with this insertion, reserve a successor table. Only the one
                //  thread observing the exact threshold attempts it.
                if table.inc_size() == table.capacity() / 4 * 3 {
                    self.grow(table);
                }

                //  A trace interned before the last growth lives in the predecessor; reuse it to save arena space.
                let trace = match table.prev().and_then(|previous| previous.find(hash)) {
                    Some(inherited) => inherited.as_ptr(),
                    None => self.store_trace(frames),
                };

                table.publish(slot, trace);

                Some(self.id_of(table, slot))
            }
            Claim::Overflow => None,
        }
    }

    /// Enumerates every (ID, trace) pair recorded so far into `map`.
    ///
    /// A trace maps to `None` when its record could not be allocated; consumers tolerate such entries.
    ///
    /// The enumeration is only meaningful while sampling is quiesced: concurrent insertions may surface as claimed
    /// IDs whose trace is still `None`.
    pub fn collect<'a>(&'a self, map: &mut BTreeMap<TraceId, Option<&'a CallTrace>>) {
        let mut emitted = 0usize;

        let mut table = Some(self.chain.head());

        while let Some(current) = table {
            for (slot, value) in current.entries() {
                //  Safety:
                //  -   Published pointers reference live, fully written arena records.
                //  -   The records are immutable until `clear`, which borrows exclusively.
                let trace = value.map(|pointer| unsafe { CallTrace::resolve(pointer) });

                map.insert(self.id_of(current, slot), trace);
                emitted += 1;
            }

            table = current.prev();
        }

        log::trace!("collected {emitted} trace entries");
    }

    /// Forgets every trace, invalidating every ID issued so far.
    ///
    /// The chain shrinks back to the original table, and the arena releases its chunks. Exclusive access
    /// guarantees no insertion nor enumeration is in flight.
    pub fn clear(&mut self) {
        let mut destroyed = 0usize;

        let mut table = self.chain.head();

        while let Some(previous) = table.prev() {
            //  Safety:
            //  -   Exclusive access, and the handle is not used again.
            unsafe { table.destroy(&self.pages) };

            table = previous;
            destroyed += 1;
        }

        //  Safety:
        //  -   Exclusive access.
        unsafe { table.reset() };

        self.chain.set_head(table);

        self.arena.release(&self.pages);

        log::debug!("cleared storage: {destroyed} grown tables destroyed");
    }

    /// Returns the capacity of the newest table.
    pub fn capacity(&self) -> u32 {
        self.chain.head().capacity()
    }

    /// Returns the number of tables in the chain.
    pub fn depth(&self) -> usize {
        let mut depth = 0;

        let mut table = Some(self.chain.head());

        while let Some(current) = table {
            depth += 1;
            table = current.prev();
        }

        depth
    }

    /// Returns the number of occupied slots across the chain.
    ///
    /// An upper bound on the number of distinct traces: a trace re-inserted after a growth occupies a slot in two
    /// tables.
    pub fn len(&self) -> usize {
        let mut len = 0;

        let mut table = Some(self.chain.head());

        while let Some(current) = table {
            len += current.size() as usize;
            table = current.prev();
        }

        len
    }

    /// Returns whether no trace is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes of trace records currently held by the arena.
    pub fn arena_used(&self) -> usize {
        self.arena.used()
    }
}

//
//  Implementation
//

impl<P> TraceStorage<P>
where
    P: PageAllocator,
{
    fn id_of(&self, table: Table, slot: u32) -> TraceId {
        TraceId::encode(table.capacity(), self.initial_capacity, slot)
    }

    //  Copies the frames into a fresh arena record; null on allocation failure, which the slot tolerates.
    fn store_trace(&self, frames: &[CallFrame]) -> *mut u8 {
        let Some(block) = self.arena.alloc(CallTrace::bytes_for(frames.len()), &self.pages) else {
            return ptr::null_mut();
        };

        //  Safety:
        //  -   `block` covers `bytes_for(frames.len())` bytes, 8-byte aligned, exclusively reserved.
        unsafe { CallTrace::write(block, frames) };

        block.as_ptr()
    }

    //  Attempts to chain a successor of twice the capacity in front of `table`.
    //
    //  Failure is soft on every path: on allocation failure the storage continues on the current table, and on
    //  losing the swap race the freshly allocated table is returned to the allocator.
    fn grow(&self, table: Table) {
        let Some(capacity) = table.capacity().checked_mul(2) else { return };

        let Some(new_table) = Table::allocate(Some(table), capacity, &self.pages) else { return };

        if self.chain.try_swap(table, new_table).is_err() {
            //  Safety:
            //  -   `new_table` was never published.
            unsafe { new_table.destroy(&self.pages) };
        }
    }
}

impl<P> Drop for TraceStorage<P>
where
    P: PageAllocator,
{
    fn drop(&mut self) {
        let mut table = Some(self.chain.head());

        while let Some(current) = table {
            //  Safety:
            //  -   Exclusive access in drop; no handle survives.
            table = unsafe { current.destroy(&self.pages) };
        }

        self.arena.release(&self.pages);
    }
}

/// A builder for the TraceStorage.
pub struct StorageBuilder<P> {
    pages: P,
    initial_capacity: u32,
    chunk_size: usize,
}

impl<P> StorageBuilder<P> {
    /// Sets the capacity of the original hash table.
    ///
    /// Growth doubles from here; undersizing merely costs an extra table or two in the chain.
    ///
    /// #   Panics
    ///
    /// If `capacity` is not a power of 2, or is less than 64.
    pub fn set_initial_capacity(&mut self, capacity: u32) -> &mut Self {
        assert_eq!(1, capacity.count_ones());
        assert!(capacity >= 64);

        self.initial_capacity = capacity;
        self
    }

    /// Sets the size of the arena chunks holding the trace records.
    ///
    /// #   Panics
    ///
    /// If `bytes` is not a multiple of the page size, or is less than 64 KiB.
    pub fn set_chunk_size(&mut self, bytes: usize) -> &mut Self {
        assert_eq!(0, bytes % PAGE_SIZE);
        assert!(bytes >= 64 * 1024);

        self.chunk_size = bytes;
        self
    }
}

impl<P> StorageBuilder<P>
where
    P: PageAllocator,
{
    /// Attempts to build a TraceStorage with the current configuration.
    ///
    /// This may fail if the allocator cannot currently allocate enough memory for the original table.
    pub fn build(self) -> Result<TraceStorage<P>, StorageError> {
        let table =
            Table::allocate(None, self.initial_capacity, &self.pages).ok_or(StorageError::MemoryExhausted)?;

        let chain = TableChain::new(table);
        let arena = ChunkArena::new(self.chunk_size);

        Ok(TraceStorage {
            chain,
            arena,
            pages: self.pages,
            initial_capacity: self.initial_capacity,
        })
    }
}

// mod tests
