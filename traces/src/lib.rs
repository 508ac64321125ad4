//! Quasi wait-free call trace storage.
//!
//! The `TraceStorage` is a quasi wait-free data-structure which deduplicates call traces captured by a sampling
//! profiler, and is specifically designed to be called from signal handlers interrupting arbitrary threads.
//!
//!
//! #   How to use?
//!
//! If you just want to get going, use the `new` method, and you'll get a default configured `TraceStorage` which
//! will be quite fine.
//!
//! On every sample, hand the captured frames to `put` and keep the small `TraceId` it returns: identical traces map
//! to identical IDs for as long as the storage lives. When dumping a profile, pause sampling and call `collect` to
//! enumerate every (ID, trace) pair observed so far.
//!
//!
//! #   Configuration options
//!
//! The `TraceStorage` offers multiple configuration options, available via the `StorageBuilder`:
//!
//! -   The capacity of the original hash table can be tuned, it defaults to 65,536 slots.
//! -   The size of the arena chunks holding the trace bytes can be tuned, it defaults to 8 MiB.
//! -   The page allocator can be swapped, it defaults to zeroed allocations from the global allocator. A profiler
//!     which requires the growth slow path to be async-signal-safe supplies an `mmap`-backed implementation here.
//!
//!
//! #   Limits
//!
//! The `TraceStorage` has some hard limits, due to design constraints:
//!
//! -   It never forgets: traces are only released wholesale, by `clear` or destruction.
//! -   It deduplicates by 64-bit hash, not by content. Two traces colliding on their hash share an ID, and the
//!     stored trace is whichever was inserted first. At profiling populations (~2^20 distinct traces) the collision
//!     probability is negligible.
//! -   A trace whose hash is 0 is indistinguishable from an empty slot. It still receives a stable ID, but its
//!     frames are never stored and `collect` does not emit it.
//!
//!
//! #   Internals
//!
//! The storage is a chain of open-addressed hash tables:
//!
//! -   Each table maps 64-bit trace hashes to pointers into an append-only arena where the frames are copied.
//! -   When a table reaches a load factor of 3/4, a successor of twice its capacity is linked in front of it. The
//!     predecessors are never rehashed nor freed, which is the key to both wait-freedom and ID stability.
//! -   An ID encodes the position of its slot within the chain, so IDs issued by older tables remain valid forever.
//!
//! Within a table, insertion claims a slot with a single compare-and-swap on the hash key, probing triangularly on
//! collisions. The arena is a bump allocator over large page-aligned chunks, growing by installing a fresh chunk
//! with a single compare-and-swap. Neither path ever blocks, and the hot path performs no allocation at all.

//  Use only core and alloc, guaranteeing no I/O nor threads.
#![cfg_attr(not(test), no_std)]
//  Ensure unsafe operations are duly checked.
#![deny(unsafe_op_in_unsafe_fn)]
//  Ensure proper documentation.
#![deny(missing_docs)]

//  Non-core must be explicitly depended on in no_std.
extern crate alloc;

mod arena;
mod error;
mod hash;
mod id;
mod page;
mod storage;
mod table;
mod trace;

pub use error::StorageError;
pub use id::TraceId;
pub use page::{PageAllocator, SystemPages, PAGE_SIZE};
pub use storage::{StorageBuilder, TraceStorage, CALL_TRACE_CHUNK, INITIAL_CAPACITY};
pub use trace::{CallFrame, CallTrace};

#[doc(hidden)]
pub mod compile_tests {

    //  Bad enough it needs to be `pub`, there's really no sense in exposing it any further.
    #![allow(dead_code)]

    /// ```compile_fail,E0277
    /// fn ensure_send<T: Send>() {}
    ///
    /// struct NoSendP(std::rc::Rc<u32>);
    ///
    /// impl hoth_traces::PageAllocator for NoSendP {
    ///     fn safe_alloc(&self, _: usize) -> Option<std::ptr::NonNull<u8>> { todo!() }
    ///     unsafe fn safe_free(&self, _: std::ptr::NonNull<u8>, _: usize) { todo!() }
    /// }
    ///
    /// ensure_send::<hoth_traces::TraceStorage<NoSendP>>();
    /// ```
    pub fn storage_not_send_if_allocator_not_send() {}

    /// ```compile_fail,E0277
    /// fn ensure_sync<T: Sync>() {}
    ///
    /// struct NoSyncP(std::cell::Cell<u32>);
    ///
    /// impl hoth_traces::PageAllocator for NoSyncP {
    ///     fn safe_alloc(&self, _: usize) -> Option<std::ptr::NonNull<u8>> { todo!() }
    ///     unsafe fn safe_free(&self, _: std::ptr::NonNull<u8>, _: usize) { todo!() }
    /// }
    ///
    /// ensure_sync::<hoth_traces::TraceStorage<NoSyncP>>();
    /// ```
    pub fn storage_not_sync_if_allocator_not_sync() {}
} // mod compile_tests

// mod tests
