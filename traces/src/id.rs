//  The ID of a call trace.

use core::num::NonZeroU32;

/// A `TraceId` uniquely identifies a call trace within its `TraceStorage`.
///
/// #   Tied to the `TraceStorage` instance.
///
/// A `TraceId` is only meaningful for the `TraceStorage` instance which returned it, and only until that instance
/// is cleared: `clear` invalidates every previously issued ID, and offers no guarantee that a trace re-inserted
/// afterwards receives the ID it had before.
///
/// #   Encoding.
///
/// The ID encodes the slot which holds the trace's hash, offset so that the tables of the chain map to disjoint,
/// non-zero ranges: the original table of capacity `C` issues `[1, C]`, its successor `[C + 1, 3 C]`, and so on.
/// IDs are dense within a table but are not assigned monotonically.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TraceId(NonZeroU32);

//  Public methods
impl TraceId {
    /// Returns the ID as a plain integer, guaranteed non-zero.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

//  Crate methods
impl TraceId {
    /// Creates the ID of `slot` within a table of `capacity`, in a chain rooted at `initial_capacity`.
    pub(crate) fn encode(capacity: u32, initial_capacity: u32, slot: u32) -> Self {
        debug_assert!(capacity >= initial_capacity);
        debug_assert!(slot < capacity);

        let id = capacity - (initial_capacity - 1) + slot;

        //  Safety:
        //  -   `capacity >= initial_capacity`, hence `capacity - (initial_capacity - 1) >= 1`.
        let id = unsafe { NonZeroU32::new_unchecked(id) };

        Self(id)
    }
}

// mod tests
