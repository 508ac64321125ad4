//  Errors from the library.

use core::{error, fmt};

/// Errors returned by this library.
///
/// Only construction may fail with an error. Once built, the storage absorbs every failure: a failed table growth
/// leaves insertions on the current table, a failed arena allocation publishes a trace-less ID, and an exhausted
/// probe sequence drops the sample by returning no ID at all.
#[derive(Clone, Debug)]
pub enum StorageError {
    /// No memory could be allocated for the original hash table.
    MemoryExhausted,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{:?}", self)
    }
}

impl error::Error for StorageError {}
