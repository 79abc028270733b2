//! # tuffdb-index
//!
//! Stream read index for tuffdb.
//!
//! The transaction log only knows byte positions. This crate maps stream
//! ids onto it:
//! - Streams are addressed by a 64-bit hash of their id
//! - A position lookup stores `(hash, event number, position)` tuples
//! - A committer feeds the lookup from log records in log order
//! - A read index resolves hash collisions against the stored prepares

pub mod committer;
pub mod error;
pub mod hasher;
pub mod lookup;
pub mod read_index;

pub use committer::IndexCommitter;
pub use error::IndexError;
pub use hasher::{StreamHasher, Xxh3StreamHasher};
pub use lookup::{IndexEntry, MemLookup, PositionLookup};
pub use read_index::{
    AllSlice, EventRecord, ReadEventResult, ReadIndex, ReadStreamResult, StreamSlice,
};
