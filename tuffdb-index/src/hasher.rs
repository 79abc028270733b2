//! Stream id hashing.
//!
//! The lookup keys streams by a 64-bit hash rather than by id, so the
//! index stays fixed-width no matter how long stream ids get. Collisions
//! are legal; the read index resolves them by checking the stream id
//! stored in the prepare each candidate entry points at.

/// Maps stream ids onto 64-bit lookup keys.
///
/// Implementations must be deterministic: the same id must hash to the
/// same value across process restarts, or persisted entries become
/// unreachable.
pub trait StreamHasher: Send + Sync {
    fn hash(&self, stream_id: &str) -> u64;
}

/// Default hasher backed by XXH3.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3StreamHasher;

impl StreamHasher for Xxh3StreamHasher {
    fn hash(&self, stream_id: &str) -> u64 {
        xxhash_rust::xxh3::xxh3_64(stream_id.as_bytes())
    }
}
