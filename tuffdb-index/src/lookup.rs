//! Position lookup.
//!
//! Maps stream hashes to `(event number, log position)` entries. The
//! lookup never sees stream ids, only hashes, so it may return entries
//! belonging to a different stream that collides on the same hash. Callers
//! resolve that by reading the prepare at the returned position.

use std::collections::BTreeSet;

use parking_lot::RwLock;

/// One indexed event: its assigned number and the log position of its
/// prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub event_number: i64,
    pub position: u64,
}

/// Hash-addressed index over the log.
///
/// Entries for one hash are ordered by `(event_number, position)`.
/// Queries that return multiple entries return them newest first, which
/// is the order collision resolution wants to probe in.
pub trait PositionLookup: Send + Sync {
    /// Adds an entry for a hash. Inserting the same entry twice is a
    /// no-op.
    fn insert(&self, hash: u64, entry: IndexEntry);

    /// Highest entry for a hash, if any.
    fn latest_entry(&self, hash: u64) -> Option<IndexEntry>;

    /// Lowest entry for a hash, if any.
    fn oldest_entry(&self, hash: u64) -> Option<IndexEntry>;

    /// Entries with `from <= event_number <= to` for a hash, newest
    /// first.
    fn range(&self, hash: u64, from: i64, to: i64) -> Vec<IndexEntry>;

    /// Total number of entries across all hashes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory lookup over a sorted set of `(hash, event_number, position)`
/// tuples.
///
/// Rebuilt from the log on startup by chasing records through an
/// [`IndexCommitter`](crate::IndexCommitter).
#[derive(Debug, Default)]
pub struct MemLookup {
    entries: RwLock<BTreeSet<(u64, i64, u64)>>,
}

impl MemLookup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionLookup for MemLookup {
    fn insert(&self, hash: u64, entry: IndexEntry) {
        self.entries
            .write()
            .insert((hash, entry.event_number, entry.position));
    }

    fn latest_entry(&self, hash: u64) -> Option<IndexEntry> {
        self.entries
            .read()
            .range((hash, i64::MIN, u64::MIN)..=(hash, i64::MAX, u64::MAX))
            .next_back()
            .map(|&(_, event_number, position)| IndexEntry {
                event_number,
                position,
            })
    }

    fn oldest_entry(&self, hash: u64) -> Option<IndexEntry> {
        self.entries
            .read()
            .range((hash, i64::MIN, u64::MIN)..=(hash, i64::MAX, u64::MAX))
            .next()
            .map(|&(_, event_number, position)| IndexEntry {
                event_number,
                position,
            })
    }

    fn range(&self, hash: u64, from: i64, to: i64) -> Vec<IndexEntry> {
        if from > to {
            return Vec::new();
        }
        self.entries
            .read()
            .range((hash, from, u64::MIN)..=(hash, to, u64::MAX))
            .rev()
            .map(|&(_, event_number, position)| IndexEntry {
                event_number,
                position,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
