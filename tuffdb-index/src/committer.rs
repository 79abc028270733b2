//! Index committer.
//!
//! Consumes log records in log order and feeds the position lookup.
//! Prepares are staged under their transaction position; the commit
//! record assigns event numbers and publishes the staged entries. A
//! prepare without a commit never reaches the lookup, which is what
//! makes half-written transactions invisible to readers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tuffdb_log::{LogRecord, PrepareFlags, PrepareRecord, STREAM_DELETED};

use crate::hasher::StreamHasher;
use crate::lookup::{IndexEntry, PositionLookup};

struct StagedPrepare {
    stream_hash: u64,
    transaction_offset: u32,
    position: u64,
    is_tombstone: bool,
}

/// Builds the lookup from the record sequence a chaser emits.
///
/// Records must arrive in log order, and only one committer may write a
/// given lookup.
pub struct IndexCommitter {
    lookup: Arc<dyn PositionLookup>,
    hasher: Arc<dyn StreamHasher>,
    staged: HashMap<u64, Vec<StagedPrepare>>,
}

impl IndexCommitter {
    pub fn new(lookup: Arc<dyn PositionLookup>, hasher: Arc<dyn StreamHasher>) -> Self {
        Self {
            lookup,
            hasher,
            staged: HashMap::new(),
        }
    }

    /// Consumes one record read at `position`.
    pub fn process(&mut self, record: &LogRecord, position: u64) {
        match record {
            LogRecord::Prepare(prepare) => self.stage_prepare(prepare, position),
            LogRecord::Commit(commit) => {
                self.commit_transaction(commit.transaction_position, commit.first_event_number)
            }
            LogRecord::System(_) => {}
        }
    }

    /// Number of transactions staged but not yet committed.
    pub fn staged_transactions(&self) -> usize {
        self.staged.len()
    }

    fn stage_prepare(&mut self, prepare: &PrepareRecord, position: u64) {
        let is_tombstone = prepare.flags.contains(PrepareFlags::STREAM_DELETE);
        if !is_tombstone && !prepare.flags.contains(PrepareFlags::DATA) {
            // Transaction boundary markers carry no event.
            return;
        }
        self.staged
            .entry(prepare.transaction_position)
            .or_default()
            .push(StagedPrepare {
                stream_hash: self.hasher.hash(&prepare.stream_id),
                transaction_offset: prepare.transaction_offset,
                position,
                is_tombstone,
            });
    }

    fn commit_transaction(&mut self, transaction_position: u64, first_event_number: i64) {
        let Some(prepares) = self.staged.remove(&transaction_position) else {
            // Prepares scavenged away, or the committer started past them.
            debug!(
                "commit for transaction at {} found no staged prepares",
                transaction_position
            );
            return;
        };
        for prepare in prepares {
            let event_number = if prepare.is_tombstone {
                STREAM_DELETED
            } else {
                first_event_number + prepare.transaction_offset as i64
            };
            self.lookup.insert(
                prepare.stream_hash,
                IndexEntry {
                    event_number,
                    position: prepare.position,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::Xxh3StreamHasher;
    use crate::lookup::MemLookup;
    use bytes::Bytes;
    use tuffdb_log::record::EXPECTED_VERSION_ANY;
    use tuffdb_log::CommitRecord;
    use uuid::Uuid;

    fn fixture() -> (Arc<MemLookup>, IndexCommitter) {
        let lookup = Arc::new(MemLookup::new());
        let committer = IndexCommitter::new(lookup.clone(), Arc::new(Xxh3StreamHasher));
        (lookup, committer)
    }

    fn data_prepare(
        transaction_position: u64,
        transaction_offset: u32,
        stream: &str,
        flags: PrepareFlags,
    ) -> LogRecord {
        LogRecord::Prepare(
            PrepareRecord::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                transaction_position,
                transaction_offset,
                stream,
                EXPECTED_VERSION_ANY,
                flags,
                "Deposited",
                Bytes::from_static(b"{\"amount\":10}"),
                Bytes::new(),
            )
            .unwrap(),
        )
    }

    fn commit(transaction_position: u64, first_event_number: i64) -> LogRecord {
        LogRecord::Commit(
            CommitRecord::new(Uuid::new_v4(), transaction_position, first_event_number).unwrap(),
        )
    }

    #[test]
    fn test_commit_assigns_consecutive_event_numbers() {
        let (lookup, mut committer) = fixture();
        let begin = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN;
        let end = PrepareFlags::DATA | PrepareFlags::TRANSACTION_END;

        committer.process(&data_prepare(100, 0, "accounts-1", begin), 100);
        committer.process(&data_prepare(100, 1, "accounts-1", PrepareFlags::DATA), 160);
        committer.process(&data_prepare(100, 2, "accounts-1", end), 220);
        assert!(lookup.is_empty());

        committer.process(&commit(100, 5), 280);

        let hash = Xxh3StreamHasher.hash("accounts-1");
        let entries = lookup.range(hash, 0, i64::MAX);
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            IndexEntry {
                event_number: 7,
                position: 220
            }
        );
        assert_eq!(
            entries[2],
            IndexEntry {
                event_number: 5,
                position: 100
            }
        );
        assert_eq!(committer.staged_transactions(), 0);
    }

    #[test]
    fn test_uncommitted_prepares_never_reach_the_lookup() {
        let (lookup, mut committer) = fixture();
        committer.process(
            &data_prepare(0, 0, "accounts-2", PrepareFlags::SINGLE_WRITE),
            0,
        );

        assert!(lookup.is_empty());
        assert_eq!(committer.staged_transactions(), 1);
    }

    #[test]
    fn test_tombstone_is_indexed_at_the_deleted_sentinel() {
        let (lookup, mut committer) = fixture();
        let tombstone =
            LogRecord::Prepare(PrepareRecord::delete_stream(300, "accounts-3", 4).unwrap());
        committer.process(&tombstone, 300);
        committer.process(&commit(300, 5), 360);

        let hash = Xxh3StreamHasher.hash("accounts-3");
        let latest = lookup.latest_entry(hash).unwrap();
        assert_eq!(latest.event_number, STREAM_DELETED);
        assert_eq!(latest.position, 300);
    }

    #[test]
    fn test_orphan_commit_is_skipped() {
        let (lookup, mut committer) = fixture();
        committer.process(&commit(512, 0), 512);
        assert!(lookup.is_empty());
    }

    #[test]
    fn test_boundary_markers_are_not_indexed() {
        let (lookup, mut committer) = fixture();
        committer.process(
            &data_prepare(100, 0, "accounts-4", PrepareFlags::TRANSACTION_BEGIN),
            100,
        );
        committer.process(&commit(100, 0), 160);
        assert!(lookup.is_empty());
    }
}
