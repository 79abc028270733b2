//! Read index.
//!
//! Answers stream and log reads by combining the position lookup with
//! the chunk database. The lookup is hash-addressed and may hand back
//! entries from colliding streams, so every candidate is verified
//! against the stream id stored in the prepare it points at before it
//! counts.

use std::sync::Arc;

use bytes::Bytes;
use tuffdb_log::{ChunkDb, LogRecord, PrepareRecord, NO_STREAM, STREAM_DELETED};
use uuid::Uuid;

use crate::error::IndexError;
use crate::hasher::StreamHasher;
use crate::lookup::PositionLookup;

/// One committed event materialized from its prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub stream_id: String,
    pub event_number: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Log position of the prepare.
    pub position: u64,
}

impl EventRecord {
    fn from_prepare(prepare: PrepareRecord, event_number: i64, position: u64) -> Self {
        Self {
            stream_id: prepare.stream_id,
            event_number,
            event_id: prepare.event_id,
            event_type: prepare.event_type,
            data: prepare.data,
            metadata: prepare.metadata,
            timestamp: prepare.timestamp,
            position,
        }
    }
}

/// Outcome of a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEventResult {
    Success(EventRecord),
    /// The stream exists but holds no event with the asked number.
    NotFound,
    /// Nothing was ever committed under this stream id.
    NoStream,
    StreamDeleted,
}

/// Outcome of a stream slice read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStreamResult {
    Success,
    NoStream,
    StreamDeleted,
}

/// One page of a stream read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSlice {
    pub result: ReadStreamResult,
    pub events: Vec<EventRecord>,
    /// Where the next page starts, in the direction of the read.
    /// [`NO_STREAM`] when reading backward past event zero.
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

impl StreamSlice {
    fn no_stream() -> Self {
        Self {
            result: ReadStreamResult::NoStream,
            events: Vec::new(),
            next_event_number: NO_STREAM,
            last_event_number: NO_STREAM,
            is_end_of_stream: true,
        }
    }

    fn deleted() -> Self {
        Self {
            result: ReadStreamResult::StreamDeleted,
            events: Vec::new(),
            next_event_number: NO_STREAM,
            last_event_number: STREAM_DELETED,
            is_end_of_stream: true,
        }
    }
}

/// One page of a raw log read.
#[derive(Debug, Clone)]
pub struct AllSlice {
    /// `(position, record)` pairs in read order.
    pub records: Vec<(u64, LogRecord)>,
    /// Where the next page starts, in the direction of the read.
    pub next_position: u64,
}

/// Stream-addressed reads over the transaction log.
pub struct ReadIndex {
    db: Arc<ChunkDb>,
    lookup: Arc<dyn PositionLookup>,
    hasher: Arc<dyn StreamHasher>,
}

impl ReadIndex {
    pub fn new(
        db: Arc<ChunkDb>,
        lookup: Arc<dyn PositionLookup>,
        hasher: Arc<dyn StreamHasher>,
    ) -> Self {
        Self { db, lookup, hasher }
    }

    /// Highest committed event number of a stream.
    ///
    /// Walks the hash candidates newest first and returns the number of
    /// the first entry whose stored stream id matches. [`NO_STREAM`] when
    /// no entry matches, [`STREAM_DELETED`] when the newest match is a
    /// tombstone.
    pub fn stream_last_event_number(&self, stream_id: &str) -> Result<i64, IndexError> {
        let hash = self.hasher.hash(stream_id);
        for entry in self.lookup.range(hash, 0, i64::MAX) {
            if let Some(prepare) = self.prepare_at(entry.position)? {
                if prepare.stream_id == stream_id {
                    return Ok(entry.event_number);
                }
            }
        }
        Ok(NO_STREAM)
    }

    /// Reads one event. `event_number` of `-1` reads the last event.
    pub fn read_event(
        &self,
        stream_id: &str,
        event_number: i64,
    ) -> Result<ReadEventResult, IndexError> {
        if event_number < -1 {
            return Err(IndexError::InvalidArgument(format!(
                "event number {} is out of range",
                event_number
            )));
        }
        let last = self.stream_last_event_number(stream_id)?;
        if last == NO_STREAM {
            return Ok(ReadEventResult::NoStream);
        }
        if last == STREAM_DELETED {
            return Ok(ReadEventResult::StreamDeleted);
        }
        let wanted = if event_number == -1 { last } else { event_number };
        if wanted > last {
            return Ok(ReadEventResult::NotFound);
        }
        let hash = self.hasher.hash(stream_id);
        for entry in self.lookup.range(hash, wanted, wanted) {
            if let Some(prepare) = self.prepare_at(entry.position)? {
                if prepare.stream_id == stream_id {
                    return Ok(ReadEventResult::Success(EventRecord::from_prepare(
                        prepare,
                        entry.event_number,
                        entry.position,
                    )));
                }
            }
        }
        Ok(ReadEventResult::NotFound)
    }

    /// Reads up to `count` events of a stream starting at `from`, in
    /// event number order.
    ///
    /// A start past the end of the stream yields an empty successful
    /// page with `is_end_of_stream` set.
    pub fn read_stream_forward(
        &self,
        stream_id: &str,
        from: i64,
        count: usize,
    ) -> Result<StreamSlice, IndexError> {
        if from < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "start event number {} must not be negative",
                from
            )));
        }
        let count = positive_count(count)?;
        let last = self.stream_last_event_number(stream_id)?;
        if last == NO_STREAM {
            return Ok(StreamSlice::no_stream());
        }
        if last == STREAM_DELETED {
            return Ok(StreamSlice::deleted());
        }

        let to = from.saturating_add(count - 1);
        let mut events = self.collect_matching(stream_id, from, to)?;
        events.reverse();

        let is_end_of_stream = to >= last;
        let next_event_number = if is_end_of_stream { last + 1 } else { to + 1 };
        Ok(StreamSlice {
            result: ReadStreamResult::Success,
            events,
            next_event_number,
            last_event_number: last,
            is_end_of_stream,
        })
    }

    /// Reads up to `count` events of a stream ending at `from`, in
    /// reverse event number order.
    ///
    /// `from` of `-1`, or any start past the end, reads from the last
    /// event.
    pub fn read_stream_backward(
        &self,
        stream_id: &str,
        from: i64,
        count: usize,
    ) -> Result<StreamSlice, IndexError> {
        if from < -1 {
            return Err(IndexError::InvalidArgument(format!(
                "start event number {} must not be below -1",
                from
            )));
        }
        let count = positive_count(count)?;
        let last = self.stream_last_event_number(stream_id)?;
        if last == NO_STREAM {
            return Ok(StreamSlice::no_stream());
        }
        if last == STREAM_DELETED {
            return Ok(StreamSlice::deleted());
        }

        let end = if from == -1 || from > last { last } else { from };
        let begin = end.saturating_sub(count - 1);
        let events = self.collect_matching(stream_id, begin.max(0), end)?;

        let is_end_of_stream = begin <= 0;
        let next_event_number = if is_end_of_stream { NO_STREAM } else { begin - 1 };
        Ok(StreamSlice {
            result: ReadStreamResult::Success,
            events,
            next_event_number,
            last_event_number: last,
            is_end_of_stream,
        })
    }

    /// Reads up to `count` records from `position` toward the tail.
    ///
    /// Every record type is returned; no stream filtering happens here.
    pub fn read_all_forward(&self, position: u64, count: usize) -> Result<AllSlice, IndexError> {
        positive_count(count)?;
        let mut records = Vec::new();
        let mut position = position;
        while records.len() < count {
            match self.db.try_read_closest_forward(position)? {
                Some(read) => {
                    position = read.next_position;
                    records.push((read.log_position, read.record));
                }
                None => break,
            }
        }
        Ok(AllSlice {
            records,
            next_position: position,
        })
    }

    /// Reads up to `count` records from `position` toward the start.
    ///
    /// The mirror image of [`read_all_forward`](Self::read_all_forward):
    /// reading backward from the tail yields the forward sequence
    /// reversed.
    pub fn read_all_backward(&self, position: u64, count: usize) -> Result<AllSlice, IndexError> {
        positive_count(count)?;
        let mut records = Vec::new();
        let mut position = position;
        while records.len() < count {
            match self.db.try_read_closest_backward(position)? {
                Some(read) => {
                    position = read.next_position;
                    records.push((read.log_position, read.record));
                }
                None => break,
            }
        }
        Ok(AllSlice {
            records,
            next_position: position,
        })
    }

    /// Events of `stream_id` with numbers in `from..=to`, newest first.
    ///
    /// Entries pointing at missing or foreign prepares are dropped. Of
    /// two entries carrying the same number, the later one wins.
    fn collect_matching(
        &self,
        stream_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<EventRecord>, IndexError> {
        let mut events: Vec<EventRecord> = Vec::new();
        for entry in self.lookup.range(self.hasher.hash(stream_id), from, to) {
            let duplicate = events
                .last()
                .map_or(false, |event| event.event_number == entry.event_number);
            if duplicate {
                continue;
            }
            if let Some(prepare) = self.prepare_at(entry.position)? {
                if prepare.stream_id == stream_id {
                    events.push(EventRecord::from_prepare(
                        prepare,
                        entry.event_number,
                        entry.position,
                    ));
                }
            }
        }
        Ok(events)
    }

    /// Prepare stored at `position`, if one is still there.
    ///
    /// Positions may dangle after a scavenge; a missing record or a
    /// record of another type reads as absent.
    fn prepare_at(&self, position: u64) -> Result<Option<PrepareRecord>, IndexError> {
        match self.db.try_read_at(position)? {
            Some(read) => match read.record {
                LogRecord::Prepare(prepare) => Ok(Some(prepare)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }
}

fn positive_count(count: usize) -> Result<i64, IndexError> {
    if count == 0 {
        return Err(IndexError::InvalidArgument(
            "count must be positive".into(),
        ));
    }
    Ok(i64::try_from(count).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committer::IndexCommitter;
    use crate::hasher::Xxh3StreamHasher;
    use crate::lookup::{IndexEntry, MemLookup};
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tuffdb_log::record::EXPECTED_VERSION_ANY;
    use tuffdb_log::{
        Checkpoint, CommitRecord, InMemoryCheckpoint, LogConfig, LogWriter, PrepareFlags,
        WriteResult,
    };

    /// Hasher that lands every stream on one bucket.
    struct CollidingHasher;

    impl StreamHasher for CollidingHasher {
        fn hash(&self, _stream_id: &str) -> u64 {
            42
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: Arc<ChunkDb>,
        writer: LogWriter,
        committer: IndexCommitter,
        lookup: Arc<MemLookup>,
        index: ReadIndex,
        next_event_numbers: HashMap<String, i64>,
    }

    fn open_fixture(hasher: Arc<dyn StreamHasher>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer"));
        let config = LogConfig::new(dir.path()).with_chunk_data_size(4096);
        let db = Arc::new(ChunkDb::open(config, checkpoint.as_ref()).unwrap());
        let writer = LogWriter::open(db.clone(), checkpoint).unwrap();
        let lookup = Arc::new(MemLookup::new());
        let committer = IndexCommitter::new(lookup.clone(), hasher.clone());
        let index = ReadIndex::new(db.clone(), lookup.clone(), hasher);
        Fixture {
            _dir: dir,
            db,
            writer,
            committer,
            lookup,
            index,
            next_event_numbers: HashMap::new(),
        }
    }

    impl Fixture {
        /// Writes one record, restamping its transaction position when
        /// the chunk rolls, and feeds it to the committer.
        fn write(&mut self, build: impl Fn(u64) -> LogRecord) -> u64 {
            loop {
                let record = build(self.writer.position());
                match self.writer.try_write(&record).unwrap() {
                    WriteResult::Written { position, .. } => {
                        self.committer.process(&record, position);
                        return position;
                    }
                    WriteResult::Rolled { .. } => continue,
                }
            }
        }

        /// Appends a committed single-event transaction.
        fn write_event(&mut self, stream: &str, event_type: &str, data: &[u8]) -> u64 {
            let event_number = self
                .next_event_numbers
                .get(stream)
                .copied()
                .unwrap_or(0);
            let prepare_position = self.write(|position| {
                LogRecord::Prepare(
                    PrepareRecord::new(
                        Uuid::new_v4(),
                        Uuid::new_v4(),
                        position,
                        0,
                        stream,
                        EXPECTED_VERSION_ANY,
                        PrepareFlags::SINGLE_WRITE,
                        event_type,
                        Bytes::copy_from_slice(data),
                        Bytes::new(),
                    )
                    .unwrap(),
                )
            });
            self.write(|_| {
                LogRecord::Commit(
                    CommitRecord::new(Uuid::new_v4(), prepare_position, event_number).unwrap(),
                )
            });
            self.next_event_numbers
                .insert(stream.to_string(), event_number + 1);
            prepare_position
        }

        /// Appends a committed stream tombstone.
        fn delete_stream(&mut self, stream: &str) {
            let prepare_position = self.write(|position| {
                LogRecord::Prepare(
                    PrepareRecord::delete_stream(position, stream, EXPECTED_VERSION_ANY).unwrap(),
                )
            });
            self.write(|_| {
                LogRecord::Commit(CommitRecord::new(Uuid::new_v4(), prepare_position, 0).unwrap())
            });
        }
    }

    fn numbers(slice: &StreamSlice) -> Vec<i64> {
        slice.events.iter().map(|e| e.event_number).collect()
    }

    #[test]
    fn test_colliding_streams_resolve_by_stored_id() {
        let mut f = open_fixture(Arc::new(CollidingHasher));
        for _ in 0..3 {
            f.write_event("alpha", "A", b"{}");
        }
        for _ in 0..5 {
            f.write_event("beta", "B", b"{}");
        }
        for _ in 0..7 {
            f.write_event("gamma", "C", b"{}");
        }

        assert_eq!(f.index.stream_last_event_number("alpha").unwrap(), 2);
        assert_eq!(f.index.stream_last_event_number("beta").unwrap(), 4);
        assert_eq!(f.index.stream_last_event_number("gamma").unwrap(), 6);
        assert_eq!(
            f.index.stream_last_event_number("delta").unwrap(),
            NO_STREAM
        );

        let slice = f.index.read_stream_forward("beta", 0, 100).unwrap();
        assert_eq!(slice.result, ReadStreamResult::Success);
        assert_eq!(numbers(&slice), vec![0, 1, 2, 3, 4]);
        assert!(slice.events.iter().all(|e| e.stream_id == "beta"));
        assert!(slice.is_end_of_stream);
        assert_eq!(slice.next_event_number, 5);
        assert_eq!(slice.last_event_number, 4);

        let slice = f.index.read_stream_backward("gamma", -1, 3).unwrap();
        assert_eq!(numbers(&slice), vec![6, 5, 4]);
        assert!(!slice.is_end_of_stream);
        assert_eq!(slice.next_event_number, 3);
    }

    #[test]
    fn test_deleted_stream_and_absent_collider() {
        let mut f = open_fixture(Arc::new(CollidingHasher));
        f.write_event("ES", "Opened", b"{}");
        f.write_event("ES", "Closed", b"{}");
        f.delete_stream("ES");

        assert_eq!(
            f.index.stream_last_event_number("ES").unwrap(),
            STREAM_DELETED
        );
        assert!(matches!(
            f.index.read_event("ES", 0).unwrap(),
            ReadEventResult::StreamDeleted
        ));
        let slice = f.index.read_stream_forward("ES", 0, 10).unwrap();
        assert_eq!(slice.result, ReadStreamResult::StreamDeleted);
        assert_eq!(slice.last_event_number, STREAM_DELETED);

        // "AB" shares the bucket in this fixture but was never written.
        assert_eq!(f.index.stream_last_event_number("AB").unwrap(), NO_STREAM);
        assert!(matches!(
            f.index.read_event("AB", 0).unwrap(),
            ReadEventResult::NoStream
        ));
        let slice = f.index.read_stream_backward("AB", -1, 10).unwrap();
        assert_eq!(slice.result, ReadStreamResult::NoStream);
    }

    #[test]
    fn test_read_event_point_queries() {
        let mut f = open_fixture(Arc::new(Xxh3StreamHasher));
        let mut positions = Vec::new();
        for n in 0..3 {
            let payload = format!("{{\"n\":{}}}", n);
            positions.push(f.write_event("accounts-1", "Deposited", payload.as_bytes()));
        }

        match f.index.read_event("accounts-1", 1).unwrap() {
            ReadEventResult::Success(event) => {
                assert_eq!(event.event_number, 1);
                assert_eq!(event.stream_id, "accounts-1");
                assert_eq!(event.event_type, "Deposited");
                assert_eq!(event.position, positions[1]);
                assert_eq!(event.data.as_ref(), b"{\"n\":1}");
            }
            other => panic!("expected success, got {:?}", other),
        }

        // -1 reads the last event.
        match f.index.read_event("accounts-1", -1).unwrap() {
            ReadEventResult::Success(event) => assert_eq!(event.event_number, 2),
            other => panic!("expected success, got {:?}", other),
        }

        assert!(matches!(
            f.index.read_event("accounts-1", 3).unwrap(),
            ReadEventResult::NotFound
        ));
        assert!(f.index.read_event("accounts-1", -2).is_err());
    }

    #[test]
    fn test_stream_slices_page_in_both_directions() {
        let mut f = open_fixture(Arc::new(Xxh3StreamHasher));
        for _ in 0..10 {
            f.write_event("orders-1", "Placed", b"{}");
        }

        let first = f.index.read_stream_forward("orders-1", 0, 4).unwrap();
        assert_eq!(numbers(&first), vec![0, 1, 2, 3]);
        assert!(!first.is_end_of_stream);
        assert_eq!(first.next_event_number, 4);

        let rest = f
            .index
            .read_stream_forward("orders-1", first.next_event_number, 100)
            .unwrap();
        assert_eq!(numbers(&rest), vec![4, 5, 6, 7, 8, 9]);
        assert!(rest.is_end_of_stream);
        assert_eq!(rest.next_event_number, 10);

        // A start past the end is a successful empty page.
        let past = f.index.read_stream_forward("orders-1", 42, 10).unwrap();
        assert_eq!(past.result, ReadStreamResult::Success);
        assert!(past.events.is_empty());
        assert!(past.is_end_of_stream);
        assert_eq!(past.next_event_number, 10);
        assert_eq!(past.last_event_number, 9);

        let back = f.index.read_stream_backward("orders-1", -1, 4).unwrap();
        assert_eq!(numbers(&back), vec![9, 8, 7, 6]);
        assert!(!back.is_end_of_stream);
        assert_eq!(back.next_event_number, 5);

        let tail = f
            .index
            .read_stream_backward("orders-1", back.next_event_number, 100)
            .unwrap();
        assert_eq!(numbers(&tail), vec![5, 4, 3, 2, 1, 0]);
        assert!(tail.is_end_of_stream);
        assert_eq!(tail.next_event_number, NO_STREAM);

        // Backward starts past the end clamp to the last event.
        let clamped = f.index.read_stream_backward("orders-1", 1_000, 3).unwrap();
        assert_eq!(numbers(&clamped), vec![9, 8, 7]);

        assert!(f.index.read_stream_forward("orders-1", -1, 10).is_err());
        assert!(f.index.read_stream_forward("orders-1", 0, 0).is_err());
        assert!(f.index.read_stream_backward("orders-1", -2, 10).is_err());
    }

    #[test]
    fn test_read_all_directions_mirror_each_other() {
        let mut f = open_fixture(Arc::new(Xxh3StreamHasher));
        for n in 0..6 {
            let stream = format!("s-{}", n % 2);
            f.write_event(&stream, "E", b"{}");
        }

        // 6 prepares and 6 commits.
        let forward = f.index.read_all_forward(0, 1000).unwrap();
        assert_eq!(forward.records.len(), 12);
        let forward_positions: Vec<u64> = forward.records.iter().map(|(p, _)| *p).collect();
        assert_eq!(forward.next_position, f.db.tail_position());

        let backward = f
            .index
            .read_all_backward(f.db.tail_position(), 1000)
            .unwrap();
        let mut mirrored: Vec<u64> = backward.records.iter().map(|(p, _)| *p).collect();
        mirrored.reverse();
        assert_eq!(mirrored, forward_positions);
        assert_eq!(backward.next_position, 0);

        // Paging forward in small slices walks the same sequence.
        let mut paged = Vec::new();
        let mut position = 0;
        loop {
            let slice = f.index.read_all_forward(position, 5).unwrap();
            if slice.records.is_empty() {
                break;
            }
            paged.extend(slice.records.iter().map(|(p, _)| *p));
            position = slice.next_position;
        }
        assert_eq!(paged, forward_positions);
    }

    #[test]
    fn test_reads_cross_chunk_boundaries() {
        let mut f = open_fixture(Arc::new(Xxh3StreamHasher));
        for _ in 0..40 {
            f.write_event("ledger", "Posted", b"{\"amount\":1}");
        }
        assert!(f.db.chunk_count() > 1, "writes were meant to roll chunks");

        assert_eq!(f.index.stream_last_event_number("ledger").unwrap(), 39);
        let slice = f.index.read_stream_forward("ledger", 0, 100).unwrap();
        assert_eq!(numbers(&slice), (0..40).collect::<Vec<_>>());

        let forward = f.index.read_all_forward(0, 1000).unwrap();
        assert_eq!(forward.records.len(), 80);
        let backward = f
            .index
            .read_all_backward(f.db.tail_position(), 1000)
            .unwrap();
        assert_eq!(backward.records.len(), 80);
        let mut mirrored: Vec<u64> = backward.records.iter().map(|(p, _)| *p).collect();
        mirrored.reverse();
        let forward_positions: Vec<u64> = forward.records.iter().map(|(p, _)| *p).collect();
        assert_eq!(mirrored, forward_positions);
    }

    #[test]
    fn test_uncommitted_transaction_is_invisible() {
        let mut f = open_fixture(Arc::new(Xxh3StreamHasher));
        f.write_event("billing-1", "Invoiced", b"{}");

        // A prepare whose commit never arrives.
        f.write(|position| {
            LogRecord::Prepare(
                PrepareRecord::new(
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    position,
                    0,
                    "billing-1",
                    EXPECTED_VERSION_ANY,
                    PrepareFlags::SINGLE_WRITE,
                    "Invoiced",
                    Bytes::from_static(b"{}"),
                    Bytes::new(),
                )
                .unwrap(),
            )
        });

        assert_eq!(f.index.stream_last_event_number("billing-1").unwrap(), 0);
        assert!(matches!(
            f.index.read_event("billing-1", 1).unwrap(),
            ReadEventResult::NotFound
        ));
        assert_eq!(f.committer.staged_transactions(), 1);
    }

    #[test]
    fn test_stale_lookup_entries_are_skipped() {
        let mut f = open_fixture(Arc::new(Xxh3StreamHasher));
        f.write_event("audit-1", "Logged", b"{}");

        // Entry pointing past the log, as if its prepare was scavenged.
        let hash = Xxh3StreamHasher.hash("audit-1");
        f.lookup.insert(
            hash,
            IndexEntry {
                event_number: 7,
                position: 1 << 40,
            },
        );

        assert_eq!(f.index.stream_last_event_number("audit-1").unwrap(), 0);
        let slice = f.index.read_stream_forward("audit-1", 0, 10).unwrap();
        assert_eq!(numbers(&slice), vec![0]);
    }
}
