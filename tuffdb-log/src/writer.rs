//! Log writer: the single append head of the transaction log.
//!
//! Appends go to the active chunk and advance the writer checkpoint in
//! memory; `flush` is the durability boundary, syncing the chunk before
//! the checkpoint so the checkpoint never acknowledges data the disk does
//! not hold. Rolling into a new chunk flushes the checkpoint at the new
//! chunk's start, so the durable position never lags a completed chunk.

use crate::checkpoint::Checkpoint;
use crate::chunk::AppendResult;
use crate::db::ChunkDb;
use crate::error::LogError;
use crate::record::LogRecord;
use std::sync::Arc;

/// Outcome of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Record appended at `position`; the log tail is now `new_position`.
    Written { position: u64, new_position: u64 },
    /// The active chunk was full: it has been completed and a fresh one
    /// opened at `position`. The caller restamps position-bearing fields
    /// against the new tail and retries.
    Rolled { position: u64 },
}

/// The append head. `&mut self` on the mutating operations keeps the
/// log single-writer.
pub struct LogWriter {
    db: Arc<ChunkDb>,
    checkpoint: Arc<dyn Checkpoint>,
}

impl LogWriter {
    /// Opens the writer, realigning the checkpoint to the recovered log
    /// tail when they disagree.
    pub fn open(db: Arc<ChunkDb>, checkpoint: Arc<dyn Checkpoint>) -> Result<Self, LogError> {
        let tail = db.tail_position();
        let current = checkpoint.read_non_flushed();
        if current != tail {
            tracing::info!(
                "realigning writer checkpoint {} from {} to recovered tail {}",
                checkpoint.name(),
                current,
                tail
            );
            checkpoint.write(tail);
            checkpoint.flush()?;
        }
        Ok(Self { db, checkpoint })
    }

    /// The position the next record will be written at.
    pub fn position(&self) -> u64 {
        self.checkpoint.read_non_flushed()
    }

    /// Appends a record at the tail.
    pub fn try_write(&mut self, record: &LogRecord) -> Result<WriteResult, LogError> {
        let framed = record.framed_size();
        let capacity = self.db.config().chunk_data_size as usize;
        if framed > capacity {
            return Err(LogError::RecordTooLarge {
                size: framed,
                max: capacity,
            });
        }

        let active = self.db.active_chunk();
        match active.try_append(record)? {
            AppendResult::Written {
                old_position,
                new_position,
            } => {
                let base = active.header().logical_start();
                self.checkpoint.write(base + new_position);
                Ok(WriteResult::Written {
                    position: base + old_position,
                    new_position: base + new_position,
                })
            }
            AppendResult::Full => {
                let new_chunk = self.db.add_new_chunk()?;
                let position = new_chunk.header().logical_start();
                self.checkpoint.write(position);
                // Completing a chunk fsyncs it; the checkpoint must not
                // stay behind the sealed boundary across a crash.
                self.checkpoint.flush()?;
                Ok(WriteResult::Rolled { position })
            }
        }
    }

    /// Makes all accepted records durable: the active chunk first, then
    /// the checkpoint.
    pub fn flush(&mut self) -> Result<(), LogError> {
        self.db.active_chunk().flush()?;
        self.checkpoint.flush()
    }

    pub fn close(&mut self) -> Result<(), LogError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{FileCheckpoint, InMemoryCheckpoint};
    use crate::db::LogConfig;
    use crate::record::{PrepareRecord, EXPECTED_VERSION_ANY};
    use crate::WRITER_CHECKPOINT_FILE;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn small_config(dir: &TempDir) -> LogConfig {
        LogConfig::new(dir.path()).with_chunk_data_size(1024)
    }

    fn open_writer(
        dir: &TempDir,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> (Arc<ChunkDb>, LogWriter) {
        let db = Arc::new(ChunkDb::open(small_config(dir), checkpoint.as_ref()).unwrap());
        let writer = LogWriter::open(db.clone(), checkpoint).unwrap();
        (db, writer)
    }

    fn stamped_record(position: u64, stream: &str) -> LogRecord {
        LogRecord::Prepare(
            PrepareRecord::single_write(
                position,
                stream,
                EXPECTED_VERSION_ANY,
                "ItemAdded",
                Bytes::from_static(b"{\"qty\":1}"),
                Bytes::new(),
            )
            .unwrap(),
        )
    }

    /// Writes one record with the restamp-and-retry contract.
    fn write(writer: &mut LogWriter, stream: &str) -> u64 {
        loop {
            let record = stamped_record(writer.position(), stream);
            match writer.try_write(&record).unwrap() {
                WriteResult::Written { position, .. } => return position,
                WriteResult::Rolled { position } => {
                    assert_eq!(writer.position(), position);
                }
            }
        }
    }

    #[test]
    fn test_write_advances_checkpoint_by_framed_size() {
        let dir = TempDir::new().unwrap();
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer"));
        let (_db, mut writer) = open_writer(&dir, checkpoint.clone());

        let record = stamped_record(0, "carts-3");
        let result = writer.try_write(&record).unwrap();
        assert_eq!(
            result,
            WriteResult::Written {
                position: 0,
                new_position: record.framed_size() as u64,
            }
        );
        assert_eq!(writer.position(), record.framed_size() as u64);
        assert_eq!(checkpoint.read_non_flushed(), record.framed_size() as u64);
    }

    #[test]
    fn test_rollover_reports_new_position_for_restamp() {
        let dir = TempDir::new().unwrap();
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer"));
        let (db, mut writer) = open_writer(&dir, checkpoint);

        let mut positions = Vec::new();
        for _ in 0..30 {
            positions.push(write(&mut writer, "carts-3"));
        }
        assert!(db.chunk_count() > 1, "expected a rollover");

        // Every stored prepare carries the position it actually landed at.
        for &position in &positions {
            let read = db.try_read_at(position).unwrap().unwrap();
            let LogRecord::Prepare(prepare) = read.record else {
                panic!("expected a prepare");
            };
            assert_eq!(prepare.transaction_position, position);
        }
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let dir = TempDir::new().unwrap();
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer"));
        let (_db, mut writer) = open_writer(&dir, checkpoint);

        let record = LogRecord::Prepare(
            PrepareRecord::single_write(
                0,
                "blobs-1",
                EXPECTED_VERSION_ANY,
                "BlobStored",
                Bytes::from(vec![0u8; 2048]),
                Bytes::new(),
            )
            .unwrap(),
        );
        assert!(matches!(
            writer.try_write(&record),
            Err(LogError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_flush_publishes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(
            FileCheckpoint::open(&dir.path().join(WRITER_CHECKPOINT_FILE), "writer").unwrap(),
        );
        let (_db, mut writer) = open_writer(&dir, checkpoint.clone());

        write(&mut writer, "carts-3");
        assert_eq!(checkpoint.read(), 0, "unflushed writes must not be visible");

        writer.flush().unwrap();
        assert_eq!(checkpoint.read(), writer.position());
    }

    #[test]
    fn test_rollover_flushes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(WRITER_CHECKPOINT_FILE);
        let checkpoint: Arc<dyn Checkpoint> =
            Arc::new(FileCheckpoint::open(&path, "writer").unwrap());
        let (db, mut writer) = open_writer(&dir, checkpoint.clone());

        while db.chunk_count() == 1 {
            write(&mut writer, "carts-3");
        }

        // Rolling into chunk 1 published the sealed boundary without an
        // explicit flush; a fresh instance reads it back from disk.
        assert!(checkpoint.read_non_flushed() > 1024);
        assert_eq!(checkpoint.read(), 1024);
        let durable = FileCheckpoint::open(&path, "writer").unwrap();
        assert_eq!(durable.read(), 1024);
    }

    #[test]
    fn test_open_realigns_stale_checkpoint() {
        let dir = TempDir::new().unwrap();
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer"));
        {
            let (db, mut writer) = open_writer(&dir, checkpoint.clone());
            write(&mut writer, "carts-3");
            writer.flush().unwrap();
            // Crash after completing the tail chunk but before using the
            // next one.
            db.active_chunk().complete().unwrap();
        }

        let (db, writer) = open_writer(&dir, checkpoint.clone());
        assert_eq!(db.tail_position(), 1024);
        assert_eq!(writer.position(), 1024);
        assert_eq!(checkpoint.read(), 1024);
    }
}
