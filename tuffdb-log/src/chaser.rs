//! Log chaser: a follower that trails the writer through durable data.
//!
//! The chaser never reads at or past the writer checkpoint's flushed
//! value, so a record it hands out has always been fsynced. Its own
//! checkpoint advances in memory per confirmed record and is flushed
//! explicitly or whenever it catches up.

use crate::checkpoint::Checkpoint;
use crate::db::ChunkDb;
use crate::error::LogError;
use crate::record::LogRecord;
use std::sync::Arc;

/// Outcome of a chase step.
#[derive(Debug, Clone, PartialEq)]
pub enum ChaseResult {
    /// The next durable record.
    Record {
        record: LogRecord,
        position: u64,
        new_position: u64,
    },
    /// Nothing durable remains past the chaser's position.
    CaughtUp,
}

pub struct LogChaser {
    db: Arc<ChunkDb>,
    writer_checkpoint: Arc<dyn Checkpoint>,
    checkpoint: Arc<dyn Checkpoint>,
    closed: bool,
}

impl LogChaser {
    /// Opens the chaser at its checkpoint's flushed position.
    pub fn open(
        db: Arc<ChunkDb>,
        writer_checkpoint: Arc<dyn Checkpoint>,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> Result<Self, LogError> {
        let position = checkpoint.read();
        let limit = writer_checkpoint.read();
        if position > limit {
            return Err(LogError::InvalidArgument(format!(
                "chaser checkpoint {} at {} is past writer checkpoint {} at {}",
                checkpoint.name(),
                position,
                writer_checkpoint.name(),
                limit
            )));
        }
        // Resume from the flushed value; anything written but not flushed
        // before a restart is re-chased.
        checkpoint.write(position);
        tracing::info!(
            "chaser {} opened at {} (writer at {})",
            checkpoint.name(),
            position,
            limit
        );
        Ok(Self {
            db,
            writer_checkpoint,
            checkpoint,
            closed: false,
        })
    }

    fn ensure_open(&self, operation: &str) -> Result<(), LogError> {
        if self.closed {
            return Err(LogError::InvalidOperation(format!(
                "{} on closed chaser {}",
                operation,
                self.checkpoint.name()
            )));
        }
        Ok(())
    }

    /// The position the next chase step reads from.
    pub fn position(&self) -> u64 {
        self.checkpoint.read_non_flushed()
    }

    /// Reads the next record strictly below the writer's flushed position.
    pub fn try_read_next(&mut self) -> Result<ChaseResult, LogError> {
        self.ensure_open("try_read_next")?;
        let position = self.checkpoint.read_non_flushed();
        let limit = self.writer_checkpoint.read();
        if position >= limit {
            self.checkpoint.flush()?;
            return Ok(ChaseResult::CaughtUp);
        }

        match self.db.try_read_closest_forward(position)? {
            Some(read) if read.log_position < limit => {
                self.checkpoint.write(read.next_position);
                Ok(ChaseResult::Record {
                    record: read.record,
                    position: read.log_position,
                    new_position: read.next_position,
                })
            }
            _ => {
                // The gap up to the limit is a completed chunk's pad; the
                // next durable record is past the writer's flushed mark.
                self.checkpoint.flush()?;
                Ok(ChaseResult::CaughtUp)
            }
        }
    }

    /// Makes the chaser's progress durable.
    pub fn flush(&mut self) -> Result<(), LogError> {
        self.ensure_open("flush")?;
        self.checkpoint.flush()
    }

    /// Flushes and closes; further operations fail.
    pub fn close(&mut self) -> Result<(), LogError> {
        self.ensure_open("close")?;
        self.checkpoint.flush()?;
        self.closed = true;
        Ok(())
    }
}
