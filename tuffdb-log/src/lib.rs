//! # tuffdb-log
//!
//! Chunked transaction log for tuffdb.
//!
//! This crate provides the storage engine core:
//! - Length-framed log records readable forward and backward
//! - Fixed-size chunk files with completion footers and scavenge maps
//! - Durable checkpoints decoupling the writer from its followers
//! - Versioned chunk file naming with atomic scavenge swaps

pub mod chaser;
pub mod checkpoint;
pub mod chunk;
pub mod db;
pub mod error;
pub mod naming;
pub mod record;
pub mod scavenger;
pub mod writer;

pub use chaser::{ChaseResult, LogChaser};
pub use checkpoint::{
    Checkpoint, FileCheckpoint, InMemoryCheckpoint, MemMappedCheckpoint, WriteThroughCheckpoint,
};
pub use chunk::{
    AppendResult, Chunk, ChunkFooter, ChunkHeader, PosMapEntry, ReaderGuard, RecordRead,
};
pub use db::{ChunkDb, LogConfig};
pub use error::LogError;
pub use record::{
    CommitRecord, LogPosition, LogRecord, LogRecordType, PrepareFlags, PrepareRecord,
    SystemRecord, NO_STREAM, STREAM_DELETED,
};
pub use scavenger::{ScavengeSummary, Scavenger};
pub use writer::{LogWriter, WriteResult};

/// Default chunk data size (256 MiB).
pub const DEFAULT_CHUNK_DATA_SIZE: u32 = 256 * 1024 * 1024;

/// Chunk files are padded so their total size is a multiple of this.
pub const CHUNK_FILE_ALIGNMENT: u64 = 4096;

/// Framing overhead per record: a length prefix and a length suffix.
pub const FRAME_OVERHEAD: usize = 8;

/// Conventional file name for the writer checkpoint.
pub const WRITER_CHECKPOINT_FILE: &str = "writer.chk";

/// Conventional file name for the chaser checkpoint.
pub const CHASER_CHECKPOINT_FILE: &str = "chaser.chk";
