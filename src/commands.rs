//! Command execution.
//!
//! Every command opens the database offline: the on-disk checkpoint
//! files are read directly and the chunk database is opened around an
//! in-memory copy, so inspection never creates or advances checkpoint
//! files of its own.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Read as _};
use std::path::Path;
use std::sync::Arc;

use chrono::DateTime;
use tuffdb_index::{
    IndexCommitter, MemLookup, PositionLookup, ReadIndex, ReadStreamResult, StreamHasher,
    Xxh3StreamHasher,
};
use tuffdb_log::chunk::CHUNK_HEADER_SIZE;
use tuffdb_log::naming::ChunkNaming;
use tuffdb_log::{
    ChaseResult, Checkpoint, Chunk, ChunkDb, ChunkHeader, InMemoryCheckpoint, LogChaser,
    LogConfig, LogError, LogRecord, Scavenger, CHASER_CHECKPOINT_FILE, STREAM_DELETED,
    WRITER_CHECKPOINT_FILE,
};

use crate::Commands;

/// Executes a command and returns the formatted output.
pub fn execute(cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Stat { dir } => stat(&dir),
        Commands::Verify { dir } => verify(&dir),
        Commands::Read {
            dir,
            stream,
            all,
            count,
        } => read(&dir, stream, all, count),
        Commands::Scavenge {
            dir,
            merge,
            always_keep,
        } => scavenge(&dir, merge, always_keep),
    }
}

fn stat(dir: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let (db, _) = open_db(dir, false)?;
    let chaser_position = read_checkpoint_file(&dir.join(CHASER_CHECKPOINT_FILE))?;

    let mut output = String::new();
    writeln!(output, "database: {}", dir.display())?;
    writeln!(
        output,
        "chunk data size: {} bytes",
        db.config().chunk_data_size
    )?;
    writeln!(output, "writer checkpoint: {}", db.tail_position())?;
    match chaser_position {
        Some(position) => writeln!(output, "chaser checkpoint: {}", position)?,
        None => writeln!(output, "chaser checkpoint: none")?,
    }

    let chunks = db.chunks();
    writeln!(output, "chunks: {}", chunks.len())?;
    for chunk in &chunks {
        let header = chunk.header();
        let span = if header.chunk_start_number == header.chunk_end_number {
            format!("chunk {}", header.chunk_start_number)
        } else {
            format!("chunks {}-{}", header.chunk_start_number, header.chunk_end_number)
        };
        let mut flags = vec![if chunk.is_completed() {
            "completed"
        } else {
            "active"
        }];
        if chunk.is_scavenged() {
            flags.push("scavenged");
        }
        writeln!(
            output,
            "  {}: {}, {} records, {} data bytes, file {} bytes, {}",
            chunk.file_name(),
            span,
            count_records(chunk)?,
            chunk.physical_data_size(),
            chunk.file_size()?,
            flags.join(", ")
        )?;
    }
    Ok(output.trim_end().to_string())
}

/// Full integrity pass: opens every chunk with digest verification and
/// re-frames every record up to the writer checkpoint.
fn verify(dir: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let (db, _) = open_db(dir, true)?;

    let mut records: u64 = 0;
    let mut position = 0;
    while let Some(read) = db.try_read_closest_forward(position)? {
        records += 1;
        position = read.next_position;
    }

    Ok(format!(
        "ok: {} chunks, {} records, log tail at {}",
        db.chunk_count(),
        records,
        db.tail_position()
    ))
}

fn read(
    dir: &Path,
    stream: Option<String>,
    all: bool,
    count: usize,
) -> Result<String, Box<dyn std::error::Error>> {
    match (stream, all) {
        (Some(stream), _) => read_stream(dir, &stream, count),
        (None, true) => read_all(dir, count),
        (None, false) => Err("pass --stream <id> or --all".into()),
    }
}

fn read_stream(
    dir: &Path,
    stream: &str,
    count: usize,
) -> Result<String, Box<dyn std::error::Error>> {
    let (db, writer_checkpoint) = open_db(dir, false)?;
    let index = build_index(db, writer_checkpoint)?;

    let slice = index.read_stream_forward(stream, 0, count)?;
    match slice.result {
        ReadStreamResult::NoStream => return Ok(format!("stream {} not found", stream)),
        ReadStreamResult::StreamDeleted => return Ok(format!("stream {} was deleted", stream)),
        ReadStreamResult::Success => {}
    }

    let mut output = String::new();
    writeln!(
        output,
        "stream {}: {} events, last event number {}",
        stream,
        slice.events.len(),
        slice.last_event_number
    )?;
    for event in &slice.events {
        writeln!(
            output,
            "  {}@{}  {}  position {}  {}  {}",
            event.event_number,
            event.stream_id,
            event.event_type,
            event.position,
            format_timestamp(event.timestamp),
            preview(&event.data)
        )?;
    }
    if !slice.is_end_of_stream {
        writeln!(output, "next event number: {}", slice.next_event_number)?;
    }
    Ok(output.trim_end().to_string())
}

fn read_all(dir: &Path, count: usize) -> Result<String, Box<dyn std::error::Error>> {
    let (db, _) = open_db(dir, false)?;
    // Raw log reads never consult the lookup, so skip the rebuild.
    let index = ReadIndex::new(db, Arc::new(MemLookup::new()), Arc::new(Xxh3StreamHasher));

    let slice = index.read_all_forward(0, count)?;
    let mut output = String::new();
    writeln!(
        output,
        "log {}: {} records",
        dir.display(),
        slice.records.len()
    )?;
    for (position, record) in &slice.records {
        writeln!(output, "  {}", format_record(*position, record))?;
    }
    writeln!(output, "next position: {}", slice.next_position)?;
    Ok(output.trim_end().to_string())
}

fn scavenge(
    dir: &Path,
    merge: bool,
    always_keep: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let (db, writer_checkpoint) = open_db(dir, false)?;
    let index = Arc::new(build_index(db.clone(), writer_checkpoint)?);

    // A stream stays relevant unless its newest entry is a tombstone.
    let relevance = {
        let index = index.clone();
        move |stream_id: &str| match index.stream_last_event_number(stream_id) {
            Ok(last) => last != STREAM_DELETED,
            Err(_) => true,
        }
    };
    let summary = Scavenger::new(db.clone(), Arc::new(relevance))
        .with_merge_chunks(merge)
        .with_always_keep_scavenged(always_keep)
        .scavenge()?;
    db.close()?;

    Ok(format!(
        "processed {}, rewritten {}, skipped {}, failed {}, saved {} bytes",
        summary.chunks_processed,
        summary.chunks_rewritten,
        summary.chunks_skipped,
        summary.chunks_failed,
        summary.bytes_saved
    ))
}

/// Opens a database directory around its on-disk writer checkpoint.
fn open_db(
    dir: &Path,
    verify_digests: bool,
) -> Result<(Arc<ChunkDb>, Arc<dyn Checkpoint>), Box<dyn std::error::Error>> {
    let writer_position =
        read_checkpoint_file(&dir.join(WRITER_CHECKPOINT_FILE))?.ok_or_else(|| {
            format!(
                "{} does not look like a tuffdb database (no {})",
                dir.display(),
                WRITER_CHECKPOINT_FILE
            )
        })?;
    let chunk_data_size = sniff_chunk_data_size(dir)?
        .ok_or_else(|| format!("{} contains no chunk files", dir.display()))?;

    let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::with_value(
        WRITER_CHECKPOINT_FILE,
        writer_position,
    ));
    let config = LogConfig::new(dir)
        .with_chunk_data_size(chunk_data_size)
        .with_digest_verification(verify_digests);
    let db = Arc::new(ChunkDb::open(config, checkpoint.as_ref())?);
    Ok((db, checkpoint))
}

/// Rebuilds the stream index by chasing every durable record.
fn build_index(
    db: Arc<ChunkDb>,
    writer_checkpoint: Arc<dyn Checkpoint>,
) -> Result<ReadIndex, Box<dyn std::error::Error>> {
    let lookup: Arc<dyn PositionLookup> = Arc::new(MemLookup::new());
    let hasher: Arc<dyn StreamHasher> = Arc::new(Xxh3StreamHasher);
    let mut committer = IndexCommitter::new(lookup.clone(), hasher.clone());

    let chaser_checkpoint: Arc<dyn Checkpoint> =
        Arc::new(InMemoryCheckpoint::new(CHASER_CHECKPOINT_FILE));
    let mut chaser = LogChaser::open(db.clone(), writer_checkpoint, chaser_checkpoint)?;
    loop {
        match chaser.try_read_next()? {
            ChaseResult::Record {
                record, position, ..
            } => committer.process(&record, position),
            ChaseResult::CaughtUp => break,
        }
    }
    chaser.close()?;

    Ok(ReadIndex::new(db, lookup, hasher))
}

/// Reads a checkpoint file's value without creating the file.
fn read_checkpoint_file(path: &Path) -> io::Result<Option<u64>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if bytes.len() < 8 {
        return Ok(None);
    }
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(&bytes[..8]);
    Ok(Some(u64::from_le_bytes(buffer)))
}

/// Reads the configured chunk data size from the first chunk file.
fn sniff_chunk_data_size(dir: &Path) -> Result<Option<u32>, Box<dyn std::error::Error>> {
    let naming = ChunkNaming::new(dir, "chunk");
    let Some(path) = naming.present_files()?.into_iter().next() else {
        return Ok(None);
    };
    let mut buffer = vec![0u8; CHUNK_HEADER_SIZE as usize];
    fs::File::open(&path)?.read_exact(&mut buffer)?;
    let header = ChunkHeader::decode(&buffer)?;
    Ok(Some(header.chunk_data_size))
}

/// Counts records by walking a chunk's local positions.
fn count_records(chunk: &Chunk) -> Result<u64, LogError> {
    let mut count = 0;
    let mut local = 0;
    while let Some(read) = chunk.try_read_closest_forward(local)? {
        count += 1;
        local = read.next_position;
    }
    Ok(count)
}

fn format_record(position: u64, record: &LogRecord) -> String {
    match record {
        LogRecord::Prepare(prepare) => format!(
            "position {}  prepare  stream {}  type {}  offset {}  {}",
            position,
            prepare.stream_id,
            prepare.event_type,
            prepare.transaction_offset,
            preview(&prepare.data)
        ),
        LogRecord::Commit(commit) => format!(
            "position {}  commit  transaction {}  first event {}",
            position, commit.transaction_position, commit.first_event_number
        ),
        LogRecord::System(system) => format!(
            "position {}  system  kind {}  {} bytes",
            position,
            system.kind,
            system.data.len()
        ),
    }
}

/// Printable preview of an event payload.
fn preview(data: &[u8]) -> String {
    const MAX_CHARS: usize = 48;
    let text = match std::str::from_utf8(data) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("0x{}", hex::encode(data)),
    };
    if text.chars().count() > MAX_CHARS {
        let truncated: String = text.chars().take(MAX_CHARS).collect();
        format!("{}..", truncated)
    } else {
        text
    }
}

fn format_timestamp(millis: i64) -> String {
    match DateTime::from_timestamp_millis(millis) {
        Some(timestamp) => timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{}ms", millis),
    }
}
