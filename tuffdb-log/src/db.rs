//! Chunk database: the set of chunk files backing one transaction log.
//!
//! The database owns one slot per chunk number; a merged chunk occupies
//! every slot in its range. Recovery walks the numbers below the writer
//! checkpoint and requires a valid completed chunk for each, then opens
//! the tail chunk as the active append target. A completed chunk sealing
//! past the checkpoint is followed to its end and the checkpoint moved up
//! to match. Chunk files holding data the checkpoint never acknowledged
//! are removed.

use crate::checkpoint::Checkpoint;
use crate::chunk::{
    Chunk, ChunkFooter, ChunkHeader, RecordRead, CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE,
};
use crate::error::LogError;
use crate::naming::ChunkNaming;
use crate::DEFAULT_CHUNK_DATA_SIZE;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Retries for global reads racing a scavenge swap. Each retry refetches
/// the slot, which the swap has already repopulated.
const MAX_READ_RETRIES: usize = 16;

/// Configuration for a chunk database.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub chunk_prefix: String,
    pub chunk_data_size: u32,
    /// Verify content digests of completed chunks while opening.
    pub verify_digests_on_open: bool,
}

impl LogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            chunk_prefix: "chunk".to_string(),
            chunk_data_size: DEFAULT_CHUNK_DATA_SIZE,
            verify_digests_on_open: false,
        }
    }

    pub fn with_chunk_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.chunk_prefix = prefix.into();
        self
    }

    pub fn with_chunk_data_size(mut self, size: u32) -> Self {
        self.chunk_data_size = size;
        self
    }

    pub fn with_digest_verification(mut self, verify: bool) -> Self {
        self.verify_digests_on_open = verify;
        self
    }

    fn validate(&self) -> Result<(), LogError> {
        if self.chunk_data_size == 0 {
            return Err(LogError::InvalidArgument(
                "chunk_data_size must be greater than zero".into(),
            ));
        }
        if self.chunk_prefix.is_empty() {
            return Err(LogError::InvalidArgument(
                "chunk_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// The chunk database.
pub struct ChunkDb {
    config: LogConfig,
    naming: ChunkNaming,
    /// One slot per chunk number; merged chunks share an `Arc` across
    /// their covered slots. The last slot is always the active chunk.
    chunks: RwLock<Vec<Arc<Chunk>>>,
}

impl ChunkDb {
    /// Opens the database, recovering chunk state up to the writer
    /// checkpoint's flushed position. When completed chunks seal the log
    /// past the checkpoint, the checkpoint is moved to the recovered tail
    /// and flushed.
    pub fn open(config: LogConfig, writer_checkpoint: &dyn Checkpoint) -> Result<Self, LogError> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;
        let naming = ChunkNaming::new(&config.dir, &config.chunk_prefix);

        for temp in naming.temp_files()? {
            match std::fs::remove_file(&temp) {
                Ok(()) => tracing::info!("removed stale temp file {}", temp.display()),
                Err(e) => {
                    tracing::warn!("failed to remove temp file {}: {}", temp.display(), e)
                }
            }
        }

        let chunk_data_size = config.chunk_data_size as u64;
        let position = writer_checkpoint.read();
        let tail_number = (position / chunk_data_size) as u32;
        let tail_offset = position % chunk_data_size;

        let mut chunks: Vec<Arc<Chunk>> = Vec::with_capacity(tail_number as usize + 1);
        let mut number = 0u32;
        while number < tail_number {
            let versions = naming.versions_for(number)?;
            let Some((_, path)) = versions.first() else {
                return Err(LogError::CorruptDatabase(format!(
                    "chunk {} is missing but the writer checkpoint is at {}",
                    number, position
                )));
            };
            let chunk = Chunk::open_completed(path, config.verify_digests_on_open)
                .map_err(|e| {
                    LogError::CorruptDatabase(format!("chunk file {}: {}", path.display(), e))
                })?;
            let header = *chunk.header();
            if header.chunk_start_number != number {
                return Err(LogError::CorruptDatabase(format!(
                    "chunk file {} covers {}..{}, expected a completed chunk starting at {}",
                    path.display(),
                    header.chunk_start_number,
                    header.chunk_end_number,
                    number
                )));
            }
            if header.chunk_data_size != config.chunk_data_size {
                return Err(LogError::CorruptDatabase(format!(
                    "chunk file {} has data size {}, configured {}",
                    path.display(),
                    header.chunk_data_size,
                    config.chunk_data_size
                )));
            }
            remove_superseded(&versions, Some(path));
            let chunk = Arc::new(chunk);
            for covered in header.chunk_start_number..=header.chunk_end_number {
                chunks.push(chunk.clone());
                // Files named for a number inside the span are superseded.
                if covered > number {
                    remove_superseded(&naming.versions_for(covered)?, None);
                }
            }
            number = header.chunk_end_number + 1;
        }

        let active: Arc<Chunk> = if number > tail_number {
            // A merged chunk sealed the log past the checkpoint; its
            // completion footer covers the whole span. Resume after it.
            if let Some(sealed) = chunks.last() {
                tracing::info!(
                    "chunk {} seals past the writer checkpoint at {}, starting chunk {}",
                    sealed.file_name(),
                    position,
                    number
                );
            }
            remove_chunks_from(&naming, tail_number)?;
            Arc::new(Chunk::create(
                &naming.filename(number, 0),
                ChunkHeader::new(number, config.chunk_data_size),
            )?)
        } else {
            let tail_versions = naming.versions_for(tail_number)?;
            match tail_versions.first() {
                Some((_, path)) => {
                    if has_completion_footer(path)? {
                        // Rollover crashed between completing this chunk and
                        // acknowledging the next; resume past it.
                        let chunk = Chunk::open_completed(path, config.verify_digests_on_open)
                            .map_err(|e| {
                                LogError::CorruptDatabase(format!(
                                    "chunk file {}: {}",
                                    path.display(),
                                    e
                                ))
                            })?;
                        let header = *chunk.header();
                        if header.chunk_start_number != tail_number
                            || header.chunk_data_size != config.chunk_data_size
                        {
                            return Err(LogError::CorruptDatabase(format!(
                                "completed tail chunk file {} covers {}..{} with data size {}",
                                path.display(),
                                header.chunk_start_number,
                                header.chunk_end_number,
                                header.chunk_data_size
                            )));
                        }
                        remove_superseded(&tail_versions, Some(path));
                        let next = header.chunk_end_number + 1;
                        tracing::info!(
                            "tail chunk {} was already completed, starting chunk {}",
                            chunk.file_name(),
                            next
                        );
                        let chunk = Arc::new(chunk);
                        for _ in header.chunk_start_number..=header.chunk_end_number {
                            chunks.push(chunk.clone());
                        }
                        remove_chunks_from(&naming, next)?;
                        Arc::new(Chunk::create(
                            &naming.filename(next, 0),
                            ChunkHeader::new(next, config.chunk_data_size),
                        )?)
                    } else {
                        remove_chunks_from(&naming, tail_number + 1)?;
                        match Chunk::open_active(
                            path,
                            tail_number,
                            config.chunk_data_size,
                            tail_offset,
                        ) {
                            Ok(chunk) => {
                                remove_superseded(&tail_versions, Some(path));
                                Arc::new(chunk)
                            }
                            Err(e) if tail_offset == 0 => {
                                // No acknowledged data inside it; start over.
                                tracing::warn!(
                                    "recreating unreadable empty tail chunk {}: {}",
                                    path.display(),
                                    e
                                );
                                std::fs::remove_file(path)?;
                                remove_superseded(&tail_versions[1..], None);
                                Arc::new(Chunk::create(
                                    path,
                                    ChunkHeader::new(tail_number, config.chunk_data_size),
                                )?)
                            }
                            Err(e) => {
                                return Err(LogError::CorruptDatabase(format!(
                                    "tail chunk file {}: {}",
                                    path.display(),
                                    e
                                )))
                            }
                        }
                    }
                }
                None if tail_offset > 0 => {
                    return Err(LogError::CorruptDatabase(format!(
                        "writer checkpoint {} points into missing chunk {}",
                        position, tail_number
                    )))
                }
                None => {
                    remove_chunks_from(&naming, tail_number + 1)?;
                    Arc::new(Chunk::create(
                        &naming.filename(tail_number, 0),
                        ChunkHeader::new(tail_number, config.chunk_data_size),
                    )?)
                }
            }
        };
        let tail = active.header().logical_start() + active.physical_data_size();
        chunks.push(active);
        if tail > position {
            // Everything below the recovered tail sits under a completion
            // footer; acknowledge it so followers see the whole log.
            writer_checkpoint.write(tail);
            writer_checkpoint.flush()?;
            tracing::info!("moved writer checkpoint from {} to {}", position, tail);
        }

        let distinct = distinct_count(&chunks);
        tracing::info!(
            "opened chunk database in {}: {} chunk file(s), writer position {}",
            config.dir.display(),
            distinct,
            writer_checkpoint.read()
        );

        Ok(Self {
            config,
            naming,
            chunks: RwLock::new(chunks),
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn naming(&self) -> &ChunkNaming {
        &self.naming
    }

    /// Number of chunk slots, including the active chunk.
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Distinct chunks in slot order, each merged chunk once.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let chunks = self.chunks.read();
        let mut out: Vec<Arc<Chunk>> = Vec::new();
        for chunk in chunks.iter() {
            if !out.iter().any(|c| Arc::ptr_eq(c, chunk)) {
                out.push(chunk.clone());
            }
        }
        out
    }

    /// The chunk covering a chunk number.
    pub fn chunk_for_number(&self, number: u32) -> Result<Arc<Chunk>, LogError> {
        self.chunks
            .read()
            .get(number as usize)
            .cloned()
            .ok_or(LogError::ChunkNotFound(
                number as u64 * self.config.chunk_data_size as u64,
            ))
    }

    /// The chunk covering a global log position.
    pub fn chunk_for_position(&self, position: u64) -> Result<Arc<Chunk>, LogError> {
        self.slot_for_position(position)
            .ok_or(LogError::ChunkNotFound(position))
    }

    /// The current append target.
    pub fn active_chunk(&self) -> Arc<Chunk> {
        self.chunks
            .read()
            .last()
            .cloned()
            .expect("chunk database always holds an active chunk")
    }

    /// Global position one past the last appended byte.
    pub fn tail_position(&self) -> u64 {
        let active = self.active_chunk();
        active.header().logical_start() + active.physical_data_size()
    }

    /// Completes the active chunk and opens a fresh one after it.
    pub fn add_new_chunk(&self) -> Result<Arc<Chunk>, LogError> {
        let mut chunks = self.chunks.write();
        let active = chunks
            .last()
            .cloned()
            .expect("chunk database always holds an active chunk");
        if !active.is_completed() {
            active.complete()?;
        }
        let number = active.header().chunk_end_number + 1;
        let chunk = Arc::new(Chunk::create(
            &self.naming.filename(number, 0),
            ChunkHeader::new(number, self.config.chunk_data_size),
        )?);
        chunks.push(chunk.clone());
        tracing::info!(
            "completed chunk {} ({} bytes), started chunk {}",
            active.file_name(),
            active.physical_data_size(),
            chunk.file_name()
        );
        Ok(chunk)
    }

    /// Replaces the slots a scavenged chunk covers and marks the replaced
    /// chunks for deletion. Returns the replaced chunks; their files are
    /// unlinked once outstanding readers release.
    pub fn swap_scavenged_chunk(
        &self,
        new_chunk: Arc<Chunk>,
    ) -> Result<Vec<Arc<Chunk>>, LogError> {
        if !new_chunk.is_completed() {
            return Err(LogError::InvalidOperation(format!(
                "scavenged chunk {} is not completed",
                new_chunk.file_name()
            )));
        }
        let header = *new_chunk.header();
        let start = header.chunk_start_number as usize;
        let end = header.chunk_end_number as usize;

        let mut chunks = self.chunks.write();
        if end + 1 >= chunks.len() {
            return Err(LogError::InvalidOperation(format!(
                "cannot swap chunks {}..{}: range reaches the active chunk",
                start, end
            )));
        }
        let mut replaced: Vec<Arc<Chunk>> = Vec::new();
        for slot in start..=end {
            let old = &chunks[slot];
            if !replaced.iter().any(|c| Arc::ptr_eq(c, old)) {
                replaced.push(old.clone());
            }
        }
        for old in &replaced {
            let old_header = old.header();
            if (old_header.chunk_start_number as usize) < start
                || (old_header.chunk_end_number as usize) > end
            {
                return Err(LogError::InvalidOperation(format!(
                    "chunk {} extends outside swap range {}..{}",
                    old.file_name(),
                    start,
                    end
                )));
            }
        }
        for slot in chunks.iter_mut().take(end + 1).skip(start) {
            *slot = new_chunk.clone();
        }
        drop(chunks);

        tracing::info!(
            "swapped in scavenged chunk {} for {} old file(s)",
            new_chunk.file_name(),
            replaced.len()
        );
        for old in &replaced {
            old.mark_for_deletion();
        }
        Ok(replaced)
    }

    /// Flushes the active chunk.
    pub fn close(&self) -> Result<(), LogError> {
        let active = self.active_chunk();
        if !active.is_completed() {
            active.flush()?;
        }
        Ok(())
    }

    fn slot_for_position(&self, position: u64) -> Option<Arc<Chunk>> {
        let slot = (position / self.config.chunk_data_size as u64) as usize;
        self.chunks.read().get(slot).cloned()
    }

    fn to_global(chunk: &Chunk, read: RecordRead) -> RecordRead {
        let base = chunk.header().logical_start();
        RecordRead {
            record: read.record,
            log_position: base + read.log_position,
            next_position: base + read.next_position,
        }
    }

    /// Reads the record at an exact global position. `None` when nothing
    /// lives there (past the tail, inside a chunk's dead zone, or removed
    /// by a scavenge).
    pub fn try_read_at(&self, position: u64) -> Result<Option<RecordRead>, LogError> {
        let mut retries = 0;
        loop {
            let Some(chunk) = self.slot_for_position(position) else {
                return Ok(None);
            };
            let local = position - chunk.header().logical_start();
            match chunk.try_read_at(local) {
                Ok(read) => return Ok(read.map(|r| Self::to_global(&chunk, r))),
                Err(e @ LogError::ChunkMarkedForDeletion(_)) => {
                    retries += 1;
                    if retries > MAX_READ_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads the first record at or after a global position.
    pub fn try_read_closest_forward(
        &self,
        position: u64,
    ) -> Result<Option<RecordRead>, LogError> {
        let mut position = position;
        let mut retries = 0;
        loop {
            let Some(chunk) = self.slot_for_position(position) else {
                return Ok(None);
            };
            let local = position.saturating_sub(chunk.header().logical_start());
            match chunk.try_read_closest_forward(local) {
                Ok(Some(read)) => return Ok(Some(Self::to_global(&chunk, read))),
                Ok(None) => {
                    // Nothing further in this chunk; continue at the next.
                    position = (chunk.header().chunk_end_number as u64 + 1)
                        * self.config.chunk_data_size as u64;
                }
                Err(e @ LogError::ChunkMarkedForDeletion(_)) => {
                    retries += 1;
                    if retries > MAX_READ_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads the last record ending at or before a global position.
    pub fn try_read_closest_backward(
        &self,
        position: u64,
    ) -> Result<Option<RecordRead>, LogError> {
        let mut position = position.min(self.tail_position());
        let mut retries = 0;
        loop {
            if position == 0 {
                return Ok(None);
            }
            let Some(chunk) = self.slot_for_position(position - 1) else {
                return Ok(None);
            };
            let local = position - chunk.header().logical_start();
            match chunk.try_read_closest_backward(local) {
                Ok(Some(read)) => return Ok(Some(Self::to_global(&chunk, read))),
                Ok(None) => position = chunk.header().logical_start(),
                Err(e @ LogError::ChunkMarkedForDeletion(_)) => {
                    retries += 1;
                    if retries > MAX_READ_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads the first record of the log.
    pub fn try_read_first(&self) -> Result<Option<RecordRead>, LogError> {
        self.try_read_closest_forward(0)
    }

    /// Reads the last record of the log.
    pub fn try_read_last(&self) -> Result<Option<RecordRead>, LogError> {
        self.try_read_closest_backward(self.tail_position())
    }
}

fn distinct_count(chunks: &[Arc<Chunk>]) -> usize {
    let mut count = 0;
    let mut prev: Option<&Arc<Chunk>> = None;
    for chunk in chunks {
        if !prev.map(|p| Arc::ptr_eq(p, chunk)).unwrap_or(false) {
            count += 1;
        }
        prev = Some(chunk);
    }
    count
}

/// Checks for a valid completion footer without opening the chunk fully.
fn has_completion_footer(path: &Path) -> Result<bool, LogError> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len < CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-(CHUNK_FOOTER_SIZE as i64)))?;
    let mut buf = vec![0u8; CHUNK_FOOTER_SIZE as usize];
    file.read_exact(&mut buf)?;
    Ok(ChunkFooter::decode(&buf)
        .map(|f| f.is_completed)
        .unwrap_or(false))
}

fn remove_superseded(versions: &[(u32, PathBuf)], keep: Option<&Path>) {
    for (_, path) in versions {
        if keep.map(|k| k == path).unwrap_or(false) {
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!("removed superseded chunk file {}", path.display()),
            Err(e) => tracing::warn!(
                "failed to remove superseded chunk file {}: {}",
                path.display(),
                e
            ),
        }
    }
}

/// Removes chunk files numbered at or past `from_number`; their data was
/// never acknowledged by the writer checkpoint.
fn remove_chunks_from(naming: &ChunkNaming, from_number: u32) -> Result<(), LogError> {
    for path in naming.present_files()? {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Some((number, _)) = naming.parse(&name) else {
            continue;
        };
        if number >= from_number {
            tracing::info!("removing chunk file {} past the writer checkpoint", name);
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
