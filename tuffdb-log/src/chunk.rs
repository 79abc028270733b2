//! Chunk files: bounded slices of the transaction log.
//!
//! A chunk file holds framed records between a fixed 128-byte header and,
//! once completed, a fixed 128-byte footer:
//!
//! ```text
//! +--------+--------------------------+-----------+-----+--------+
//! | header | framed records           |posmap    | pad | footer |
//! | 128 B  | physical_data_size bytes | 12 B each |     | 128 B  |
//! +--------+--------------------------+-----------+-----+--------+
//! ```
//!
//! Total file size is always a multiple of 4096. The position map exists
//! only in scavenged chunks and translates pre-scavenge logical positions
//! to the physical offsets records moved to.
//!
//! Lifecycle: created *active* (pre-sized, appendable), then *completed*
//! (footer written, read-only). A completed chunk can be cached in memory;
//! reads are served from the cache transparently. Every read holds a
//! reader reference; `mark_for_deletion` unlinks the file only after the
//! last reference is released.

use crate::error::LogError;
use crate::record::{LogRecord, MAX_RECORD_SIZE};
use crate::{CHUNK_FILE_ALIGNMENT, FRAME_OVERHEAD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// On-disk size of the chunk header.
pub const CHUNK_HEADER_SIZE: u64 = 128;

/// On-disk size of the chunk footer.
pub const CHUNK_FOOTER_SIZE: u64 = 128;

/// On-disk size of one position map entry.
pub const POS_MAP_ENTRY_SIZE: usize = 12;

const HEADER_MAGIC: &[u8; 4] = b"TUFC";
const FOOTER_MAGIC: &[u8; 4] = b"TUFF";
const CHUNK_FORMAT_VERSION: u8 = 1;

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of chunk file",
            ));
        }
        done += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        done += file.seek_write(&buf[done..], offset + done as u64)?;
    }
    Ok(())
}

/// Rounds a raw byte count up to the chunk file alignment.
fn align_up(size: u64) -> u64 {
    size.div_ceil(CHUNK_FILE_ALIGNMENT) * CHUNK_FILE_ALIGNMENT
}

/// Total file size for a chunk with the given data and map sizes.
pub fn aligned_file_size(physical_data_size: u64, map_size: u64) -> u64 {
    align_up(CHUNK_HEADER_SIZE + physical_data_size + map_size + CHUNK_FOOTER_SIZE)
}

/// Immutable chunk metadata, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub format_version: u8,
    pub is_scavenged: bool,
    /// First chunk number this file covers.
    pub chunk_start_number: u32,
    /// Last chunk number this file covers; equals the start unless merged.
    pub chunk_end_number: u32,
    /// Logical data capacity per chunk number.
    pub chunk_data_size: u32,
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    /// Header for an ordinary single-number chunk.
    pub fn new(chunk_number: u32, chunk_data_size: u32) -> Self {
        Self {
            format_version: CHUNK_FORMAT_VERSION,
            is_scavenged: false,
            chunk_start_number: chunk_number,
            chunk_end_number: chunk_number,
            chunk_data_size,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// Header for a scavenged chunk, possibly spanning a merged range.
    pub fn new_scavenged(start_number: u32, end_number: u32, chunk_data_size: u32) -> Self {
        Self {
            format_version: CHUNK_FORMAT_VERSION,
            is_scavenged: true,
            chunk_start_number: start_number,
            chunk_end_number: end_number,
            chunk_data_size,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// Logical position of the first byte this chunk covers.
    pub fn logical_start(&self) -> u64 {
        self.chunk_start_number as u64 * self.chunk_data_size as u64
    }

    /// Logical span covered by this chunk file.
    pub fn logical_span(&self) -> u64 {
        (self.chunk_end_number - self.chunk_start_number + 1) as u64
            * self.chunk_data_size as u64
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::zeroed(CHUNK_HEADER_SIZE as usize);
        buf[0..4].copy_from_slice(HEADER_MAGIC);
        buf[4] = self.format_version;
        buf[5] = self.is_scavenged as u8;
        buf[8..12].copy_from_slice(&self.chunk_start_number.to_le_bytes());
        buf[12..16].copy_from_slice(&self.chunk_end_number.to_le_bytes());
        buf[16..20].copy_from_slice(&self.chunk_data_size.to_le_bytes());
        buf[20..36].copy_from_slice(self.chunk_id.as_bytes());
        let crc = crc32c::crc32c(&buf[0..124]);
        buf[124..128].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < CHUNK_HEADER_SIZE as usize {
            return Err(LogError::CorruptChunk {
                reason: format!("header truncated: {} bytes", buf.len()),
            });
        }
        if &buf[0..4] != HEADER_MAGIC {
            return Err(LogError::CorruptChunk {
                reason: "bad header magic".into(),
            });
        }
        let crc = u32::from_le_bytes([buf[124], buf[125], buf[126], buf[127]]);
        if crc != crc32c::crc32c(&buf[0..124]) {
            return Err(LogError::CorruptChunk {
                reason: "header checksum mismatch".into(),
            });
        }
        let format_version = buf[4];
        if format_version != CHUNK_FORMAT_VERSION {
            return Err(LogError::CorruptChunk {
                reason: format!("unsupported chunk format version {}", format_version),
            });
        }
        let chunk_start_number = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let chunk_end_number = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let chunk_data_size = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if chunk_end_number < chunk_start_number {
            return Err(LogError::CorruptChunk {
                reason: format!(
                    "chunk range {}..{} is inverted",
                    chunk_start_number, chunk_end_number
                ),
            });
        }
        if chunk_data_size == 0 {
            return Err(LogError::CorruptChunk {
                reason: "zero chunk data size".into(),
            });
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[20..36]);
        Ok(Self {
            format_version,
            is_scavenged: buf[5] != 0,
            chunk_start_number,
            chunk_end_number,
            chunk_data_size,
            chunk_id: Uuid::from_bytes(id),
        })
    }
}

/// Completion metadata, written as the final 128 bytes of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    /// Bytes of record data physically present.
    pub physical_data_size: u32,
    /// Logical position just past the last record, in pre-scavenge terms.
    pub logical_data_size: u64,
    /// Size of the position map in bytes.
    pub map_size: u32,
    /// crc32c over the data region followed by the map bytes.
    pub content_digest: u32,
}

impl ChunkFooter {
    pub fn map_entry_count(&self) -> usize {
        self.map_size as usize / POS_MAP_ENTRY_SIZE
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::zeroed(CHUNK_FOOTER_SIZE as usize);
        buf[0..4].copy_from_slice(FOOTER_MAGIC);
        buf[4] = CHUNK_FORMAT_VERSION;
        buf[5] = self.is_completed as u8;
        buf[8..12].copy_from_slice(&self.physical_data_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.map_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.logical_data_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.content_digest.to_le_bytes());
        let crc = crc32c::crc32c(&buf[0..124]);
        buf[124..128].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < CHUNK_FOOTER_SIZE as usize {
            return Err(LogError::CorruptChunk {
                reason: format!("footer truncated: {} bytes", buf.len()),
            });
        }
        if &buf[0..4] != FOOTER_MAGIC {
            return Err(LogError::CorruptChunk {
                reason: "bad footer magic".into(),
            });
        }
        let crc = u32::from_le_bytes([buf[124], buf[125], buf[126], buf[127]]);
        if crc != crc32c::crc32c(&buf[0..124]) {
            return Err(LogError::CorruptChunk {
                reason: "footer checksum mismatch".into(),
            });
        }
        let map_size = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        if map_size as usize % POS_MAP_ENTRY_SIZE != 0 {
            return Err(LogError::CorruptChunk {
                reason: format!("map size {} is not a whole number of entries", map_size),
            });
        }
        Ok(Self {
            is_completed: buf[5] != 0,
            physical_data_size: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            map_size,
            logical_data_size: u64::from_le_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
            content_digest: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}

/// One entry of a scavenged chunk's position map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosMapEntry {
    /// Pre-scavenge logical position of the record, relative to the
    /// chunk's logical start.
    pub log_position: u64,
    /// Physical offset of the record within the data region.
    pub physical_position: u32,
}

fn encode_pos_map(map: &[PosMapEntry]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(map.len() * POS_MAP_ENTRY_SIZE);
    for entry in map {
        buf.put_u64_le(entry.log_position);
        buf.put_u32_le(entry.physical_position);
    }
    buf
}

fn decode_pos_map(mut buf: Bytes) -> Result<Vec<PosMapEntry>, LogError> {
    let mut map = Vec::with_capacity(buf.len() / POS_MAP_ENTRY_SIZE);
    let mut prev: Option<u64> = None;
    while buf.remaining() >= POS_MAP_ENTRY_SIZE {
        let entry = PosMapEntry {
            log_position: buf.get_u64_le(),
            physical_position: buf.get_u32_le(),
        };
        if let Some(prev) = prev {
            if entry.log_position <= prev {
                return Err(LogError::CorruptChunk {
                    reason: "position map is not strictly ascending".into(),
                });
            }
        }
        prev = Some(entry.log_position);
        map.push(entry);
    }
    Ok(map)
}

/// Outcome of appending a record to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Record written; positions are local to the chunk.
    Written { old_position: u64, new_position: u64 },
    /// Record does not fit in the remaining capacity; roll over.
    Full,
}

/// A successfully read record with its adjacent positions.
///
/// `log_position` is the record's logical position local to the chunk.
/// For forward reads `next_position` is where the following record starts;
/// for backward reads it equals `log_position`, where the preceding read
/// continues from.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRead {
    pub record: LogRecord,
    pub log_position: u64,
    pub next_position: u64,
}

struct AppendState {
    /// Running crc32c over the data region, kept so completion does not
    /// re-read the file.
    crc: u32,
    sync_pending: bool,
}

struct DestroyState {
    readers: u32,
    marked: bool,
    destroyed: bool,
}

/// Guard keeping a chunk's backing storage alive for the duration of
/// external reads. Dropping it releases the reference.
pub struct ReaderGuard {
    chunk: Arc<Chunk>,
}

impl ReaderGuard {
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.chunk.end_read();
    }
}

/// Internal read scope used by the chunk's own read operations.
struct ReadScope<'a> {
    chunk: &'a Chunk,
}

impl Drop for ReadScope<'_> {
    fn drop(&mut self) {
        self.chunk.end_read();
    }
}

/// One bounded-size chunk file of the transaction log.
pub struct Chunk {
    header: ChunkHeader,
    path: PathBuf,
    file: File,
    append: Mutex<AppendState>,
    /// Bytes of record data readable; the append path publishes the new
    /// end here after the bytes hit the file.
    data_position: AtomicU64,
    footer: RwLock<Option<ChunkFooter>>,
    pos_map: RwLock<Arc<Vec<PosMapEntry>>>,
    cache: RwLock<Option<Bytes>>,
    destroy: Mutex<DestroyState>,
    destroy_cv: Condvar,
}

impl Chunk {
    /// Creates a fresh active chunk, pre-sized to its full aligned size.
    pub fn create(path: &Path, header: ChunkHeader) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        write_at(&file, &header.encode(), 0)?;
        file.set_len(aligned_file_size(header.chunk_data_size as u64, 0))?;
        file.sync_data()?;

        Ok(Self {
            header,
            path: path.to_path_buf(),
            file,
            append: Mutex::new(AppendState {
                crc: 0,
                sync_pending: false,
            }),
            data_position: AtomicU64::new(0),
            footer: RwLock::new(None),
            pos_map: RwLock::new(Arc::new(Vec::new())),
            cache: RwLock::new(None),
            destroy: Mutex::new(DestroyState {
                readers: 0,
                marked: false,
                destroyed: false,
            }),
            destroy_cv: Condvar::new(),
        })
    }

    /// Reopens an uncompleted chunk as the active tail, positioned at
    /// `data_position` bytes of existing record data.
    ///
    /// The existing data region is re-read to seed the running digest;
    /// anything past `data_position` is dead and will be overwritten.
    pub fn open_active(
        path: &Path,
        expected_number: u32,
        expected_data_size: u32,
        data_position: u64,
    ) -> Result<Self, LogError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut raw = vec![0u8; CHUNK_HEADER_SIZE as usize];
        read_at(&file, &mut raw, 0)?;
        let header = ChunkHeader::decode(&raw)?;
        if header.chunk_start_number != expected_number
            || header.chunk_end_number != expected_number
        {
            return Err(LogError::CorruptChunk {
                reason: format!(
                    "chunk covers {}..{}, expected {}",
                    header.chunk_start_number, header.chunk_end_number, expected_number
                ),
            });
        }
        if header.chunk_data_size != expected_data_size {
            return Err(LogError::CorruptChunk {
                reason: format!(
                    "chunk data size {} does not match configured {}",
                    header.chunk_data_size, expected_data_size
                ),
            });
        }
        if header.is_scavenged {
            return Err(LogError::CorruptChunk {
                reason: "scavenged chunk has no completion footer".into(),
            });
        }
        if data_position > header.chunk_data_size as u64 {
            return Err(LogError::InvalidArgument(format!(
                "data position {} exceeds chunk data size {}",
                data_position, header.chunk_data_size
            )));
        }

        // Restore the pre-allocated size in case a crash truncated it.
        let full_size = aligned_file_size(header.chunk_data_size as u64, 0);
        if file.metadata()?.len() != full_size {
            file.set_len(full_size)?;
        }

        // Seed the running digest from the confirmed data region.
        let mut crc = 0u32;
        let mut offset = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        while offset < data_position {
            let len = buf.len().min((data_position - offset) as usize);
            read_at(&file, &mut buf[..len], CHUNK_HEADER_SIZE + offset)?;
            crc = crc32c::crc32c_append(crc, &buf[..len]);
            offset += len as u64;
        }

        Ok(Self {
            header,
            path: path.to_path_buf(),
            file,
            append: Mutex::new(AppendState {
                crc,
                sync_pending: false,
            }),
            data_position: AtomicU64::new(data_position),
            footer: RwLock::new(None),
            pos_map: RwLock::new(Arc::new(Vec::new())),
            cache: RwLock::new(None),
            destroy: Mutex::new(DestroyState {
                readers: 0,
                marked: false,
                destroyed: false,
            }),
            destroy_cv: Condvar::new(),
        })
    }

    /// Opens a completed chunk, validating its header, footer and geometry.
    ///
    /// With `verify_digest` the whole data region and map are read back
    /// and checked against the footer's content digest.
    pub fn open_completed(path: &Path, verify_digest: bool) -> Result<Self, LogError> {
        let file = OpenOptions::new().read(true).open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
            return Err(LogError::CorruptChunk {
                reason: format!("file is only {} bytes", file_size),
            });
        }
        if file_size % CHUNK_FILE_ALIGNMENT != 0 {
            return Err(LogError::CorruptChunk {
                reason: format!("file size {} is not 4096-aligned", file_size),
            });
        }

        let mut raw = vec![0u8; CHUNK_HEADER_SIZE as usize];
        read_at(&file, &mut raw, 0)?;
        let header = ChunkHeader::decode(&raw)?;

        let mut raw = vec![0u8; CHUNK_FOOTER_SIZE as usize];
        read_at(&file, &mut raw, file_size - CHUNK_FOOTER_SIZE)?;
        let footer = ChunkFooter::decode(&raw)?;
        if !footer.is_completed {
            return Err(LogError::CorruptChunk {
                reason: "footer present but chunk not completed".into(),
            });
        }

        let expected =
            aligned_file_size(footer.physical_data_size as u64, footer.map_size as u64);
        if expected != file_size {
            return Err(LogError::CorruptChunk {
                reason: format!(
                    "file size {} does not match footer geometry {}",
                    file_size, expected
                ),
            });
        }

        let mut raw = vec![0u8; footer.map_size as usize];
        read_at(
            &file,
            &mut raw,
            CHUNK_HEADER_SIZE + footer.physical_data_size as u64,
        )?;
        let map_bytes = Bytes::from(raw);
        let pos_map = decode_pos_map(map_bytes.clone())?;
        if header.is_scavenged {
            if let Some(last) = pos_map.last() {
                if last.log_position >= footer.logical_data_size {
                    return Err(LogError::CorruptChunk {
                        reason: "position map extends past logical data size".into(),
                    });
                }
            }
        }

        if verify_digest {
            let mut crc = 0u32;
            let mut offset = 0u64;
            let mut buf = vec![0u8; 64 * 1024];
            while offset < footer.physical_data_size as u64 {
                let len = buf
                    .len()
                    .min((footer.physical_data_size as u64 - offset) as usize);
                read_at(&file, &mut buf[..len], CHUNK_HEADER_SIZE + offset)?;
                crc = crc32c::crc32c_append(crc, &buf[..len]);
                offset += len as u64;
            }
            crc = crc32c::crc32c_append(crc, &map_bytes);
            if crc != footer.content_digest {
                return Err(LogError::CorruptChunk {
                    reason: format!(
                        "content digest mismatch: stored {:08x}, computed {:08x}",
                        footer.content_digest, crc
                    ),
                });
            }
        }

        Ok(Self {
            header,
            path: path.to_path_buf(),
            file,
            append: Mutex::new(AppendState {
                crc: 0,
                sync_pending: false,
            }),
            data_position: AtomicU64::new(footer.physical_data_size as u64),
            footer: RwLock::new(Some(footer)),
            pos_map: RwLock::new(Arc::new(pos_map)),
            cache: RwLock::new(None),
            destroy: Mutex::new(DestroyState {
                readers: 0,
                marked: false,
                destroyed: false,
            }),
            destroy_cv: Condvar::new(),
        })
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name for log and error messages.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Bytes of record data physically present.
    pub fn physical_data_size(&self) -> u64 {
        self.data_position.load(Ordering::Acquire)
    }

    /// Logical position just past the last record, local to the chunk.
    pub fn logical_data_size(&self) -> u64 {
        match *self.footer.read() {
            Some(footer) => footer.logical_data_size,
            None => self.physical_data_size(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.footer.read().is_some()
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    pub fn is_cached(&self) -> bool {
        self.cache.read().is_some()
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        *self.footer.read()
    }

    /// Current on-disk file size.
    pub fn file_size(&self) -> Result<u64, LogError> {
        Ok(self.file.metadata()?.len())
    }

    // ------------------------------------------------------------------
    // Appending and completion
    // ------------------------------------------------------------------

    /// Appends a framed record, returning its local positions or `Full`
    /// when the record exceeds the remaining capacity.
    pub fn try_append(&self, record: &LogRecord) -> Result<AppendResult, LogError> {
        let mut append = self.append.lock();
        if self.is_completed() {
            return Err(LogError::InvalidOperation(format!(
                "cannot append to completed chunk {}",
                self.file_name()
            )));
        }

        let encoded = record.encode()?;
        let position = self.data_position.load(Ordering::Acquire);
        if position + encoded.len() as u64 > self.header.chunk_data_size as u64 {
            return Ok(AppendResult::Full);
        }

        write_at(&self.file, &encoded, CHUNK_HEADER_SIZE + position)?;
        append.crc = crc32c::crc32c_append(append.crc, &encoded);
        append.sync_pending = true;
        let new_position = position + encoded.len() as u64;
        self.data_position.store(new_position, Ordering::Release);

        Ok(AppendResult::Written {
            old_position: position,
            new_position,
        })
    }

    /// Syncs appended data to disk. A no-op on a completed chunk.
    pub fn flush(&self) -> Result<(), LogError> {
        if self.destroy.lock().destroyed {
            return Err(LogError::InvalidOperation(format!(
                "cannot flush destroyed chunk {}",
                self.file_name()
            )));
        }
        if self.is_completed() {
            return Ok(());
        }
        let mut append = self.append.lock();
        if append.sync_pending {
            self.file.sync_data()?;
            append.sync_pending = false;
        }
        Ok(())
    }

    /// Completes the chunk: writes the footer and makes it read-only.
    pub fn complete(&self) -> Result<(), LogError> {
        self.complete_with(&[], self.physical_data_size())
    }

    /// Completes a scavenged chunk with its position map and the logical
    /// data size the source chunk(s) covered.
    pub fn complete_scavenged(
        &self,
        map: &[PosMapEntry],
        logical_data_size: u64,
    ) -> Result<(), LogError> {
        self.complete_with(map, logical_data_size)
    }

    fn complete_with(&self, map: &[PosMapEntry], logical_data_size: u64) -> Result<(), LogError> {
        let mut append = self.append.lock();
        if self.is_completed() {
            return Err(LogError::InvalidOperation(format!(
                "chunk {} is already completed",
                self.file_name()
            )));
        }

        let physical = self.data_position.load(Ordering::Acquire);
        let map_bytes = encode_pos_map(map);
        let footer = ChunkFooter {
            is_completed: true,
            physical_data_size: physical as u32,
            logical_data_size,
            map_size: map_bytes.len() as u32,
            content_digest: crc32c::crc32c_append(append.crc, &map_bytes),
        };

        let total = aligned_file_size(physical, map_bytes.len() as u64);
        // Shrinking from the pre-allocated size; the pad stays zeroed.
        self.file.set_len(total)?;
        if !map_bytes.is_empty() {
            write_at(&self.file, &map_bytes, CHUNK_HEADER_SIZE + physical)?;
        }
        write_at(&self.file, &footer.encode(), total - CHUNK_FOOTER_SIZE)?;
        self.file.sync_all()?;
        append.sync_pending = false;

        *self.pos_map.write() = Arc::new(map.to_vec());
        *self.footer.write() = Some(footer);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    fn begin_read(&self) -> Result<ReadScope<'_>, LogError> {
        let mut state = self.destroy.lock();
        if state.marked {
            return Err(LogError::ChunkMarkedForDeletion(self.file_name()));
        }
        state.readers += 1;
        Ok(ReadScope { chunk: self })
    }

    fn end_read(&self) {
        let mut state = self.destroy.lock();
        state.readers -= 1;
        if state.readers == 0 && state.marked && !state.destroyed {
            self.unlink_locked(&mut state);
        }
    }

    /// Reads `len` bytes at an offset within the data region, from the
    /// cache when present.
    fn read_bytes(&self, data_offset: u64, len: usize) -> Result<Bytes, LogError> {
        {
            let cache = self.cache.read();
            if let Some(data) = cache.as_ref() {
                let start = data_offset as usize;
                let end = start + len;
                if end > data.len() {
                    return Err(LogError::CorruptChunk {
                        reason: format!(
                            "read {}..{} past cached data of {} bytes",
                            start,
                            end,
                            data.len()
                        ),
                    });
                }
                return Ok(data.slice(start..end));
            }
        }
        let mut buf = vec![0u8; len];
        read_at(&self.file, &mut buf, CHUNK_HEADER_SIZE + data_offset)?;
        Ok(Bytes::from(buf))
    }

    /// Reads and decodes the frame starting at a physical data offset.
    fn read_frame_at(
        &self,
        physical: u64,
        data_end: u64,
        logical: u64,
    ) -> Result<(LogRecord, usize), LogError> {
        if physical + 4 > data_end {
            return Err(LogError::CorruptRecord {
                position: logical,
                reason: "length prefix extends past end of data".into(),
            });
        }
        let prefix = self.read_bytes(physical, 4)?;
        let body_len =
            u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if body_len == 0 {
            return Err(LogError::CorruptRecord {
                position: logical,
                reason: "zero-length frame".into(),
            });
        }
        let framed = body_len + FRAME_OVERHEAD;
        if framed > MAX_RECORD_SIZE {
            return Err(LogError::RecordTooLarge {
                size: framed,
                max: MAX_RECORD_SIZE,
            });
        }
        if physical + framed as u64 > data_end {
            return Err(LogError::CorruptRecord {
                position: logical,
                reason: "frame extends past end of data".into(),
            });
        }
        let frame = self.read_bytes(physical, framed)?;
        LogRecord::decode_frame(&frame, logical)
    }

    /// Reads and decodes the frame ending exactly at a physical offset.
    fn read_frame_ending_at(
        &self,
        physical_end: u64,
        logical_end: u64,
    ) -> Result<(LogRecord, usize), LogError> {
        if physical_end < FRAME_OVERHEAD as u64 {
            return Err(LogError::CorruptRecord {
                position: logical_end,
                reason: "frame end too close to start of data".into(),
            });
        }
        let suffix = self.read_bytes(physical_end - 4, 4)?;
        let body_len =
            u32::from_le_bytes([suffix[0], suffix[1], suffix[2], suffix[3]]) as usize;
        let framed = body_len + FRAME_OVERHEAD;
        if body_len == 0 || framed > MAX_RECORD_SIZE {
            return Err(LogError::CorruptRecord {
                position: logical_end,
                reason: format!("implausible length suffix {}", body_len),
            });
        }
        if framed as u64 > physical_end {
            return Err(LogError::CorruptRecord {
                position: logical_end,
                reason: "frame extends before start of data".into(),
            });
        }
        let frame = self.read_bytes(physical_end - framed as u64, framed)?;
        LogRecord::decode_frame(&frame, logical_end - framed as u64)
    }

    /// Reads the record at an exact local logical position.
    ///
    /// Returns `None` when the position is past the readable data or was
    /// removed by a scavenge.
    pub fn try_read_at(&self, log_position: u64) -> Result<Option<RecordRead>, LogError> {
        let _scope = self.begin_read()?;
        let data_end = self.physical_data_size();

        let physical = if self.header.is_scavenged {
            let map = self.pos_map.read().clone();
            match map.binary_search_by_key(&log_position, |e| e.log_position) {
                Ok(idx) => map[idx].physical_position as u64,
                Err(_) => return Ok(None),
            }
        } else {
            if log_position >= data_end {
                return Ok(None);
            }
            log_position
        };

        let (record, framed) = self.read_frame_at(physical, data_end, log_position)?;
        Ok(Some(RecordRead {
            record,
            log_position,
            next_position: log_position + framed as u64,
        }))
    }

    /// Reads the first record at or after a local logical position.
    ///
    /// For unscavenged chunks the position must be a frame boundary.
    pub fn try_read_closest_forward(
        &self,
        log_position: u64,
    ) -> Result<Option<RecordRead>, LogError> {
        let _scope = self.begin_read()?;
        let data_end = self.physical_data_size();

        let (physical, logical) = if self.header.is_scavenged {
            let map = self.pos_map.read().clone();
            let idx = map.partition_point(|e| e.log_position < log_position);
            match map.get(idx) {
                Some(entry) => (entry.physical_position as u64, entry.log_position),
                None => return Ok(None),
            }
        } else {
            if log_position >= data_end {
                return Ok(None);
            }
            (log_position, log_position)
        };

        let (record, framed) = self.read_frame_at(physical, data_end, logical)?;
        Ok(Some(RecordRead {
            record,
            log_position: logical,
            next_position: logical + framed as u64,
        }))
    }

    /// Reads the last record ending at or before a local logical position.
    ///
    /// For unscavenged chunks the position must be a frame boundary;
    /// positions past the data end are clamped to it.
    pub fn try_read_closest_backward(
        &self,
        log_position: u64,
    ) -> Result<Option<RecordRead>, LogError> {
        let _scope = self.begin_read()?;
        let data_end = self.physical_data_size();

        if self.header.is_scavenged {
            let map = self.pos_map.read().clone();
            let mut idx = map.partition_point(|e| e.log_position < log_position);
            while idx > 0 {
                let entry = map[idx - 1];
                let (record, framed) = self.read_frame_at(
                    entry.physical_position as u64,
                    data_end,
                    entry.log_position,
                )?;
                if entry.log_position + framed as u64 <= log_position {
                    return Ok(Some(RecordRead {
                        record,
                        log_position: entry.log_position,
                        next_position: entry.log_position,
                    }));
                }
                idx -= 1;
            }
            return Ok(None);
        }

        let end = log_position.min(data_end);
        if end == 0 {
            return Ok(None);
        }
        let (record, framed) = self.read_frame_ending_at(end, end)?;
        let start = end - framed as u64;
        Ok(Some(RecordRead {
            record,
            log_position: start,
            next_position: start,
        }))
    }

    /// Reads the first record of the chunk.
    pub fn try_read_first(&self) -> Result<Option<RecordRead>, LogError> {
        self.try_read_closest_forward(0)
    }

    /// Reads the last record of the chunk.
    pub fn try_read_last(&self) -> Result<Option<RecordRead>, LogError> {
        self.try_read_closest_backward(self.logical_data_size())
    }

    // ------------------------------------------------------------------
    // Caching
    // ------------------------------------------------------------------

    /// Loads the whole data region into memory; subsequent reads are
    /// served from the copy.
    pub fn cache_in_memory(&self) -> Result<(), LogError> {
        if !self.is_completed() {
            return Err(LogError::InvalidOperation(format!(
                "cannot cache active chunk {}",
                self.file_name()
            )));
        }
        let _scope = self.begin_read()?;
        if self.cache.read().is_some() {
            return Ok(());
        }

        let len = self.physical_data_size() as usize;
        let mut buf = vec![0u8; len];
        read_at(&self.file, &mut buf, CHUNK_HEADER_SIZE)?;
        *self.cache.write() = Some(Bytes::from(buf));
        tracing::debug!("cached chunk {} in memory ({} bytes)", self.file_name(), len);
        Ok(())
    }

    /// Drops the in-memory copy. In-flight reads holding slices of it
    /// finish against the old bytes.
    pub fn uncache_from_memory(&self) {
        if self.cache.write().take().is_some() {
            tracing::debug!("uncached chunk {}", self.file_name());
        }
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Acquires a reader reference for external callers; fails once the
    /// chunk is marked for deletion.
    pub fn acquire_reader(self: &Arc<Self>) -> Result<ReaderGuard, LogError> {
        let mut state = self.destroy.lock();
        if state.marked {
            return Err(LogError::ChunkMarkedForDeletion(self.file_name()));
        }
        state.readers += 1;
        Ok(ReaderGuard {
            chunk: Arc::clone(self),
        })
    }

    /// Marks the chunk for deletion. The backing file is unlinked once the
    /// last outstanding reader releases; with no readers it is unlinked
    /// immediately. Idempotent.
    pub fn mark_for_deletion(&self) {
        let mut state = self.destroy.lock();
        if state.marked {
            return;
        }
        state.marked = true;
        if state.readers == 0 {
            self.unlink_locked(&mut state);
        }
    }

    fn unlink_locked(&self, state: &mut DestroyState) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("deleted chunk file {}", self.file_name()),
            Err(e) => tracing::warn!("failed to delete chunk file {}: {}", self.file_name(), e),
        }
        self.cache.write().take();
        state.destroyed = true;
        self.destroy_cv.notify_all();
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.destroy.lock().marked
    }

    pub fn reader_count(&self) -> u32 {
        self.destroy.lock().readers
    }

    /// Blocks until the chunk's file has been deleted or the timeout
    /// elapses.
    pub fn wait_for_destroy(&self, timeout: Duration) -> Result<(), LogError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.destroy.lock();
        while !state.destroyed {
            if self
                .destroy_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(LogError::DestroyTimeout(self.file_name()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CommitRecord, PrepareRecord, EXPECTED_VERSION_ANY};
    use tempfile::TempDir;

    fn small_header(number: u32) -> ChunkHeader {
        ChunkHeader::new(number, 4096)
    }

    fn sample_record(n: u64) -> LogRecord {
        LogRecord::Prepare(
            PrepareRecord::single_write(
                n,
                "orders-1",
                EXPECTED_VERSION_ANY,
                "OrderPlaced",
                Bytes::from(format!(r#"{{"n":{}}}"#, n)),
                Bytes::new(),
            )
            .unwrap(),
        )
    }

    fn create_chunk(dir: &TempDir, number: u32) -> Chunk {
        let path = dir.path().join(format!("chunk-{:06}.000000", number));
        Chunk::create(&path, small_header(number)).unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ChunkHeader::new_scavenged(2, 4, 1 << 20);
        let encoded = header.encode();
        assert_eq!(encoded.len(), CHUNK_HEADER_SIZE as usize);
        let decoded = ChunkHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_crc_detects_corruption() {
        let mut encoded = ChunkHeader::new(1, 4096).encode();
        encoded[9] ^= 0xFF;
        assert!(matches!(
            ChunkHeader::decode(&encoded),
            Err(LogError::CorruptChunk { .. })
        ));
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = ChunkFooter {
            is_completed: true,
            physical_data_size: 123,
            logical_data_size: 456,
            map_size: 24,
            content_digest: 0xDEADBEEF,
        };
        let decoded = ChunkFooter::decode(&footer.encode()).unwrap();
        assert_eq!(decoded, footer);
        assert_eq!(decoded.map_entry_count(), 2);
    }

    #[test]
    fn test_append_and_read_at() {
        let dir = TempDir::new().unwrap();
        let chunk = create_chunk(&dir, 0);
        let record = sample_record(0);

        let result = chunk.try_append(&record).unwrap();
        let AppendResult::Written {
            old_position,
            new_position,
        } = result
        else {
            panic!("expected written, got {:?}", result);
        };
        assert_eq!(old_position, 0);
        assert_eq!(new_position, record.framed_size() as u64);
        chunk.flush().unwrap();

        let read = chunk.try_read_at(0).unwrap().unwrap();
        assert_eq!(read.record, record);
        assert_eq!(read.next_position, new_position);

        assert!(chunk.try_read_at(new_position).unwrap().is_none());
    }

    #[test]
    fn test_single_record_first_and_last() {
        let dir = TempDir::new().unwrap();
        let chunk = create_chunk(&dir, 0);
        let record = sample_record(0);
        chunk.try_append(&record).unwrap();
        chunk.flush().unwrap();

        let first = chunk.try_read_first().unwrap().unwrap();
        assert_eq!(first.record, record);
        assert_eq!(first.log_position, 0);

        let last = chunk.try_read_last().unwrap().unwrap();
        assert_eq!(last.record, record);
        assert_eq!(last.next_position, 0);
    }

    #[test]
    fn test_forward_backward_symmetry() {
        let dir = TempDir::new().unwrap();
        let chunk = create_chunk(&dir, 0);
        for n in 0..5 {
            chunk.try_append(&sample_record(n)).unwrap();
        }
        chunk.flush().unwrap();

        let mut position = 0;
        loop {
            let Some(forward) = chunk.try_read_closest_forward(position).unwrap() else {
                break;
            };
            let backward = chunk
                .try_read_closest_backward(forward.next_position)
                .unwrap()
                .unwrap();
            assert_eq!(backward.record, forward.record);
            assert_eq!(backward.next_position, forward.log_position);
            position = forward.next_position;
        }
        assert_eq!(position, chunk.physical_data_size());
    }

    #[test]
    fn test_append_returns_full_when_over_capacity() {
        let dir = TempDir::new().unwrap();
        let chunk = create_chunk(&dir, 0);
        let record = sample_record(0);

        let mut appended = 0u64;
        loop {
            match chunk.try_append(&record).unwrap() {
                AppendResult::Written { new_position, .. } => appended = new_position,
                AppendResult::Full => break,
            }
        }
        assert!(appended > 0);
        assert!(appended <= 4096);
        // Still readable after a failed append.
        assert!(chunk.try_read_first().unwrap().is_some());
    }

    #[test]
    fn test_append_to_completed_chunk_is_invalid() {
        let dir = TempDir::new().unwrap();
        let chunk = create_chunk(&dir, 0);
        chunk.try_append(&sample_record(0)).unwrap();
        chunk.complete().unwrap();

        let result = chunk.try_append(&sample_record(1));
        assert!(matches!(result, Err(LogError::InvalidOperation(_))));
        // Flush is a harmless no-op on a completed chunk.
        chunk.flush().unwrap();
    }

    #[test]
    fn test_completed_file_is_aligned_and_reopenable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let record = sample_record(0);
        let data_size;
        {
            let chunk = Chunk::create(&path, small_header(0)).unwrap();
            chunk.try_append(&record).unwrap();
            for n in 1..3 {
                chunk.try_append(&sample_record(n)).unwrap();
            }
            chunk.complete().unwrap();
            data_size = chunk.physical_data_size();
            assert_eq!(chunk.file_size().unwrap() % CHUNK_FILE_ALIGNMENT, 0);
        }

        let chunk = Chunk::open_completed(&path, true).unwrap();
        assert!(chunk.is_completed());
        assert_eq!(chunk.physical_data_size(), data_size);
        assert_eq!(chunk.logical_data_size(), data_size);
        let first = chunk.try_read_first().unwrap().unwrap();
        assert_eq!(first.record, record);
    }

    #[test]
    fn test_digest_verification_detects_flipped_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        {
            let chunk = Chunk::create(&path, small_header(0)).unwrap();
            chunk.try_append(&sample_record(0)).unwrap();
            chunk.complete().unwrap();
        }

        // Flip one payload byte inside the data region.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE + 20)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        assert!(Chunk::open_completed(&path, false).is_ok());
        assert!(matches!(
            Chunk::open_completed(&path, true),
            Err(LogError::CorruptChunk { .. })
        ));
    }

    #[test]
    fn test_cache_transparency() {
        let dir = TempDir::new().unwrap();
        let chunk = create_chunk(&dir, 0);
        let records: Vec<LogRecord> = (0..4).map(sample_record).collect();
        let mut positions = Vec::new();
        for record in &records {
            let AppendResult::Written { old_position, .. } = chunk.try_append(record).unwrap()
            else {
                panic!("chunk full");
            };
            positions.push(old_position);
        }
        chunk.complete().unwrap();

        let uncached: Vec<LogRecord> = positions
            .iter()
            .map(|&p| chunk.try_read_at(p).unwrap().unwrap().record)
            .collect();

        chunk.cache_in_memory().unwrap();
        assert!(chunk.is_cached());
        let cached: Vec<LogRecord> = positions
            .iter()
            .map(|&p| chunk.try_read_at(p).unwrap().unwrap().record)
            .collect();
        assert_eq!(uncached, cached);

        chunk.uncache_from_memory();
        assert!(!chunk.is_cached());
        let after: Vec<LogRecord> = positions
            .iter()
            .map(|&p| chunk.try_read_at(p).unwrap().unwrap().record)
            .collect();
        assert_eq!(uncached, after);
    }

    #[test]
    fn test_cache_requires_completed_chunk() {
        let dir = TempDir::new().unwrap();
        let chunk = create_chunk(&dir, 0);
        assert!(matches!(
            chunk.cache_in_memory(),
            Err(LogError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_deletion_waits_for_readers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let chunk = {
            let chunk = Chunk::create(&path, small_header(0)).unwrap();
            chunk.try_append(&sample_record(0)).unwrap();
            chunk.complete().unwrap();
            Arc::new(chunk)
        };

        let guard = chunk.acquire_reader().unwrap();
        chunk.mark_for_deletion();
        chunk.mark_for_deletion(); // idempotent
        assert!(path.exists(), "file deleted while a reader was active");
        assert!(matches!(
            chunk.wait_for_destroy(Duration::from_millis(20)),
            Err(LogError::DestroyTimeout(_))
        ));

        // New readers are refused once the chunk is marked.
        assert!(matches!(
            chunk.acquire_reader(),
            Err(LogError::ChunkMarkedForDeletion(_))
        ));

        drop(guard);
        chunk.wait_for_destroy(Duration::from_secs(5)).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_deletion_with_no_readers_is_immediate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let chunk = Chunk::create(&path, small_header(0)).unwrap();
        chunk.complete().unwrap();

        chunk.mark_for_deletion();
        chunk.wait_for_destroy(Duration::from_secs(1)).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_open_active_resumes_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let first = sample_record(0);
        let resume_at;
        {
            let chunk = Chunk::create(&path, small_header(0)).unwrap();
            chunk.try_append(&first).unwrap();
            chunk.flush().unwrap();
            resume_at = chunk.physical_data_size();
        }

        let chunk = Chunk::open_active(&path, 0, 4096, resume_at).unwrap();
        assert_eq!(chunk.physical_data_size(), resume_at);
        chunk.try_append(&sample_record(1)).unwrap();
        chunk.complete().unwrap();

        // Digest over both the pre-restart and post-restart data must hold.
        drop(chunk);
        let chunk = Chunk::open_completed(&path, true).unwrap();
        assert_eq!(chunk.try_read_first().unwrap().unwrap().record, first);
    }

    #[test]
    fn test_scavenged_chunk_reads_through_pos_map() {
        let dir = TempDir::new().unwrap();
        // Build a scavenged chunk holding records at sparse logical positions.
        let path = dir.path().join("chunk-000000.000001");
        let header = ChunkHeader::new_scavenged(0, 0, 4096);
        let chunk = Chunk::create(&path, header).unwrap();

        let kept_a = sample_record(0);
        let kept_b = LogRecord::Commit(CommitRecord::new(Uuid::new_v4(), 0, 0).unwrap());
        let a_len = kept_a.framed_size() as u64;
        let b_len = kept_b.framed_size() as u64;

        // Logical layout was [a][dropped][b]; physically they are adjacent.
        let dropped_len = 100u64;
        let mut map = Vec::new();
        let AppendResult::Written { old_position, .. } = chunk.try_append(&kept_a).unwrap()
        else {
            panic!("chunk full");
        };
        map.push(PosMapEntry {
            log_position: 0,
            physical_position: old_position as u32,
        });
        let AppendResult::Written { old_position, .. } = chunk.try_append(&kept_b).unwrap()
        else {
            panic!("chunk full");
        };
        map.push(PosMapEntry {
            log_position: a_len + dropped_len,
            physical_position: old_position as u32,
        });
        let logical_size = a_len + dropped_len + b_len;
        chunk.complete_scavenged(&map, logical_size).unwrap();

        // Exact reads hit only surviving positions.
        assert_eq!(chunk.try_read_at(0).unwrap().unwrap().record, kept_a);
        assert!(chunk.try_read_at(a_len).unwrap().is_none());
        let b = chunk.try_read_at(a_len + dropped_len).unwrap().unwrap();
        assert_eq!(b.record, kept_b);
        assert_eq!(b.next_position, logical_size);

        // Closest forward skips the scavenged hole.
        let closest = chunk.try_read_closest_forward(a_len).unwrap().unwrap();
        assert_eq!(closest.record, kept_b);
        assert_eq!(closest.log_position, a_len + dropped_len);

        // Closest backward from inside the hole returns the survivor before it.
        let back = chunk
            .try_read_closest_backward(a_len + dropped_len)
            .unwrap()
            .unwrap();
        assert_eq!(back.record, kept_a);
        assert_eq!(back.next_position, 0);

        let last = chunk.try_read_last().unwrap().unwrap();
        assert_eq!(last.record, kept_b);
        assert_eq!(last.next_position, a_len + dropped_len);
    }

    #[test]
    fn test_empty_scavenged_chunk_is_structurally_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000001");
        let header = ChunkHeader::new_scavenged(0, 0, 4096);
        let logical_size;
        {
            let chunk = Chunk::create(&path, header).unwrap();
            logical_size = 300u64;
            chunk.complete_scavenged(&[], logical_size).unwrap();
            assert_eq!(
                chunk.file_size().unwrap(),
                CHUNK_FILE_ALIGNMENT,
                "empty chunk should shrink to one aligned block"
            );
        }

        let chunk = Chunk::open_completed(&path, true).unwrap();
        assert_eq!(chunk.physical_data_size(), 0);
        assert_eq!(chunk.logical_data_size(), logical_size);
        assert!(chunk.try_read_first().unwrap().is_none());
        assert!(chunk.try_read_last().unwrap().is_none());
        assert!(chunk.try_read_closest_forward(0).unwrap().is_none());
    }

    #[test]
    fn test_truncated_completed_chunk_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        {
            let chunk = Chunk::create(&path, small_header(0)).unwrap();
            chunk.try_append(&sample_record(0)).unwrap();
            chunk.complete().unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - CHUNK_FILE_ALIGNMENT).unwrap();
        drop(file);

        assert!(matches!(
            Chunk::open_completed(&path, false),
            Err(LogError::CorruptChunk { .. })
        ));
    }
}
