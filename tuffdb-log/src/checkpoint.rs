//! Durable position checkpoints.
//!
//! A checkpoint stores a single position. `write` buffers the value in
//! memory; `flush` is the durability boundary. `read` returns the last
//! flushed value, so a crash can only lose positions that were never
//! flushed, never expose positions that might disappear.

use crate::error::LogError;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// A named, durable position marker.
pub trait Checkpoint: Send + Sync {
    /// Returns the checkpoint name.
    fn name(&self) -> &str;

    /// Buffers a new position in memory.
    fn write(&self, position: u64);

    /// Makes the last written position durable.
    fn flush(&self) -> Result<(), LogError>;

    /// Returns the last flushed position.
    fn read(&self) -> u64;

    /// Returns the last written position, flushed or not.
    fn read_non_flushed(&self) -> u64;

    /// Flushes and releases the checkpoint.
    fn close(&self) -> Result<(), LogError>;
}

/// Checkpoint with no backing storage. `read` and `read_non_flushed`
/// both return the last written value.
pub struct InMemoryCheckpoint {
    name: String,
    value: AtomicU64,
}

impl InMemoryCheckpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AtomicU64::new(0),
        }
    }

    pub fn with_value(name: impl Into<String>, position: u64) -> Self {
        Self {
            name: name.into(),
            value: AtomicU64::new(position),
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, position: u64) {
        self.value.store(position, Ordering::SeqCst);
    }

    fn flush(&self) -> Result<(), LogError> {
        Ok(())
    }

    fn read(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    fn read_non_flushed(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), LogError> {
        Ok(())
    }
}

/// Checkpoint persisted as 8 little-endian bytes at the start of a file.
pub struct FileCheckpoint {
    name: String,
    file: Mutex<std::fs::File>,
    non_flushed: AtomicU64,
    flushed: AtomicU64,
}

impl FileCheckpoint {
    /// Opens or creates a checkpoint file, reading any existing value.
    pub fn open(path: &Path, name: impl Into<String>) -> Result<Self, LogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let initial = if len >= 8 {
            let mut raw = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut raw)?;
            u64::from_le_bytes(raw)
        } else {
            file.set_len(8)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&0u64.to_le_bytes())?;
            file.sync_data()?;
            0
        };

        Ok(Self {
            name: name.into(),
            file: Mutex::new(file),
            non_flushed: AtomicU64::new(initial),
            flushed: AtomicU64::new(initial),
        })
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, position: u64) {
        self.non_flushed.store(position, Ordering::SeqCst);
    }

    fn flush(&self) -> Result<(), LogError> {
        let value = self.non_flushed.load(Ordering::SeqCst);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&value.to_le_bytes())?;
        file.sync_data()?;
        self.flushed.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self) -> u64 {
        self.flushed.load(Ordering::SeqCst)
    }

    fn read_non_flushed(&self) -> u64 {
        self.non_flushed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), LogError> {
        self.flush()
    }
}

/// Checkpoint persisted as 8 little-endian bytes through a write-through
/// file handle (`O_DSYNC` on unix, `FILE_FLAG_WRITE_THROUGH` on windows).
/// `flush` is a positioned write; the handle itself makes it durable.
pub struct WriteThroughCheckpoint {
    name: String,
    file: Mutex<std::fs::File>,
    non_flushed: AtomicU64,
    flushed: AtomicU64,
}

impl WriteThroughCheckpoint {
    /// Opens or creates a checkpoint file, reading any existing value.
    pub fn open(path: &Path, name: impl Into<String>) -> Result<Self, LogError> {
        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DSYNC);
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            const FILE_FLAG_WRITE_THROUGH: u32 = 0x8000_0000;
            options.custom_flags(FILE_FLAG_WRITE_THROUGH);
        }
        let mut file = options.open(path)?;

        let len = file.metadata()?.len();
        let initial = if len >= 8 {
            let mut raw = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut raw)?;
            u64::from_le_bytes(raw)
        } else {
            file.set_len(8)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&0u64.to_le_bytes())?;
            0
        };

        Ok(Self {
            name: name.into(),
            file: Mutex::new(file),
            non_flushed: AtomicU64::new(initial),
            flushed: AtomicU64::new(initial),
        })
    }
}

impl Checkpoint for WriteThroughCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, position: u64) {
        self.non_flushed.store(position, Ordering::SeqCst);
    }

    fn flush(&self) -> Result<(), LogError> {
        let value = self.non_flushed.load(Ordering::SeqCst);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&value.to_le_bytes())?;
        // Targets without a write-through open flag need the explicit sync.
        #[cfg(not(any(unix, windows)))]
        file.sync_data()?;
        self.flushed.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self) -> u64 {
        self.flushed.load(Ordering::SeqCst)
    }

    fn read_non_flushed(&self) -> u64 {
        self.non_flushed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), LogError> {
        self.flush()
    }
}

/// Checkpoint persisted through a memory-mapped 8-byte file.
pub struct MemMappedCheckpoint {
    name: String,
    map: Mutex<MmapMut>,
    non_flushed: AtomicU64,
    flushed: AtomicU64,
}

impl MemMappedCheckpoint {
    /// Opens or creates a checkpoint file, reading any existing value.
    pub fn open(path: &Path, name: impl Into<String>) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if file.metadata()?.len() < 8 {
            file.set_len(8)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&map[0..8]);
        let initial = u64::from_le_bytes(raw);

        Ok(Self {
            name: name.into(),
            map: Mutex::new(map),
            non_flushed: AtomicU64::new(initial),
            flushed: AtomicU64::new(initial),
        })
    }
}

impl Checkpoint for MemMappedCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, position: u64) {
        self.non_flushed.store(position, Ordering::SeqCst);
    }

    fn flush(&self) -> Result<(), LogError> {
        let value = self.non_flushed.load(Ordering::SeqCst);
        let mut map = self.map.lock();
        map[0..8].copy_from_slice(&value.to_le_bytes());
        map.flush()?;
        self.flushed.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self) -> u64 {
        self.flushed.load(Ordering::SeqCst)
    }

    fn read_non_flushed(&self) -> u64 {
        self.non_flushed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), LogError> {
        self.flush()
    }
}
