//! Log record types and framing.
//!
//! Every record is framed so the log can be scanned in both directions:
//!
//! ```text
//! +-------------+----------+------------------+-------------+
//! | length      | type     | payload          | length      |
//! | 4 bytes LE  | 1 byte   | length - 1 bytes | 4 bytes LE  |
//! +-------------+----------+------------------+-------------+
//! ```
//!
//! Both length fields cover `type + payload`. A forward scan reads the
//! prefix; a backward scan reads the suffix sitting just before the frame
//! end and jumps to the frame start. A prefix/suffix mismatch means the
//! frame is corrupt.

use crate::error::LogError;
use crate::FRAME_OVERHEAD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Logical byte offset into the infinite log.
pub type LogPosition = u64;

/// Maximum framed record size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Expected version accepting any stream state.
pub const EXPECTED_VERSION_ANY: i64 = -2;

/// Expected version asserting the stream does not exist yet.
pub const EXPECTED_VERSION_NO_STREAM: i64 = -1;

/// Last event number reported for a stream that does not exist.
pub const NO_STREAM: i64 = -1;

/// Event number assigned to a stream tombstone.
pub const STREAM_DELETED: i64 = i64::MAX;

/// Type of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Event data staged inside a transaction.
    Prepare = 0,
    /// Transaction commit assigning event numbers.
    Commit = 1,
    /// Internal marker record (epochs, chunk completion notes).
    System = 2,
}

impl TryFrom<u8> for LogRecordType {
    type Error = LogError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LogRecordType::Prepare),
            1 => Ok(LogRecordType::Commit),
            2 => Ok(LogRecordType::System),
            _ => Err(LogError::CorruptRecord {
                position: 0,
                reason: format!("unknown record type: {}", value),
            }),
        }
    }
}

/// Bit flags describing the role of a prepare within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareFlags(pub u16);

impl PrepareFlags {
    pub const NONE: PrepareFlags = PrepareFlags(0);
    /// The prepare carries event data.
    pub const DATA: PrepareFlags = PrepareFlags(0x01);
    /// First prepare of its transaction.
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(0x02);
    /// Last prepare of its transaction.
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(0x04);
    /// The prepare tombstones its stream.
    pub const STREAM_DELETE: PrepareFlags = PrepareFlags(0x08);
    /// Event data is JSON.
    pub const IS_JSON: PrepareFlags = PrepareFlags(0x10);
    /// A whole single-event transaction in one prepare.
    pub const SINGLE_WRITE: PrepareFlags =
        PrepareFlags(Self::DATA.0 | Self::TRANSACTION_BEGIN.0 | Self::TRANSACTION_END.0);

    /// Returns whether all bits of `other` are set.
    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw bit representation.
    pub fn bits(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: PrepareFlags) -> PrepareFlags {
        PrepareFlags(self.0 | rhs.0)
    }
}

/// Event data staged inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareRecord {
    pub correlation_id: Uuid,
    pub event_id: Uuid,
    /// Position of the first prepare of this transaction.
    pub transaction_position: LogPosition,
    /// Index of this prepare within its transaction.
    pub transaction_offset: u32,
    pub stream_id: String,
    pub expected_version: i64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub flags: PrepareFlags,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl PrepareRecord {
    /// Creates a prepare, validating its arguments.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: Uuid,
        event_id: Uuid,
        transaction_position: LogPosition,
        transaction_offset: u32,
        stream_id: impl Into<String>,
        expected_version: i64,
        flags: PrepareFlags,
        event_type: impl Into<String>,
        data: Bytes,
        metadata: Bytes,
    ) -> Result<Self, LogError> {
        let stream_id = stream_id.into();
        if correlation_id.is_nil() {
            return Err(LogError::InvalidArgument(
                "correlation_id must not be nil".into(),
            ));
        }
        if event_id.is_nil() {
            return Err(LogError::InvalidArgument("event_id must not be nil".into()));
        }
        if stream_id.is_empty() {
            return Err(LogError::InvalidArgument(
                "stream_id must not be empty".into(),
            ));
        }
        if expected_version < EXPECTED_VERSION_ANY {
            return Err(LogError::InvalidArgument(format!(
                "expected_version {} is out of range",
                expected_version
            )));
        }
        Ok(Self {
            correlation_id,
            event_id,
            transaction_position,
            transaction_offset,
            stream_id,
            expected_version,
            timestamp: chrono::Utc::now().timestamp_millis(),
            flags,
            event_type: event_type.into(),
            data,
            metadata,
        })
    }

    /// Builds a whole single-event transaction in one prepare.
    pub fn single_write(
        transaction_position: LogPosition,
        stream_id: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: Bytes,
        metadata: Bytes,
    ) -> Result<Self, LogError> {
        Self::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            transaction_position,
            0,
            stream_id,
            expected_version,
            PrepareFlags::SINGLE_WRITE,
            event_type,
            data,
            metadata,
        )
    }

    /// Builds a stream tombstone.
    pub fn delete_stream(
        transaction_position: LogPosition,
        stream_id: impl Into<String>,
        expected_version: i64,
    ) -> Result<Self, LogError> {
        Self::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            transaction_position,
            0,
            stream_id,
            expected_version,
            PrepareFlags::STREAM_DELETE
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
            "$streamDeleted",
            Bytes::new(),
            Bytes::new(),
        )
    }
}

/// Transaction commit assigning event numbers to its prepares.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    pub correlation_id: Uuid,
    /// Position of the first prepare of the committed transaction.
    pub transaction_position: LogPosition,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Event number assigned to the prepare at transaction offset 0.
    pub first_event_number: i64,
}

impl CommitRecord {
    /// Creates a commit, validating its arguments.
    pub fn new(
        correlation_id: Uuid,
        transaction_position: LogPosition,
        first_event_number: i64,
    ) -> Result<Self, LogError> {
        if correlation_id.is_nil() {
            return Err(LogError::InvalidArgument(
                "correlation_id must not be nil".into(),
            ));
        }
        if first_event_number < 0 {
            return Err(LogError::InvalidArgument(format!(
                "first_event_number {} is out of range",
                first_event_number
            )));
        }
        Ok(Self {
            correlation_id,
            transaction_position,
            timestamp: chrono::Utc::now().timestamp_millis(),
            first_event_number,
        })
    }
}

/// Internal marker record, opaque to the storage machinery.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemRecord {
    pub kind: u8,
    pub data: Bytes,
}

impl SystemRecord {
    pub fn new(kind: u8, data: Bytes) -> Self {
        Self { kind, data }
    }
}

/// A record in the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
    System(SystemRecord),
}

impl LogRecord {
    /// Returns the type tag for this record.
    pub fn record_type(&self) -> LogRecordType {
        match self {
            LogRecord::Prepare(_) => LogRecordType::Prepare,
            LogRecord::Commit(_) => LogRecordType::Commit,
            LogRecord::System(_) => LogRecordType::System,
        }
    }

    /// Returns the prepare if this record is one.
    pub fn as_prepare(&self) -> Option<&PrepareRecord> {
        match self {
            LogRecord::Prepare(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the commit if this record is one.
    pub fn as_commit(&self) -> Option<&CommitRecord> {
        match self {
            LogRecord::Commit(c) => Some(c),
            _ => None,
        }
    }

    /// Returns the stream id if this record targets a stream.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            LogRecord::Prepare(p) => Some(&p.stream_id),
            _ => None,
        }
    }

    fn body_size(&self) -> usize {
        1 + match self {
            LogRecord::Prepare(p) => {
                16 + 16
                    + 8
                    + 4
                    + 8
                    + 8
                    + 2
                    + 2
                    + p.stream_id.len()
                    + 2
                    + p.event_type.len()
                    + 4
                    + p.data.len()
                    + 4
                    + p.metadata.len()
            }
            LogRecord::Commit(_) => 16 + 8 + 8 + 8,
            LogRecord::System(s) => 1 + s.data.len(),
        }
    }

    /// Total on-disk size of the frame, including both length fields.
    pub fn framed_size(&self) -> usize {
        self.body_size() + FRAME_OVERHEAD
    }

    /// Encodes the record into a complete frame.
    pub fn encode(&self) -> Result<BytesMut, LogError> {
        let body_len = self.body_size();
        if body_len + FRAME_OVERHEAD > MAX_RECORD_SIZE {
            return Err(LogError::RecordTooLarge {
                size: body_len + FRAME_OVERHEAD,
                max: MAX_RECORD_SIZE,
            });
        }
        if let LogRecord::Prepare(p) = self {
            if p.stream_id.len() > u16::MAX as usize {
                return Err(LogError::RecordTooLarge {
                    size: p.stream_id.len(),
                    max: u16::MAX as usize,
                });
            }
            if p.event_type.len() > u16::MAX as usize {
                return Err(LogError::RecordTooLarge {
                    size: p.event_type.len(),
                    max: u16::MAX as usize,
                });
            }
        }

        let mut buf = BytesMut::with_capacity(body_len + FRAME_OVERHEAD);
        buf.put_u32_le(body_len as u32);
        buf.put_u8(self.record_type() as u8);

        match self {
            LogRecord::Prepare(p) => {
                buf.put_slice(p.correlation_id.as_bytes());
                buf.put_slice(p.event_id.as_bytes());
                buf.put_u64_le(p.transaction_position);
                buf.put_u32_le(p.transaction_offset);
                buf.put_i64_le(p.expected_version);
                buf.put_i64_le(p.timestamp);
                buf.put_u16_le(p.flags.bits());
                buf.put_u16_le(p.stream_id.len() as u16);
                buf.put_slice(p.stream_id.as_bytes());
                buf.put_u16_le(p.event_type.len() as u16);
                buf.put_slice(p.event_type.as_bytes());
                buf.put_u32_le(p.data.len() as u32);
                buf.put_slice(&p.data);
                buf.put_u32_le(p.metadata.len() as u32);
                buf.put_slice(&p.metadata);
            }
            LogRecord::Commit(c) => {
                buf.put_slice(c.correlation_id.as_bytes());
                buf.put_u64_le(c.transaction_position);
                buf.put_i64_le(c.timestamp);
                buf.put_i64_le(c.first_event_number);
            }
            LogRecord::System(s) => {
                buf.put_u8(s.kind);
                buf.put_slice(&s.data);
            }
        }

        buf.put_u32_le(body_len as u32);
        Ok(buf)
    }

    /// Decodes one complete frame starting at the beginning of `buf`.
    ///
    /// Returns the record and its framed size. `position` is used for
    /// error reporting only.
    pub fn decode_frame(buf: &[u8], position: u64) -> Result<(LogRecord, usize), LogError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!("frame truncated: {} bytes", buf.len()),
            });
        }
        let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len == 0 {
            return Err(LogError::CorruptRecord {
                position,
                reason: "zero-length frame".into(),
            });
        }
        if body_len + FRAME_OVERHEAD > MAX_RECORD_SIZE {
            return Err(LogError::RecordTooLarge {
                size: body_len + FRAME_OVERHEAD,
                max: MAX_RECORD_SIZE,
            });
        }
        let framed = body_len + FRAME_OVERHEAD;
        if buf.len() < framed {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!("frame truncated: {} of {} bytes", buf.len(), framed),
            });
        }
        let suffix = u32::from_le_bytes([
            buf[framed - 4],
            buf[framed - 3],
            buf[framed - 2],
            buf[framed - 1],
        ]) as usize;
        if suffix != body_len {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!(
                    "length prefix {} does not match suffix {}",
                    body_len, suffix
                ),
            });
        }
        let mut body = Bytes::copy_from_slice(&buf[4..4 + body_len]);
        let record = Self::decode_body(&mut body, position)?;
        Ok((record, framed))
    }

    /// Decodes the record whose frame ends exactly at the end of `buf`.
    ///
    /// Returns the record and its framed size, so the caller can jump to
    /// the frame start. `end_position` is used for error reporting only.
    pub fn decode_backward(buf: &[u8], end_position: u64) -> Result<(LogRecord, usize), LogError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(LogError::CorruptRecord {
                position: end_position,
                reason: format!("frame truncated: {} bytes before end", buf.len()),
            });
        }
        let suffix = u32::from_le_bytes([
            buf[buf.len() - 4],
            buf[buf.len() - 3],
            buf[buf.len() - 2],
            buf[buf.len() - 1],
        ]) as usize;
        if suffix == 0 || suffix + FRAME_OVERHEAD > MAX_RECORD_SIZE {
            return Err(LogError::CorruptRecord {
                position: end_position,
                reason: format!("implausible length suffix {}", suffix),
            });
        }
        let framed = suffix + FRAME_OVERHEAD;
        if buf.len() < framed {
            return Err(LogError::CorruptRecord {
                position: end_position,
                reason: "frame extends before start of data".into(),
            });
        }
        let start = buf.len() - framed;
        let (record, size) =
            Self::decode_frame(&buf[start..], end_position.saturating_sub(framed as u64))?;
        Ok((record, size))
    }

    fn decode_body(body: &mut Bytes, position: u64) -> Result<LogRecord, LogError> {
        let tag = body.get_u8();
        let record_type = LogRecordType::try_from(tag).map_err(|_| LogError::CorruptRecord {
            position,
            reason: format!("unknown record type: {}", tag),
        })?;
        match record_type {
            LogRecordType::Prepare => {
                Self::check_remaining(body, 16 + 16 + 8 + 4 + 8 + 8 + 2, position)?;
                let correlation_id = read_uuid(body);
                let event_id = read_uuid(body);
                let transaction_position = body.get_u64_le();
                let transaction_offset = body.get_u32_le();
                let expected_version = body.get_i64_le();
                let timestamp = body.get_i64_le();
                let flags = PrepareFlags(body.get_u16_le());
                let stream_id = read_string16(body, position, "stream_id")?;
                let event_type = read_string16(body, position, "event_type")?;
                let data = read_bytes32(body, position, "data")?;
                let metadata = read_bytes32(body, position, "metadata")?;
                Ok(LogRecord::Prepare(PrepareRecord {
                    correlation_id,
                    event_id,
                    transaction_position,
                    transaction_offset,
                    stream_id,
                    expected_version,
                    timestamp,
                    flags,
                    event_type,
                    data,
                    metadata,
                }))
            }
            LogRecordType::Commit => {
                Self::check_remaining(body, 16 + 8 + 8 + 8, position)?;
                let correlation_id = read_uuid(body);
                let transaction_position = body.get_u64_le();
                let timestamp = body.get_i64_le();
                let first_event_number = body.get_i64_le();
                Ok(LogRecord::Commit(CommitRecord {
                    correlation_id,
                    transaction_position,
                    timestamp,
                    first_event_number,
                }))
            }
            LogRecordType::System => {
                Self::check_remaining(body, 1, position)?;
                let kind = body.get_u8();
                let data = body.copy_to_bytes(body.remaining());
                Ok(LogRecord::System(SystemRecord { kind, data }))
            }
        }
    }

    fn check_remaining(body: &Bytes, needed: usize, position: u64) -> Result<(), LogError> {
        if body.remaining() < needed {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!(
                    "record body truncated: {} bytes remaining, {} needed",
                    body.remaining(),
                    needed
                ),
            });
        }
        Ok(())
    }
}

fn read_uuid(body: &mut Bytes) -> Uuid {
    let mut raw = [0u8; 16];
    body.copy_to_slice(&mut raw);
    Uuid::from_bytes(raw)
}

fn read_string16(body: &mut Bytes, position: u64, field: &str) -> Result<String, LogError> {
    if body.remaining() < 2 {
        return Err(LogError::CorruptRecord {
            position,
            reason: format!("record body truncated reading {} length", field),
        });
    }
    let len = body.get_u16_le() as usize;
    if body.remaining() < len {
        return Err(LogError::CorruptRecord {
            position,
            reason: format!("record body truncated reading {}", field),
        });
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| LogError::CorruptRecord {
        position,
        reason: format!("invalid utf-8 in {}", field),
    })
}

fn read_bytes32(body: &mut Bytes, position: u64, field: &str) -> Result<Bytes, LogError> {
    if body.remaining() < 4 {
        return Err(LogError::CorruptRecord {
            position,
            reason: format!("record body truncated reading {} length", field),
        });
    }
    let len = body.get_u32_le() as usize;
    if body.remaining() < len {
        return Err(LogError::CorruptRecord {
            position,
            reason: format!("record body truncated reading {}", field),
        });
    }
    Ok(body.split_to(len))
}
