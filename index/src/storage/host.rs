//! Storage abstraction for the index engine.
//!
//! This module provides the traits the index uses to reach the record that
//! hosts it, allowing real files in production and in-memory buffers in tests.
//!
//! # Design
//!
//! The traits are a minimal abstraction over:
//! - Resident root read/write and free-space queries
//! - Opening and creating the allocation and bitmap streams
//! - Positional reads and writes on those streams

/// Errors that can occur in a hosting record or one of its streams.
#[derive(Debug)]
pub enum HostError {
    /// I/O error.
    Io(std::io::Error),
    /// Read past the end of a stream.
    OutOfBounds { pos: u64, len: u64 },
    /// The stream does not exist.
    MissingStream(StreamKind),
    /// The resident root no longer fits in the hosting record.
    RecordFull { needed: usize, available: usize },
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OutOfBounds { pos, len } => {
                write!(f, "read at {pos} past end of stream (length: {len})")
            }
            Self::MissingStream(kind) => write!(f, "missing {kind} stream"),
            Self::RecordFull { needed, available } => write!(
                f,
                "record full: root needs {needed} bytes, {available} available"
            ),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The non-resident streams that belong to an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// `$INDEX_ALLOCATION`: the index blocks.
    Allocation,
    /// `$BITMAP`: block slot occupancy.
    Bitmap,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allocation => write!(f, "index allocation"),
            Self::Bitmap => write!(f, "bitmap"),
        }
    }
}

/// A byte stream with positional access.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_at` returns the last bytes written at that range
/// - `read_at` fails with `OutOfBounds` rather than returning short data
/// - `write_at` past the end extends the stream, zero-filling any gap
pub trait AttributeStream {
    /// Current length in bytes.
    fn len(&self) -> Result<u64, HostError>;

    /// Whether the stream holds no bytes.
    fn is_empty(&self) -> Result<bool, HostError> {
        Ok(self.len()? == 0)
    }

    /// Fill `buf` from `pos`.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), HostError>;

    /// Write `data` at `pos`.
    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), HostError>;

    /// Truncate or zero-extend the stream.
    fn set_len(&mut self, len: u64) -> Result<(), HostError>;
}

/// The file record that hosts an index.
///
/// The root payload is stored resident in the record, so the space it may use
/// depends on everything else in the record. `free_space` is queried before
/// every mutation for that reason.
pub trait IndexHost {
    /// Stream handle type for the allocation and bitmap streams.
    type Stream: AttributeStream;

    /// Bytes still free in the hosting record.
    fn free_space(&self) -> usize;

    /// Read the whole resident root payload.
    fn read_root(&mut self) -> Result<Vec<u8>, HostError>;

    /// Replace the resident root payload.
    fn write_root(&mut self, payload: &[u8]) -> Result<(), HostError>;

    /// Open a stream if it exists.
    fn open_stream(&mut self, kind: StreamKind) -> Result<Option<Self::Stream>, HostError>;

    /// Create an empty stream and open it.
    fn create_stream(&mut self, kind: StreamKind) -> Result<Self::Stream, HostError>;
}
