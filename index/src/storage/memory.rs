//! In-memory hosting record.
//!
//! Used by tests and by callers that assemble an index image in memory before
//! handing it to a real record. Stream handles share their buffer, so the host
//! and the index observe the same bytes.

// Stream positions are u64 but buffers are indexed by usize.
#![allow(clippy::cast_possible_truncation)]

use std::cell::RefCell;
use std::rc::Rc;

use crate::storage::host::{AttributeStream, HostError, IndexHost, StreamKind};

/// A growable byte buffer with shared ownership.
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    data: Rc<RefCell<Vec<u8>>>,
}

impl MemoryStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream holding a copy of `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: Rc::new(RefCell::new(bytes.to_vec())),
        }
    }

    /// Copy out the current contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

impl AttributeStream for MemoryStream {
    fn len(&self) -> Result<u64, HostError> {
        Ok(self.data.borrow().len() as u64)
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), HostError> {
        let data = self.data.borrow();
        let len = data.len() as u64;
        let end = pos + buf.len() as u64;
        if end > len {
            return Err(HostError::OutOfBounds { pos, len });
        }

        buf.copy_from_slice(&data[pos as usize..end as usize]);
        Ok(())
    }

    fn write_at(&mut self, pos: u64, bytes: &[u8]) -> Result<(), HostError> {
        let mut data = self.data.borrow_mut();
        let end = pos as usize + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }

        data[pos as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<(), HostError> {
        self.data.borrow_mut().resize(len as usize, 0);
        Ok(())
    }
}

/// A hosting record kept entirely in memory.
///
/// The record has a fixed byte capacity; the resident root may use whatever
/// part of it is free. The capacity can be changed between operations to
/// model other attributes in the record growing or shrinking.
#[derive(Debug)]
pub struct MemoryHost {
    capacity: usize,
    root: Vec<u8>,
    allocation: Option<MemoryStream>,
    bitmap: Option<MemoryStream>,
}

impl MemoryHost {
    /// Create an empty record with room for `capacity` bytes of root payload.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            root: Vec::new(),
            allocation: None,
            bitmap: None,
        }
    }

    /// Change how many bytes the root may occupy.
    pub const fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// The current resident root payload.
    #[must_use]
    pub fn root_bytes(&self) -> &[u8] {
        &self.root
    }

    /// A handle to one of the streams, if it has been created.
    #[must_use]
    pub const fn stream(&self, kind: StreamKind) -> Option<&MemoryStream> {
        match kind {
            StreamKind::Allocation => self.allocation.as_ref(),
            StreamKind::Bitmap => self.bitmap.as_ref(),
        }
    }

    const fn slot(&mut self, kind: StreamKind) -> &mut Option<MemoryStream> {
        match kind {
            StreamKind::Allocation => &mut self.allocation,
            StreamKind::Bitmap => &mut self.bitmap,
        }
    }
}

impl IndexHost for MemoryHost {
    type Stream = MemoryStream;

    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.root.len())
    }

    fn read_root(&mut self) -> Result<Vec<u8>, HostError> {
        Ok(self.root.clone())
    }

    fn write_root(&mut self, payload: &[u8]) -> Result<(), HostError> {
        if payload.len() > self.capacity {
            return Err(HostError::RecordFull {
                needed: payload.len(),
                available: self.capacity,
            });
        }

        self.root.clear();
        self.root.extend_from_slice(payload);
        Ok(())
    }

    fn open_stream(&mut self, kind: StreamKind) -> Result<Option<MemoryStream>, HostError> {
        Ok(self.slot(kind).clone())
    }

    fn create_stream(&mut self, kind: StreamKind) -> Result<MemoryStream, HostError> {
        let stream = MemoryStream::new();
        *self.slot(kind) = Some(stream.clone());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_read_write() {
        let mut stream = MemoryStream::new();
        stream.write_at(4, b"abcd").expect("write");
        assert_eq!(stream.len().expect("len"), 8);

        let mut buf = [0u8; 4];
        stream.read_at(4, &mut buf).expect("read");
        assert_eq!(&buf, b"abcd");

        stream.read_at(0, &mut buf).expect("read gap");
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_stream_read_past_end() {
        let mut stream = MemoryStream::from_bytes(b"xyz");
        let mut buf = [0u8; 4];
        let err = stream.read_at(0, &mut buf).unwrap_err();
        assert!(matches!(err, HostError::OutOfBounds { pos: 0, len: 3 }));
    }

    #[test]
    fn test_stream_handles_share_buffer() {
        let stream = MemoryStream::new();
        let mut other = stream.clone();
        other.write_at(0, b"shared").expect("write");
        assert_eq!(stream.to_vec(), b"shared".to_vec());
    }

    #[test]
    fn test_host_free_space_tracks_root() {
        let mut host = MemoryHost::new(100);
        assert_eq!(host.free_space(), 100);

        host.write_root(&[0u8; 40]).expect("write root");
        assert_eq!(host.free_space(), 60);

        host.set_capacity(50);
        assert_eq!(host.free_space(), 10);

        let err = host.write_root(&[0u8; 60]).unwrap_err();
        assert!(matches!(err, HostError::RecordFull { needed: 60, .. }));
    }

    #[test]
    fn test_host_streams_created_lazily() {
        let mut host = MemoryHost::new(100);
        assert!(host.open_stream(StreamKind::Bitmap).expect("open").is_none());

        let mut created = host.create_stream(StreamKind::Bitmap).expect("create");
        created.write_at(0, &[1]).expect("write");

        let opened = host
            .open_stream(StreamKind::Bitmap)
            .expect("open")
            .expect("exists");
        assert_eq!(opened.to_vec(), vec![1]);
        assert!(host.stream(StreamKind::Allocation).is_none());
    }
}
