//! File-backed hosting record.
//!
//! Each part of the index lives in its own file inside a directory:
//! `root` holds the resident payload, `allocation` and `bitmap` hold the two
//! streams. The record capacity limits how large `root` may grow.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::host::{AttributeStream, HostError, IndexHost, StreamKind};

/// File name of the resident root payload.
const ROOT_FILE: &str = "root";

/// A stream stored in a plain file.
#[derive(Debug)]
pub struct FileStream {
    file: File,
}

impl FileStream {
    /// Open an existing stream file for reading and writing.
    pub fn open(path: &Path) -> Result<Self, HostError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Create (or truncate) a stream file.
    pub fn create(path: &Path) -> Result<Self, HostError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    fn current_len(&self) -> Result<u64, HostError> {
        Ok(self.file.metadata()?.len())
    }
}

impl AttributeStream for FileStream {
    fn len(&self) -> Result<u64, HostError> {
        self.current_len()
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), HostError> {
        let len = self.current_len()?;
        if pos + buf.len() as u64 > len {
            return Err(HostError::OutOfBounds { pos, len });
        }

        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), HostError> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<(), HostError> {
        self.file.set_len(len)?;
        Ok(())
    }
}

/// A hosting record stored as a directory of files.
#[derive(Debug)]
pub struct FileHost {
    dir: PathBuf,
    capacity: usize,
}

impl FileHost {
    /// Use `dir` as the record, allowing `capacity` bytes of root payload.
    ///
    /// The directory must exist. Existing files are reused, so reopening a
    /// directory reopens the index stored in it.
    #[must_use]
    pub fn new(dir: &Path, capacity: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            capacity,
        }
    }

    /// Directory holding the record's files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stream_path(&self, kind: StreamKind) -> PathBuf {
        match kind {
            StreamKind::Allocation => self.dir.join("allocation"),
            StreamKind::Bitmap => self.dir.join("bitmap"),
        }
    }

    /// Length of the root file; unreadable metadata counts as a full record.
    fn root_len(&self) -> usize {
        match std::fs::metadata(self.dir.join(ROOT_FILE)) {
            Ok(m) => usize::try_from(m.len()).unwrap_or(usize::MAX),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(_) => usize::MAX,
        }
    }
}

impl IndexHost for FileHost {
    type Stream = FileStream;

    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.root_len())
    }

    fn read_root(&mut self) -> Result<Vec<u8>, HostError> {
        Ok(std::fs::read(self.dir.join(ROOT_FILE))?)
    }

    fn write_root(&mut self, payload: &[u8]) -> Result<(), HostError> {
        if payload.len() > self.capacity {
            return Err(HostError::RecordFull {
                needed: payload.len(),
                available: self.capacity,
            });
        }

        let mut file = FileStream::create(&self.dir.join(ROOT_FILE))?;
        file.write_at(0, payload)?;
        file.file.sync_all()?;
        Ok(())
    }

    fn open_stream(&mut self, kind: StreamKind) -> Result<Option<FileStream>, HostError> {
        let path = self.stream_path(kind);
        if !path.exists() {
            return Ok(None);
        }
        FileStream::open(&path).map(Some)
    }

    fn create_stream(&mut self, kind: StreamKind) -> Result<FileStream, HostError> {
        FileStream::create(&self.stream_path(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_stream_roundtrip() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("stream");

        let mut stream = FileStream::create(&path).expect("create");
        stream.write_at(16, b"index").expect("write");
        assert_eq!(stream.len().expect("len"), 21);

        let mut reopened = FileStream::open(&path).expect("open");
        let mut buf = [0u8; 5];
        reopened.read_at(16, &mut buf).expect("read");
        assert_eq!(&buf, b"index");

        let err = reopened.read_at(20, &mut buf).unwrap_err();
        assert!(matches!(err, HostError::OutOfBounds { pos: 20, len: 21 }));
    }

    #[test]
    fn test_file_host_root_and_streams() {
        let dir = tempdir().expect("create temp dir");
        let mut host = FileHost::new(dir.path(), 256);

        assert_eq!(host.free_space(), 256);
        host.write_root(&[7u8; 56]).expect("write root");
        assert_eq!(host.free_space(), 200);
        assert_eq!(host.read_root().expect("read root"), vec![7u8; 56]);

        assert!(host.open_stream(StreamKind::Allocation).expect("open").is_none());
        let mut stream = host.create_stream(StreamKind::Allocation).expect("create");
        stream.set_len(4096).expect("grow");
        let reopened = host
            .open_stream(StreamKind::Allocation)
            .expect("open")
            .expect("exists");
        assert_eq!(reopened.len().expect("len"), 4096);
    }

    #[test]
    fn test_file_host_rejects_oversized_root() {
        let dir = tempdir().expect("create temp dir");
        let mut host = FileHost::new(dir.path(), 32);
        let err = host.write_root(&[0u8; 33]).unwrap_err();
        assert!(matches!(err, HostError::RecordFull { needed: 33, .. }));
    }
}
