use snafu::{ResultExt, Snafu};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Snafu, Debug)]
pub enum SourceError {
    /// I/O error reading the source
    Io { source: std::io::Error },
    /// Short read at offset {offset}: wanted {wanted} bytes, got {got}
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },
    /// Stream source cannot rewind from {position} to {offset}
    NonMonotonicRead { position: u64, offset: u64 },
}

/// Random-access byte supplier the installer pulls container bytes from.
///
/// Stream sources only support monotonically non-decreasing offsets; the
/// installer orders its reads accordingly and skips the features that need
/// to revisit data.
pub trait ByteSource: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the number of
    /// bytes read. Zero means end of source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError>;

    fn is_stream(&self) -> bool {
        false
    }
}

pub trait ByteSourceExt: ByteSource {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), SourceError> {
        let got = self.read_at(offset, buf)?;
        if got != buf.len() {
            return Err(SourceError::ShortRead {
                offset,
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }
}

impl<T: ByteSource + ?Sized> ByteSourceExt for T {}

pub struct FileSource {
    file: Mutex<File>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let file = File::open(path).context(IoSnafu)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut file = self.file.lock().expect("BUG: file source mutex poisoned");
        file.seek(SeekFrom::Start(offset)).context(IoSnafu)?;

        // regular files may still return short counts, keep pulling
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..]).context(IoSnafu)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }
}

/// In-memory source, mostly useful for tests and fixtures.
pub struct VecSource(pub Vec<u8>);

impl ByteSource for VecSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let data = &self.0;
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let len = std::cmp::min(buf.len(), data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }
}

/// Wraps any source and enforces forward-only access, the way a network or
/// pipe-backed source would behave.
pub struct StreamSource<S> {
    inner: S,
    position: AtomicU64,
}

impl<S: ByteSource> StreamSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            position: AtomicU64::new(0),
        }
    }
}

impl<S: ByteSource> ByteSource for StreamSource<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let position = self.position.load(Ordering::Acquire);
        if offset < position {
            return Err(SourceError::NonMonotonicRead { position, offset });
        }
        let read = self.inner.read_at(offset, buf)?;
        self.position.store(offset + read as u64, Ordering::Release);
        Ok(read)
    }

    fn is_stream(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_source_clamps_at_end() {
        let source = VecSource(vec![1, 2, 3, 4]);
        let mut buf = [0; 8];
        assert_eq!(source.read_at(2, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert_eq!(source.read_at(4, &mut buf).unwrap(), 0);
    }

    #[test]
    fn stream_source_rejects_rewind() {
        let source = StreamSource::new(VecSource(vec![0; 0x100]));
        let mut buf = [0; 0x10];
        source.read_at(0, &mut buf).unwrap();
        source.read_at(0x40, &mut buf).unwrap();
        assert!(matches!(
            source.read_at(0x20, &mut buf),
            Err(SourceError::NonMonotonicRead { .. })
        ));
    }
}
