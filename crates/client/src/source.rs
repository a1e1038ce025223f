//! Payload byte sources that can be replayed from a mark.

use std::io::{self, Read, Seek, SeekFrom};

/// A readable payload that may support rewinding to a marked position.
pub trait PayloadSource: Read + Send {
    /// Whether `reset` can rewind to the last mark.
    fn supports_replay(&self) -> bool;

    /// Remember the current position.
    ///
    /// # Errors
    ///
    /// Returns an error if the position cannot be determined.
    fn mark(&mut self) -> io::Result<()>;

    /// Rewind to the last mark.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` when the source cannot replay.
    fn reset(&mut self) -> io::Result<()>;
}

/// In-memory payload.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Vec<u8>,
    pos: usize,
    mark: usize,
}

impl BytesSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            mark: 0,
        }
    }
}

impl Read for BytesSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl PayloadSource for BytesSource {
    fn supports_replay(&self) -> bool {
        true
    }

    fn mark(&mut self) -> io::Result<()> {
        self.mark = self.pos;
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        self.pos = self.mark;
        Ok(())
    }
}

/// Seekable payload (files, cursors). Replays by seeking back to the mark.
#[derive(Debug)]
pub struct SeekSource<R> {
    inner: R,
    mark: u64,
}

impl<R: Read + Seek> SeekSource<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner, mark: 0 }
    }
}

impl<R: Read> Read for SeekSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Seek + Send> PayloadSource for SeekSource<R> {
    fn supports_replay(&self) -> bool {
        true
    }

    fn mark(&mut self) -> io::Result<()> {
        self.mark = self.inner.stream_position()?;
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(self.mark)).map(|_| ())
    }
}

/// One-pass payload (pipes, sockets, stdin). Cannot replay.
#[derive(Debug)]
pub struct StreamSource<R> {
    inner: R,
}

impl<R: Read> StreamSource<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> Read for StreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Send> PayloadSource for StreamSource<R> {
    fn supports_replay(&self) -> bool {
        false
    }

    fn mark(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream source cannot be rewound",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn read_all(source: &mut dyn PayloadSource) -> Vec<u8> {
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn bytes_source_replays_from_mark() {
        let mut source = BytesSource::new(b"abcdef".to_vec());
        let mut head = [0u8; 2];
        source.read_exact(&mut head).unwrap();
        source.mark().unwrap();
        assert_eq!(read_all(&mut source), b"cdef");
        source.reset().unwrap();
        assert_eq!(read_all(&mut source), b"cdef");
    }

    #[test]
    fn seek_source_replays_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"payload").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut source = SeekSource::new(file);
        source.mark().unwrap();
        assert_eq!(read_all(&mut source), b"payload");
        source.reset().unwrap();
        assert_eq!(read_all(&mut source), b"payload");
    }

    #[test]
    fn stream_source_refuses_reset() {
        let mut source = StreamSource::new(Cursor::new(b"once".to_vec()));
        assert!(!source.supports_replay());
        source.mark().unwrap();
        assert_eq!(read_all(&mut source), b"once");
        let err = source.reset().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
