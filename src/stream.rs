use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};

use thiserror::Error;
use tracing::trace;

use crate::cancel::Cancellation;
use crate::process::ProcessHandle;

/// Default number of bytes requested per read.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Failure of a [`ByteStream`] or [`ByteSink`].
#[derive(Debug, Error)]
pub enum StreamError {
    /// The underlying read or write failed.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The stream was cancelled through its [`Cancellation`] before it was drained.
    #[error("stream cancelled")]
    Cancelled,
}

/// A pull-based sequence of byte chunks read from an OS stream.
///
/// Each call to `next()` performs at most one read and yields what it returned; the
/// sequence ends at end-of-file. A read error is yielded once, after which the stream
/// is closed.
///
/// Dropping a `ByteStream` cancels it: the underlying descriptor is closed right away,
/// so a child still writing to the other end of a pipe receives `SIGPIPE` or `EPIPE`.
/// A stream attached to a [`Cancellation`] checks it before every read and closes
/// itself once cancellation is requested; a read that is already blocked is not
/// interrupted.
///
/// A stream that reads a child's stdout or stderr keeps a handle to the child, so the
/// child stays tracked for as long as somebody may still consume its output.
pub struct ByteStream {
    source: Option<Box<dyn Read + Send>>,
    // Released together with `source`.
    owner: Option<ProcessHandle>,
    cancel: Option<Cancellation>,
    chunk_size: usize,
}

impl ByteStream {
    /// A stream that reads `reader` until end-of-file.
    pub fn from_reader(reader: impl Read + Send + 'static) -> ByteStream {
        ByteStream {
            source: Some(Box::new(reader)),
            owner: None,
            cancel: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// A stream over an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> ByteStream {
        ByteStream::from_reader(Cursor::new(bytes.into()))
    }

    /// A stream with no data.
    pub fn empty() -> ByteStream {
        ByteStream {
            source: None,
            owner: None,
            cancel: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub(crate) fn from_pipe(pipe: File, owner: ProcessHandle, chunk_size: usize) -> ByteStream {
        ByteStream {
            source: Some(Box::new(pipe)),
            owner: Some(owner),
            cancel: None,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Attach a cancellation token, checked before every read.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> ByteStream {
        self.cancel = Some(cancel);
        self
    }

    /// Set the maximum number of bytes returned per chunk.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> ByteStream {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// True once the stream has ended, failed, or been cancelled.
    pub fn is_exhausted(&self) -> bool {
        self.source.is_none()
    }

    /// Close the stream without reading the rest of it.
    pub fn cancel(mut self) {
        self.close();
    }

    /// Read all remaining chunks and concatenate them.
    pub fn read_to_end(self) -> Result<Vec<u8>, StreamError> {
        let mut data = Vec::new();
        for chunk in self {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }

    fn close(&mut self) {
        self.source = None;
        self.owner = None;
    }

    fn read_chunk(&mut self) -> Option<io::Result<Vec<u8>>> {
        let source = self.source.as_mut()?;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            match source.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Iterator for ByteStream {
    type Item = Result<Vec<u8>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.source.is_none() {
            return None;
        }
        if self.cancel.as_ref().is_some_and(Cancellation::is_cancelled) {
            trace!("byte stream cancelled");
            self.close();
            return Some(Err(StreamError::Cancelled));
        }
        match self.read_chunk() {
            Some(Ok(chunk)) => {
                trace!(bytes = chunk.len(), "read chunk");
                Some(Ok(chunk))
            }
            Some(Err(source)) => {
                self.close();
                Some(Err(StreamError::Io { op: "read", source }))
            }
            None => {
                trace!("byte stream reached end of file");
                self.close();
                None
            }
        }
    }
}

impl Default for ByteStream {
    fn default() -> ByteStream {
        ByteStream::empty()
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("open", &self.source.is_some())
            .field("owner", &self.owner.as_ref().map(ProcessHandle::pid))
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// The writing end of a child's standard input.
///
/// The descriptor is closed when the sink is dropped, which is how the child sees
/// end-of-file. [`drain`](Self::drain) consumes the sink so the descriptor is closed
/// whether the copy succeeds or fails.
#[derive(Debug)]
pub struct ByteSink {
    file: File,
    written: u64,
}

impl ByteSink {
    pub(crate) fn new(file: File) -> ByteSink {
        ByteSink { file, written: 0 }
    }

    /// Write the whole chunk, blocking until the OS accepts it.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        self.file
            .write_all(chunk)
            .map_err(|source| StreamError::Io { op: "write", source })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Total number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Write every chunk of `chunks` in order, then close the sink.
    ///
    /// Returns the total number of bytes written through this sink, or the first error
    /// from either side.
    pub fn drain<I>(mut self, chunks: I) -> Result<u64, StreamError>
    where
        I: IntoIterator<Item = Result<Vec<u8>, StreamError>>,
    {
        for chunk in chunks {
            self.write_chunk(&chunk?)?;
        }
        Ok(self.written)
    }

    /// Close the sink, signalling end-of-file to the reader.
    pub fn close(self) {}
}

impl Write for ByteSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
