//! Byte streams consumed by the block layer
//!
//! The block layer only needs a small capability set from its storage:
//! sequential reads and writes, optional random access, optional truncation
//! and optional memory mapping. [`ByteStream`] captures that set; the
//! concrete streams here cover files, in-memory buffers and one-way pipes.
//!
//! A document owns its stream through a [`StreamHandle`]. Lazily loaded
//! blocks keep only a [`WeakStream`], so closing the handle makes every later
//! access fail with [`AsdfError::Closed`] instead of reading stale bytes.

use crate::core::error::{AsdfError, Result};
use crate::core::format::DEFAULT_IO_BLOCK_SIZE;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tempfile::NamedTempFile;

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not supported by this stream", what),
    )
}

/// Capability set of a storage stream
pub trait ByteStream: Read + Write + Send {
    /// Whether the stream supports random access
    fn seekable(&self) -> bool;

    /// Whether the stream accepts writes
    fn writable(&self) -> bool;

    /// Move to an absolute or relative position
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Current position from the start of the stream
    fn position(&mut self) -> io::Result<u64>;

    /// Cut the stream at `len` bytes
    fn truncate(&mut self, _len: u64) -> io::Result<()> {
        Err(unsupported("truncate"))
    }

    /// Flush and persist written bytes
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Push bytes back so the next read returns them again
    fn unread(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.seek(SeekFrom::Current(-(bytes.len() as i64)))
            .map(|_| ())
    }

    fn can_memmap(&self) -> bool {
        false
    }

    /// Shared read-only mapping of the whole stream
    fn memmap(&mut self) -> io::Result<Arc<Mmap>> {
        Err(unsupported("memory mapping"))
    }

    /// Drop the stream's own reference to its mapping
    fn close_memmap(&mut self) {}

    /// Filesystem path backing the stream, if any
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Preferred I/O block size
    fn block_size(&self) -> usize {
        DEFAULT_IO_BLOCK_SIZE
    }

    /// Downcast used by the rewrite path to replace a file atomically
    fn as_file_stream(&mut self) -> Option<&mut FileStream> {
        None
    }
}

/// Read exactly `len` bytes
pub fn read_exact_vec(stream: &mut dyn ByteStream, len: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Read up to `len` bytes, stopping early only at end of stream
pub fn read_up_to(stream: &mut dyn ByteStream, len: usize) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(len.min(1 << 20));
    stream.take(len as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Read everything up to end of stream
pub fn read_to_end(stream: &mut dyn ByteStream) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Advance `len` bytes, seeking when possible and reading otherwise
pub fn skip(stream: &mut dyn ByteStream, len: u64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    if stream.seekable() {
        stream.seek(SeekFrom::Current(len as i64))?;
        return Ok(());
    }
    let copied = io::copy(&mut stream.take(len), &mut io::sink())?;
    if copied != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended while skipping padding",
        ));
    }
    Ok(())
}

/// Write `len` zero bytes
pub fn write_zeros(stream: &mut dyn ByteStream, len: u64) -> io::Result<()> {
    const ZEROS: [u8; 4096] = [0u8; 4096];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(ZEROS.len() as u64) as usize;
        stream.write_all(&ZEROS[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Write a file through a temporary sibling and rename it into place
///
/// Readers of `path` see either the previous contents or the complete new
/// contents.
pub fn write_atomic<T>(
    path: &Path,
    f: impl FnOnce(&mut dyn ByteStream) -> Result<T>,
) -> Result<T> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(dir)?;
    let value = {
        let mut stream = FileStream::open(temp.path(), true)?;
        let value = f(&mut stream)?;
        stream.sync()?;
        value
    };
    temp.persist(path).map_err(|e| AsdfError::Io(e.error))?;
    Ok(value)
}

/// Disk-backed stream
pub struct FileStream {
    file: File,
    path: PathBuf,
    writable: bool,
    mmap: Option<Arc<Mmap>>,
    block_size: usize,
}

impl FileStream {
    /// Open an existing file, read-only or read-write
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        Ok(FileStream {
            file,
            path: path.as_ref().to_path_buf(),
            writable,
            mmap: None,
            block_size: DEFAULT_IO_BLOCK_SIZE,
        })
    }

    /// Create (or truncate) a file for writing
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(FileStream {
            file,
            path: path.as_ref().to_path_buf(),
            writable: true,
            mmap: None,
            block_size: DEFAULT_IO_BLOCK_SIZE,
        })
    }

    /// Override the I/O block size used for padding and index scanning
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Atomically replace the file at this stream's path with `replacement`
    ///
    /// The replacement is synced, renamed over the original path and
    /// reopened read-write; the previous handle and mapping are dropped.
    pub fn replace_with(&mut self, replacement: NamedTempFile) -> io::Result<()> {
        replacement.as_file().sync_all()?;
        self.mmap = None;
        replacement
            .persist(&self.path)
            .map_err(|e| e.error)?;
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        self.writable = true;
        Ok(())
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ByteStream for FileStream {
    fn seekable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    fn can_memmap(&self) -> bool {
        true
    }

    fn memmap(&mut self) -> io::Result<Arc<Mmap>> {
        if let Some(map) = &self.mmap {
            return Ok(Arc::clone(map));
        }
        // Safety: the mapping is read-only and documents that map their file
        // never write to it (read-write documents always copy).
        let map = Arc::new(unsafe { Mmap::map(&self.file)? });
        self.mmap = Some(Arc::clone(&map));
        Ok(map)
    }

    fn close_memmap(&mut self) {
        self.mmap = None;
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn as_file_stream(&mut self) -> Option<&mut FileStream> {
        Some(self)
    }
}

/// In-memory random access stream
#[derive(Debug, Default)]
pub struct MemoryStream {
    cursor: Cursor<Vec<u8>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryStream {
            cursor: Cursor::new(bytes),
        }
    }

    pub fn get_ref(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for MemoryStream {
    fn seekable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        true
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }

    fn position(&mut self) -> io::Result<u64> {
        Ok(self.cursor.position())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.cursor.get_mut().truncate(len as usize);
        Ok(())
    }
}

/// Write-only, forward-only stream (pipes, sockets, stdout)
pub struct OutputStream<W: Write + Send> {
    inner: W,
    position: u64,
}

impl<W: Write + Send> OutputStream<W> {
    pub fn new(inner: W) -> Self {
        OutputStream { inner, position: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> Read for OutputStream<W> {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(unsupported("reading"))
    }
}

impl<W: Write + Send> Write for OutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Send> ByteStream for OutputStream<W> {
    fn seekable(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        true
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.position),
            SeekFrom::Start(p) if p == self.position => Ok(self.position),
            _ => Err(unsupported("seeking")),
        }
    }

    fn position(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }

    fn unread(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Err(unsupported("unread"))
    }
}

/// Read-only, forward-only stream with a push-back buffer
pub struct InputStream<R: Read + Send> {
    inner: R,
    position: u64,
    pushback: Vec<u8>,
}

impl<R: Read + Send> InputStream<R> {
    pub fn new(inner: R) -> Self {
        InputStream {
            inner,
            position: 0,
            pushback: Vec::new(),
        }
    }
}

impl<R: Read + Send> Read for InputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = if !self.pushback.is_empty() {
            let n = buf.len().min(self.pushback.len());
            buf[..n].copy_from_slice(&self.pushback[..n]);
            self.pushback.drain(..n);
            n
        } else {
            self.inner.read(buf)?
        };
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Send> Write for InputStream<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(unsupported("writing"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: Read + Send> ByteStream for InputStream<R> {
    fn seekable(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        false
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.position),
            SeekFrom::Start(p) if p == self.position => Ok(self.position),
            _ => Err(unsupported("seeking")),
        }
    }

    fn position(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }

    fn unread(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut pushback = bytes.to_vec();
        pushback.append(&mut self.pushback);
        self.pushback = pushback;
        self.position -= bytes.len() as u64;
        Ok(())
    }
}

type StreamSlot = Mutex<Option<Box<dyn ByteStream>>>;

/// Owning handle to a document's stream
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamSlot>,
}

impl StreamHandle {
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        StreamHandle {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Run `f` with exclusive access to the stream
    pub fn with<T>(&self, f: impl FnOnce(&mut dyn ByteStream) -> Result<T>) -> Result<T> {
        let mut slot = self.inner.lock();
        match slot.as_mut() {
            Some(stream) => f(stream.as_mut()),
            None => Err(AsdfError::Closed),
        }
    }

    /// Release the stream; later accesses through any handle fail
    pub fn close(&self) -> Option<Box<dyn ByteStream>> {
        let mut slot = self.inner.lock();
        if let Some(stream) = slot.as_mut() {
            stream.close_memmap();
            if let Err(e) = stream.flush() {
                tracing::warn!("Flush on close failed: {}", e);
            }
        }
        slot.take()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub fn downgrade(&self) -> WeakStream {
        WeakStream {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning back-reference held by lazily loaded blocks
#[derive(Clone, Default)]
pub struct WeakStream {
    inner: Weak<StreamSlot>,
}

impl WeakStream {
    /// Run `f` against the stream if it is still open
    pub fn with<T>(&self, f: impl FnOnce(&mut dyn ByteStream) -> Result<T>) -> Result<T> {
        let slot = self.inner.upgrade().ok_or(AsdfError::Closed)?;
        let mut guard = slot.lock();
        match guard.as_mut() {
            Some(stream) => f(stream.as_mut()),
            None => Err(AsdfError::Closed),
        }
    }
}
