//! Binary blocks and their storage state
//!
//! A [`Block`] starts out unassigned and is moved into one of the storage
//! modes by the document controller or, at write time, by policy:
//!
//! ```text
//!              ┌──► Internal
//! Unassigned ──┼──► External
//!              ├──► Streamed   (at most one per document)
//!              └──► Inline
//! ```
//!
//! Payloads read from disk stay lazy until first access. The block keeps
//! only a weak reference to its stream, so access after the document closes
//! fails instead of returning stale bytes.

use crate::core::checksum;
use crate::core::compression::{self, CompressionLabel, CompressionOptions};
use crate::core::error::{AsdfError, Result};
use crate::core::format::BlockHeader;
use crate::core::io::{read_to_end, read_up_to, ByteStream, WeakStream};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::SeekFrom;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, Weak};

/// Where a block's payload lives when the document is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayStorage {
    /// Binary block inside this file
    Internal,
    /// Single-block sibling file referenced by relative URI
    External,
    /// Trailing block whose data runs to end of file
    Streamed,
    /// Embedded in the tree, not a binary block
    Inline,
}

impl fmt::Display for ArrayStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArrayStorage::Internal => "internal",
            ArrayStorage::External => "external",
            ArrayStorage::Streamed => "streamed",
            ArrayStorage::Inline => "inline",
        })
    }
}

impl FromStr for ArrayStorage {
    type Err = AsdfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "internal" => Ok(ArrayStorage::Internal),
            "external" => Ok(ArrayStorage::External),
            "streamed" => Ok(ArrayStorage::Streamed),
            "inline" => Ok(ArrayStorage::Inline),
            other => Err(AsdfError::StorageConstraint(format!(
                "unknown array storage {:?}",
                other
            ))),
        }
    }
}

/// Checksum handling for [`Block::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Do not compute anything
    Skip,
    /// Report a mismatch as `Ok(false)`
    Check,
    /// Report a mismatch as [`AsdfError::ChecksumMismatch`]
    Enforce,
}

/// Materialized payload bytes
///
/// Cloning is cheap; clones share the same buffer or mapping. A mapped
/// payload only holds a weak reference to the mapping, which belongs to the
/// document's stream: once the document closes, [`BlockData::bytes`] fails
/// with [`AsdfError::Closed`].
#[derive(Clone)]
pub enum BlockData {
    Owned(Arc<Vec<u8>>),
    Mapped {
        map: Weak<Mmap>,
        start: usize,
        len: usize,
    },
}

impl BlockData {
    pub fn from_vec(data: Vec<u8>) -> Self {
        BlockData::Owned(Arc::new(data))
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, BlockData::Mapped { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            BlockData::Owned(data) => data.len(),
            BlockData::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the payload bytes
    ///
    /// A mapped payload stays mapped while the returned guard is alive.
    pub fn bytes(&self) -> Result<DataRef<'_>> {
        match self {
            BlockData::Owned(data) => Ok(DataRef::Borrowed(data.as_slice())),
            BlockData::Mapped { map, start, len } => {
                let map = map.upgrade().ok_or(AsdfError::Closed)?;
                Ok(DataRef::Mapped {
                    map,
                    start: *start,
                    len: *len,
                })
            }
        }
    }

    /// Copy the payload into a new buffer
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.bytes()?.to_vec())
    }

    /// Whether both values view the same underlying memory
    pub fn ptr_eq(&self, other: &BlockData) -> bool {
        match (self, other) {
            (BlockData::Owned(a), BlockData::Owned(b)) => Arc::ptr_eq(a, b),
            (
                BlockData::Mapped { map: a, start: sa, len: la },
                BlockData::Mapped { map: b, start: sb, len: lb },
            ) => Weak::ptr_eq(a, b) && sa == sb && la == lb,
            _ => false,
        }
    }
}

impl PartialEq for BlockData {
    fn eq(&self, other: &Self) -> bool {
        match (self.bytes(), other.bytes()) {
            (Ok(a), Ok(b)) => a[..] == b[..],
            _ => false,
        }
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockData")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Borrowed payload bytes returned by [`BlockData::bytes`]
pub enum DataRef<'a> {
    Borrowed(&'a [u8]),
    Mapped {
        map: Arc<Mmap>,
        start: usize,
        len: usize,
    },
}

impl Deref for DataRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            DataRef::Borrowed(data) => data,
            DataRef::Mapped { map, start, len } => &map[*start..*start + *len],
        }
    }
}

impl AsRef<[u8]> for DataRef<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

#[derive(Clone)]
enum Payload {
    /// On disk, not read yet
    Lazy { stream: WeakStream, data_offset: u64 },
    /// In memory (read, mapped or supplied by the caller)
    Loaded(BlockData),
    /// In a sibling file, resolved through the external block cache
    External,
    /// Slot of a block no array refers to any more
    Released,
}

/// One binary payload and its storage metadata
#[derive(Clone)]
pub struct Block {
    storage: Option<ArrayStorage>,
    compression: CompressionLabel,
    compression_options: CompressionOptions,
    header: Option<BlockHeader>,
    offset: Option<u64>,
    payload: Payload,
    uri: Option<String>,
    validate_checksum: bool,
    memmap: bool,
    dirty: bool,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("storage", &self.storage)
            .field("compression", &self.compression)
            .field("offset", &self.offset)
            .field("header", &self.header)
            .field("loaded", &self.is_loaded())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Block {
    /// New in-memory block with unassigned storage
    pub fn new(data: Vec<u8>) -> Self {
        Block {
            storage: None,
            compression: CompressionLabel::NONE,
            compression_options: CompressionOptions::new(),
            header: None,
            offset: None,
            payload: Payload::Loaded(BlockData::from_vec(data)),
            uri: None,
            validate_checksum: false,
            memmap: false,
            dirty: true,
        }
    }

    /// Block discovered on disk at `offset`
    pub fn from_disk(
        header: BlockHeader,
        offset: u64,
        stream: WeakStream,
        validate_checksum: bool,
        memmap: bool,
    ) -> Self {
        let storage = if header.is_streamed() {
            ArrayStorage::Streamed
        } else {
            ArrayStorage::Internal
        };
        Block {
            storage: Some(storage),
            compression: CompressionLabel::from_bytes(header.compression),
            compression_options: CompressionOptions::new(),
            header: Some(header),
            offset: Some(offset),
            payload: Payload::Lazy {
                stream,
                data_offset: offset + header.total_header_len(),
            },
            uri: None,
            validate_checksum,
            memmap,
            dirty: false,
        }
    }

    /// Block whose payload is the first block of another file
    pub fn external(uri: impl Into<String>) -> Self {
        Block {
            storage: Some(ArrayStorage::External),
            compression: CompressionLabel::NONE,
            compression_options: CompressionOptions::new(),
            header: None,
            offset: None,
            payload: Payload::External,
            uri: Some(uri.into()),
            validate_checksum: false,
            memmap: false,
            dirty: false,
        }
    }

    /// `None` while unassigned
    pub fn storage(&self) -> Option<ArrayStorage> {
        self.storage
    }

    /// Assign storage without cross-block checks
    ///
    /// The manager enforces the single-streamed-block rule before calling this.
    pub(crate) fn set_storage_unchecked(&mut self, storage: ArrayStorage) {
        if storage == ArrayStorage::Streamed {
            self.compression = CompressionLabel::NONE;
        }
        self.storage = Some(storage);
    }

    pub fn compression(&self) -> CompressionLabel {
        self.compression
    }

    pub fn compression_options(&self) -> &CompressionOptions {
        &self.compression_options
    }

    pub fn set_compression(&mut self, label: CompressionLabel, options: CompressionOptions) {
        self.compression = label;
        self.compression_options = options;
    }

    /// Header as last read from or written to disk
    pub fn header(&self) -> Option<&BlockHeader> {
        self.header.as_ref()
    }

    /// Offset of the block's magic in its file
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Offset one past the block's allocated region
    pub fn end_offset(&self) -> Option<u64> {
        let header = self.header.as_ref()?;
        Some(
            self.offset?
                .saturating_add(header.total_header_len())
                .saturating_add(header.allocated_size),
        )
    }

    /// Relative URI of an external payload
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.payload, Payload::Loaded(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(self.payload, Payload::Released)
    }

    pub fn is_external_unresolved(&self) -> bool {
        matches!(self.payload, Payload::External)
    }

    /// Uncompressed payload length, when known without reading it
    pub fn data_len(&self) -> Option<u64> {
        match &self.payload {
            Payload::Loaded(data) => Some(data.len() as u64),
            Payload::Lazy { .. } => self
                .header
                .filter(|h| !h.is_streamed())
                .map(|h| h.data_size),
            Payload::External | Payload::Released => None,
        }
    }

    /// Whether the payload changed since it was last written
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Loaded payload, if any, without touching the stream
    pub fn loaded_data(&self) -> Option<&BlockData> {
        match &self.payload {
            Payload::Loaded(data) => Some(data),
            _ => None,
        }
    }

    /// Payload bytes, reading them from disk on first access
    ///
    /// Fails with [`AsdfError::Closed`] once the owning stream has been
    /// released and with [`AsdfError::ChecksumMismatch`] when the block is
    /// marked for validation and its digest does not match.
    pub fn materialize(&mut self) -> Result<BlockData> {
        let cached = self.loaded_data().cloned();
        let data = match cached {
            Some(data) => data,
            None => self.load()?,
        };
        if self.validate_checksum && !self.dirty {
            if let Some(header) = &self.header {
                if !checksum::verify(&data.bytes()?, &header.checksum) {
                    return Err(AsdfError::ChecksumMismatch {
                        offset: self.offset.unwrap_or_default(),
                    });
                }
            }
            // only the first access is validated
            self.validate_checksum = false;
        }
        if !self.is_loaded() {
            tracing::debug!(
                "Loaded block at offset {:?} ({} bytes, mapped: {})",
                self.offset,
                data.len(),
                data.is_mapped()
            );
            self.payload = Payload::Loaded(data.clone());
        }
        Ok(data)
    }

    /// Read the payload without caching or validating it
    fn load(&self) -> Result<BlockData> {
        match &self.payload {
            Payload::Loaded(data) => Ok(data.clone()),
            Payload::External => Err(AsdfError::Uri(format!(
                "external block {:?} has not been resolved",
                self.uri.as_deref().unwrap_or_default()
            ))),
            Payload::Released => Err(AsdfError::Format(
                "block has been released".to_string(),
            )),
            Payload::Lazy {
                stream,
                data_offset,
            } => {
                let header = self.header.ok_or_else(|| {
                    AsdfError::Format("lazy block without a header".to_string())
                })?;
                stream.with(|s| {
                    read_payload(
                        s,
                        &header,
                        *data_offset,
                        self.memmap,
                        &self.compression_options,
                    )
                })
            }
        }
    }

    /// Check the payload against the recorded digest
    ///
    /// Blocks without a recorded digest (new, modified or streamed blocks)
    /// always pass. A failed check does not cache the payload.
    pub fn validate(&mut self, mode: ChecksumMode) -> Result<bool> {
        if mode == ChecksumMode::Skip || self.dirty {
            return Ok(true);
        }
        let Some(header) = self.header else {
            return Ok(true);
        };
        if !header.has_checksum() {
            return Ok(true);
        }
        let ok = checksum::verify(&self.load()?.bytes()?, &header.checksum);
        match (ok, mode) {
            (false, ChecksumMode::Enforce) => Err(AsdfError::ChecksumMismatch {
                offset: self.offset.unwrap_or_default(),
            }),
            _ => Ok(ok),
        }
    }

    /// Mutable access to the payload; marks the block dirty
    pub fn data_mut(&mut self) -> Result<&mut Vec<u8>> {
        let data = self.materialize()?;
        let owned = match data {
            BlockData::Owned(buffer) => buffer,
            mapped @ BlockData::Mapped { .. } => Arc::new(mapped.to_vec()?),
        };
        self.payload = Payload::Loaded(BlockData::Owned(owned));
        self.dirty = true;
        match &mut self.payload {
            Payload::Loaded(BlockData::Owned(buffer)) => Ok(Arc::make_mut(buffer)),
            _ => Err(AsdfError::Format("block payload is not owned".to_string())),
        }
    }

    /// Replace the payload; marks the block dirty
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.payload = Payload::Loaded(BlockData::from_vec(data));
        self.dirty = true;
    }

    /// Install a payload read ahead of first access
    ///
    /// Pending checksum validation still runs on the first [`materialize`].
    ///
    /// [`materialize`]: Block::materialize
    pub(crate) fn set_loaded(&mut self, data: BlockData) {
        self.payload = Payload::Loaded(data);
    }

    /// Record the on-disk location after a write
    ///
    /// Loaded payloads are kept; unloaded ones are re-pointed at `stream`.
    pub(crate) fn rebind(&mut self, header: BlockHeader, offset: u64, stream: WeakStream) {
        if !self.is_loaded() {
            self.payload = Payload::Lazy {
                stream,
                data_offset: offset + header.total_header_len(),
            };
        }
        self.header = Some(header);
        self.offset = Some(offset);
        self.validate_checksum = false;
        self.dirty = false;
    }

    /// Drop the payload and every reference to disk
    ///
    /// The slot can be handed out again for a new block.
    pub(crate) fn release(&mut self) {
        self.storage = None;
        self.compression = CompressionLabel::NONE;
        self.compression_options = CompressionOptions::new();
        self.header = None;
        self.offset = None;
        self.payload = Payload::Released;
        self.uri = None;
        self.validate_checksum = false;
        self.dirty = false;
    }

    /// Forget the on-disk location (the block now lives elsewhere)
    pub(crate) fn unbind(&mut self) {
        self.header = None;
        self.offset = None;
    }
}

/// Read and decode a payload from `stream`
pub(crate) fn read_payload(
    stream: &mut dyn ByteStream,
    header: &BlockHeader,
    data_offset: u64,
    memmap: bool,
    options: &CompressionOptions,
) -> Result<BlockData> {
    if header.is_streamed() {
        if stream.seekable() {
            stream.seek(SeekFrom::Start(data_offset))?;
        }
        return Ok(BlockData::from_vec(read_to_end(stream)?));
    }

    let used = usize::try_from(header.used_size)
        .map_err(|_| AsdfError::Format("block too large for this platform".to_string()))?;

    if memmap && !header.is_compressed() && stream.can_memmap() {
        let map = stream.memmap()?;
        let start = data_offset as usize;
        if start.checked_add(used).map_or(true, |end| end > map.len()) {
            return Err(AsdfError::Format(format!(
                "block data at offset {} runs past end of file",
                data_offset
            )));
        }
        return Ok(BlockData::Mapped {
            map: Arc::downgrade(&map),
            start,
            len: used,
        });
    }

    if stream.seekable() {
        stream.seek(SeekFrom::Start(data_offset))?;
    }
    let raw = read_up_to(stream, used)?;
    if raw.len() != used {
        return Err(AsdfError::Format(format!(
            "block data at offset {} runs past end of file",
            data_offset
        )));
    }
    if !header.is_compressed() {
        return Ok(BlockData::from_vec(raw));
    }
    let data_size = usize::try_from(header.data_size)
        .map_err(|_| AsdfError::Format("block too large for this platform".to_string()))?;
    let data = compression::decompress(
        &raw,
        data_size,
        CompressionLabel::from_bytes(header.compression),
        options,
    )?;
    Ok(BlockData::from_vec(data))
}
