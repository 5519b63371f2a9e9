//! On-disk layout of an ASDF file
//!
//! ```text
//! #ASDF 1.0.0
//! #ASDF_STANDARD 1.5.0
//! %YAML 1.1                       ┐
//! %TAG ! tag:stsci.edu:asdf/      │ optional tree
//! --- !core/asdf-1.1.0            │
//! ...                             ┘
//! [zero padding]
//! [block 0] .. [block N]
//! [streamed block]                  optional, data runs to EOF
//! [block index]                     optional, advisory
//! ```
//!
//! Each block starts with a fixed header, all integers big-endian:
//!
//! ```text
//! magic        4   \xd3BLK
//! header_size  2   bytes that follow (48 for this writer)
//! flags        4   bit 0 compressed, bit 1 streamed
//! compression  4   codec label or zeros
//! allocated    8   reserved payload bytes
//! used         8   payload bytes written
//! data_size    8   uncompressed payload size
//! checksum    16   md5 of the uncompressed payload, zeros if absent
//! ```

use crate::core::error::{AsdfError, Result};
use crate::core::io::{read_exact_vec, read_up_to, ByteStream};
use regex::bytes::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const FILE_MAGIC: &[u8] = b"#ASDF ";
pub const STANDARD_COMMENT: &[u8] = b"#ASDF_STANDARD ";
pub const FILE_FORMAT_VERSION: Version = Version::new(1, 0, 0);
pub const STANDARD_VERSION: Version = Version::new(1, 5, 0);

pub const BLOCK_MAGIC: [u8; 4] = *b"\xd3BLK";
/// Size of the header fields following magic and `header_size`
pub const BLOCK_HEADER_SIZE: u16 = 48;
/// Magic + `header_size` + header fields
pub const BLOCK_PREAMBLE: u64 = 4 + 2 + BLOCK_HEADER_SIZE as u64;

pub const FLAG_COMPRESSED: u32 = 0x1;
pub const FLAG_STREAMED: u32 = 0x2;

pub const DEFAULT_IO_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_PADDING_FACTOR: f64 = 1.1;
/// Largest accepted [`Padding::Factor`]
pub const MAX_PADDING_FACTOR: f64 = 16.0;

/// Digits reserved per block reference when sizing an updated tree
pub const MAX_BLOCKS_DIGITS: usize = 6;

const NO_COMPRESSION: [u8; 4] = [0; 4];

/// Extra space reserved after the tree and after each block payload
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "PaddingRepr", into = "PaddingRepr")]
pub enum Padding {
    #[default]
    None,
    /// Pad by [`DEFAULT_PADDING_FACTOR`]
    Default,
    /// Pad to `size * factor`
    Factor(f64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PaddingRepr {
    Flag(bool),
    Factor(f64),
}

impl From<PaddingRepr> for Padding {
    fn from(repr: PaddingRepr) -> Self {
        match repr {
            PaddingRepr::Flag(false) => Padding::None,
            PaddingRepr::Flag(true) => Padding::Default,
            PaddingRepr::Factor(f) => Padding::Factor(f),
        }
    }
}

impl From<Padding> for PaddingRepr {
    fn from(padding: Padding) -> Self {
        match padding {
            Padding::None => PaddingRepr::Flag(false),
            Padding::Default => PaddingRepr::Flag(true),
            Padding::Factor(f) => PaddingRepr::Factor(f),
        }
    }
}

impl Padding {
    /// Effective factor; unusable factors mean no padding and large ones
    /// are capped at [`MAX_PADDING_FACTOR`]
    pub fn factor(&self) -> Option<f64> {
        match self {
            Padding::None => None,
            Padding::Default => Some(DEFAULT_PADDING_FACTOR),
            Padding::Factor(f) if f.is_finite() && *f > 0.0 => Some(f.min(MAX_PADDING_FACTOR)),
            Padding::Factor(_) => None,
        }
    }

    /// Reject factors that are not finite or outside `0..=MAX_PADDING_FACTOR`
    pub fn check(&self) -> Result<()> {
        match self {
            Padding::Factor(f) if !f.is_finite() || *f < 0.0 || *f > MAX_PADDING_FACTOR => {
                Err(AsdfError::Config(format!(
                    "padding factor {} is not between 0 and {}",
                    f, MAX_PADDING_FACTOR
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Extra bytes to reserve after `content_size` bytes
///
/// The padded size is rounded up to a multiple of `block_size`, plus one
/// whole block.
pub fn calculate_padding(content_size: u64, padding: Padding, block_size: usize) -> u64 {
    let Some(factor) = padding.factor() else {
        return 0;
    };
    let block_size = block_size.max(1) as f64;
    let target = content_size as f64 * factor;
    let padded = (((target / block_size).ceil() + 1.0) * block_size) as u64;
    padded.saturating_sub(content_size)
}

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Length of the header after magic and the size field
    pub header_size: u16,
    pub flags: u32,
    pub compression: [u8; 4],
    pub allocated_size: u64,
    pub used_size: u64,
    pub data_size: u64,
    pub checksum: [u8; 16],
}

impl BlockHeader {
    /// Header for an internal block
    pub fn new(
        compression: [u8; 4],
        allocated_size: u64,
        used_size: u64,
        data_size: u64,
        checksum: [u8; 16],
    ) -> Self {
        let flags = if compression == NO_COMPRESSION {
            0
        } else {
            FLAG_COMPRESSED
        };
        BlockHeader {
            header_size: BLOCK_HEADER_SIZE,
            flags,
            compression,
            allocated_size,
            used_size,
            data_size,
            checksum,
        }
    }

    /// Header for the streamed block: no sizes, no checksum
    pub fn streamed() -> Self {
        BlockHeader {
            header_size: BLOCK_HEADER_SIZE,
            flags: FLAG_STREAMED,
            compression: NO_COMPRESSION,
            allocated_size: 0,
            used_size: 0,
            data_size: 0,
            checksum: [0; 16],
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_streamed(&self) -> bool {
        self.flags & FLAG_STREAMED != 0
    }

    /// An all-zero checksum means none was recorded
    pub fn has_checksum(&self) -> bool {
        self.checksum != [0; 16]
    }

    /// Bytes from the block's magic to the first payload byte
    pub fn total_header_len(&self) -> u64 {
        6 + self.header_size as u64
    }

    /// Serialize magic, size field and header fields
    pub fn to_bytes(&self) -> [u8; BLOCK_PREAMBLE as usize] {
        let mut bytes = [0u8; BLOCK_PREAMBLE as usize];
        bytes[0..4].copy_from_slice(&BLOCK_MAGIC);
        bytes[4..6].copy_from_slice(&BLOCK_HEADER_SIZE.to_be_bytes());
        bytes[6..10].copy_from_slice(&self.flags.to_be_bytes());
        bytes[10..14].copy_from_slice(&self.compression);
        bytes[14..22].copy_from_slice(&self.allocated_size.to_be_bytes());
        bytes[22..30].copy_from_slice(&self.used_size.to_be_bytes());
        bytes[30..38].copy_from_slice(&self.data_size.to_be_bytes());
        bytes[38..54].copy_from_slice(&self.checksum);
        bytes
    }

    /// Parse the header fields that follow magic and the size field
    fn from_fields(header_size: u16, fields: &[u8], offset: u64) -> Result<Self> {
        if header_size < BLOCK_HEADER_SIZE || fields.len() < BLOCK_HEADER_SIZE as usize {
            return Err(AsdfError::Format(format!(
                "Block header at offset {} is too small ({} bytes)",
                offset, header_size
            )));
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&fields[at..at + 8]);
            u64::from_be_bytes(raw)
        };
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&fields[0..4]);
        let mut compression = [0u8; 4];
        compression.copy_from_slice(&fields[4..8]);
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&fields[32..48]);

        let header = BlockHeader {
            header_size,
            flags: u32::from_be_bytes(flags),
            compression,
            allocated_size: u64_at(8),
            used_size: u64_at(16),
            data_size: u64_at(24),
            checksum,
        };
        header.validate(offset)?;
        Ok(header)
    }

    /// Parse a full header (starting at the magic) from a byte slice
    pub fn parse(bytes: &[u8], offset: u64) -> Result<Self> {
        if bytes.len() < 6 || bytes[0..4] != BLOCK_MAGIC {
            return Err(AsdfError::InvalidBlockMagic { offset });
        }
        let header_size = u16::from_be_bytes([bytes[4], bytes[5]]);
        let end = (6 + header_size as usize).min(bytes.len());
        Self::from_fields(header_size, &bytes[6..end], offset)
    }

    /// Read a header from the current stream position
    ///
    /// Unknown trailing header bytes are consumed, leaving the stream at the
    /// first payload byte.
    pub fn read(stream: &mut dyn ByteStream, offset: u64) -> Result<Self> {
        let preamble = read_exact_vec(stream, 6).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => AsdfError::InvalidBlockMagic { offset },
            _ => AsdfError::Io(e),
        })?;
        if preamble[0..4] != BLOCK_MAGIC {
            return Err(AsdfError::InvalidBlockMagic { offset });
        }
        let header_size = u16::from_be_bytes([preamble[4], preamble[5]]);
        let fields = read_exact_vec(stream, header_size as usize).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                AsdfError::Format(format!("Truncated block header at offset {}", offset))
            }
            _ => AsdfError::Io(e),
        })?;
        Self::from_fields(header_size, &fields, offset)
    }

    /// Consistency checks between flags and sizes
    pub fn validate(&self, offset: u64) -> Result<()> {
        let labelled = self.compression != NO_COMPRESSION;
        if self.is_streamed() && (self.is_compressed() || labelled) {
            return Err(AsdfError::Format(format!(
                "Streamed block at offset {} can not be compressed",
                offset
            )));
        }
        if self.is_compressed() != labelled {
            return Err(AsdfError::Format(format!(
                "Compression flag of block at offset {} disagrees with its label",
                offset
            )));
        }
        if !self.is_compressed() && self.used_size != self.data_size {
            return Err(AsdfError::Format(format!(
                "Uncompressed block at offset {} has used size {} but data size {}",
                offset, self.used_size, self.data_size
            )));
        }
        if !self.is_streamed() && self.used_size > self.allocated_size {
            return Err(AsdfError::Format(format!(
                "Block at offset {} uses {} bytes of {} allocated",
                offset, self.used_size, self.allocated_size
            )));
        }
        Ok(())
    }
}

/// Version lines at the top of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub file_format: Version,
    pub standard: Option<Version>,
}

impl Default for FileHeader {
    fn default() -> Self {
        FileHeader {
            file_format: FILE_FORMAT_VERSION,
            standard: Some(STANDARD_VERSION),
        }
    }
}

impl FileHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        out.extend_from_slice(FILE_MAGIC);
        out.extend_from_slice(self.file_format.to_string().as_bytes());
        out.push(b'\n');
        if let Some(standard) = &self.standard {
            out.extend_from_slice(STANDARD_COMMENT);
            out.extend_from_slice(standard.to_string().as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Read the magic line and any following comment lines
    pub fn read(stream: &mut dyn ByteStream) -> Result<Self> {
        let first = read_line(stream)?
            .ok_or_else(|| AsdfError::Format("Empty file".to_string()))?;
        let version = first
            .strip_prefix(FILE_MAGIC)
            .ok_or_else(|| AsdfError::Format("Does not appear to be an ASDF file".to_string()))?;
        let file_format = parse_version(version)?;

        let mut standard = None;
        loop {
            let mut peek = [0u8; 1];
            if stream.read(&mut peek)? == 0 {
                break;
            }
            if peek[0] != b'#' {
                stream.unread(&peek)?;
                break;
            }
            let Some(rest) = read_line(stream)? else {
                break;
            };
            let mut line = Vec::with_capacity(rest.len() + 1);
            line.push(b'#');
            line.extend_from_slice(&rest);
            if let Some(v) = line.strip_prefix(STANDARD_COMMENT) {
                standard = Some(parse_version(v)?);
            }
        }
        Ok(FileHeader {
            file_format,
            standard,
        })
    }
}

fn parse_version(raw: &[u8]) -> Result<Version> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| AsdfError::Format("Version is not valid UTF-8".to_string()))?;
    Version::parse(text.trim())
        .map_err(|e| AsdfError::Format(format!("Invalid version {:?}: {}", text.trim(), e)))
}

/// Read one `\n`-terminated line without the terminator
fn read_line(stream: &mut dyn ByteStream) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte)? == 0 {
            return Ok(if line.is_empty() { None } else { Some(line) });
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(line));
        }
        line.push(byte[0]);
    }
}

fn tree_end_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\r?\n\.\.\.((\r?\n)|$)").expect("valid regex"))
}

pub const TREE_DIRECTIVES: &str = "%YAML 1.1\n%TAG ! tag:stsci.edu:asdf/\n";
pub const TREE_DOCUMENT_TAG: &str = "--- !core/asdf-1.1.0";

/// Wrap a tree body in YAML directives and the end marker
pub fn wrap_tree(body: &str) -> Vec<u8> {
    let mut out = String::with_capacity(body.len() + 80);
    out.push_str(TREE_DIRECTIVES);
    out.push_str(TREE_DOCUMENT_TAG);
    out.push('\n');
    out.push_str(body.trim_end());
    out.push_str("\n...\n");
    out.into_bytes()
}

/// Extract the body between the document start line and the end marker
pub fn unwrap_tree(tree: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(tree)
        .map_err(|_| AsdfError::Format("Tree is not valid UTF-8".to_string()))?;
    let start = if text.starts_with("---") {
        0
    } else {
        text.find("\n---")
            .map(|i| i + 1)
            .ok_or_else(|| AsdfError::Format("Tree has no document start".to_string()))?
    };
    let after_start = &text[start..];
    let body_start = after_start.find('\n').map(|i| start + i + 1).unwrap_or(text.len());
    let body_end = tree_end_marker()
        .find_at(tree, body_start.saturating_sub(1))
        .map(|m| m.start())
        .unwrap_or(text.len())
        .max(body_start);
    Ok(text[body_start..body_end].trim())
}

/// Whether the bytes at the current position start a YAML tree
pub fn starts_tree(prefix: &[u8]) -> bool {
    prefix.starts_with(b"%YAML") || prefix.starts_with(b"---")
}

/// Read the YAML tree including its end marker
///
/// The stream must be positioned at the first tree byte. Bytes read past the
/// marker are pushed back so the stream ends up right after it. A bare
/// `\n...` only counts as the marker at end of file.
pub fn read_tree_bytes(stream: &mut dyn ByteStream, chunk_size: usize) -> Result<Vec<u8>> {
    let chunk_size = chunk_size.max(64);
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let chunk = read_up_to(stream, chunk_size)?;
        let eof = chunk.len() < chunk_size;
        let search_from = buffer.len().saturating_sub(8);
        buffer.extend_from_slice(&chunk);

        if let Some(m) = tree_end_marker().find_at(&buffer, search_from) {
            let terminated = buffer[m.end() - 1] == b'\n';
            if terminated || eof {
                let rest = buffer.split_off(m.end());
                stream.unread(&rest)?;
                return Ok(buffer);
            }
        }
        if eof {
            return Err(AsdfError::Format(
                "End of YAML marker not found".to_string(),
            ));
        }
    }
}

/// Read the tree if one starts at the current position
///
/// Returns `None` (leaving the stream untouched) for files without a tree.
pub fn read_tree(stream: &mut dyn ByteStream, chunk_size: usize) -> Result<Option<Vec<u8>>> {
    let prefix = read_up_to(stream, 5)?;
    stream.unread(&prefix)?;
    if !starts_tree(&prefix) {
        return Ok(None);
    }
    read_tree_bytes(stream, chunk_size).map(Some)
}
