//! Block compression
//!
//! A codec is identified by a 4-byte label stored in the block header.
//! Builtin codecs cover zlib, bzip2, LZ4 and Zstd; third parties add their
//! own through [`register_compressor`].
//!
//! **Contract**:
//! - `compress` yields a sequence of chunks; the compressed size is only known
//!   once every chunk has been produced
//! - `decompress` must produce exactly `data_size` bytes; both short and long
//!   output are errors
//! - Input is fed to the codec in `block_size` pieces (option, default 4 MiB)

use crate::core::error::{AsdfError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

/// Codec parameters, e.g. `{"level": 9, "block_size": 65536}`
pub type CompressionOptions = serde_json::Map<String, serde_json::Value>;

/// Default input piece size handed to a codec
pub const DEFAULT_COMPRESSION_BLOCK_SIZE: usize = 1 << 22;

/// 4-byte codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CompressionLabel([u8; 4]);

impl CompressionLabel {
    pub const NONE: CompressionLabel = CompressionLabel([0; 4]);
    pub const ZLIB: CompressionLabel = CompressionLabel(*b"zlib");
    pub const BZIP2: CompressionLabel = CompressionLabel(*b"bzp2");
    pub const LZ4: CompressionLabel = CompressionLabel(*b"lz4\0");
    pub const ZSTD: CompressionLabel = CompressionLabel(*b"zstd");

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        CompressionLabel(bytes)
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0; 4]
    }

    /// Parse a label name
    ///
    /// Accepts the on-disk names, a few common aliases and any other ASCII
    /// name of at most four characters (padded with zeros).
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "" | "none" => return Ok(Self::NONE),
            "bzip2" => return Ok(Self::BZIP2),
            "lz4" => return Ok(Self::LZ4),
            _ => {}
        }
        if !name.is_ascii() || name.len() > 4 {
            return Err(AsdfError::UnknownCompression(name.to_string()));
        }
        let mut bytes = [0u8; 4];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(CompressionLabel(bytes))
    }
}

impl fmt::Display for CompressionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(4);
        f.write_str(&String::from_utf8_lossy(&self.0[..end]))
    }
}

impl Serialize for CompressionLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CompressionLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        CompressionLabel::parse(&name).map_err(serde::de::Error::custom)
    }
}

/// A pluggable, stateless block codec
pub trait Compressor: Send + Sync {
    fn label(&self) -> CompressionLabel;

    /// Compress `data`, returning the output as chunks
    fn compress(&self, data: &[u8], options: &CompressionOptions) -> Result<Vec<Vec<u8>>>;

    /// Decompress exactly `data_size` bytes from `data`
    fn decompress(&self, data: &[u8], data_size: usize, options: &CompressionOptions)
        -> Result<Vec<u8>>;
}

fn option_level(options: &CompressionOptions) -> Option<i64> {
    options.get("level").and_then(|v| v.as_i64())
}

fn option_block_size(options: &CompressionOptions) -> usize {
    options
        .get("block_size")
        .and_then(|v| v.as_u64())
        .filter(|&n| n > 0)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_COMPRESSION_BLOCK_SIZE)
}

fn codec_error(label: CompressionLabel, e: impl fmt::Display) -> AsdfError {
    AsdfError::Compression(format!("{} failed: {}", label, e))
}

/// Upper bound on memory reserved from a header's claimed size
const MAX_PREALLOCATION: usize = 1 << 24;

/// Read at most `data_size + 1` bytes so overproduction is detected cheaply
fn read_exact_size(mut reader: impl Read, data_size: usize, label: CompressionLabel) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data_size.min(MAX_PREALLOCATION));
    (&mut reader)
        .take((data_size as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| codec_error(label, e))?;
    check_size(out.len(), data_size, label)?;
    Ok(out)
}

fn check_size(produced: usize, expected: usize, label: CompressionLabel) -> Result<()> {
    if produced != expected {
        return Err(AsdfError::Compression(format!(
            "{} decompressed {} bytes, expected {}",
            label, produced, expected
        )));
    }
    Ok(())
}

/// Feed `data` through an encoder in pieces, draining its output after each
fn compress_with_writer<W: Write>(
    data: &[u8],
    block_size: usize,
    mut encoder: W,
    drain: impl Fn(&mut W) -> Vec<u8>,
    finish: impl FnOnce(W) -> std::io::Result<Vec<u8>>,
    label: CompressionLabel,
) -> Result<Vec<Vec<u8>>> {
    let mut chunks = Vec::new();
    for piece in data.chunks(block_size) {
        encoder.write_all(piece).map_err(|e| codec_error(label, e))?;
        let out = drain(&mut encoder);
        if !out.is_empty() {
            chunks.push(out);
        }
    }
    let tail = finish(encoder).map_err(|e| codec_error(label, e))?;
    if !tail.is_empty() {
        chunks.push(tail);
    }
    Ok(chunks)
}

struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn label(&self) -> CompressionLabel {
        CompressionLabel::ZLIB
    }

    fn compress(&self, data: &[u8], options: &CompressionOptions) -> Result<Vec<Vec<u8>>> {
        let level = match option_level(options) {
            Some(level) => flate2::Compression::new(level.clamp(0, 9) as u32),
            None => flate2::Compression::default(),
        };
        compress_with_writer(
            data,
            option_block_size(options),
            flate2::write::ZlibEncoder::new(Vec::new(), level),
            |enc| std::mem::take(enc.get_mut()),
            |enc| enc.finish(),
            self.label(),
        )
    }

    fn decompress(&self, data: &[u8], data_size: usize, _options: &CompressionOptions) -> Result<Vec<u8>> {
        read_exact_size(flate2::read::ZlibDecoder::new(data), data_size, self.label())
    }
}

struct Bzip2Compressor;

impl Compressor for Bzip2Compressor {
    fn label(&self) -> CompressionLabel {
        CompressionLabel::BZIP2
    }

    fn compress(&self, data: &[u8], options: &CompressionOptions) -> Result<Vec<Vec<u8>>> {
        let level = match option_level(options) {
            Some(level) => bzip2::Compression::new(level.clamp(1, 9) as u32),
            None => bzip2::Compression::best(),
        };
        compress_with_writer(
            data,
            option_block_size(options),
            bzip2::write::BzEncoder::new(Vec::new(), level),
            |enc| std::mem::take(enc.get_mut()),
            |enc| enc.finish(),
            self.label(),
        )
    }

    fn decompress(&self, data: &[u8], data_size: usize, _options: &CompressionOptions) -> Result<Vec<u8>> {
        read_exact_size(bzip2::read::BzDecoder::new(data), data_size, self.label())
    }
}

/// LZ4 block frames: `[len: u32 BE][size-prepended lz4 block]` per piece
struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn label(&self) -> CompressionLabel {
        CompressionLabel::LZ4
    }

    fn compress(&self, data: &[u8], options: &CompressionOptions) -> Result<Vec<Vec<u8>>> {
        let chunks = data
            .chunks(option_block_size(options))
            .map(|piece| {
                let packed = lz4_flex::compress_prepend_size(piece);
                let mut frame = Vec::with_capacity(packed.len() + 4);
                frame.extend_from_slice(&(packed.len() as u32).to_be_bytes());
                frame.extend_from_slice(&packed);
                frame
            })
            .collect();
        Ok(chunks)
    }

    fn decompress(&self, data: &[u8], data_size: usize, _options: &CompressionOptions) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data_size.min(MAX_PREALLOCATION));
        let mut rest = data;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(codec_error(self.label(), "truncated frame length"));
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            let frame = rest
                .get(4..4 + len)
                .ok_or_else(|| codec_error(self.label(), "truncated frame"))?;
            let piece = lz4_flex::decompress_size_prepended(frame)
                .map_err(|e| codec_error(self.label(), e))?;
            out.extend_from_slice(&piece);
            if out.len() > data_size {
                break;
            }
            rest = &rest[4 + len..];
        }
        check_size(out.len(), data_size, self.label())?;
        Ok(out)
    }
}

/// One independent zstd frame per piece
struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn label(&self) -> CompressionLabel {
        CompressionLabel::ZSTD
    }

    fn compress(&self, data: &[u8], options: &CompressionOptions) -> Result<Vec<Vec<u8>>> {
        let level = option_level(options).unwrap_or(3) as i32;
        if data.is_empty() {
            let frame = zstd::bulk::compress(data, level).map_err(|e| codec_error(self.label(), e))?;
            return Ok(vec![frame]);
        }
        data.chunks(option_block_size(options))
            .map(|piece| zstd::bulk::compress(piece, level).map_err(|e| codec_error(self.label(), e)))
            .collect()
    }

    fn decompress(&self, data: &[u8], data_size: usize, _options: &CompressionOptions) -> Result<Vec<u8>> {
        let decoder =
            zstd::stream::read::Decoder::new(data).map_err(|e| codec_error(self.label(), e))?;
        read_exact_size(decoder, data_size, self.label())
    }
}

type Registry = RwLock<HashMap<CompressionLabel, Arc<dyn Compressor>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let builtins: [Arc<dyn Compressor>; 4] = [
            Arc::new(ZlibCompressor),
            Arc::new(Bzip2Compressor),
            Arc::new(Lz4Compressor),
            Arc::new(ZstdCompressor),
        ];
        RwLock::new(builtins.into_iter().map(|c| (c.label(), c)).collect())
    })
}

/// Make a codec available to every document in the process
///
/// A codec registered under an existing label replaces it.
pub fn register_compressor(compressor: Arc<dyn Compressor>) -> Result<()> {
    let label = compressor.label();
    if label.is_none() {
        return Err(AsdfError::Compression(
            "a codec can not use the empty label".to_string(),
        ));
    }
    tracing::debug!("Registering compressor {}", label);
    registry().write().insert(label, compressor);
    Ok(())
}

/// Look up a codec by label
pub fn get_compressor(label: CompressionLabel) -> Result<Arc<dyn Compressor>> {
    registry()
        .read()
        .get(&label)
        .cloned()
        .ok_or_else(|| AsdfError::UnknownCompression(label.to_string()))
}

/// Labels of every registered codec
pub fn available_labels() -> Vec<CompressionLabel> {
    let mut labels: Vec<_> = registry().read().keys().copied().collect();
    labels.sort();
    labels
}

/// Compress a payload with the codec registered for `label`
pub fn compress(data: &[u8], label: CompressionLabel, options: &CompressionOptions) -> Result<Vec<Vec<u8>>> {
    if label.is_none() {
        return Ok(vec![data.to_vec()]);
    }
    get_compressor(label)?.compress(data, options)
}

/// Decompress a payload, requiring exactly `data_size` output bytes
pub fn decompress(
    data: &[u8],
    data_size: usize,
    label: CompressionLabel,
    options: &CompressionOptions,
) -> Result<Vec<u8>> {
    if label.is_none() {
        check_size(data.len(), data_size, label)?;
        return Ok(data.to_vec());
    }
    get_compressor(label)?.decompress(data, data_size, options)
}
