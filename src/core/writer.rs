//! Block serialization
//!
//! Payloads are encoded (compressed and digested) before anything is
//! written, so the exact on-disk size of every block is known up front.

use crate::core::block::BlockData;
use crate::core::checksum;
use crate::core::compression::{self, CompressionLabel, CompressionOptions};
use crate::core::error::{AsdfError, Result};
use crate::core::format::{calculate_padding, BlockHeader, Padding, BLOCK_PREAMBLE};
use crate::core::io::{write_zeros, ByteStream};
use std::io::Write;

enum EncodedPayload {
    Raw(BlockData),
    Chunks(Vec<Vec<u8>>),
}

/// A block ready to be written: header fields plus on-disk payload bytes
pub struct EncodedBlock {
    header: BlockHeader,
    payload: EncodedPayload,
}

impl EncodedBlock {
    /// Compress and digest `data`
    pub fn encode(data: &BlockData, label: CompressionLabel, options: &CompressionOptions) -> Result<Self> {
        let bytes = data.bytes()?;
        let digest = checksum::compute(&bytes);
        let payload = if label.is_none() {
            EncodedPayload::Raw(data.clone())
        } else {
            EncodedPayload::Chunks(compression::compress(&bytes, label, options)?)
        };
        let used = match &payload {
            EncodedPayload::Raw(raw) => raw.len() as u64,
            EncodedPayload::Chunks(chunks) => chunks.iter().map(|c| c.len() as u64).sum(),
        };
        Ok(EncodedBlock {
            header: BlockHeader::new(label.as_bytes(), used, used, data.len() as u64, digest),
            payload,
        })
    }

    /// Reuse already-encoded bytes read from disk
    pub fn from_raw(header: &BlockHeader, payload: Vec<u8>) -> Self {
        let used = payload.len() as u64;
        EncodedBlock {
            header: BlockHeader::new(header.compression, used, used, header.data_size, header.checksum),
            payload: EncodedPayload::Chunks(vec![payload]),
        }
    }

    pub fn used_size(&self) -> u64 {
        self.header.used_size
    }

    /// Header and payload bytes, without padding
    pub fn total_size(&self) -> u64 {
        BLOCK_PREAMBLE + self.used_size()
    }

    /// Header as written with `allocated` payload bytes
    pub fn header(&self, allocated: u64) -> BlockHeader {
        BlockHeader {
            allocated_size: allocated,
            ..self.header
        }
    }

    /// Write header, payload and zero fill up to `allocated`
    pub fn write(&self, stream: &mut dyn ByteStream, allocated: u64) -> Result<BlockHeader> {
        if allocated < self.used_size() {
            return Err(AsdfError::Format(format!(
                "allocated size {} is smaller than used size {}",
                allocated,
                self.used_size()
            )));
        }
        let header = self.header(allocated);
        stream.write_all(&header.to_bytes())?;
        match &self.payload {
            EncodedPayload::Raw(data) => stream.write_all(&data.bytes()?)?,
            EncodedPayload::Chunks(chunks) => {
                for chunk in chunks {
                    stream.write_all(chunk)?;
                }
            }
        }
        write_zeros(stream, allocated - self.used_size())?;
        Ok(header)
    }
}

/// Write blocks back to back from the current position
///
/// Returns the offset and header of each block.
pub fn write_blocks(
    stream: &mut dyn ByteStream,
    blocks: &[EncodedBlock],
    padding: Padding,
    io_block_size: usize,
) -> Result<Vec<(u64, BlockHeader)>> {
    let mut written = Vec::with_capacity(blocks.len());
    for block in blocks {
        let offset = stream.position()?;
        let allocated = block.used_size() + calculate_padding(block.used_size(), padding, io_block_size);
        let header = block.write(stream, allocated)?;
        tracing::debug!(
            "Wrote block at offset {} ({} used, {} allocated)",
            offset,
            header.used_size,
            header.allocated_size
        );
        written.push((offset, header));
    }
    Ok(written)
}

/// Write the streamed block header followed by its current data
pub fn write_streamed(stream: &mut dyn ByteStream, data: &[u8]) -> Result<(u64, BlockHeader)> {
    let offset = stream.position()?;
    let header = BlockHeader::streamed();
    stream.write_all(&header.to_bytes())?;
    stream.write_all(data)?;
    Ok((offset, header))
}
