//! Block discovery
//!
//! Blocks are found either through the trailing block index or by walking
//! headers from the end of the tree. The index is only used when the stream
//! is seekable and loading is lazy. Every offset it lists is checked before
//! the index is trusted: the magic must be present, the header must parse,
//! blocks must not overlap and the last block must end where the index
//! starts. Any failure falls back to the serial walk.

use crate::core::block::{read_payload, Block, BlockData};
use crate::core::compression::CompressionOptions;
use crate::core::error::{AsdfError, Result};
use crate::core::format::{BlockHeader, BLOCK_MAGIC};
use crate::core::index::{find_index, read_index, INDEX_HEADER};
use crate::core::io::{read_up_to, skip, ByteStream, StreamHandle};
use std::io::SeekFrom;
use tracing::{debug, warn};

/// How discovered blocks are loaded
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub lazy_load: bool,
    pub memmap: bool,
    pub validate_checksums: bool,
    pub io_block_size: usize,
}

/// Result of block discovery
pub struct Discovery {
    pub blocks: Vec<Block>,
    /// Whether the block index was used
    pub used_index: bool,
}

struct Found {
    header: BlockHeader,
    offset: u64,
    data: Option<BlockData>,
}

/// Discover the blocks following the tree
///
/// The stream must be positioned right after the tree (or after the version
/// lines when the file has no tree).
pub fn read_blocks(handle: &StreamHandle, options: &ReadOptions) -> Result<Discovery> {
    let weak = handle.downgrade();
    let (found, used_index) = handle.with(|stream| {
        let start = stream.position()?;
        let eager = !options.lazy_load || !stream.seekable();
        if !eager {
            match indexed_blocks(stream, start, options.io_block_size) {
                Ok(Some(found)) => return Ok((found, true)),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Failed to use block index, falling back to serial reading: {}",
                        e
                    );
                }
            }
            stream.seek(SeekFrom::Start(start))?;
        }
        Ok((serial_blocks(stream, eager, options)?, false))
    })?;

    debug!(
        "Discovered {} blocks ({})",
        found.len(),
        if used_index { "indexed" } else { "serial" }
    );

    let blocks = found
        .into_iter()
        .enumerate()
        .map(|(i, found)| {
            let validate = i == 0 || options.validate_checksums || !used_index;
            let mut block = Block::from_disk(
                found.header,
                found.offset,
                weak.clone(),
                validate,
                options.memmap,
            );
            if let Some(data) = found.data {
                block.set_loaded(data);
            }
            block
        })
        .collect();
    Ok(Discovery { blocks, used_index })
}

/// Headers listed by a verified block index
fn indexed_blocks(
    stream: &mut dyn ByteStream,
    start: u64,
    block_size: usize,
) -> Result<Option<Vec<Found>>> {
    let Some(index_offset) = find_index(stream, start, block_size)? else {
        return Ok(None);
    };
    let offsets = read_index(stream, index_offset)?;
    if offsets[0] < start {
        return Err(AsdfError::BlockIndex(format!(
            "block offset {} lies inside the tree",
            offsets[0]
        )));
    }

    let mut found = Vec::with_capacity(offsets.len());
    for (i, &offset) in offsets.iter().enumerate() {
        stream.seek(SeekFrom::Start(offset))?;
        let header = BlockHeader::read(stream, offset)?;
        if header.is_streamed() {
            return Err(AsdfError::BlockIndex(format!(
                "streamed block at offset {} listed in index",
                offset
            )));
        }
        let end = (offset + header.total_header_len()).saturating_add(header.allocated_size);
        match offsets.get(i + 1) {
            Some(&next) if end > next => {
                return Err(AsdfError::BlockIndex(format!(
                    "block at offset {} overlaps the next entry",
                    offset
                )));
            }
            None if end != index_offset => {
                return Err(AsdfError::BlockIndex(format!(
                    "last block ends at {} but the index starts at {}",
                    end, index_offset
                )));
            }
            _ => {}
        }
        found.push(Found {
            header,
            offset,
            data: None,
        });
    }
    Ok(Some(found))
}

/// Walk headers one after the other
fn serial_blocks(
    stream: &mut dyn ByteStream,
    eager: bool,
    options: &ReadOptions,
) -> Result<Vec<Found>> {
    let codec_options = CompressionOptions::new();
    let mut found: Vec<Found> = Vec::new();
    loop {
        let offset = stream.position()?;
        let magic = read_up_to(stream, BLOCK_MAGIC.len())?;
        if magic.is_empty() {
            break;
        }
        if magic.len() < BLOCK_MAGIC.len() {
            if magic.iter().any(|&b| b != 0) {
                warn!(
                    "Read invalid bytes {:?} after blocks, the file might be corrupt",
                    magic
                );
            }
            break;
        }
        if magic[..] == INDEX_HEADER[..BLOCK_MAGIC.len()] {
            break;
        }

        if magic[..] == BLOCK_MAGIC {
            stream.unread(&magic)?;
            let header = BlockHeader::read(stream, offset)?;
            let data_offset = offset + header.total_header_len();
            debug!(
                "Block at offset {}: used {} of {} bytes",
                offset, header.used_size, header.allocated_size
            );
            let data = if eager {
                Some(read_payload(
                    stream,
                    &header,
                    data_offset,
                    options.memmap,
                    &codec_options,
                )?)
            } else {
                None
            };
            let streamed = header.is_streamed();
            found.push(Found {
                header,
                offset,
                data,
            });
            // the streamed block runs to end of file
            if streamed {
                break;
            }
            let block_end = data_offset.saturating_add(header.allocated_size);
            if stream.seekable() {
                stream.seek(SeekFrom::Start(block_end))?;
            } else {
                let pos = stream.position()?;
                skip(stream, block_end - pos)?;
            }
            continue;
        }

        if !found.is_empty() || magic[0] != 0 {
            return Err(AsdfError::Format(format!(
                "Invalid bytes while reading blocks at offset {}",
                offset
            )));
        }
        // zero padding between the tree and the first block
        let mut chunk = magic;
        chunk.extend_from_slice(&read_up_to(stream, options.io_block_size)?);
        if let Some(first) = chunk.iter().position(|&b| b != 0) {
            stream.unread(&chunk[first..])?;
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checksum;
    use crate::core::format::BlockHeader;
    use crate::core::index::index_bytes;
    use crate::core::io::{InputStream, MemoryStream};
    use std::io::Cursor;

    fn raw_block(payload: &[u8], allocated: u64) -> Vec<u8> {
        let n = payload.len() as u64;
        let header = BlockHeader::new([0; 4], allocated, n, n, checksum::compute(payload));
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes.resize(bytes.len() + (allocated - n) as usize, 0);
        bytes
    }

    fn options(lazy: bool) -> ReadOptions {
        ReadOptions {
            lazy_load: lazy,
            memmap: false,
            validate_checksums: false,
            io_block_size: 64,
        }
    }

    fn file_with_blocks(index: Option<Vec<u64>>) -> Vec<u8> {
        let mut bytes = vec![0u8; 10];
        bytes.extend_from_slice(&raw_block(b"first", 8));
        bytes.extend_from_slice(&raw_block(b"second", 6));
        if let Some(offsets) = index {
            bytes.extend_from_slice(&index_bytes(&offsets));
        }
        bytes
    }

    fn contents(discovery: &mut Discovery) -> Vec<Vec<u8>> {
        discovery
            .blocks
            .iter_mut()
            .map(|b| b.materialize().unwrap().to_vec().unwrap())
            .collect()
    }

    #[test]
    fn test_serial_scan_skips_padding() {
        let handle = StreamHandle::new(Box::new(MemoryStream::from_bytes(file_with_blocks(None))));
        let mut discovery = read_blocks(&handle, &options(true)).unwrap();
        assert!(!discovery.used_index);
        assert_eq!(discovery.blocks[0].offset(), Some(10));
        assert_eq!(discovery.blocks[1].offset(), Some(10 + 54 + 8));
        assert_eq!(contents(&mut discovery), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_index_is_used() {
        let bytes = file_with_blocks(Some(vec![10, 72]));
        let handle = StreamHandle::new(Box::new(MemoryStream::from_bytes(bytes)));
        let mut discovery = read_blocks(&handle, &options(true)).unwrap();
        assert!(discovery.used_index);
        assert!(!discovery.blocks[1].is_loaded());
        assert_eq!(contents(&mut discovery)[1], b"second");
    }

    #[test]
    fn test_stale_index_falls_back() {
        for stale in [vec![10, 70], vec![10], vec![11, 72], vec![72, 200]] {
            let bytes = file_with_blocks(Some(stale.clone()));
            let handle = StreamHandle::new(Box::new(MemoryStream::from_bytes(bytes)));
            let mut discovery = read_blocks(&handle, &options(true)).unwrap();
            assert!(!discovery.used_index, "index {:?} should be rejected", stale);
            assert_eq!(discovery.blocks.len(), 2);
            assert_eq!(contents(&mut discovery)[0], b"first");
        }
    }

    #[test]
    fn test_eager_load_from_pipe() {
        let stream = InputStream::new(Cursor::new(file_with_blocks(Some(vec![10, 72]))));
        let handle = StreamHandle::new(Box::new(stream));
        let discovery = read_blocks(&handle, &options(true)).unwrap();
        assert!(!discovery.used_index);
        assert!(discovery.blocks.iter().all(Block::is_loaded));
        handle.close();
        let mut blocks = discovery.blocks;
        assert_eq!(&blocks[1].materialize().unwrap().bytes().unwrap()[..], b"second");
    }

    #[test]
    fn test_garbage_between_blocks() {
        let mut bytes = raw_block(b"first", 5);
        bytes.extend_from_slice(b"JUNK");
        bytes.extend_from_slice(&raw_block(b"second", 6));
        let handle = StreamHandle::new(Box::new(MemoryStream::from_bytes(bytes)));
        let err = read_blocks(&handle, &options(false)).err().unwrap();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_streamed_block_runs_to_end() {
        let mut bytes = raw_block(b"first", 5);
        bytes.extend_from_slice(&BlockHeader::streamed().to_bytes());
        bytes.extend_from_slice(b"appended data");
        let handle = StreamHandle::new(Box::new(MemoryStream::from_bytes(bytes)));
        let mut discovery = read_blocks(&handle, &options(true)).unwrap();
        assert_eq!(discovery.blocks.len(), 2);
        assert!(discovery.blocks[1].header().unwrap().is_streamed());
        assert_eq!(contents(&mut discovery)[1], b"appended data");
    }

    #[test]
    fn test_first_block_checksum_is_always_checked() {
        let mut bytes = file_with_blocks(Some(vec![10, 72]));
        bytes[10 + 54] ^= 0xFF;
        let handle = StreamHandle::new(Box::new(MemoryStream::from_bytes(bytes)));
        let mut discovery = read_blocks(&handle, &options(true)).unwrap();
        assert!(matches!(
            discovery.blocks[0].materialize(),
            Err(AsdfError::ChecksumMismatch { offset: 10 })
        ));
        assert_eq!(&discovery.blocks[1].materialize().unwrap().bytes().unwrap()[..], b"second");
    }
}
