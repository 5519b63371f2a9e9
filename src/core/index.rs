//! Trailing block index
//!
//! ```text
//! #ASDF BLOCK INDEX
//! %YAML 1.1
//! ---
//! - 1024
//! - 9000
//! ...
//! ```
//!
//! The index lists the offset of every internal block's magic. It is an
//! optimization only: readers verify every listed offset before trusting it.

use crate::core::error::{AsdfError, Result};
use crate::core::io::{read_to_end, read_up_to, ByteStream};
use std::io::{SeekFrom, Write};

pub const INDEX_HEADER: &[u8] = b"#ASDF BLOCK INDEX";

/// Serialized index for `offsets`
pub fn index_bytes(offsets: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + offsets.len() * 12);
    out.extend_from_slice(INDEX_HEADER);
    out.extend_from_slice(b"\n%YAML 1.1\n---\n");
    for offset in offsets {
        out.extend_from_slice(format!("- {}\n", offset).as_bytes());
    }
    out.extend_from_slice(b"...\n");
    out
}

/// Write an index at the current position
pub fn write_index(stream: &mut dyn ByteStream, offsets: &[u64]) -> Result<()> {
    stream.write_all(&index_bytes(offsets))?;
    Ok(())
}

/// Locate the index header, scanning backwards from end of file
///
/// Returns `None` when no header exists at or after `min_offset`.
pub fn find_index(
    stream: &mut dyn ByteStream,
    min_offset: u64,
    block_size: usize,
) -> Result<Option<u64>> {
    let end = stream.seek(SeekFrom::End(0))?;
    if end <= min_offset {
        return Ok(None);
    }
    let block_size = (block_size.max(INDEX_HEADER.len())) as u64;
    let mut window_end = end;
    let mut window_start = if end % block_size == 0 {
        end - block_size
    } else {
        end - end % block_size
    }
    .max(min_offset);
    // head of the previous (later) window, to catch a header split across windows
    let mut carry: Vec<u8> = Vec::new();

    loop {
        stream.seek(SeekFrom::Start(window_start))?;
        let mut buffer = read_up_to(stream, (window_end - window_start) as usize)?;
        buffer.extend_from_slice(&carry);
        if let Some(pos) = rfind(&buffer, INDEX_HEADER) {
            return Ok(Some(window_start + pos as u64));
        }
        if window_start <= min_offset {
            return Ok(None);
        }
        buffer.truncate(INDEX_HEADER.len() - 1);
        carry = buffer;
        window_end = window_start;
        window_start = window_start.saturating_sub(block_size).max(min_offset);
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Parse the index at `offset`
///
/// The list must be non-empty and strictly increasing.
pub fn read_index(stream: &mut dyn ByteStream, offset: u64) -> Result<Vec<u64>> {
    stream.seek(SeekFrom::Start(offset))?;
    let raw = read_to_end(stream)?;
    let body = raw.strip_prefix(INDEX_HEADER).ok_or_else(|| {
        AsdfError::BlockIndex(format!("Failed to read block index header at offset {}", offset))
    })?;
    let text = std::str::from_utf8(body)
        .map_err(|_| AsdfError::BlockIndex("block index is not valid UTF-8".to_string()))?;

    let mut offsets = Vec::new();
    let mut started = false;
    let mut finished = false;
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() || line.starts_with('%') {
            continue;
        }
        if line == "---" {
            started = true;
            continue;
        }
        if line == "..." {
            finished = true;
            break;
        }
        let value = line
            .strip_prefix("- ")
            .filter(|_| started)
            .ok_or_else(|| AsdfError::BlockIndex(format!("unexpected line {:?}", line)))?;
        let value: u64 = value
            .trim()
            .parse()
            .map_err(|_| AsdfError::BlockIndex(format!("invalid offset {:?}", value)))?;
        offsets.push(value);
    }

    if !finished {
        return Err(AsdfError::BlockIndex("unterminated block index".to_string()));
    }
    if offsets.is_empty() {
        return Err(AsdfError::BlockIndex("empty block index".to_string()));
    }
    if offsets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(AsdfError::BlockIndex(
            "block index offsets are not increasing".to_string(),
        ));
    }
    Ok(offsets)
}
