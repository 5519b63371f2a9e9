//! File-level tooling
//!
//! Each operation opens a document read-only and writes it to a new
//! location with storage or compression overrides; the block layer does
//! the rest.

use crate::core::block::ArrayStorage;
use crate::core::compression::CompressionLabel;
use crate::core::error::Result;
use crate::core::format::Padding;
use crate::{AsdfFile, WriteOptions};
use std::path::Path;
use tracing::info;

/// Rewrite `input` to `output` without padding, optionally recompressing
/// every block
pub fn defragment<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    compression: Option<CompressionLabel>,
) -> Result<()> {
    info!("Defragmenting {:?} into {:?}", input.as_ref(), output.as_ref());
    let mut doc = AsdfFile::open(input)?;
    let mut options = WriteOptions::new().pad_blocks(Padding::None);
    if let Some(label) = compression {
        options = options.all_array_compression(label);
    }
    doc.write_to(output, &options)
}

/// Move every array into its own external file next to `output`
pub fn explode<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Result<()> {
    info!("Exploding {:?} into {:?}", input.as_ref(), output.as_ref());
    let mut doc = AsdfFile::open(input)?;
    doc.write_to(output, &WriteOptions::new().all_array_storage(ArrayStorage::External))
}

/// Pull every array, external ones included, into `output`
pub fn implode<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Result<()> {
    info!("Imploding {:?} into {:?}", input.as_ref(), output.as_ref());
    let mut doc = AsdfFile::open(input)?;
    doc.write_to(output, &WriteOptions::new().all_array_storage(ArrayStorage::Internal))
}
