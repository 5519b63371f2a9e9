//! # asdf-rs - Block Storage for ASDF Documents
//!
//! `asdf-rs` reads and writes the binary side of ASDF files: the blocks that
//! follow the YAML tree. It provides:
//!
//! - **Lazy block loading** through the trailing block index, with a serial
//!   scan as fallback
//! - **Pluggable compression** (zlib, bzip2, LZ4 and Zstd builtin)
//! - **MD5 checksums** validated on first access
//! - **In-place updates** that keep unchanged blocks where they are
//! - **External blocks** stored in sibling files, cached per document
//! - **Streamed blocks** for writing to pipes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use asdf_rs::{AsdfFile, OpenMode, OpenOptions, Result, WriteOptions};
//!
//! # fn main() -> Result<()> {
//! let mut doc = AsdfFile::new();
//! let a = doc.add_array(vec![0u8; 1024]);
//! doc.meta_mut()["instrument"] = "camera".into();
//! doc.write_to("data.asdf", &WriteOptions::new())?;
//!
//! let mut doc = OpenOptions::new().mode(OpenMode::ReadWrite).open("data.asdf")?;
//! doc.array_mut(a)?[0] = 42;
//! doc.update(&WriteOptions::new())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Compression and Storage
//!
//! ```rust,no_run
//! use asdf_rs::{ArrayStorage, AsdfFile, CompressionLabel, CompressionOptions, Result, WriteOptions};
//!
//! # fn main() -> Result<()> {
//! let mut doc = AsdfFile::new();
//! let big = doc.add_array(vec![7u8; 1 << 20]);
//! let log = doc.add_array(b"appended later".to_vec());
//! doc.set_array_compression(big, CompressionLabel::ZSTD, CompressionOptions::new())?;
//! doc.set_array_storage(log, ArrayStorage::Streamed)?;
//! doc.write_to("compressed.asdf", &WriteOptions::new())?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod ops;
pub mod tree;

// Re-export core types that users need
pub use crate::core::{
    block::{ArrayStorage, BlockData, ChecksumMode, DataRef},
    compression::{register_compressor, CompressionLabel, CompressionOptions, Compressor},
    config::{config_context, get_config, set_global_config, AsdfConfig, ConfigGuard},
    error::{AsdfError, Result},
    format::Padding,
    io::{ByteStream, FileStream, InputStream, MemoryStream, OutputStream},
    manager::{BlockId, BlockManager, UpdateOutcome, WriteSettings},
};

use crate::core::format::{read_tree, FileHeader};
use crate::core::io::{write_atomic, StreamHandle};
use crate::core::reader::ReadOptions;
use crate::core::manager::{SourceMap, WritePlan};
use crate::tree::{parse_tree, render_tree, BlockBinder, ParsedTree};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};
use url::Url;

/// Handle to an array of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(usize);

impl ArrayId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Access mode for [`OpenOptions::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    Read,
    ReadWrite,
}

/// Options for opening a document
///
/// Unset options fall back to the effective configuration ([`get_config`])
/// of the calling thread.
///
/// # Examples
///
/// ```rust,no_run
/// use asdf_rs::{OpenMode, OpenOptions};
///
/// let doc = OpenOptions::new()
///     .mode(OpenMode::Read)
///     .lazy_load(false)
///     .validate_checksums(true)
///     .open("data.asdf")?;
/// # Ok::<(), asdf_rs::AsdfError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    mode: OpenMode,
    lazy_load: Option<bool>,
    memmap: Option<bool>,
    copy_arrays: bool,
    validate_checksums: Option<bool>,
    config: Option<AsdfConfig>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Defer reading payloads until they are accessed
    pub fn lazy_load(mut self, lazy_load: bool) -> Self {
        self.lazy_load = Some(lazy_load);
        self
    }

    /// Memory map uncompressed payloads (read-only documents only)
    pub fn memmap(mut self, memmap: bool) -> Self {
        self.memmap = Some(memmap);
        self
    }

    /// Always copy payloads into memory
    pub fn copy_arrays(mut self, copy_arrays: bool) -> Self {
        self.copy_arrays = copy_arrays;
        self
    }

    /// Validate every block checksum, not only the first block's
    pub fn validate_checksums(mut self, validate: bool) -> Self {
        self.validate_checksums = Some(validate);
        self
    }

    /// Use `config` instead of the thread's effective configuration
    pub fn config(mut self, config: AsdfConfig) -> Self {
        self.config = Some(config);
        self
    }

    fn effective_config(&self) -> Result<AsdfConfig> {
        let mut config = self.config.clone().unwrap_or_else(get_config);
        if let Some(lazy_load) = self.lazy_load {
            config.lazy_load = lazy_load;
        }
        if let Some(memmap) = self.memmap {
            config.memmap = memmap;
        }
        if let Some(validate) = self.validate_checksums {
            config.validate_checksums = validate;
        }
        if self.copy_arrays {
            config.memmap = false;
        }
        config.check()?;
        Ok(config)
    }

    /// Open the file at `path`
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<AsdfFile> {
        let path = path.as_ref();
        info!("Opening ASDF file {:?} ({:?})", path, self.mode);
        let config = self.effective_config()?;
        let stream = FileStream::open(path, self.mode == OpenMode::ReadWrite)?
            .with_block_size(config.io_block_size);
        let uri = file_url(path)?;
        self.open_stream(Box::new(stream), Some(uri))
    }

    /// Open a document from any stream
    ///
    /// `uri` is the location external blocks are resolved against.
    pub fn open_stream(&self, stream: Box<dyn ByteStream>, uri: Option<Url>) -> Result<AsdfFile> {
        let mut config = self.effective_config()?;
        if config.memmap && stream.writable() {
            warn!("Memory mapping is not used for documents opened for update");
            config.memmap = false;
        }

        let handle = StreamHandle::new(stream);
        let tree = handle.with(|s| {
            FileHeader::read(s)?;
            read_tree(s, config.io_block_size)
        })?;
        let parsed = match tree {
            Some(bytes) => parse_tree(&bytes)?,
            None => ParsedTree::default(),
        };

        let read = ReadOptions {
            lazy_load: config.lazy_load,
            memmap: config.memmap,
            validate_checksums: config.validate_checksums,
            io_block_size: config.io_block_size,
        };
        let mut blocks = BlockManager::open(handle, uri, &config, &read)?;
        let arrays = {
            let mut binder = BlockBinder::new(&mut blocks);
            parsed
                .shells
                .into_iter()
                .map(|shell| shell.finalize(&mut binder).map(Some))
                .collect::<Result<Vec<_>>>()?
        };
        debug!("Bound {} arrays to {} blocks", arrays.len(), blocks.len());

        Ok(AsdfFile {
            meta: parsed.meta,
            arrays,
            blocks,
            config,
        })
    }
}

/// Options for [`AsdfFile::write_to`] and [`AsdfFile::update`]
///
/// Unset options fall back to the document's configuration.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    all_array_storage: Option<ArrayStorage>,
    all_array_compression: Option<CompressionLabel>,
    compression_options: Option<CompressionOptions>,
    pad_blocks: Option<Padding>,
    include_block_index: Option<bool>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store every array the same way for this write
    pub fn all_array_storage(mut self, storage: ArrayStorage) -> Self {
        self.all_array_storage = Some(storage);
        self
    }

    /// Compress every binary block with `label` for this write
    pub fn all_array_compression(mut self, label: CompressionLabel) -> Self {
        self.all_array_compression = Some(label);
        self
    }

    pub fn compression_options(mut self, options: CompressionOptions) -> Self {
        self.compression_options = Some(options);
        self
    }

    pub fn pad_blocks(mut self, padding: Padding) -> Self {
        self.pad_blocks = Some(padding);
        self
    }

    pub fn include_block_index(mut self, include: bool) -> Self {
        self.include_block_index = Some(include);
        self
    }

    fn settings(&self, config: &AsdfConfig) -> Result<WriteSettings> {
        if self.all_array_storage == Some(ArrayStorage::Streamed) {
            return Err(AsdfError::StorageConstraint(
                "all_array_storage can not be 'streamed'".to_string(),
            ));
        }
        let mut settings = WriteSettings::from_config(config);
        if self.all_array_storage.is_some() {
            settings.all_array_storage = self.all_array_storage;
        }
        if self.all_array_compression.is_some() {
            settings.all_array_compression = self.all_array_compression;
        }
        if self.compression_options.is_some() {
            settings.compression_options = self.compression_options.clone();
        }
        if let Some(padding) = self.pad_blocks {
            padding.check()?;
            settings.pad_blocks = padding;
        }
        if let Some(include) = self.include_block_index {
            settings.include_block_index = include;
        }
        Ok(settings)
    }
}

/// An ASDF document: user metadata, arrays and the blocks behind them
///
/// Arrays are handles to blocks; views share the block of the array they
/// were made from. The document owns its stream and releases it on
/// [`close`](AsdfFile::close) or drop, after which array data can no longer
/// be read.
pub struct AsdfFile {
    meta: Value,
    arrays: Vec<Option<BlockId>>,
    blocks: BlockManager,
    config: AsdfConfig,
}

impl Default for AsdfFile {
    fn default() -> Self {
        Self::new()
    }
}

impl AsdfFile {
    /// Empty document using the thread's effective configuration
    pub fn new() -> Self {
        Self::with_config(get_config())
    }

    pub fn with_config(config: AsdfConfig) -> Self {
        AsdfFile {
            meta: Value::Null,
            arrays: Vec::new(),
            blocks: BlockManager::new(&config),
            config,
        }
    }

    /// Open the file at `path` read-only
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use asdf_rs::AsdfFile;
    ///
    /// let mut doc = AsdfFile::open("data.asdf")?;
    /// for id in doc.array_ids() {
    ///     println!("{:?}: {} bytes", id, doc.array(id)?.len());
    /// }
    /// # Ok::<(), asdf_rs::AsdfError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    /// Open a document held in memory (writable, so it can be updated)
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        OpenOptions::new().open_stream(Box::new(MemoryStream::from_bytes(bytes)), None)
    }

    /// Open a document from a non-seekable reader such as a pipe
    ///
    /// Every block is read while opening.
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Result<Self> {
        OpenOptions::new().open_stream(Box::new(InputStream::new(reader)), None)
    }

    pub fn config(&self) -> &AsdfConfig {
        &self.config
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.blocks
    }

    /// User metadata stored in the tree
    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Value {
        &mut self.meta
    }

    fn block_of(&self, id: ArrayId) -> Result<BlockId> {
        self.arrays
            .get(id.0)
            .copied()
            .flatten()
            .ok_or(AsdfError::InvalidArray(id.0))
    }

    pub fn add_array(&mut self, data: Vec<u8>) -> ArrayId {
        let block = self.blocks.add_block(data);
        self.arrays.push(Some(block));
        ArrayId(self.arrays.len() - 1)
    }

    /// New array sharing the block of `base`
    pub fn add_view(&mut self, base: ArrayId) -> Result<ArrayId> {
        let block = self.block_of(base)?;
        self.arrays.push(Some(block));
        Ok(ArrayId(self.arrays.len() - 1))
    }

    pub fn remove_array(&mut self, id: ArrayId) -> Result<()> {
        let block = self.block_of(id)?;
        self.arrays[id.0] = None;
        if !self.arrays.iter().flatten().any(|&b| b == block) {
            self.blocks.release(block);
        }
        Ok(())
    }

    pub fn array_ids(&self) -> Vec<ArrayId> {
        self.arrays
            .iter()
            .enumerate()
            .filter(|(_, block)| block.is_some())
            .map(|(i, _)| ArrayId(i))
            .collect()
    }

    /// Array bytes, read from disk on first access
    ///
    /// Memory-mapped arrays stop being readable once the document closes.
    pub fn array(&mut self, id: ArrayId) -> Result<BlockData> {
        let block = self.block_of(id)?;
        self.blocks.data(block)
    }

    /// Mutable array bytes; views of the same block see the change
    pub fn array_mut(&mut self, id: ArrayId) -> Result<&mut Vec<u8>> {
        let block = self.block_of(id)?;
        self.blocks.data_mut(block)
    }

    pub fn set_array(&mut self, id: ArrayId, data: Vec<u8>) -> Result<()> {
        let block = self.block_of(id)?;
        self.blocks.set_data(block, data)
    }

    /// Storage the array will be written with (unassigned arrays are internal)
    pub fn get_array_storage(&self, id: ArrayId) -> Result<ArrayStorage> {
        let block = self.block_of(id)?;
        Ok(self.blocks.storage(block)?.unwrap_or(ArrayStorage::Internal))
    }

    /// Choose how an array is stored
    ///
    /// Fails with [`AsdfError::StorageConstraint`] when another array is
    /// already streamed; nothing changes in that case.
    pub fn set_array_storage(&mut self, id: ArrayId, storage: ArrayStorage) -> Result<()> {
        let block = self.block_of(id)?;
        self.blocks.set_storage(block, storage)
    }

    pub fn get_array_compression(&self, id: ArrayId) -> Result<CompressionLabel> {
        let block = self.block_of(id)?;
        self.blocks.compression(block)
    }

    pub fn set_array_compression(
        &mut self,
        id: ArrayId,
        label: CompressionLabel,
        options: CompressionOptions,
    ) -> Result<()> {
        let block = self.block_of(id)?;
        self.blocks.set_compression(block, label, options)
    }

    fn live_blocks(&self) -> Vec<BlockId> {
        self.arrays.iter().flatten().copied().collect()
    }

    fn lengths(&self, blocks: &[BlockId]) -> HashMap<BlockId, u64> {
        blocks
            .iter()
            .filter_map(|&id| {
                let len = self.blocks.block(id).ok()?.data_len()?;
                Some((id, len))
            })
            .collect()
    }

    fn prepare(&mut self, settings: &WriteSettings, uri: Option<&Url>) -> Result<(WritePlan, Vec<u8>)> {
        let live = self.live_blocks();
        let plan = self.blocks.plan(&live, settings, uri)?;
        let lengths = self.lengths(&live);
        let tree = render_tree(&self.meta, &live, &lengths, plan.sources())?;
        Ok((plan, tree))
    }

    /// Write the document to `path`
    ///
    /// The file is written next to its destination and renamed over it, so
    /// writing to the path the document was opened from is safe. A document
    /// opened for update that writes over its own file is rebound to the new
    /// file; otherwise it stays bound to the file it was opened from.
    pub fn write_to<P: AsRef<Path>>(&mut self, path: P, options: &WriteOptions) -> Result<()> {
        let path = path.as_ref();
        info!("Writing ASDF file {:?}", path);
        let uri = file_url(path)?;
        let settings = options.settings(&self.config)?;
        let (plan, tree) = self.prepare(&settings, Some(&uri))?;
        if self.blocks.is_bound_to(path)? {
            debug!("Target is the document's own file, rebinding after the write");
            return self.blocks.write_over(&tree, &plan, &settings);
        }
        let blocks = &mut self.blocks;
        write_atomic(path, |out| {
            blocks.write_to(out, &tree, &plan, &settings)?;
            Ok(())
        })
    }

    /// Write the document to a stream
    ///
    /// `uri` names the destination; it is required when arrays are stored
    /// externally. Streams that can not seek get no block index.
    pub fn write_to_stream(
        &mut self,
        out: &mut dyn ByteStream,
        uri: Option<&Url>,
        options: &WriteOptions,
    ) -> Result<()> {
        let settings = options.settings(&self.config)?;
        let (plan, tree) = self.prepare(&settings, uri)?;
        self.blocks.write_to(out, &tree, &plan, &settings)?;
        Ok(())
    }

    /// Write changes back into the file the document was opened from
    pub fn update(&mut self, options: &WriteOptions) -> Result<UpdateOutcome> {
        let settings = options.settings(&self.config)?;
        let live = self.live_blocks();
        let lengths = self.lengths(&live);
        let meta = &self.meta;
        let render = |sources: &SourceMap| render_tree(meta, &live, &lengths, sources);
        let outcome = self.blocks.update(&live, &render, &settings)?;
        info!("Update finished: {:?}", outcome);
        Ok(outcome)
    }

    /// Release the underlying stream
    pub fn close(&mut self) {
        self.blocks.close();
    }

    pub fn is_closed(&self) -> bool {
        self.blocks.is_closed()
    }
}

impl Drop for AsdfFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// `file://` URL for a possibly relative path
fn file_url(path: &Path) -> Result<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute)
        .map_err(|_| AsdfError::Uri(format!("can not build a file URI for {:?}", absolute)))
}
