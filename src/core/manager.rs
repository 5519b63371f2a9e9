//! Block manager
//!
//! One [`BlockManager`] owns the blocks of one open document. Blocks live in
//! an arena addressed by [`BlockId`]; ids stay valid across writes while
//! on-disk offsets and block indices change. The tree refers to blocks only
//! through the [`Source`] values produced when a write is planned.
//!
//! Writing happens in two steps:
//!
//! 1. [`BlockManager::plan`] decides the storage and compression of every
//!    block referenced by the tree and assigns sources
//! 2. [`BlockManager::write_to`] or [`BlockManager::update`] put the bytes on
//!    disk
//!
//! **Update strategy**: blocks whose bytes on disk are still current stay
//! where they are, modified blocks reuse their old slot when they fit, and
//! everything else goes into gaps or after the last block. Every read
//! (payloads, relocated bytes, streamed data) happens before the first write,
//! and the tree is written last. When no block can stay in place the file is
//! rewritten into a temporary sibling and renamed over the original.

use crate::core::block::{ArrayStorage, Block, BlockData};
use crate::core::compression::{CompressionLabel, CompressionOptions};
use crate::core::config::AsdfConfig;
use crate::core::error::{AsdfError, Result};
use crate::core::external::{ExternalBlockCache, ExternalData};
use crate::core::format::{
    calculate_padding, wrap_tree, BlockHeader, FileHeader, Padding, MAX_BLOCKS_DIGITS,
};
use crate::core::index::write_index;
use crate::core::io::{
    read_exact_vec, write_atomic, write_zeros, ByteStream, FileStream, MemoryStream, StreamHandle,
};
use crate::core::layout::{layout, BlockState, Placement, Region};
use crate::core::reader::{read_blocks, ReadOptions};
use crate::core::writer::{write_blocks, write_streamed, EncodedBlock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::SeekFrom;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use url::Url;

/// Stable handle to a block in a [`BlockManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// How the tree refers to a block in a written file
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Position among the file's internal blocks
    Internal(usize),
    /// The trailing streamed block (written as `-1`)
    Streamed,
    /// Relative URI of a sibling file
    External(String),
    /// Payload embedded in the tree
    Inline(BlockData),
}

pub type SourceMap = BTreeMap<BlockId, Source>;

/// Per-write options
#[derive(Debug, Clone)]
pub struct WriteSettings {
    /// Storage override for every block
    pub all_array_storage: Option<ArrayStorage>,
    /// Compression override for every binary block
    pub all_array_compression: Option<CompressionLabel>,
    /// Codec options override
    pub compression_options: Option<CompressionOptions>,
    pub array_inline_threshold: Option<usize>,
    pub pad_blocks: Padding,
    pub include_block_index: bool,
    pub io_block_size: usize,
}

impl WriteSettings {
    pub fn from_config(config: &AsdfConfig) -> Self {
        WriteSettings {
            all_array_storage: config.all_array_storage,
            all_array_compression: config.all_array_compression,
            compression_options: None,
            array_inline_threshold: config.array_inline_threshold,
            pad_blocks: config.pad_blocks,
            include_block_index: config.include_block_index,
            io_block_size: config.io_block_size,
        }
    }
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self::from_config(&AsdfConfig::default())
    }
}

/// Storage, compression and sources decided for one write
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    /// Internal blocks in on-disk order
    pub internal: Vec<BlockId>,
    pub streamed: Option<BlockId>,
    pub external: Vec<BlockId>,
    pub inline: Vec<BlockId>,
    codecs: HashMap<BlockId, (CompressionLabel, CompressionOptions)>,
    sources: SourceMap,
    uri: Option<Url>,
}

impl WritePlan {
    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    pub fn source(&self, id: BlockId) -> Option<&Source> {
        self.sources.get(&id)
    }

    pub fn storage(&self, id: BlockId) -> Option<ArrayStorage> {
        match self.sources.get(&id)? {
            Source::Internal(_) => Some(ArrayStorage::Internal),
            Source::Streamed => Some(ArrayStorage::Streamed),
            Source::External(_) => Some(ArrayStorage::External),
            Source::Inline(_) => Some(ArrayStorage::Inline),
        }
    }

    pub fn compression(&self, id: BlockId) -> CompressionLabel {
        self.codecs
            .get(&id)
            .map(|(label, _)| *label)
            .unwrap_or(CompressionLabel::NONE)
    }

    fn codec(&self, id: BlockId) -> (CompressionLabel, &CompressionOptions) {
        static NO_OPTIONS: std::sync::OnceLock<CompressionOptions> = std::sync::OnceLock::new();
        match self.codecs.get(&id) {
            Some((label, options)) => (*label, options),
            None => (
                CompressionLabel::NONE,
                NO_OPTIONS.get_or_init(CompressionOptions::new),
            ),
        }
    }
}

/// Strategy taken by [`BlockManager::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Blocks were kept or repacked inside the existing file
    InPlace,
    /// The whole file was rewritten and replaced
    Rewritten,
}

/// Where a block was written
pub type WrittenBlock = (BlockId, u64, BlockHeader);

/// Owner of the blocks of one document
pub struct BlockManager {
    blocks: Vec<Block>,
    /// Released slots, reused by the next added block
    free: Vec<usize>,
    streamed: Option<BlockId>,
    stream: Option<StreamHandle>,
    uri: Option<Url>,
    config: AsdfConfig,
    external_cache: ExternalBlockCache,
    closed: bool,
}

impl BlockManager {
    /// Empty manager for a document that has no backing stream yet
    pub fn new(config: &AsdfConfig) -> Self {
        BlockManager {
            blocks: Vec::new(),
            free: Vec::new(),
            streamed: None,
            stream: None,
            uri: None,
            config: config.clone(),
            external_cache: ExternalBlockCache::new(
                config.external_cache_capacity,
                config.io_block_size,
            ),
            closed: false,
        }
    }

    /// Discover the blocks of an open stream positioned after the tree
    pub fn open(
        handle: StreamHandle,
        uri: Option<Url>,
        config: &AsdfConfig,
        options: &ReadOptions,
    ) -> Result<Self> {
        let discovery = read_blocks(&handle, options)?;
        let mut manager = Self::new(config);
        manager.blocks = discovery.blocks;
        manager.streamed = manager
            .blocks
            .iter()
            .position(|b| b.storage() == Some(ArrayStorage::Streamed))
            .map(BlockId);
        manager.stream = Some(handle);
        manager.uri = uri;
        Ok(manager)
    }

    pub fn config(&self) -> &AsdfConfig {
        &self.config
    }

    /// Base URI used to resolve and name external blocks
    pub fn uri(&self) -> Option<&Url> {
        self.uri.as_ref()
    }

    pub fn set_uri(&mut self, uri: Option<Url>) {
        self.uri = uri;
    }

    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.as_ref()
    }

    /// Number of live (not released) blocks
    pub fn len(&self) -> usize {
        self.blocks.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(AsdfError::Closed);
        }
        Ok(())
    }

    fn check(&self, id: BlockId) -> Result<()> {
        self.block(id).map(|_| ())
    }

    pub fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks
            .get(id.0)
            .filter(|b| !b.is_released())
            .ok_or_else(|| AsdfError::Format(format!("no block with id {}", id.0)))
    }

    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks
            .get_mut(id.0)
            .filter(|b| !b.is_released())
            .ok_or_else(|| AsdfError::Format(format!("no block with id {}", id.0)))
    }

    fn insert(&mut self, block: Block) -> BlockId {
        match self.free.pop() {
            Some(slot) => {
                self.blocks[slot] = block;
                BlockId(slot)
            }
            None => {
                self.blocks.push(block);
                BlockId(self.blocks.len() - 1)
            }
        }
    }

    pub fn add_block(&mut self, data: Vec<u8>) -> BlockId {
        self.insert(Block::new(data))
    }

    pub fn add_external(&mut self, uri: impl Into<String>) -> BlockId {
        self.insert(Block::external(uri))
    }

    /// Internal blocks currently on disk, in file order
    pub fn internal_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.header().is_some_and(|h| !h.is_streamed()) && b.offset().is_some())
            .map(|(i, _)| BlockId(i))
            .collect();
        ids.sort_by_key(|id| self.blocks[id.0].offset());
        ids
    }

    pub fn streamed_id(&self) -> Option<BlockId> {
        self.streamed
    }

    pub fn storage(&self, id: BlockId) -> Result<Option<ArrayStorage>> {
        Ok(self.block(id)?.storage())
    }

    /// Assign storage, enforcing a single streamed block
    ///
    /// A rejected assignment leaves every block unchanged.
    pub fn set_storage(&mut self, id: BlockId, storage: ArrayStorage) -> Result<()> {
        self.check(id)?;
        if storage == ArrayStorage::Streamed {
            if let Some(existing) = self.streamed.filter(|&s| s != id) {
                return Err(AsdfError::StorageConstraint(format!(
                    "only one block may be streamed (block {} already is)",
                    existing.0
                )));
            }
        }
        self.set_storage_unchecked(id, storage);
        Ok(())
    }

    /// Assign storage without the cross-block checks of [`set_storage`]
    ///
    /// [`set_storage`]: BlockManager::set_storage
    pub(crate) fn set_storage_unchecked(&mut self, id: BlockId, storage: ArrayStorage) {
        if storage == ArrayStorage::Streamed {
            self.streamed = Some(id);
        } else if self.streamed == Some(id) {
            self.streamed = None;
        }
        if let Some(block) = self.blocks.get_mut(id.0) {
            block.set_storage_unchecked(storage);
        }
    }

    /// Forget a block no array refers to any more
    ///
    /// The payload is dropped right away and the slot is reused by the next
    /// added block. Its bytes on disk become free space for the next update.
    pub fn release(&mut self, id: BlockId) {
        if self.streamed == Some(id) {
            self.streamed = None;
        }
        if let Some(block) = self.blocks.get_mut(id.0).filter(|b| !b.is_released()) {
            block.release();
            self.free.push(id.0);
            debug!("Released block {}", id.0);
        }
    }

    pub fn compression(&self, id: BlockId) -> Result<CompressionLabel> {
        Ok(self.block(id)?.compression())
    }

    pub fn set_compression(
        &mut self,
        id: BlockId,
        label: CompressionLabel,
        options: CompressionOptions,
    ) -> Result<()> {
        if !label.is_none() {
            crate::core::compression::get_compressor(label)?;
        }
        self.block_mut(id)?.set_compression(label, options);
        Ok(())
    }

    /// Payload of a block, resolving external references on first access
    pub fn data(&mut self, id: BlockId) -> Result<BlockData> {
        self.ensure_open()?;
        self.resolve_external(id)?;
        self.block_mut(id)?.materialize()
    }

    /// Mutable payload of a block; marks it modified
    pub fn data_mut(&mut self, id: BlockId) -> Result<&mut Vec<u8>> {
        self.ensure_open()?;
        self.resolve_external(id)?;
        self.block_mut(id)?.data_mut()
    }

    pub fn set_data(&mut self, id: BlockId, data: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.block_mut(id)?.set_data(data);
        Ok(())
    }

    fn resolve_external(&mut self, id: BlockId) -> Result<()> {
        let block = self.block(id)?;
        if !block.is_external_unresolved() {
            return Ok(());
        }
        let uri = block.uri().unwrap_or_default().to_string();
        let loaded = self.external_cache.load(
            self.uri.as_ref(),
            &uri,
            self.config.validate_checksums,
        )?;
        let data = match loaded {
            ExternalData::Loaded(data) => data,
            ExternalData::UseInternal => {
                let first = self.internal_ids().first().copied().ok_or_else(|| {
                    AsdfError::Format(format!(
                        "reference {:?} points at this file, which has no blocks",
                        uri
                    ))
                })?;
                self.block_mut(first)?.materialize()?
            }
        };
        self.block_mut(id)?.set_loaded(data);
        Ok(())
    }

    /// Decide storage, compression and sources for the blocks in `used`
    ///
    /// Storage is resolved as: override, explicit assignment, inline
    /// threshold, internal. Fails before anything is written when more than
    /// one block would be streamed or when external blocks have no file URI
    /// to be named after.
    pub fn plan(
        &mut self,
        used: &[BlockId],
        settings: &WriteSettings,
        uri: Option<&Url>,
    ) -> Result<WritePlan> {
        self.ensure_open()?;
        let mut seen = HashSet::new();
        let mut ids: Vec<BlockId> = used.iter().copied().filter(|id| seen.insert(*id)).collect();
        for &id in &ids {
            self.check(id)?;
        }
        ids.sort_by_key(|id| {
            let offset = self.blocks[id.0].offset();
            (offset.is_none(), offset, *id)
        });

        let mut plan = WritePlan {
            uri: uri.cloned(),
            ..WritePlan::default()
        };
        for id in ids {
            let block = &self.blocks[id.0];
            let storage = settings
                .all_array_storage
                .or(block.storage())
                .unwrap_or_else(|| {
                    match (settings.array_inline_threshold, block.data_len()) {
                        (Some(threshold), Some(len)) if (len as usize) < threshold => {
                            ArrayStorage::Inline
                        }
                        _ => ArrayStorage::Internal,
                    }
                });
            let label = match storage {
                ArrayStorage::Streamed | ArrayStorage::Inline => CompressionLabel::NONE,
                _ => settings
                    .all_array_compression
                    .unwrap_or(block.compression()),
            };
            let options = settings
                .compression_options
                .clone()
                .unwrap_or_else(|| block.compression_options().clone());
            plan.codecs.insert(id, (label, options));

            match storage {
                ArrayStorage::Internal => plan.internal.push(id),
                ArrayStorage::External => plan.external.push(id),
                ArrayStorage::Inline => plan.inline.push(id),
                ArrayStorage::Streamed => {
                    if let Some(first) = plan.streamed {
                        return Err(AsdfError::StorageConstraint(format!(
                            "only one block may be streamed (blocks {} and {})",
                            first.0, id.0
                        )));
                    }
                    plan.streamed = Some(id);
                }
            }
        }

        if !plan.external.is_empty() && uri.is_none() {
            return Err(AsdfError::StorageConstraint(
                "external blocks need the URI of the file being written".to_string(),
            ));
        }

        for (i, &id) in plan.internal.iter().enumerate() {
            plan.sources.insert(id, Source::Internal(i));
        }
        if let Some(id) = plan.streamed {
            plan.sources.insert(id, Source::Streamed);
        }
        if let Some(uri) = uri {
            for (i, &id) in plan.external.iter().enumerate() {
                plan.sources.insert(id, Source::External(external_name(uri, i)?));
            }
        }
        for id in plan.inline.clone() {
            let data = self.data(id)?;
            plan.sources.insert(id, Source::Inline(data));
        }
        debug!(
            "Planned write: {} internal, {} external, {} inline, streamed: {}",
            plan.internal.len(),
            plan.external.len(),
            plan.inline.len(),
            plan.streamed.is_some()
        );
        Ok(plan)
    }

    /// Write each external block to its own file next to the plan's URI
    pub fn write_external(&mut self, plan: &WritePlan) -> Result<()> {
        let Some(base) = plan.uri.as_ref() else {
            return Ok(());
        };
        for &id in &plan.external {
            let Some(Source::External(name)) = plan.sources.get(&id) else {
                continue;
            };
            let target = base
                .join(name)
                .map_err(|e| AsdfError::Uri(format!("can not resolve {:?}: {}", name, e)))?;
            let path = target
                .to_file_path()
                .map_err(|_| AsdfError::Uri(format!("{} is not a file URI", target)))?;
            let data = self.data(id)?;
            let (label, options) = plan.codec(id);
            let block = EncodedBlock::encode(&data, label, options)?;
            write_atomic(&path, |stream| {
                stream.write_all(&FileHeader::default().to_bytes())?;
                stream.write_all(&wrap_tree("{}"))?;
                block.write(stream, block.used_size())?;
                Ok(())
            })?;
            self.external_cache.forget(&target);
            info!("Wrote external block {}", path.display());
        }
        Ok(())
    }

    /// Write a complete file: version lines, `tree`, blocks, streamed block
    /// and block index
    ///
    /// `tree` must already refer to blocks through `plan`'s sources. On
    /// streams that can not seek the block index is skipped.
    pub fn write_to(
        &mut self,
        out: &mut dyn ByteStream,
        tree: &[u8],
        plan: &WritePlan,
        settings: &WriteSettings,
    ) -> Result<Vec<WrittenBlock>> {
        self.ensure_open()?;
        self.write_external(plan)?;
        self.write_document(out, tree, plan, settings)
    }

    fn write_document(
        &mut self,
        out: &mut dyn ByteStream,
        tree: &[u8],
        plan: &WritePlan,
        settings: &WriteSettings,
    ) -> Result<Vec<WrittenBlock>> {
        let mut encoded = Vec::with_capacity(plan.internal.len());
        for &id in &plan.internal {
            let data = self.data(id)?;
            let (label, options) = plan.codec(id);
            encoded.push(EncodedBlock::encode(&data, label, options)?);
        }
        let streamed = plan.streamed.map(|id| self.data(id)).transpose()?;

        out.write_all(&FileHeader::default().to_bytes())?;
        out.write_all(tree)?;
        let tree_end = out.position()?;
        write_zeros(
            out,
            calculate_padding(tree_end, settings.pad_blocks, settings.io_block_size),
        )?;

        let placed = write_blocks(out, &encoded, settings.pad_blocks, settings.io_block_size)?;
        let offsets: Vec<u64> = placed.iter().map(|(offset, _)| *offset).collect();
        let mut written: Vec<WrittenBlock> = plan
            .internal
            .iter()
            .zip(placed)
            .map(|(&id, (offset, header))| (id, offset, header))
            .collect();

        if let (Some(id), Some(data)) = (plan.streamed, streamed) {
            let (offset, header) = write_streamed(out, &data.bytes()?)?;
            written.push((id, offset, header));
        }
        write_index_if_possible(out, &offsets, plan.streamed.is_some(), settings)?;
        out.flush()?;
        Ok(written)
    }

    /// Whether `path` names the writable file this manager is bound to
    pub fn is_bound_to(&self, path: &Path) -> Result<bool> {
        let Some(handle) = &self.stream else {
            return Ok(false);
        };
        let own = handle.with(|s| {
            Ok(if s.writable() {
                s.path().map(Path::to_path_buf)
            } else {
                None
            })
        })?;
        let Some(own) = own else {
            return Ok(false);
        };
        match (std::fs::canonicalize(own), std::fs::canonicalize(path)) {
            (Ok(own), Ok(target)) => Ok(own == target),
            _ => Ok(false),
        }
    }

    /// Write a complete file over the one this manager is bound to
    ///
    /// The new contents replace the old file atomically and the manager is
    /// rebound to them, so later updates land in the new file.
    pub fn write_over(
        &mut self,
        tree: &[u8],
        plan: &WritePlan,
        settings: &WriteSettings,
    ) -> Result<()> {
        self.ensure_open()?;
        let handle = self.stream.clone().ok_or_else(|| {
            AsdfError::StorageConstraint("document has no backing file".to_string())
        })?;
        self.write_external(plan)?;
        self.replace_contents(&handle, tree, plan, settings)?;
        info!("Rewrote bound file ({} blocks)", plan.internal.len());
        Ok(())
    }

    /// Write the document back into its own stream
    ///
    /// `render` produces the tree for a given set of sources; it is called
    /// more than once while the layout is settled.
    pub fn update(
        &mut self,
        used: &[BlockId],
        render: &dyn Fn(&SourceMap) -> Result<Vec<u8>>,
        settings: &WriteSettings,
    ) -> Result<UpdateOutcome> {
        self.ensure_open()?;
        let handle = self
            .stream
            .clone()
            .ok_or_else(|| AsdfError::StorageConstraint("document has no backing file".to_string()))?;
        handle.with(|s| {
            if s.seekable() && s.writable() {
                Ok(())
            } else {
                Err(AsdfError::StorageConstraint(
                    "update needs a seekable, writable file".to_string(),
                ))
            }
        })?;

        let uri = self.uri.clone();
        let plan = self.plan(used, settings, uri.as_ref())?;

        // describe every internal block; encode the ones that changed
        let mut states = Vec::with_capacity(plan.internal.len());
        let mut encoded: Vec<Option<EncodedBlock>> = Vec::with_capacity(plan.internal.len());
        let mut old_headers: Vec<Option<BlockHeader>> = Vec::with_capacity(plan.internal.len());
        for &id in &plan.internal {
            let (label, options) = plan.codec(id);
            let block = self.block(id)?;
            let header = block.header().copied().filter(|h| !h.is_streamed());
            let region = header.zip(block.offset()).map(|(h, offset)| Region {
                offset,
                header_len: h.total_header_len(),
                allocated: h.allocated_size,
            });
            let unchanged = !block.is_dirty()
                && header.is_some_and(|h| h.compression == label.as_bytes());
            old_headers.push(header);
            match (unchanged, region, header) {
                (true, Some(region), Some(h)) => {
                    states.push(BlockState::Clean {
                        region,
                        used: h.used_size,
                    });
                    encoded.push(None);
                }
                _ => {
                    let data = self.data(id)?;
                    let block = EncodedBlock::encode(&data, label, options)?;
                    states.push(BlockState::Dirty {
                        used: block.used_size(),
                        slot: region,
                    });
                    encoded.push(Some(block));
                }
            }
        }
        let streamed_data = plan.streamed.map(|id| self.data(id)).transpose()?;
        self.write_external(&plan)?;

        let file_header = FileHeader::default().to_bytes();
        let render_full = |sources: &SourceMap| -> Result<Vec<u8>> {
            let mut tree = file_header.clone();
            tree.extend_from_slice(&render(sources)?);
            Ok(tree)
        };

        // first try the tree as rendered today; if renumbering makes it
        // longer, reserve room for every source index to grow
        let mut tree_end = render_full(plan.sources())?.len() as u64;
        let mut chosen = None;
        for attempt in 0..2 {
            let Some(placements) =
                layout(tree_end, &states, settings.pad_blocks, settings.io_block_size)
            else {
                break;
            };
            let sources = renumber(&plan, &placements);
            let tree = render_full(&sources)?;
            if tree.len() as u64 <= tree_end {
                chosen = Some((placements, tree));
                break;
            }
            if attempt == 0 {
                let reserve = (tree.len() + MAX_BLOCKS_DIGITS * plan.internal.len()) as u64;
                tree_end =
                    reserve + calculate_padding(reserve, settings.pad_blocks, settings.io_block_size);
            }
        }

        let Some((placements, tree)) = chosen else {
            info!("Blocks can not stay in place, rewriting the file");
            self.rewrite(&handle, &plan, &render_full, settings)?;
            return Ok(UpdateOutcome::Rewritten);
        };

        // unchanged blocks that have to move are copied byte for byte
        for (i, placement) in placements.iter().enumerate() {
            if let (BlockState::Clean { region, used }, Placement::Write { .. }, Some(header)) =
                (states[i], placement, old_headers[i])
            {
                let raw = handle.with(|s| {
                    s.seek(SeekFrom::Start(region.offset + region.header_len))?;
                    Ok(read_exact_vec(s, used as usize)?)
                })?;
                encoded[i] = Some(EncodedBlock::from_raw(&header, raw));
            }
        }

        let include_index = settings.include_block_index && plan.streamed.is_none();
        let (headers, streamed_written) = handle.with(|s| {
            let mut headers = Vec::with_capacity(placements.len());
            for (i, placement) in placements.iter().enumerate() {
                let header = match (*placement, &encoded[i], old_headers[i]) {
                    (Placement::Write { offset, allocated }, Some(block), _) => {
                        s.seek(SeekFrom::Start(offset))?;
                        block.write(s, allocated)?
                    }
                    (Placement::Keep { allocated, .. }, _, Some(old)) => BlockHeader {
                        allocated_size: allocated,
                        ..old
                    },
                    _ => {
                        return Err(AsdfError::Format(
                            "inconsistent update layout".to_string(),
                        ))
                    }
                };
                headers.push(header);
            }
            for (i, placement) in placements.iter().enumerate() {
                if let (Placement::Keep { offset, allocated }, Some(old)) = (*placement, old_headers[i]) {
                    if allocated != old.allocated_size {
                        s.seek(SeekFrom::Start(offset))?;
                        s.write_all(&headers[i].to_bytes())?;
                    }
                }
            }

            let mut end = placements
                .iter()
                .map(Placement::end)
                .max()
                .unwrap_or(tree.len() as u64);
            let mut streamed_written = None;
            if let Some(data) = &streamed_data {
                s.seek(SeekFrom::Start(end))?;
                streamed_written = Some(write_streamed(s, &data.bytes()?)?);
                end = s.position()?;
            }
            if include_index && !placements.is_empty() {
                let mut offsets: Vec<u64> = placements.iter().map(Placement::offset).collect();
                offsets.sort_unstable();
                s.seek(SeekFrom::Start(end))?;
                write_index(s, &offsets)?;
                end = s.position()?;
            }
            s.truncate(end)?;

            let first = placements
                .iter()
                .map(Placement::offset)
                .min()
                .unwrap_or(end);
            s.seek(SeekFrom::Start(tree.len() as u64))?;
            write_zeros(s, first.saturating_sub(tree.len() as u64))?;
            s.seek(SeekFrom::Start(0))?;
            s.write_all(&tree)?;
            s.sync()?;
            Ok((headers, streamed_written))
        })?;

        let mut written: Vec<WrittenBlock> = plan
            .internal
            .iter()
            .zip(placements.iter().zip(headers))
            .map(|(&id, (placement, header))| (id, placement.offset(), header))
            .collect();
        if let (Some(id), Some((offset, header))) = (plan.streamed, streamed_written) {
            written.push((id, offset, header));
        }
        self.rebind(&handle, written);
        info!(
            "Updated file in place ({} blocks, tree {} bytes)",
            plan.internal.len(),
            tree.len()
        );
        Ok(UpdateOutcome::InPlace)
    }

    /// Rewrite the whole document and swap it in
    fn rewrite(
        &mut self,
        handle: &StreamHandle,
        plan: &WritePlan,
        render_full: &dyn Fn(&SourceMap) -> Result<Vec<u8>>,
        settings: &WriteSettings,
    ) -> Result<()> {
        let full = render_full(plan.sources())?;
        let tree = &full[FileHeader::default().to_bytes().len()..];
        self.replace_contents(handle, tree, plan, settings)
    }

    /// Write a complete document to the side and swap it in for the bound
    /// stream's contents, then rebind every written block
    fn replace_contents(
        &mut self,
        handle: &StreamHandle,
        tree: &[u8],
        plan: &WritePlan,
        settings: &WriteSettings,
    ) -> Result<()> {
        let path = handle.with(|s| Ok(s.path().map(|p| p.to_path_buf())))?;

        let written = match path {
            Some(path) => {
                let dir = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => std::path::PathBuf::from("."),
                };
                let temp = NamedTempFile::new_in(dir)?;
                let written = {
                    let mut out = FileStream::open(temp.path(), true)?;
                    let written = self.write_document(&mut out, tree, plan, settings)?;
                    out.sync()?;
                    written
                };
                handle.with(|s| match s.as_file_stream() {
                    Some(file) => Ok(file.replace_with(temp)?),
                    None => Err(AsdfError::StorageConstraint(
                        "stream with a path is not a file".to_string(),
                    )),
                })?;
                written
            }
            None => {
                let mut buffer = MemoryStream::new();
                let written = self.write_document(&mut buffer, tree, plan, settings)?;
                let bytes = buffer.into_inner();
                handle.with(|s| {
                    s.seek(SeekFrom::Start(0))?;
                    s.write_all(&bytes)?;
                    s.truncate(bytes.len() as u64)?;
                    s.sync()?;
                    Ok(())
                })?;
                written
            }
        };
        self.rebind(handle, written);
        Ok(())
    }

    /// Point written blocks at their new location; everything else no
    /// longer lives in this file
    fn rebind(&mut self, handle: &StreamHandle, written: Vec<WrittenBlock>) {
        let weak = handle.downgrade();
        let mut bound = HashSet::with_capacity(written.len());
        for (id, offset, header) in written {
            if let Some(block) = self.blocks.get_mut(id.0) {
                block.rebind(header, offset, weak.clone());
                bound.insert(id);
            }
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if !bound.contains(&BlockId(i)) && block.offset().is_some() {
                block.unbind();
            }
        }
    }

    /// Release the stream; later data access fails with [`AsdfError::Closed`]
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(handle) = self.stream.take() {
            handle.close();
        }
        self.external_cache.clear();
        debug!("Closed block manager ({} blocks)", self.blocks.len());
    }
}

/// Source indices in on-disk order after an update layout
fn renumber(plan: &WritePlan, placements: &[Placement]) -> SourceMap {
    let mut order: Vec<usize> = (0..plan.internal.len()).collect();
    order.sort_by_key(|&i| placements[i].offset());
    let mut sources = plan.sources.clone();
    for (n, i) in order.into_iter().enumerate() {
        sources.insert(plan.internal[i], Source::Internal(n));
    }
    sources
}

fn write_index_if_possible(
    out: &mut dyn ByteStream,
    offsets: &[u64],
    has_streamed: bool,
    settings: &WriteSettings,
) -> Result<()> {
    if !settings.include_block_index || offsets.is_empty() {
        return Ok(());
    }
    if has_streamed {
        debug!("Not writing a block index after a streamed block");
        return Ok(());
    }
    if !out.seekable() {
        warn!("Not writing a block index to a non-seekable stream");
        return Ok(());
    }
    write_index(out, offsets)
}

/// `<stem>NNNN.asdf` next to the main file
fn external_name(uri: &Url, index: usize) -> Result<String> {
    let path = uri
        .to_file_path()
        .map_err(|_| AsdfError::Uri(format!("{} is not a file URI", uri)))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| AsdfError::Uri(format!("{} has no file name", uri)))?;
    Ok(format!("{}{:04}.asdf", stem, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::read_tree;
    use crate::core::io::read_to_end;

    fn render(sources: &SourceMap) -> Result<Vec<u8>> {
        let body: Vec<String> = sources
            .values()
            .map(|s| match s {
                Source::Internal(i) => i.to_string(),
                Source::Streamed => "-1".to_string(),
                Source::External(name) => format!("{:?}", name),
                Source::Inline(data) => format!("{:?}", data.to_vec().unwrap()),
            })
            .collect();
        Ok(wrap_tree(&format!("[{}]", body.join(", "))))
    }

    fn write(manager: &mut BlockManager, ids: &[BlockId], settings: &WriteSettings) -> Vec<u8> {
        let plan = manager.plan(ids, settings, None).unwrap();
        let tree = render(plan.sources()).unwrap();
        let mut out = MemoryStream::new();
        manager.write_to(&mut out, &tree, &plan, settings).unwrap();
        out.into_inner()
    }

    fn reopen(bytes: Vec<u8>, config: &AsdfConfig) -> BlockManager {
        let handle = StreamHandle::new(Box::new(MemoryStream::from_bytes(bytes)));
        handle
            .with(|s| {
                FileHeader::read(s)?;
                read_tree(s, 4096)?;
                Ok(())
            })
            .unwrap();
        let options = ReadOptions {
            lazy_load: config.lazy_load,
            memmap: false,
            validate_checksums: config.validate_checksums,
            io_block_size: config.io_block_size,
        };
        BlockManager::open(handle, None, config, &options).unwrap()
    }

    fn file_bytes(manager: &BlockManager) -> Vec<u8> {
        manager
            .stream()
            .unwrap()
            .with(|s| {
                s.seek(SeekFrom::Start(0))?;
                Ok(read_to_end(s)?)
            })
            .unwrap()
    }

    #[test]
    fn test_single_streamed_block() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let a = manager.add_block(vec![1]);
        let b = manager.add_block(vec![2]);
        manager.set_storage(a, ArrayStorage::Streamed).unwrap();
        let err = manager.set_storage(b, ArrayStorage::Streamed).unwrap_err();
        assert!(matches!(err, AsdfError::StorageConstraint(_)));
        assert_eq!(manager.storage(a).unwrap(), Some(ArrayStorage::Streamed));
        assert_eq!(manager.storage(b).unwrap(), None);

        // reassigning the same block is fine, moving it frees the slot
        manager.set_storage(a, ArrayStorage::Streamed).unwrap();
        manager.set_storage(a, ArrayStorage::Internal).unwrap();
        manager.set_storage(b, ArrayStorage::Streamed).unwrap();
    }

    #[test]
    fn test_released_block_drops_payload_and_slot_is_reused() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let kept = manager.add_block(vec![1; 100]);
        let dropped = manager.add_block(vec![2; 1 << 20]);
        manager.set_storage(dropped, ArrayStorage::Streamed).unwrap();
        assert_eq!(manager.len(), 2);

        manager.release(dropped);
        assert!(manager.blocks[dropped.0].is_released());
        assert!(manager.blocks[dropped.0].loaded_data().is_none());
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.streamed_id(), None);
        assert!(manager.data(dropped).is_err());
        assert!(manager.plan(&[dropped], &WriteSettings::default(), None).is_err());

        // releasing twice is a no-op
        manager.release(dropped);
        assert_eq!(manager.len(), 1);

        let reused = manager.add_block(vec![3; 10]);
        assert_eq!(reused, dropped);
        assert_eq!(manager.storage(reused).unwrap(), None);
        assert_eq!(&manager.data(reused).unwrap().bytes().unwrap()[..], &[3u8; 10][..]);
        assert_eq!(manager.len(), 2);

        let fresh = manager.add_block(vec![4]);
        assert_eq!(fresh.index(), 2);
        assert_eq!(&manager.data(kept).unwrap().bytes().unwrap()[..], &[1u8; 100][..]);
    }

    #[test]
    fn test_add_remove_cycles_keep_the_arena_bounded() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let base = manager.add_block(vec![0; 16]);
        for round in 0..100u8 {
            let id = manager.add_block(vec![round; 4096]);
            manager.release(id);
        }
        assert_eq!(manager.blocks.len(), 2);
        assert_eq!(manager.len(), 1);

        let bytes = write(&mut manager, &[base], &WriteSettings::default());
        let mut reopened = reopen(bytes, &AsdfConfig::default());
        assert_eq!(reopened.len(), 1);
        assert_eq!(&reopened.data(BlockId(0)).unwrap().bytes().unwrap()[..], &[0u8; 16][..]);
    }

    #[test]
    fn test_plan_storage_resolution() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let small = manager.add_block(vec![1, 2]);
        let large = manager.add_block(vec![0; 100]);
        let explicit = manager.add_block(vec![3]);
        manager.set_storage(explicit, ArrayStorage::Internal).unwrap();
        manager
            .set_compression(large, CompressionLabel::ZLIB, CompressionOptions::new())
            .unwrap();

        let settings = WriteSettings {
            array_inline_threshold: Some(10),
            ..WriteSettings::default()
        };
        let plan = manager.plan(&[small, large, explicit, small], &settings, None).unwrap();
        assert_eq!(plan.storage(small), Some(ArrayStorage::Inline));
        assert_eq!(plan.storage(large), Some(ArrayStorage::Internal));
        assert_eq!(plan.storage(explicit), Some(ArrayStorage::Internal));
        assert_eq!(plan.internal, vec![large, explicit]);
        assert_eq!(plan.compression(large), CompressionLabel::ZLIB);
        assert_eq!(plan.source(small), Some(&Source::Inline(BlockData::from_vec(vec![1, 2]))));

        let overridden = WriteSettings {
            all_array_storage: Some(ArrayStorage::Internal),
            all_array_compression: Some(CompressionLabel::NONE),
            array_inline_threshold: Some(10),
            ..WriteSettings::default()
        };
        let plan = manager.plan(&[small, large], &overridden, None).unwrap();
        assert_eq!(plan.storage(small), Some(ArrayStorage::Internal));
        assert_eq!(plan.compression(large), CompressionLabel::NONE);
    }

    #[test]
    fn test_external_needs_uri() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let id = manager.add_block(vec![1, 2, 3]);
        manager.set_storage(id, ArrayStorage::External).unwrap();
        let err = manager.plan(&[id], &WriteSettings::default(), None).unwrap_err();
        assert!(matches!(err, AsdfError::StorageConstraint(_)));

        let uri = Url::parse("file:///data/main.asdf").unwrap();
        let plan = manager.plan(&[id], &WriteSettings::default(), Some(&uri)).unwrap();
        assert_eq!(plan.source(id), Some(&Source::External("main0000.asdf".to_string())));
    }

    #[test]
    fn test_write_and_read_back() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let a = manager.add_block(b"first block".to_vec());
        let b = manager.add_block(vec![7; 5000]);
        manager
            .set_compression(b, CompressionLabel::BZIP2, CompressionOptions::new())
            .unwrap();
        let bytes = write(&mut manager, &[a, b], &WriteSettings::default());
        assert!(bytes.starts_with(b"#ASDF 1.0.0\n#ASDF_STANDARD 1.5.0\n%YAML 1.1\n"));

        let mut reopened = reopen(bytes, &AsdfConfig::default());
        let ids = reopened.internal_ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(&reopened.data(ids[0]).unwrap().bytes().unwrap()[..], b"first block");
        assert_eq!(&reopened.data(ids[1]).unwrap().bytes().unwrap()[..], &[7u8; 5000][..]);
        assert_eq!(reopened.compression(ids[1]).unwrap(), CompressionLabel::BZIP2);
    }

    #[test]
    fn test_write_is_deterministic() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let ids: Vec<_> = (0..4u8).map(|i| manager.add_block(vec![i; 300])).collect();
        let first = write(&mut manager, &ids, &WriteSettings::default());
        let second = write(&mut manager, &ids, &WriteSettings::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_idempotent_update() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let ids: Vec<_> = (0..3u8).map(|i| manager.add_block(vec![i; 1000])).collect();
        let bytes = write(&mut manager, &ids, &WriteSettings::default());

        let mut reopened = reopen(bytes.clone(), &AsdfConfig::default());
        let ids = reopened.internal_ids();
        let outcome = reopened.update(&ids, &render, &WriteSettings::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::InPlace);
        assert_eq!(file_bytes(&reopened), bytes);
    }

    #[test]
    fn test_update_shrinking_block_stays_in_place() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let ids: Vec<_> = (0..3u8).map(|i| manager.add_block(vec![i; 1000])).collect();
        let bytes = write(&mut manager, &ids, &WriteSettings::default());

        let mut reopened = reopen(bytes.clone(), &AsdfConfig::default());
        let ids = reopened.internal_ids();
        reopened.set_data(ids[1], vec![9; 10]).unwrap();
        let outcome = reopened.update(&ids, &render, &WriteSettings::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::InPlace);
        assert_eq!(file_bytes(&reopened).len(), bytes.len());

        let mut again = reopen(file_bytes(&reopened), &AsdfConfig { validate_checksums: true, ..AsdfConfig::default() });
        let ids = again.internal_ids();
        assert_eq!(&again.data(ids[0]).unwrap().bytes().unwrap()[..], &[0u8; 1000][..]);
        assert_eq!(&again.data(ids[1]).unwrap().bytes().unwrap()[..], &[9u8; 10][..]);
        assert_eq!(&again.data(ids[2]).unwrap().bytes().unwrap()[..], &[2u8; 1000][..]);
    }

    #[test]
    fn test_update_growing_every_block_rewrites() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let ids: Vec<_> = (0..3u8).map(|i| manager.add_block(vec![i; 100])).collect();
        let bytes = write(&mut manager, &ids, &WriteSettings::default());

        let mut reopened = reopen(bytes, &AsdfConfig::default());
        let ids = reopened.internal_ids();
        for (n, &id) in ids.iter().enumerate() {
            reopened.set_data(id, vec![n as u8 + 10; 5000]).unwrap();
        }
        let outcome = reopened.update(&ids, &render, &WriteSettings::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Rewritten);

        // the live manager is rebound to the new layout
        assert_eq!(&reopened.data(ids[2]).unwrap().bytes().unwrap()[..], &[12u8; 5000][..]);
        let mut again = reopen(file_bytes(&reopened), &AsdfConfig { validate_checksums: true, ..AsdfConfig::default() });
        for (n, id) in again.internal_ids().into_iter().enumerate() {
            assert_eq!(&again.data(id).unwrap().bytes().unwrap()[..], &vec![n as u8 + 10; 5000][..]);
        }
    }

    #[test]
    fn test_update_one_grown_block_moves_to_end() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let ids: Vec<_> = (0..3u8).map(|i| manager.add_block(vec![i; 100])).collect();
        let bytes = write(&mut manager, &ids, &WriteSettings::default());

        let mut reopened = reopen(bytes, &AsdfConfig::default());
        let ids = reopened.internal_ids();
        reopened.set_data(ids[0], vec![42; 400]).unwrap();
        let outcome = reopened.update(&ids, &render, &WriteSettings::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::InPlace);

        let mut again = reopen(file_bytes(&reopened), &AsdfConfig { validate_checksums: true, ..AsdfConfig::default() });
        let order = again.internal_ids();
        assert_eq!(&again.data(order[0]).unwrap().bytes().unwrap()[..], &[1u8; 100][..]);
        assert_eq!(&again.data(order[1]).unwrap().bytes().unwrap()[..], &[2u8; 100][..]);
        assert_eq!(&again.data(order[2]).unwrap().bytes().unwrap()[..], &[42u8; 400][..]);
    }

    #[test]
    fn test_update_requires_writable_stream() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let id = manager.add_block(vec![1]);
        assert!(matches!(
            manager.update(&[id], &render, &WriteSettings::default()),
            Err(AsdfError::StorageConstraint(_))
        ));
    }

    #[test]
    fn test_closed_manager() {
        let mut manager = BlockManager::new(&AsdfConfig::default());
        let ids: Vec<_> = (0..2u8).map(|i| manager.add_block(vec![i; 10])).collect();
        let bytes = write(&mut manager, &ids, &WriteSettings::default());
        let mut reopened = reopen(bytes, &AsdfConfig::default());
        let ids = reopened.internal_ids();
        reopened.close();
        assert!(reopened.is_closed());
        assert!(matches!(reopened.data(ids[0]), Err(AsdfError::Closed)));
        assert!(matches!(
            reopened.plan(&ids, &WriteSettings::default(), None),
            Err(AsdfError::Closed)
        ));
    }
}
