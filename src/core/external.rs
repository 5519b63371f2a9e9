//! Cache of blocks stored in sibling files
//!
//! An external reference names another ASDF file whose first block holds the
//! payload. References are resolved against the document's base URI and
//! cached by the resolved URI without its fragment, so repeated references
//! (and references seen through a rebased document) reuse the same bytes.

use crate::core::block::BlockData;
use crate::core::error::{AsdfError, Result};
use crate::core::format::{read_tree, FileHeader};
use crate::core::io::{FileStream, StreamHandle};
use crate::core::reader::{read_blocks, ReadOptions};
use lru::LruCache;
use std::num::NonZeroUsize;
use url::Url;

/// Outcome of an external lookup
#[derive(Debug, Clone)]
pub enum ExternalData {
    /// The reference points back at the document itself; use its first
    /// internal block
    UseInternal,
    Loaded(BlockData),
}

/// Bounded cache of external block payloads
pub struct ExternalBlockCache {
    entries: LruCache<String, BlockData>,
    io_block_size: usize,
}

impl ExternalBlockCache {
    pub fn new(capacity: usize, io_block_size: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ExternalBlockCache {
            entries: LruCache::new(capacity),
            io_block_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop the entry for a file that was just rewritten
    pub fn forget(&mut self, url: &Url) {
        self.entries.pop(&without_fragment(url).to_string());
    }

    /// Resolve `uri` against `base` and return its first block
    pub fn load(
        &mut self,
        base: Option<&Url>,
        uri: &str,
        validate_checksums: bool,
    ) -> Result<ExternalData> {
        let reference = uri.split('#').next().unwrap_or_default().trim();
        if reference.is_empty() {
            return Ok(ExternalData::UseInternal);
        }

        let resolved = resolve(base, reference)?;
        if let Some(base) = base {
            if without_fragment(base) == resolved {
                return Ok(ExternalData::UseInternal);
            }
        }

        let key = resolved.to_string();
        if let Some(data) = self.entries.get(&key) {
            tracing::debug!("External block cache hit for {}", key);
            return Ok(ExternalData::Loaded(data.clone()));
        }

        let data = self.read_first_block(&resolved, validate_checksums)?;
        tracing::debug!("Loaded external block {} ({} bytes)", key, data.len());
        self.entries.put(key, data.clone());
        Ok(ExternalData::Loaded(data))
    }

    fn read_first_block(&self, url: &Url, validate_checksums: bool) -> Result<BlockData> {
        let path = url
            .to_file_path()
            .map_err(|_| AsdfError::Uri(format!("unsupported external reference {}", url)))?;
        let handle = StreamHandle::new(Box::new(FileStream::open(&path, false)?));
        let result = (|| {
            handle.with(|stream| {
                FileHeader::read(stream)?;
                read_tree(stream, self.io_block_size)?;
                Ok(())
            })?;
            let options = ReadOptions {
                lazy_load: false,
                memmap: false,
                validate_checksums,
                io_block_size: self.io_block_size,
            };
            let mut discovery = read_blocks(&handle, &options)?;
            let first = discovery.blocks.first_mut().ok_or_else(|| {
                AsdfError::Format(format!("external file {} has no blocks", path.display()))
            })?;
            first.materialize()
        })();
        handle.close();
        result
    }
}

fn without_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

fn resolve(base: Option<&Url>, reference: &str) -> Result<Url> {
    let resolved = match base {
        Some(base) => base.join(reference),
        None => Url::parse(reference),
    }
    .map_err(|e| AsdfError::Uri(format!("can not resolve {:?}: {}", reference, e)))?;
    Ok(without_fragment(&resolved))
}
