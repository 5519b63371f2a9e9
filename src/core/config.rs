//! Configuration for the block layer
//!
//! An [`AsdfConfig`] is an explicit value: the [`BlockManager`] takes one by
//! reference when it is built and never consults ambient state afterwards.
//! Callers that want scoped overrides use [`config_context`], which pushes a
//! copy of the effective configuration onto a thread-local stack and pops it
//! again when the guard drops. Threads without an active context fall back to
//! the process-wide default.
//!
//! [`BlockManager`]: crate::core::manager::BlockManager

use crate::core::block::ArrayStorage;
use crate::core::compression::CompressionLabel;
use crate::core::error::{AsdfError, Result};
use crate::core::format::{Padding, DEFAULT_IO_BLOCK_SIZE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::OnceLock;
use validator::Validate;

/// Default number of external documents kept in the external block cache
pub const DEFAULT_EXTERNAL_CACHE_CAPACITY: usize = 64;

/// Block layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AsdfConfig {
    /// Validate every block checksum on first access, not only the first block
    pub validate_checksums: bool,

    /// Defer reading block payloads until they are accessed
    pub lazy_load: bool,

    /// Memory map uncompressed payloads of read-only documents
    pub memmap: bool,

    /// Storage override applied to every array at write time
    pub all_array_storage: Option<ArrayStorage>,

    /// Compression override applied to every binary block at write time
    pub all_array_compression: Option<CompressionLabel>,

    /// Arrays smaller than this many bytes are stored inline when their
    /// storage has not been assigned explicitly
    pub array_inline_threshold: Option<usize>,

    /// Filesystem block size used for padding and index scanning
    #[validate(range(min = 1))]
    pub io_block_size: usize,

    /// Maximum number of external documents held by the cache
    #[validate(range(min = 1))]
    pub external_cache_capacity: usize,

    /// Write a block index after the last block when possible
    pub include_block_index: bool,

    /// Reserve padding after the tree and each block for in-place growth
    pub pad_blocks: Padding,
}

impl Default for AsdfConfig {
    fn default() -> Self {
        AsdfConfig {
            validate_checksums: false,
            lazy_load: true,
            memmap: false,
            all_array_storage: None,
            all_array_compression: None,
            array_inline_threshold: None,
            io_block_size: DEFAULT_IO_BLOCK_SIZE,
            external_cache_capacity: DEFAULT_EXTERNAL_CACHE_CAPACITY,
            include_block_index: true,
            pad_blocks: Padding::None,
        }
    }
}

impl AsdfConfig {
    /// Parse and validate a configuration from TOML text
    ///
    /// # Examples
    ///
    /// ```
    /// use asdf_rs::AsdfConfig;
    ///
    /// let config = AsdfConfig::from_toml_str("validate_checksums = true\nio_block_size = 512").unwrap();
    /// assert!(config.validate_checksums);
    /// assert_eq!(config.io_block_size, 512);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AsdfConfig =
            toml::from_str(text).map_err(|e| AsdfError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Run field validation, mapping failures to [`AsdfError::Config`]
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AsdfError::Config(e.to_string()))?;
        self.pad_blocks.check()?;
        if matches!(self.all_array_storage, Some(ArrayStorage::Streamed)) {
            return Err(AsdfError::Config(
                "all_array_storage can not be 'streamed'".to_string(),
            ));
        }
        Ok(())
    }
}

fn global() -> &'static RwLock<AsdfConfig> {
    static GLOBAL: OnceLock<RwLock<AsdfConfig>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(AsdfConfig::default()))
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<AsdfConfig>> = const { RefCell::new(Vec::new()) };
}

/// Effective configuration for the calling thread
pub fn get_config() -> AsdfConfig {
    CONTEXT_STACK
        .with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(|| global().read().clone())
}

/// Replace the process-wide default configuration
pub fn set_global_config(config: AsdfConfig) -> Result<()> {
    config.check()?;
    *global().write() = config;
    Ok(())
}

/// Push a copy of the effective configuration for the calling thread
///
/// Changes made through the returned guard are visible to [`get_config`] on
/// this thread until the guard drops.
///
/// # Examples
///
/// ```
/// use asdf_rs::{config_context, get_config};
///
/// {
///     let ctx = config_context();
///     ctx.update(|c| c.validate_checksums = true);
///     assert!(get_config().validate_checksums);
/// }
/// assert!(!get_config().validate_checksums);
/// ```
pub fn config_context() -> ConfigGuard {
    let snapshot = get_config();
    CONTEXT_STACK.with(|stack| stack.borrow_mut().push(snapshot));
    let depth = CONTEXT_STACK.with(|stack| stack.borrow().len());
    ConfigGuard {
        depth,
        _not_send: PhantomData,
    }
}

/// Scope guard returned by [`config_context`]
pub struct ConfigGuard {
    depth: usize,
    // the guard indexes a thread-local stack
    _not_send: PhantomData<*const ()>,
}

impl ConfigGuard {
    /// Modify the configuration owned by this guard
    pub fn update<F: FnOnce(&mut AsdfConfig)>(&self, f: F) {
        CONTEXT_STACK.with(|stack| {
            if let Some(config) = stack.borrow_mut().get_mut(self.depth - 1) {
                f(config);
            }
        });
    }

    /// Snapshot of the configuration owned by this guard
    pub fn config(&self) -> AsdfConfig {
        CONTEXT_STACK
            .with(|stack| stack.borrow().get(self.depth - 1).cloned())
            .unwrap_or_default()
    }
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().truncate(self.depth - 1));
    }
}
