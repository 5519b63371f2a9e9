//! ASDF block storage engine
//!
//! Everything below the tree: byte streams, the block header codec, codecs,
//! checksums, block discovery, the write and update paths and the external
//! block cache.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy
//! - [`config`] - Configuration and the thread-local override stack
//! - [`io`] - Stream capabilities ([`io::ByteStream`]) and concrete streams
//! - [`format`] - Constants, block headers, padding and the tree envelope
//! - [`checksum`] - MD5 block digests
//! - [`compression`] - Codec registry and builtin codecs
//! - [`block`] - The block state machine
//! - [`index`] - Block index
//! - [`reader`] - Block discovery
//! - [`writer`] - Block encoding and serial writing
//! - [`layout`] - Placement for in-place updates
//! - [`manager`] - [`BlockManager`]: plan, write, update, close
//! - [`external`] - External block cache
//!
//! ## File Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ #ASDF 1.0.0                                 │
//! │ #ASDF_STANDARD 1.5.0                        │
//! ├─────────────────────────────────────────────┤
//! │ %YAML 1.1 ... tree ... "...\n"              │
//! │ (zero padding)                              │
//! ├─────────────────────────────────────────────┤
//! │ Block 0: \xd3BLK | header | data | padding  │
//! │ Block 1 ...                                 │
//! ├─────────────────────────────────────────────┤
//! │ Streamed block (optional, runs to EOF)      │
//! ├─────────────────────────────────────────────┤
//! │ #ASDF BLOCK INDEX (optional)                │
//! └─────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod error;
pub mod external;
pub mod format;
pub mod index;
pub mod io;
pub mod layout;
pub mod manager;
pub mod reader;
pub mod writer;

// Re-export commonly used types
pub use block::{ArrayStorage, Block, BlockData, ChecksumMode, DataRef};
pub use compression::{CompressionLabel, CompressionOptions, Compressor};
pub use config::{config_context, get_config, set_global_config, AsdfConfig, ConfigGuard};
pub use error::{AsdfError, Result};
pub use format::{BlockHeader, FileHeader, Padding};
pub use io::{ByteStream, FileStream, InputStream, MemoryStream, OutputStream, StreamHandle};
pub use manager::{
    BlockId, BlockManager, Source, SourceMap, UpdateOutcome, WritePlan, WriteSettings,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
