use thiserror::Error;

/// Errors raised by the block layer and the document controller.
///
/// Variants fall into the families of the on-disk contract:
/// format errors abort an open, checksum and compression errors only affect
/// the block they were raised for, storage constraint errors are raised before
/// any bytes are written, and `Closed` guards every access after release.
#[derive(Error, Debug)]
pub enum AsdfError {
    #[error("Invalid file format: {0}")]
    Format(String),

    #[error("Invalid block magic at offset {offset}")]
    InvalidBlockMagic { offset: u64 },

    #[error("Invalid block index: {0}")]
    BlockIndex(String),

    #[error("Block at offset {offset} does not match given checksum")]
    ChecksumMismatch { offset: u64 },

    #[error("Unknown compression type: {0:?}")]
    UnknownCompression(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Storage constraint violated: {0}")]
    StorageConstraint(String),

    #[error("Cannot access data from closed file")]
    Closed,

    #[error("Invalid array id: {0}")]
    InvalidArray(usize),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid URI: {0}")]
    Uri(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AsdfError {
    /// True for errors that make the whole document unreadable.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            AsdfError::Format(_) | AsdfError::InvalidBlockMagic { .. } | AsdfError::BlockIndex(_)
        )
    }

    /// True for codec failures (unknown label or size mismatch).
    pub fn is_compression_error(&self) -> bool {
        matches!(
            self,
            AsdfError::UnknownCompression(_) | AsdfError::Compression(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AsdfError>;
