//! Block digests
//!
//! Blocks record the MD5 digest of their uncompressed payload. The digest is
//! an integrity check against accidental corruption, not a security feature.

use md5::{Digest, Md5};

pub type Checksum = [u8; 16];

/// Digest of an uncompressed payload
pub fn compute(data: &[u8]) -> Checksum {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compare a payload against a recorded digest
///
/// An all-zero digest means none was recorded and always verifies.
pub fn verify(data: &[u8], expected: &Checksum) -> bool {
    if *expected == [0u8; 16] {
        return true;
    }
    compute(data) == *expected
}
