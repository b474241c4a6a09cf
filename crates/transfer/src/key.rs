//! Content address of a chunk.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// SHA-256 of a chunk's bytes. Rendered as lowercase hex in object names
/// and index lines.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey([u8; 32]);

/// Error returned by [`ChunkKey::from_hex`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KeyDecodeError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("zero key is reserved")]
    Zero,
}

impl ChunkKey {
    /// Reserved "no key" value; never produced by [`ChunkKey::from_bytes`].
    pub const ZERO: ChunkKey = ChunkKey([0u8; 32]);

    /// Hashes `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ChunkKey(hasher.finalize().into())
    }

    /// Parses a 64-character hex key. Upper-case digits are accepted.
    pub fn from_hex(s: &str) -> Result<Self, KeyDecodeError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        let key = ChunkKey(out);
        if key.is_zero() {
            return Err(KeyDecodeError::Zero);
        }
        Ok(key)
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey({})", self.to_hex())
    }
}

impl FromStr for ChunkKey {
    type Err = KeyDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
