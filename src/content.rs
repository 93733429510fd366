//! Content addressing of record blobs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::RegistryError;

const SHA256_PREFIX: &str = "sha256:";
pub const MAX_POINTER_LEN: usize = 256;

/// Reference to a record's content in the external blob store.
///
/// Either a content hash produced by [`address`] or an externally issued
/// reference such as an IPFS CID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordPointer(String);

impl RecordPointer {
    /// Validate an externally produced pointer.
    pub fn parse(raw: impl Into<String>) -> Result<Self, RegistryError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(RegistryError::InvalidPointer {
                reason: "pointer is empty".to_string(),
            });
        }
        if raw.len() > MAX_POINTER_LEN {
            return Err(RegistryError::InvalidPointer {
                reason: format!("pointer is {} bytes, limit is {}", raw.len(), MAX_POINTER_LEN),
            });
        }
        if let Some(c) = raw.chars().find(|c| !c.is_ascii_graphic()) {
            return Err(RegistryError::InvalidPointer {
                reason: format!("pointer contains disallowed character {:?}", c),
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordPointer {
    type Error = RegistryError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<RecordPointer> for String {
    fn from(pointer: RecordPointer) -> Self {
        pointer.0
    }
}

/// Content-address a blob.
pub fn address(blob: &[u8]) -> RecordPointer {
    RecordPointer(format!("{}{:x}", SHA256_PREFIX, Digest::of(blob)))
}

/// Whether `blob` is the content `pointer` was addressed from.
///
/// Always false for pointers not produced by [`address`].
pub fn matches(pointer: &RecordPointer, blob: &[u8]) -> bool {
    pointer.0.starts_with(SHA256_PREFIX) && *pointer == address(blob)
}
