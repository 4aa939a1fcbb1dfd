//! Block identity types.

use std::sync::Arc;

/// Names one fetchable block of shuffle data, e.g. `shuffle_0_3_7`.
///
/// Ids are opaque to the fetch machinery: they are only compared,
/// hashed, and handed back to listeners. Cloning is cheap.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub Arc<str>);

impl std::ops::Deref for BlockId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s.into_boxed_str().into())
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl BlockId {
    /// The encoded form of this id as carried in an rpc body.
    pub fn to_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(self.0.as_bytes())
    }

    /// Parse an id out of an rpc body.
    pub fn from_bytes(b: &[u8]) -> crate::ShuffleResult<Self> {
        std::str::from_utf8(b)
            .map(Self::from)
            .map_err(|err| {
                crate::ShuffleError::other_src("invalid block id", err)
            })
    }
}
