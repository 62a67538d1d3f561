//! Content-addressed identifiers
//!
//! Provides [`ArtifactId`], the 32-byte Blake3 digest that names every
//! artifact. The id is a pure function of the stored bytes, so identical
//! content always resolves to the same id.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Length of the hex form of an [`ArtifactId`]
pub const ID_HEX_LEN: usize = 64;

/// A 32-byte content hash (Blake3) identifying an artifact
///
/// Immutable and `Copy`. Serializes as a lowercase hex string so that
/// checkpoints, provenance entries and the name index stay human-readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId([u8; 32]);

impl ArtifactId {
    /// Wrap raw digest bytes
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash arbitrary content
    #[inline]
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    /// Hash the JSON encoding of a value
    ///
    /// `serde_json` emits struct fields in declaration order and map entries
    /// in iteration order, so callers hashing maps should use ordered maps.
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn of_serializable<T>(value: &T) -> Result<Self, HashError>
    where
        T: serde::Serialize,
    {
        let json = serde_json::to_vec(value)?;
        Ok(Self::of(&json))
    }

    /// Short string representation (first 12 hex chars), for logs
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Two-character shard directory name used by the on-disk layout
    #[inline]
    #[must_use]
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ArtifactId {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_HEX_LEN {
            return Err(HashError::InvalidLength {
                expected: ID_HEX_LEN,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for ArtifactId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl serde::Serialize for ArtifactId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ArtifactId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur when working with artifact ids
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Wrong number of hex characters
    #[error("invalid artifact id length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex decoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn id_is_pure_function_of_content() {
        assert_eq!(ArtifactId::of(b"hello"), ArtifactId::of(b"hello"));
        assert_ne!(ArtifactId::of(b"hello"), ArtifactId::of(b"hello "));
    }

    #[test]
    fn display_parse_roundtrip() {
        let id = ArtifactId::of(b"payload");
        let text = id.to_string();
        assert_eq!(text.len(), ID_HEX_LEN);
        assert_eq!(text.parse::<ArtifactId>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        let result = "abcd".parse::<ArtifactId>();
        assert!(matches!(
            result,
            Err(HashError::InvalidLength { expected: 64, actual: 4 })
        ));
    }

    #[test]
    fn parse_rejects_non_hex() {
        let bad = "z".repeat(ID_HEX_LEN);
        assert!(matches!(bad.parse::<ArtifactId>(), Err(HashError::HexDecode(_))));
    }

    #[test]
    fn short_and_shard_are_prefixes() {
        let id = ArtifactId::of(b"test");
        let full = id.to_string();
        assert!(full.starts_with(&id.short()));
        assert!(full.starts_with(&id.shard()));
        assert_eq!(id.shard().len(), 2);
    }

    #[test]
    fn serde_uses_hex_string() {
        let id = ArtifactId::of(b"serde");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: ArtifactId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn serializable_hash_is_stable() {
        let a = ArtifactId::of_serializable(&("unit", 1)).unwrap();
        let b = ArtifactId::of_serializable(&("unit", 1)).unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn ids_follow_content(a in prop::collection::vec(any::<u8>(), 0..256), b in prop::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(ArtifactId::of(&a) == ArtifactId::of(&b), a == b);
            let id = ArtifactId::of(&a);
            prop_assert_eq!(id.to_string().parse::<ArtifactId>().unwrap(), id);
        }
    }
}
