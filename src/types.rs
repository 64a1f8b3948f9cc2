//! Core identifier types used throughout the distribution daemon
//!
//! Everything in the system is keyed by [`ArtifactReference`]: the content
//! store, the download registry and the wire protocol all use it as the
//! lookup key. References are opaque content-derived strings with value
//! equality and hashing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum accepted length of a reference string
///
/// A SHA-256 hex digest is 64 characters; anything much longer is a sign of
/// a corrupt or hostile peer message.
pub const MAX_REFERENCE_LEN: usize = 256;

/// Error returned when a reference string fails validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidReference {
    value: String,
    reason: &'static str,
}

impl fmt::Display for InvalidReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid artifact reference '{}': {}",
            self.value, self.reason
        )
    }
}

impl std::error::Error for InvalidReference {}

/// Content-derived identifier for a distributable artifact
///
/// The reference doubles as the on-disk file name of the cached artifact, so
/// construction rejects strings that cannot be used as a single path
/// component (separators, `.`/`..`, NUL). Equality and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactReference(String);

impl ArtifactReference {
    /// Create a reference from an externally supplied string
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidReference> {
        let value = value.into();

        let reason = if value.is_empty() {
            Some("empty")
        } else if value.len() > MAX_REFERENCE_LEN {
            Some("too long")
        } else if value == "." || value == ".." {
            Some("not a valid path component")
        } else if value
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
        {
            Some("contains path separator or control character")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidReference { value, reason }),
            None => Ok(Self(value)),
        }
    }

    /// Derive a reference from artifact content (SHA-256, lowercase hex)
    #[must_use]
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self(hex::encode(digest))
    }

    /// The underlying reference string
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `content` hashes to this reference
    ///
    /// Only meaningful for references produced by [`Self::from_content`];
    /// a reference that is not a hex digest never matches any content.
    #[must_use]
    pub fn matches_content(&self, content: &[u8]) -> bool {
        self.0 == Self::from_content(content).0
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactReference {
    type Error = InvalidReference;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ArtifactReference> for String {
    fn from(reference: ArtifactReference) -> Self {
        reference.0
    }
}

/// Identifier for configured source nodes
///
/// Index into the configured source list; stable for the lifetime of the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(usize);

impl SourceId {
    /// Create a source ID from an index into the source list
    #[must_use]
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Get the underlying index
    #[must_use]
    #[inline]
    pub const fn as_index(&self) -> usize {
        self.0
    }
}

impl From<usize> for SourceId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_reference_accepts_hex_digest() {
        let r = ArtifactReference::new("a".repeat(64)).unwrap();
        assert_eq!(r.as_str().len(), 64);
    }

    #[test]
    fn test_reference_rejects_empty() {
        assert!(ArtifactReference::new("").is_err());
    }

    #[test]
    fn test_reference_rejects_path_separators() {
        assert!(ArtifactReference::new("a/b").is_err());
        assert!(ArtifactReference::new("a\\b").is_err());
        assert!(ArtifactReference::new("..").is_err());
        assert!(ArtifactReference::new(".").is_err());
    }

    #[test]
    fn test_reference_rejects_control_characters() {
        assert!(ArtifactReference::new("abc\0def").is_err());
        assert!(ArtifactReference::new("abc\ndef").is_err());
    }

    #[test]
    fn test_reference_rejects_overlong() {
        assert!(ArtifactReference::new("x".repeat(MAX_REFERENCE_LEN + 1)).is_err());
    }

    #[test]
    fn test_from_content_is_deterministic() {
        let a = ArtifactReference::from_content(b"payload");
        let b = ArtifactReference::from_content(b"payload");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_from_content_differs_for_different_content() {
        let a = ArtifactReference::from_content(b"one");
        let b = ArtifactReference::from_content(b"two");
        assert_ne!(a, b);
    }

    #[test]
    fn test_matches_content() {
        let payload = b"some artifact bytes";
        let r = ArtifactReference::from_content(payload);
        assert!(r.matches_content(payload));
        assert!(!r.matches_content(b"other bytes"));
    }

    #[test]
    fn test_reference_equality_and_hash() {
        let a = ArtifactReference::new("ref1").unwrap();
        let b = ArtifactReference::new("ref1").unwrap();
        let c = ArtifactReference::new("ref2").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_reference_serde_round_trip() {
        let r = ArtifactReference::new("abc123").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"abc123\"");
        let back: ArtifactReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_reference_serde_rejects_invalid() {
        let result: Result<ArtifactReference, _> = serde_json::from_str("\"a/b\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_source_id_basics() {
        let s0 = SourceId::from_index(0);
        let s1 = SourceId::from_index(1);
        assert_ne!(s0, s1);
        assert_eq!(s0.as_index(), 0);
        assert_eq!(format!("{}", s1), "Source(1)");
    }

    #[test]
    fn test_source_id_const_fn() {
        const ID: SourceId = SourceId::from_index(3);
        assert_eq!(ID.as_index(), 3);
    }
}
