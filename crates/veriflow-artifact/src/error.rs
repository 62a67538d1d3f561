//! Error types for the artifact store

use crate::hash::{ArtifactId, HashError};
use std::path::PathBuf;

/// Errors raised by [`ArtifactStore`](crate::ArtifactStore) and its logs
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No artifact published under this id
    ///
    /// Recoverable: callers may recompute and `put` again.
    #[error("artifact not found: {0}")]
    NotFound(ArtifactId),

    /// A declared dependency has not been published
    #[error("dependency {dependency} of new artifact is not in the store")]
    MissingDependency { dependency: ArtifactId },

    /// Filesystem failure (disk full, permissions, ...)
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Sidecar or log entry could not be (de)serialized
    #[error("serialization error at {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Stored bytes no longer hash to their id
    #[error("integrity violation: {id} now hashes to {actual}")]
    IntegrityViolation { id: ArtifactId, actual: ArtifactId },

    /// Provenance log hash chain does not link up
    #[error("provenance chain broken at line {line}")]
    ChainBroken { line: usize },

    /// Malformed id
    #[error("hash error: {0}")]
    Hash(#[from] HashError),
}

impl StoreError {
    /// Wrap an IO error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a serde error with the path it concerns
    pub fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }

    /// Whether this is the recoverable missing-artifact case
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
