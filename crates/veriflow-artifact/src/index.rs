//! Human-readable name index
//!
//! Maps symbolic names such as `runs/<run_id>/final-dataset` to artifact ids
//! for operators. The index is a convenience only: the content hash is the
//! authoritative reference, a corrupt index file is replaced by an empty one,
//! and a name pointing at a missing artifact simply does not resolve.

use crate::atomic;
use crate::error::StoreError;
use crate::hash::ArtifactId;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Symbolic name → artifact id links, persisted as one JSON object
#[derive(Debug)]
pub struct NameIndex {
    path: PathBuf,
    tmp_dir: PathBuf,
    links: Mutex<BTreeMap<String, ArtifactId>>,
}

impl NameIndex {
    /// Load the index at `path`, staging rewrites in `tmp_dir`
    ///
    /// # Errors
    /// Returns error only on IO failures other than a missing file
    pub async fn open(path: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let links = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable name index");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        Ok(Self {
            path,
            tmp_dir: tmp_dir.into(),
            links: Mutex::new(links),
        })
    }

    /// Point `name` at `id`, replacing any previous link
    ///
    /// # Errors
    /// Returns error if the index cannot be rewritten
    pub async fn link(&self, name: impl Into<String>, id: ArtifactId) -> Result<(), StoreError> {
        let mut links = self.links.lock().await;
        links.insert(name.into(), id);
        let bytes = serde_json::to_vec_pretty(&*links)
            .map_err(|e| StoreError::serialization(&self.path, e))?;
        atomic::publish(&self.tmp_dir, &self.path, &bytes).await
    }

    /// Current link for `name`, without checking the target exists
    pub async fn lookup(&self, name: &str) -> Option<ArtifactId> {
        self.links.lock().await.get(name).copied()
    }

    /// Snapshot of every link
    pub async fn links(&self) -> BTreeMap<String, ArtifactId> {
        self.links.lock().await.clone()
    }
}
