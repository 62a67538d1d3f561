//! Content-addressed artifact store
//!
//! Directory layout under the store root:
//! ```text
//! {root}/
//! ├── artifacts/
//! │   ├── .tmp/                  # staging for atomic publication
//! │   └── {ab}/                  # shard = first two hex chars of the id
//! │       ├── {id}               # blob
//! │       └── {id}.meta.json     # ArtifactRecord sidecar
//! ├── provenance.jsonl           # append-only, hash-chained
//! └── index.json                 # symbolic names (non-authoritative)
//! ```
//!
//! The sidecar is published before the blob, so the blob's existence is the
//! publication point: a reader that finds the blob always finds its metadata.
//! Publication of one id is serialized, and a stored artifact missing from
//! the provenance log gets its entry on the next `put` of the same bytes.

use crate::artifact::{ArtifactKind, ArtifactRecord};
use crate::atomic;
use crate::error::StoreError;
use crate::hash::ArtifactId;
use crate::index::NameIndex;
use crate::provenance::ProvenanceLog;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const META_SUFFIX: &str = ".meta.json";

/// Result of a [`ArtifactStore::put_tracked`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Content hash of the bytes
    pub id: ArtifactId,
    /// `false` when identical bytes were already published
    pub newly_published: bool,
}

/// Immutable, content-addressed artifact storage
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    blobs: PathBuf,
    tmp_dir: PathBuf,
    provenance: ProvenanceLog,
    names: NameIndex,
    records: DashMap<ArtifactId, ArtifactRecord>,
    publishing: DashMap<ArtifactId, Arc<tokio::sync::Mutex<()>>>,
}

impl ArtifactStore {
    /// Open (or initialize) a store rooted at `root`
    ///
    /// Leftover staging files from interrupted writes are removed.
    ///
    /// # Errors
    /// Returns error if the directories or logs cannot be created
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let blobs = root.join("artifacts");
        let tmp_dir = blobs.join(".tmp");
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| StoreError::io(&tmp_dir, e))?;
        let cleaned = clean_staging(&tmp_dir).await?;
        if cleaned > 0 {
            tracing::info!(count = cleaned, "removed stale staging files");
        }

        let provenance = ProvenanceLog::open(root.join("provenance.jsonl")).await?;
        let names = NameIndex::open(root.join("index.json"), &tmp_dir).await?;

        Ok(Self {
            root,
            blobs,
            tmp_dir,
            provenance,
            names,
            records: DashMap::new(),
            publishing: DashMap::new(),
        })
    }

    /// Store root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Provenance log
    #[inline]
    #[must_use]
    pub fn provenance(&self) -> &ProvenanceLog {
        &self.provenance
    }

    /// Name index
    #[inline]
    #[must_use]
    pub fn names(&self) -> &NameIndex {
        &self.names
    }

    /// Publish `bytes`, returning their content hash
    ///
    /// Idempotent: if the same bytes are already stored, nothing is written
    /// and the existing id is returned.
    ///
    /// # Errors
    /// - [`StoreError::MissingDependency`] if a dependency is not stored
    /// - [`StoreError::Io`] on write failure (previous artifacts unaffected)
    pub async fn put(
        &self,
        bytes: &[u8],
        kind: ArtifactKind,
        producer_stage: &str,
        dependency_ids: &[ArtifactId],
    ) -> Result<ArtifactId, StoreError> {
        self.put_tracked(bytes, kind, producer_stage, dependency_ids)
            .await
            .map(|outcome| outcome.id)
    }

    /// Like [`put`](Self::put), also reporting whether anything was written
    ///
    /// # Errors
    /// See [`put`](Self::put)
    pub async fn put_tracked(
        &self,
        bytes: &[u8],
        kind: ArtifactKind,
        producer_stage: &str,
        dependency_ids: &[ArtifactId],
    ) -> Result<PutOutcome, StoreError> {
        let id = ArtifactId::of(bytes);
        let slot = Arc::clone(self.publishing.entry(id).or_default().value());
        let guard = slot.lock().await;
        let outcome = self.publish(id, bytes, kind, producer_stage, dependency_ids).await;
        drop(guard);
        drop(slot);
        self.publishing.remove_if(&id, |_, slot| Arc::strong_count(slot) == 1);
        outcome
    }

    /// Publish under the id's slot lock
    async fn publish(
        &self,
        id: ArtifactId,
        bytes: &[u8],
        kind: ArtifactKind,
        producer_stage: &str,
        dependency_ids: &[ArtifactId],
    ) -> Result<PutOutcome, StoreError> {
        if self.contains(&id).await {
            tracing::debug!(artifact_id = %id.short(), %kind, "artifact already stored");
            if !self.provenance.is_logged(&id).await {
                let record = self.record(&id).await?;
                self.provenance.append(&record).await?;
                tracing::warn!(artifact_id = %id.short(), "restored missing provenance entry");
            }
            return Ok(PutOutcome {
                id,
                newly_published: false,
            });
        }

        for dependency in dependency_ids {
            if !self.contains(dependency).await {
                return Err(StoreError::MissingDependency {
                    dependency: *dependency,
                });
            }
        }

        let record = ArtifactRecord::new(id, kind, producer_stage, dependency_ids, bytes.len() as u64);
        let shard = self.blobs.join(id.shard());
        tokio::fs::create_dir_all(&shard)
            .await
            .map_err(|e| StoreError::io(&shard, e))?;

        let meta_path = self.meta_path(&id);
        let meta = serde_json::to_vec_pretty(&record)
            .map_err(|e| StoreError::serialization(&meta_path, e))?;
        atomic::publish(&self.tmp_dir, &meta_path, &meta).await?;
        atomic::publish(&self.tmp_dir, &self.blob_path(&id), bytes).await?;

        self.provenance.append(&record).await?;
        tracing::debug!(
            artifact_id = %id.short(),
            %kind,
            stage = producer_stage,
            deps = record.dependency_ids.len(),
            "artifact published"
        );
        self.records.insert(id, record);

        Ok(PutOutcome {
            id,
            newly_published: true,
        })
    }

    /// Read an artifact's bytes
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if nothing is stored under `id`
    pub async fn get(&self, id: &ArtifactId) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(*id)),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Metadata for a stored artifact
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if nothing is stored under `id`
    pub async fn record(&self, id: &ArtifactId) -> Result<ArtifactRecord, StoreError> {
        if let Some(record) = self.records.get(id) {
            return Ok(record.clone());
        }
        if !self.contains(id).await {
            return Err(StoreError::NotFound(*id));
        }

        let path = self.meta_path(id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        let record: ArtifactRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::serialization(&path, e))?;
        self.records.insert(*id, record.clone());
        Ok(record)
    }

    /// Direct dependencies recorded at publication
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if nothing is stored under `id`
    pub async fn dependencies_of(&self, id: &ArtifactId) -> Result<Vec<ArtifactId>, StoreError> {
        Ok(self.record(id).await?.dependency_ids)
    }

    /// Whether an artifact is published under `id`
    pub async fn contains(&self, id: &ArtifactId) -> bool {
        if self.records.contains_key(id) {
            return true;
        }
        tokio::fs::try_exists(self.blob_path(id))
            .await
            .unwrap_or(false)
    }

    /// Transitive dependency closure, breadth-first, without duplicates
    ///
    /// The starting artifact itself is not included.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if `id` or any ancestor is missing
    pub async fn lineage(&self, id: &ArtifactId) -> Result<Vec<ArtifactId>, StoreError> {
        let mut seen = HashSet::from([*id]);
        let mut queue = VecDeque::from([*id]);
        let mut ordered = Vec::new();

        while let Some(current) = queue.pop_front() {
            for dependency in self.dependencies_of(&current).await? {
                if seen.insert(dependency) {
                    ordered.push(dependency);
                    queue.push_back(dependency);
                }
            }
        }
        Ok(ordered)
    }

    /// Re-hash stored bytes and compare with the id
    ///
    /// # Errors
    /// [`StoreError::IntegrityViolation`] if the blob was altered on disk
    pub async fn verify(&self, id: &ArtifactId) -> Result<(), StoreError> {
        let actual = ArtifactId::of(&self.get(id).await?);
        if actual == *id {
            Ok(())
        } else {
            Err(StoreError::IntegrityViolation { id: *id, actual })
        }
    }

    /// Every published artifact id, sorted
    ///
    /// # Errors
    /// Returns error if the store directory cannot be listed
    pub async fn list_ids(&self) -> Result<Vec<ArtifactId>, StoreError> {
        let mut ids = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.blobs)
            .await
            .map_err(|e| StoreError::io(&self.blobs, e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.blobs, e))?
        {
            let shard_path = shard.path();
            if shard.file_name() == ".tmp" || !shard_path.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(&shard_path)
                .await
                .map_err(|e| StoreError::io(&shard_path, e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&shard_path, e))?
            {
                if let Some(id) = file.file_name().to_str().and_then(|n| n.parse().ok()) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Resolve a symbolic name, only if its target is actually stored
    pub async fn resolve_name(&self, name: &str) -> Option<ArtifactId> {
        let id = self.names.lookup(name).await?;
        if self.contains(&id).await {
            Some(id)
        } else {
            tracing::warn!(name, artifact_id = %id.short(), "name points at missing artifact");
            None
        }
    }

    fn blob_path(&self, id: &ArtifactId) -> PathBuf {
        self.blobs.join(id.shard()).join(id.to_string())
    }

    fn meta_path(&self, id: &ArtifactId) -> PathBuf {
        self.blobs.join(id.shard()).join(format!("{id}{META_SUFFIX}"))
    }
}

async fn clean_staging(tmp_dir: &Path) -> Result<usize, StoreError> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(tmp_dir)
        .await
        .map_err(|e| StoreError::io(tmp_dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(tmp_dir, e))?
    {
        let name = entry.file_name();
        if name.to_str().is_some_and(atomic::is_partial) {
            tokio::fs::remove_file(entry.path())
                .await
                .map_err(|e| StoreError::io(entry.path(), e))?;
            removed += 1;
        }
    }
    Ok(removed)
}
