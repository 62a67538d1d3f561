//! Append-only provenance log
//!
//! One JSON line per published artifact: `artifact_id → dependency_ids →
//! created_at`, together with its kind and producing stage. Lines are
//! hash-chained (each entry commits to the previous entry's hash) so an audit
//! can detect edits or dropped lines.
//!
//! Each artifact id is logged at most once.
//!
//! A crash in the middle of an append can leave a truncated final line.
//! Readers skip it, and [`ProvenanceLog::open`] terminates it so the next
//! append starts on a fresh line.

use crate::artifact::{ArtifactKind, ArtifactRecord};
use crate::error::StoreError;
use crate::hash::ArtifactId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Chain anchor for the first entry
const GENESIS: ArtifactId = ArtifactId::from_bytes([0u8; 32]);

/// One line of the provenance log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    /// Published artifact
    pub artifact_id: ArtifactId,
    /// Kind recorded at publication
    pub kind: ArtifactKind,
    /// Stage that produced the artifact
    pub producer_stage: String,
    /// Direct inputs, in declaration order
    pub dependency_ids: Vec<ArtifactId>,
    /// Publication time from the artifact record
    pub created_at: DateTime<Utc>,
    /// `entry_hash` of the preceding line, zero for the first
    pub prev_hash: ArtifactId,
    /// Hash over every other field
    pub entry_hash: ArtifactId,
}

impl ProvenanceEntry {
    fn link(record: &ArtifactRecord, prev_hash: ArtifactId) -> Result<Self, StoreError> {
        let mut entry = Self {
            artifact_id: record.id,
            kind: record.kind,
            producer_stage: record.producer_stage.clone(),
            dependency_ids: record.dependency_ids.clone(),
            created_at: record.created_at,
            prev_hash,
            entry_hash: GENESIS,
        };
        entry.entry_hash = entry.compute_hash()?;
        Ok(entry)
    }

    fn compute_hash(&self) -> Result<ArtifactId, StoreError> {
        let body = (
            &self.artifact_id,
            &self.kind,
            &self.producer_stage,
            &self.dependency_ids,
            &self.created_at,
            &self.prev_hash,
        );
        Ok(ArtifactId::of_serializable(&body)?)
    }
}

/// Append-only, hash-chained provenance log
#[derive(Debug)]
pub struct ProvenanceLog {
    path: PathBuf,
    writer: Mutex<ChainHead>,
}

#[derive(Debug)]
struct ChainHead {
    file: tokio::fs::File,
    last_hash: ArtifactId,
    logged: HashSet<ArtifactId>,
}

impl ProvenanceLog {
    /// Open (or create) the log at `path`
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or repaired
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let existing = read_if_exists(&path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        if !existing.is_empty() && !existing.ends_with('\n') {
            tracing::warn!(path = %path.display(), "terminating truncated provenance line");
            file.write_all(b"\n")
                .await
                .map_err(|e| StoreError::io(&path, e))?;
        }

        let entries = parse_lines(&existing);
        let last_hash = entries.last().map_or(GENESIS, |(_, entry)| entry.entry_hash);
        let logged = entries.iter().map(|(_, entry)| entry.artifact_id).collect();

        Ok(Self {
            path,
            writer: Mutex::new(ChainHead {
                file,
                last_hash,
                logged,
            }),
        })
    }

    /// Location on disk
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `id` already has an entry
    pub async fn is_logged(&self, id: &ArtifactId) -> bool {
        self.writer.lock().await.logged.contains(id)
    }

    /// Append an entry for a published artifact
    ///
    /// Returns `None` without writing if the artifact is already logged.
    ///
    /// # Errors
    /// Returns error if the line cannot be written and synced
    pub async fn append(&self, record: &ArtifactRecord) -> Result<Option<ProvenanceEntry>, StoreError> {
        let mut head = self.writer.lock().await;
        if head.logged.contains(&record.id) {
            return Ok(None);
        }
        let entry = ProvenanceEntry::link(record, head.last_hash)?;

        let mut line =
            serde_json::to_vec(&entry).map_err(|e| StoreError::serialization(&self.path, e))?;
        line.push(b'\n');

        head.file
            .write_all(&line)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        head.file
            .sync_data()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        head.last_hash = entry.entry_hash;
        head.logged.insert(record.id);
        Ok(Some(entry))
    }

    /// All readable entries, first entry per artifact id
    ///
    /// # Errors
    /// Returns error if the file cannot be read
    pub async fn entries(&self) -> Result<Vec<ProvenanceEntry>, StoreError> {
        let text = read_if_exists(&self.path).await?;
        let mut seen = HashSet::new();
        Ok(parse_lines(&text)
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| seen.insert(entry.artifact_id))
            .collect())
    }

    /// Dependency map reconstructed from the log alone
    ///
    /// # Errors
    /// Returns error if the file cannot be read
    pub async fn dependency_map(&self) -> Result<HashMap<ArtifactId, Vec<ArtifactId>>, StoreError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|e| (e.artifact_id, e.dependency_ids))
            .collect())
    }

    /// Check that every line links to its predecessor and hashes correctly
    ///
    /// Returns the number of verified entries.
    ///
    /// # Errors
    /// [`StoreError::ChainBroken`] naming the first bad line
    pub async fn verify_chain(&self) -> Result<usize, StoreError> {
        let text = read_if_exists(&self.path).await?;
        let mut prev = GENESIS;
        let mut count = 0;
        for (line, entry) in parse_lines(&text) {
            if entry.prev_hash != prev || entry.compute_hash()? != entry.entry_hash {
                return Err(StoreError::ChainBroken { line });
            }
            prev = entry.entry_hash;
            count += 1;
        }
        Ok(count)
    }
}

async fn read_if_exists(path: &Path) -> Result<String, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Parse complete lines, returning 1-based line numbers. Unparseable lines
/// (truncated appends) are skipped.
fn parse_lines(text: &str) -> Vec<(usize, ProvenanceEntry)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str(line) {
            Ok(entry) => Some((idx + 1, entry)),
            Err(e) => {
                tracing::warn!(line = idx + 1, error = %e, "skipping unreadable provenance line");
                None
            }
        })
        .collect()
}
