//! Per-run audit log
//!
//! One JSON line per pipeline operation, at `audit/{run_id}.jsonl`. Lines are
//! appended under an async mutex so concurrent writers never interleave.
//! Every entry is also emitted as a `tracing` event.

use crate::error::StateError;
use crate::types::{BatchId, RunId, UnitError, UnitId};
use crate::verify::AttestationOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use veriflow_artifact::ArtifactId;

/// Kind of audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Raw input stored
    Ingest,
    /// Batches planned
    Plan,
    /// Producer call
    Compute,
    /// Verifier panel
    Verify,
    /// One batch consolidated
    Consolidate,
    /// Batches rolled up into the final dataset
    Rollup,
    /// Run resumed from a checkpoint
    Resume,
    /// Run stopped before completion
    Halt,
    /// Run completed
    Complete,
}

/// One audit line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Operation
    pub operation: OperationKind,
    /// Run
    pub run_id: RunId,
    /// Unit concerned, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<UnitId>,
    /// Batch concerned, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    /// Artifacts read
    #[serde(default)]
    pub input_ids: Vec<ArtifactId>,
    /// Artifacts written
    #[serde(default)]
    pub output_ids: Vec<ArtifactId>,
    /// Verification outcome, for `Verify`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttestationOutcome>,
    /// Operation start
    pub started_at: DateTime<Utc>,
    /// Operation end
    pub finished_at: DateTime<Utc>,
    /// Retries before this operation (attempt number minus one)
    pub retry_count: u32,
    /// Failure, if the operation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
}

impl AuditEntry {
    /// Create new entry spanning `started_at` to now
    #[must_use]
    pub fn new(operation: OperationKind, run_id: RunId, started_at: DateTime<Utc>) -> Self {
        Self {
            operation,
            run_id,
            unit_id: None,
            batch_id: None,
            input_ids: Vec::new(),
            output_ids: Vec::new(),
            outcome: None,
            started_at,
            finished_at: Utc::now(),
            retry_count: 0,
            error: None,
        }
    }

    /// With unit
    #[inline]
    #[must_use]
    pub fn unit(mut self, unit_id: &UnitId) -> Self {
        self.unit_id = Some(unit_id.clone());
        self
    }

    /// With batch
    #[inline]
    #[must_use]
    pub fn batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// With input and output artifacts
    #[inline]
    #[must_use]
    pub fn artifacts(mut self, inputs: Vec<ArtifactId>, outputs: Vec<ArtifactId>) -> Self {
        self.input_ids = inputs;
        self.output_ids = outputs;
        self
    }

    /// With verification outcome
    #[inline]
    #[must_use]
    pub fn outcome(mut self, outcome: AttestationOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// With retry count
    #[inline]
    #[must_use]
    pub fn retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// With failure
    #[inline]
    #[must_use]
    pub fn error(mut self, error: UnitError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Append-only JSONL audit log for one run
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl AuditLog {
    /// Open (or create) the log for `run_id` under `dir`
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be opened
    pub async fn open(dir: &Path, run_id: RunId) -> Result<Self, StateError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StateError::io(dir, e))?;
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StateError::io(&path, e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location on disk
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry
    ///
    /// # Errors
    /// Returns error if the line cannot be written
    pub async fn record(&self, entry: &AuditEntry) -> Result<(), StateError> {
        tracing::debug!(
            run_id = %entry.run_id,
            operation = ?entry.operation,
            unit_id = entry.unit_id.as_ref().map(UnitId::as_str),
            batch_id = entry.batch_id.map(|b| b.to_string()),
            outcome = entry.outcome.map(|o| o.to_string()),
            retries = entry.retry_count,
            "audit"
        );
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| StateError::io(&self.path, e))?;
        file.flush().await.map_err(|e| StateError::io(&self.path, e))?;
        Ok(())
    }

    /// Read every complete entry back
    ///
    /// # Errors
    /// Returns error if the file cannot be read
    pub async fn entries(&self) -> Result<Vec<AuditEntry>, StateError> {
        read_entries(&self.path).await
    }
}

/// Read the audit entries of a log file, skipping unreadable lines
///
/// # Errors
/// Returns error if the file cannot be read
pub async fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, StateError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StateError::io(path, e))?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
