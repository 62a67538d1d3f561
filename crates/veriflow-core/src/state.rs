//! Crash-safe checkpointing of pipeline state
//!
//! Layout under the state root:
//! ```text
//! state/
//! ├── .tmp/                              # staging for atomic publication
//! ├── {run_id}/
//! │   ├── 000000000001-ingest.json
//! │   └── 000000000002-per-unit-processing.json
//! └── archive/{run_id}/                  # retired runs
//! ```
//!
//! Each file is a [`CheckpointEnvelope`] carrying the state and its content
//! hash. Files are published by atomic rename, so a partially written
//! checkpoint is never visible; a corrupted one (bad JSON, hash mismatch) is
//! logged and skipped in favour of the previous sequence.

use crate::error::StateError;
use crate::types::{PipelineState, RunId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use veriflow_artifact::{atomic, ArtifactId};

/// Envelope format written by this version
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Checkpoints kept per run unless configured otherwise
pub const DEFAULT_RETAIN: usize = 4;

/// On-disk checkpoint file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    /// Envelope format
    pub format_version: u32,
    /// Per-run sequence number
    pub sequence: u64,
    /// [`PipelineState::content_hash`] of `state`
    pub state_hash: ArtifactId,
    /// Snapshot
    pub state: PipelineState,
}

/// A durable checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Sequence number
    pub sequence: u64,
    /// File location
    pub path: PathBuf,
    /// Content hash of the state
    pub state_hash: ArtifactId,
}

/// Writes and recovers [`PipelineState`] checkpoints
#[derive(Debug)]
pub struct StateRecorder {
    root: PathBuf,
    tmp_dir: PathBuf,
    retain: usize,
    sequences: Mutex<HashMap<RunId, u64>>,
}

impl StateRecorder {
    /// Open (or initialize) the state directory at `root`
    ///
    /// `retain` is raised to 2 if lower, so the previous checkpoint always
    /// survives while a new one is published.
    ///
    /// # Errors
    /// Returns error if the directories cannot be created
    pub async fn open(root: impl Into<PathBuf>, retain: usize) -> Result<Self, StateError> {
        let root = root.into();
        let tmp_dir = root.join(".tmp");
        for dir in [&root, &tmp_dir, &root.join("archive")] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StateError::io(dir, e))?;
        }
        Ok(Self {
            root,
            tmp_dir,
            retain: retain.max(2),
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding a live run's checkpoints
    #[must_use]
    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Directory holding a retired run's checkpoints
    #[must_use]
    pub fn archive_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join("archive").join(run_id.to_string())
    }

    /// Durably record `state` as the run's newest checkpoint
    ///
    /// # Errors
    /// Returns error if the checkpoint cannot be encoded or published; the
    /// previous checkpoint is unaffected
    pub async fn checkpoint(&self, state: &PipelineState) -> Result<CheckpointInfo, StateError> {
        let mut sequences = self.sequences.lock().await;
        let last = match sequences.get(&state.run_id) {
            Some(seq) => *seq,
            None => self.highest_sequence(state.run_id).await?,
        };
        let sequence = last + 1;

        let run_dir = self.run_dir(state.run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| StateError::io(&run_dir, e))?;

        let state_hash = state.content_hash()?;
        let envelope = CheckpointEnvelope {
            format_version: STATE_FORMAT_VERSION,
            sequence,
            state_hash,
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        let path = run_dir.join(checkpoint_name(sequence, state.current_stage.as_str()));
        atomic::publish(&self.tmp_dir, &path, &bytes).await?;
        sequences.insert(state.run_id, sequence);
        drop(sequences);

        tracing::debug!(
            run_id = %state.run_id,
            sequence,
            stage = %state.current_stage,
            state_hash = %state_hash.short(),
            "checkpoint written"
        );
        self.prune(&run_dir).await;

        Ok(CheckpointInfo {
            sequence,
            path,
            state_hash,
        })
    }

    /// Newest valid checkpoint of a run, live or archived
    ///
    /// # Errors
    /// [`StateError::NotFound`] if no checkpoint parses and matches its hash
    pub async fn load_latest(&self, run_id: RunId) -> Result<PipelineState, StateError> {
        // An interrupted archive leaves checkpoints split across both directories
        let mut files = list_checkpoints(&self.run_dir(run_id)).await?;
        files.extend(list_checkpoints(&self.archive_dir(run_id)).await?);
        files.sort_by(|a, b| b.0.cmp(&a.0));

        for (sequence, path) in files {
            match read_checkpoint(&path, run_id).await {
                Ok(state) => {
                    tracing::info!(%run_id, sequence, stage = %state.current_stage, "loaded checkpoint");
                    return Ok(state);
                }
                Err(reason) => {
                    tracing::warn!(%run_id, sequence, path = %path.display(), %reason, "skipping corrupt checkpoint");
                }
            }
        }
        Err(StateError::NotFound(run_id))
    }

    /// Sequence numbers and paths of a live run's checkpoints, ascending
    ///
    /// # Errors
    /// Returns error if the run directory cannot be listed
    pub async fn checkpoints(&self, run_id: RunId) -> Result<Vec<(u64, PathBuf)>, StateError> {
        let mut files = list_checkpoints(&self.run_dir(run_id)).await?;
        files.sort_by_key(|(seq, _)| *seq);
        Ok(files)
    }

    /// Retire a finished run
    ///
    /// Writes a final checkpoint, then moves the run's checkpoints into
    /// `archive/{run_id}`. Nothing is deleted.
    ///
    /// # Errors
    /// Returns error if the checkpoint or a move fails
    pub async fn archive(&self, state: &PipelineState) -> Result<PathBuf, StateError> {
        self.checkpoint(state).await?;

        let run_dir = self.run_dir(state.run_id);
        let archive_dir = self.archive_dir(state.run_id);
        tokio::fs::create_dir_all(&archive_dir)
            .await
            .map_err(|e| StateError::io(&archive_dir, e))?;

        for (_, path) in list_checkpoints(&run_dir).await? {
            if let Some(name) = path.file_name() {
                let dest = archive_dir.join(name);
                tokio::fs::rename(&path, &dest)
                    .await
                    .map_err(|e| StateError::io(&dest, e))?;
            }
        }
        if let Err(e) = tokio::fs::remove_dir(&run_dir).await {
            tracing::debug!(path = %run_dir.display(), error = %e, "run directory not removed");
        }

        tracing::info!(run_id = %state.run_id, path = %archive_dir.display(), "run archived");
        Ok(archive_dir)
    }

    async fn highest_sequence(&self, run_id: RunId) -> Result<u64, StateError> {
        let mut highest = 0;
        for dir in [self.run_dir(run_id), self.archive_dir(run_id)] {
            if let Some(seq) = list_checkpoints(&dir).await?.into_iter().map(|(s, _)| s).max() {
                highest = highest.max(seq);
            }
        }
        Ok(highest)
    }

    /// Drop checkpoints beyond the newest `retain`. Failures only log.
    async fn prune(&self, run_dir: &Path) {
        let mut files = match list_checkpoints(run_dir).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "could not list checkpoints for pruning");
                return;
            }
        };
        if files.len() <= self.retain {
            return;
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));
        for (sequence, path) in files.into_iter().skip(self.retain) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(sequence, error = %e, "could not prune checkpoint");
            }
        }
    }
}

fn checkpoint_name(sequence: u64, stage: &str) -> String {
    format!("{sequence:012}-{stage}.json")
}

fn parse_sequence(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".json")?;
    let (seq, _stage) = stem.split_once('-')?;
    seq.parse().ok()
}

async fn list_checkpoints(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StateError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StateError::io(dir, e)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| StateError::io(dir, e))? {
        if let Some(seq) = entry.file_name().to_str().and_then(parse_sequence) {
            files.push((seq, entry.path()));
        }
    }
    Ok(files)
}

async fn read_checkpoint(path: &Path, run_id: RunId) -> Result<PipelineState, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let envelope: CheckpointEnvelope = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    if envelope.format_version != STATE_FORMAT_VERSION {
        return Err(format!("unsupported format version {}", envelope.format_version));
    }
    if envelope.state.run_id != run_id {
        return Err(format!("belongs to run {}", envelope.state.run_id));
    }
    let actual = envelope.state.content_hash().map_err(|e| e.to_string())?;
    if actual != envelope.state_hash {
        return Err(format!("state hash mismatch: recorded {}, actual {}", envelope.state_hash.short(), actual.short()));
    }
    Ok(envelope.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Stage, UnitId, UnitStatus, WorkUnit};

    async fn recorder(retain: usize) -> (tempfile::TempDir, StateRecorder) {
        let dir = tempfile::tempdir().unwrap();
        let recorder = StateRecorder::open(dir.path().join("state"), retain).await.unwrap();
        (dir, recorder)
    }

    fn state_with_units(run_id: RunId, n: usize) -> PipelineState {
        let mut state = PipelineState::new(run_id);
        state.current_stage = Stage::PerUnitProcessing;
        for i in 0..n {
            let id = UnitId::new(format!("u{i}"));
            state
                .work_units
                .insert(id.clone(), WorkUnit::new(id, ArtifactId::of(&[u8::try_from(i).unwrap()])));
        }
        state
    }

    #[tokio::test]
    async fn latest_checkpoint_wins() {
        let (_dir, recorder) = recorder(4).await;
        let run_id = RunId::new();
        let mut state = state_with_units(run_id, 2);

        let first = recorder.checkpoint(&state).await.unwrap();
        state.work_units.get_mut(&UnitId::from("u0")).unwrap().status = UnitStatus::Completed;
        let second = recorder.checkpoint(&state).await.unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(second.path.ends_with("000000000002-per-unit-processing.json"));
        let loaded = recorder.load_latest(run_id).await.unwrap();
        assert_eq!(loaded.count(UnitStatus::Completed), 1);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let (_dir, recorder) = recorder(4).await;
        let err = recorder.load_latest(RunId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn corrupt_newest_falls_back_to_previous() {
        let (_dir, recorder) = recorder(4).await;
        let run_id = RunId::new();
        let mut state = state_with_units(run_id, 1);
        recorder.checkpoint(&state).await.unwrap();
        state.work_units.get_mut(&UnitId::from("u0")).unwrap().attempt_count = 1;
        let newest = recorder.checkpoint(&state).await.unwrap();

        tokio::fs::write(&newest.path, b"{\"format_version\":1,\"seq").await.unwrap();
        let loaded = recorder.load_latest(run_id).await.unwrap();
        assert_eq!(loaded.work_units[&UnitId::from("u0")].attempt_count, 0);
    }

    #[tokio::test]
    async fn hash_mismatch_is_skipped() {
        let (_dir, recorder) = recorder(4).await;
        let run_id = RunId::new();
        let state = state_with_units(run_id, 1);
        recorder.checkpoint(&state).await.unwrap();
        let newest = recorder.checkpoint(&state).await.unwrap();

        let text = tokio::fs::read_to_string(&newest.path).await.unwrap();
        let edited = text.replace("\"pending\"", "\"completed\"");
        assert_ne!(text, edited);
        tokio::fs::write(&newest.path, edited).await.unwrap();

        let loaded = recorder.load_latest(run_id).await.unwrap();
        assert_eq!(loaded.count(UnitStatus::Pending), 1);
    }

    #[tokio::test]
    async fn sequence_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let state = state_with_units(run_id, 1);
        {
            let recorder = StateRecorder::open(dir.path(), 4).await.unwrap();
            recorder.checkpoint(&state).await.unwrap();
            recorder.checkpoint(&state).await.unwrap();
        }
        let recorder = StateRecorder::open(dir.path(), 4).await.unwrap();
        assert_eq!(recorder.checkpoint(&state).await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn old_checkpoints_are_pruned() {
        let (_dir, recorder) = recorder(2).await;
        let run_id = RunId::new();
        let state = state_with_units(run_id, 1);
        for _ in 0..5 {
            recorder.checkpoint(&state).await.unwrap();
        }
        let seqs: Vec<u64> = recorder
            .checkpoints(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn archived_runs_still_load() {
        let (_dir, recorder) = recorder(4).await;
        let run_id = RunId::new();
        let mut state = state_with_units(run_id, 1);
        recorder.checkpoint(&state).await.unwrap();
        state.current_stage = Stage::ReadyForSynthesis;

        let archived = recorder.archive(&state).await.unwrap();
        assert!(!recorder.run_dir(run_id).exists());
        assert!(archived.join("000000000002-ready-for-synthesis.json").exists());

        let loaded = recorder.load_latest(run_id).await.unwrap();
        assert_eq!(loaded.current_stage, Stage::ReadyForSynthesis);
    }

    #[tokio::test]
    async fn newest_sequence_wins_across_live_and_archive() {
        let (_dir, recorder) = recorder(4).await;
        let run_id = RunId::new();
        let mut state = state_with_units(run_id, 1);
        recorder.checkpoint(&state).await.unwrap();
        state.current_stage = Stage::ReadyForSynthesis;
        let newest = recorder.checkpoint(&state).await.unwrap();

        // Archive interrupted after moving only the newest checkpoint
        let archive_dir = recorder.archive_dir(run_id);
        tokio::fs::create_dir_all(&archive_dir).await.unwrap();
        let moved = archive_dir.join(newest.path.file_name().unwrap());
        tokio::fs::rename(&newest.path, &moved).await.unwrap();
        assert_eq!(recorder.checkpoints(run_id).await.unwrap().len(), 1);

        let loaded = recorder.load_latest(run_id).await.unwrap();
        assert_eq!(loaded.current_stage, Stage::ReadyForSynthesis);
    }

    #[tokio::test]
    async fn staging_never_leaves_partial_checkpoints() {
        let (dir, recorder) = recorder(4).await;
        let run_id = RunId::new();
        recorder.checkpoint(&state_with_units(run_id, 3)).await.unwrap();

        let mut staged = tokio::fs::read_dir(dir.path().join("state").join(".tmp")).await.unwrap();
        assert!(staged.next_entry().await.unwrap().is_none());
    }
}
