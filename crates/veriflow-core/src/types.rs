//! Core types for Veriflow
//!
//! Defines the fundamental types for the orchestrator:
//! - Run, unit and batch identifiers
//! - Work units and their status
//! - Pipeline stages and the persisted pipeline state
//! - Batch plans
//! - Run results reported to the caller

use crate::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;
use veriflow_artifact::{ArtifactId, HashError};

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Caller-supplied work unit identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Create new unit ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Position of a batch in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u32);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{:04}", self.0)
    }
}

/// Which external call an in-flight unit is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Awaiting the producer
    Compute,
    /// Awaiting the verifier
    Verify,
}

/// Work unit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Not started, or reset for retry
    Pending,
    /// Dispatched to a worker
    InFlight(Phase),
    /// Result attested `Agree`
    Completed,
    /// Halted: disagreement, verifier unavailable, or attempts exhausted
    Failed,
}

impl UnitStatus {
    /// Whether the unit is with a worker
    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight(_))
    }
}

/// Latest failure recorded on a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    /// Failure category
    pub category: ErrorCategory,
    /// Human-readable detail
    pub message: String,
}

impl UnitError {
    /// Create new unit error
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// One independent item of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unit identifier
    pub unit_id: UnitId,
    /// `RawInput` artifact the unit computes over
    pub input_artifact_id: ArtifactId,
    /// Lifecycle status
    pub status: UnitStatus,
    /// `ComputedResult` artifact, once produced
    pub result_artifact_id: Option<ArtifactId>,
    /// `VerificationAttestation` artifact, once verified
    pub attestation_artifact_id: Option<ArtifactId>,
    /// Dispatches since the last reset
    pub attempt_count: u32,
    /// Latest failure, cleared on success
    pub last_error: Option<UnitError>,
}

impl WorkUnit {
    /// Create new pending unit
    #[must_use]
    pub fn new(unit_id: UnitId, input_artifact_id: ArtifactId) -> Self {
        Self {
            unit_id,
            input_artifact_id,
            status: UnitStatus::Pending,
            result_artifact_id: None,
            attestation_artifact_id: None,
            attempt_count: 0,
            last_error: None,
        }
    }
}

/// Pipeline stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Storing raw inputs and planning batches
    Ingest,
    /// Compute and verify each unit
    PerUnitProcessing,
    /// Consolidate batches and roll them up
    BatchConsolidation,
    /// Final dataset ready for synthesis
    ReadyForSynthesis,
}

impl Stage {
    /// Stable name, used in checkpoint file names
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::PerUnitProcessing => "per-unit-processing",
            Self::BatchConsolidation => "batch-consolidation",
            Self::ReadyForSynthesis => "ready-for-synthesis",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contiguous group of units processed under one call budget
///
/// Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Members, in source order
    pub member_unit_ids: Vec<UnitId>,
    /// Estimated encoded payload of all members
    pub estimated_payload_size: u64,
    /// Whether a rollup across batches is required
    pub requires_rollup: bool,
}

/// Persisted progress of one run
///
/// Units are kept in an ordered map so the serialized form, and therefore
/// [`content_hash`](Self::content_hash), does not depend on completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Run identifier
    pub run_id: RunId,
    /// Current stage
    pub current_stage: Stage,
    /// Units keyed by id
    pub work_units: BTreeMap<UnitId, WorkUnit>,
    /// Batch plans, fixed at the end of ingest
    pub batch_plans: Vec<BatchPlan>,
    /// Consolidated batch artifacts
    pub consolidated: BTreeMap<BatchId, ArtifactId>,
    /// Final dataset artifact
    pub final_dataset: Option<ArtifactId>,
    /// Last mutation time (excluded from the content hash)
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct HashedState<'a> {
    run_id: &'a RunId,
    current_stage: &'a Stage,
    work_units: &'a BTreeMap<UnitId, WorkUnit>,
    batch_plans: &'a [BatchPlan],
    consolidated: &'a BTreeMap<BatchId, ArtifactId>,
    final_dataset: &'a Option<ArtifactId>,
}

impl PipelineState {
    /// Create new state at the start of a run
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            current_stage: Stage::Ingest,
            work_units: BTreeMap::new(),
            batch_plans: Vec::new(),
            consolidated: BTreeMap::new(),
            final_dataset: None,
            last_updated_at: Utc::now(),
        }
    }

    /// Record a mutation
    #[inline]
    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    /// Hash of the state, ignoring `last_updated_at`
    ///
    /// # Errors
    /// Returns error if the state cannot be serialized
    pub fn content_hash(&self) -> Result<ArtifactId, HashError> {
        ArtifactId::of_serializable(&HashedState {
            run_id: &self.run_id,
            current_stage: &self.current_stage,
            work_units: &self.work_units,
            batch_plans: &self.batch_plans,
            consolidated: &self.consolidated,
            final_dataset: &self.final_dataset,
        })
    }

    /// Number of units with the given status
    #[must_use]
    pub fn count(&self, status: UnitStatus) -> usize {
        self.work_units.values().filter(|u| u.status == status).count()
    }

    /// Whether every unit is `Completed`
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.work_units
            .values()
            .all(|u| u.status == UnitStatus::Completed)
    }

    /// Ids of pending units, in id order
    #[must_use]
    pub fn pending_units(&self) -> Vec<UnitId> {
        self.work_units
            .values()
            .filter(|u| u.status == UnitStatus::Pending)
            .map(|u| u.unit_id.clone())
            .collect()
    }
}

/// Successful run outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: RunId,
    /// `FinalDataset` artifact
    pub final_dataset: ArtifactId,
    /// Content hash of the final state
    pub state_hash: ArtifactId,
    /// Number of units processed
    pub units: usize,
    /// Number of batches
    pub batches: usize,
}

/// A run stopped at a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// Run to resume
    pub run_id: RunId,
    /// Failing unit
    pub unit_id: UnitId,
    /// Stage the run stopped in
    pub stage: Stage,
    /// Failure category
    pub category: ErrorCategory,
    /// Detail
    pub message: String,
    /// Attestation explaining a disagreement, if one was stored
    pub attestation_artifact_id: Option<ArtifactId>,
}

/// A run stopped at a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Run to resume
    pub run_id: RunId,
    /// Failing batch
    pub batch_id: BatchId,
    /// Stage the run stopped in
    pub stage: Stage,
    /// Failure category
    pub category: ErrorCategory,
    /// Detail
    pub message: String,
}

/// Outcome of [`PipelineOrchestrator::run`](crate::PipelineOrchestrator::run)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// Every stage completed with every unit attested `Agree`
    Success(RunSummary),
    /// Halted at a unit
    FailedAtUnit(UnitFailure),
    /// Halted at a batch
    FailedAtBatch(BatchFailure),
    /// Stopped by the cancellation token
    Cancelled {
        /// Run to resume
        run_id: RunId,
        /// Units completed so far
        completed_units: usize,
        /// Units still to do
        remaining_units: usize,
    },
}

impl RunResult {
    /// Whether the run finished
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Run identifier, whatever the outcome
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Success(s) => s.run_id,
            Self::FailedAtUnit(f) => f.run_id,
            Self::FailedAtBatch(f) => f.run_id,
            Self::Cancelled { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str) -> WorkUnit {
        WorkUnit::new(UnitId::from(id), ArtifactId::of(id.as_bytes()))
    }

    #[test]
    fn content_hash_ignores_timestamp() {
        let run_id = RunId::new();
        let mut a = PipelineState::new(run_id);
        a.work_units.insert(UnitId::from("u1"), unit("u1"));
        let mut b = a.clone();
        b.last_updated_at = a.last_updated_at + chrono::Duration::seconds(30);

        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());

        b.work_units.get_mut(&UnitId::from("u1")).unwrap().status = UnitStatus::Completed;
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn content_hash_ignores_insertion_order() {
        let run_id = RunId::new();
        let mut a = PipelineState::new(run_id);
        let mut b = a.clone();
        for id in ["x", "y", "z"] {
            a.work_units.insert(UnitId::from(id), unit(id));
        }
        for id in ["z", "x", "y"] {
            b.work_units.insert(UnitId::from(id), unit(id));
        }
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = PipelineState::new(RunId::new());
        let mut u = unit("u1");
        u.status = UnitStatus::InFlight(Phase::Verify);
        u.last_error = Some(UnitError::new(ErrorCategory::Transient, "timeout"));
        state.work_units.insert(u.unit_id.clone(), u);
        state.consolidated.insert(BatchId(1), ArtifactId::of(b"batch"));

        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn run_id_parses_display_form() {
        let id = RunId::new();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
    }

    #[test]
    fn counts_by_status() {
        let mut state = PipelineState::new(RunId::new());
        for id in ["a", "b", "c"] {
            state.work_units.insert(UnitId::from(id), unit(id));
        }
        state.work_units.get_mut(&UnitId::from("b")).unwrap().status = UnitStatus::Completed;
        assert_eq!(state.count(UnitStatus::Pending), 2);
        assert_eq!(state.pending_units(), vec![UnitId::from("a"), UnitId::from("c")]);
        assert!(!state.all_completed());
    }
}
