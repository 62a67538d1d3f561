//! Error types for Veriflow Core
//!
//! Provides error handling for:
//! - Producer and verifier call failures (transient, retried)
//! - Batch planning failures (oversized units, bad budgets)
//! - Checkpoint persistence and recovery
//! - Consolidation failures
//! - Configuration validation
//!
//! Every error maps onto an [`ErrorCategory`], which is what run reports and
//! the audit log carry.

use crate::types::{RunId, Stage, UnitId, UnitStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use veriflow_artifact::{ArtifactId, HashError, StoreError};

/// Failure taxonomy surfaced to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Timeout, transport failure, malformed response or worker panic
    Transient,
    /// Verifier recomputed a different result
    Disagreement,
    /// No verifier produced a result within the retry budget
    VerifierUnavailable,
    /// Oversized unit or invalid budget
    Budget,
    /// Artifact store failure
    Storage,
    /// Checkpoint could not be written or read
    Checkpoint,
    /// Consolidator failed on a batch
    Consolidation,
    /// Cooperative stop
    Cancelled,
}

impl ErrorCategory {
    /// Stable name for logs
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Disagreement => "disagreement",
            Self::VerifierUnavailable => "verifier_unavailable",
            Self::Budget => "budget",
            Self::Storage => "storage",
            Self::Checkpoint => "checkpoint",
            Self::Consolidation => "consolidation",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main pipeline error type
///
/// Returned for system-level failures only. Unit and batch failures are
/// reported through [`RunResult`](crate::RunResult).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Artifact store failure
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    /// Checkpoint failure
    #[error("state failure: {0}")]
    State(#[from] StateError),

    /// Planning failure
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Verification could not be set up for a subject
    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Illegal unit state change
    #[error("unit {unit_id}: {source}")]
    Transition {
        unit_id: UnitId,
        #[source]
        source: TransitionError,
    },

    /// Illegal stage change
    #[error("stage: {0}")]
    Stage(#[source] TransitionError),

    /// Record could not be encoded for storage
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Work source could not list units
    #[error("work source failed: {0}")]
    Source(String),

    /// Two source units share an id
    #[error("duplicate unit id from work source: {0}")]
    DuplicateUnit(UnitId),

    /// Content hash failure
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// Stored artifact did not decode
    #[error("artifact {id} is not a valid {expected}: {source}")]
    Decode {
        id: ArtifactId,
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Persisted state contradicts itself
    #[error("inconsistent state for run {run_id}: {reason}")]
    InconsistentState { run_id: RunId, reason: String },
}

impl PipelineError {
    /// Category reported to operators
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Plan(_) => ErrorCategory::Budget,
            Self::State(_) => ErrorCategory::Checkpoint,
            _ => ErrorCategory::Storage,
        }
    }

    /// Check if error is retryable
    ///
    /// System-level failures never are; the run must be resumed instead.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Wrap a decode failure for a stored artifact
    pub fn decode(id: ArtifactId, expected: &'static str, source: serde_json::Error) -> Self {
        Self::Decode {
            id,
            expected,
            source,
        }
    }
}

/// Unit or stage state machine violation
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    /// Unit status change not in the allowed set
    #[error("illegal unit transition {from:?} -> {to:?}")]
    IllegalUnit { from: UnitStatus, to: UnitStatus },

    /// Stage change not in the allowed set
    #[error("illegal stage transition {from} -> {to}")]
    IllegalStage { from: Stage, to: Stage },
}

/// Checkpoint persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No readable checkpoint exists for the run
    #[error("no valid checkpoint for run {0}")]
    NotFound(RunId),

    /// Filesystem failure
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint could not be encoded
    #[error("checkpoint encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Atomic publication failed
    #[error("checkpoint publication failed: {0}")]
    Publish(#[from] StoreError),

    /// State hash could not be computed
    #[error("state hash failed: {0}")]
    Hash(#[from] HashError),
}

impl StateError {
    /// Wrap an IO error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether no checkpoint was found
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Batch planning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// At least one unit cannot fit in a single call
    #[error("{} unit(s) exceed the effective budget of {effective_budget} bytes (largest estimate {largest_estimate})", unit_ids.len())]
    OversizedUnit {
        unit_ids: Vec<UnitId>,
        largest_estimate: u64,
        effective_budget: u64,
    },

    /// Budget arguments out of range
    #[error("invalid budget: {0}")]
    InvalidBudget(String),
}

/// Producer call failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProducerError {
    /// Call exceeded its timeout
    #[error("producer timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Transport or service failure
    #[error("producer transport failure: {0}")]
    Transport(String),

    /// Response did not match the response schema
    #[error("malformed producer response: {0}")]
    Malformed(String),

    /// Producer explicitly declined the task
    #[error("producer declined: {0}")]
    Declined(String),
}

impl ProducerError {
    /// Category reported to operators
    #[inline]
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Transient
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Verifier call failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifierError {
    /// Call exceeded its timeout
    #[error("verifier timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Transport or service failure
    #[error("verifier transport failure: {0}")]
    Transport(String),

    /// Verifier could not follow the derivation
    #[error("verifier rejected derivation: {0}")]
    Rejected(String),
}

impl VerifierError {
    /// Check if error is retryable
    ///
    /// Retries go to a different verifier instance, so every failure is.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Verification setup failures (not verdicts)
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// Subject or its inputs could not be read
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Subject does not have exactly one raw input
    #[error("subject {subject} has {found} raw input(s), expected 1")]
    InputResolution { subject: ArtifactId, found: usize },

    /// Attestation record could not be encoded
    #[error("attestation encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// No verifier configured
    #[error("no verifiers configured")]
    NoVerifiers,
}

/// Consolidator failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsolidationError {
    /// Consolidator reported failure
    #[error("consolidation failed: {0}")]
    Failed(String),

    /// Consolidation exceeded its timeout
    #[error("consolidation timed out after {ms}ms")]
    Timeout { ms: u64 },
}

impl ConsolidationError {
    /// Category reported to operators
    #[inline]
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Consolidation
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// A required collaborator was not supplied to the builder
    #[error("missing collaborator: {0}")]
    Missing(&'static str),
}

impl ConfigError {
    /// Build an out-of-range error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
