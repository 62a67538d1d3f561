//! Artifact kinds and metadata records
//!
//! The bytes of an artifact are opaque to the store. What the store does know
//! about each artifact lives in an [`ArtifactRecord`]: its kind, the stage
//! that produced it, when it was first published, and the artifacts it was
//! derived from.

use crate::hash::ArtifactId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Role an artifact plays in a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Ingested input of a work unit
    RawInput,
    /// Producer output awaiting (or holding) an attestation
    ComputedResult,
    /// Outcome of independent re-verification
    VerificationAttestation,
    /// Merged output of one batch of work units
    ConsolidatedBatch,
    /// Dataset handed to synthesis
    FinalDataset,
}

impl ArtifactKind {
    /// All kinds, in pipeline order
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::RawInput,
        ArtifactKind::ComputedResult,
        ArtifactKind::VerificationAttestation,
        ArtifactKind::ConsolidatedBatch,
        ArtifactKind::FinalDataset,
    ];

    /// Stable identifier used in file names and logs
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::RawInput => "raw_input",
            ArtifactKind::ComputedResult => "computed_result",
            ArtifactKind::VerificationAttestation => "verification_attestation",
            ArtifactKind::ConsolidatedBatch => "consolidated_batch",
            ArtifactKind::FinalDataset => "final_dataset",
        }
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Unrecognized artifact kind name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown artifact kind: {0}")]
pub struct UnknownKind(pub String);

/// Metadata published alongside every artifact
///
/// # Invariants
/// - `id == ArtifactId::of(bytes)` for the blob it describes
/// - `dependency_ids` holds no duplicates and keeps insertion order
/// - written once; a later `put` of the same bytes never rewrites it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Content hash
    pub id: ArtifactId,
    /// Artifact role
    pub kind: ArtifactKind,
    /// Stage that first produced these bytes
    pub producer_stage: String,
    /// First publication time
    pub created_at: DateTime<Utc>,
    /// Artifacts this one was derived from
    pub dependency_ids: Vec<ArtifactId>,
    /// Blob length in bytes
    pub size_bytes: u64,
}

impl ArtifactRecord {
    /// Build a record for freshly hashed content
    ///
    /// Duplicate dependency ids are dropped, keeping first occurrences.
    #[must_use]
    pub fn new(
        id: ArtifactId,
        kind: ArtifactKind,
        producer_stage: impl Into<String>,
        dependency_ids: &[ArtifactId],
        size_bytes: u64,
    ) -> Self {
        Self {
            id,
            kind,
            producer_stage: producer_stage.into(),
            created_at: Utc::now(),
            dependency_ids: dedup_ordered(dependency_ids),
            size_bytes,
        }
    }
}

/// Remove duplicates while preserving first-seen order
pub(crate) fn dedup_ordered(ids: &[ArtifactId]) -> Vec<ArtifactId> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
