//! Batch consolidation
//!
//! Consolidators only ever see results whose attestation is `Agree`; the
//! orchestrator enforces that gate before calling them.

use crate::error::ConsolidationError;
use crate::producer::OutputValue;
use crate::types::{BatchId, BatchPlan, UnitId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use veriflow_artifact::ArtifactId;

/// A verified unit result handed to a consolidator
#[derive(Debug, Clone, PartialEq)]
pub struct AttestedResult {
    /// Unit identifier
    pub unit_id: UnitId,
    /// `ComputedResult` artifact
    pub result_artifact_id: ArtifactId,
    /// `Agree` attestation artifact
    pub attestation_artifact_id: ArtifactId,
    /// Verified output
    pub output: OutputValue,
}

/// Merges verified results
#[async_trait]
pub trait Consolidator: Send + Sync {
    /// Merge the members of one batch
    ///
    /// # Errors
    /// [`ConsolidationError`] halts the run at this batch
    async fn consolidate(&self, batch: &BatchPlan, members: &[AttestedResult]) -> Result<Vec<u8>, ConsolidationError>;

    /// Merge consolidated batches into the final dataset
    ///
    /// # Errors
    /// [`ConsolidationError`] halts the run at the last batch
    async fn rollup(&self, parts: &[(BatchId, Vec<u8>)]) -> Result<Vec<u8>, ConsolidationError>;
}

/// Consolidated batch as written by [`JsonMergeConsolidator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedBatch {
    /// Batches merged into this document
    pub batches: Vec<BatchId>,
    /// Output per unit
    pub results: BTreeMap<UnitId, OutputValue>,
}

/// Deterministic JSON merge keyed by unit id
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMergeConsolidator;

#[async_trait]
impl Consolidator for JsonMergeConsolidator {
    async fn consolidate(&self, batch: &BatchPlan, members: &[AttestedResult]) -> Result<Vec<u8>, ConsolidationError> {
        let merged = MergedBatch {
            batches: vec![batch.batch_id],
            results: members
                .iter()
                .map(|m| (m.unit_id.clone(), m.output.clone()))
                .collect(),
        };
        serde_json::to_vec(&merged).map_err(|e| ConsolidationError::Failed(e.to_string()))
    }

    async fn rollup(&self, parts: &[(BatchId, Vec<u8>)]) -> Result<Vec<u8>, ConsolidationError> {
        let mut rolled = MergedBatch {
            batches: Vec::with_capacity(parts.len()),
            results: BTreeMap::new(),
        };
        for (batch_id, bytes) in parts {
            let part: MergedBatch = serde_json::from_slice(bytes)
                .map_err(|e| ConsolidationError::Failed(format!("{batch_id}: {e}")))?;
            for (unit_id, output) in part.results {
                if rolled.results.insert(unit_id.clone(), output).is_some() {
                    return Err(ConsolidationError::Failed(format!(
                        "unit {unit_id} appears in more than one batch"
                    )));
                }
            }
            rolled.batches.extend(part.batches);
        }
        serde_json::to_vec(&rolled).map_err(|e| ConsolidationError::Failed(e.to_string()))
    }
}
