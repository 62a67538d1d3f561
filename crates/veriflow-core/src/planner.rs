//! Batch planning under a per-call budget
//!
//! Partitions work units into contiguous batches so that no single call to
//! an external collaborator exceeds its payload budget. A fraction of the
//! budget is held back as a safety margin, and transport encoding overhead
//! is folded into the per-unit estimate before planning.

use crate::config::BudgetConfig;
use crate::error::PlanError;
use crate::types::{BatchId, BatchPlan, UnitId};

/// Encoded size of a unit: `ceil(raw_len * overhead) + envelope`
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn estimate_encoded_size(raw_len: u64, overhead: f64, envelope: u64) -> u64 {
    let encoded = (raw_len as f64 * overhead).ceil() as u64;
    encoded.saturating_add(envelope)
}

/// `floor(budget * (1 - safety_margin))`
///
/// # Errors
/// [`PlanError::InvalidBudget`] for a zero budget, a margin outside `[0, 1)`,
/// or a margin so large nothing fits
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn effective_budget(budget: u64, safety_margin: f64) -> Result<u64, PlanError> {
    if budget == 0 {
        return Err(PlanError::InvalidBudget("budget must be non-zero".into()));
    }
    if !(0.0..1.0).contains(&safety_margin) {
        return Err(PlanError::InvalidBudget(format!(
            "safety margin {safety_margin} outside [0, 1)"
        )));
    }
    let effective = (budget as f64 * (1.0 - safety_margin)).floor() as u64;
    if effective == 0 {
        return Err(PlanError::InvalidBudget(format!(
            "margin {safety_margin} leaves no usable budget out of {budget}"
        )));
    }
    Ok(effective)
}

/// Plans batches of work units
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    max_batch_size: usize,
}

impl BatchPlanner {
    /// Create new planner
    #[inline]
    #[must_use]
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Planner for a budget configuration
    #[inline]
    #[must_use]
    pub fn from_config(budget: &BudgetConfig) -> Self {
        Self::new(budget.max_batch_size)
    }

    /// Upper bound on units per batch
    #[inline]
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Units that fit in one call of `effective_budget` bytes
    ///
    /// # Errors
    /// [`PlanError::InvalidBudget`] for a zero estimate
    pub fn batch_size(&self, per_unit_size_estimate: u64, effective_budget: u64) -> Result<usize, PlanError> {
        if per_unit_size_estimate == 0 {
            return Err(PlanError::InvalidBudget("per-unit estimate must be non-zero".into()));
        }
        let fits = usize::try_from(effective_budget / per_unit_size_estimate).unwrap_or(usize::MAX);
        Ok(fits.clamp(1, self.max_batch_size))
    }

    /// Partition uniformly sized units into contiguous batches
    ///
    /// Every plan has `requires_rollup = true` when more than one batch
    /// results. No units yields no plans.
    ///
    /// # Errors
    /// - [`PlanError::InvalidBudget`] for bad arguments
    /// - [`PlanError::OversizedUnit`] listing every unit if one unit alone
    ///   exceeds the effective budget
    pub fn plan(
        &self,
        unit_ids: &[UnitId],
        per_unit_size_estimate: u64,
        budget: u64,
        safety_margin: f64,
    ) -> Result<Vec<BatchPlan>, PlanError> {
        let effective = effective_budget(budget, safety_margin)?;
        let batch_size = self.batch_size(per_unit_size_estimate, effective)?;
        if per_unit_size_estimate > effective && !unit_ids.is_empty() {
            return Err(PlanError::OversizedUnit {
                unit_ids: unit_ids.to_vec(),
                largest_estimate: per_unit_size_estimate,
                effective_budget: effective,
            });
        }

        let groups: Vec<(Vec<UnitId>, u64)> = unit_ids
            .chunks(batch_size)
            .map(|chunk| {
                let size = per_unit_size_estimate.saturating_mul(chunk.len() as u64);
                (chunk.to_vec(), size)
            })
            .collect();
        tracing::debug!(
            units = unit_ids.len(),
            batch_size,
            batches = groups.len(),
            effective_budget = effective,
            "planned uniform batches"
        );
        Ok(finish(groups))
    }

    /// Greedily pack units of differing sizes into contiguous batches
    ///
    /// A batch is closed when the next unit would push it past the effective
    /// budget or past `max_batch_size` members.
    ///
    /// # Errors
    /// - [`PlanError::InvalidBudget`] for bad arguments or a zero estimate
    /// - [`PlanError::OversizedUnit`] listing each unit whose own estimate
    ///   exceeds the effective budget
    pub fn plan_weighted(
        &self,
        units: &[(UnitId, u64)],
        budget: u64,
        safety_margin: f64,
    ) -> Result<Vec<BatchPlan>, PlanError> {
        let effective = effective_budget(budget, safety_margin)?;
        check_sizes(units, effective)?;

        let mut groups: Vec<(Vec<UnitId>, u64)> = Vec::new();
        let mut current: Vec<UnitId> = Vec::new();
        let mut current_size = 0u64;
        for (unit_id, size) in units {
            let full = current.len() >= self.max_batch_size || current_size + size > effective;
            if full && !current.is_empty() {
                groups.push((std::mem::take(&mut current), current_size));
                current_size = 0;
            }
            current.push(unit_id.clone());
            current_size += size;
        }
        if !current.is_empty() {
            groups.push((current, current_size));
        }

        tracing::debug!(
            units = units.len(),
            batches = groups.len(),
            effective_budget = effective,
            "planned weighted batches"
        );
        Ok(finish(groups))
    }
}

/// Reject units whose own estimate exceeds `effective`
///
/// # Errors
/// [`PlanError::OversizedUnit`] listing the offenders, or
/// [`PlanError::InvalidBudget`] for a zero estimate
pub fn check_sizes(units: &[(UnitId, u64)], effective: u64) -> Result<(), PlanError> {
    if let Some((unit_id, _)) = units.iter().find(|(_, size)| *size == 0) {
        return Err(PlanError::InvalidBudget(format!("unit {unit_id} has a zero size estimate")));
    }
    let oversized: Vec<&(UnitId, u64)> = units.iter().filter(|(_, size)| *size > effective).collect();
    if oversized.is_empty() {
        return Ok(());
    }
    Err(PlanError::OversizedUnit {
        largest_estimate: oversized.iter().map(|(_, s)| *s).max().unwrap_or(0),
        unit_ids: oversized.into_iter().map(|(id, _)| id.clone()).collect(),
        effective_budget: effective,
    })
}

fn finish(groups: Vec<(Vec<UnitId>, u64)>) -> Vec<BatchPlan> {
    let requires_rollup = groups.len() > 1;
    groups
        .into_iter()
        .zip(0u32..)
        .map(|((member_unit_ids, estimated_payload_size), idx)| BatchPlan {
            batch_id: BatchId(idx),
            member_unit_ids,
            estimated_payload_size,
            requires_rollup,
        })
        .collect()
}
