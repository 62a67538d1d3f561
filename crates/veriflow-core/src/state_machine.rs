//! Unit and stage state machines

use crate::error::TransitionError;
use crate::types::{Phase, Stage, UnitStatus, WorkUnit};

/// Validates a unit status transition.
///
/// # Errors
/// [`TransitionError::IllegalUnit`] if `to` is not reachable from `from`
pub fn validate_transition(from: UnitStatus, to: UnitStatus) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalUnit { from, to })
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: UnitStatus) -> Vec<UnitStatus> {
    use UnitStatus::{Completed, Failed, InFlight, Pending};
    match from {
        Pending => vec![InFlight(Phase::Compute)],
        // Pending again: transient failure with attempts left, or resume
        InFlight(Phase::Compute) => vec![InFlight(Phase::Verify), Pending, Failed],
        InFlight(Phase::Verify) => vec![Completed, Pending, Failed],
        Completed => vec![],
        Failed => vec![Pending],
    }
}

/// Apply a validated transition to a unit
///
/// # Errors
/// [`TransitionError::IllegalUnit`] and leaves the unit untouched
pub fn transition(unit: &mut WorkUnit, to: UnitStatus) -> Result<(), TransitionError> {
    validate_transition(unit.status, to)?;
    unit.status = to;
    Ok(())
}

/// Validates a stage transition.
///
/// # Errors
/// [`TransitionError::IllegalStage`] if `to` is not reachable from `from`
pub fn validate_stage_transition(from: Stage, to: Stage) -> Result<(), TransitionError> {
    if allowed_stage_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalStage { from, to })
    }
}

/// Stages reachable from `from` in one step
#[must_use]
pub fn allowed_stage_transitions(from: Stage) -> Vec<Stage> {
    use Stage::{BatchConsolidation, Ingest, PerUnitProcessing, ReadyForSynthesis};
    match from {
        Ingest => vec![PerUnitProcessing],
        PerUnitProcessing => vec![BatchConsolidation, ReadyForSynthesis],
        BatchConsolidation => vec![ReadyForSynthesis],
        ReadyForSynthesis => vec![],
    }
}

/// Prepare a loaded unit for a resumed run
///
/// In-flight units go back to `Pending`. Failed units go back to `Pending`
/// with a fresh attempt budget. Completed units are left alone. Returns
/// whether the unit changed.
pub fn reset_for_resume(unit: &mut WorkUnit) -> bool {
    match unit.status {
        UnitStatus::InFlight(_) => {
            unit.status = UnitStatus::Pending;
            true
        }
        UnitStatus::Failed => {
            unit.status = UnitStatus::Pending;
            unit.attempt_count = 0;
            unit.result_artifact_id = None;
            unit.attestation_artifact_id = None;
            true
        }
        UnitStatus::Pending | UnitStatus::Completed => false,
    }
}
