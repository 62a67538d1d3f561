//! Pipeline orchestrator
//!
//! Drives one run through its stages:
//!
//! ```text
//! Ingest ──► PerUnitProcessing ──► [BatchConsolidation] ──► ReadyForSynthesis
//! ```
//!
//! Every unit goes `Pending → InFlight(Compute) → InFlight(Verify) →
//! Completed | Failed`. Compute and verify calls run on a bounded
//! [`WorkerPool`]; the dispatch loop alone owns the [`PipelineState`] and
//! checkpoints it after every unit completion. A `Disagree` or
//! `VerifierError` attestation halts the run at that unit; only results
//! attested `Agree` ever reach the [`Consolidator`].

use crate::audit::{AuditEntry, AuditLog, OperationKind};
use crate::config::PipelineConfig;
use crate::consolidate::{AttestedResult, Consolidator, JsonMergeConsolidator};
use crate::error::{ConfigError, ConsolidationError, ErrorCategory, PipelineError, ProducerError};
use crate::planner::{check_sizes, effective_budget, estimate_encoded_size, BatchPlanner};
use crate::pool::{PoolStats, WorkerFault, WorkerPool};
use crate::producer::{Claim, Derivation, OutputValue, Producer, ProducerResponse, Verifier};
use crate::source::WorkSource;
use crate::state::StateRecorder;
use crate::state_machine::{reset_for_resume, transition, validate_stage_transition};
use crate::types::{
    BatchFailure, BatchId, Phase, PipelineState, RunId, RunResult, RunSummary, Stage, UnitError,
    UnitFailure, UnitId, UnitStatus, WorkUnit,
};
use crate::verify::{Attestation, AttestationOutcome, AttestationRecord, VerificationCoordinator};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use veriflow_artifact::{ArtifactId, ArtifactKind, ArtifactStore};

/// Stage name recorded on computed results
pub const COMPUTE_STAGE: &str = "compute";

/// Stage name recorded on consolidated batches and the final dataset
pub const CONSOLIDATE_STAGE: &str = "consolidate";

/// Name-index key of a run's final dataset
#[must_use]
pub fn final_dataset_name(run_id: RunId) -> String {
    format!("runs/{run_id}/final-dataset")
}

/// Stored form of a producer claim (`ComputedResult` artifact)
///
/// Carries no timestamps, so identical claims over identical inputs always
/// hash to the same artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedRecord {
    /// Unit the claim is about
    pub unit_id: UnitId,
    /// `RawInput` the producer saw
    pub input_artifact_id: ArtifactId,
    /// Claimed output
    pub claimed_output: OutputValue,
    /// Producer's derivation
    pub derivation: Derivation,
}

impl ComputedRecord {
    /// Decode a stored computed result
    ///
    /// # Errors
    /// Returns error if `bytes` are not a computed record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Result of one pool job
enum JobOutput {
    Computed {
        result_id: ArtifactId,
        claim: Claim,
        started: DateTime<Utc>,
    },
    ComputeFailed {
        error: ProducerError,
        started: DateTime<Utc>,
    },
    Verified {
        attestation: Attestation,
        started: DateTime<Utc>,
    },
    /// Cancelled while waiting out a retry delay, before any call
    Skipped,
}

type JobResult = Result<JobOutput, PipelineError>;

/// What happened to a unit after a transient failure
enum AfterFailure {
    Retry(Duration),
    Parked,
    Exhausted,
}

/// Builder for [`PipelineOrchestrator`]
pub struct PipelineOrchestratorBuilder {
    root: PathBuf,
    config: PipelineConfig,
    producer: Option<Arc<dyn Producer>>,
    verifiers: Vec<Arc<dyn Verifier>>,
    source: Option<Arc<dyn WorkSource>>,
    consolidator: Option<Arc<dyn Consolidator>>,
    cancel: Option<CancellationToken>,
}

impl PipelineOrchestratorBuilder {
    /// With configuration
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// With producer
    #[must_use]
    pub fn producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Add one verifier instance
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.push(verifier);
        self
    }

    /// Add several verifier instances
    #[must_use]
    pub fn verifiers(mut self, verifiers: impl IntoIterator<Item = Arc<dyn Verifier>>) -> Self {
        self.verifiers.extend(verifiers);
        self
    }

    /// With work source
    #[must_use]
    pub fn source(mut self, source: Arc<dyn WorkSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// With consolidator (default [`JsonMergeConsolidator`])
    #[must_use]
    pub fn consolidator(mut self, consolidator: Arc<dyn Consolidator>) -> Self {
        self.consolidator = Some(consolidator);
        self
    }

    /// With an externally owned cancellation token
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Open the store and state directories and assemble the orchestrator
    ///
    /// # Errors
    /// - [`ConfigError`] for invalid settings or a missing collaborator
    /// - [`PipelineError::Store`] / [`PipelineError::State`] if the root
    ///   cannot be initialized
    pub async fn build(self) -> Result<PipelineOrchestrator, PipelineError> {
        self.config.validate()?;
        let producer = self.producer.ok_or(ConfigError::Missing("producer"))?;
        if self.verifiers.is_empty() {
            return Err(ConfigError::Missing("verifier").into());
        }
        let source = self.source.ok_or(ConfigError::Missing("work source"))?;
        let consolidator = self
            .consolidator
            .unwrap_or_else(|| Arc::new(JsonMergeConsolidator));

        let store = Arc::new(ArtifactStore::open(&self.root).await?);
        let recorder = StateRecorder::open(self.root.join("state"), self.config.checkpoint_retain).await?;
        let coordinator = Arc::new(VerificationCoordinator::from_config(
            Arc::clone(&store),
            self.verifiers,
            &self.config,
        ));

        tracing::info!(
            root = %self.root.display(),
            producer = producer.identity(),
            max_concurrency = self.config.max_concurrency,
            "orchestrator ready"
        );

        Ok(PipelineOrchestrator {
            planner: BatchPlanner::from_config(&self.config.budget),
            root: self.root,
            config: self.config,
            store,
            recorder,
            producer,
            coordinator,
            source,
            consolidator,
            cancel: self.cancel.unwrap_or_default(),
            pool_stats: Mutex::new(PoolStats::default()),
        })
    }
}

/// Runs pipelines under one root directory
pub struct PipelineOrchestrator {
    root: PathBuf,
    config: PipelineConfig,
    store: Arc<ArtifactStore>,
    recorder: StateRecorder,
    producer: Arc<dyn Producer>,
    coordinator: Arc<VerificationCoordinator>,
    source: Arc<dyn WorkSource>,
    consolidator: Arc<dyn Consolidator>,
    planner: BatchPlanner,
    cancel: CancellationToken,
    pool_stats: Mutex<PoolStats>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("root", &self.root)
            .field("producer", &self.producer.identity())
            .field("coordinator", &self.coordinator)
            .field("planner", &self.planner)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Start building an orchestrator rooted at `root`
    pub fn builder(root: impl Into<PathBuf>) -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder {
            root: root.into(),
            config: PipelineConfig::default(),
            producer: None,
            verifiers: Vec::new(),
            source: None,
            consolidator: None,
            cancel: None,
        }
    }

    /// Artifact store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Checkpoint recorder
    #[inline]
    #[must_use]
    pub fn recorder(&self) -> &StateRecorder {
        &self.recorder
    }

    /// Token that stops dispatch when cancelled
    #[inline]
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Worker pool statistics of the most recent unit stage
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        *self.pool_stats.lock()
    }

    /// Location of a run's audit log
    #[must_use]
    pub fn audit_path(&self, run_id: RunId) -> PathBuf {
        self.root.join("audit").join(format!("{run_id}.jsonl"))
    }

    /// Execute (or resume) a run
    ///
    /// With `resume`, the newest valid checkpoint of `run_id` is loaded;
    /// in-flight and failed units go back to `Pending` and completed units
    /// are kept. A missing or unreadable checkpoint starts the run fresh.
    ///
    /// Unit and batch failures are reported in the [`RunResult`].
    ///
    /// # Errors
    /// System-level failures: storage, checkpointing, planning, or an
    /// inconsistent persisted state
    pub async fn run(&self, run_id: RunId, resume: bool) -> Result<RunResult, PipelineError> {
        self.run_stages(run_id, resume)
            .instrument(tracing::info_span!("run", %run_id))
            .await
    }

    async fn run_stages(&self, run_id: RunId, resume: bool) -> Result<RunResult, PipelineError> {
        let audit = AuditLog::open(&self.root.join("audit"), run_id).await?;

        let restored = if resume { self.restore(run_id, &audit).await? } else { None };
        let mut state = restored.unwrap_or_else(|| PipelineState::new(run_id));

        if state.current_stage == Stage::ReadyForSynthesis {
            let final_dataset = state.final_dataset.ok_or_else(|| PipelineError::InconsistentState {
                run_id,
                reason: "ready for synthesis without a final dataset".into(),
            })?;
            tracing::info!(final_dataset = %final_dataset.short(), "run already complete");
            return Ok(RunResult::Success(run_summary(&state, final_dataset)?));
        }

        if state.current_stage == Stage::Ingest {
            self.ingest(&mut state, &audit).await?;
        }

        if state.current_stage == Stage::PerUnitProcessing {
            if let Some(stopped) = self.process_units(&mut state, &audit).await? {
                return Ok(stopped);
            }
        }

        if let Some(stopped) = self.consolidate(&mut state, &audit).await? {
            return Ok(stopped);
        }

        self.finish(&mut state, &audit).await
    }

    async fn restore(&self, run_id: RunId, audit: &AuditLog) -> Result<Option<PipelineState>, PipelineError> {
        let started = Utc::now();
        let mut state = match self.recorder.load_latest(run_id).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                tracing::info!("no checkpoint found; starting fresh");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint unreadable; starting fresh");
                return Ok(None);
            }
        };

        let reset = state.work_units.values_mut().map(reset_for_resume).filter(|r| *r).count();
        tracing::info!(
            stage = %state.current_stage,
            completed = state.count(UnitStatus::Completed),
            reset,
            "resuming run"
        );
        audit
            .record(&AuditEntry::new(OperationKind::Resume, run_id, started))
            .await?;
        Ok(Some(state))
    }

    /// Store every source unit and plan batches before any producer call
    async fn ingest(&self, state: &mut PipelineState, audit: &AuditLog) -> Result<(), PipelineError> {
        let units = self.source.units().await?;
        let budget = self.config.budget;
        state.work_units.clear();

        let mut order = Vec::with_capacity(units.len());
        let mut estimates = Vec::with_capacity(units.len());
        for unit in units {
            if state.work_units.contains_key(&unit.unit_id) {
                return Err(PipelineError::DuplicateUnit(unit.unit_id));
            }
            let started = Utc::now();
            let input_id = self
                .store
                .put(&unit.bytes, ArtifactKind::RawInput, Stage::Ingest.as_str(), &[])
                .await?;
            audit
                .record(
                    &AuditEntry::new(OperationKind::Ingest, state.run_id, started)
                        .unit(&unit.unit_id)
                        .artifacts(Vec::new(), vec![input_id]),
                )
                .await?;

            let estimate = estimate_encoded_size(
                unit.bytes.len() as u64,
                budget.encoding_overhead,
                budget.per_unit_envelope_bytes,
            );
            estimates.push((unit.unit_id.clone(), estimate));
            order.push(unit.unit_id.clone());
            state
                .work_units
                .insert(unit.unit_id.clone(), WorkUnit::new(unit.unit_id, input_id));
        }

        let started = Utc::now();
        let effective = effective_budget(budget.budget_bytes, budget.safety_margin)?;
        check_sizes(&estimates, effective)?;
        let largest = estimates.iter().map(|(_, size)| *size).max();
        state.batch_plans = match largest {
            Some(estimate) => self
                .planner
                .plan(&order, estimate, budget.budget_bytes, budget.safety_margin)?,
            None => Vec::new(),
        };
        audit
            .record(&AuditEntry::new(OperationKind::Plan, state.run_id, started))
            .await?;

        tracing::info!(
            units = state.work_units.len(),
            batches = state.batch_plans.len(),
            requires_rollup = state.batch_plans.iter().any(|p| p.requires_rollup),
            "ingest complete"
        );
        advance_stage(state, Stage::PerUnitProcessing)?;
        self.recorder.checkpoint(state).await?;
        Ok(())
    }

    /// Compute and verify every pending unit
    ///
    /// Returns `Some` if the run stopped early (halt or cancellation) and
    /// `None` once every unit is `Completed`.
    #[allow(clippy::too_many_lines)]
    async fn process_units(
        &self,
        state: &mut PipelineState,
        audit: &AuditLog,
    ) -> Result<Option<RunResult>, PipelineError> {
        let run_id = state.run_id;
        let mut pool: WorkerPool<(UnitId, Phase), JobResult> = WorkerPool::new(self.config.max_concurrency);
        let mut compute_queue: VecDeque<(UnitId, Duration)> =
            state.pending_units().into_iter().map(|id| (id, Duration::ZERO)).collect();
        let mut verify_queue: VecDeque<UnitId> = VecDeque::new();
        let mut claims: HashMap<UnitId, (ArtifactId, Claim)> = HashMap::new();
        let mut halt: Option<UnitFailure> = None;
        let mut cancelled = false;

        tracing::info!(
            pending = compute_queue.len(),
            completed = state.count(UnitStatus::Completed),
            "processing units"
        );

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                tracing::info!(in_flight = pool.in_flight(), "cancellation requested; draining");
            }

            // Computed units always finish their round-trip, even when halted
            while pool.has_capacity() {
                if let Some(unit_id) = verify_queue.pop_front() {
                    let Some((result_id, claim)) = claims.remove(&unit_id) else {
                        return Err(PipelineError::InconsistentState {
                            run_id,
                            reason: format!("unit {unit_id} queued for verification without a claim"),
                        });
                    };
                    let job = verify_job(Arc::clone(&self.coordinator), result_id, claim);
                    let span = tracing::debug_span!("verify", %unit_id);
                    pool.spawn((unit_id, Phase::Verify), job.instrument(span));
                } else if cancelled || halt.is_some() {
                    break;
                } else if let Some((unit_id, delay)) = compute_queue.pop_front() {
                    let unit = unit_mut(state, &unit_id)?;
                    set_status(unit, UnitStatus::InFlight(Phase::Compute))?;
                    unit.attempt_count += 1;
                    let job = self.compute_job(unit_id.clone(), unit.input_artifact_id, delay);
                    let span = tracing::debug_span!("compute", %unit_id, attempt = unit.attempt_count);
                    pool.spawn((unit_id, Phase::Compute), job.instrument(span));
                } else {
                    break;
                }
            }

            if pool.is_idle() {
                break;
            }

            let next = tokio::select! {
                () = self.cancel.cancelled(), if !cancelled => continue,
                next = pool.join_next() => next,
            };
            let Some(((unit_id, phase), outcome)) = next else {
                continue;
            };

            let job = match outcome {
                Ok(Ok(job)) => job,
                Ok(Err(e)) => {
                    tracing::error!(%unit_id, error = %e, "system failure; stopping run");
                    pool.shutdown();
                    *self.pool_stats.lock() = pool.stats();
                    return Err(e);
                }
                Err(WorkerFault::Panicked(message)) => {
                    let error = UnitError::new(ErrorCategory::Transient, format!("worker panicked: {message}"));
                    if phase == Phase::Verify {
                        claims.remove(&unit_id);
                    }
                    self.handle_transient(state, &unit_id, error, Utc::now(), audit, &mut compute_queue, &mut halt)
                        .await?;
                    continue;
                }
            };

            match job {
                JobOutput::Skipped => {
                    let unit = unit_mut(state, &unit_id)?;
                    set_status(unit, UnitStatus::Pending)?;
                    unit.attempt_count = unit.attempt_count.saturating_sub(1);
                }
                JobOutput::Computed {
                    result_id,
                    claim,
                    started,
                } => {
                    let unit = unit_mut(state, &unit_id)?;
                    set_status(unit, UnitStatus::InFlight(Phase::Verify))?;
                    unit.result_artifact_id = Some(result_id);
                    let entry = AuditEntry::new(OperationKind::Compute, run_id, started)
                        .unit(&unit_id)
                        .artifacts(vec![unit.input_artifact_id], vec![result_id])
                        .retries(unit.attempt_count.saturating_sub(1));
                    audit.record(&entry).await?;
                    claims.insert(unit_id.clone(), (result_id, claim));
                    verify_queue.push_back(unit_id);
                }
                JobOutput::ComputeFailed { error, started } => {
                    tracing::warn!(%unit_id, %error, "compute attempt failed");
                    let error = UnitError::new(error.category(), error.to_string());
                    self.handle_transient(state, &unit_id, error, started, audit, &mut compute_queue, &mut halt)
                        .await?;
                }
                JobOutput::Verified { attestation, started } => {
                    if let Some(failure) = self.apply_attestation(state, &unit_id, &attestation, started, audit).await? {
                        if halt.is_none() {
                            halt = Some(failure);
                        }
                    }
                }
            }
        }

        *self.pool_stats.lock() = pool.stats();
        state.touch();
        self.recorder.checkpoint(state).await?;

        if let Some(failure) = halt {
            tracing::error!(
                unit_id = %failure.unit_id,
                category = %failure.category,
                message = %failure.message,
                "run halted"
            );
            let mut entry = AuditEntry::new(OperationKind::Halt, run_id, Utc::now())
                .unit(&failure.unit_id)
                .error(UnitError::new(failure.category, failure.message.clone()));
            if let Some(attestation) = failure.attestation_artifact_id {
                entry = entry.artifacts(Vec::new(), vec![attestation]);
            }
            audit.record(&entry).await?;
            return Ok(Some(RunResult::FailedAtUnit(failure)));
        }

        let completed = state.count(UnitStatus::Completed);
        let remaining = state.work_units.len() - completed;
        if remaining > 0 {
            if cancelled {
                tracing::info!(completed, remaining, "run cancelled");
                audit
                    .record(&AuditEntry::new(OperationKind::Halt, run_id, Utc::now()).error(UnitError::new(
                        ErrorCategory::Cancelled,
                        format!("{remaining} unit(s) remaining"),
                    )))
                    .await?;
                return Ok(Some(RunResult::Cancelled {
                    run_id,
                    completed_units: completed,
                    remaining_units: remaining,
                }));
            }
            return Err(PipelineError::InconsistentState {
                run_id,
                reason: format!("{remaining} unit(s) unfinished after dispatch drained"),
            });
        }
        Ok(None)
    }

    fn compute_job(&self, unit_id: UnitId, input_id: ArtifactId, delay: Duration) -> impl Future<Output = JobResult> {
        let store = Arc::clone(&self.store);
        let producer = Arc::clone(&self.producer);
        let cancel = self.cancel.clone();
        let task = self.config.task_description.clone();
        let timeout = self.config.compute_timeout();

        async move {
            if !delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(JobOutput::Skipped),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let started = Utc::now();
            let input = store.get(&input_id).await?;
            let response = match tokio::time::timeout(timeout, producer.compute(&input, &task)).await {
                Ok(response) => response,
                Err(_) => Err(ProducerError::Timeout { ms: millis(timeout) }),
            };
            let claim = match response.and_then(ProducerResponse::into_claim) {
                Ok(claim) => claim,
                Err(error) => return Ok(JobOutput::ComputeFailed { error, started }),
            };

            let record = ComputedRecord {
                unit_id,
                input_artifact_id: input_id,
                claimed_output: claim.claimed_output.clone(),
                derivation: claim.derivation.clone(),
            };
            let bytes = serde_json::to_vec(&record)?;
            let result_id = store
                .put(&bytes, ArtifactKind::ComputedResult, COMPUTE_STAGE, &[input_id])
                .await?;
            tracing::debug!(result = %result_id.short(), "claim stored");
            Ok(JobOutput::Computed {
                result_id,
                claim,
                started,
            })
        }
    }

    /// Requeue, park or fail a unit after a transient failure
    #[allow(clippy::too_many_arguments)]
    async fn handle_transient(
        &self,
        state: &mut PipelineState,
        unit_id: &UnitId,
        error: UnitError,
        started: DateTime<Utc>,
        audit: &AuditLog,
        compute_queue: &mut VecDeque<(UnitId, Duration)>,
        halt: &mut Option<UnitFailure>,
    ) -> Result<(), PipelineError> {
        let run_id = state.run_id;
        let stage = state.current_stage;
        let max_attempts = self.config.max_attempts;
        let unit = unit_mut(state, unit_id)?;

        let decision = if halt.is_some() || self.cancel.is_cancelled() {
            AfterFailure::Parked
        } else if unit.attempt_count < max_attempts {
            AfterFailure::Retry(self.config.retry.delay(unit.attempt_count))
        } else {
            AfterFailure::Exhausted
        };

        let entry = AuditEntry::new(OperationKind::Compute, run_id, started)
            .unit(unit_id)
            .artifacts(vec![unit.input_artifact_id], Vec::new())
            .retries(unit.attempt_count.saturating_sub(1))
            .error(error.clone());
        unit.result_artifact_id = None;
        unit.last_error = Some(error.clone());

        match decision {
            AfterFailure::Retry(delay) => {
                set_status(unit, UnitStatus::Pending)?;
                tracing::warn!(
                    %unit_id,
                    attempt = unit.attempt_count,
                    max_attempts,
                    delay_ms = millis(delay),
                    "retrying unit"
                );
                compute_queue.push_back((unit_id.clone(), delay));
            }
            AfterFailure::Parked => {
                set_status(unit, UnitStatus::Pending)?;
            }
            AfterFailure::Exhausted => {
                set_status(unit, UnitStatus::Failed)?;
                *halt = Some(UnitFailure {
                    run_id,
                    unit_id: unit_id.clone(),
                    stage,
                    category: error.category,
                    message: format!("{} (after {} attempts)", error.message, unit.attempt_count),
                    attestation_artifact_id: None,
                });
            }
        }
        audit.record(&entry).await?;
        Ok(())
    }

    /// Record a verdict on its unit; returns the failure if it halts the run
    async fn apply_attestation(
        &self,
        state: &mut PipelineState,
        unit_id: &UnitId,
        attestation: &Attestation,
        started: DateTime<Utc>,
        audit: &AuditLog,
    ) -> Result<Option<UnitFailure>, PipelineError> {
        let run_id = state.run_id;
        let stage = state.current_stage;
        let record = &attestation.record;
        let unit = unit_mut(state, unit_id)?;
        unit.attestation_artifact_id = Some(attestation.artifact_id);

        let mut entry = AuditEntry::new(OperationKind::Verify, run_id, started)
            .unit(unit_id)
            .artifacts(vec![record.subject_artifact_id], vec![attestation.artifact_id])
            .outcome(record.outcome)
            .retries(record.attempts.saturating_sub(1));

        let failure = match record.outcome {
            AttestationOutcome::Agree => {
                set_status(unit, UnitStatus::Completed)?;
                unit.last_error = None;
                tracing::info!(%unit_id, result = %record.subject_artifact_id.short(), "unit completed");
                None
            }
            outcome => {
                let (category, message) = if outcome == AttestationOutcome::Disagree {
                    let detail = record
                        .discrepancy_detail
                        .as_ref()
                        .map_or_else(|| "verifier disagreed".to_string(), ToString::to_string);
                    (ErrorCategory::Disagreement, detail)
                } else {
                    let detail = record
                        .verdicts
                        .iter()
                        .find_map(|v| v.error.clone())
                        .unwrap_or_else(|| "no verifier produced a result".to_string());
                    (ErrorCategory::VerifierUnavailable, detail)
                };
                set_status(unit, UnitStatus::Failed)?;
                let error = UnitError::new(category, message.clone());
                unit.last_error = Some(error.clone());
                entry = entry.error(error);
                Some(UnitFailure {
                    run_id,
                    unit_id: unit_id.clone(),
                    stage,
                    category,
                    message,
                    attestation_artifact_id: Some(attestation.artifact_id),
                })
            }
        };

        audit.record(&entry).await?;
        state.touch();
        self.recorder.checkpoint(state).await?;
        Ok(failure)
    }

    /// Re-check every unit against its stored attestation
    ///
    /// The gate reads the attestation artifact itself rather than trusting
    /// the unit status.
    async fn attested_results(&self, state: &PipelineState) -> Result<BTreeMap<UnitId, AttestedResult>, PipelineError> {
        let run_id = state.run_id;
        let mut attested = BTreeMap::new();
        for unit in state.work_units.values() {
            let inconsistent = |reason: &str| PipelineError::InconsistentState {
                run_id,
                reason: format!("unit {}: {reason}", unit.unit_id),
            };
            if unit.status != UnitStatus::Completed {
                return Err(inconsistent("not completed"));
            }
            let result_id = unit.result_artifact_id.ok_or_else(|| inconsistent("no result"))?;
            let attestation_id = unit
                .attestation_artifact_id
                .ok_or_else(|| inconsistent("no attestation"))?;

            let attestation = AttestationRecord::from_bytes(&self.store.get(&attestation_id).await?)
                .map_err(|e| PipelineError::decode(attestation_id, "attestation", e))?;
            if attestation.outcome != AttestationOutcome::Agree {
                return Err(inconsistent(&format!("attestation outcome is {}", attestation.outcome)));
            }
            if attestation.subject_artifact_id != result_id {
                return Err(inconsistent("attestation is about a different result"));
            }

            let result = ComputedRecord::from_bytes(&self.store.get(&result_id).await?)
                .map_err(|e| PipelineError::decode(result_id, "computed result", e))?;
            attested.insert(
                unit.unit_id.clone(),
                AttestedResult {
                    unit_id: unit.unit_id.clone(),
                    result_artifact_id: result_id,
                    attestation_artifact_id: attestation_id,
                    output: result.claimed_output,
                },
            );
        }
        Ok(attested)
    }

    /// Merge attested results into the final dataset
    async fn consolidate(&self, state: &mut PipelineState, audit: &AuditLog) -> Result<Option<RunResult>, PipelineError> {
        let run_id = state.run_id;
        let mut attested = self.attested_results(state).await?;
        let plans = state.batch_plans.clone();
        let rollup = plans.iter().any(|p| p.requires_rollup);

        if !rollup {
            let started = Utc::now();
            let members: Vec<AttestedResult> = attested.into_values().collect();
            let batch_id = plans.first().map_or(BatchId(0), |p| p.batch_id);
            let merged = match plans.first() {
                Some(plan) => self.with_timeout(self.consolidator.consolidate(plan, &members)).await,
                None => self.with_timeout(self.consolidator.rollup(&[])).await,
            };
            let bytes = match merged {
                Ok(bytes) => bytes,
                Err(e) => return self.batch_failed(state, batch_id, &e, audit).await.map(Some),
            };
            let dependencies = member_dependencies(&members);
            let final_id = self
                .store
                .put(&bytes, ArtifactKind::FinalDataset, CONSOLIDATE_STAGE, &dependencies)
                .await?;
            audit
                .record(
                    &AuditEntry::new(OperationKind::Consolidate, run_id, started)
                        .batch(batch_id)
                        .artifacts(dependencies, vec![final_id]),
                )
                .await?;
            state.final_dataset = Some(final_id);
            return Ok(None);
        }

        if state.current_stage == Stage::PerUnitProcessing {
            advance_stage(state, Stage::BatchConsolidation)?;
            self.recorder.checkpoint(state).await?;
        }

        let mut parts = Vec::with_capacity(plans.len());
        for plan in &plans {
            if let Some(existing) = state.consolidated.get(&plan.batch_id) {
                tracing::debug!(batch_id = %plan.batch_id, "batch already consolidated");
                parts.push((plan.batch_id, self.store.get(existing).await?));
                continue;
            }

            let started = Utc::now();
            let members: Vec<AttestedResult> = plan
                .member_unit_ids
                .iter()
                .filter_map(|id| attested.remove(id))
                .collect();
            if members.len() != plan.member_unit_ids.len() {
                return Err(PipelineError::InconsistentState {
                    run_id,
                    reason: format!("batch {} names units outside the run", plan.batch_id),
                });
            }
            let bytes = match self.with_timeout(self.consolidator.consolidate(plan, &members)).await {
                Ok(bytes) => bytes,
                Err(e) => return self.batch_failed(state, plan.batch_id, &e, audit).await.map(Some),
            };
            let dependencies = member_dependencies(&members);
            let batch_artifact = self
                .store
                .put(&bytes, ArtifactKind::ConsolidatedBatch, CONSOLIDATE_STAGE, &dependencies)
                .await?;
            audit
                .record(
                    &AuditEntry::new(OperationKind::Consolidate, run_id, started)
                        .batch(plan.batch_id)
                        .artifacts(dependencies, vec![batch_artifact]),
                )
                .await?;
            tracing::info!(batch_id = %plan.batch_id, artifact_id = %batch_artifact.short(), "batch consolidated");

            state.consolidated.insert(plan.batch_id, batch_artifact);
            state.touch();
            self.recorder.checkpoint(state).await?;
            parts.push((plan.batch_id, bytes));
        }

        let started = Utc::now();
        let last_batch = plans.last().map_or(BatchId(0), |p| p.batch_id);
        let bytes = match self.with_timeout(self.consolidator.rollup(&parts)).await {
            Ok(bytes) => bytes,
            Err(e) => return self.batch_failed(state, last_batch, &e, audit).await.map(Some),
        };
        let dependencies: Vec<ArtifactId> = state.consolidated.values().copied().collect();
        let final_id = self
            .store
            .put(&bytes, ArtifactKind::FinalDataset, CONSOLIDATE_STAGE, &dependencies)
            .await?;
        audit
            .record(&AuditEntry::new(OperationKind::Rollup, run_id, started).artifacts(dependencies, vec![final_id]))
            .await?;
        state.final_dataset = Some(final_id);
        Ok(None)
    }

    async fn with_timeout<F>(&self, work: F) -> Result<Vec<u8>, ConsolidationError>
    where
        F: Future<Output = Result<Vec<u8>, ConsolidationError>>,
    {
        let limit = self.config.consolidate_timeout();
        tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(ConsolidationError::Timeout { ms: millis(limit) }))
    }

    async fn batch_failed(
        &self,
        state: &mut PipelineState,
        batch_id: BatchId,
        error: &ConsolidationError,
        audit: &AuditLog,
    ) -> Result<RunResult, PipelineError> {
        tracing::error!(%batch_id, %error, "consolidation failed; run halted");
        let category = error.category();
        audit
            .record(
                &AuditEntry::new(OperationKind::Halt, state.run_id, Utc::now())
                    .batch(batch_id)
                    .error(UnitError::new(category, error.to_string())),
            )
            .await?;
        state.touch();
        self.recorder.checkpoint(state).await?;
        Ok(RunResult::FailedAtBatch(BatchFailure {
            run_id: state.run_id,
            batch_id,
            stage: state.current_stage,
            category,
            message: error.to_string(),
        }))
    }

    /// Publish the final dataset name, retire the run and report success
    async fn finish(&self, state: &mut PipelineState, audit: &AuditLog) -> Result<RunResult, PipelineError> {
        let run_id = state.run_id;
        let final_dataset = state.final_dataset.ok_or_else(|| PipelineError::InconsistentState {
            run_id,
            reason: "consolidation produced no final dataset".into(),
        })?;
        let started = Utc::now();

        self.store.names().link(final_dataset_name(run_id), final_dataset).await?;
        advance_stage(state, Stage::ReadyForSynthesis)?;
        state.touch();
        self.recorder.archive(state).await?;

        let summary = run_summary(state, final_dataset)?;
        audit
            .record(&AuditEntry::new(OperationKind::Complete, run_id, started).artifacts(Vec::new(), vec![final_dataset]))
            .await?;
        tracing::info!(
            final_dataset = %final_dataset.short(),
            state_hash = %summary.state_hash.short(),
            units = summary.units,
            batches = summary.batches,
            "run complete"
        );
        Ok(RunResult::Success(summary))
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

async fn verify_job(coordinator: Arc<VerificationCoordinator>, result_id: ArtifactId, claim: Claim) -> JobResult {
    let started = Utc::now();
    let attestation = coordinator
        .verify(result_id, &claim.derivation, &claim.claimed_output)
        .await?;
    Ok(JobOutput::Verified { attestation, started })
}

fn unit_mut<'a>(state: &'a mut PipelineState, unit_id: &UnitId) -> Result<&'a mut WorkUnit, PipelineError> {
    let run_id = state.run_id;
    state
        .work_units
        .get_mut(unit_id)
        .ok_or_else(|| PipelineError::InconsistentState {
            run_id,
            reason: format!("unknown unit {unit_id}"),
        })
}

fn set_status(unit: &mut WorkUnit, to: UnitStatus) -> Result<(), PipelineError> {
    transition(unit, to).map_err(|source| PipelineError::Transition {
        unit_id: unit.unit_id.clone(),
        source,
    })
}

fn advance_stage(state: &mut PipelineState, to: Stage) -> Result<(), PipelineError> {
    validate_stage_transition(state.current_stage, to).map_err(PipelineError::Stage)?;
    tracing::info!(from = %state.current_stage, %to, "stage transition");
    state.current_stage = to;
    state.touch();
    Ok(())
}

/// Result and attestation ids of each member, in member order
fn member_dependencies(members: &[AttestedResult]) -> Vec<ArtifactId> {
    members
        .iter()
        .flat_map(|m| [m.result_artifact_id, m.attestation_artifact_id])
        .collect()
}

fn run_summary(state: &PipelineState, final_dataset: ArtifactId) -> Result<RunSummary, PipelineError> {
    Ok(RunSummary {
        run_id: state.run_id,
        final_dataset,
        state_hash: state.content_hash()?,
        units: state.work_units.len(),
        batches: state.batch_plans.len(),
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifierError;
    use crate::source::SourceUnit;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Producer for Echo {
        fn identity(&self) -> &str {
            "echo"
        }

        async fn compute(&self, input: &[u8], _task: &str) -> Result<ProducerResponse, ProducerError> {
            let value: i64 = std::str::from_utf8(input)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProducerError::Malformed("not a number".into()))?;
            Ok(ProducerResponse::computed(value * 2, Derivation::new(["double"])))
        }
    }

    struct Doubler;

    #[async_trait]
    impl Verifier for Doubler {
        fn identity(&self) -> &str {
            "doubler"
        }

        async fn recompute(&self, input: &[u8], _derivation: &Derivation) -> Result<OutputValue, VerifierError> {
            let value: i64 = std::str::from_utf8(input)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| VerifierError::Rejected("not a number".into()))?;
            Ok(OutputValue::Integer(value * 2))
        }
    }

    struct Numbers(Vec<SourceUnit>);

    #[async_trait]
    impl WorkSource for Numbers {
        async fn units(&self) -> Result<Vec<SourceUnit>, PipelineError> {
            Ok(self.0.clone())
        }
    }

    fn numbers(n: usize) -> Arc<Numbers> {
        Arc::new(Numbers(
            (0..n)
                .map(|i| SourceUnit::new(format!("u{i:02}"), i.to_string().into_bytes()))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn missing_collaborators_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineOrchestrator::builder(dir.path())
            .verifier(Arc::new(Doubler))
            .source(numbers(1))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Missing("producer"))));

        let err = PipelineOrchestrator::builder(dir.path())
            .producer(Arc::new(Echo))
            .source(numbers(1))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Missing("verifier"))));
    }

    #[tokio::test]
    async fn single_batch_run_links_final_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = PipelineOrchestrator::builder(dir.path())
            .producer(Arc::new(Echo))
            .verifier(Arc::new(Doubler))
            .source(numbers(5))
            .build()
            .await
            .unwrap();

        let run_id = RunId::new();
        let RunResult::Success(summary) = orchestrator.run(run_id, false).await.unwrap() else {
            panic!("run did not succeed");
        };
        assert_eq!((summary.units, summary.batches), (5, 1));

        let store = orchestrator.store();
        assert_eq!(store.resolve_name(&final_dataset_name(run_id)).await, Some(summary.final_dataset));
        assert_eq!(store.record(&summary.final_dataset).await.unwrap().kind, ArtifactKind::FinalDataset);
        // 5 results + 5 attestations
        assert_eq!(store.dependencies_of(&summary.final_dataset).await.unwrap().len(), 10);

        let state = orchestrator.recorder().load_latest(run_id).await.unwrap();
        assert_eq!(state.current_stage, Stage::ReadyForSynthesis);
        assert!(state.all_completed());
        assert!(!orchestrator.recorder().run_dir(run_id).exists());

        let stats = orchestrator.pool_stats();
        assert_eq!((stats.spawned, stats.completed, stats.panicked), (10, 10, 0));
    }

    #[tokio::test]
    async fn completed_run_resumes_as_success_without_work() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = PipelineOrchestrator::builder(dir.path())
            .producer(Arc::new(Echo))
            .verifier(Arc::new(Doubler))
            .source(numbers(3))
            .build()
            .await
            .unwrap();

        let run_id = RunId::new();
        let first = orchestrator.run(run_id, false).await.unwrap();
        let again = orchestrator.run(run_id, true).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn empty_source_yields_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = PipelineOrchestrator::builder(dir.path())
            .producer(Arc::new(Echo))
            .verifier(Arc::new(Doubler))
            .source(numbers(0))
            .build()
            .await
            .unwrap();

        let RunResult::Success(summary) = orchestrator.run(RunId::new(), false).await.unwrap() else {
            panic!("run did not succeed");
        };
        assert_eq!((summary.units, summary.batches), (0, 0));
        let bytes = orchestrator.store().get(&summary.final_dataset).await.unwrap();
        let merged: crate::consolidate::MergedBatch = serde_json::from_slice(&bytes).unwrap();
        assert!(merged.results.is_empty());
    }

    #[tokio::test]
    async fn duplicate_unit_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Numbers(vec![SourceUnit::new("a", b"1".to_vec()), SourceUnit::new("a", b"2".to_vec())]));
        let orchestrator = PipelineOrchestrator::builder(dir.path())
            .producer(Arc::new(Echo))
            .verifier(Arc::new(Doubler))
            .source(source)
            .build()
            .await
            .unwrap();

        let err = orchestrator.run(RunId::new(), false).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateUnit(id) if id.as_str() == "a"));
    }

    #[test]
    fn final_dataset_name_is_per_run() {
        let run_id = RunId::new();
        assert_eq!(final_dataset_name(run_id), format!("runs/{run_id}/final-dataset"));
    }
}
