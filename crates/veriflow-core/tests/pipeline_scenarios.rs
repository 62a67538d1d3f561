//! End-to-end runs against scripted producers and verifiers

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use veriflow_artifact::ArtifactKind;
use veriflow_core::audit::read_entries;
use veriflow_core::{
    AttestationOutcome, AttestationRecord, AttestedResult, BatchId, BatchPlan, BudgetConfig, ConsolidationError,
    Consolidator, ErrorCategory, MergedBatch, OperationKind, OutputValue, PipelineConfig, PipelineError,
    PipelineOrchestrator, PlanError, RunId, RunResult, Stage, UnitId, UnitStatus,
};
use veriflow_test_utils::{
    count_kinds, fast_config, input_value, temp_root, value_unit, ScriptedProducer, ScriptedVerifier,
    VecWorkSource,
};

async fn orchestrator(
    root: &std::path::Path,
    config: PipelineConfig,
    producer: Arc<ScriptedProducer>,
    verifier: Arc<ScriptedVerifier>,
    source: VecWorkSource,
) -> PipelineOrchestrator {
    PipelineOrchestrator::builder(root)
        .config(config)
        .producer(producer)
        .verifier(verifier)
        .source(Arc::new(source))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn disagreement_halts_at_the_unit() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value());
    // Agrees on A (0.95), recomputes 0.02 where B claims 0.0
    let verifier = Arc::new(ScriptedVerifier::new("checker", |input, _| {
        let v = input_value(input).unwrap();
        Ok(OutputValue::Number(if v == 0.0 { 0.02 } else { v }))
    }));
    let source = VecWorkSource::new(vec![value_unit("A", 0.95), value_unit("B", 0.0)]);
    let orchestrator = orchestrator(
        root.path(),
        fast_config().with_max_concurrency(1),
        producer,
        verifier,
        source,
    )
    .await;

    let run_id = RunId::new();
    let RunResult::FailedAtUnit(failure) = orchestrator.run(run_id, false).await.unwrap() else {
        panic!("expected FailedAtUnit");
    };
    assert_eq!(failure.unit_id, UnitId::from("B"));
    assert_eq!(failure.category, ErrorCategory::Disagreement);
    assert_eq!(failure.stage, Stage::PerUnitProcessing);
    assert_eq!(failure.run_id, run_id);

    let store = orchestrator.store();
    let attestation_id = failure.attestation_artifact_id.unwrap();
    let record = AttestationRecord::from_bytes(&store.get(&attestation_id).await.unwrap()).unwrap();
    assert_eq!(record.outcome, AttestationOutcome::Disagree);
    assert_eq!(record.claimed_output, OutputValue::Number(0.0));
    assert_eq!(record.verifier_recomputed_output, Some(OutputValue::Number(0.02)));
    let discrepancy = record.discrepancy_detail.unwrap();
    assert_eq!(discrepancy.path, "$");
    assert!((discrepancy.delta.unwrap() + 0.02).abs() < 1e-12);

    let state = orchestrator.recorder().load_latest(run_id).await.unwrap();
    assert_eq!(state.current_stage, Stage::PerUnitProcessing);
    let a = &state.work_units[&UnitId::from("A")];
    assert_eq!(a.status, UnitStatus::Completed);
    assert!(store.contains(&a.result_artifact_id.unwrap()).await);
    assert!(store.contains(&a.attestation_artifact_id.unwrap()).await);
    let b = &state.work_units[&UnitId::from("B")];
    assert_eq!(b.status, UnitStatus::Failed);
    assert_eq!(b.attestation_artifact_id, Some(attestation_id));
    assert_eq!(b.last_error.as_ref().map(|e| e.category), Some(ErrorCategory::Disagreement));

    let kinds = count_kinds(store).await;
    assert_eq!(kinds.get(&ArtifactKind::ConsolidatedBatch), None);
    assert_eq!(kinds.get(&ArtifactKind::FinalDataset), None);
    assert_eq!(kinds.get(&ArtifactKind::VerificationAttestation), Some(&2));
}

#[tokio::test]
async fn forty_six_units_roll_up_from_two_batches() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value());
    let verifier = Arc::new(ScriptedVerifier::echo_value("checker"));
    let values: Vec<f64> = (0..46u32).map(f64::from).collect();
    // Largest input `{"value":45.0}` is 14 bytes, so every estimate is at most
    // 1014 and 24000 / 1014 = 23 units fit per batch.
    let config = fast_config().with_budget(BudgetConfig {
        budget_bytes: 24_000,
        safety_margin: 0.0,
        max_batch_size: 64,
        encoding_overhead: 1.0,
        per_unit_envelope_bytes: 1000,
    });
    let orchestrator = orchestrator(
        root.path(),
        config,
        producer.clone(),
        verifier,
        VecWorkSource::from_values(&values),
    )
    .await;

    let run_id = RunId::new();
    let RunResult::Success(summary) = orchestrator.run(run_id, false).await.unwrap() else {
        panic!("expected success");
    };
    assert_eq!((summary.units, summary.batches), (46, 2));
    assert_eq!(producer.calls(), 46);

    let state = orchestrator.recorder().load_latest(run_id).await.unwrap();
    assert_eq!(state.current_stage, Stage::ReadyForSynthesis);
    assert_eq!(
        state.batch_plans.iter().map(|p| p.member_unit_ids.len()).collect::<Vec<_>>(),
        vec![23, 23]
    );
    assert!(state.batch_plans.iter().all(|p| p.requires_rollup));
    assert_eq!(state.consolidated.len(), 2);

    let store = orchestrator.store();
    let kinds = count_kinds(store).await;
    assert_eq!(kinds[&ArtifactKind::RawInput], 46);
    assert_eq!(kinds[&ArtifactKind::ComputedResult], 46);
    assert_eq!(kinds[&ArtifactKind::VerificationAttestation], 46);
    assert_eq!(kinds[&ArtifactKind::ConsolidatedBatch], 2);
    assert_eq!(kinds[&ArtifactKind::FinalDataset], 1);

    let merged: MergedBatch = serde_json::from_slice(&store.get(&summary.final_dataset).await.unwrap()).unwrap();
    assert_eq!(merged.batches, vec![BatchId(0), BatchId(1)]);
    assert_eq!(merged.results.len(), 46);
    assert_eq!(merged.results[&UnitId::from("unit-007")], OutputValue::Number(7.0));

    // Every raw input is reachable from the final dataset
    let mut raw_inputs = 0;
    for id in store.lineage(&summary.final_dataset).await.unwrap() {
        if store.record(&id).await.unwrap().kind == ArtifactKind::RawInput {
            raw_inputs += 1;
        }
    }
    assert_eq!(raw_inputs, 46);
}

#[tokio::test]
async fn unavailable_verifier_escalates_after_retries() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value());
    let verifier = Arc::new(ScriptedVerifier::unavailable("down"));
    let orchestrator = orchestrator(
        root.path(),
        fast_config(),
        producer,
        verifier.clone(),
        VecWorkSource::from_values(&[1.0]),
    )
    .await;

    let RunResult::FailedAtUnit(failure) = orchestrator.run(RunId::new(), false).await.unwrap() else {
        panic!("expected FailedAtUnit");
    };
    assert_eq!(failure.category, ErrorCategory::VerifierUnavailable);
    assert!(failure.message.contains("connection refused"));
    assert_eq!(verifier.calls(), 3);
}

#[tokio::test]
async fn transient_producer_failures_are_retried() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value().failing_first(2));
    let verifier = Arc::new(ScriptedVerifier::echo_value("checker"));
    let orchestrator = orchestrator(
        root.path(),
        fast_config().with_max_attempts(3),
        producer.clone(),
        verifier,
        VecWorkSource::from_values(&[4.0]),
    )
    .await;

    let run_id = RunId::new();
    let result = orchestrator.run(run_id, false).await.unwrap();
    assert!(result.is_success());
    assert_eq!(producer.calls(), 3);

    let entries = read_entries(&orchestrator.audit_path(run_id)).await.unwrap();
    let failed_computes: Vec<_> = entries
        .iter()
        .filter(|e| e.operation == OperationKind::Compute && e.error.is_some())
        .collect();
    assert_eq!(failed_computes.len(), 2);
    assert!(failed_computes
        .iter()
        .all(|e| e.error.as_ref().unwrap().category == ErrorCategory::Transient));
    let verify = entries.iter().find(|e| e.operation == OperationKind::Verify).unwrap();
    assert_eq!(verify.outcome, Some(AttestationOutcome::Agree));
    assert!(entries.iter().any(|e| e.operation == OperationKind::Complete));

    let state = orchestrator.recorder().load_latest(run_id).await.unwrap();
    let unit = state.work_units.values().next().unwrap();
    assert_eq!(unit.attempt_count, 3);
    assert_eq!(unit.last_error, None);
}

#[tokio::test]
async fn hung_compute_call_times_out_and_is_retried() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value().hanging_first(1));
    let orchestrator = orchestrator(
        root.path(),
        fast_config().with_compute_timeout(Duration::from_millis(50)),
        producer.clone(),
        Arc::new(ScriptedVerifier::echo_value("checker")),
        VecWorkSource::from_values(&[7.0]),
    )
    .await;

    let run_id = RunId::new();
    let result = orchestrator.run(run_id, false).await.unwrap();
    assert!(result.is_success(), "{result:?}");
    assert_eq!(producer.calls(), 2);

    let entries = read_entries(&orchestrator.audit_path(run_id)).await.unwrap();
    let timed_out = entries
        .iter()
        .filter(|e| e.operation == OperationKind::Compute)
        .filter_map(|e| e.error.as_ref())
        .find(|error| error.message.contains("timed out"))
        .expect("timeout was not audited");
    assert_eq!(timed_out.category, ErrorCategory::Transient);
}

#[tokio::test]
async fn compute_timeouts_exhaust_attempts() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value().hanging_first(usize::MAX / 2));
    let orchestrator = orchestrator(
        root.path(),
        fast_config()
            .with_max_attempts(2)
            .with_compute_timeout(Duration::from_millis(50)),
        producer.clone(),
        Arc::new(ScriptedVerifier::echo_value("checker")),
        VecWorkSource::from_values(&[7.0]),
    )
    .await;

    let run_id = RunId::new();
    let RunResult::FailedAtUnit(failure) = orchestrator.run(run_id, false).await.unwrap() else {
        panic!("expected FailedAtUnit");
    };
    assert_eq!(failure.category, ErrorCategory::Transient);
    assert!(failure.message.contains("timed out"), "{}", failure.message);
    assert!(failure.message.contains("after 2 attempts"), "{}", failure.message);
    assert_eq!(producer.calls(), 2);

    let state = orchestrator.recorder().load_latest(run_id).await.unwrap();
    assert_eq!(state.count(UnitStatus::Failed), 1);
}

#[tokio::test]
async fn hung_verifier_times_out_as_unavailable() {
    let root = temp_root();
    let verifier = Arc::new(ScriptedVerifier::hanging("stuck"));
    let orchestrator = orchestrator(
        root.path(),
        fast_config().with_verify_timeout(Duration::from_millis(50)),
        Arc::new(ScriptedProducer::echo_value()),
        verifier.clone(),
        VecWorkSource::from_values(&[7.0]),
    )
    .await;

    let run_id = RunId::new();
    let RunResult::FailedAtUnit(failure) = orchestrator.run(run_id, false).await.unwrap() else {
        panic!("expected FailedAtUnit");
    };
    assert_eq!(failure.category, ErrorCategory::VerifierUnavailable);
    assert!(failure.message.contains("timed out"), "{}", failure.message);
    assert!(failure.attestation_artifact_id.is_some());
    assert_eq!(verifier.calls(), 3);

    let counts = count_kinds(orchestrator.store()).await;
    assert_eq!(counts.get(&ArtifactKind::VerificationAttestation), Some(&1));
    assert_eq!(counts.get(&ArtifactKind::FinalDataset), None);
}

#[tokio::test]
async fn exhausted_attempts_fail_the_unit_until_resumed() {
    let root = temp_root();
    let run_id = RunId::new();
    let failing = Arc::new(ScriptedProducer::echo_value().failing_first(usize::MAX / 2));
    let first = orchestrator(
        root.path(),
        fast_config().with_max_attempts(2),
        failing.clone(),
        Arc::new(ScriptedVerifier::echo_value("checker")),
        VecWorkSource::from_values(&[1.0, 2.0]),
    )
    .await;

    let RunResult::FailedAtUnit(failure) = first.run(run_id, false).await.unwrap() else {
        panic!("expected FailedAtUnit");
    };
    assert_eq!(failure.category, ErrorCategory::Transient);
    assert!(failure.message.contains("after 2 attempts"), "{}", failure.message);
    drop(first);

    // Resuming grants the failed unit a fresh attempt budget
    let healthy = Arc::new(ScriptedProducer::echo_value());
    let second = orchestrator(
        root.path(),
        fast_config().with_max_attempts(2),
        healthy.clone(),
        Arc::new(ScriptedVerifier::echo_value("checker")),
        VecWorkSource::from_values(&[1.0, 2.0]),
    )
    .await;
    let result = second.run(run_id, true).await.unwrap();
    assert!(result.is_success(), "{result:?}");
    assert_eq!(healthy.calls(), 2);
}

#[tokio::test]
async fn panicking_producer_is_restarted() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value().panicking_first(1));
    let orchestrator = orchestrator(
        root.path(),
        fast_config(),
        producer.clone(),
        Arc::new(ScriptedVerifier::echo_value("checker")),
        VecWorkSource::from_values(&[3.0]),
    )
    .await;

    let result = orchestrator.run(RunId::new(), false).await.unwrap();
    assert!(result.is_success(), "{result:?}");
    assert_eq!(producer.calls(), 2);
    assert_eq!(orchestrator.pool_stats().panicked, 1);
}

#[tokio::test]
async fn oversized_unit_fails_before_any_producer_call() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value());
    let config = fast_config().with_budget(BudgetConfig {
        budget_bytes: 100,
        safety_margin: 0.5,
        ..BudgetConfig::default()
    });
    let orchestrator = orchestrator(
        root.path(),
        config,
        producer.clone(),
        Arc::new(ScriptedVerifier::echo_value("checker")),
        VecWorkSource::from_values(&[1.0, 2.0]),
    )
    .await;

    let err = orchestrator.run(RunId::new(), false).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Budget);
    let PipelineError::Plan(PlanError::OversizedUnit {
        unit_ids,
        effective_budget,
        ..
    }) = err
    else {
        panic!("expected OversizedUnit, got {err:?}");
    };
    assert_eq!(unit_ids, vec![UnitId::from("unit-000"), UnitId::from("unit-001")]);
    assert_eq!(effective_budget, 50);
    assert_eq!(producer.calls(), 0);
}

struct BrokenConsolidator;

#[async_trait]
impl Consolidator for BrokenConsolidator {
    async fn consolidate(&self, _batch: &BatchPlan, _members: &[AttestedResult]) -> Result<Vec<u8>, ConsolidationError> {
        Err(ConsolidationError::Failed("schema mismatch".into()))
    }

    async fn rollup(&self, _parts: &[(BatchId, Vec<u8>)]) -> Result<Vec<u8>, ConsolidationError> {
        Err(ConsolidationError::Failed("schema mismatch".into()))
    }
}

#[tokio::test]
async fn consolidation_failure_halts_at_the_batch() {
    let root = temp_root();
    let orchestrator = PipelineOrchestrator::builder(root.path())
        .config(fast_config())
        .producer(Arc::new(ScriptedProducer::echo_value()))
        .verifier(Arc::new(ScriptedVerifier::echo_value("checker")))
        .source(Arc::new(VecWorkSource::from_values(&[1.0, 2.0, 3.0])))
        .consolidator(Arc::new(BrokenConsolidator))
        .build()
        .await
        .unwrap();

    let run_id = RunId::new();
    let RunResult::FailedAtBatch(failure) = orchestrator.run(run_id, false).await.unwrap() else {
        panic!("expected FailedAtBatch");
    };
    assert_eq!(failure.batch_id, BatchId(0));
    assert_eq!(failure.category, ErrorCategory::Consolidation);
    assert!(failure.message.contains("schema mismatch"));

    let state = orchestrator.recorder().load_latest(run_id).await.unwrap();
    assert!(state.all_completed());
    assert_eq!(state.final_dataset, None);
    assert_eq!(count_kinds(orchestrator.store()).await.get(&ArtifactKind::FinalDataset), None);
}
