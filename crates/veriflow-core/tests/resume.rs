//! Crash recovery and cancellation

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use veriflow_core::{
    Derivation, PipelineOrchestrator, ProducerResponse, RunId, RunResult, UnitId, UnitStatus,
};
use veriflow_test_utils::{
    fast_config, input_value, temp_root, value_bytes, ScriptedProducer, ScriptedVerifier, VecWorkSource,
};

const VALUES: [f64; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

async fn build(
    root: &std::path::Path,
    producer: Arc<ScriptedProducer>,
    token: Option<CancellationToken>,
) -> PipelineOrchestrator {
    let mut builder = PipelineOrchestrator::builder(root)
        .config(fast_config().with_max_concurrency(1))
        .producer(producer)
        .verifier(Arc::new(ScriptedVerifier::echo_value("checker")))
        .source(Arc::new(VecWorkSource::from_values(&VALUES)));
    if let Some(token) = token {
        builder = builder.cancellation_token(token);
    }
    builder.build().await.unwrap()
}

#[tokio::test]
async fn resume_after_crash_skips_completed_units() {
    let root = temp_root();
    let run_id = RunId::new();

    // Calls after the third never return: the "process" is killed mid-unit
    let stalled = Arc::new(ScriptedProducer::echo_value().hang_after(3));
    let first = Arc::new(build(root.path(), stalled, None).await);
    let handle = {
        let first = Arc::clone(&first);
        tokio::spawn(async move { first.run(run_id, false).await })
    };

    let recorder = first.recorder();
    let before = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(state) = recorder.load_latest(run_id).await {
                if state.count(UnitStatus::Completed) == 3 {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("three units never completed");
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    let completed: BTreeMap<UnitId, _> = before
        .work_units
        .values()
        .filter(|u| u.status == UnitStatus::Completed)
        .map(|u| (u.unit_id.clone(), (u.result_artifact_id, u.attestation_artifact_id)))
        .collect();
    assert_eq!(completed.len(), 3);

    let fresh = Arc::new(ScriptedProducer::echo_value());
    let second = build(root.path(), fresh.clone(), None).await;
    let result = second.run(run_id, true).await.unwrap();
    assert!(result.is_success(), "{result:?}");

    assert_eq!(fresh.calls(), VALUES.len() - 3);
    for value in &VALUES[..3] {
        assert_eq!(fresh.calls_for(&value_bytes(*value)), 0, "recomputed {value}");
    }

    let after = second.recorder().load_latest(run_id).await.unwrap();
    assert!(after.all_completed());
    for (unit_id, ids) in &completed {
        let unit = &after.work_units[unit_id];
        assert_eq!(&(unit.result_artifact_id, unit.attestation_artifact_id), ids);
    }
}

#[tokio::test]
async fn resume_without_checkpoint_starts_fresh() {
    let root = temp_root();
    let producer = Arc::new(ScriptedProducer::echo_value());
    let orchestrator = build(root.path(), producer.clone(), None).await;

    let result = orchestrator.run(RunId::new(), true).await.unwrap();
    assert!(result.is_success());
    assert_eq!(producer.calls(), VALUES.len());
}

#[tokio::test]
async fn corrupt_latest_checkpoint_falls_back() {
    let root = temp_root();
    let run_id = RunId::new();
    let stalled = Arc::new(ScriptedProducer::echo_value().hang_after(2));
    let first = Arc::new(build(root.path(), stalled, None).await);
    let handle = {
        let first = Arc::clone(&first);
        tokio::spawn(async move { first.run(run_id, false).await })
    };
    let recorder = first.recorder();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(state) = recorder.load_latest(run_id).await {
                if state.count(UnitStatus::Completed) == 2 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("two units never completed");
    handle.abort();
    let _ = handle.await;

    let checkpoints = recorder.checkpoints(run_id).await.unwrap();
    let (_, newest) = checkpoints.last().unwrap();
    tokio::fs::write(newest, b"{\"format_version\":1,\"sequ").await.unwrap();

    let fresh = Arc::new(ScriptedProducer::echo_value());
    let second = build(root.path(), fresh.clone(), None).await;
    let result = second.run(run_id, true).await.unwrap();
    assert!(result.is_success(), "{result:?}");
    // The fallback checkpoint has one unit completed
    assert_eq!(fresh.calls(), VALUES.len() - 1);
}

#[tokio::test]
async fn cancelled_before_dispatch_then_resumed() {
    let root = temp_root();
    let run_id = RunId::new();
    let token = CancellationToken::new();
    token.cancel();

    let idle = Arc::new(ScriptedProducer::echo_value());
    let first = build(root.path(), idle.clone(), Some(token)).await;
    let result = first.run(run_id, false).await.unwrap();
    assert_eq!(
        result,
        RunResult::Cancelled {
            run_id,
            completed_units: 0,
            remaining_units: VALUES.len(),
        }
    );
    assert_eq!(idle.calls(), 0);

    let producer = Arc::new(ScriptedProducer::echo_value());
    let second = build(root.path(), producer.clone(), None).await;
    assert!(second.run(run_id, true).await.unwrap().is_success());
    assert_eq!(producer.calls(), VALUES.len());
}

#[tokio::test]
async fn cancellation_lets_the_in_flight_unit_finish() {
    let root = temp_root();
    let run_id = RunId::new();
    let token = CancellationToken::new();

    let calls = Arc::new(AtomicUsize::new(0));
    let producer = {
        let token = token.clone();
        let calls = Arc::clone(&calls);
        Arc::new(ScriptedProducer::new(move |input| {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                token.cancel();
            }
            let value = input_value(input).unwrap_or_default();
            Ok(ProducerResponse::computed(value, Derivation::new(["read field `value`"])))
        }))
    };
    let orchestrator = build(root.path(), producer, Some(token)).await;

    let result = orchestrator.run(run_id, false).await.unwrap();
    assert_eq!(
        result,
        RunResult::Cancelled {
            run_id,
            completed_units: 2,
            remaining_units: VALUES.len() - 2,
        }
    );

    let state = orchestrator.recorder().load_latest(run_id).await.unwrap();
    assert_eq!(state.count(UnitStatus::Completed), 2);
    assert_eq!(state.count(UnitStatus::Pending), VALUES.len() - 2);
}
