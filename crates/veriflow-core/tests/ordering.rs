//! Completion order must not leak into results

use pretty_assertions::assert_eq;
use std::sync::Arc;
use veriflow_core::{PipelineOrchestrator, RunId, RunResult, RunSummary, Verifier};
use veriflow_test_utils::{fast_config, temp_root, ScriptedProducer, ScriptedVerifier, VecWorkSource};

async fn run_once(run_id: RunId, concurrency: usize, jitter_ms: u64) -> RunSummary {
    let root = temp_root();
    let values: Vec<f64> = (0..12u32).map(|i| f64::from(i) * 1.5).collect();
    let orchestrator = PipelineOrchestrator::builder(root.path())
        .config(fast_config().with_max_concurrency(concurrency))
        .producer(Arc::new(ScriptedProducer::echo_value().with_delays(0, jitter_ms)))
        .verifiers(["checker-a", "checker-b"].map(|name| Arc::new(ScriptedVerifier::echo_value(name)) as Arc<dyn Verifier>))
        .source(Arc::new(VecWorkSource::from_values(&values)))
        .build()
        .await
        .unwrap();

    match orchestrator.run(run_id, false).await.unwrap() {
        RunResult::Success(summary) => summary,
        other => panic!("run failed: {other:?}"),
    }
}

#[tokio::test]
async fn final_state_hash_is_independent_of_completion_order() {
    let run_id = RunId::new();
    let sequential = run_once(run_id, 1, 0).await;
    for _ in 0..3 {
        let shuffled = run_once(run_id, 6, 20).await;
        assert_eq!(shuffled, sequential);
    }
}
