//! Testing utilities for the veriflow workspace
//!
//! Scripted producers and verifiers, in-memory work sources and fixtures
//! shared by integration tests.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use veriflow_artifact::{ArtifactKind, ArtifactStore};
use veriflow_core::{
    Derivation, OutputValue, PipelineConfig, PipelineError, Producer, ProducerError, ProducerResponse,
    RetryPolicy, SourceUnit, Verifier, VerifierError, WorkSource,
};

type ComputeFn = dyn Fn(&Value) -> Result<ProducerResponse, ProducerError> + Send + Sync;
type RecomputeFn = dyn Fn(&Value, &Derivation) -> Result<OutputValue, VerifierError> + Send + Sync;

/// Parse unit bytes as JSON, `Null` if they are not
pub fn parse_input(input: &[u8]) -> Value {
    serde_json::from_slice(input).unwrap_or(Value::Null)
}

/// The `value` field of a `{"value": x}` input
pub fn input_value(input: &Value) -> Option<f64> {
    input.get("value").and_then(Value::as_f64)
}

/// Producer driven by a closure over the parsed input
pub struct ScriptedProducer {
    identity: String,
    script: Box<ComputeFn>,
    calls: AtomicUsize,
    calls_by_input: Mutex<HashMap<Vec<u8>, usize>>,
    delay_ms: Option<(u64, u64)>,
    hang_after: Option<usize>,
    hanging_calls: usize,
    failing_calls: usize,
    panicking_calls: usize,
}

impl ScriptedProducer {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&Value) -> Result<ProducerResponse, ProducerError> + Send + Sync + 'static,
    {
        Self {
            identity: "scripted-producer".into(),
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            calls_by_input: Mutex::new(HashMap::new()),
            delay_ms: None,
            hang_after: None,
            hanging_calls: 0,
            failing_calls: 0,
            panicking_calls: 0,
        }
    }

    /// Claims `input.value` as computed
    pub fn echo_value() -> Self {
        Self::new(|input| match input_value(input) {
            Some(v) => Ok(ProducerResponse::computed(v, Derivation::new(["read field `value`"]))),
            None => Err(ProducerError::Malformed("input has no numeric `value`".into())),
        })
    }

    /// Random delay per call, in milliseconds
    #[must_use]
    pub fn with_delays(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.delay_ms = Some((min_ms, max_ms.max(min_ms)));
        self
    }

    /// Calls after the first `n` never return
    #[must_use]
    pub fn hang_after(mut self, n: usize) -> Self {
        self.hang_after = Some(n);
        self
    }

    /// First `n` calls never return
    #[must_use]
    pub fn hanging_first(mut self, n: usize) -> Self {
        self.hanging_calls = n;
        self
    }

    /// First `n` calls fail with a transport error
    #[must_use]
    pub fn failing_first(mut self, n: usize) -> Self {
        self.failing_calls = n;
        self
    }

    /// First `n` calls panic
    #[must_use]
    pub fn panicking_first(mut self, n: usize) -> Self {
        self.panicking_calls = n;
        self
    }

    /// Total calls made
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls made with exactly these input bytes
    pub fn calls_for(&self, input: &[u8]) -> usize {
        self.calls_by_input.lock().get(input).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Producer for ScriptedProducer {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn compute(&self, input: &[u8], _task_description: &str) -> Result<ProducerResponse, ProducerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_input.lock().entry(input.to_vec()).or_default() += 1;

        if call < self.hanging_calls || self.hang_after.is_some_and(|n| call >= n) {
            std::future::pending::<()>().await;
        }
        if let Some((min, max)) = self.delay_ms {
            let ms = rand::rng().random_range(min..=max);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if call < self.panicking_calls {
            panic!("scripted producer panic on call {call}");
        }
        if call < self.panicking_calls + self.failing_calls {
            return Err(ProducerError::Transport(format!("scripted failure on call {call}")));
        }
        (self.script)(&parse_input(input))
    }
}

/// Verifier driven by a closure over the parsed input and derivation
pub struct ScriptedVerifier {
    identity: String,
    script: Box<RecomputeFn>,
    calls: AtomicUsize,
    hangs: bool,
}

impl ScriptedVerifier {
    pub fn new<F>(identity: impl Into<String>, script: F) -> Self
    where
        F: Fn(&Value, &Derivation) -> Result<OutputValue, VerifierError> + Send + Sync + 'static,
    {
        Self {
            identity: identity.into(),
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            hangs: false,
        }
    }

    /// Recomputes `input.value`
    pub fn echo_value(identity: impl Into<String>) -> Self {
        Self::new(identity, |input, _| {
            input_value(input)
                .map(OutputValue::Number)
                .ok_or_else(|| VerifierError::Rejected("input has no numeric `value`".into()))
        })
    }

    /// Always fails with a transport error
    pub fn unavailable(identity: impl Into<String>) -> Self {
        Self::new(identity, |_, _| Err(VerifierError::Transport("connection refused".into())))
    }

    /// Never returns
    pub fn hanging(identity: impl Into<String>) -> Self {
        Self {
            hangs: true,
            ..Self::echo_value(identity)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn recompute(&self, input: &[u8], derivation: &Derivation) -> Result<OutputValue, VerifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hangs {
            std::future::pending::<()>().await;
        }
        (self.script)(&parse_input(input), derivation)
    }
}

/// Fixed list of units
#[derive(Debug, Clone, Default)]
pub struct VecWorkSource {
    units: Vec<SourceUnit>,
}

impl VecWorkSource {
    pub fn new(units: Vec<SourceUnit>) -> Self {
        Self { units }
    }

    /// One `{"value": x}` unit per value, ids `unit-000`, `unit-001`, ...
    pub fn from_values(values: &[f64]) -> Self {
        Self::new(value_units(values))
    }
}

#[async_trait]
impl WorkSource for VecWorkSource {
    async fn units(&self) -> Result<Vec<SourceUnit>, PipelineError> {
        Ok(self.units.clone())
    }
}

/// Units whose input is `{"value": x}`
pub fn value_units(values: &[f64]) -> Vec<SourceUnit> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| value_unit(format!("unit-{i:03}"), *v))
        .collect()
}

pub fn value_unit(unit_id: impl Into<String>, value: f64) -> SourceUnit {
    SourceUnit::new(unit_id.into(), value_bytes(value))
}

/// Input bytes of a `{"value": x}` unit
pub fn value_bytes(value: f64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "value": value })).unwrap()
}

/// Config with no retry delays and short call timeouts
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::new()
        .with_retry(RetryPolicy::immediate())
        .with_compute_timeout(Duration::from_secs(5))
        .with_verify_timeout(Duration::from_secs(5))
}

pub fn temp_root() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

/// Number of stored artifacts of each kind
pub async fn count_kinds(store: &ArtifactStore) -> BTreeMap<ArtifactKind, usize> {
    let mut counts = BTreeMap::new();
    for id in store.list_ids().await.unwrap() {
        let kind = store.record(&id).await.unwrap().kind;
        *counts.entry(kind).or_default() += 1;
    }
    counts
}
