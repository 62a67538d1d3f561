//! Independent verification of producer claims
//!
//! The coordinator resolves the original inputs of a `ComputedResult` from
//! its dependency edges, hands them to one or more verifiers together with
//! the derivation (never the claim), and compares what comes back with the
//! claim:
//! - integers, strings and booleans must match exactly
//! - floats must agree within [`Tolerance`]; NaN never agrees
//! - lists and records are compared element by element
//!
//! The verdict is stored as a `VerificationAttestation` artifact depending
//! on the subject. With a panel of several verifiers the claim is accepted
//! only if every member agrees; any disagreement wins over verifier errors.

use crate::config::{PipelineConfig, RetryPolicy, Tolerance};
use crate::error::{VerificationError, VerifierError};
use crate::producer::{Derivation, OutputValue, Verifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use veriflow_artifact::{ArtifactId, ArtifactKind, ArtifactStore};

/// Stage name recorded on attestation artifacts
pub const VERIFY_STAGE: &str = "verify";

/// Verification verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationOutcome {
    /// Recomputation matches the claim
    Agree,
    /// Recomputation contradicts the claim
    Disagree,
    /// No verifier produced a result
    VerifierError,
}

impl fmt::Display for AttestationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Agree => "agree",
            Self::Disagree => "disagree",
            Self::VerifierError => "verifier_error",
        })
    }
}

/// Where and how a recomputation departs from the claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// JSON-path style location, `$` for the root
    pub path: String,
    /// Claimed value at `path`, if present
    pub claimed: Option<OutputValue>,
    /// Recomputed value at `path`, if present
    pub recomputed: Option<OutputValue>,
    /// `claimed - recomputed` for numbers
    pub delta: Option<f64>,
    /// Human-readable reason
    pub reason: String,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Compare a claim with a recomputation
///
/// Returns the first discrepancy in a depth-first walk, or `None` on
/// agreement.
#[must_use]
pub fn compare(claimed: &OutputValue, recomputed: &OutputValue, tolerance: &Tolerance) -> Option<Discrepancy> {
    compare_at("$", claimed, recomputed, tolerance)
}

fn compare_at(path: &str, claimed: &OutputValue, recomputed: &OutputValue, tol: &Tolerance) -> Option<Discrepancy> {
    use OutputValue::{Bool, Integer, List, Null, Record, Text};

    let mismatch = |reason: String, delta: Option<f64>| {
        Some(Discrepancy {
            path: path.to_string(),
            claimed: Some(claimed.clone()),
            recomputed: Some(recomputed.clone()),
            delta,
            reason,
        })
    };

    match (claimed, recomputed) {
        (Integer(a), Integer(b)) if a != b => {
            let delta = claimed.as_f64().zip(recomputed.as_f64()).map(|(x, y)| x - y);
            mismatch(format!("{a} != {b}"), delta)
        }
        (Text(a), Text(b)) if a != b => mismatch(format!("{a:?} != {b:?}"), None),
        (Bool(a), Bool(b)) if a != b => mismatch(format!("{a} != {b}"), None),
        (Integer(_), Integer(_)) | (Text(_), Text(_)) | (Bool(_), Bool(_)) | (Null, Null) => None,
        (List(a), List(b)) => {
            if a.len() != b.len() {
                return mismatch(format!("length {} != {}", a.len(), b.len()), None);
            }
            a.iter()
                .zip(b)
                .enumerate()
                .find_map(|(i, (x, y))| compare_at(&format!("{path}[{i}]"), x, y, tol))
        }
        (Record(a), Record(b)) => {
            if let Some(key) = a.keys().find(|k| !b.contains_key(*k)) {
                return Some(Discrepancy {
                    path: format!("{path}.{key}"),
                    claimed: a.get(key).cloned(),
                    recomputed: None,
                    delta: None,
                    reason: "missing from recomputation".into(),
                });
            }
            if let Some(key) = b.keys().find(|k| !a.contains_key(*k)) {
                return Some(Discrepancy {
                    path: format!("{path}.{key}"),
                    claimed: None,
                    recomputed: b.get(key).cloned(),
                    delta: None,
                    reason: "missing from claim".into(),
                });
            }
            a.iter()
                .find_map(|(k, x)| b.get(k).and_then(|y| compare_at(&format!("{path}.{k}"), x, y, tol)))
        }
        _ => match (claimed.as_f64(), recomputed.as_f64()) {
            (Some(a), Some(b)) => {
                if tol.agrees(a, b) {
                    None
                } else {
                    mismatch(format!("{a} vs {b} outside tolerance"), Some(a - b))
                }
            }
            _ => mismatch(
                format!("type {} != {}", claimed.type_name(), recomputed.type_name()),
                None,
            ),
        },
    }
}

/// One panel member's result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Verifier that produced the final answer (or the last error)
    pub verifier_identity: String,
    /// This member's outcome
    pub outcome: AttestationOutcome,
    /// Recomputed output
    pub recomputed_output: Option<OutputValue>,
    /// First discrepancy, for `Disagree`
    pub discrepancy: Option<Discrepancy>,
    /// Last error, for `VerifierError`
    pub error: Option<String>,
    /// Calls made
    pub attempts: u32,
}

/// Stored verification record
///
/// Self-contained: carries the claim and derivation so a disagreement can
/// be diagnosed without re-running anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// `ComputedResult` under verification
    pub subject_artifact_id: ArtifactId,
    /// Verifier behind the deciding verdict
    pub verifier_identity: String,
    /// Panel outcome
    pub outcome: AttestationOutcome,
    /// Deciding recomputation
    pub verifier_recomputed_output: Option<OutputValue>,
    /// Producer's claim
    pub claimed_output: OutputValue,
    /// Producer's derivation
    pub derivation: Derivation,
    /// Deciding discrepancy
    pub discrepancy_detail: Option<Discrepancy>,
    /// Every panel member's verdict
    pub verdicts: Vec<Verdict>,
    /// Total verifier calls
    pub attempts: u32,
}

impl AttestationRecord {
    /// Decode a stored attestation
    ///
    /// # Errors
    /// Returns error if `bytes` are not an attestation record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Attestation plus the artifact it was stored as
#[derive(Debug, Clone, PartialEq)]
pub struct Attestation {
    /// Record contents
    pub record: AttestationRecord,
    /// `VerificationAttestation` artifact id
    pub artifact_id: ArtifactId,
}

/// Drives verifiers and stores their verdicts
pub struct VerificationCoordinator {
    store: Arc<ArtifactStore>,
    verifiers: Vec<Arc<dyn Verifier>>,
    tolerance: Tolerance,
    panel_size: usize,
    max_attempts: u32,
    retry: RetryPolicy,
    timeout: Duration,
}

impl fmt::Debug for VerificationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationCoordinator")
            .field("verifiers", &self.verifiers.iter().map(|v| v.identity().to_string()).collect::<Vec<_>>())
            .field("tolerance", &self.tolerance)
            .field("panel_size", &self.panel_size)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl VerificationCoordinator {
    /// Create new coordinator with default settings
    #[must_use]
    pub fn new(store: Arc<ArtifactStore>, verifiers: Vec<Arc<dyn Verifier>>) -> Self {
        Self::from_config(store, verifiers, &PipelineConfig::default())
    }

    /// Create new coordinator from pipeline configuration
    #[must_use]
    pub fn from_config(store: Arc<ArtifactStore>, verifiers: Vec<Arc<dyn Verifier>>, config: &PipelineConfig) -> Self {
        Self {
            store,
            verifiers,
            tolerance: config.tolerance,
            panel_size: config.verification.panel_size.max(1),
            max_attempts: config.verification.max_attempts.max(1),
            retry: config.retry,
            timeout: config.verify_timeout(),
        }
    }

    /// With tolerance
    #[inline]
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// With panel size
    #[inline]
    #[must_use]
    pub fn with_panel_size(mut self, panel_size: usize) -> Self {
        self.panel_size = panel_size.max(1);
        self
    }

    /// With attempts per panel member
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// With retry backoff
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With per-call timeout
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Members actually consulted: one distinct instance each
    fn effective_panel(&self) -> usize {
        self.panel_size.min(self.verifiers.len())
    }

    /// Verify a claim about `subject` and store the attestation
    ///
    /// `VerifierError` and `Disagree` are verdicts, not errors.
    ///
    /// # Errors
    /// - [`VerificationError::NoVerifiers`] with an empty verifier list
    /// - [`VerificationError::InputResolution`] unless the subject has
    ///   exactly one `RawInput` dependency
    /// - [`VerificationError::Store`] if artifacts cannot be read or written
    pub async fn verify(
        &self,
        subject: ArtifactId,
        derivation: &Derivation,
        claimed: &OutputValue,
    ) -> Result<Attestation, VerificationError> {
        if self.verifiers.is_empty() {
            return Err(VerificationError::NoVerifiers);
        }
        let input = self.resolve_input(subject).await?;

        let panel = self.effective_panel();
        let verdicts = futures::future::join_all(
            (0..panel).map(|member| self.consult(subject, member, panel, &input, derivation, claimed)),
        )
        .await;

        let deciding = verdicts
            .iter()
            .find(|v| v.outcome == AttestationOutcome::Disagree)
            .or_else(|| verdicts.iter().find(|v| v.outcome == AttestationOutcome::VerifierError))
            .or_else(|| verdicts.first())
            .cloned()
            .ok_or(VerificationError::NoVerifiers)?;

        let record = AttestationRecord {
            subject_artifact_id: subject,
            verifier_identity: deciding.verifier_identity,
            outcome: deciding.outcome,
            verifier_recomputed_output: deciding.recomputed_output,
            claimed_output: claimed.clone(),
            derivation: derivation.clone(),
            discrepancy_detail: deciding.discrepancy,
            attempts: verdicts.iter().map(|v| v.attempts).sum(),
            verdicts,
        };

        let bytes = serde_json::to_vec(&record)?;
        let artifact_id = self
            .store
            .put(&bytes, ArtifactKind::VerificationAttestation, VERIFY_STAGE, &[subject])
            .await?;

        match record.outcome {
            AttestationOutcome::Agree => {
                tracing::debug!(subject = %subject.short(), attestation = %artifact_id.short(), "claim verified");
            }
            outcome => {
                tracing::warn!(
                    subject = %subject.short(),
                    attestation = %artifact_id.short(),
                    %outcome,
                    detail = record.discrepancy_detail.as_ref().map(ToString::to_string),
                    "claim not verified"
                );
            }
        }

        Ok(Attestation { record, artifact_id })
    }

    async fn resolve_input(&self, subject: ArtifactId) -> Result<Vec<u8>, VerificationError> {
        let mut raw_inputs = Vec::new();
        for dependency in self.store.dependencies_of(&subject).await? {
            if self.store.record(&dependency).await?.kind == ArtifactKind::RawInput {
                raw_inputs.push(dependency);
            }
        }
        match raw_inputs.as_slice() {
            [input] => Ok(self.store.get(input).await?),
            other => Err(VerificationError::InputResolution {
                subject,
                found: other.len(),
            }),
        }
    }

    /// Ask one panel member, rotating instances across retries
    ///
    /// Instance choice depends only on the subject, member and attempt so
    /// that attestations are reproducible.
    async fn consult(
        &self,
        subject: ArtifactId,
        member: usize,
        panel: usize,
        input: &[u8],
        derivation: &Derivation,
        claimed: &OutputValue,
    ) -> Verdict {
        let instances = self.verifiers.len();
        let start = usize::from(subject.as_bytes()[0]) % instances;
        let mut last_failure = (String::new(), String::new());

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay(attempt)).await;
            }
            let index = (start + member + attempt as usize * panel) % instances;
            let verifier = &self.verifiers[index];

            let result = match tokio::time::timeout(self.timeout, verifier.recompute(input, derivation)).await {
                Ok(result) => result,
                Err(_) => Err(VerifierError::Timeout {
                    ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            };

            match result {
                Ok(output) => {
                    let discrepancy = compare(claimed, &output, &self.tolerance);
                    return Verdict {
                        verifier_identity: verifier.identity().to_string(),
                        outcome: if discrepancy.is_some() {
                            AttestationOutcome::Disagree
                        } else {
                            AttestationOutcome::Agree
                        },
                        recomputed_output: Some(output),
                        discrepancy,
                        error: None,
                        attempts: attempt + 1,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        subject = %subject.short(),
                        verifier = verifier.identity(),
                        attempt = attempt + 1,
                        error = %e,
                        "verifier call failed"
                    );
                    last_failure = (verifier.identity().to_string(), e.to_string());
                }
            }
        }

        Verdict {
            verifier_identity: last_failure.0,
            outcome: AttestationOutcome::VerifierError,
            recomputed_output: None,
            discrepancy: None,
            error: Some(last_failure.1),
            attempts: self.max_attempts,
        }
    }
}
