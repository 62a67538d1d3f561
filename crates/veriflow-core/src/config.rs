//! Pipeline configuration
//!
//! [`PipelineConfig`] carries every tunable of a run. It is plain data:
//! callers construct it in code (with the `with_*` builders) or parse it from
//! TOML with [`PipelineConfig::from_toml_str`]. Locating config files is left
//! to the embedding application.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum simultaneous units in flight
    pub max_concurrency: usize,
    /// Dispatches per unit before it is marked `Failed`
    pub max_attempts: u32,
    /// Producer call timeout
    pub compute_timeout_ms: u64,
    /// Verifier call timeout
    pub verify_timeout_ms: u64,
    /// Consolidator call timeout
    pub consolidate_timeout_ms: u64,
    /// Backoff between attempts
    pub retry: RetryPolicy,
    /// Per-call payload budget
    pub budget: BudgetConfig,
    /// Numeric comparison tolerance
    pub tolerance: Tolerance,
    /// Verifier panel settings
    pub verification: VerificationConfig,
    /// Checkpoints kept per run
    pub checkpoint_retain: usize,
    /// Instructions handed to the producer with every input
    pub task_description: String,
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML, filling unspecified fields with defaults
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on bad TOML, [`ConfigError::Invalid`] on bad values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value is in range
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.compute_timeout_ms == 0 || self.verify_timeout_ms == 0 || self.consolidate_timeout_ms == 0 {
            return Err(ConfigError::invalid("timeouts", "must be non-zero"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::invalid("retry.max_delay_ms", "must be >= base_delay_ms"));
        }
        self.budget.validate()?;
        self.tolerance.validate()?;
        if self.verification.panel_size == 0 {
            return Err(ConfigError::invalid("verification.panel_size", "must be at least 1"));
        }
        if self.verification.max_attempts == 0 {
            return Err(ConfigError::invalid("verification.max_attempts", "must be at least 1"));
        }
        if self.checkpoint_retain < 2 {
            return Err(ConfigError::invalid("checkpoint_retain", "must be at least 2"));
        }
        Ok(())
    }

    /// With max concurrency
    #[inline]
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// With max attempts per unit
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// With producer timeout
    #[inline]
    #[must_use]
    pub fn with_compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout_ms = duration_ms(timeout);
        self
    }

    /// With verifier timeout
    #[inline]
    #[must_use]
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout_ms = duration_ms(timeout);
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With budget
    #[inline]
    #[must_use]
    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    /// With tolerance
    #[inline]
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// With verifier panel size
    #[inline]
    #[must_use]
    pub fn with_panel_size(mut self, panel_size: usize) -> Self {
        self.verification.panel_size = panel_size;
        self
    }

    /// With task description
    #[inline]
    #[must_use]
    pub fn with_task_description(mut self, task: impl Into<String>) -> Self {
        self.task_description = task.into();
        self
    }

    /// Producer timeout
    #[inline]
    #[must_use]
    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }

    /// Verifier timeout
    #[inline]
    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    /// Consolidator timeout
    #[inline]
    #[must_use]
    pub fn consolidate_timeout(&self) -> Duration {
        Duration::from_millis(self.consolidate_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_attempts: 3,
            compute_timeout_ms: 120_000,
            verify_timeout_ms: 60_000,
            consolidate_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
            budget: BudgetConfig::default(),
            tolerance: Tolerance::default(),
            verification: VerificationConfig::default(),
            checkpoint_retain: 4,
            task_description: String::new(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Policy with no delay, for tests
    #[inline]
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based); zero for `retry == 0`
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Per-call payload budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Hard per-call budget in bytes
    pub budget_bytes: u64,
    /// Fraction of the budget held back, in `[0, 1)`
    pub safety_margin: f64,
    /// Upper bound on units per batch
    pub max_batch_size: usize,
    /// Transport expansion factor (4/3 for base64)
    pub encoding_overhead: f64,
    /// Fixed framing cost per unit
    pub per_unit_envelope_bytes: u64,
}

impl BudgetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.budget_bytes == 0 {
            return Err(ConfigError::invalid("budget.budget_bytes", "must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.safety_margin) {
            return Err(ConfigError::invalid("budget.safety_margin", "must be in [0, 1)"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("budget.max_batch_size", "must be at least 1"));
        }
        if !self.encoding_overhead.is_finite() || self.encoding_overhead < 1.0 {
            return Err(ConfigError::invalid("budget.encoding_overhead", "must be finite and >= 1"));
        }
        Ok(())
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 20 * 1024 * 1024,
            safety_margin: 0.1,
            max_batch_size: 64,
            encoding_overhead: 4.0 / 3.0,
            per_unit_envelope_bytes: 256,
        }
    }
}

/// Float comparison tolerance: `|a - b| <= absolute + relative * max(|a|, |b|)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    /// Absolute slack
    pub absolute: f64,
    /// Slack relative to the larger magnitude
    pub relative: f64,
}

impl Tolerance {
    /// Create new tolerance
    #[inline]
    #[must_use]
    pub const fn new(absolute: f64, relative: f64) -> Self {
        Self { absolute, relative }
    }

    /// Exact comparison
    #[inline]
    #[must_use]
    pub const fn exact() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Whether two floats agree. NaN never agrees with anything.
    #[must_use]
    pub fn agrees(&self, a: f64, b: f64) -> bool {
        if a.is_nan() || b.is_nan() {
            return false;
        }
        if a == b {
            return true;
        }
        (a - b).abs() <= self.absolute + self.relative * a.abs().max(b.abs())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        if !ok(self.absolute) || !ok(self.relative) {
            return Err(ConfigError::invalid("tolerance", "must be finite and non-negative"));
        }
        Ok(())
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::new(0.01, 0.0)
    }
}

/// Verifier panel settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Independent verifiers consulted per subject
    pub panel_size: usize,
    /// Calls per panel member before reporting `VerifierError`
    pub max_attempts: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            panel_size: 1,
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.checkpoint_retain, 4);
        assert!((config.budget.encoding_overhead - 4.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn toml_overrides_and_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            max_concurrency = 8
            task_description = "compute ratios"

            [budget]
            budget_bytes = 1000
            safety_margin = 0.5

            [tolerance]
            absolute = 0.001
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.budget.budget_bytes, 1000);
        assert_eq!(config.budget.max_batch_size, 64);
        assert!((config.tolerance.absolute - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.verification.panel_size, 1);
    }

    #[test]
    fn rejects_bad_margin() {
        let err = PipelineConfig::from_toml_str("[budget]\nsafety_margin = 1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "budget.safety_margin", .. }));
    }

    #[test]
    fn rejects_small_retention() {
        let config = PipelineConfig {
            checkpoint_retain: 1,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(retry.delay(0), Duration::ZERO);
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(350));
        assert_eq!(retry.delay(64), Duration::from_millis(350));
    }

    #[test]
    fn tolerance_rules() {
        let tol = Tolerance::new(0.01, 0.0);
        assert!(tol.agrees(0.95, 0.95));
        assert!(tol.agrees(1.0, 1.005));
        assert!(!tol.agrees(0.0, 0.02));
        assert!(!tol.agrees(f64::NAN, f64::NAN));

        let rel = Tolerance::new(0.0, 0.01);
        assert!(rel.agrees(1000.0, 1009.0));
        assert!(!rel.agrees(1000.0, 1011.0));
    }
}
