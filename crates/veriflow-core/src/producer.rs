//! Producer and verifier contracts
//!
//! The producer is an untrusted, non-deterministic computation service. It
//! returns a claimed output together with the derivation it followed. The
//! claim is never trusted on its own: a [`Verifier`] re-derives the output
//! from the same inputs and derivation, without seeing the claim.
//!
//! Producer responses use a tagged schema, validated by
//! [`ProducerResponse::from_json`]:
//!
//! ```json
//! {"status": "computed", "claimed_output": 0.95,
//!  "derivation": {"steps": ["sum revenue", "divide by cost"], "formula": "r / c"}}
//! {"status": "declined", "reason": "input is not a balance sheet"}
//! ```

use crate::error::{ProducerError, VerifierError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured output value
///
/// Records use ordered maps so the JSON encoding, and therefore the content
/// hash of any artifact embedding a value, is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    /// Absent value (also what a non-finite float encodes to)
    Null,
    /// Boolean
    Bool(bool),
    /// Integer, compared exactly
    Integer(i64),
    /// Float, compared with tolerance
    Number(f64),
    /// String, compared exactly
    Text(String),
    /// Ordered list, compared elementwise
    List(Vec<OutputValue>),
    /// Named fields, compared per key
    Record(BTreeMap<String, OutputValue>),
}

impl OutputValue {
    /// Short type name for discrepancy reports
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Record(_) => "record",
        }
    }

    /// Numeric view of integers and floats
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Path of the first non-finite number, if any
    #[must_use]
    pub fn first_non_finite(&self) -> Option<String> {
        fn walk(value: &OutputValue, path: &str) -> Option<String> {
            match value {
                OutputValue::Number(n) if !n.is_finite() => Some(path.to_string()),
                OutputValue::List(items) => items
                    .iter()
                    .enumerate()
                    .find_map(|(i, v)| walk(v, &format!("{path}[{i}]"))),
                OutputValue::Record(fields) => fields
                    .iter()
                    .find_map(|(k, v)| walk(v, &format!("{path}.{k}"))),
                _ => None,
            }
        }
        walk(self, "$")
    }
}

impl From<f64> for OutputValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for OutputValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for OutputValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<bool> for OutputValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// How a producer arrived at its claim
///
/// Everything a verifier needs besides the inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    /// Ordered calculation steps
    #[serde(default)]
    pub steps: Vec<String>,
    /// Closed-form expression, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl Derivation {
    /// Create new derivation from steps
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            formula: None,
        }
    }

    /// With formula
    #[inline]
    #[must_use]
    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    /// Whether the derivation says nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.trim().is_empty())
            && self.formula.as_deref().map_or(true, |f| f.trim().is_empty())
    }
}

/// A validated claim from the producer
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    /// Claimed output
    pub claimed_output: OutputValue,
    /// Derivation followed
    pub derivation: Derivation,
}

/// Producer response, tagged by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProducerResponse {
    /// Computation performed
    Computed {
        /// Claimed output
        claimed_output: OutputValue,
        /// Derivation followed
        derivation: Derivation,
    },
    /// Producer refused the task
    Declined {
        /// Producer's explanation
        reason: String,
    },
}

impl ProducerResponse {
    /// Computed response
    #[must_use]
    pub fn computed(claimed_output: impl Into<OutputValue>, derivation: Derivation) -> Self {
        Self::Computed {
            claimed_output: claimed_output.into(),
            derivation,
        }
    }

    /// Parse and validate a raw response body
    ///
    /// # Errors
    /// [`ProducerError::Malformed`] if the body does not match the schema or
    /// fails [`into_claim`](Self::into_claim) validation
    pub fn from_json(body: &str) -> Result<Self, ProducerError> {
        let response: Self =
            serde_json::from_str(body).map_err(|e| ProducerError::Malformed(e.to_string()))?;
        if let Self::Computed { .. } = &response {
            response.clone().into_claim()?;
        }
        Ok(response)
    }

    /// Validate and extract the claim
    ///
    /// # Errors
    /// - [`ProducerError::Declined`] for a declined response
    /// - [`ProducerError::Malformed`] for an empty derivation or a
    ///   non-finite number in the output
    pub fn into_claim(self) -> Result<Claim, ProducerError> {
        match self {
            Self::Declined { reason } => Err(ProducerError::Declined(reason)),
            Self::Computed {
                claimed_output,
                derivation,
            } => {
                if derivation.is_empty() {
                    return Err(ProducerError::Malformed("derivation is empty".into()));
                }
                if let Some(path) = claimed_output.first_non_finite() {
                    return Err(ProducerError::Malformed(format!("non-finite number at {path}")));
                }
                Ok(Claim {
                    claimed_output,
                    derivation,
                })
            }
        }
    }
}

/// Untrusted computation service
#[async_trait]
pub trait Producer: Send + Sync {
    /// Name used in logs and audit entries
    fn identity(&self) -> &str;

    /// Compute over one input
    ///
    /// # Errors
    /// Any [`ProducerError`]; all are retried by the orchestrator
    async fn compute(&self, input: &[u8], task_description: &str) -> Result<ProducerResponse, ProducerError>;
}

/// Independent recomputation service
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Name recorded in attestations
    fn identity(&self) -> &str;

    /// Recompute from the input and derivation alone
    ///
    /// # Errors
    /// Any [`VerifierError`]; retried on another verifier instance
    async fn recompute(&self, input: &[u8], derivation: &Derivation) -> Result<OutputValue, VerifierError>;
}
