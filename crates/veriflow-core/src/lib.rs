//! Veriflow Core - resumable, verified pipeline runs
//!
//! Turns an unreliable, non-deterministic computation service into an
//! auditable pipeline:
//! - Every input and output is stored content-addressed with its lineage
//! - Progress is checkpointed after every unit, so a crash loses at most one
//!   unit of work
//! - Units are batched under a per-call payload budget
//! - Every producer claim is re-derived by an independent verifier before
//!   anything downstream may consume it
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use veriflow_core::prelude::*;
//!
//! # async fn example(producer: Arc<dyn Producer>, verifier: Arc<dyn Verifier>) -> Result<(), PipelineError> {
//! let orchestrator = PipelineOrchestrator::builder("/var/lib/veriflow")
//!     .config(PipelineConfig::new().with_max_concurrency(8))
//!     .producer(producer)
//!     .verifier(verifier)
//!     .source(Arc::new(DirWorkSource::new("./inputs")))
//!     .build()
//!     .await?;
//!
//! match orchestrator.run(RunId::new(), false).await? {
//!     RunResult::Success(summary) => println!("final dataset {}", summary.final_dataset),
//!     RunResult::FailedAtUnit(failure) => eprintln!("unit {} failed: {}", failure.unit_id, failure.message),
//!     other => eprintln!("run stopped: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod audit;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod producer;
pub mod source;
pub mod state;
pub mod state_machine;
pub mod telemetry;
pub mod types;
pub mod verify;

pub use audit::{AuditEntry, AuditLog, OperationKind};
pub use config::{BudgetConfig, PipelineConfig, RetryPolicy, Tolerance, VerificationConfig};
pub use consolidate::{AttestedResult, Consolidator, JsonMergeConsolidator, MergedBatch};
pub use error::{
    ConfigError, ConsolidationError, ErrorCategory, PipelineError, PlanError, ProducerError, StateError,
    TransitionError, VerificationError, VerifierError,
};
pub use orchestrator::{final_dataset_name, ComputedRecord, PipelineOrchestrator, PipelineOrchestratorBuilder};
pub use planner::BatchPlanner;
pub use pool::{PoolStats, WorkerFault, WorkerPool};
pub use producer::{Claim, Derivation, OutputValue, Producer, ProducerResponse, Verifier};
pub use source::{DirWorkSource, SourceUnit, WorkSource};
pub use state::{CheckpointEnvelope, CheckpointInfo, StateRecorder};
pub use telemetry::{init_tracing, LogFormat};
pub use types::{
    BatchFailure, BatchId, BatchPlan, Phase, PipelineState, RunId, RunResult, RunSummary, Stage, UnitError,
    UnitFailure, UnitId, UnitStatus, WorkUnit,
};
pub use verify::{Attestation, AttestationOutcome, AttestationRecord, Discrepancy, VerificationCoordinator};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for building and running pipelines
    pub use crate::{
        DirWorkSource, OutputValue, PipelineConfig, PipelineError, PipelineOrchestrator, Producer,
        ProducerResponse, RunId, RunResult, SourceUnit, Verifier, WorkSource,
    };
    pub use crate::producer::Derivation;
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
