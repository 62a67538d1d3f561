//! Veriflow artifact store
//!
//! Immutable, content-addressed storage for every input, intermediate result
//! and verification record of a pipeline run.
//!
//! # Core Concepts
//!
//! - [`ArtifactId`]: 32-byte BLAKE3 hash of the stored bytes, hex in text form
//! - [`ArtifactKind`]: what role a blob plays in the pipeline
//! - [`ArtifactStore`]: sharded blob storage with metadata sidecars
//! - [`ProvenanceLog`]: hash-chained JSONL record of every publication
//! - [`NameIndex`]: symbolic names for operators, never authoritative
//!
//! # Example
//!
//! ```rust,ignore
//! use veriflow_artifact::{ArtifactKind, ArtifactStore};
//!
//! let store = ArtifactStore::open("/var/lib/veriflow").await?;
//! let input = store.put(b"{\"x\":1}", ArtifactKind::RawInput, "ingest", &[]).await?;
//! let result = store.put(b"2", ArtifactKind::ComputedResult, "compute", &[input]).await?;
//! assert_eq!(store.dependencies_of(&result).await?, vec![input]);
//! ```

#![warn(unreachable_pub)]

mod artifact;
mod error;
mod hash;
mod index;
mod provenance;
mod store;

pub mod atomic;

pub use artifact::{ArtifactKind, ArtifactRecord, UnknownKind};
pub use error::StoreError;
pub use hash::{ArtifactId, HashError, ID_HEX_LEN};
pub use index::NameIndex;
pub use provenance::{ProvenanceEntry, ProvenanceLog};
pub use store::{ArtifactStore, PutOutcome};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
