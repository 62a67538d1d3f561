//! Work sources for the ingest stage

use crate::error::PipelineError;
use crate::types::UnitId;
use async_trait::async_trait;
use std::path::PathBuf;

/// One unit of input as delivered by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Unit identifier, unique within the run
    pub unit_id: UnitId,
    /// Raw input bytes
    pub bytes: Vec<u8>,
}

impl SourceUnit {
    /// Create new source unit
    pub fn new(unit_id: impl Into<UnitId>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            unit_id: unit_id.into(),
            bytes: bytes.into(),
        }
    }
}

/// Supplies the work units of a run
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// All units, in processing order
    ///
    /// # Errors
    /// [`PipelineError::Source`] if the units cannot be listed
    async fn units(&self) -> Result<Vec<SourceUnit>, PipelineError>;
}

/// Every regular file in a directory, one unit per file
///
/// The unit id is the file name; units are ordered by name.
#[derive(Debug, Clone)]
pub struct DirWorkSource {
    dir: PathBuf,
}

impl DirWorkSource {
    /// Create new directory source
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl WorkSource for DirWorkSource {
    async fn units(&self) -> Result<Vec<SourceUnit>, PipelineError> {
        let source_err = |e: std::io::Error| PipelineError::Source(format!("{}: {e}", self.dir.display()));
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(source_err)?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(source_err)? {
            if entry.file_type().await.map_err(source_err)?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut units = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping non-UTF-8 file name");
                continue;
            };
            let bytes = tokio::fs::read(&path).await.map_err(source_err)?;
            units.push(SourceUnit::new(name, bytes));
        }
        Ok(units)
    }
}
