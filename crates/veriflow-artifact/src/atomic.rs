//! Atomic file publication
//!
//! Every durable write in the workspace goes through [`publish`]: the bytes
//! land in a uniquely named temporary file on the same filesystem, are
//! flushed to disk, and are then renamed over the destination. Readers see
//! either the previous file or the complete new one, never a prefix.

use crate::error::StoreError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Suffix carried by in-progress temporary files
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Write `bytes` to `dest` atomically, staging in `tmp_dir`
///
/// `tmp_dir` must be on the same filesystem as `dest` for the rename to be
/// atomic. The staged file is removed on failure; the destination is left
/// untouched.
///
/// # Errors
/// Returns [`StoreError::Io`] if staging, syncing or renaming fails
pub async fn publish(tmp_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    tokio::fs::create_dir_all(tmp_dir)
        .await
        .map_err(|e| StoreError::io(tmp_dir, e))?;

    let staged = staging_path(tmp_dir);
    if let Err(err) = write_synced(&staged, bytes).await {
        discard(&staged).await;
        return Err(err);
    }

    if let Err(e) = tokio::fs::rename(&staged, dest).await {
        discard(&staged).await;
        return Err(StoreError::io(dest, e));
    }

    if let Some(parent) = dest.parent() {
        sync_dir(parent).await;
    }
    Ok(())
}

/// Whether a directory entry is a leftover staging file
#[inline]
#[must_use]
pub fn is_partial(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX)
}

fn staging_path(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join(format!("{}{PARTIAL_SUFFIX}", uuid::Uuid::new_v4()))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "could not remove staged file");
    }
}

/// Persist the rename itself. Not every platform can open a directory for
/// syncing, so failures are only logged.
async fn sync_dir(dir: &Path) {
    match tokio::fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                tracing::trace!(dir = %dir.display(), error = %e, "directory sync unsupported");
            }
        }
        Err(e) => tracing::trace!(dir = %dir.display(), error = %e, "directory open unsupported"),
    }
}
