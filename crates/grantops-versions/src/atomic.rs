//! Durable file writes shared by the version and state stores.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use grantops_types::{GrantOpsError, Result};
use tokio::io::AsyncWriteExt;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hidden sibling name, unique per process and call, so concurrent writers
/// never share a temp file.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}

/// Write and sync `bytes` to a fresh temp file next to `path`.
async fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let tmp = temp_path_for(path);
    let written: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    match written {
        Ok(()) => Ok(tmp),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(GrantOpsError::storage(&tmp, e))
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GrantOpsError::storage(parent, e))?;
    }
    Ok(())
}

/// Replace `path` with `bytes` so readers see either the old or the new file.
///
/// The data goes to a sibling temp file, is synced, then renamed over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path).await?;
    let tmp = write_temp(path, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(GrantOpsError::storage(path, e));
    }
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "Atomic write committed");
    Ok(())
}

/// Create `path` with `bytes`, failing if it already exists.
///
/// The complete file is hard-linked into place, so `path` either does not
/// exist or holds all of `bytes`; an existing file is never replaced. The
/// error for an occupied path is a storage error whose source has kind
/// [`std::io::ErrorKind::AlreadyExists`].
pub async fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path).await?;
    let tmp = write_temp(path, bytes).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    if let Err(e) = tokio::fs::remove_file(&tmp).await {
        tracing::debug!(path = %tmp.display(), error = %e, "Temp file left behind");
    }
    linked.map_err(|e| GrantOpsError::storage(path, e))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "File published");
    Ok(())
}

/// Temp files left by writes that crashed before publishing.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}
