//! Advisory file locks shared between processes working on one project.
//!
//! Backed by `fs2` (flock / LockFileEx). The lock belongs to the open file,
//! so it also excludes other handles in the same process, and the OS drops it
//! when the holder exits, crashed or not. Lock files are never deleted.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use grantops_types::{GrantOpsError, Result};

/// Exclusive lock held until the guard is dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl FileLock {
    /// Wait for the exclusive lock on `path`, creating the file if needed.
    pub async fn exclusive(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = open_lock_file(&path).map_err(|e| GrantOpsError::storage(&path, e))?;
            FileExt::lock_exclusive(&file).map_err(|e| GrantOpsError::storage(&path, e))?;
            tracing::trace!(lock = %path.display(), "File lock acquired");
            Ok(FileLock { file, path })
        })
        .await
        .map_err(|e| GrantOpsError::Other(format!("lock task failed: {e}")))?
    }

    /// Take the lock only if nobody holds it.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path).map_err(|e| GrantOpsError::storage(path, e))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(GrantOpsError::storage(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well.
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(lock = %self.path.display(), error = %e, "File unlock failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn second_handle_is_excluded_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("narrative.lock");

        let held = FileLock::exclusive(&path).await.unwrap();
        assert!(path.exists());
        assert!(FileLock::try_exclusive(&path).unwrap().is_none());

        drop(held);
        assert!(FileLock::try_exclusive(&path).unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn holders_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("slot.lock"));
        let inside = Arc::new(AtomicUsize::new(0));
        let worst = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let (path, inside, worst) = (path.clone(), inside.clone(), worst.clone());
            tasks.spawn(async move {
                let _guard = FileLock::exclusive(&path).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                worst.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        assert_eq!(worst.load(Ordering::SeqCst), 1);
    }
}
