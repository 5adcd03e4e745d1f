use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::LOCK_RETRY_INTERVAL_MS;
use crate::error::{AgentError, Result};

/// Exclusive advisory lock serialising mutating operations on one app.
/// Released when dropped.
#[derive(Debug)]
pub struct AppLock {
    file: File,
    path: PathBuf,
}

impl AppLock {
    /// Acquire `locks_root/{app}.lock`, retrying until `wait` elapses.
    pub async fn acquire(locks_root: &Path, app: &str, wait: Duration) -> Result<Self> {
        std::fs::create_dir_all(locks_root)?;
        let path = locks_root.join(format!("{}.lock", app));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired lock {:?}", path);
                    return Ok(Self { file, path });
                }
                Err(e) if Instant::now() >= deadline => {
                    warn!("Giving up on lock {:?}: {}", path, e);
                    return Err(AgentError::AppLocked(app.to_string()));
                }
                Err(_) => sleep(Duration::from_millis(LOCK_RETRY_INTERVAL_MS)).await,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn second_holder_times_out() {
        let dir = TempDir::new().unwrap();
        let _held = AppLock::acquire(dir.path(), "blog", Duration::from_secs(1)).await.unwrap();

        let err = AppLock::acquire(dir.path(), "blog", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AppLocked(name) if name == "blog"));
    }

    #[tokio::test]
    async fn released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let lock = AppLock::acquire(dir.path(), "blog", Duration::from_secs(1)).await.unwrap();
            assert!(lock.path().ends_with("blog.lock"));
        }
        AppLock::acquire(dir.path(), "blog", Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn locks_are_per_app() {
        let dir = TempDir::new().unwrap();
        let _a = AppLock::acquire(dir.path(), "a", Duration::from_secs(1)).await.unwrap();
        AppLock::acquire(dir.path(), "b", Duration::from_millis(100)).await.unwrap();
    }
}
