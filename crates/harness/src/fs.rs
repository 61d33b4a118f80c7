//! File system utils.

use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use fs2::FileExt;
use notify::{Event, RecursiveMode, Watcher};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;

/// Name of the lock file guarding writes in a state directory.
const LOCK_FILENAME: &str = ".lock";

pub struct FsHandler;

/// Exclusive lock of a directory, see [`FsHandler::lock_dir`].
#[derive(Debug)]
pub struct DirLock {
    file: File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to release directory lock");
        }
    }
}

impl FsHandler {
    /// Create a directory (and its parents) if it doesn't exist.
    pub fn create_dir(path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        tracing::trace!(path = %path.display(), "Directory ready");
        Ok(())
    }

    /// Read a JSON document, `None` if the file does not exist.
    pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Take the exclusive lock of `dir`, creating the directory if needed. The lock is released
    /// when the guard is dropped.
    pub fn lock_dir(dir: &Path) -> anyhow::Result<DirLock> {
        Self::create_dir(dir)?;
        let file = File::create(dir.join(LOCK_FILENAME)).context("Failed to open lock file")?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", dir.display()))?;
        Ok(DirLock { file })
    }

    /// Write a JSON document atomically while holding the directory lock.
    pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
        let dir = path
            .parent()
            .context("File path must have a parent directory")?;
        let _lock = Self::lock_dir(dir)?;
        Self::replace_json(path, value)
    }

    /// Write a JSON document atomically. The caller must hold the lock of its directory.
    ///
    /// The document is written to a temporary sibling and renamed over the target, so readers
    /// never observe a partial file.
    pub fn replace_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move {} into place", path.display()))
    }

    /// Wait for a file to be created with a timeout.
    ///
    /// This function uses file system watching (via notify crate) to efficiently
    /// wait for a file to appear.
    pub async fn wait_for_file(path: &PathBuf, timeout: Duration) -> anyhow::Result<()> {
        // If file already exists, return immediately
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!("File already exists: {}", path.display());
            return Ok(());
        }

        tracing::debug!("Waiting for file: {}", path.display());

        // Watch the parent directory
        let parent = path
            .parent()
            .context("File path must have a parent directory")?;

        let (tx, mut rx) = watch::channel(None);

        let path_watcher = path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if (event.kind.is_create() || event.kind.is_modify()) && event.paths.contains(&path_watcher) => {
                    tracing::debug!(event = ?event, path = ?path_watcher.display(), "File detected");

                    if let Err(e) = tx.send(Some(event.clone())) {
                        tracing::error!(err = ?e, event = ?event, path = ?path_watcher.display(), "Failed to send event to channel");
                    }
                }
                Ok(event) => {
                    tracing::trace!(event = ?event, path = ?path_watcher.display(), "Ignored event emitted by file watcher");
                }
                Err(e) => {
                    tracing::error!(err = ?e, path = ?path_watcher.display(), "Failed to watch directory");
                }
            })
            .context("Failed to create file watcher")?;

        watcher
            .watch(parent, RecursiveMode::NonRecursive)
            .context("Failed to watch directory")?;

        // The file may have appeared between the first check and the watch registration.
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        tokio::time::timeout(timeout, async {
            rx.changed()
                .await
                .map_err(|e| anyhow::anyhow!("File watcher channel closed: {}", e))
        })
        .await
        .context(format!("Timeout waiting for file: {}", path.display()))??;

        // The watcher may fire on creation before the writer has finished.
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(())
    }
}
