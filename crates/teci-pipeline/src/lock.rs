//! Named mutual-exclusion locks held around the execution stage.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use teci_core::{Result, TeciError};

/// A held lock. Released when dropped.
pub struct LockGuard {
    name: String,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    fn new(name: &str, held: impl Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            _held: Box::new(held),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Wait until `name` is free and take it.
    async fn acquire(&self, name: &str) -> Result<LockGuard>;

    /// Take `name` if it is free right now.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>>;
}

/// Locks shared by runs inside one process.
#[derive(Debug, Default)]
pub struct LocalLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Holders and waiters keep a clone; anything else is unused.
        locks.retain(|key, slot| key == name || Arc::strong_count(slot) > 1);
        locks.entry(name.to_string()).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

#[async_trait]
impl LockManager for LocalLocks {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let guard = self.slot(name).lock_owned().await;
        Ok(LockGuard::new(name, guard))
    }

    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        Ok(self
            .slot(name)
            .try_lock_owned()
            .ok()
            .map(|guard| LockGuard::new(name, guard)))
    }
}

/// Locks backed by `<dir>/<name>.lock`, shared across processes.
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
}

impl FileLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.lock"))
    }

    fn open(&self, name: &str) -> Result<File> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(name);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TeciError::Lock {
                name: name.to_string(),
                reason: format!("cannot open lock file {}: {}", path.display(), e),
            })
    }
}

#[async_trait]
impl LockManager for FileLocks {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let file = self.open(name)?;
        let owned = name.to_string();
        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            file.lock_exclusive().map_err(|e| TeciError::Lock {
                name: owned,
                reason: e.to_string(),
            })?;
            Ok(file)
        })
        .await
        .map_err(|e| TeciError::Lock {
            name: name.to_string(),
            reason: e.to_string(),
        })??;
        Ok(LockGuard::new(name, file))
    }

    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        let file = self.open(name)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard::new(name, file))),
            Err(_) => Ok(None),
        }
    }
}
