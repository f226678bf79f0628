//! Per-slot working directories.
//!
//! A pool owns one directory per concurrency slot. Acquiring a [`Sandbox`]
//! takes a slot exclusively; dropping it wipes the directory and hands the
//! path back to the free-list before the slot's permit is released, so a
//! directory never has two occupants.

use crate::{Result, WorkerError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

struct PoolInner {
    slots: Arc<Semaphore>,
    free: Mutex<VecDeque<PathBuf>>,
    capacity: usize,
}

#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    /// `count` sandboxes named `<root>/<prefix>-<i>`
    pub fn new(root: impl AsRef<Path>, prefix: &str, count: usize) -> Self {
        let root = root.as_ref();
        Self::from_paths(
            (0..count)
                .map(|i| root.join(format!("{}-{}", prefix, i)))
                .collect(),
        )
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        let capacity = paths.len();
        SandboxPool {
            inner: Arc::new(PoolInner {
                slots: Arc::new(Semaphore::new(capacity)),
                free: Mutex::new(paths.into()),
                capacity,
            }),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<Sandbox> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::PoolClosed)?;

        let path = self
            .inner
            .free
            .lock()
            .pop_front()
            .ok_or(WorkerError::PoolClosed)?;

        Ok(Sandbox {
            path,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Sandboxes on the free-list
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Exclusive use of one sandbox directory
pub struct Sandbox {
    path: PathBuf,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Sandbox {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if needed and empty it
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.path)?;
        clean(&self.path)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = clean(&self.path) {
            warn!("Failed to clean sandbox {}: {}", self.path.display(), e);
        }
        let path = std::mem::take(&mut self.path);
        self.pool.free.lock().push_back(path);
        // _permit is released after this returns
    }
}

/// Remove everything inside `dir`, keeping `dir` itself
fn clean(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}
