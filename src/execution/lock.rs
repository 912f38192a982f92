//! Advisory path-subtree locks.
//!
//! A plan (or an undo/redo) holds a lock on every path it touches for its
//! whole run. Two lock sets conflict when any path in one equals, contains,
//! or is contained by a path in the other. These locks only coordinate the
//! core's own work; other processes are not affected.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// What to do when a lock set conflicts with one already held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum LockPolicy {
    /// Wait for the conflicting holder, up to `timeout_ms`
    Queue { timeout_ms: u64 },
    /// Fail immediately
    Reject,
}

#[derive(Debug)]
struct Held {
    id: u64,
    owner: String,
    paths: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct PathLockTable {
    held: Mutex<Vec<Held>>,
    released: Notify,
    next_id: AtomicU64,
}

/// Releases its paths on drop
#[derive(Debug)]
pub struct PathLockGuard {
    table: Arc<PathLockTable>,
    id: u64,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let mut held = self.table.lock_held();
        held.retain(|h| h.id != self.id);
        drop(held);
        self.table.released.notify_waiters();
    }
}

fn overlaps(a: &[PathBuf], b: &[PathBuf]) -> bool {
    a.iter()
        .any(|x| b.iter().any(|y| x.starts_with(y) || y.starts_with(x)))
}

impl PathLockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock_held(&self) -> MutexGuard<'_, Vec<Held>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock set if nothing conflicts, otherwise name the holder
    pub fn try_acquire(
        self: &Arc<Self>,
        owner: &str,
        paths: &[PathBuf],
    ) -> std::result::Result<PathLockGuard, String> {
        let mut held = self.lock_held();
        if let Some(conflict) = held.iter().find(|h| overlaps(&h.paths, paths)) {
            return Err(conflict.owner.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        held.push(Held {
            id,
            owner: owner.to_string(),
            paths: paths.to_vec(),
        });
        Ok(PathLockGuard {
            table: Arc::clone(self),
            id,
        })
    }

    pub async fn acquire(
        self: &Arc<Self>,
        owner: &str,
        paths: &[PathBuf],
        policy: LockPolicy,
    ) -> Result<PathLockGuard> {
        let deadline = match policy {
            LockPolicy::Queue { timeout_ms } => Some(Instant::now() + Duration::from_millis(timeout_ms)),
            LockPolicy::Reject => None,
        };

        loop {
            // Register interest before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder = match self.try_acquire(owner, paths) {
                Ok(guard) => return Ok(guard),
                Err(holder) => holder,
            };

            let Some(deadline) = deadline else {
                return Err(Error::Locked(format!("{} conflicts with {}", owner, holder)));
            };

            tracing::debug!(owner, holder = %holder, "waiting for path lock");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Locked(format!(
                    "{} timed out waiting for {}",
                    owner, holder
                )));
            }
        }
    }

    pub fn held_count(&self) -> usize {
        self.lock_held().len()
    }
}
