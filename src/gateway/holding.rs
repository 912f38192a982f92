//! Holding area for deleted and overwritten items
//!
//! Instead of the platform trash (whose restore support varies), deletes move
//! items into a retained directory outside the permitted root:
//!
//! ```text
//! <holding>/<entry id>/payload     the item itself
//! <holding>/<entry id>/entry.json  where it came from and when
//! ```
//!
//! Entries are purged after `retention_days`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::io::atomic_write;
use super::{FilesystemGateway, GatewayError, GatewayErrorKind, GatewayResult};
use crate::models::file::EntryKind;
use crate::models::plan::PlanId;

const PAYLOAD: &str = "payload";
const MANIFEST: &str = "entry.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingEntry {
    pub id: String,
    pub original_path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub held_at: DateTime<Utc>,
    pub plan_id: Option<PlanId>,
}

#[derive(Debug, Clone)]
pub struct HoldingArea {
    dir: PathBuf,
    retention: Duration,
}

impl HoldingArea {
    pub fn new(dir: PathBuf, retention_days: u32) -> Self {
        Self {
            dir,
            retention: Duration::days(i64::from(retention_days)),
        }
    }

    /// Create the holding directory if needed
    pub fn open(&self) -> GatewayResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| GatewayError::from_io(e, &self.dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn new_entry_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn payload_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join(PAYLOAD)
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join(MANIFEST)
    }

    pub fn contains(&self, id: &str) -> bool {
        fs::symlink_metadata(self.payload_path(id)).is_ok()
    }

    /// Move `path` into the holding area under `id`
    pub fn stash(
        &self,
        gateway: &dyn FilesystemGateway,
        path: &Path,
        id: &str,
        plan_id: Option<PlanId>,
    ) -> GatewayResult<HoldingEntry> {
        let stat = gateway
            .stat(path)?
            .ok_or_else(|| GatewayError::not_found(path))?;

        let entry_dir = self.dir.join(id);
        if entry_dir.exists() {
            return Err(GatewayError::already_exists(&entry_dir));
        }
        fs::create_dir_all(&entry_dir).map_err(|e| GatewayError::from_io(e, &entry_dir))?;

        let entry = HoldingEntry {
            id: id.to_string(),
            original_path: path.to_path_buf(),
            kind: stat.kind,
            size: stat.size,
            held_at: Utc::now(),
            plan_id,
        };

        let result = serde_json::to_vec_pretty(&entry)
            .map_err(|e| GatewayError::new(GatewayErrorKind::Io, &entry_dir, e.to_string()))
            .and_then(|json| atomic_write(&self.manifest_path(id), &json))
            .and_then(|()| gateway.move_path(path, &self.payload_path(id)));

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&entry_dir);
            return Err(e);
        }

        tracing::debug!(path = %path.display(), entry = id, "Moved to holding area");
        Ok(entry)
    }

    /// Move the item held under `id` back to `to` and drop the entry
    pub fn restore(&self, gateway: &dyn FilesystemGateway, id: &str, to: &Path) -> GatewayResult<()> {
        let payload = self.payload_path(id);
        if !self.contains(id) {
            return Err(GatewayError::new(
                GatewayErrorKind::PathNotFound,
                &payload,
                format!("holding entry {} is gone", id),
            ));
        }

        gateway.move_path(&payload, to)?;

        let entry_dir = self.dir.join(id);
        if let Err(e) = fs::remove_dir_all(&entry_dir) {
            tracing::warn!(entry = id, error = %e, "Failed to remove empty holding entry");
        }
        tracing::debug!(path = %to.display(), entry = id, "Restored from holding area");
        Ok(())
    }

    pub fn entry(&self, id: &str) -> GatewayResult<HoldingEntry> {
        let path = self.manifest_path(id);
        let data = fs::read(&path).map_err(|e| GatewayError::from_io(e, &path))?;
        serde_json::from_slice(&data)
            .map_err(|e| GatewayError::new(GatewayErrorKind::Io, &path, e.to_string()))
    }

    /// All entries with a readable manifest, oldest first
    pub fn entries(&self) -> GatewayResult<Vec<HoldingEntry>> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GatewayError::from_io(e, &self.dir)),
        };

        let mut entries = Vec::new();
        for item in read.flatten() {
            let id = item.file_name().to_string_lossy().to_string();
            match self.entry(&id) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(entry = %id, error = %e, "Skipping unreadable holding entry"),
            }
        }
        entries.sort_by_key(|e| e.held_at);
        Ok(entries)
    }

    /// Permanently remove one entry
    pub fn purge(&self, id: &str) -> GatewayResult<()> {
        let entry_dir = self.dir.join(id);
        fs::remove_dir_all(&entry_dir).map_err(|e| GatewayError::from_io(e, &entry_dir))
    }

    /// Permanently remove entries held longer than the retention period
    pub fn purge_expired(&self, now: DateTime<Utc>) -> GatewayResult<Vec<HoldingEntry>> {
        let mut purged = Vec::new();
        for entry in self.entries()? {
            if now - entry.held_at >= self.retention {
                self.purge(&entry.id)?;
                purged.push(entry);
            }
        }
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "Purged expired holding entries");
        }
        Ok(purged)
    }
}
