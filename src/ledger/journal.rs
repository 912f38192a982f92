//! Append-only ledger journal.
//!
//! One JSON object per line. The file is held under an exclusive advisory
//! lock for as long as the journal is open, so two processes never append to
//! the same ledger. Every append is flushed and synced before returning.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::gateway::io::atomic_write;
use crate::models::operation::Operation;
use crate::models::plan::{PlanId, PlanStatus};
use crate::models::record::ExecutionRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum LedgerEvent {
    #[serde(rename_all = "camelCase")]
    PlanStarted {
        plan_id: PlanId,
        utterance: String,
        working_directory: PathBuf,
        operations: Vec<Operation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replay_of: Option<PlanId>,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RecordAppended { record: ExecutionRecord },
    #[serde(rename_all = "camelCase")]
    PlanFinished {
        plan_id: PlanId,
        status: PlanStatus,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PlanUndone {
        plan_id: PlanId,
        fingerprint: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PlanRedone {
        plan_id: PlanId,
        replayed_as: PlanId,
        at: DateTime<Utc>,
    },
}

impl LedgerEvent {
    pub fn plan_id(&self) -> PlanId {
        match self {
            LedgerEvent::PlanStarted { plan_id, .. }
            | LedgerEvent::PlanFinished { plan_id, .. }
            | LedgerEvent::PlanUndone { plan_id, .. }
            | LedgerEvent::PlanRedone { plan_id, .. } => *plan_id,
            LedgerEvent::RecordAppended { record } => record.plan_id,
        }
    }
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open (or create) the journal and take the exclusive lock.
    /// Returns the journal and every event already in it.
    pub fn open(path: &Path) -> Result<(Self, Vec<LedgerEvent>)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = Self::open_locked(path)?;
        let contents = std::fs::read(path)?;
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            // Terminate a torn line so the next append starts cleanly
            file.write_all(b"\n")?;
        }
        let events = parse_events(path, &contents);
        tracing::debug!(path = %path.display(), events = events.len(), "Ledger journal opened");
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            events,
        ))
    }

    fn open_locked(path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|e| {
            Error::Ledger(format!(
                "journal {} is in use by another process: {}",
                path.display(),
                e
            ))
        })?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, event: &LedgerEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| Error::Ledger(format!("failed to encode ledger event: {}", e)))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| Error::Ledger(format!("failed to append to {}: {}", self.path.display(), e)))
    }

    /// Rewrite the journal with only `events`
    pub fn compact(&mut self, events: &[LedgerEvent]) -> Result<()> {
        let mut data = Vec::new();
        for event in events {
            serde_json::to_writer(&mut data, event)
                .map_err(|e| Error::Ledger(format!("failed to encode ledger event: {}", e)))?;
            data.push(b'\n');
        }
        atomic_write(&self.path, &data)
            .map_err(|e| Error::Ledger(format!("failed to compact journal: {}", e)))?;

        // The old handle points at the replaced inode
        let _ = FileExt::unlock(&self.file);
        self.file = Self::open_locked(&self.path)?;
        tracing::info!(path = %self.path.display(), events = events.len(), "Ledger journal compacted");
        Ok(())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn parse_events(path: &Path, contents: &[u8]) -> Vec<LedgerEvent> {
    let mut events = Vec::new();
    for (number, line) in String::from_utf8_lossy(contents).lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEvent>(line) {
            Ok(event) => events.push(event),
            // A torn final line from a crash mid-append
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = number + 1,
                error = %e,
                "Skipping unreadable ledger line"
            ),
        }
    }
    events
}
