//! Durable outbox for recognition events.
//!
//! Pending events live in a JSON Lines log. A drain moves the whole log into a
//! batch recorded in an audit journal and truncates the log, all under one
//! mutex, so an event belongs to exactly one batch. Batches stay in the journal
//! until confirmed; unconfirmed batches are replayed after a restart.
//!
//! Every write is fsynced before the call returns. A line torn by a crash is
//! cut off when the outbox is reopened, so later writes start on a fresh line.

use crate::event::RecognitionEvent;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const PENDING_FILE: &str = "pending.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";

/// Errors from outbox persistence.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A drained snapshot of pending events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub drained_at: DateTime<Utc>,
    pub events: Vec<RecognitionEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AuditEntry {
    Batch(Batch),
    Confirmed { batch_id: Uuid },
}

struct Files {
    pending_path: PathBuf,
    pending: File,
    audit_path: PathBuf,
    audit: File,
}

/// Append-only event log with atomic drain and confirm.
pub struct Outbox {
    files: Mutex<Files>,
}

impl Outbox {
    /// Open or create the outbox under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, OutboxError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(io_err(data_dir))?;

        let pending_path = data_dir.join(PENDING_FILE);
        let audit_path = data_dir.join(AUDIT_FILE);
        repair_tail(&pending_path)?;
        repair_tail(&audit_path)?;

        Ok(Self {
            files: Mutex::new(Files {
                pending: open_append(&pending_path)?,
                pending_path,
                audit: open_append(&audit_path)?,
                audit_path,
            }),
        })
    }

    /// Persist one event.
    pub fn append(&self, event: &RecognitionEvent) -> Result<(), OutboxError> {
        let line = serde_json::to_string(event)?;
        let mut files = self.files.lock();
        let path = files.pending_path.clone();
        write_line(&mut files.pending, &path, &line)?;
        metrics::counter!("tracker.outbox.appended").increment(1);
        Ok(())
    }

    /// Move every pending event into a new audited batch.
    ///
    /// Returns `None` when nothing is pending. If the journal write fails the
    /// pending log is left intact.
    pub fn drain_all(&self) -> Result<Option<Batch>, OutboxError> {
        let mut files = self.files.lock();
        let events: Vec<RecognitionEvent> = read_lines(&files.pending_path)?;

        if events.is_empty() {
            truncate(&files.pending, &files.pending_path)?;
            return Ok(None);
        }

        let batch = Batch {
            id: Uuid::new_v4(),
            drained_at: Utc::now(),
            events,
        };

        let line = serde_json::to_string(&AuditEntry::Batch(batch.clone()))?;
        let audit_path = files.audit_path.clone();
        write_line(&mut files.audit, &audit_path, &line)?;
        truncate(&files.pending, &files.pending_path)?;

        debug!(
            batch_id = %batch.id,
            event_count = batch.events.len(),
            "Drained outbox into batch"
        );
        Ok(Some(batch))
    }

    /// Mark a batch as delivered.
    ///
    /// The journal is compacted to empty once no unconfirmed batch remains.
    pub fn confirm(&self, batch_id: Uuid) -> Result<(), OutboxError> {
        self.confirm_all(&[batch_id])
    }

    /// Mark several batches as delivered with one journal write.
    pub fn confirm_all(&self, batch_ids: &[Uuid]) -> Result<(), OutboxError> {
        if batch_ids.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        for &batch_id in batch_ids {
            lines.push_str(&serde_json::to_string(&AuditEntry::Confirmed { batch_id })?);
            lines.push('\n');
        }

        let mut files = self.files.lock();
        let audit_path = files.audit_path.clone();
        write_all(&mut files.audit, &audit_path, lines.as_bytes())?;

        if unconfirmed_in(&files.audit_path)?.is_empty() {
            truncate(&files.audit, &files.audit_path)?;
            debug!("Audit journal compacted");
        }
        Ok(())
    }

    /// Recorded batches without a confirmation, in drain order.
    pub fn unconfirmed(&self) -> Result<Vec<Batch>, OutboxError> {
        let files = self.files.lock();
        unconfirmed_in(&files.audit_path)
    }

    /// Number of events waiting to be drained.
    pub fn pending_count(&self) -> Result<usize, OutboxError> {
        let files = self.files.lock();
        Ok(read_lines::<RecognitionEvent>(&files.pending_path)?.len())
    }
}

fn unconfirmed_in(audit_path: &Path) -> Result<Vec<Batch>, OutboxError> {
    let entries: Vec<AuditEntry> = read_lines(audit_path)?;

    let confirmed: HashSet<Uuid> = entries
        .iter()
        .filter_map(|entry| match entry {
            AuditEntry::Confirmed { batch_id } => Some(*batch_id),
            AuditEntry::Batch(_) => None,
        })
        .collect();

    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            AuditEntry::Batch(batch) if !confirmed.contains(&batch.id) => Some(batch),
            _ => None,
        })
        .collect())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> OutboxError + '_ {
    move |source| OutboxError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open_append(path: &Path) -> Result<File, OutboxError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))
}

fn write_line(file: &mut File, path: &Path, line: &str) -> Result<(), OutboxError> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    write_all(file, path, &buf)
}

/// Append `buf` and fsync. A failed write is rolled back to the previous length.
fn write_all(file: &mut File, path: &Path, buf: &[u8]) -> Result<(), OutboxError> {
    let len = file.metadata().map_err(io_err(path))?.len();
    if let Err(e) = file.write_all(buf) {
        if let Err(rollback) = file.set_len(len) {
            warn!(path = %path.display(), error = %rollback, "Failed to roll back partial write");
        }
        return Err(io_err(path)(e));
    }
    file.sync_data().map_err(io_err(path))
}

/// Make sure a log ends on a line boundary.
///
/// A tail without a newline is kept (newline added) when it is a complete JSON
/// value and cut off otherwise.
fn repair_tail(path: &Path) -> Result<(), OutboxError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(path)(e)),
    };
    if contents.is_empty() || contents.ends_with(b"\n") {
        return Ok(());
    }

    let keep = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |index| index + 1);
    let tail = &contents[keep..];

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(io_err(path))?;

    if serde_json::from_slice::<serde_json::Value>(tail).is_ok() {
        debug!(path = %path.display(), "Terminating unterminated log line");
        file.seek(SeekFrom::End(0)).map_err(io_err(path))?;
        file.write_all(b"\n").map_err(io_err(path))?;
    } else {
        warn!(
            path = %path.display(),
            discarded_bytes = tail.len(),
            "Discarding torn line at end of log"
        );
        file.set_len(keep as u64).map_err(io_err(path))?;
    }
    file.sync_data().map_err(io_err(path))
}

fn truncate(file: &File, path: &Path) -> Result<(), OutboxError> {
    file.set_len(0).map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))
}

/// Parse every complete JSON line, skipping torn or invalid ones.
fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, OutboxError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path)(e)),
    };

    let mut entries = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping unreadable log line"
            ),
        }
    }
    Ok(entries)
}
