//! Per-identity daily history files.
//!
//! Each approved event is appended to `<root>/<YYYY-MM-DD>/<identity>.jsonl`
//! as a collector record, using the local date of the event.

use crate::event::{RecognitionEvent, TrackRecord};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct HistoryWriter {
    root: PathBuf,
}

impl HistoryWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append the event to its identity's file for the day and return the path.
    pub fn record(&self, event: &RecognitionEvent) -> io::Result<PathBuf> {
        let record = TrackRecord::from(event);
        let dir = self.root.join(&record.date);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.jsonl", sanitize(&event.identity)));
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(path)
    }
}

/// Keep identity keys from escaping the day directory.
fn sanitize(identity: &str) -> String {
    identity
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
