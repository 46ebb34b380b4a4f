//! File-backed event journal.
//!
//! Events are appended as JSON lines to one file per day:
//! ```text
//! {root}/
//!   2024/
//!     01/
//!       15/
//!         events.jsonl
//! ```
//!
//! Each line is a [`StreamRecord`] chained to its predecessor, so the
//! journal can be verified end to end after the fact.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use tessera_core::ChangeEvent;

use crate::{EventHandle, EventPublisher, StreamError, StreamRecord};

const JOURNAL_FILE: &str = "events.jsonl";

struct JournalHead {
    sequence: u64,
    last_hash: Option<String>,
}

pub struct JournalStream {
    root: PathBuf,
    head: Mutex<JournalHead>,
}

impl JournalStream {
    /// Open (or create) a journal rooted at the given directory, resuming
    /// after the last verified record.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let records = read_records(&root)?;
        let head = JournalHead {
            sequence: records.last().map(|r| r.sequence).unwrap_or(0),
            last_hash: records.last().map(|r| r.content_hash.clone()),
        };
        tracing::info!(
            root = %root.display(),
            sequence = head.sequence,
            "Event journal opened"
        );
        Ok(Self {
            root,
            head: Mutex::new(head),
        })
    }

    fn journal_path(&self, at: &DateTime<Utc>) -> PathBuf {
        let date = at.format("%Y/%m/%d");
        self.root.join(format!("{date}/{JOURNAL_FILE}"))
    }

    /// Read every record and verify the hash chain.
    pub fn read_all(&self) -> Result<Vec<StreamRecord>, StreamError> {
        read_records(&self.root)
    }
}

#[async_trait]
impl EventPublisher for JournalStream {
    async fn publish(&self, event: ChangeEvent) -> Result<EventHandle, StreamError> {
        let mut head = self.head.lock().await;
        let path = self.journal_path(&event.timestamp);
        let record = StreamRecord::seal(head.sequence + 1, head.last_hash.clone(), event)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        head.sequence = record.sequence;
        head.last_hash = Some(record.content_hash.clone());

        tracing::debug!(
            sequence = record.sequence,
            event_id = %record.event.id,
            path = %path.display(),
            "Event journaled"
        );
        Ok(record.handle())
    }
}

fn read_records(root: &Path) -> Result<Vec<StreamRecord>, StreamError> {
    let mut files = Vec::new();
    collect_journal_files(root, &mut files)?;
    files.sort();

    let mut records = Vec::new();
    for file in files {
        let content = fs::read_to_string(&file)?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str::<StreamRecord>(line)?);
        }
    }
    records.sort_by_key(|r| r.sequence);

    let mut previous: Option<&str> = None;
    for record in &records {
        if record.previous_hash.as_deref() != previous || !record.verify_integrity() {
            return Err(StreamError::IntegrityViolation(record.sequence));
        }
        previous = Some(record.content_hash.as_str());
    }
    Ok(records)
}

/// Recursively collect journal files.
fn collect_journal_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), StreamError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_journal_files(&path, files)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some(JOURNAL_FILE) {
            files.push(path);
        }
    }
    Ok(())
}
