// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Write-ahead undo log
//!
//! An append-only JSON Lines file. Every entry carries a sequence number that
//! only ever grows, and each append is flushed to disk before the filesystem
//! change it describes is made.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::model::Fingerprint;
use crate::{Result, TidyfoldError};

/// One line of the undo log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    BatchStarted {
        root: PathBuf,
        /// Extraction budget in force, needed to recompute fingerprints on undo
        byte_budget: usize,
    },
    FolderCreated {
        path: PathBuf,
    },
    Move {
        source: PathBuf,
        destination: PathBuf,
        label: String,
        fingerprint: Option<Fingerprint>,
    },
    MoveAborted {
        move_seq: u64,
        reason: String,
    },
    BatchFinished {
        moved: usize,
        cancelled: bool,
    },
    Reverted {
        move_seq: u64,
    },
}

/// A move as recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoveRecord {
    pub seq: u64,
    pub batch_id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub label: String,
    pub fingerprint: Option<Fingerprint>,
    pub timestamp: DateTime<Utc>,
}

/// Summary of one batch for listings
#[derive(Debug, Clone, Serialize)]
pub struct BatchInfo {
    pub batch_id: String,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished: bool,
    pub cancelled: bool,
    pub moves: usize,
    pub aborted: usize,
    pub reverted: usize,
}

impl BatchInfo {
    /// Completed moves that have not been reverted yet
    pub fn outstanding(&self) -> usize {
        self.moves.saturating_sub(self.aborted + self.reverted)
    }

    pub fn fully_undone(&self) -> bool {
        self.moves > self.aborted && self.outstanding() == 0
    }
}

/// Everything the log knows about one batch
#[derive(Debug, Clone)]
pub struct BatchLog {
    pub info: BatchInfo,
    pub byte_budget: usize,
    /// Moves that were not aborted, in sequence order
    pub moves: Vec<MoveRecord>,
    pub reverted: HashSet<u64>,
    pub folders: Vec<PathBuf>,
}

struct Writer {
    file: File,
    next_seq: u64,
}

/// Append-only undo log, single writer
pub struct UndoLog {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl UndoLog {
    /// Open (or create) the log, resuming the sequence after the last entry
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let next_seq = read_entries(&path)?
            .iter()
            .map(|e| e.seq)
            .max()
            .map_or(1, |s| s + 1);
        let mut file = open_append(&path)?;
        // Terminate a torn final line so the next entry starts cleanly
        if !ends_with_newline(&path)? {
            writeln!(file)?;
        }
        debug!("Opened undo log {:?} at seq {}", path, next_seq);
        Ok(Self {
            path,
            writer: Mutex::new(Writer { file, next_seq }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event and sync it to disk; returns the assigned sequence number
    pub fn append(&self, batch_id: &str, event: LogEvent) -> Result<u64> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TidyfoldError::Config("undo log writer poisoned".into()))?;
        let entry = LogEntry {
            seq: writer.next_seq,
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&entry)?;
        writeln!(writer.file, "{}", json)?;
        writer.file.sync_data()?;
        writer.next_seq += 1;
        Ok(entry.seq)
    }

    /// Start a batch and return its id
    pub fn begin_batch(&self, root: &Path, byte_budget: usize) -> Result<String> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        self.append(
            &batch_id,
            LogEvent::BatchStarted {
                root: root.to_path_buf(),
                byte_budget,
            },
        )?;
        Ok(batch_id)
    }

    /// Read every entry; unparseable lines (a torn final write) are skipped
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        read_entries(&self.path)
    }

    /// Batches, newest first
    pub fn batches(&self) -> Result<Vec<BatchInfo>> {
        let mut order = Vec::new();
        let mut logs: BTreeMap<String, BatchLog> = BTreeMap::new();
        for entry in self.read_all()? {
            if !logs.contains_key(&entry.batch_id) {
                order.push(entry.batch_id.clone());
            }
            fold_entry(&mut logs, entry);
        }
        Ok(order
            .into_iter()
            .rev()
            .filter_map(|id| logs.remove(&id).map(|l| l.info))
            .collect())
    }

    pub fn batch(&self, batch_id: &str) -> Result<BatchLog> {
        let mut logs = BTreeMap::new();
        for entry in self.read_all()?.into_iter().filter(|e| e.batch_id == batch_id) {
            fold_entry(&mut logs, entry);
        }
        let mut log = logs
            .remove(batch_id)
            .ok_or_else(|| TidyfoldError::BatchNotFound(batch_id.to_string()))?;
        log.moves.sort_by_key(|m| m.seq);
        Ok(log)
    }

    /// Newest batch that still has moves to revert
    pub fn latest_undoable(&self) -> Result<Option<String>> {
        Ok(self
            .batches()?
            .into_iter()
            .find(|b| b.outstanding() > 0)
            .map(|b| b.batch_id))
    }

    /// Forget all history
    pub fn clear(&self) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| TidyfoldError::Config("undo log writer poisoned".into()))?;
        writer.file.set_len(0)?;
        writer.file.sync_all()?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!("Failed to parse undo log entry: {}", e);
            }
        }
    }
    Ok(entries)
}

fn fold_entry(logs: &mut BTreeMap<String, BatchLog>, entry: LogEntry) {
    let log = logs.entry(entry.batch_id.clone()).or_insert_with(|| BatchLog {
        info: BatchInfo {
            batch_id: entry.batch_id.clone(),
            root: PathBuf::new(),
            started_at: entry.timestamp,
            finished: false,
            cancelled: false,
            moves: 0,
            aborted: 0,
            reverted: 0,
        },
        byte_budget: 0,
        moves: Vec::new(),
        reverted: HashSet::new(),
        folders: Vec::new(),
    });

    match entry.event {
        LogEvent::BatchStarted { root, byte_budget } => {
            log.info.root = root;
            log.info.started_at = entry.timestamp;
            log.byte_budget = byte_budget;
        }
        LogEvent::FolderCreated { path } => log.folders.push(path),
        LogEvent::Move {
            source,
            destination,
            label,
            fingerprint,
        } => {
            log.info.moves += 1;
            log.moves.push(MoveRecord {
                seq: entry.seq,
                batch_id: entry.batch_id,
                source,
                destination,
                label,
                fingerprint,
                timestamp: entry.timestamp,
            });
        }
        LogEvent::MoveAborted { move_seq, .. } => {
            log.info.aborted += 1;
            log.moves.retain(|m| m.seq != move_seq);
        }
        LogEvent::BatchFinished { cancelled, .. } => {
            log.info.finished = true;
            log.info.cancelled = cancelled;
        }
        LogEvent::Reverted { move_seq } => {
            if log.reverted.insert(move_seq) {
                log.info.reverted += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn move_event(n: usize) -> LogEvent {
        LogEvent::Move {
            source: PathBuf::from(format!("/r/f{}.txt", n)),
            destination: PathBuf::from(format!("/r/Documents/f{}.txt", n)),
            label: "Documents".into(),
            fingerprint: Some(Fingerprint::new(format!("fp{}", n))),
        }
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("undo.jsonl");

        let log = UndoLog::open(&path).unwrap();
        let batch = log.begin_batch(Path::new("/r"), 4096).unwrap();
        let s1 = log.append(&batch, move_event(1)).unwrap();
        drop(log);

        let log = UndoLog::open(&path).unwrap();
        let s2 = log.append(&batch, move_event(2)).unwrap();
        assert!(s2 > s1);
        assert_eq!(log.batch(&batch).unwrap().moves.len(), 2);
    }

    #[test]
    fn test_entry_format_is_tagged_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("undo.jsonl");
        let log = UndoLog::open(&path).unwrap();
        let batch = log.begin_batch(Path::new("/r"), 4096).unwrap();
        log.append(&batch, move_event(1)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["type"], "batch_started");
        assert_eq!(lines[1]["type"], "move");
        assert_eq!(lines[1]["seq"], 2);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("undo.jsonl");
        let log = UndoLog::open(&path).unwrap();
        let batch = log.begin_batch(Path::new("/r"), 4096).unwrap();
        log.append(&batch, move_event(1)).unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"seq\":3,\"batch_id\":\"").unwrap();
        drop(file);

        let log = UndoLog::open(&path).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 2);

        log.append(&batch, move_event(2)).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_aborted_and_reverted_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let log = UndoLog::open(dir.path().join("undo.jsonl")).unwrap();
        let batch = log.begin_batch(Path::new("/r"), 4096).unwrap();
        let m1 = log.append(&batch, move_event(1)).unwrap();
        let m2 = log.append(&batch, move_event(2)).unwrap();
        log.append(&batch, LogEvent::MoveAborted { move_seq: m2, reason: "gone".into() })
            .unwrap();
        log.append(&batch, LogEvent::BatchFinished { moved: 1, cancelled: false })
            .unwrap();

        let info = &log.batches().unwrap()[0];
        assert_eq!(info.moves, 2);
        assert_eq!(info.outstanding(), 1);
        assert_eq!(log.latest_undoable().unwrap().as_deref(), Some(batch.as_str()));

        log.append(&batch, LogEvent::Reverted { move_seq: m1 }).unwrap();
        let info = &log.batches().unwrap()[0];
        assert!(info.fully_undone());
        assert!(log.latest_undoable().unwrap().is_none());
    }

    #[test]
    fn test_batches_newest_first_and_clear() {
        let dir = TempDir::new().unwrap();
        let log = UndoLog::open(dir.path().join("undo.jsonl")).unwrap();
        let first = log.begin_batch(Path::new("/a"), 4096).unwrap();
        let second = log.begin_batch(Path::new("/b"), 4096).unwrap();

        let batches = log.batches().unwrap();
        assert_eq!(batches[0].batch_id, second);
        assert_eq!(batches[1].batch_id, first);

        log.clear().unwrap();
        assert!(log.batches().unwrap().is_empty());
        assert!(matches!(log.batch(&first), Err(TidyfoldError::BatchNotFound(_))));

        // Appends still work after clearing
        log.begin_batch(Path::new("/c"), 4096).unwrap();
        assert_eq!(log.batches().unwrap().len(), 1);
    }
}
