// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Move planning, execution and undo
//!
//! Files go to `<root>/<label>/<file name>`. Moves run one at a time and each
//! is logged before it happens, so the undo log never trails the filesystem.

use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::extract::FeatureExtractor;
use crate::history::{LogEvent, MoveRecord, UndoLog};
use crate::model::{validate_label_name, ClassificationResult, Fingerprint, RunIssue, UNCATEGORIZED};
use crate::orchestrator::ProgressEvent;
use crate::{Result, TidyfoldError};

/// One file's planned destination
#[derive(Debug, Clone, Serialize)]
pub struct PlannedMove {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub label: String,
    #[serde(skip)]
    pub fingerprint: Option<Fingerprint>,
    /// Source and destination are already the same file
    pub in_place: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MovePlan {
    pub root: PathBuf,
    /// In execution order
    pub moves: Vec<PlannedMove>,
    /// Label folders that do not exist yet
    pub new_folders: Vec<PathBuf>,
}

/// What happened to one file during execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MoveOutcome {
    Moved { destination: PathBuf },
    Planned { destination: PathBuf },
    InPlace,
    Failed { reason: String },
    /// Not attempted because the run was cancelled
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub batch_id: Option<String>,
    pub outcomes: Vec<(PathBuf, MoveOutcome)>,
    pub issues: Vec<RunIssue>,
    pub moved: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UndoConflictEntry {
    pub seq: u64,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UndoReport {
    pub batch_id: String,
    pub dry_run: bool,
    pub restored: Vec<MoveRecord>,
    /// Records whose file was already back at its source
    pub already_reverted: Vec<MoveRecord>,
    pub conflicts: Vec<UndoConflictEntry>,
    pub removed_folders: Vec<PathBuf>,
}

impl UndoReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Compute destinations for classified files
///
/// `items` is in execution order. Suffixes are handed out in source-path
/// order so the same inputs always produce the same names.
pub fn plan(root: &Path, items: &[(PathBuf, ClassificationResult)]) -> MovePlan {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| items[a].0.cmp(&items[b].0));

    let mut claimed: HashSet<PathBuf> = HashSet::new();
    let mut assigned: Vec<Option<(PathBuf, bool)>> = vec![None; items.len()];
    for idx in order {
        let (source, result) = &items[idx];
        let folder = root.join(folder_label(&result.label));
        let Some(name) = source.file_name() else {
            continue;
        };
        let (destination, in_place) = free_destination(source, &folder, Path::new(name), &claimed);
        claimed.insert(destination.clone());
        assigned[idx] = Some((destination, in_place));
    }

    let mut new_folders: Vec<PathBuf> = Vec::new();
    let moves = items
        .iter()
        .zip(assigned)
        .filter_map(|((source, result), slot)| {
            let (destination, in_place) = slot?;
            if let Some(folder) = destination.parent() {
                if !in_place && !folder.is_dir() && !new_folders.iter().any(|f| f == folder) {
                    new_folders.push(folder.to_path_buf());
                }
            }
            Some(PlannedMove {
                source: source.clone(),
                destination,
                label: folder_label(&result.label).to_string(),
                fingerprint: result.fingerprint.clone(),
                in_place,
            })
        })
        .collect();

    MovePlan {
        root: root.to_path_buf(),
        moves,
        new_folders,
    }
}

/// Folder a label maps to; anything that is not a plain name stays under the root
fn folder_label(label: &str) -> &str {
    if label == UNCATEGORIZED || validate_label_name(label).is_ok() {
        label
    } else {
        warn!("Label {:?} is not a plain folder name, using {}", label, UNCATEGORIZED);
        UNCATEGORIZED
    }
}

/// Smallest suffix giving a name that is neither on disk nor claimed
fn free_destination(
    source: &Path,
    folder: &Path,
    name: &Path,
    claimed: &HashSet<PathBuf>,
) -> (PathBuf, bool) {
    let stem = name.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = name.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 0u32.. {
        let candidate = if n == 0 {
            folder.join(name)
        } else {
            match &ext {
                Some(ext) => folder.join(format!("{}_{}.{}", stem, n, ext)),
                None => folder.join(format!("{}_{}", stem, n)),
            }
        };
        if claimed.contains(&candidate) {
            continue;
        }
        if fs::symlink_metadata(&candidate).is_err() {
            return (candidate, false);
        }
        if same_file(source, &candidate) {
            return (candidate, true);
        }
    }
    unreachable!("u32 suffixes exhausted")
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Fail with `InvalidRoot` unless `root` is a directory we can write into
pub fn ensure_writable_root(root: &Path) -> Result<()> {
    let invalid = |reason: String| TidyfoldError::InvalidRoot {
        path: root.to_path_buf(),
        reason,
    };

    let meta = fs::metadata(root).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory".into()));
    }
    let scratch = root.join(format!(".tidyfold-write-check-{}", uuid::Uuid::new_v4()));
    fs::File::create(&scratch).map_err(|e| invalid(format!("not writable: {}", e)))?;
    fs::remove_file(&scratch).map_err(|e| invalid(format!("not writable: {}", e)))?;
    Ok(())
}

/// Executes plans and undoes batches against one undo log
pub struct Reorganizer {
    log: Arc<UndoLog>,
}

impl Reorganizer {
    pub fn new(log: Arc<UndoLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &UndoLog {
        &self.log
    }

    /// Report what a plan would do without touching the filesystem
    pub fn dry_run(&self, plan: &MovePlan) -> ExecutionReport {
        let outcomes = plan
            .moves
            .iter()
            .map(|m| {
                let outcome = if m.in_place {
                    MoveOutcome::InPlace
                } else {
                    MoveOutcome::Planned {
                        destination: m.destination.clone(),
                    }
                };
                (m.source.clone(), outcome)
            })
            .collect();
        ExecutionReport {
            batch_id: None,
            outcomes,
            issues: Vec::new(),
            moved: 0,
            cancelled: false,
        }
    }

    /// Execute a plan sequentially
    ///
    /// Errors are fatal only for an unusable root or an undo log that cannot
    /// be written; everything else becomes a per-file issue.
    pub fn execute(
        &self,
        plan: &MovePlan,
        byte_budget: usize,
        cancel: Option<&watch::Receiver<bool>>,
        events: Option<&mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<ExecutionReport> {
        ensure_writable_root(&plan.root)?;

        let batch_id = self.log.begin_batch(&plan.root, byte_budget)?;
        info!("Batch {}: moving {} files", batch_id, plan.moves.len());

        let mut report = ExecutionReport {
            batch_id: Some(batch_id.clone()),
            outcomes: Vec::with_capacity(plan.moves.len()),
            issues: Vec::new(),
            moved: 0,
            cancelled: false,
        };
        let mut created: HashSet<PathBuf> = HashSet::new();

        for planned in &plan.moves {
            if report.cancelled || cancel.is_some_and(|c| *c.borrow()) {
                report.cancelled = true;
                report.outcomes.push((planned.source.clone(), MoveOutcome::Skipped));
                continue;
            }

            let outcome = if planned.in_place {
                MoveOutcome::InPlace
            } else {
                self.move_one(&batch_id, planned, &mut created, &mut report.issues)?
            };
            if matches!(outcome, MoveOutcome::Moved { .. }) {
                report.moved += 1;
            }
            if let Some(tx) = events {
                let _ = tx.send(ProgressEvent::Moved {
                    path: planned.source.clone(),
                    outcome: outcome.clone(),
                });
            }
            report.outcomes.push((planned.source.clone(), outcome));
        }

        self.log.append(
            &batch_id,
            LogEvent::BatchFinished {
                moved: report.moved,
                cancelled: report.cancelled,
            },
        )?;
        info!("Batch {}: {} files moved", batch_id, report.moved);
        Ok(report)
    }

    fn move_one(
        &self,
        batch_id: &str,
        planned: &PlannedMove,
        created: &mut HashSet<PathBuf>,
        issues: &mut Vec<RunIssue>,
    ) -> Result<MoveOutcome> {
        let source = &planned.source;
        let failed = |issues: &mut Vec<RunIssue>, err: TidyfoldError| {
            warn!("Not moving {}: {}", source.display(), err);
            let reason = err.to_string();
            issues.push(RunIssue::from_error(source, &err));
            MoveOutcome::Failed { reason }
        };

        if fs::symlink_metadata(source).is_err() {
            let err = TidyfoldError::UnreadableEntry {
                path: source.clone(),
                reason: "file disappeared before it could be moved".into(),
            };
            return Ok(failed(issues, err));
        }

        let Some(folder) = planned.destination.parent() else {
            return Ok(failed(issues, TidyfoldError::DestinationConflict(planned.destination.clone())));
        };
        if !folder.is_dir() && !created.contains(folder) {
            if folder.exists() {
                return Ok(failed(issues, TidyfoldError::DestinationConflict(folder.to_path_buf())));
            }
            self.log.append(batch_id, LogEvent::FolderCreated { path: folder.to_path_buf() })?;
            if let Err(e) = fs::create_dir(folder) {
                return Ok(failed(issues, e.into()));
            }
            created.insert(folder.to_path_buf());
        }

        // Someone may have taken the name since planning
        let mut destination = planned.destination.clone();
        if fs::symlink_metadata(&destination).is_ok() {
            let name = destination.file_name().map(PathBuf::from).unwrap_or_default();
            let (free, _) = free_destination(source, folder, &name, &HashSet::new());
            warn!(
                "{} appeared after planning, using {}",
                destination.display(),
                free.display()
            );
            destination = free;
        }

        let seq = self.log.append(
            batch_id,
            LogEvent::Move {
                source: source.clone(),
                destination: destination.clone(),
                label: planned.label.clone(),
                fingerprint: planned.fingerprint.clone(),
            },
        )?;

        match rename_no_clobber(source, &destination) {
            Ok(()) => {
                debug!("Moved {} -> {}", source.display(), destination.display());
                Ok(MoveOutcome::Moved { destination })
            }
            Err(e) => {
                self.log.append(
                    batch_id,
                    LogEvent::MoveAborted {
                        move_seq: seq,
                        reason: e.to_string(),
                    },
                )?;
                let err = if e.kind() == std::io::ErrorKind::AlreadyExists {
                    TidyfoldError::DestinationConflict(destination)
                } else {
                    e.into()
                };
                Ok(failed(issues, err))
            }
        }
    }

    /// Move a batch's files back, newest move first
    ///
    /// Records that conflict are reported and left alone; the rest proceed.
    pub fn undo(&self, batch_id: &str, dry_run: bool) -> Result<UndoReport> {
        let batch = self.log.batch(batch_id)?;
        let extractor = FeatureExtractor::new(&ExtractionConfig {
            byte_budget: batch.byte_budget,
            ..ExtractionConfig::default()
        });

        let mut report = UndoReport {
            batch_id: batch_id.to_string(),
            dry_run,
            restored: Vec::new(),
            already_reverted: Vec::new(),
            conflicts: Vec::new(),
            removed_folders: Vec::new(),
        };

        let pending = batch
            .moves
            .iter()
            .rev()
            .filter(|m| !batch.reverted.contains(&m.seq));

        for record in pending {
            let conflict = |reason: String| {
                let err = TidyfoldError::UndoConflict {
                    path: record.destination.clone(),
                    reason: reason.clone(),
                };
                warn!("{}", err);
                UndoConflictEntry {
                    seq: record.seq,
                    source: record.source.clone(),
                    destination: record.destination.clone(),
                    reason,
                }
            };

            match check_record(&extractor, record) {
                Err(reason) => report.conflicts.push(conflict(reason)),
                Ok(RecordState::AlreadyReverted) => {
                    if !dry_run {
                        self.log.append(batch_id, LogEvent::Reverted { move_seq: record.seq })?;
                    }
                    report.already_reverted.push(record.clone());
                }
                Ok(RecordState::Restorable) if dry_run => report.restored.push(record.clone()),
                Ok(RecordState::Restorable) => match restore(record) {
                    Ok(()) => {
                        self.log.append(batch_id, LogEvent::Reverted { move_seq: record.seq })?;
                        debug!("Restored {}", record.source.display());
                        report.restored.push(record.clone());
                    }
                    Err(e) => report.conflicts.push(conflict(e.to_string())),
                },
            }
        }

        if !dry_run {
            for folder in batch.folders.iter().rev() {
                if is_empty_dir(folder) && fs::remove_dir(folder).is_ok() {
                    report.removed_folders.push(folder.clone());
                }
            }
        }

        info!(
            "Undo {}: {} restored, {} conflicts",
            batch_id,
            report.restored.len(),
            report.conflicts.len()
        );
        Ok(report)
    }
}

enum RecordState {
    Restorable,
    AlreadyReverted,
}

fn check_record(extractor: &FeatureExtractor, record: &MoveRecord) -> std::result::Result<RecordState, String> {
    let matches = |path: &Path| -> std::result::Result<bool, String> {
        let Some(expected) = &record.fingerprint else {
            return Ok(true);
        };
        let entry = extractor.snapshot(path).map_err(|e| e.to_string())?;
        Ok(&FeatureExtractor::fingerprint(&entry) == expected)
    };

    let at_destination = fs::symlink_metadata(&record.destination).is_ok();
    let at_source = fs::symlink_metadata(&record.source).is_ok();

    if at_destination {
        if at_source {
            return Err("original path is occupied".into());
        }
        if !matches(&record.destination)? {
            return Err("file changed since it was moved".into());
        }
        return Ok(RecordState::Restorable);
    }

    // Move logged but never completed, or already put back by hand
    if at_source && matches(&record.source)? {
        return Ok(RecordState::AlreadyReverted);
    }
    Err("file no longer at its destination".into())
}

fn restore(record: &MoveRecord) -> Result<()> {
    if let Some(parent) = record.source.parent() {
        fs::create_dir_all(parent)?;
    }
    rename_no_clobber(&record.destination, &record.source)?;
    Ok(())
}

/// Rename that fails with `AlreadyExists` instead of replacing `to`
///
/// A hard link claims the name atomically. Where links are unsupported the
/// name is checked right before a plain rename.
fn rename_no_clobber(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::hard_link(from, to) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(from) {
                // Never leave the file at two paths
                let _ = fs::remove_file(to);
                return Err(e);
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(e),
        Err(_) => {
            if fs::symlink_metadata(to).is_ok() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} already exists", to.display()),
                ));
            }
            fs::rename(from, to)
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassifierSource, Verdict};
    use tempfile::TempDir;

    fn result(label: &str) -> ClassificationResult {
        ClassificationResult::from_verdict(
            Fingerprint::new("unused"),
            Verdict::new(label, 0.9),
            ClassifierSource::Local,
        )
    }

    /// Result carrying the real fingerprint so undo can verify it
    fn real_result(path: &Path, label: &str) -> ClassificationResult {
        let extracted = FeatureExtractor::new(&ExtractionConfig::default())
            .extract(path)
            .unwrap();
        ClassificationResult::from_verdict(extracted.fingerprint, Verdict::new(label, 0.9), ClassifierSource::Local)
    }

    fn reorganizer(dir: &TempDir) -> Reorganizer {
        Reorganizer::new(Arc::new(UndoLog::open(dir.path().join("undo.jsonl")).unwrap()))
    }

    fn snapshot_tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push((path.strip_prefix(root).unwrap().to_path_buf(), fs::read(&path).unwrap()));
                }
            }
        }
        out.sort();
        out
    }

    #[test]
    fn test_collision_suffixes_are_smallest_free() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("Documents")).unwrap();
        fs::write(root.path().join("Documents/report.pdf"), "old").unwrap();
        fs::write(root.path().join("Documents/report_2.pdf"), "old").unwrap();
        fs::write(root.path().join("report.pdf"), "new").unwrap();

        let items = vec![(root.path().join("report.pdf"), result("Documents"))];
        let plan = plan(root.path(), &items);
        assert_eq!(plan.moves[0].destination, root.path().join("Documents/report_1.pdf"));
        assert!(plan.new_folders.is_empty());
    }

    #[test]
    fn test_path_like_label_stays_under_root() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("escaped.xyz"), "x").unwrap();

        let items = vec![(root.path().join("escaped.xyz"), result("../Escaped"))];
        let plan = plan(root.path(), &items);
        assert_eq!(
            plan.moves[0].destination,
            root.path().join(UNCATEGORIZED).join("escaped.xyz")
        );
        assert_eq!(plan.moves[0].label, UNCATEGORIZED);
    }

    #[test]
    fn test_rename_never_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("new.txt");
        let to = dir.path().join("taken.txt");
        fs::write(&from, "new").unwrap();
        fs::write(&to, "already here").unwrap();

        let err = rename_no_clobber(&from, &to).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&from).unwrap(), "new");
        assert_eq!(fs::read_to_string(&to).unwrap(), "already here");

        let free = dir.path().join("free.txt");
        rename_no_clobber(&from, &free).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&free).unwrap(), "new");
    }

    #[test]
    fn test_claimed_names_are_not_reused_within_a_plan() {
        let root = TempDir::new().unwrap();
        // Two sources, same name, different directories
        let a = root.path().join("a");
        let b = root.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("x.txt"), "a").unwrap();
        fs::write(b.join("x.txt"), "b").unwrap();

        // Execution order is b then a; suffix order follows source paths
        let items = vec![(b.join("x.txt"), result("Docs")), (a.join("x.txt"), result("Docs"))];
        let plan = plan(root.path(), &items);
        assert_eq!(plan.moves[0].source, b.join("x.txt"));
        assert_eq!(plan.moves[0].destination, root.path().join("Docs/x_1.txt"));
        assert_eq!(plan.moves[1].destination, root.path().join("Docs/x.txt"));
        assert_eq!(plan.new_folders, vec![root.path().join("Docs")]);
    }

    #[test]
    fn test_file_without_extension_gets_plain_suffix() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("Other")).unwrap();
        fs::write(root.path().join("Other/Makefile"), "old").unwrap();
        fs::write(root.path().join("Makefile"), "new").unwrap();

        let plan = plan(root.path(), &[(root.path().join("Makefile"), result("Other"))]);
        assert_eq!(plan.moves[0].destination, root.path().join("Other/Makefile_1"));
    }

    #[test]
    fn test_already_in_place() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("Documents")).unwrap();
        let path = root.path().join("Documents/a.txt");
        fs::write(&path, "x").unwrap();

        let plan = plan(root.path(), &[(path, result("Documents"))]);
        assert!(plan.moves[0].in_place);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let root = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        fs::write(root.path().join("a.txt"), "x").unwrap();
        let before = snapshot_tree(root.path());

        let reorg = reorganizer(&logs);
        let plan = plan(root.path(), &[(root.path().join("a.txt"), result("Documents"))]);
        let report = reorg.dry_run(&plan);

        assert_eq!(snapshot_tree(root.path()), before);
        assert!(!root.path().join("Documents").exists());
        assert!(matches!(report.outcomes[0].1, MoveOutcome::Planned { .. }));
        assert!(reorg.log().batches().unwrap().is_empty());
    }

    #[test]
    fn test_execute_then_undo_restores_tree() {
        let root = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        fs::create_dir(root.path().join("Photos")).unwrap();
        fs::write(root.path().join("Photos/beach.jpg"), "existing").unwrap();
        fs::write(root.path().join("beach.jpg"), "incoming").unwrap();
        fs::write(root.path().join("notes.txt"), "notes").unwrap();
        let before = snapshot_tree(root.path());

        let items = vec![
            (root.path().join("beach.jpg"), real_result(&root.path().join("beach.jpg"), "Photos")),
            (root.path().join("notes.txt"), real_result(&root.path().join("notes.txt"), "Documents")),
        ];
        let reorg = reorganizer(&logs);
        let report = reorg.execute(&plan(root.path(), &items), 4096, None, None).unwrap();

        assert_eq!(report.moved, 2);
        assert_eq!(fs::read(root.path().join("Photos/beach_1.jpg")).unwrap(), b"incoming");
        assert!(root.path().join("Documents/notes.txt").exists());

        let undo = reorg.undo(report.batch_id.as_deref().unwrap(), false).unwrap();
        assert!(undo.is_clean());
        assert_eq!(undo.restored.len(), 2);
        assert_eq!(undo.removed_folders, vec![root.path().join("Documents")]);
        assert_eq!(snapshot_tree(root.path()), before);
        assert!(root.path().join("Photos").is_dir());

        // A second undo finds nothing left to do
        let again = reorg.undo(report.batch_id.as_deref().unwrap(), false).unwrap();
        assert!(again.restored.is_empty() && again.conflicts.is_empty());
    }

    #[test]
    fn test_undo_reports_modified_and_missing_files() {
        let root = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(root.path().join(name), name).unwrap();
        }
        let items: Vec<_> = ["a.txt", "b.txt", "c.txt"]
            .iter()
            .map(|n| (root.path().join(n), real_result(&root.path().join(n), "Documents")))
            .collect();
        let reorg = reorganizer(&logs);
        let report = reorg.execute(&plan(root.path(), &items), 4096, None, None).unwrap();
        let batch = report.batch_id.unwrap();

        fs::write(root.path().join("Documents/a.txt"), "edited, and longer").unwrap();
        fs::remove_file(root.path().join("Documents/b.txt")).unwrap();

        let undo = reorg.undo(&batch, false).unwrap();
        assert_eq!(undo.restored.len(), 1);
        assert_eq!(undo.conflicts.len(), 2);
        assert!(root.path().join("c.txt").exists());
        // Conflicting files stay where they were
        assert!(root.path().join("Documents/a.txt").exists());
        assert!(!root.path().join("a.txt").exists());
        // Folder still holds a.txt
        assert!(undo.removed_folders.is_empty());
    }

    #[test]
    fn test_undo_dry_run_changes_nothing() {
        let root = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        fs::write(root.path().join("a.txt"), "a").unwrap();
        let items = vec![(root.path().join("a.txt"), real_result(&root.path().join("a.txt"), "Documents"))];
        let reorg = reorganizer(&logs);
        let batch = reorg
            .execute(&plan(root.path(), &items), 4096, None, None)
            .unwrap()
            .batch_id
            .unwrap();

        let preview = reorg.undo(&batch, true).unwrap();
        assert_eq!(preview.restored.len(), 1);
        assert!(root.path().join("Documents/a.txt").exists());
        assert_eq!(reorg.log().batches().unwrap()[0].outstanding(), 1);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let logs = TempDir::new().unwrap();
        let reorg = reorganizer(&logs);
        let plan = plan(&logs.path().join("nope"), &[]);
        let err = reorg.execute(&plan, 4096, None, None).unwrap_err();
        assert!(matches!(err, TidyfoldError::InvalidRoot { .. }));
        assert!(reorg.log().batches().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_batch() {
        let logs = TempDir::new().unwrap();
        let err = reorganizer(&logs).undo("missing", false).unwrap_err();
        assert!(matches!(err, TidyfoldError::BatchNotFound(_)));
    }

    #[test]
    fn test_cancelled_execution_skips_remaining_moves() {
        let root = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        fs::write(root.path().join("a.txt"), "a").unwrap();
        let (tx, rx) = watch::channel(true);
        let reorg = reorganizer(&logs);
        let report = reorg
            .execute(&plan(root.path(), &[(root.path().join("a.txt"), result("Docs"))]), 4096, Some(&rx), None)
            .unwrap();
        drop(tx);
        assert!(report.cancelled);
        assert_eq!(report.outcomes[0].1, MoveOutcome::Skipped);
        assert!(root.path().join("a.txt").exists());
    }
}
