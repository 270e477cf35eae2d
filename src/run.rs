// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! End-to-end runs: scan, classify, reorganize

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache::ClassificationCache;
use crate::classifier::TokenBucket;
use crate::config::{AppConfig, ClassifierPreference};
use crate::credentials::CredentialStore;
use crate::extract::scan_root;
use crate::history::UndoLog;
use crate::model::{ClassificationResult, LabelSet, RunIssue};
use crate::orchestrator::{Orchestrator, ProgressEvent};
use crate::reorganize::{self, MoveOutcome, Reorganizer, UndoReport};
use crate::{Result, TidyfoldError};

/// Cancellation channel flipped by Ctrl+C or SIGTERM
pub fn cancel_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, finishing files in flight..."),
            _ = terminate => info!("Received SIGTERM, finishing files in flight..."),
        }

        let _ = tx.send(true);
    });

    rx
}

/// What the caller wants organized and how
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub root: PathBuf,
    /// Defaults to the configured categories
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub preference: Option<ClassifierPreference>,
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
    #[serde(default)]
    pub dry_run: bool,
}

impl RunRequest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            labels: None,
            preference: None,
            confidence_threshold: None,
            dry_run: false,
        }
    }
}

/// Per-file line of a summary
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub result: ClassificationResult,
    pub outcome: MoveOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub batch_id: Option<String>,
    pub root: PathBuf,
    pub dry_run: bool,
    pub cancelled: bool,
    pub total_files: usize,
    pub moved: usize,
    pub counts: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub files: Vec<FileReport>,
    pub issues: Vec<RunIssue>,
}

/// Long-lived state shared by runs: config, cache, undo log and credentials
pub struct Engine {
    config: AppConfig,
    cache: ClassificationCache,
    history: Arc<UndoLog>,
    credentials: Arc<dyn CredentialStore>,
    /// Remote call budget shared by every run of this engine
    remote_bucket: Arc<TokenBucket>,
    /// Roots with a run that may move files
    busy_roots: Mutex<HashSet<PathBuf>>,
    rebuild_reported: AtomicBool,
}

/// Marks a root busy until dropped
struct RootClaim<'a> {
    busy: &'a Mutex<HashSet<PathBuf>>,
    root: PathBuf,
}

impl Drop for RootClaim<'_> {
    fn drop(&mut self) {
        let mut busy = match self.busy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        busy.remove(&self.root);
    }
}

impl Engine {
    /// Open the cache and undo log named in the config
    pub fn open(config: AppConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let cache = ClassificationCache::open(&config.cache.path)?;
        let history = Arc::new(UndoLog::open(&config.history.path)?);
        Ok(Self::with_parts(config, cache, history, credentials))
    }

    pub fn with_parts(
        config: AppConfig,
        cache: ClassificationCache,
        history: Arc<UndoLog>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let remote_bucket = Arc::new(TokenBucket::from_config(&config.classifier.remote));
        Self {
            config,
            cache,
            history,
            credentials,
            remote_bucket,
            busy_roots: Mutex::new(HashSet::new()),
            rebuild_reported: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    pub fn history(&self) -> &UndoLog {
        &self.history
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Label set for a request, falling back to configured categories
    pub fn label_set(&self, request: &RunRequest) -> Result<LabelSet> {
        match &request.labels {
            Some(labels) => LabelSet::new(labels.iter().cloned()),
            None => LabelSet::new(self.config.categories.iter().cloned()),
        }
    }

    /// Only one run at a time may move files within a root
    fn claim_root(&self, root: &Path) -> Result<RootClaim<'_>> {
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let mut busy = match self.busy_roots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !busy.insert(root.clone()) {
            return Err(TidyfoldError::RunInProgress(root));
        }
        Ok(RootClaim {
            busy: &self.busy_roots,
            root,
        })
    }

    /// Orchestrator for a request, plus issues about unavailable classifiers
    pub fn orchestrator(&self, request: &RunRequest) -> Result<(Orchestrator, Vec<RunIssue>)> {
        let labels = self.label_set(request)?;
        let threshold = request
            .confidence_threshold
            .unwrap_or(self.config.classifier.confidence_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(TidyfoldError::Config(format!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        let preference = request.preference.unwrap_or(self.config.classifier.preference);

        Ok(Orchestrator::from_config(
            &self.config,
            labels,
            preference,
            threshold,
            self.cache.clone(),
            self.credentials.clone(),
            self.remote_bucket.clone(),
            &request.root,
        ))
    }

    /// Run with classifiers built from configuration
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: watch::Receiver<bool>,
        events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<RunSummary> {
        let (orchestrator, issues) = self.orchestrator(&request)?;
        self.run_with(Arc::new(orchestrator), request, issues, cancel, events)
            .await
    }

    /// Run with a prepared orchestrator
    pub async fn run_with(
        &self,
        orchestrator: Arc<Orchestrator>,
        request: RunRequest,
        mut issues: Vec<RunIssue>,
        cancel: watch::Receiver<bool>,
        events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<RunSummary> {
        let root = request.root.clone();
        let _claim = if request.dry_run {
            None
        } else {
            let claim = self.claim_root(&root)?;
            reorganize::ensure_writable_root(&root)?;
            Some(claim)
        };

        if let Some(reason) = self.cache.rebuilt_reason() {
            if !self.rebuild_reported.swap(true, Ordering::SeqCst) {
                let err = TidyfoldError::CacheCorrupt(reason.to_string());
                issues.push(RunIssue::from_error(&self.config.cache.path, &err));
            }
        }

        let scan = scan_root(&root, &self.config.scan)?;
        for path in &scan.unsupported {
            issues.push(RunIssue::from_error(path, &TidyfoldError::UnsupportedEntry(path.clone())));
        }
        info!(
            "Run on {:?}: {} files, {} skipped",
            root,
            scan.files.len(),
            scan.unsupported.len()
        );

        let total_files = scan.files.len();
        let batch = orchestrator
            .classify_batch(scan.files, cancel.clone(), events.clone())
            .await;

        let mut items = Vec::with_capacity(batch.files.len());
        for file in batch.files {
            issues.extend(file.issues);
            items.push((file.path, file.result));
        }

        let plan = reorganize::plan(&root, &items);
        let reorganizer = Reorganizer::new(self.history.clone());
        let report = if request.dry_run {
            reorganizer.dry_run(&plan)
        } else {
            reorganizer.execute(
                &plan,
                self.config.extraction.byte_budget,
                Some(&cancel),
                events.as_ref(),
            )?
        };
        issues.extend(report.issues);

        let mut counts = BTreeMap::new();
        let mut by_source = BTreeMap::new();
        let mut files = Vec::with_capacity(items.len());
        for ((path, result), (_, outcome)) in items.into_iter().zip(report.outcomes) {
            *counts.entry(result.label.clone()).or_insert(0) += 1;
            *by_source.entry(result.source.to_string()).or_insert(0) += 1;
            files.push(FileReport { path, result, outcome });
        }

        let cancelled = batch.cancelled || report.cancelled;
        if cancelled {
            warn!("Run cancelled; {} files were not processed", batch.skipped.len());
        }

        Ok(RunSummary {
            batch_id: report.batch_id,
            root,
            dry_run: request.dry_run,
            cancelled,
            total_files,
            moved: report.moved,
            counts,
            by_source,
            files,
            issues,
        })
    }

    /// Undo a batch, or the newest one with outstanding moves
    pub fn undo(&self, batch_id: Option<&str>, dry_run: bool) -> Result<UndoReport> {
        let batch_id = match batch_id {
            Some(id) => id.to_string(),
            None => self
                .history
                .latest_undoable()?
                .ok_or_else(|| TidyfoldError::BatchNotFound("no batch left to undo".into()))?,
        };
        Reorganizer::new(self.history.clone()).undo(&batch_id, dry_run)
    }

    /// Manual re-categorisation under the default configuration
    pub fn assign(&self, path: &std::path::Path, label: &str) -> Result<ClassificationResult> {
        let request = RunRequest::new(path.parent().unwrap_or(path));
        let (orchestrator, _) = self.orchestrator(&request)?;
        orchestrator.assign(path, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStore;
    use tempfile::TempDir;

    fn engine(state: &TempDir) -> Engine {
        let mut config = AppConfig::default();
        config.classifier.remote.enabled = false;
        Engine::with_parts(
            config,
            ClassificationCache::in_memory().unwrap(),
            Arc::new(UndoLog::open(state.path().join("undo.jsonl")).unwrap()),
            Arc::new(MemoryStore::new()),
        )
    }

    fn idle() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_second_run_on_busy_root_is_refused() {
        let state = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("notes.txt"), "milk").unwrap();
        let engine = engine(&state);

        let claim = engine.claim_root(root.path()).unwrap();
        let err = engine.run(RunRequest::new(root.path()), idle(), None).await.unwrap_err();
        assert_eq!(err.kind(), "run_in_progress");
        assert!(root.path().join("notes.txt").exists());

        // Dry runs never move anything, so they may overlap
        let mut dry = RunRequest::new(root.path());
        dry.dry_run = true;
        assert!(engine.run(dry, idle(), None).await.is_ok());

        drop(claim);
        let summary = engine.run(RunRequest::new(root.path()), idle(), None).await.unwrap();
        assert_eq!(summary.moved, 1);
        // The claim is released once the run ends
        assert!(engine.claim_root(root.path()).is_ok());
    }

    #[test]
    fn test_runs_share_one_remote_budget() {
        let state = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.classifier.remote.enabled = true;
        config.classifier.preference = ClassifierPreference::Both;
        let store = MemoryStore::new();
        store.set("openai", "sk-test").unwrap();
        let engine = Engine::with_parts(
            config,
            ClassificationCache::in_memory().unwrap(),
            Arc::new(UndoLog::open(state.path().join("undo.jsonl")).unwrap()),
            Arc::new(store),
        );

        let request = RunRequest::new(state.path());
        let (first, _) = engine.orchestrator(&request).unwrap();
        let (second, _) = engine.orchestrator(&request).unwrap();
        assert!(first.has_remote() && second.has_remote());
        // Both remote classifiers draw from the engine's bucket
        assert_eq!(Arc::strong_count(&engine.remote_bucket), 3);
    }

    #[test]
    fn test_rejects_path_like_labels() {
        let state = TempDir::new().unwrap();
        let engine = engine(&state);
        let mut request = RunRequest::new(state.path());
        request.labels = Some(vec!["../Escaped".into(), "Other".into()]);
        assert_eq!(engine.label_set(&request).unwrap_err().kind(), "config");
    }
}
