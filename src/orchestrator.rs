// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Classification orchestrator
//!
//! Decides per file whether the cache, the local classifier or the remote
//! classifier answers, and runs the per-file pipeline on a bounded worker
//! pool. A failing file never aborts the batch.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::ClassificationCache;
use crate::classifier::{Classifier, LocalClassifier, RemoteClassifier, ResilientClassifier, TokenBucket};
use crate::config::{AppConfig, ClassifierPreference};
use crate::credentials::CredentialStore;
use crate::extract::{Extracted, FeatureExtractor};
use crate::model::{ClassificationResult, ClassifierSource, LabelSet, RunIssue, Verdict, UNCATEGORIZED};
use crate::{Result, TidyfoldError};

/// Per-file progress, emitted as files finish
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Classified {
        path: PathBuf,
        result: ClassificationResult,
        completed: usize,
        total: usize,
    },
    Moved {
        path: PathBuf,
        outcome: crate::reorganize::MoveOutcome,
    },
}

/// Everything the orchestrator decided about one file
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub result: ClassificationResult,
    pub issues: Vec<RunIssue>,
}

/// Result of a batch, in completion order
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub files: Vec<FileOutcome>,
    /// Files never dispatched because the batch was cancelled
    pub skipped: Vec<PathBuf>,
    pub cancelled: bool,
}

pub struct Orchestrator {
    extractor: FeatureExtractor,
    cache: ClassificationCache,
    labels: LabelSet,
    preference: ClassifierPreference,
    threshold: f32,
    workers: usize,
    local: Option<Arc<dyn Classifier>>,
    remote: Option<Arc<dyn Classifier>>,
    /// Remote is part of the configuration, attached or not
    remote_configured: bool,
    /// Set from configuration so credential changes keep the same key
    pinned_version: Option<String>,
    model_version: String,
}

impl Orchestrator {
    pub fn new(
        extractor: FeatureExtractor,
        cache: ClassificationCache,
        labels: LabelSet,
        preference: ClassifierPreference,
        threshold: f32,
        workers: usize,
    ) -> Self {
        let mut orchestrator = Self {
            extractor,
            cache,
            labels,
            preference,
            threshold,
            workers: workers.max(1),
            local: None,
            remote: None,
            remote_configured: false,
            pinned_version: None,
            model_version: String::new(),
        };
        orchestrator.refresh_version();
        orchestrator
    }

    pub fn with_local(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.local = Some(classifier);
        self.refresh_version();
        self
    }

    pub fn with_remote(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.remote = Some(classifier);
        self.refresh_version();
        self
    }

    /// Build from configuration, attaching whichever classifiers the
    /// preference allows and can actually be used
    ///
    /// Classifiers that cannot be attached are reported as issues against
    /// `root` rather than failing the run. The model version reflects the
    /// configuration, so a missing API key does not change cache keys.
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        config: &AppConfig,
        labels: LabelSet,
        preference: ClassifierPreference,
        threshold: f32,
        cache: ClassificationCache,
        credentials: Arc<dyn CredentialStore>,
        bucket: Arc<TokenBucket>,
        root: &Path,
    ) -> (Self, Vec<RunIssue>) {
        let mut issues = Vec::new();
        let mut orchestrator = Self::new(
            FeatureExtractor::new(&config.extraction),
            cache,
            labels,
            preference,
            threshold,
            config.workers,
        );

        // Local also serves as the fallback when remote is preferred
        let floor = config.classifier.local.floor.unwrap_or(threshold);
        match LocalClassifier::load(&config.classifier.local, floor) {
            Ok(local) => orchestrator = orchestrator.with_local(Arc::new(local)),
            Err(e) => {
                warn!("Local classifier unavailable: {}", e);
                issues.push(RunIssue::from_error(root, &e));
            }
        }

        let remote_config = &config.classifier.remote;
        let mut versions: Vec<String> = orchestrator.local.iter().map(|c| c.version()).collect();
        if preference.uses_remote() && remote_config.enabled {
            orchestrator.remote_configured = true;
            versions.push(RemoteClassifier::version_for(remote_config));
            if credentials.has(&remote_config.service_name) {
                match RemoteClassifier::new(remote_config, credentials) {
                    Ok(remote) => {
                        let remote = ResilientClassifier::from_config(remote, remote_config, bucket);
                        orchestrator = orchestrator.with_remote(Arc::new(remote));
                    }
                    Err(e) => issues.push(RunIssue::from_error(root, &e)),
                }
            } else {
                let e = TidyfoldError::CredentialMissing(remote_config.service_name.clone());
                info!("Remote classifier disabled: {}", e);
                issues.push(RunIssue::from_error(root, &e));
            }
        }

        if !versions.is_empty() {
            orchestrator.pinned_version = Some(versions.join("+"));
            orchestrator.refresh_version();
        }
        (orchestrator, issues)
    }

    fn refresh_version(&mut self) {
        if let Some(pinned) = &self.pinned_version {
            self.model_version = pinned.clone();
            return;
        }
        let versions: Vec<String> = [&self.local, &self.remote]
            .into_iter()
            .flatten()
            .map(|c| c.version())
            .collect();
        self.model_version = if versions.is_empty() {
            "none".to_string()
        } else {
            versions.join("+")
        };
    }

    /// Cache key component identifying the classifiers in play
    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn has_local(&self) -> bool {
        self.local.is_some()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Classify a single file; never fails, problems land in `issues`
    pub async fn classify_file(&self, path: &Path) -> FileOutcome {
        let extractor = self.extractor.clone();
        let owned = path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&owned))
            .await
            .unwrap_or_else(|e| {
                Err(TidyfoldError::UnreadableEntry {
                    path: path.to_path_buf(),
                    reason: format!("extraction task failed: {}", e),
                })
            });

        match extracted {
            Ok(extracted) => self.classify_extracted(path, &extracted).await,
            Err(e) => {
                warn!("Routing {} to {}: {}", path.display(), UNCATEGORIZED, e);
                FileOutcome {
                    path: path.to_path_buf(),
                    result: ClassificationResult::uncategorized(None),
                    issues: vec![RunIssue::from_error(path, &e)],
                }
            }
        }
    }

    async fn classify_extracted(&self, path: &Path, extracted: &Extracted) -> FileOutcome {
        let mut issues = Vec::new();
        let fingerprint = &extracted.fingerprint;

        if let Some(manual) = self.cache.lookup_manual(fingerprint) {
            // Only while the chosen label is still one of this run's labels
            let label = self.labels.resolve(&manual.label);
            if label != UNCATEGORIZED || manual.label == UNCATEGORIZED {
                debug!("Manual assignment for {}", path.display());
                return FileOutcome {
                    path: path.to_path_buf(),
                    result: ClassificationResult { label: label.to_string(), ..manual },
                    issues,
                };
            }
        }

        if let Some(hit) = self.cache.lookup(fingerprint, self.labels.id(), &self.model_version) {
            debug!("Cache hit for {}", path.display());
            return FileOutcome {
                path: path.to_path_buf(),
                result: hit,
                issues,
            };
        }

        let text = extracted.feature_text.as_str();
        // The remote should have answered but could not
        let mut degraded = false;
        let decided = match self.preference {
            ClassifierPreference::Remote => {
                match self.run_remote(path, text, &mut issues, &mut degraded).await {
                    Some(verdict) => Some((verdict, ClassifierSource::Remote)),
                    None => self
                        .run_local(path, text, &mut issues)
                        .await
                        .map(|v| (v, ClassifierSource::Local)),
                }
            }
            ClassifierPreference::Local | ClassifierPreference::Both => {
                match self.run_local(path, text, &mut issues).await {
                    Some(local) if local.confidence >= self.threshold => {
                        Some((local, ClassifierSource::Local))
                    }
                    Some(local) => match self.run_remote(path, text, &mut issues, &mut degraded).await {
                        // Ties keep the local answer
                        Some(remote) if remote.confidence > local.confidence => {
                            Some((remote, ClassifierSource::Remote))
                        }
                        _ => Some((local, ClassifierSource::Local)),
                    },
                    None => self
                        .run_remote(path, text, &mut issues, &mut degraded)
                        .await
                        .map(|v| (v, ClassifierSource::Remote)),
                }
            }
        };

        let result = match decided {
            Some((verdict, source)) if degraded => {
                // Not cached: a later run with the remote back should decide
                debug!("Not caching fallback result for {}", path.display());
                ClassificationResult::from_verdict(fingerprint.clone(), verdict, source)
            }
            Some((verdict, source)) => {
                let result = ClassificationResult::from_verdict(fingerprint.clone(), verdict, source);
                if let Err(e) = self
                    .cache
                    .store(fingerprint, self.labels.id(), &self.model_version, &result)
                {
                    warn!("Failed to cache result for {}: {}", path.display(), e);
                    issues.push(RunIssue::from_error(path, &e));
                }
                result
            }
            None => ClassificationResult::uncategorized(Some(fingerprint.clone())),
        };

        debug!(
            "{} -> {} ({:.2}, {})",
            path.display(),
            result.label,
            result.confidence,
            result.source
        );
        FileOutcome {
            path: path.to_path_buf(),
            result,
            issues,
        }
    }

    async fn run_local(&self, path: &Path, text: &str, issues: &mut Vec<RunIssue>) -> Option<Verdict> {
        let local = self.local.as_ref()?;
        match local.classify(text, &self.labels).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                warn!("Local classifier failed on {}: {}", path.display(), e);
                issues.push(RunIssue::from_error(path, &e));
                None
            }
        }
    }

    async fn run_remote(
        &self,
        path: &Path,
        text: &str,
        issues: &mut Vec<RunIssue>,
        degraded: &mut bool,
    ) -> Option<Verdict> {
        let Some(remote) = self.remote.as_ref() else {
            *degraded |= self.remote_configured;
            return None;
        };
        match remote.classify(text, &self.labels).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                *degraded = true;
                warn!("Remote classifier failed on {}, falling back: {}", path.display(), e);
                issues.push(RunIssue::from_error(path, &e));
                None
            }
        }
    }

    /// Classify many files on the worker pool
    ///
    /// Cancellation stops dispatch; files already in flight finish.
    pub async fn classify_batch(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
        cancel: watch::Receiver<bool>,
        events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> BatchOutcome {
        let total = paths.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut join_set: JoinSet<(usize, FileOutcome)> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, PathBuf> = HashMap::new();
        let mut outcome = BatchOutcome::default();

        info!("Classifying {} files with {} workers", total, self.workers);

        let mut pending = paths.into_iter();
        while let Some(path) = pending.next() {
            if *cancel.borrow() {
                outcome.cancelled = true;
                outcome.skipped.push(path);
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                outcome.skipped.push(path);
                break;
            };
            // Acquiring may have waited; check again before dispatch
            if *cancel.borrow() {
                outcome.cancelled = true;
                outcome.skipped.push(path);
                break;
            }

            let orchestrator = Arc::clone(self);
            let completed = completed.clone();
            let events = events.clone();
            let task_path = path.clone();
            let handle = join_set.spawn(async move {
                let _permit = permit;
                let file = orchestrator.classify_file(&path).await;
                let order = completed.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = events {
                    let _ = tx.send(ProgressEvent::Classified {
                        path: file.path.clone(),
                        result: file.result.clone(),
                        completed: order + 1,
                        total,
                    });
                }
                (order, file)
            });
            in_flight.insert(handle.id(), task_path);
        }
        outcome.skipped.extend(pending);

        let mut finished = Vec::with_capacity(total);
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, done)) => {
                    in_flight.remove(&id);
                    finished.push(done);
                }
                Err(e) => {
                    // The file still gets exactly one result
                    let Some(path) = in_flight.remove(&e.id()) else {
                        warn!("Classification task failed: {}", e);
                        continue;
                    };
                    warn!("Classification of {} failed: {}", path.display(), e);
                    let err = TidyfoldError::UnreadableEntry {
                        path: path.clone(),
                        reason: format!("classification task failed: {}", e),
                    };
                    let order = completed.fetch_add(1, Ordering::SeqCst);
                    finished.push((
                        order,
                        FileOutcome {
                            issues: vec![RunIssue::from_error(&path, &err)],
                            result: ClassificationResult::uncategorized(None),
                            path,
                        },
                    ));
                }
            }
        }
        finished.sort_by_key(|(order, _)| *order);
        outcome.files = finished.into_iter().map(|(_, f)| f).collect();

        if outcome.cancelled {
            info!(
                "Batch cancelled: {} classified, {} not dispatched",
                outcome.files.len(),
                outcome.skipped.len()
            );
        }
        outcome
    }

    /// Record a user-chosen label for a file as a manual result
    pub fn assign(&self, path: &Path, label: &str) -> Result<ClassificationResult> {
        let resolved = self.labels.resolve(label);
        if resolved == UNCATEGORIZED && !label.trim().eq_ignore_ascii_case(UNCATEGORIZED) {
            return Err(TidyfoldError::Config(format!(
                "'{}' is not one of the categories: {}",
                label,
                self.labels.labels().join(", ")
            )));
        }

        let extracted = self.extractor.extract(path)?;
        let result = ClassificationResult::from_verdict(
            extracted.fingerprint.clone(),
            Verdict::new(resolved, 1.0),
            ClassifierSource::Manual,
        );
        self.cache.store_manual(&extracted.fingerprint, &result)?;
        info!("Assigned {} to {}", path.display(), resolved);
        Ok(result)
    }
}
