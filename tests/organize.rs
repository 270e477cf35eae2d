// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! End-to-end runs against real directories

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;

use tidyfold::cache::ClassificationCache;
use tidyfold::classifier::{LocalClassifier, ZeroShotModel};
use tidyfold::config::{AppConfig, ClassifierPreference, ExtractionConfig};
use tidyfold::credentials::MemoryStore;
use tidyfold::extract::FeatureExtractor;
use tidyfold::history::UndoLog;
use tidyfold::model::{ClassifierSource, LabelSet, UNCATEGORIZED};
use tidyfold::orchestrator::Orchestrator;
use tidyfold::run::{Engine, RunRequest};

/// Fixed confidences keyed by a word in the file name
struct TableModel {
    rows: Vec<(&'static str, &'static str, f32)>,
}

impl ZeroShotModel for TableModel {
    fn version(&self) -> &str {
        "table-v1"
    }

    fn score(&mut self, text: &str, labels: &[String]) -> tidyfold::Result<Vec<f32>> {
        let name_line = text.lines().next().unwrap_or_default();
        let hit = self.rows.iter().find(|(word, _, _)| name_line.contains(word));
        Ok(labels
            .iter()
            .map(|label| match hit {
                Some((_, l, c)) if l == label => *c,
                _ => 0.0,
            })
            .collect())
    }
}

fn scenario_model() -> TableModel {
    TableModel {
        rows: vec![
            ("invoice", "Documents", 0.92),
            ("vacation", "Photos", 0.88),
            ("notes", "Documents", 0.3),
        ],
    }
}

struct Fixture {
    root: TempDir,
    _state: TempDir,
    engine: Engine,
    cache: ClassificationCache,
}

fn fixture(configure: impl FnOnce(&mut AppConfig)) -> Fixture {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.categories = vec!["Documents".into(), "Photos".into()];
    config.classifier.remote.enabled = false;
    config.cache.path = state.path().join("cache.db");
    config.history.path = state.path().join("undo.jsonl");
    configure(&mut config);

    let cache = ClassificationCache::open(&config.cache.path).unwrap();
    let history = Arc::new(UndoLog::open(&config.history.path).unwrap());
    let engine = Engine::with_parts(config, cache.clone(), history, Arc::new(MemoryStore::new()));
    Fixture {
        root,
        _state: state,
        engine,
        cache,
    }
}

fn orchestrator(fx: &Fixture) -> Arc<Orchestrator> {
    let local = LocalClassifier::with_model(scenario_model(), 0.5).unwrap();
    Arc::new(
        Orchestrator::new(
            FeatureExtractor::new(&ExtractionConfig::default()),
            fx.cache.clone(),
            LabelSet::new(["Documents", "Photos"]).unwrap(),
            ClassifierPreference::Local,
            0.5,
            4,
        )
        .with_local(Arc::new(local)),
    )
}

fn populate(root: &Path) {
    fs::write(root.join("invoice_2023.pdf"), b"%PDF-1.4 invoice total 120 EUR").unwrap();
    fs::write(root.join("vacation.jpg"), b"\xff\xd8\xff\xe0 not really a jpeg").unwrap();
    fs::write(root.join("notes.txt"), b"remember to buy milk").unwrap();
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

fn not_cancelled() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the test's duration
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn test_example_layout() {
    let fx = fixture(|_| {});
    populate(fx.root.path());

    let summary = fx
        .engine
        .run_with(orchestrator(&fx), RunRequest::new(fx.root.path()), Vec::new(), not_cancelled(), None)
        .await
        .unwrap();

    let root = fx.root.path();
    assert!(root.join("Documents/invoice_2023.pdf").exists());
    assert!(root.join("Photos/vacation.jpg").exists());
    assert!(root.join(UNCATEGORIZED).join("notes.txt").exists());
    assert!(!root.join("notes.txt").exists());

    assert_eq!(summary.moved, 3);
    assert_eq!(summary.counts["Documents"], 1);
    assert_eq!(summary.counts["Photos"], 1);
    assert_eq!(summary.counts[UNCATEGORIZED], 1);
    assert!(summary.issues.is_empty(), "{:?}", summary.issues);
    assert!(summary.batch_id.is_some());
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let fx = fixture(|_| {});
    populate(fx.root.path());
    let mut request = RunRequest::new(fx.root.path());
    request.dry_run = true;

    let first = fx
        .engine
        .run_with(orchestrator(&fx), request.clone(), Vec::new(), not_cancelled(), None)
        .await
        .unwrap();
    let second = fx
        .engine
        .run_with(orchestrator(&fx), request, Vec::new(), not_cancelled(), None)
        .await
        .unwrap();

    assert!(first.files.iter().all(|f| f.result.source == ClassifierSource::Local));
    assert!(second.files.iter().all(|f| f.result.source == ClassifierSource::Cache));
    for file in &first.files {
        let again = second.files.iter().find(|f| f.path == file.path).unwrap();
        assert_eq!(again.result.label, file.result.label);
        assert_eq!(again.result.confidence, file.result.confidence);
    }
    // Dry runs leave the tree alone and record nothing
    assert!(fx.root.path().join("notes.txt").exists());
    assert!(fx.engine.history().batches().unwrap().is_empty());
}

#[tokio::test]
async fn test_undo_restores_original_tree() {
    let fx = fixture(|_| {});
    populate(fx.root.path());
    // A pre-existing file forces a suffixed destination
    fs::create_dir(fx.root.path().join("Photos")).unwrap();
    fs::write(fx.root.path().join("Photos/vacation.jpg"), b"older photo").unwrap();
    let before = snapshot_tree(fx.root.path());

    let summary = fx
        .engine
        .run_with(orchestrator(&fx), RunRequest::new(fx.root.path()), Vec::new(), not_cancelled(), None)
        .await
        .unwrap();
    assert!(fx.root.path().join("Photos/vacation_1.jpg").exists());

    let report = fx.engine.undo(None, false).unwrap();
    assert_eq!(Some(report.batch_id.clone()), summary.batch_id);
    assert!(report.is_clean());
    assert_eq!(report.restored.len(), 3);
    assert_eq!(snapshot_tree(fx.root.path()), before);
    assert!(!fx.root.path().join("Documents").exists());
    assert!(!fx.root.path().join(UNCATEGORIZED).exists());

    // Nothing left to undo
    assert!(fx.engine.undo(None, false).is_err());
}

#[tokio::test]
async fn test_failed_moves_never_lose_files() {
    // "Documents" exists as a plain file, so nothing can move into it
    let fx = fixture(|config| config.scan.exclude = vec!["Documents".into()]);
    populate(fx.root.path());
    fs::write(fx.root.path().join("Documents"), b"in the way").unwrap();
    let names = ["invoice_2023.pdf", "vacation.jpg", "notes.txt"];

    let summary = fx
        .engine
        .run_with(orchestrator(&fx), RunRequest::new(fx.root.path()), Vec::new(), not_cancelled(), None)
        .await
        .unwrap();

    assert_eq!(summary.moved, 2);
    assert_eq!(summary.issues.len(), 1);
    assert_eq!(summary.issues[0].kind, "destination_conflict");

    let tree = snapshot_tree(fx.root.path());
    for name in names {
        let copies = tree
            .iter()
            .filter(|(path, _)| path.file_name().and_then(|n| n.to_str()) == Some(name))
            .count();
        assert_eq!(copies, 1, "{} should exist exactly once", name);
    }
    assert!(fx.root.path().join("invoice_2023.pdf").exists());
}

#[tokio::test]
async fn test_cancelled_run_moves_nothing() {
    let fx = fixture(|_| {});
    populate(fx.root.path());
    let before = snapshot_tree(fx.root.path());
    let (tx, rx) = watch::channel(true);

    let summary = fx
        .engine
        .run_with(orchestrator(&fx), RunRequest::new(fx.root.path()), Vec::new(), rx, None)
        .await
        .unwrap();
    drop(tx);

    assert!(summary.cancelled);
    assert_eq!(summary.moved, 0);
    assert_eq!(snapshot_tree(fx.root.path()), before);
}

#[tokio::test]
async fn test_missing_root_is_fatal() {
    let fx = fixture(|_| {});
    let err = fx
        .engine
        .run_with(
            orchestrator(&fx),
            RunRequest::new(fx.root.path().join("missing")),
            Vec::new(),
            not_cancelled(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_root");
}

#[tokio::test]
async fn test_corrupt_cache_is_rebuilt_and_reported() {
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.db");
    fs::write(&cache_path, b"definitely not an sqlite database ".repeat(64)).unwrap();

    let fx = fixture(|config| config.cache.path = cache_path.clone());
    populate(fx.root.path());
    let mut request = RunRequest::new(fx.root.path());
    request.dry_run = true;

    let summary = fx
        .engine
        .run_with(orchestrator(&fx), request.clone(), Vec::new(), not_cancelled(), None)
        .await
        .unwrap();
    assert!(summary.issues.iter().any(|i| i.kind == "cache_corrupt"));
    assert_eq!(summary.total_files, 3);

    // Reported once per engine
    let again = fx
        .engine
        .run_with(orchestrator(&fx), request, Vec::new(), not_cancelled(), None)
        .await
        .unwrap();
    assert!(!again.issues.iter().any(|i| i.kind == "cache_corrupt"));
}

#[tokio::test]
async fn test_configured_run_without_api_key_stays_local() {
    let fx = fixture(|config| {
        config.categories = vec!["Documents".into(), "Images".into()];
        config.classifier.remote.enabled = true;
        config.classifier.preference = ClassifierPreference::Both;
    });
    fs::write(fx.root.path().join("beach_vacation.png"), b"\x89PNG\r\n").unwrap();

    let mut request = RunRequest::new(fx.root.path());
    request.dry_run = true;
    let summary = fx.engine.run(request, not_cancelled(), None).await.unwrap();

    assert!(summary.issues.iter().any(|i| i.kind == "credential_missing"));
    assert_eq!(summary.files[0].result.label, "Images");
    assert_eq!(summary.files[0].result.source, ClassifierSource::Local);
}

#[tokio::test]
async fn test_path_like_labels_are_rejected_before_anything_moves() {
    let fx = fixture(|_| {});
    let inbox = fx.root.path().join("inbox");
    fs::create_dir(&inbox).unwrap();
    fs::write(inbox.join("escaped.xyz"), b"stay put").unwrap();

    for labels in [vec!["../Escaped", "Other"], vec!["/tmp/abs", "Other"], vec!["a/b"]] {
        let mut request = RunRequest::new(&inbox);
        request.labels = Some(labels.iter().map(|l| l.to_string()).collect());
        let err = fx.engine.run(request, not_cancelled(), None).await.unwrap_err();
        assert_eq!(err.kind(), "config", "{:?}", labels);
    }

    assert!(inbox.join("escaped.xyz").exists());
    assert!(!fx.root.path().join("Escaped").exists());
    assert!(fx.engine.history().batches().unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_assignment_survives_a_different_preference() {
    let fx = fixture(|config| {
        config.categories = vec!["Documents".into(), "Images".into()];
    });
    let file = fx.root.path().join("holiday.png");
    fs::write(&file, b"\x89PNG\r\n").unwrap();

    let assigned = fx.engine.assign(&file, "documents").unwrap();
    assert_eq!(assigned.label, "Documents");

    let mut request = RunRequest::new(fx.root.path());
    request.dry_run = true;
    request.preference = Some(ClassifierPreference::Local);
    request.labels = Some(vec!["Images".into(), "Documents".into(), "Music".into()]);
    let summary = fx.engine.run(request, not_cancelled(), None).await.unwrap();

    assert_eq!(summary.files[0].result.label, "Documents");
    assert_eq!(summary.files[0].result.source, ClassifierSource::Cache);
}
