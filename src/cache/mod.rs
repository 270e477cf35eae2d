// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Persistent classification cache
//!
//! Entries are keyed by (fingerprint, label set id, model version). The SQLite
//! file is the durable copy; an in-memory index serves lookups so readers
//! never wait on the writer. All writes go through one connection lock.
//!
//! The cache is never authoritative: if the file cannot be opened or fails
//! its integrity check it is thrown away and rebuilt empty.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::model::{ClassificationResult, ClassifierSource, Fingerprint};
use crate::{Result, TidyfoldError};

/// Label set id and model version manual assignments are stored under, so
/// they hold regardless of which classifiers a run uses
pub const MANUAL_KEY: &str = "manual";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    fingerprint: String,
    label_set_id: String,
    model_version: String,
}

#[derive(Debug, Clone)]
struct CachedResult {
    label: String,
    confidence: f32,
    source: ClassifierSource,
    timestamp: DateTime<Utc>,
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub by_source: BTreeMap<String, usize>,
    pub configurations: usize,
}

/// Thread-safe classification cache handle
#[derive(Clone)]
pub struct ClassificationCache {
    conn: Arc<Mutex<Connection>>,
    entries: Arc<RwLock<HashMap<CacheKey, CachedResult>>>,
    rebuilt: Option<String>,
}

impl ClassificationCache {
    /// Open the cache file, rebuilding it empty if it is unusable
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        match Self::load(Connection::open(path)) {
            Ok((conn, entries)) => {
                debug!("Loaded {} cached classifications from {:?}", entries.len(), path);
                Ok(Self::from_parts(conn, entries, None))
            }
            Err(e) => {
                warn!("Classification cache at {:?} is unusable ({}), rebuilding", path, e);
                discard_files(path)?;
                let (conn, entries) = Self::load(Connection::open(path))?;
                Ok(Self::from_parts(conn, entries, Some(e.to_string())))
            }
        }
    }

    /// Open an in-memory cache (for testing and dry runs without persistence)
    pub fn in_memory() -> Result<Self> {
        let (conn, entries) = Self::load(Connection::open_in_memory())?;
        Ok(Self::from_parts(conn, entries, None))
    }

    fn from_parts(
        conn: Connection,
        entries: HashMap<CacheKey, CachedResult>,
        rebuilt: Option<String>,
    ) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            entries: Arc::new(RwLock::new(entries)),
            rebuilt,
        }
    }

    fn load(
        conn: rusqlite::Result<Connection>,
    ) -> Result<(Connection, HashMap<CacheKey, CachedResult>)> {
        let conn = conn?;
        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(TidyfoldError::CacheCorrupt(check));
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS classifications (
                fingerprint TEXT NOT NULL,
                label_set_id TEXT NOT NULL,
                model_version TEXT NOT NULL,
                label TEXT NOT NULL,
                confidence REAL NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (fingerprint, label_set_id, model_version)
            );
        "#,
        )?;

        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        {
            let mut stmt = conn.prepare(
                "SELECT fingerprint, label_set_id, model_version, label, confidence, source, created_at
                 FROM classifications",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            for row in rows {
                let (fingerprint, label_set_id, model_version, label, confidence, source, created) = row?;
                let source = ClassifierSource::parse(&source);
                let timestamp = DateTime::parse_from_rfc3339(&created).map(|dt| dt.with_timezone(&Utc));
                match (source, timestamp) {
                    (Some(source), Ok(timestamp)) if (0.0..=1.0).contains(&confidence) => {
                        entries.insert(
                            CacheKey { fingerprint, label_set_id, model_version },
                            CachedResult {
                                label,
                                confidence: confidence as f32,
                                source,
                                timestamp,
                            },
                        );
                    }
                    _ => skipped += 1,
                }
            }
        }
        if skipped > 0 {
            warn!("Ignored {} malformed cache rows", skipped);
        }

        Ok((conn, entries))
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TidyfoldError::CacheCorrupt("cache lock poisoned".to_string()))
    }

    /// Reason the cache had to be rebuilt on open, if it was
    pub fn rebuilt_reason(&self) -> Option<&str> {
        self.rebuilt.as_deref()
    }

    /// Look up a prior result; a hit comes back with source "cache"
    pub fn lookup(
        &self,
        fingerprint: &Fingerprint,
        label_set_id: &str,
        model_version: &str,
    ) -> Option<ClassificationResult> {
        let key = CacheKey {
            fingerprint: fingerprint.as_str().to_string(),
            label_set_id: label_set_id.to_string(),
            model_version: model_version.to_string(),
        };
        let entries = self.entries.read().ok()?;
        entries.get(&key).map(|hit| ClassificationResult {
            fingerprint: Some(fingerprint.clone()),
            label: hit.label.clone(),
            confidence: hit.confidence,
            source: ClassifierSource::Cache,
            timestamp: hit.timestamp,
        })
    }

    /// Store a result, replacing any entry under the same key
    pub fn store(
        &self,
        fingerprint: &Fingerprint,
        label_set_id: &str,
        model_version: &str,
        result: &ClassificationResult,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO classifications
               (fingerprint, label_set_id, model_version, label, confidence, source, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                fingerprint.as_str(),
                label_set_id,
                model_version,
                result.label,
                result.confidence as f64,
                result.source.as_str(),
                result.timestamp.to_rfc3339(),
            ],
        )?;

        // Index updated while the writer lock is still held so the file
        // and the index agree on the order of writes
        let mut entries = self
            .entries
            .write()
            .map_err(|_| TidyfoldError::CacheCorrupt("cache index poisoned".to_string()))?;
        entries.insert(
            CacheKey {
                fingerprint: fingerprint.as_str().to_string(),
                label_set_id: label_set_id.to_string(),
                model_version: model_version.to_string(),
            },
            CachedResult {
                label: result.label.clone(),
                confidence: result.confidence,
                source: result.source,
                timestamp: result.timestamp,
            },
        );
        Ok(())
    }

    /// A user's manual label for this fingerprint, if any
    pub fn lookup_manual(&self, fingerprint: &Fingerprint) -> Option<ClassificationResult> {
        self.lookup(fingerprint, MANUAL_KEY, MANUAL_KEY)
    }

    pub fn store_manual(&self, fingerprint: &Fingerprint, result: &ClassificationResult) -> Result<()> {
        self.store(fingerprint, MANUAL_KEY, MANUAL_KEY, result)
    }

    /// Drop every entry
    pub fn clear(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM classifications", [])?;
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
        info!("Cleared {} cached classifications", removed);
        Ok(removed)
    }

    /// Drop entries made under any other label set or model version
    ///
    /// Manual assignments are kept.
    pub fn prune_except(&self, label_set_id: &str, model_version: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM classifications
             WHERE (label_set_id != ?1 OR model_version != ?2) AND model_version != ?3",
            params![label_set_id, model_version, MANUAL_KEY],
        )?;
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|k, _| {
                k.model_version == MANUAL_KEY
                    || (k.label_set_id == label_set_id && k.model_version == model_version)
            });
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = match self.entries.read() {
            Ok(e) => e,
            Err(_) => return CacheStats::default(),
        };
        let mut by_source = BTreeMap::new();
        let mut configurations = std::collections::HashSet::new();
        for (key, value) in entries.iter() {
            *by_source.entry(value.source.to_string()).or_insert(0) += 1;
            configurations.insert((&key.label_set_id, &key.model_version));
        }
        CacheStats {
            entries: entries.len(),
            by_source,
            configurations: configurations.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remove a cache file and its SQLite side files
fn discard_files(path: &Path) -> Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut p = path.as_os_str().to_owned();
        p.push(suffix);
        candidates.push(PathBuf::from(p));
    }
    for p in candidates {
        match std::fs::remove_file(&p) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Verdict;
    use tempfile::TempDir;

    fn result(label: &str, confidence: f32, source: ClassifierSource) -> ClassificationResult {
        ClassificationResult::from_verdict(Fingerprint::new("fp"), Verdict::new(label, confidence), source)
    }

    #[test]
    fn test_hit_requires_full_key() {
        let cache = ClassificationCache::in_memory().unwrap();
        let fp = Fingerprint::new("abc");
        cache.store(&fp, "set-a", "keyword-v1", &result("Documents", 0.92, ClassifierSource::Local)).unwrap();

        let hit = cache.lookup(&fp, "set-a", "keyword-v1").unwrap();
        assert_eq!(hit.label, "Documents");
        assert_eq!(hit.confidence, 0.92);
        assert_eq!(hit.source, ClassifierSource::Cache);

        assert!(cache.lookup(&fp, "set-b", "keyword-v1").is_none());
        assert!(cache.lookup(&fp, "set-a", "keyword-v2").is_none());
        assert!(cache.lookup(&Fingerprint::new("zzz"), "set-a", "keyword-v1").is_none());
    }

    #[test]
    fn test_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let fp = Fingerprint::new("abc");
        {
            let cache = ClassificationCache::open(&path).unwrap();
            cache.store(&fp, "s", "m", &result("Photos", 0.88, ClassifierSource::Remote)).unwrap();
        }
        let cache = ClassificationCache::open(&path).unwrap();
        assert!(cache.rebuilt_reason().is_none());
        let hit = cache.lookup(&fp, "s", "m").unwrap();
        assert_eq!(hit.label, "Photos");
        assert_eq!(hit.confidence, 0.88);
    }

    #[test]
    fn test_corrupt_file_rebuilds_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        std::fs::write(&path, b"definitely not an sqlite database ".repeat(64)).unwrap();

        let cache = ClassificationCache::open(&path).unwrap();
        assert!(cache.rebuilt_reason().is_some());
        assert!(cache.is_empty());

        cache.store(&Fingerprint::new("x"), "s", "m", &result("Other", 0.5, ClassifierSource::Local)).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_prune_and_clear() {
        let cache = ClassificationCache::in_memory().unwrap();
        let r = result("Documents", 0.7, ClassifierSource::Local);
        cache.store(&Fingerprint::new("a"), "s1", "m1", &r).unwrap();
        cache.store(&Fingerprint::new("b"), "s1", "m2", &r).unwrap();
        cache.store(&Fingerprint::new("c"), "s2", "m1", &r).unwrap();
        assert_eq!(cache.stats().configurations, 3);

        assert_eq!(cache.prune_except("s1", "m1").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&Fingerprint::new("a"), "s1", "m1").is_some());

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_manual_entries_survive_prune() {
        let cache = ClassificationCache::in_memory().unwrap();
        let fp = Fingerprint::new("a");
        cache.store(&fp, "s1", "m1", &result("Documents", 0.7, ClassifierSource::Local)).unwrap();
        cache.store_manual(&fp, &result("Photos", 1.0, ClassifierSource::Manual)).unwrap();

        assert_eq!(cache.prune_except("s2", "m2").unwrap(), 1);
        let manual = cache.lookup_manual(&fp).unwrap();
        assert_eq!(manual.label, "Photos");
        assert!(cache.lookup(&fp, "s1", "m1").is_none());
    }

    #[test]
    fn test_concurrent_writes_are_serialized() {
        let cache = ClassificationCache::in_memory().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        let fp = Fingerprint::new(format!("{}-{}", i, j % 5));
                        cache
                            .store(&fp, "s", "m", &result("Documents", 0.5, ClassifierSource::Local))
                            .unwrap();
                        let _ = cache.lookup(&fp, "s", "m");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 40);
        assert_eq!(cache.stats().by_source.get("local"), Some(&40));
    }
}
