// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Directory scanning and feature extraction
//!
//! A scan lists the candidate files directly under a root directory. Each
//! candidate is then snapshotted into a [`FileEntry`] with a bounded read, and
//! the entry is reduced to a [`Fingerprint`] and a feature text for the
//! classifiers.

use glob::Pattern;
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::config::{ExtractionConfig, ScanConfig};
use crate::model::{FileEntry, Fingerprint};
use crate::{Result, TidyfoldError};

/// Candidate files found under a root
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: Vec<PathBuf>,
    /// Symlinks, devices, sockets and the like
    pub unsupported: Vec<PathBuf>,
}

/// List regular files directly inside `root`, sorted by path.
///
/// Sub-directories are left alone (they include the category folders of
/// earlier runs).
pub fn scan_root(root: &Path, config: &ScanConfig) -> Result<ScanOutcome> {
    let excludes = config
        .exclude
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| TidyfoldError::Config(format!("bad exclude pattern '{}': {}", p, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let entries = fs::read_dir(root).map_err(|e| TidyfoldError::InvalidRoot {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut outcome = ScanOutcome::default();
    for entry in entries {
        let entry = entry.map_err(|e| TidyfoldError::InvalidRoot {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        let path = entry.path();

        if !should_process(&path, config.include_hidden) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if excludes.iter().any(|p| p.matches(name)) {
                debug!("Excluded by pattern: {:?}", path);
                continue;
            }
        }

        match entry.file_type() {
            Ok(ft) if ft.is_dir() => continue,
            Ok(ft) if ft.is_file() => outcome.files.push(path),
            Ok(_) => outcome.unsupported.push(path),
            // Let the extractor report it with a proper reason
            Err(_) => outcome.files.push(path),
        }
    }

    outcome.files.sort();
    outcome.unsupported.sort();
    Ok(outcome)
}

/// Check if a file should be considered at all
pub fn should_process(path: &Path, include_hidden: bool) -> bool {
    let filename = match path.file_name().and_then(|n| n.to_str()) {
        // Non-UTF-8 names still go through so the extractor can report them
        None => return path.file_name().is_some(),
        Some(n) => n,
    };

    if !include_hidden && filename.starts_with('.') {
        return false;
    }

    // Skip temporary files
    let temp_extensions = [".tmp", ".part", ".crdownload", ".partial", ".download"];
    if temp_extensions.iter().any(|ext| filename.ends_with(ext)) {
        return false;
    }

    // Skip system files
    let skip_names = ["desktop.ini", "thumbs.db", ".ds_store"];
    if skip_names.iter().any(|n| filename.eq_ignore_ascii_case(n)) {
        return false;
    }

    true
}

/// Turns files into fingerprints and classifier input
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    byte_budget: usize,
    max_feature_chars: usize,
}

impl FeatureExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            byte_budget: config.byte_budget,
            max_feature_chars: config.max_feature_chars.max(1),
        }
    }

    /// Snapshot a file, reading at most the byte budget
    pub fn snapshot(&self, path: &Path) -> Result<FileEntry> {
        let unreadable = |reason: String| TidyfoldError::UnreadableEntry {
            path: path.to_path_buf(),
            reason,
        };

        let meta = fs::symlink_metadata(path).map_err(|e| unreadable(e.to_string()))?;
        if !meta.file_type().is_file() {
            return Err(TidyfoldError::UnsupportedEntry(path.to_path_buf()));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| unreadable("file name is not valid UTF-8".to_string()))?
            .to_string();

        let mut head = Vec::with_capacity(self.byte_budget.min(64 * 1024));
        File::open(path)
            .and_then(|f| f.take(self.byte_budget as u64).read_to_end(&mut head))
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => unreadable("permission denied".to_string()),
                _ => unreadable(e.to_string()),
            })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        Ok(FileEntry {
            path: path.to_path_buf(),
            file_name,
            size: meta.len(),
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
            extension,
            snippet: decode_snippet(&head),
            snippet_digest: blake3::hash(&head).to_hex().to_string(),
        })
    }

    /// Content-derived identifier; the path plays no part
    pub fn fingerprint(entry: &FileEntry) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&entry.size.to_le_bytes());
        hasher.update(&mtime_nanos(entry.modified).to_le_bytes());
        hasher.update(entry.extension.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(entry.snippet_digest.as_bytes());
        Fingerprint::new(hasher.finalize().to_hex().to_string())
    }

    /// Filename tokens, extension and snippet, capped at the feature budget
    pub fn feature_text(&self, entry: &FileEntry) -> String {
        let stem = match entry.file_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => entry.file_name.as_str(),
        };

        let mut text = name_tokens(stem).join(" ");
        if !entry.extension.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&entry.extension);
        }

        let snippet = entry.snippet.split_whitespace().collect::<Vec<_>>().join(" ");
        if !snippet.is_empty() {
            text.push('\n');
            text.push_str(&snippet);
        }

        truncate_chars(&text, self.max_feature_chars)
    }

    /// Snapshot plus fingerprint and feature text in one go
    pub fn extract(&self, path: &Path) -> Result<Extracted> {
        let entry = self.snapshot(path)?;
        let fingerprint = Self::fingerprint(&entry);
        let feature_text = self.feature_text(&entry);
        Ok(Extracted { entry, fingerprint, feature_text })
    }
}

/// Output of [`FeatureExtractor::extract`]
#[derive(Debug, Clone)]
pub struct Extracted {
    pub entry: FileEntry,
    pub fingerprint: Fingerprint,
    pub feature_text: String,
}

/// Text of the head bytes, or empty when they look binary
fn decode_snippet(head: &[u8]) -> String {
    if head.contains(&0) {
        return String::new();
    }
    match std::str::from_utf8(head) {
        Ok(s) => s.to_string(),
        // A multi-byte character cut off by the byte budget
        Err(e) if e.error_len().is_none() => {
            String::from_utf8_lossy(&head[..e.valid_up_to()]).into_owned()
        }
        Err(_) => String::new(),
    }
}

/// Split a file stem into lowercase words: separators, digit runs and camelCase
fn name_tokens(stem: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for part in stem.split(|c: char| !c.is_alphanumeric()) {
        let mut current = String::new();
        let mut prev: Option<char> = None;
        for c in part.chars() {
            let boundary = match prev {
                Some(p) => {
                    (p.is_lowercase() && c.is_uppercase())
                        || (p.is_alphabetic() && c.is_numeric())
                        || (p.is_numeric() && c.is_alphabetic())
                }
                None => false,
            };
            if boundary && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            current.extend(c.to_lowercase());
            prev = Some(c);
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens.retain(|t| !t.chars().all(|c| c.is_numeric()));
    tokens
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn mtime_nanos(t: SystemTime) -> i128 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}
