// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Core data model shared by extraction, classification and reorganization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::{Result, TidyfoldError};

/// Reserved label for files no classifier could place
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Immutable snapshot of a regular file taken at scan time
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub modified: SystemTime,
    /// Lowercase extension without the dot, empty when absent
    pub extension: String,
    /// Leading text of the file, empty for binary content
    pub snippet: String,
    /// blake3 of the raw bytes the snippet was read from
    pub snippet_digest: String,
}

/// Path-independent identifier for a file's content characteristics
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A label becomes a folder directly under the root, so it must be one plain
/// path segment.
pub fn validate_label_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TidyfoldError::Config("labels cannot be blank".into()));
    }
    if name.eq_ignore_ascii_case(UNCATEGORIZED) {
        return Err(TidyfoldError::Config(format!("'{}' is reserved", UNCATEGORIZED)));
    }
    let mut components = Path::new(name).components();
    let single_segment = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_segment || name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(TidyfoldError::Config(format!(
            "label '{}' must be a plain folder name",
            name
        )));
    }
    Ok(())
}

/// Ordered category names for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<String>,
    id: String,
}

impl LabelSet {
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels
            .into_iter()
            .map(|l| l.into().trim().to_string())
            .collect();

        if labels.is_empty() {
            return Err(TidyfoldError::Config("label set cannot be empty".into()));
        }
        for (i, label) in labels.iter().enumerate() {
            validate_label_name(label)?;
            if labels[..i].iter().any(|l| l.eq_ignore_ascii_case(label)) {
                return Err(TidyfoldError::Config(format!("duplicate label '{}'", label)));
            }
        }

        let mut hasher = blake3::Hasher::new();
        for label in &labels {
            hasher.update(label.as_bytes());
            hasher.update(&[0x1f]);
        }
        let id = hasher.finalize().to_hex()[..16].to_string();

        Ok(Self { labels, id })
    }

    /// Stable identity of this exact ordered set
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Map a free-form label onto the set (case-insensitive), or "Uncategorized"
    pub fn resolve(&self, raw: &str) -> &str {
        let raw = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '.');
        self.labels
            .iter()
            .find(|l| l.eq_ignore_ascii_case(raw))
            .map(String::as_str)
            .unwrap_or(UNCATEGORIZED)
    }
}

/// Where a classification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierSource {
    Local,
    Remote,
    Cache,
    Manual,
    None,
}

impl ClassifierSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Cache => "cache",
            Self::Manual => "manual",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            "cache" => Some(Self::Cache),
            "manual" => Some(Self::Manual),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for ClassifierSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw answer of a single classifier call
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub label: String,
    pub confidence: f32,
}

impl Verdict {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: clamp_confidence(confidence),
        }
    }

    pub fn uncategorized(confidence: f32) -> Self {
        Self::new(UNCATEGORIZED, confidence)
    }
}

/// Final classification of one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Absent when the file could not be read far enough to fingerprint it
    pub fingerprint: Option<Fingerprint>,
    pub label: String,
    pub confidence: f32,
    pub source: ClassifierSource,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationResult {
    pub fn from_verdict(fingerprint: Fingerprint, verdict: Verdict, source: ClassifierSource) -> Self {
        Self {
            fingerprint: Some(fingerprint),
            label: verdict.label,
            confidence: verdict.confidence,
            source,
            timestamp: Utc::now(),
        }
    }

    /// Result for files no classifier could handle
    pub fn uncategorized(fingerprint: Option<Fingerprint>) -> Self {
        Self {
            fingerprint,
            label: UNCATEGORIZED.to_string(),
            confidence: 0.0,
            source: ClassifierSource::None,
            timestamp: Utc::now(),
        }
    }
}

/// Non-fatal problem recorded against a path during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIssue {
    pub path: PathBuf,
    pub kind: String,
    pub message: String,
}

impl RunIssue {
    pub fn new(path: impl Into<PathBuf>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn from_error(path: impl Into<PathBuf>, err: &TidyfoldError) -> Self {
        Self::new(path, err.kind(), err.to_string())
    }
}

/// Keep scores inside [0, 1]; NaN counts as no confidence
pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
