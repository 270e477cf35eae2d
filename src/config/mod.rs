// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for tidyfold

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::model::validate_label_name;
use crate::{Result, TidyfoldError};

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Category names files are sorted into
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    /// Classifier selection and policy
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Feature extraction budgets
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Directory scan filters
    #[serde(default)]
    pub scan: ScanConfig,

    /// Size of the classification worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Classification cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Undo history settings
    #[serde(default)]
    pub history: HistoryConfig,

    /// Control API settings
    #[serde(default)]
    pub web: WebConfig,
}

/// Which classifiers a run may use
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierPreference {
    Local,
    Remote,
    #[default]
    Both,
}

impl ClassifierPreference {
    pub fn uses_local(self) -> bool {
        matches!(self, Self::Local | Self::Both)
    }

    pub fn uses_remote(self) -> bool {
        matches!(self, Self::Remote | Self::Both)
    }
}

impl FromStr for ClassifierPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown classifier preference '{}' (local|remote|both)", other)),
        }
    }
}

impl fmt::Display for ClassifierPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Both => "both",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub preference: ClassifierPreference,
    /// Local results below this confidence are escalated to the remote classifier
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f32,
    #[serde(default)]
    pub local: LocalModelConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalModelConfig {
    #[serde(default = "default_local_model")]
    pub model: String,
    /// Below this confidence the local classifier answers "Uncategorized".
    /// Falls back to `confidence_threshold` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<f32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_remote_model")]
    pub model: String,
    /// Name the API key is stored under in the credential store
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_calls")]
    pub calls: u32,
    #[serde(default = "default_rate_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionConfig {
    /// Maximum bytes read from any one file
    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,
    /// Maximum characters of feature text handed to a classifier
    #[serde(default = "default_max_feature_chars")]
    pub max_feature_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ScanConfig {
    /// Glob patterns (matched against file names) to leave alone
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

// Default value functions
fn default_categories() -> Vec<String> {
    ["Documents", "Images", "Music", "Other"].into_iter().map(String::from).collect()
}
fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
fn default_threshold() -> f32 { 0.5 }
fn default_local_model() -> String { "keyword".to_string() }
fn default_true() -> bool { true }
fn default_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_remote_model() -> String { "gpt-4o-mini".to_string() }
fn default_service_name() -> String { "openai".to_string() }
fn default_timeout() -> u64 { 30 }
fn default_retries() -> u32 { 3 }
fn default_backoff_ms() -> u64 { 1000 }
fn default_rate_calls() -> u32 { 60 }
fn default_rate_interval() -> u64 { 60 }
fn default_byte_budget() -> usize { 4096 }
fn default_max_feature_chars() -> usize { 512 }
fn default_web_host() -> String { "127.0.0.1".to_string() }
fn default_web_port() -> u16 { 8080 }

fn data_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("tidyfold"))
        .unwrap_or_else(|| PathBuf::from("."))
}
fn default_cache_path() -> PathBuf { data_dir().join("classifications.db") }
fn default_history_path() -> PathBuf { data_dir().join("undo_log.jsonl") }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            classifier: ClassifierConfig::default(),
            extraction: ExtractionConfig::default(),
            scan: ScanConfig::default(),
            workers: default_workers(),
            cache: CacheConfig::default(),
            history: HistoryConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            preference: ClassifierPreference::default(),
            confidence_threshold: default_threshold(),
            local: LocalModelConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            model: default_local_model(),
            floor: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_base_url(),
            model: default_remote_model(),
            service_name: default_service_name(),
            timeout_secs: default_timeout(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls: default_rate_calls(),
            interval_secs: default_rate_interval(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            byte_budget: default_byte_budget(),
            max_feature_chars: default_max_feature_chars(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { path: default_cache_path() }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { path: default_history_path() }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| TidyfoldError::Config(format!("Failed to parse config: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check invariants the rest of the crate relies on
    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            return Err(TidyfoldError::Config("at least one category is required".into()));
        }
        for (i, name) in self.categories.iter().enumerate() {
            validate_category_name(name)?;
            if self.categories[..i].iter().any(|c| c.eq_ignore_ascii_case(name)) {
                return Err(TidyfoldError::Config(format!("duplicate category '{}'", name)));
            }
        }

        let threshold = self.classifier.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(TidyfoldError::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if let Some(floor) = self.classifier.local.floor {
            if !(0.0..=1.0).contains(&floor) {
                return Err(TidyfoldError::Config(format!(
                    "local.floor must be within [0, 1], got {}",
                    floor
                )));
            }
        }
        if self.workers == 0 {
            return Err(TidyfoldError::Config("workers must be at least 1".into()));
        }
        if self.classifier.remote.rate_limit.calls == 0 || self.classifier.remote.rate_limit.interval_secs == 0 {
            return Err(TidyfoldError::Config("rate_limit calls and interval_secs must be non-zero".into()));
        }
        Ok(())
    }

    /// Confidence below which the local classifier answers "Uncategorized"
    pub fn local_floor(&self) -> f32 {
        self.classifier.local.floor.unwrap_or(self.classifier.confidence_threshold)
    }

    pub fn add_category(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        validate_category_name(name)?;
        if self.categories.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            return Err(TidyfoldError::Config(format!("category '{}' already exists", name)));
        }
        self.categories.push(name.to_string());
        Ok(())
    }

    pub fn remove_category(&mut self, name: &str) -> Result<()> {
        let idx = self.category_index(name)?;
        if self.categories.len() == 1 {
            return Err(TidyfoldError::Config("cannot remove the last category".into()));
        }
        self.categories.remove(idx);
        Ok(())
    }

    pub fn rename_category(&mut self, from: &str, to: &str) -> Result<()> {
        let idx = self.category_index(from)?;
        let to = to.trim();
        validate_category_name(to)?;
        if self
            .categories
            .iter()
            .enumerate()
            .any(|(i, c)| i != idx && c.eq_ignore_ascii_case(to))
        {
            return Err(TidyfoldError::Config(format!("category '{}' already exists", to)));
        }
        self.categories[idx] = to.to_string();
        Ok(())
    }

    fn category_index(&self, name: &str) -> Result<usize> {
        self.categories
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| TidyfoldError::Config(format!("no category named '{}'", name)))
    }
}

/// Category names become folder names, so keep them to a single path component
fn validate_category_name(name: &str) -> Result<()> {
    validate_label_name(name).map_err(|e| match e {
        TidyfoldError::Config(reason) => TidyfoldError::Config(format!("category {}", reason)),
        other => other,
    })
}
