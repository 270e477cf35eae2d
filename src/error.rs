// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for tidyfold

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tidyfold operations
pub type Result<T> = std::result::Result<T, TidyfoldError>;

/// tidyfold error types
#[derive(Error, Debug)]
pub enum TidyfoldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported entry: {0}")]
    UnsupportedEntry(PathBuf),

    #[error("Unreadable entry {path}: {reason}")]
    UnreadableEntry { path: PathBuf, reason: String },

    #[error("No credential stored for service '{0}'")]
    CredentialMissing(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("Remote classifier request failed (retryable): {0}")]
    RemoteTransient(String),

    #[error("Remote classifier rejected the request: {0}")]
    RemoteRejected(String),

    #[error("Remote classifier unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Local model error: {0}")]
    LocalModel(String),

    #[error("Classification cache corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Destination already taken: {0}")]
    DestinationConflict(PathBuf),

    #[error("Undo conflict at {path}: {reason}")]
    UndoConflict { path: PathBuf, reason: String },

    #[error("Invalid root directory {path}: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("A run is already moving files in {0}")]
    RunInProgress(PathBuf),
}

impl TidyfoldError {
    /// Whether a remote call that failed with this error may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            TidyfoldError::RemoteTransient(_) => true,
            TidyfoldError::Api(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Short machine-readable name, used in run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            TidyfoldError::Config(_) => "config",
            TidyfoldError::FileSystem(_) => "file_system",
            TidyfoldError::Api(_) => "api",
            TidyfoldError::Database(_) => "database",
            TidyfoldError::Json(_) => "json",
            TidyfoldError::UnsupportedEntry(_) => "unsupported_entry",
            TidyfoldError::UnreadableEntry { .. } => "unreadable_entry",
            TidyfoldError::CredentialMissing(_) => "credential_missing",
            TidyfoldError::Credential(_) => "credential",
            TidyfoldError::RemoteTransient(_) => "remote_transient",
            TidyfoldError::RemoteRejected(_) => "remote_rejected",
            TidyfoldError::RemoteUnavailable(_) => "remote_unavailable",
            TidyfoldError::LocalModel(_) => "local_model",
            TidyfoldError::CacheCorrupt(_) => "cache_corrupt",
            TidyfoldError::DestinationConflict(_) => "destination_conflict",
            TidyfoldError::UndoConflict { .. } => "undo_conflict",
            TidyfoldError::InvalidRoot { .. } => "invalid_root",
            TidyfoldError::BatchNotFound(_) => "batch_not_found",
            TidyfoldError::RunInProgress(_) => "run_in_progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TidyfoldError::RemoteTransient("429".into()).is_transient());
        assert!(!TidyfoldError::RemoteRejected("401".into()).is_transient());
        assert!(!TidyfoldError::CredentialMissing("openai".into()).is_transient());
    }

    #[test]
    fn test_kind_names() {
        let err = TidyfoldError::UnreadableEntry {
            path: PathBuf::from("/tmp/x"),
            reason: "permission denied".into(),
        };
        assert_eq!(err.kind(), "unreadable_entry");
        assert!(err.to_string().contains("permission denied"));
    }
}
