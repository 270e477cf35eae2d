// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Classifier backends
//!
//! Every backend answers the same question: given a feature text and a label
//! set, which label fits and how sure are you. The orchestrator picks between
//! them by policy.

pub mod local;
pub mod remote;
pub mod resilient;

use async_trait::async_trait;

use crate::model::{ClassifierSource, LabelSet, Verdict};
use crate::Result;

pub use local::{KeywordModel, LocalClassifier, ZeroShotModel};
pub use remote::RemoteClassifier;
pub use resilient::{ResilientClassifier, RetryPolicy, TokenBucket};

/// Shared classification contract
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Which source results from this classifier are attributed to
    fn source(&self) -> ClassifierSource;

    /// Model identity; part of the cache key
    fn version(&self) -> String;

    /// Pick one label (or "Uncategorized") for the text
    async fn classify(&self, text: &str, labels: &LabelSet) -> Result<Verdict>;
}
