// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Rate limiting and retry around a classifier
//!
//! Every attempt takes a token from a bucket shared by all workers, so the
//! call rate stays bounded however many files are in flight.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::Classifier;
use crate::config::RemoteConfig;
use crate::model::{ClassifierSource, LabelSet, Verdict};
use crate::{Result, TidyfoldError};

/// Token bucket: at most `capacity` calls per `interval`, refilled continuously
pub struct TokenBucket {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(calls: u32, interval: Duration) -> Self {
        let capacity = f64::from(calls.max(1));
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            per_second: capacity / secs,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last: Instant::now(),
            }),
        }
    }

    /// Bucket for the configured remote call rate
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(
            config.rate_limit.calls,
            Duration::from_secs(config.rate_limit.interval_secs),
        )
    }

    /// Take a token if one is available, otherwise report how long to wait
    fn try_take(&self) -> std::result::Result<(), Duration> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
        state.last = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.per_second))
        }
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_take() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// How often and how patiently to retry transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            max_attempts: config.retries.saturating_add(1),
            base_delay: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Delay before attempt number `attempt` (1-based; the first has none)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor)
    }
}

/// Decorator adding rate limiting and bounded retries to a classifier
pub struct ResilientClassifier<C> {
    inner: C,
    bucket: Arc<TokenBucket>,
    policy: RetryPolicy,
}

impl<C: Classifier> ResilientClassifier<C> {
    pub fn new(inner: C, bucket: Arc<TokenBucket>, policy: RetryPolicy) -> Self {
        Self { inner, bucket, policy }
    }

    /// Retry policy from config; the bucket is shared by every run
    pub fn from_config(inner: C, config: &RemoteConfig, bucket: Arc<TokenBucket>) -> Self {
        Self::new(inner, bucket, RetryPolicy::from_config(config))
    }
}

#[async_trait]
impl<C: Classifier> Classifier for ResilientClassifier<C> {
    fn source(&self) -> ClassifierSource {
        self.inner.source()
    }

    fn version(&self) -> String {
        self.inner.version()
    }

    async fn classify(&self, text: &str, labels: &LabelSet) -> Result<Verdict> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let delay = self.policy.delay(attempt);
            if !delay.is_zero() {
                debug!("Retrying in {:?} (attempt {}/{})", delay, attempt, attempts);
                tokio::time::sleep(delay).await;
            }
            self.bucket.acquire().await;

            match self.inner.classify(text, labels).await {
                Ok(verdict) => return Ok(verdict),
                Err(e) if e.is_transient() => {
                    warn!("Attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(TidyfoldError::RemoteUnavailable(format!(
            "gave up after {} attempts: {}",
            attempts, last_error
        )))
    }
}
