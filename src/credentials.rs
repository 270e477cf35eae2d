// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Credential storage for remote classifier API keys
//!
//! Secrets live in the OS keychain. They are never written to the config file,
//! the cache or the logs.

use keyring::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::{Result, TidyfoldError};

/// Keychain service name entries are stored under
pub const KEYRING_SERVICE: &str = "dev.tidyfold";

/// Environment variable that overrides the stored key
pub const API_KEY_ENV: &str = "TIDYFOLD_API_KEY";

/// Keychain store with the environment override in front of it
pub fn default_store() -> std::sync::Arc<dyn CredentialStore> {
    std::sync::Arc::new(EnvOverride::new(KeyringStore::new()))
}

/// Where API keys are kept, keyed by service name ("openai", ...)
pub trait CredentialStore: Send + Sync {
    fn get(&self, service: &str) -> Result<Option<String>>;
    fn set(&self, service: &str, secret: &str) -> Result<()>;
    fn delete(&self, service: &str) -> Result<()>;

    fn has(&self, service: &str) -> bool {
        matches!(self.get(service), Ok(Some(_)))
    }
}

/// OS keychain backed store
pub struct KeyringStore {
    keyring_service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(keyring_service: &str) -> Self {
        Self {
            keyring_service: keyring_service.to_string(),
        }
    }

    fn entry(&self, service: &str) -> Result<Entry> {
        Entry::new(&self.keyring_service, service)
            .map_err(|e| TidyfoldError::Credential(format!("keychain unavailable: {}", e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, service: &str) -> Result<Option<String>> {
        match self.entry(service)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(TidyfoldError::Credential(e.to_string())),
        }
    }

    fn set(&self, service: &str, secret: &str) -> Result<()> {
        if secret.trim().is_empty() {
            return Err(TidyfoldError::Credential("refusing to store an empty key".into()));
        }
        self.entry(service)?
            .set_password(secret)
            .map_err(|e| TidyfoldError::Credential(e.to_string()))?;

        // Read back through a fresh entry: a backend that only keeps the
        // secret in this process would lose it on exit
        match self.get(service)? {
            Some(stored) if stored == secret => {
                debug!("Stored API key for {}", service);
                Ok(())
            }
            _ => Err(TidyfoldError::Credential(
                "the keychain did not keep the key; set TIDYFOLD_API_KEY instead".into(),
            )),
        }
    }

    fn delete(&self, service: &str) -> Result<()> {
        match self.entry(service)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(TidyfoldError::Credential(e.to_string())),
        }
    }
}

/// Reads an environment variable first, then the wrapped store
pub struct EnvOverride<S> {
    var: String,
    inner: S,
}

impl<S: CredentialStore> EnvOverride<S> {
    pub fn new(inner: S) -> Self {
        Self::with_var(API_KEY_ENV, inner)
    }

    pub fn with_var(var: &str, inner: S) -> Self {
        Self {
            var: var.to_string(),
            inner,
        }
    }
}

impl<S: CredentialStore> CredentialStore for EnvOverride<S> {
    fn get(&self, service: &str) -> Result<Option<String>> {
        match std::env::var(&self.var) {
            Ok(secret) if !secret.trim().is_empty() => Ok(Some(secret)),
            _ => self.inner.get(service),
        }
    }

    fn set(&self, service: &str, secret: &str) -> Result<()> {
        self.inner.set(service, secret)
    }

    fn delete(&self, service: &str) -> Result<()> {
        self.inner.delete(service)
    }
}

/// Process-local store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.secrets
            .lock()
            .map_err(|_| TidyfoldError::Credential("credential store poisoned".into()))
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, service: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(service).cloned())
    }

    fn set(&self, service: &str, secret: &str) -> Result<()> {
        if secret.trim().is_empty() {
            return Err(TidyfoldError::Credential("refusing to store an empty key".into()));
        }
        self.lock()?.insert(service.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, service: &str) -> Result<()> {
        self.lock()?.remove(service);
        Ok(())
    }
}
