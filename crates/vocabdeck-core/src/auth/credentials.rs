//! Persisted key-value storage for the bearer token and user record.
//!
//! `CredentialStore` is the seam; three backends are provided:
//! - `KeyringStore`: OS keychain, one keychain entry per key
//! - `FileStore`: a JSON map on disk
//! - `MemoryStore`: in-process, for tests and throwaway runs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use keyring::Entry;
use thiserror::Error;
use tracing::debug;

/// Keychain service name
const SERVICE_NAME: &str = "vocabdeck";

/// Key holding the bearer token
pub const TOKEN_KEY: &str = "auth_token";

/// Key holding the JSON-serialized user record
pub const USER_KEY: &str = "user";

/// Owner read/write only; the file holds the bearer token.
#[cfg(unix)]
const CREDENTIALS_FILE_MODE: u32 = 0o600;

/// Both session keys; always written and cleared together.
pub const SESSION_KEYS: [&str; 2] = [TOKEN_KEY, USER_KEY];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Credential file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential data is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Credential storage unavailable")]
    Unavailable,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a key that is not present succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key, attempting all of them even if one fails.
    /// Returns the first error encountered.
    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut first_err = None;
        for key in keys {
            if let Err(e) = self.remove(key).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Keyring
// ============================================================================

pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// File
// ============================================================================

/// Stores all keys in one JSON object. Writes go to a sibling temp file
/// that is renamed over the original, so a crash never leaves a torn file.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = Self::create_private(&tmp)?;
        file.write_all(serde_json::to_string_pretty(map)?.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Open `path` for writing, readable by the owner only. A stale file
    /// left by an earlier crash is narrowed to the same mode.
    #[cfg(unix)]
    fn create_private(path: &Path) -> Result<File, StoreError> {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CREDENTIALS_FILE_MODE)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(CREDENTIALS_FILE_MODE))?;
        Ok(file)
    }

    #[cfg(not(unix))]
    fn create_private(path: &Path) -> Result<File, StoreError> {
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?)
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> bool) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut map = self.read_map()?;
        if f(&mut map) {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.guard();
        Ok(self.read_map()?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
            true
        })
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|map| map.remove(key).is_some())
    }

    /// Single read-modify-write, so the keys disappear together.
    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.update(|map| {
            let before = map.len();
            for key in keys {
                map.remove(*key);
            }
            map.len() != before
        })?;
        debug!(path = ?self.path, count = keys.len(), "Removed credential keys");
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Set,
    Remove,
}

/// In-process store. Failures can be injected per operation, either for
/// every key or for a single key, to simulate unavailable storage.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<(StoreOp, Option<String>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        store
            .entries()
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        store
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failing(&self) -> MutexGuard<'_, HashSet<(StoreOp, Option<String>)>> {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every `op` fail until `heal` is called.
    pub fn fail(&self, op: StoreOp) {
        self.failing().insert((op, None));
    }

    /// Make `op` fail for `key` only.
    pub fn fail_key(&self, op: StoreOp, key: &str) {
        self.failing().insert((op, Some(key.to_string())));
    }

    pub fn heal(&self) {
        self.failing().clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn check(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        let failing = self.failing();
        if failing.contains(&(op, None)) || failing.contains(&(op, Some(key.to_string()))) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check(StoreOp::Get, key)?;
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check(StoreOp::Set, key)?;
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check(StoreOp::Remove, key)?;
        self.entries().remove(key);
        Ok(())
    }
}
