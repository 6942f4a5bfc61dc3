//! Durable key/value engines behind the [`CredentialStore`](super::CredentialStore).
//!
//! Every call touches exactly one key. Engines report failures through
//! `anyhow::Result`; the credential store decides how to degrade.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::Entry;
use serde_json::{Map, Value};

/// Keychain service name for [`KeyringStorage`]
const SERVICE_NAME: &str = "grievance-desk";

/// Credentials file name inside the storage directory
const CREDENTIALS_FILE: &str = "credentials.json";

pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// ============================================================================
// File
// ============================================================================

/// JSON object file, rewritten atomically on every mutation.
pub struct FileStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CREDENTIALS_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Storage under the per-user data directory.
    pub fn default_location() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(Self::new(data_dir.join(crate::config::APP_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credentials file")?;
        if contents.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: Value = serde_json::from_str(&contents)
            .context("Failed to parse credentials file")?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow::anyhow!("Credentials file is not a JSON object")),
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create credentials directory")?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).context("Failed to write credentials file")?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace credentials file")?;
        Ok(())
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Credentials file lock poisoned"))?;
        f()
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_lock(|| {
            let map = self.read_map()?;
            Ok(map.get(key).and_then(|v| v.as_str()).map(str::to_string))
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_lock(|| {
            let mut map = self.read_map()?;
            map.insert(key.to_string(), Value::String(value.to_string()));
            self.write_map(&map)
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_lock(|| {
            let mut map = self.read_map()?;
            if map.remove(key).is_some() {
                self.write_map(&map)?;
            }
            Ok(())
        })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict credentials file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

// ============================================================================
// Keyring
// ============================================================================

/// OS keychain, one entry per key.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for KeyringStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-process map. Can be flipped unavailable to behave like a storage
/// engine that rejects every call.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write a raw value, bypassing the credential store's validation.
    pub fn insert_raw(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("storage unavailable");
        }
        self.values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values()?.remove(key);
        Ok(())
    }
}
