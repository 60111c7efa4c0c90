use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::debug;

use crate::models::UserProfile;

/// Store key holding the bearer access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Store key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Store key holding the cached user profile (JSON)
pub const USER_PROFILE_KEY: &str = "user";
/// Store key holding the "remember me" flag
pub const REMEMBER_ME_KEY: &str = "remember_me";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Synchronous key-value storage that survives restarts.
///
/// Only the session manager writes the token keys. Other callers go through
/// [`ProfileCache`] for the profile and remember-me entries.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Volatile store, used for tests and for sessions that should not outlive the process
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// Store persisted as a JSON object in the cache directory.
///
/// Every write rewrites the whole file through a temporary sibling so a crash
/// never leaves a half-written session behind.
pub struct FileTokenStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileTokenStore {
    /// Open (or lazily create) the store inside `cache_dir`
    pub fn open(cache_dir: &Path) -> Result<Self> {
        Self::open_file(cache_dir.join(SESSION_FILE))
    }

    pub fn open_file(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read session file {}", path.display()))?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents).context("Failed to parse session file")?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), keys = entries.len(), "Session store opened");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).context("Failed to write session file")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace session file")?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// Read/write access to the non-auth entries of a [`TokenStore`].
pub struct ProfileCache<'a> {
    store: &'a dyn TokenStore,
}

impl<'a> ProfileCache<'a> {
    pub fn new(store: &'a dyn TokenStore) -> Self {
        Self { store }
    }

    /// Cached profile, if any. A corrupt entry reads as absent.
    pub fn load(&self) -> Result<Option<UserProfile>> {
        let Some(raw) = self.store.get(USER_PROFILE_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(profile) => Ok(Some(profile)),
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable cached profile");
                Ok(None)
            }
        }
    }

    pub fn save(&self, profile: &UserProfile) -> Result<()> {
        let raw = serde_json::to_string(profile)?;
        self.store.set(USER_PROFILE_KEY, &raw)
    }

    pub fn remember_me(&self) -> Result<bool> {
        Ok(self.store.get(REMEMBER_ME_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_remember_me(&self, remember: bool) -> Result<()> {
        if remember {
            self.store.set(REMEMBER_ME_KEY, "true")
        } else {
            self.store.remove(REMEMBER_ME_KEY)
        }
    }
}
