//! # Key/Value Storage
//!
//! Provides the [`Storage`] capability the identity store persists into:
//! - [`MemoryStorage`] for tests and ephemeral devices
//! - [`FileStorage`] keeping a JSON document on disk
//!
//! Values are plain strings; callers encode numbers and bytes themselves.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use shared::{
    config::StorageConfig,
    error::{AgentError, AgentResult},
};

/// Durable key/value persistence
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a key; `Ok(None)` when the key was never written
    async fn get(&self, key: &str) -> AgentResult<Option<String>>;

    /// Write a key
    async fn set(&self, key: &str, value: &str) -> AgentResult<()>;
}

// =============================================================================
// MEMORY STORAGE
// =============================================================================

/// In-process storage, lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> AgentResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// =============================================================================
// FILE STORAGE
// =============================================================================

/// Storage backed by a single JSON document.
///
/// The whole document is cached in memory and rewritten on every `set`.
pub struct FileStorage {
    /// Path of the JSON document
    path: PathBuf,

    /// Cached document; the lock also serializes writes to the file
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open the storage described by `config`, creating its directory
    pub async fn new(config: &StorageConfig) -> AgentResult<Self> {
        tokio::fs::create_dir_all(&config.data_path)
            .await
            .map_err(|e| AgentError::StorageError(e.to_string()))?;
        Self::open(config.file_path()).await
    }

    /// Open the document at `path`, loading it if it exists
    pub async fn open(path: impl Into<PathBuf>) -> AgentResult<Self> {
        let path = path.into();
        info!(path = ?path, "Opening file storage");

        let entries = Self::read_document(&path).await?;
        debug!(path = ?path, keys = entries.len(), "File storage loaded");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(path: &Path) -> AgentResult<BTreeMap<String, String>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AgentError::StorageError(e.to_string()))?;

        if json.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&json).map_err(|e| {
            AgentError::StorageError(format!("corrupt document {}: {}", path.display(), e))
        })
    }

    async fn write_document(&self, entries: &BTreeMap<String, String>) -> AgentResult<()> {
        let json = serde_json::to_string_pretty(entries)?;

        // Write next to the target, then rename, so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AgentError::StorageError(e.to_string()))?;

        // Owner-only read/write (Unix); the document holds the device secret
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms)
                .await
                .map_err(|e| AgentError::StorageError(e.to_string()))?;
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AgentError::StorageError(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> AgentResult<()> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), value.to_string());

        if let Err(e) = self.write_document(&entries).await {
            // Keep the cache in line with what is on disk
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }

        debug!(key = %key, path = ?self.path, "Storage key written");
        Ok(())
    }
}
