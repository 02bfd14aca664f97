//! Object storage boundary for jobs and handlers.
//!
//! Objects are addressed by a list of identifiers joined into a key, e.g.
//! `["models", "v3", "weights.bin"]` becomes `models/v3/weights.bin`.
//!
//! Backends:
//! - On-disk storage for local runs
//! - In-memory storage for tests and ephemeral nodes
//!
//! This is a small wrapper around `object_store`, which provides both.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::ObjectStoreExt;
use object_store::path::Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("invalid object identifiers: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackendConfig {
    Filesystem { root: PathBuf },
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendConfig,
    /// Optional key prefix applied to all object keys.
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackendConfig::Memory,
            prefix: None,
        }
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackendConfig::Filesystem { root: root.into() },
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = non_empty(prefix.into());
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `RELAY_STORAGE_BACKEND`: `memory` (default) or `filesystem`
    /// - `RELAY_STORAGE_FS_ROOT`: filesystem root (default: `./data/objects`)
    /// - `RELAY_STORAGE_PREFIX`: optional key prefix
    pub fn from_env() -> Result<Self, StorageError> {
        let backend = std::env::var("RELAY_STORAGE_BACKEND")
            .ok()
            .and_then(non_empty);
        let prefix = std::env::var("RELAY_STORAGE_PREFIX").ok().and_then(non_empty);

        let cfg = match backend.as_deref() {
            Some("filesystem") | Some("fs") => {
                let root = std::env::var("RELAY_STORAGE_FS_ROOT")
                    .ok()
                    .and_then(non_empty)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/objects"));
                Self::filesystem(root)
            }
            Some("memory") | Some("mem") | None => Self::memory(),
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unsupported RELAY_STORAGE_BACKEND={other} (expected filesystem|memory)"
                )));
            }
        };

        Ok(Self { prefix, ..cfg })
    }
}

#[derive(Clone)]
pub struct Storage {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("kind", &self.kind)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, store) = match cfg.backend {
            StorageBackendConfig::Filesystem { root } => {
                ensure_dir(&root)?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Arc::new(fs) as _)
            }
            StorageBackendConfig::Memory => {
                let mem = object_store::memory::InMemory::new();
                (StorageKind::Memory, Arc::new(mem) as _)
            }
        };

        Ok(Self {
            kind,
            store,
            prefix: cfg.prefix.and_then(non_empty),
        })
    }

    pub fn memory() -> Self {
        Self {
            kind: StorageKind::Memory,
            store: Arc::new(object_store::memory::InMemory::new()),
            prefix: None,
        }
    }

    pub fn from_env() -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env()?)
    }

    fn to_path(&self, ids: &[&str]) -> Result<Path, StorageError> {
        let parts: Vec<&str> = ids
            .iter()
            .map(|id| id.trim_matches('/'))
            .filter(|id| !id.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(StorageError::InvalidKey(
                "at least one non-empty identifier is required".to_string(),
            ));
        }
        let key = parts.join("/");

        let joined = match self.prefix.as_deref() {
            Some(prefix) => {
                let prefix = prefix.trim_matches('/');
                if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}/{key}")
                }
            }
            None => key,
        };

        Ok(Path::from(joined))
    }

    /// Fetch the object stored under `ids`, or `None` if there is none.
    pub async fn get_object_reference(&self, ids: &[&str]) -> Result<Option<Bytes>, StorageError> {
        let path = self.to_path(ids)?;
        match self.store.get(&path).await {
            Ok(res) => Ok(Some(res.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store `bytes` under `ids`, replacing any previous object.
    pub async fn put_remote_object_reference(
        &self,
        ids: &[&str],
        bytes: Bytes,
    ) -> Result<(), StorageError> {
        let path = self.to_path(ids)?;
        self.store
            .put(&path, object_store::PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn delete_object_reference(&self, ids: &[&str]) -> Result<(), StorageError> {
        let path = self.to_path(ids)?;
        self.store.delete(&path).await?;
        Ok(())
    }

    /// JSON view over this storage.
    pub fn json(&self) -> JsonStorage {
        JsonStorage {
            storage: self.clone(),
        }
    }
}

/// Stores serde values as JSON documents.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    storage: Storage,
}

impl JsonStorage {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn get<T: DeserializeOwned>(&self, ids: &[&str]) -> Result<Option<T>, StorageError> {
        match self.storage.get_object_reference(ids).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize + ?Sized>(&self, ids: &[&str], value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.storage
            .put_remote_object_reference(ids, Bytes::from(bytes))
            .await
    }
}

fn ensure_dir(root: &FsPath) -> Result<(), StorageError> {
    std::fs::create_dir_all(root)?;
    Ok(())
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() -> Result<(), StorageError> {
        let storage = Storage::new(StorageConfig::memory())?;
        storage
            .put_remote_object_reference(&["greetings", "hello.txt"], Bytes::from("hi"))
            .await?;
        let got = storage.get_object_reference(&["greetings", "hello.txt"]).await?;
        assert_eq!(got, Some(Bytes::from("hi")));
        Ok(())
    }

    #[tokio::test]
    async fn missing_object_is_none() -> Result<(), StorageError> {
        let storage = Storage::memory();
        assert_eq!(storage.get_object_reference(&["nope"]).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn empty_identifiers_are_rejected() {
        let storage = Storage::memory();
        let err = storage.get_object_reference(&["", "/"]).await;
        assert!(matches!(err, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn prefix_is_applied() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::new(StorageConfig::filesystem(dir.path()).with_prefix("node-a"))?;
        storage
            .put_remote_object_reference(&["blob"], Bytes::from_static(b"x"))
            .await?;
        assert!(dir.path().join("node-a").join("blob").exists());

        storage.delete_object_reference(&["blob"]).await?;
        assert_eq!(storage.get_object_reference(&["blob"]).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn filesystem_json_round_trip() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::new(StorageConfig::filesystem(dir.path()))?;
        let json = storage.json();

        let value = serde_json::json!({ "a": 1, "b": "two" });
        json.put(&["obj.json"], &value).await?;
        let got: Option<serde_json::Value> = json.get(&["obj.json"]).await?;
        assert_eq!(got, Some(value));

        let missing: Option<serde_json::Value> = json.get(&["other.json"]).await?;
        assert!(missing.is_none());
        Ok(())
    }
}
