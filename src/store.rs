//! Artifact and metadata storage.
//!
//! Artifacts are append-only blobs keyed by their fingerprint (prefixed
//! `builds/`); metadata records are small string maps keyed the same way.
//! Both stores are trait objects so hosts can plug in their own backends;
//! the filesystem implementations below are the default, and the in-memory
//! ones back the test suite.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tracing::debug;

use crate::error::{EsmdError, Result};

/// A metadata record: field name to serialized value.
pub type StoreRecord = BTreeMap<String, String>;

/// Append-only blob storage for build artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Key→record metadata storage with a not-found sentinel (`Ok(None)`).
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, namespace: &str, record: StoreRecord) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<StoreRecord>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed artifact store.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EsmdError::Store(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        fs::write(&path, data)
            .await
            .map_err(|e| EsmdError::Store(format!("write {}: {}", key, e)))?;
        debug!("stored {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(key)).await.unwrap_or(false))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path_for(key))
            .await
            .map_err(|e| EsmdError::Store(format!("read {}: {}", key, e)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EsmdError::Store(format!("remove {}: {}", key, e))),
        }
    }
}

/// Filesystem-backed metadata store: one JSON file per key.
pub struct FsMetaStore {
    root: PathBuf,
}

impl FsMetaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }
}

#[async_trait]
impl MetaStore for FsMetaStore {
    async fn put(&self, key: &str, namespace: &str, record: StoreRecord) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EsmdError::Store(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        let mut wrapped = StoreRecord::new();
        wrapped.insert("namespace".to_string(), namespace.to_string());
        wrapped.extend(record);
        let data = serde_json::to_vec(&wrapped)?;
        fs::write(&path, data)
            .await
            .map_err(|e| EsmdError::Store(format!("put {}: {}", key, e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoreRecord>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(data) => {
                let record: StoreRecord = serde_json::from_slice(&data)?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EsmdError::Store(format!("get {}: {}", key, e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EsmdError::Store(format!("delete {}: {}", key, e))),
        }
    }
}

/// In-memory artifact store.
#[derive(Default, Clone)]
pub struct MemoryArtifactStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(key)
            .map(|e| e.clone())
            .ok_or_else(|| EsmdError::Store(format!("read {}: not found", key)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// In-memory metadata store.
#[derive(Default, Clone)]
pub struct MemoryMetaStore {
    records: Arc<DashMap<String, StoreRecord>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, _namespace: &str, record: StoreRecord) -> Result<()> {
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoreRecord>> {
        Ok(self.records.get(key).map(|e| e.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }
}

/// Prefix for artifact blob keys.
pub fn build_key(id: &str) -> String {
    format!("builds/{}", id)
}
