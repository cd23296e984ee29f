//! Crash-safe persistence adapters.
//!
//! There is no teacher precedent for atomic file writes (the reference
//! storage manager is a stubbed Parquet path); this module is written fresh
//! in the surrounding crates' async/`tracing`/`EngineResult` idiom: write to
//! a temp file, fsync, rename. A crash at any point must leave either the
//! previous content or the new one, never a truncated file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use engine_types::errors::{EngineResult, StoreError};
use engine_types::signal::SignalRow;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Abstract backend contract shared by every persistence adapter.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn write_data(&self, path_key: &str, bytes: &[u8]) -> EngineResult<()>;
    async fn read_data(&self, path_key: &str) -> EngineResult<Option<Vec<u8>>>;
    async fn delete_data(&self, path_key: &str) -> EngineResult<()>;
    async fn ensure_namespace(&self, namespace_key: &str) -> EngineResult<()>;
    /// Lists every key currently stored under `namespace_key`.
    async fn list_all(&self, namespace_key: &str) -> EngineResult<Vec<String>>;
}

/// Local filesystem backend rooted at `root` (e.g. `./dump/persist` or
/// `./dump/schedule`).
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, namespace_key: &str, path_key: &str) -> PathBuf {
        self.root.join(namespace_key).join(format!("{path_key}.json"))
    }
}

/// Namespaced view over a [`Backend`], since the abstract contract above is
/// keyed by a flat `pathKey` but every concrete store (signal, schedule,
/// risk) lives under its own namespace directory.
pub struct NamespacedBackend<'a> {
    backend: &'a FilesystemBackend,
    namespace: String,
}

impl<'a> NamespacedBackend<'a> {
    pub fn new(backend: &'a FilesystemBackend, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub async fn write_data(&self, path_key: &str, bytes: &[u8]) -> EngineResult<()> {
        self.backend.ensure_namespace(&self.namespace).await?;
        let path = self.backend.path_for(&self.namespace, path_key);
        atomic_write(&path, bytes).await
    }

    pub async fn read_data(&self, path_key: &str) -> EngineResult<Option<Vec<u8>>> {
        let path = self.backend.path_for(&self.namespace, path_key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            }
            .into()),
        }
    }

    pub async fn delete_data(&self, path_key: &str) -> EngineResult<()> {
        let path = self.backend.path_for(&self.namespace, path_key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::WriteFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            }
            .into()),
        }
    }

    pub async fn list_all(&self) -> EngineResult<Vec<String>> {
        let dir = self.backend.root.join(&self.namespace);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::NamespaceFailed {
                    namespace: self.namespace.clone(),
                    message: e.to_string(),
                }
                .into())
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::NamespaceFailed {
            namespace: self.namespace.clone(),
            message: e.to_string(),
        })? {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    async fn write_data(&self, path_key: &str, bytes: &[u8]) -> EngineResult<()> {
        NamespacedBackend::new(self, "").write_data(path_key, bytes).await
    }

    async fn read_data(&self, path_key: &str) -> EngineResult<Option<Vec<u8>>> {
        NamespacedBackend::new(self, "").read_data(path_key).await
    }

    async fn delete_data(&self, path_key: &str) -> EngineResult<()> {
        NamespacedBackend::new(self, "").delete_data(path_key).await
    }

    async fn ensure_namespace(&self, namespace_key: &str) -> EngineResult<()> {
        let dir = self.root.join(namespace_key);
        fs::create_dir_all(&dir).await.map_err(|e| StoreError::NamespaceFailed {
            namespace: namespace_key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn list_all(&self, namespace_key: &str) -> EngineResult<Vec<String>> {
        NamespacedBackend::new(self, namespace_key).list_all().await
    }
}

/// Writes `bytes` to `path` atomically: write to `{path}.tmp`, fsync, rename.
async fn atomic_write(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    let tmp_path = path.with_extension("json.tmp");

    let mut file = fs::File::create(&tmp_path).await.map_err(|e| StoreError::WriteFailed {
        path: tmp_path.display().to_string(),
        message: e.to_string(),
    })?;

    file.write_all(bytes).await.map_err(|e| StoreError::WriteFailed {
        path: tmp_path.display().to_string(),
        message: e.to_string(),
    })?;
    file.sync_all().await.map_err(|e| StoreError::WriteFailed {
        path: tmp_path.display().to_string(),
        message: e.to_string(),
    })?;
    drop(file);

    fs::rename(&tmp_path, path).await.map_err(|e| StoreError::WriteFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    debug!(path = %path.display(), "atomic write committed");
    Ok(())
}

/// Persists `SignalRow`s under `./dump/persist/` (active) or
/// `./dump/schedule/` (pending), one file per `"{symbol}_{strategyName}.json"`.
pub struct SignalStore {
    backend: FilesystemBackend,
}

impl SignalStore {
    /// `./dump/persist/` — activated signals.
    pub fn persist(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: FilesystemBackend::new(root),
        }
    }

    /// `./dump/schedule/` — scheduled-but-not-yet-activated signals.
    pub fn schedule(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: FilesystemBackend::new(root),
        }
    }

    fn namespace<'a>(&'a self, exchange_name: &str) -> NamespacedBackend<'a> {
        NamespacedBackend::new(&self.backend, exchange_name.to_string())
    }

    pub async fn write(&self, row: &SignalRow) -> EngineResult<()> {
        let bytes = serde_json::to_vec(row)?;
        self.namespace(&row.exchange_name)
            .write_data(&row.file_stem(), &bytes)
            .await
    }

    pub async fn delete(&self, exchange_name: &str, symbol: &str, strategy_name: &str) -> EngineResult<()> {
        let key = format!("{symbol}_{strategy_name}");
        self.namespace(exchange_name).delete_data(&key).await
    }

    pub async fn read(
        &self,
        exchange_name: &str,
        symbol: &str,
        strategy_name: &str,
    ) -> EngineResult<Option<SignalRow>> {
        let key = format!("{symbol}_{strategy_name}");
        match self.namespace(exchange_name).read_data(&key).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(row) => Ok(Some(row)),
                Err(e) => {
                    warn!(exchange_name, symbol, strategy_name, error = %e, "corrupt signal row, treating as missing");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Enumerates every persisted row under `exchange_name`, discarding rows
    /// whose embedded `strategy_name` doesn't match `strategy_name` — the
    /// cross-contamination guard during recovery.
    pub async fn list_all(&self, exchange_name: &str, strategy_name: &str) -> EngineResult<Vec<SignalRow>> {
        let namespace = self.namespace(exchange_name);
        let keys = namespace.list_all().await?;
        let mut rows = Vec::new();
        for key in keys {
            if let Some(bytes) = namespace.read_data(&key).await? {
                match serde_json::from_slice::<SignalRow>(&bytes) {
                    Ok(row) if row.strategy_name == strategy_name => rows.push(row),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(key, error = %e, "skipping corrupt row during recovery scan");
                    }
                }
            }
        }
        Ok(rows)
    }
}
