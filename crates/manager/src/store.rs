//! Persistence of each worker's config blob.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use pg_protocol::Args;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("config store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored config at {path} is not a JSON object: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config store task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The stored blob, or `None` when nothing was saved yet.
    async fn load(&self, worker_id: &str) -> Result<Option<Args>, StoreError>;

    async fn save(&self, worker_id: &str, config: &Args) -> Result<(), StoreError>;
}

/// One JSON file per worker under a root directory. Writes go to a temp
/// file in the same directory and are renamed over the old file, so a
/// crash mid-write never leaves a truncated config behind.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, worker_id: &str) -> PathBuf {
        self.root.join(format!("{worker_id}.json"))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self, worker_id: &str) -> Result<Option<Args>, StoreError> {
        let path = self.path_for(worker_id);
        tokio::task::spawn_blocking(move || read_config(&path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn save(&self, worker_id: &str, config: &Args) -> Result<(), StoreError> {
        let path = self.path_for(worker_id);
        let root = self.root.clone();
        let body = serde_json::to_vec_pretty(config).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        tokio::task::spawn_blocking(move || write_atomic(&root, &path, &body))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn read_config(path: &Path) -> Result<Option<Args>, StoreError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_atomic(dir: &Path, path: &Path, body: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(body).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blob(value: serde_json::Value) -> Args {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn missing_config_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());
        assert!(store.load("hue").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("configs"));
        let config = blob(json!({"nodes": [{"address": "light1"}], "customParams": {"bridge": "10.0.0.2"}}));

        store.save("hue", &config).await.unwrap();
        assert_eq!(store.load("hue").await.unwrap(), Some(config.clone()));

        let updated = blob(json!({"nodes": []}));
        store.save("hue", &updated).await.unwrap();
        assert_eq!(store.load("hue").await.unwrap(), Some(updated));
        assert!(store.path_for("hue").ends_with("configs/hue.json"));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());
        std::fs::write(store.path_for("hue"), b"[1, 2]").unwrap();
        assert!(matches!(store.load("hue").await, Err(StoreError::Corrupt { .. })));
    }
}
