use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;

use crate::config::RecordingConfig;

/// Backend for cast files. Paths are relative (`YYYY-MM-DD/{id}.cast`) so
/// rows stay portable between backends.
#[async_trait]
pub trait RecordingStorage: Send + Sync {
    /// Append a flushed chunk to the in-progress recording.
    async fn append(&self, rel_path: &str, data: &[u8]) -> anyhow::Result<()>;

    /// Promote the in-progress recording to its final name, atomically from
    /// the reader's point of view. Returns the final size in bytes.
    async fn finalize(&self, rel_path: &str) -> anyhow::Result<u64>;

    async fn read(&self, rel_path: &str) -> anyhow::Result<Vec<u8>>;

    /// Delete a recording; returns bytes freed (0 when already gone).
    async fn delete(&self, rel_path: &str) -> anyhow::Result<u64>;

    async fn exists(&self, rel_path: &str) -> anyhow::Result<bool>;

    /// All final `.cast` files, as relative paths — the orphan sweep walks this.
    async fn list_cast_files(&self) -> anyhow::Result<Vec<String>>;
}

/// Build the configured backend.
pub fn from_config(cfg: &RecordingConfig) -> anyhow::Result<Arc<dyn RecordingStorage>> {
    match cfg.storage_type.as_str() {
        "object" => {
            let mut builder = opendal::services::S3::default()
                .bucket(&cfg.object_bucket)
                .region(&cfg.object_region)
                .access_key_id(&cfg.object_access_key)
                .secret_access_key(&cfg.object_secret_key);
            if !cfg.object_endpoint.is_empty() {
                builder = builder.endpoint(&cfg.object_endpoint);
            }
            let op = opendal::Operator::new(builder)?.finish();
            Ok(Arc::new(ObjectStorage::new(op)))
        }
        _ => Ok(Arc::new(LocalStorage::new(&cfg.base_path))),
    }
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_owned(),
        }
    }

    fn final_path(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }

    fn part_path(&self, rel: &str) -> PathBuf {
        self.base.join(format!("{rel}.part"))
    }
}

#[async_trait]
impl RecordingStorage for LocalStorage {
    async fn append(&self, rel_path: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.part_path(rel_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize(&self, rel_path: &str) -> anyhow::Result<u64> {
        let part = self.part_path(rel_path);
        let target = self.final_path(rel_path);
        match tokio::fs::metadata(&part).await {
            Ok(meta) => {
                let size = meta.len();
                tokio::fs::rename(&part, &target).await?;
                Ok(size)
            }
            // Nothing was ever flushed.
            Err(_) => Ok(0),
        }
    }

    async fn read(&self, rel_path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(tokio::fs::read(self.final_path(rel_path)).await?)
    }

    async fn delete(&self, rel_path: &str) -> anyhow::Result<u64> {
        let path = self.final_path(rel_path);
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                // Clean a stray .part as well, best effort.
                let _ = tokio::fs::remove_file(self.part_path(rel_path)).await;
                return Ok(0);
            }
        };
        tokio::fs::remove_file(&path).await?;
        Ok(size)
    }

    async fn exists(&self, rel_path: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::metadata(self.final_path(rel_path)).await.is_ok())
    }

    async fn list_cast_files(&self) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut dates = match tokio::fs::read_dir(&self.base).await {
            Ok(d) => d,
            Err(_) => return Ok(out),
        };
        while let Some(date_dir) = dates.next_entry().await? {
            if !date_dir.file_type().await?.is_dir() {
                continue;
            }
            let date_name = date_dir.file_name().to_string_lossy().into_owned();
            let mut files = tokio::fs::read_dir(date_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.ends_with(".cast") {
                    out.push(format!("{date_name}/{name}"));
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Object store (opendal)
// ---------------------------------------------------------------------------

/// Object backend. Objects cannot be appended to, so chunks stage in memory
/// and the whole cast uploads once at finalize; recording size caps bound
/// the staging footprint.
pub struct ObjectStorage {
    op: opendal::Operator,
    staging: DashMap<String, Vec<u8>>,
}

impl ObjectStorage {
    pub fn new(op: opendal::Operator) -> Self {
        Self {
            op,
            staging: DashMap::new(),
        }
    }

    /// In-memory variant for tests.
    pub fn memory() -> anyhow::Result<Self> {
        let op = opendal::Operator::new(opendal::services::Memory::default())?.finish();
        Ok(Self::new(op))
    }
}

#[async_trait]
impl RecordingStorage for ObjectStorage {
    async fn append(&self, rel_path: &str, data: &[u8]) -> anyhow::Result<()> {
        self.staging
            .entry(rel_path.to_owned())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn finalize(&self, rel_path: &str) -> anyhow::Result<u64> {
        let Some((_, buf)) = self.staging.remove(rel_path) else {
            return Ok(0);
        };
        let size = buf.len() as u64;
        self.op.write(rel_path, buf).await?;
        Ok(size)
    }

    async fn read(&self, rel_path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(self.op.read(rel_path).await?.to_vec())
    }

    async fn delete(&self, rel_path: &str) -> anyhow::Result<u64> {
        let size = match self.op.stat(rel_path).await {
            Ok(meta) => meta.content_length(),
            Err(_) => return Ok(0),
        };
        self.op.delete(rel_path).await?;
        Ok(size)
    }

    async fn exists(&self, rel_path: &str) -> anyhow::Result<bool> {
        Ok(self.op.exists(rel_path).await?)
    }

    async fn list_cast_files(&self) -> anyhow::Result<Vec<String>> {
        let entries = self
            .op
            .list_with("")
            .recursive(true)
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| e.path().trim_start_matches('/').to_owned())
            .filter(|p| p.ends_with(".cast"))
            .collect())
    }
}
