//! Blob storage for uploaded videos.
//!
//! The upload layer stores raw video bytes under a key; the pipeline only
//! ever reads them back. `FilesystemBlobStore` keeps blobs below a local
//! root directory.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Copy the blob stored under `key` to a local file.
    fn fetch_to(&self, key: &str, dest: &Path) -> Result<()> {
        let bytes = self.get(key)?;
        write_atomic(dest, &bytes)
            .map_err(|e| PipelineError::Blob(format!("write {}: {}", dest.display(), e)))
    }
}

#[derive(Clone, Debug)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| PipelineError::Blob(format!("create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        let key = sanitize_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for FilesystemBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PipelineError::Blob(format!("create {}: {}", parent.display(), e)))?;
        }
        write_atomic(&path, bytes).map_err(|e| PipelineError::Blob(format!("put '{key}': {e}")))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(key)?;
        read_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::Blob(format!("no blob stored under '{key}'")),
            _ => PipelineError::Blob(format!("get '{key}': {e}")),
        })
    }

    fn fetch_to(&self, key: &str, dest: &Path) -> Result<()> {
        let path = self.blob_path(key)?;
        fs::copy(&path, dest).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::Blob(format!("no blob stored under '{key}'")),
            _ => PipelineError::Blob(format!("fetch '{key}': {e}")),
        })?;
        Ok(())
    }
}

/// Keys are relative, `/`-separated paths of `[A-Za-z0-9._-]` segments.
fn sanitize_key(key: &str) -> Result<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Blob("blob key cannot be empty".to_string()));
    }
    if trimmed.starts_with('/') {
        return Err(PipelineError::Blob(format!("blob key '{trimmed}' must be relative")));
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(PipelineError::Blob(format!("blob key '{trimmed}' has an invalid path segment")));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        {
            return Err(PipelineError::Blob(format!(
                "blob key '{trimmed}' must use [A-Za-z0-9._-] segments"
            )));
        }
    }
    Ok(trimmed.to_string())
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}
