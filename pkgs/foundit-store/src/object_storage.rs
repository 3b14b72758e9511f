//! Durable object storage for attachments

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::error::{StoreError, StoreResult};

/// Object storage capability: put bytes under a path, resolve a public URL for it
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> StoreResult<()>;

    fn public_url(&self, path: &str) -> StoreResult<Url>;
}

/// Filesystem-backed object storage
///
/// Objects live under `root`. Public URLs are resolved against `public_base` when one is
/// configured (e.g. a static file server in front of `root`), or as `file://` URLs.
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base: Option<Url>,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base: None,
        }
    }

    pub fn with_public_base(mut self, base: Url) -> Self {
        self.public_base = Some(base);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path below the root, refusing anything that could escape it
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> StoreResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a temp name and rename so readers never see a partial object
        let partial = target.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;

        info!(
            "Stored object {} ({} bytes, {})",
            path,
            bytes.len(),
            content_type
        );
        Ok(())
    }

    fn public_url(&self, path: &str) -> StoreResult<Url> {
        let target = self.resolve(path)?;
        let url = match &self.public_base {
            Some(base) => base
                .join(path)
                .map_err(|e| StoreError::InvalidPath(format!("{}: {}", path, e)))?,
            None => {
                let absolute = if target.is_absolute() {
                    target
                } else {
                    std::env::current_dir()?.join(target)
                };
                Url::from_file_path(&absolute)
                    .map_err(|_| StoreError::InvalidPath(absolute.display().to_string()))?
            }
        };
        debug!("Resolved public URL for {}: {}", path, url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_and_resolve_file_url() {
        let dir = TempDir::new().unwrap();
        let storage = LocalObjectStorage::new(dir.path());

        storage
            .upload("c1/photo.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .unwrap();

        let stored = std::fs::read(dir.path().join("c1/photo.jpg")).unwrap();
        assert_eq!(stored, b"jpeg");

        let url = storage.public_url("c1/photo.jpg").unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("c1/photo.jpg"));
    }

    #[test]
    fn test_public_base_url() {
        let storage = LocalObjectStorage::new("/srv/objects")
            .with_public_base(Url::parse("https://cdn.example.com/chat/").unwrap());
        let url = storage.public_url("c1/photo.jpg").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/chat/c1/photo.jpg");
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let storage = LocalObjectStorage::new(dir.path());

        let result = storage
            .upload("../outside.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await;
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
        assert!(storage.public_url("/etc/passwd").is_err());
    }
}
