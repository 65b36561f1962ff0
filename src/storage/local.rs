use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use super::ImageBucket;

/// A bucket backed by `{root}/{bucket}/` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
    bucket: String,
    public_base: String,
}

impl LocalBucket {
    pub fn new(root: impl AsRef<Path>, bucket: String, public_base_url: &str) -> Self {
        let joined = format!("{}/{}", public_base_url.trim_end_matches('/'), bucket);
        // Serialised the way `public_url` output is.
        let public_base = Url::parse(&joined)
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .unwrap_or(joined);
        Self {
            root: root.as_ref().to_path_buf(),
            public_base,
            bucket,
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    /// Path an object key maps to. Keys must be a single file name.
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(anyhow!("invalid object key {key:?}"));
        }
        Ok(self.dir().join(key))
    }
}

#[async_trait]
impl ImageBucket for LocalBucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(fs::try_exists(self.dir()).await.unwrap_or(false))
    }

    async fn create_bucket(&self) -> Result<()> {
        let dir = self.dir();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create bucket dir: {}", dir.display()))
    }

    async fn upload(&self, key: &str, bytes: Bytes, _content_type: &str) -> Result<()> {
        let path = self.object_path(key)?;
        // Write-then-rename so readers never see a half-written object.
        let tmp = self.dir().join(format!(".{key}.{}.partial", Uuid::new_v4()));
        fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err).with_context(|| {
                format!("failed to move object into place: {}", path.display())
            });
        }
        Ok(())
    }

    fn public_base_url(&self) -> String {
        self.public_base.clone()
    }
}
