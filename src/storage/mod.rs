//! Image bucket abstraction and its backends.
//!
//! - `supabase`: Supabase Storage REST API.
//! - `local`: a directory on disk, for development and tests.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, StorageBackend};
use crate::fetcher::ImageFormat;

pub mod local;
pub mod supabase;

pub use local::LocalBucket;
pub use supabase::SupabaseStorage;

#[async_trait]
pub trait ImageBucket: Send + Sync {
    /// Bucket name.
    fn name(&self) -> &str;

    async fn bucket_exists(&self) -> Result<bool>;

    /// Create the bucket with public read access.
    async fn create_bucket(&self) -> Result<()>;

    /// Store `bytes` under `key`, overwriting any existing object.
    async fn upload(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()>;

    /// Prefix shared by every object's public URL, without a trailing slash.
    fn public_base_url(&self) -> String;

    fn public_url(&self, key: &str) -> String {
        join_key(&self.public_base_url(), key)
    }
}

/// Append `key` to `base` as a single percent-encoded path segment, the
/// encoding object uploads use.
pub fn join_key(base: &str, key: &str) -> String {
    let Ok(mut url) = Url::parse(base) else {
        return format!("{base}/{key}");
    };
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().push(key);
        }
        Err(()) => return format!("{base}/{key}"),
    }
    url.into()
}

/// Create the bucket if it is missing. Returns true when it had to be created.
pub async fn ensure_bucket(bucket: &dyn ImageBucket) -> Result<bool> {
    if bucket.bucket_exists().await? {
        return Ok(false);
    }
    bucket.create_bucket().await?;
    info!(bucket = bucket.name(), "created image bucket");
    Ok(true)
}

/// Deterministic object key: `{spirit_id}.{ext}`.
pub fn object_key(spirit_id: &str, format: ImageFormat) -> String {
    format!("{}.{}", spirit_id, format.extension())
}

/// Build the configured backend.
pub fn from_config(cfg: &Config) -> Result<Arc<dyn ImageBucket>> {
    let st = &cfg.storage;
    let bucket: Arc<dyn ImageBucket> = match st.backend {
        StorageBackend::Supabase => Arc::new(SupabaseStorage::new(
            &st.supabase_url,
            st.service_key.clone(),
            st.bucket.clone(),
        )?),
        StorageBackend::Local => Arc::new(LocalBucket::new(
            &st.local_dir,
            st.bucket.clone(),
            &st.public_base_url,
        )),
    };
    Ok(bucket)
}
