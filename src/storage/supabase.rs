use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::{info, warn};

use super::ImageBucket;

/// Supabase Storage REST client bound to a single bucket.
#[derive(Clone)]
pub struct SupabaseStorage {
    http: Client,
    base_url: Url,
    service_key: String,
    bucket: String,
}

impl fmt::Debug for SupabaseStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseStorage")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct BucketEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

impl SupabaseStorage {
    pub fn new(project_url: &str, service_key: String, bucket: String) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", project_url.trim_end_matches('/')))
            .with_context(|| format!("invalid Supabase project url: {project_url}"))?;
        let http = Client::builder()
            .user_agent(concat!("barrel-imagesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build storage http client")?;
        Ok(Self {
            http,
            base_url,
            service_key,
            bucket,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Supabase url cannot be a base"))?
            .pop_if_empty()
            .extend(["storage", "v1"])
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(header::AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
    }

    pub fn build_upload_request(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<reqwest::Request> {
        let url = self.endpoint(&["object", &self.bucket, key])?;
        self.authorized(self.http.post(url))
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .header(header::CACHE_CONTROL, "max-age=3600")
            .body(bytes)
            .build()
            .context("failed to build upload request")
    }
}

#[async_trait]
impl ImageBucket for SupabaseStorage {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> Result<bool> {
        let url = self.endpoint(&["bucket"])?;
        let res = self
            .authorized(self.http.get(url))
            .send()
            .await
            .context("failed to reach Supabase storage")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("list buckets failed {}: {}", status, body));
        }
        let buckets: Vec<BucketEntry> = res
            .json()
            .await
            .context("invalid list buckets response")?;
        Ok(buckets
            .iter()
            .any(|b| b.id == self.bucket || b.name == self.bucket))
    }

    async fn create_bucket(&self) -> Result<()> {
        let url = self.endpoint(&["bucket"])?;
        let body = json!({
            "id": self.bucket,
            "name": self.bucket,
            "public": true,
        });
        let res = self
            .authorized(self.http.post(url))
            .json(&body)
            .send()
            .await
            .context("failed to reach Supabase storage")?;
        let status = res.status();
        if status.is_success() {
            info!(bucket = %self.bucket, "Supabase bucket created");
            return Ok(());
        }
        let text = res.text().await.unwrap_or_default();
        // Lost a creation race with another sweep.
        if status == StatusCode::CONFLICT || text.contains("already exists") {
            warn!(bucket = %self.bucket, "bucket already exists");
            return Ok(());
        }
        Err(anyhow!("create bucket failed {}: {}", status, text))
    }

    async fn upload(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        let request = self.build_upload_request(key, bytes, content_type)?;
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to upload {key}"))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("upload {} failed {}: {}", key, status, body));
        }
        Ok(())
    }

    fn public_base_url(&self) -> String {
        format!(
            "{}storage/v1/object/public/{}",
            self.base_url.as_str(),
            self.bucket
        )
    }
}
