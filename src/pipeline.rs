//! Batch driver: one `{batchSize, offset}` window of spirits through
//! resolve → fetch → upload → link.

use anyhow::Result;
use futures::{stream, StreamExt};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, ImageLink, Pool};
use crate::fetcher::{image_dimensions, HttpFetcher, ImageFetcher, ImageFormat};
use crate::model::{BatchReport, BatchRequest, ImageStats, Spirit};
use crate::resolver::ImageResolver;
use crate::storage::{self, ImageBucket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    /// Rows in flight at once within a batch.
    pub concurrency: usize,
    /// Minimum spacing between row dispatches.
    pub request_delay: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default_batch_size: cfg.pipeline.default_batch_size,
            max_batch_size: cfg.pipeline.max_batch_size,
            concurrency: cfg.pipeline.concurrency,
            request_delay: cfg.request_delay(),
        }
    }

    pub fn clamp_batch_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_batch_size)
            .clamp(1, self.max_batch_size.max(1))
    }
}

/// What happened to a single spirit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Uploaded { url: String },
    /// No source image could be resolved.
    Skipped,
    Failed { reason: String },
}

impl RowOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        RowOutcome::Failed {
            reason: reason.into(),
        }
    }
}

/// Hands out dispatch slots at least `interval` apart.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

pub struct Pipeline {
    pool: Pool,
    resolver: ImageResolver,
    fetcher: Arc<dyn ImageFetcher>,
    bucket: Arc<dyn ImageBucket>,
    settings: PipelineSettings,
    pacer: Pacer,
    bucket_ready: OnceCell<()>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("bucket", &self.bucket.name())
            .field("verified_patterns", &self.resolver.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        resolver: ImageResolver,
        fetcher: Arc<dyn ImageFetcher>,
        bucket: Arc<dyn ImageBucket>,
        settings: PipelineSettings,
    ) -> Self {
        let pacer = Pacer::new(settings.request_delay);
        Self {
            pool,
            resolver,
            fetcher,
            bucket,
            settings,
            pacer,
            bucket_ready: OnceCell::new(),
        }
    }

    /// Wire the HTTP fetcher and configured bucket around `pool`.
    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self> {
        let resolver = ImageResolver::new(cfg.verified_images.clone(), cfg.pipeline.match_policy);
        let fetcher = Arc::new(HttpFetcher::new(cfg.fetch_timeout(), cfg.probe_timeout())?);
        let bucket = storage::from_config(cfg)?;
        Ok(Self::new(
            pool,
            resolver,
            fetcher,
            bucket,
            PipelineSettings::from_config(cfg),
        ))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    async fn ensure_bucket_ready(&self) -> Result<()> {
        self.bucket_ready
            .get_or_try_init(|| async {
                storage::ensure_bucket(self.bucket.as_ref()).await.map(|_| ())
            })
            .await?;
        Ok(())
    }

    /// Process one page of spirits. Per-row problems are counted, never
    /// returned; only bucket or database access failures abort the batch.
    #[instrument(skip(self))]
    pub async fn process_batch(&self, req: BatchRequest) -> Result<BatchReport> {
        let batch_size = self.settings.clamp_batch_size(req.batch_size);
        let offset = req.offset.unwrap_or(0);

        self.ensure_bucket_ready().await?;
        let total = db::count_spirits(&self.pool).await?;
        let rows = db::fetch_spirit_page(&self.pool, offset, batch_size).await?;
        let page_len = u32::try_from(rows.len()).unwrap_or(u32::MAX);

        let outcomes: Vec<RowOutcome> = stream::iter(rows)
            .map(|spirit| async move {
                self.pacer.wait().await;
                self.process_spirit(&spirit).await
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport {
            total,
            next_offset: offset.saturating_add(page_len),
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome {
                RowOutcome::Uploaded { .. } => report.uploaded += 1,
                RowOutcome::Skipped => report.skipped += 1,
                RowOutcome::Failed { .. } => report.failed += 1,
            }
        }
        report.processed = report.uploaded + report.skipped;
        report.has_more = report.next_offset < total;
        report.complete = !report.has_more;

        info!(
            offset,
            batch_size,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            next_offset = report.next_offset,
            total,
            "image batch finished"
        );
        Ok(report)
    }

    /// Run one spirit through the pipeline.
    pub async fn process_spirit(&self, spirit: &Spirit) -> RowOutcome {
        let Some(source) = self.resolver.resolve(spirit, self.fetcher.as_ref()).await else {
            debug!(spirit_id = %spirit.id, name = %spirit.name, "no image source; skipping");
            return RowOutcome::Skipped;
        };

        let Some(image) = self.fetcher.fetch(&source.url).await else {
            return RowOutcome::failed("download failed");
        };

        let Some(format) = ImageFormat::detect(&image, &source.url) else {
            warn!(
                spirit_id = %spirit.id,
                url = %source.url,
                content_type = ?image.content_type,
                "downloaded body is not a recognised image"
            );
            return RowOutcome::failed("not an image");
        };

        let key = storage::object_key(&spirit.id, format);
        let (width, height) = image_dimensions(&image.bytes).unzip();
        if let Err(err) = self.bucket.upload(&key, image.bytes, format.mime()).await {
            warn!(?err, spirit_id = %spirit.id, key, "upload failed");
            return RowOutcome::failed(format!("upload failed: {err}"));
        }

        let hosted_url = self.bucket.public_url(&key);
        let link = ImageLink {
            spirit_id: spirit.id.clone(),
            hosted_url: hosted_url.clone(),
            source_url: source.url.clone(),
            source: source.source,
            attribution: attribution_for(&source.url),
            width,
            height,
        };
        if let Err(err) = db::link_spirit_image(&self.pool, &link).await {
            // The object stays in the bucket; the next run re-links it.
            warn!(?err, spirit_id = %spirit.id, key, "uploaded image could not be linked");
            return RowOutcome::failed(format!("link failed: {err}"));
        }

        info!(
            spirit_id = %spirit.id,
            source = source.source.as_str(),
            url = %hosted_url,
            "spirit image re-hosted"
        );
        RowOutcome::Uploaded { url: hosted_url }
    }

    /// Progress snapshot over the whole table.
    pub async fn stats(&self) -> Result<ImageStats> {
        let total = db::count_spirits(&self.pool).await?;
        let bucket_url = self.bucket.public_base_url();
        let self_hosted = db::count_self_hosted(&self.pool, &bucket_url).await?;
        let bucket_exists = match self.bucket.bucket_exists().await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(?err, "bucket lookup failed");
                false
            }
        };
        Ok(ImageStats {
            total,
            self_hosted,
            remaining: total.saturating_sub(self_hosted),
            percent_complete: percent(self_hosted, total),
            bucket_exists,
            bucket_url,
        })
    }
}

/// Share rounded to one decimal place.
fn percent(part: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(part) * 1000.0 / f64::from(total)).round() / 10.0
}

fn attribution_for(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
