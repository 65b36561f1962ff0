use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use barrel_imagesync::config;
use barrel_imagesync::db::{self, NewSpirit, Pool};
use barrel_imagesync::fetcher::{FetchedImage, ImageFetcher};
use barrel_imagesync::model::{BatchRequest, ImageSource};
use barrel_imagesync::pipeline::{Pipeline, PipelineSettings, RowOutcome};
use barrel_imagesync::resolver::{ImageResolver, MatchPolicy};
use barrel_imagesync::storage::ImageBucket;

const BUCKET_BASE: &str = "https://proj.supabase.co/storage/v1/object/public/spirit-images";
const BUFFALO_URL: &str =
    "https://www.buffalotracedistillery.com/content/dam/sazerac/buffalo-trace/bottles/buffalo-trace-bourbon.jpg";
const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

async fn seed(pool: &Pool, id: &str, name: &str, image_url: Option<&str>) {
    db::insert_spirit(
        pool,
        &NewSpirit {
            id: id.into(),
            name: name.into(),
            image_url: image_url.map(str::to_string),
            ..Default::default()
        },
    )
    .await
    .unwrap();
}

/// Serves a fixed body for every URL unless told otherwise.
#[derive(Default)]
struct FakeFetcher {
    broken: HashSet<String>,
    reachable: HashSet<String>,
    bodies: HashMap<String, &'static [u8]>,
    fetches: Mutex<Vec<String>>,
}

impl FakeFetcher {
    async fn fetches(&self) -> Vec<String> {
        self.fetches.lock().await.clone()
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn probe(&self, url: &str) -> bool {
        self.reachable.contains(url)
    }

    async fn fetch(&self, url: &str) -> Option<FetchedImage> {
        self.fetches.lock().await.push(url.to_string());
        if self.broken.contains(url) {
            return None;
        }
        let body = self.bodies.get(url).copied().unwrap_or(JPEG);
        Some(FetchedImage {
            bytes: Bytes::from_static(body),
            content_type: None,
        })
    }
}

#[derive(Default)]
struct RecordingBucket {
    exists: Mutex<bool>,
    creates: Mutex<u32>,
    uploads: Mutex<Vec<(String, String)>>,
    reject_keys: HashSet<String>,
}

impl RecordingBucket {
    async fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().await.clone()
    }
}

#[async_trait]
impl ImageBucket for RecordingBucket {
    fn name(&self) -> &str {
        "spirit-images"
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(*self.exists.lock().await)
    }

    async fn create_bucket(&self) -> Result<()> {
        *self.creates.lock().await += 1;
        *self.exists.lock().await = true;
        Ok(())
    }

    async fn upload(&self, key: &str, _bytes: Bytes, content_type: &str) -> Result<()> {
        if self.reject_keys.contains(key) {
            return Err(anyhow!("storage rejected {key}"));
        }
        self.uploads
            .lock()
            .await
            .push((key.to_string(), content_type.to_string()));
        Ok(())
    }

    fn public_base_url(&self) -> String {
        BUCKET_BASE.to_string()
    }
}

fn resolver() -> ImageResolver {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    ImageResolver::new(cfg.verified_images, MatchPolicy::FirstMatch)
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        default_batch_size: 20,
        max_batch_size: 50,
        concurrency: 4,
        request_delay: Duration::ZERO,
    }
}

fn pipeline(pool: Pool, fetcher: Arc<FakeFetcher>, bucket: Arc<RecordingBucket>) -> Pipeline {
    Pipeline::new(pool, resolver(), fetcher, bucket, settings())
}

#[tokio::test]
async fn verified_spirit_is_rehosted_and_linked() {
    let pool = setup_pool().await;
    seed(&pool, "abc", "Buffalo Trace", None).await;
    let fetcher = Arc::new(FakeFetcher::default());
    let bucket = Arc::new(RecordingBucket::default());
    let p = pipeline(pool.clone(), fetcher.clone(), bucket.clone());

    let report = p
        .process_batch(BatchRequest {
            batch_size: Some(10),
            offset: Some(0),
        })
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.next_offset, 1);
    assert_eq!(report.total, 1);
    assert!(!report.has_more);
    assert!(report.complete);

    assert_eq!(*bucket.creates.lock().await, 1);
    assert_eq!(
        bucket.uploads().await,
        vec![("abc.jpg".to_string(), "image/jpeg".to_string())]
    );
    assert_eq!(fetcher.fetches().await, vec![BUFFALO_URL.to_string()]);

    let spirit = db::get_spirit(&pool, "abc").await.unwrap().unwrap();
    let hosted = format!("{BUCKET_BASE}/abc.jpg");
    assert_eq!(spirit.image_url.as_deref(), Some(hosted.as_str()));
    assert_eq!(spirit.thumbnail_url.as_deref(), Some(hosted.as_str()));

    let images = db::list_spirit_images(&pool, "abc").await.unwrap();
    assert_eq!(images.len(), 1);
    assert!(images[0].is_primary);
    assert_eq!(images[0].source, ImageSource::Verified);
    assert_eq!(images[0].source_url, BUFFALO_URL);
    assert_eq!(
        images[0].attribution.as_deref(),
        Some("www.buffalotracedistillery.com")
    );
    assert_eq!(spirit.primary_image_id.as_deref(), Some(images[0].id.as_str()));
}

#[tokio::test]
async fn unmatched_spirit_without_url_is_skipped() {
    let pool = setup_pool().await;
    seed(&pool, "m1", "Unknown Moonshine", None).await;
    let fetcher = Arc::new(FakeFetcher::default());
    let bucket = Arc::new(RecordingBucket::default());
    let p = pipeline(pool.clone(), fetcher.clone(), bucket.clone());

    let report = p.process_batch(BatchRequest::default()).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.failed, 0);
    assert!(bucket.uploads().await.is_empty());
    assert!(fetcher.fetches().await.is_empty());

    let spirit = db::get_spirit(&pool, "m1").await.unwrap().unwrap();
    assert_eq!(spirit.image_url, None);
}

#[tokio::test]
async fn stored_url_needs_a_successful_probe() {
    let pool = setup_pool().await;
    seed(&pool, "s1", "House Rye", Some("https://old.example.com/dead.png")).await;
    seed(&pool, "s2", "House Gin", Some("https://old.example.com/live.png")).await;

    let fetcher = Arc::new(FakeFetcher {
        reachable: HashSet::from(["https://old.example.com/live.png".to_string()]),
        ..Default::default()
    });
    let bucket = Arc::new(RecordingBucket::default());
    let p = pipeline(pool.clone(), fetcher.clone(), bucket.clone());

    let report = p.process_batch(BatchRequest::default()).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(fetcher.fetches().await, vec!["https://old.example.com/live.png".to_string()]);

    let dead = db::get_spirit(&pool, "s1").await.unwrap().unwrap();
    assert_eq!(dead.image_url.as_deref(), Some("https://old.example.com/dead.png"));

    let images = db::list_spirit_images(&pool, "s2").await.unwrap();
    assert_eq!(images[0].source, ImageSource::Stored);
}

#[tokio::test]
async fn download_and_upload_failures_are_counted() {
    let pool = setup_pool().await;
    seed(&pool, "a1", "Buffalo Trace", None).await;
    seed(&pool, "b1", "Blanton's Original", None).await;
    seed(&pool, "c1", "Eagle Rare 10", None).await;
    let blanton = "https://www.blantonsbourbon.com/sites/default/files/bottles/blantons-original.png";

    let fetcher = Arc::new(FakeFetcher {
        broken: HashSet::from([BUFFALO_URL.to_string()]),
        bodies: HashMap::from([(blanton.to_string(), b"\x89PNG\r\n\x1a\n".as_slice())]),
        ..Default::default()
    });
    let bucket = Arc::new(RecordingBucket {
        reject_keys: HashSet::from(["b1.png".to_string()]),
        ..Default::default()
    });
    let p = pipeline(pool.clone(), fetcher, bucket.clone());

    let report = p.process_batch(BatchRequest::default()).await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.next_offset, 3);

    assert_eq!(
        bucket.uploads().await,
        vec![("c1.jpg".to_string(), "image/jpeg".to_string())]
    );
    let failed = db::get_spirit(&pool, "b1").await.unwrap().unwrap();
    assert_eq!(failed.image_url, None);
}

#[tokio::test]
async fn non_image_body_fails_the_row() {
    let pool = setup_pool().await;
    seed(&pool, "x1", "Mystery", Some("https://old.example.com/page")).await;
    let fetcher = Arc::new(FakeFetcher {
        reachable: HashSet::from(["https://old.example.com/page".to_string()]),
        bodies: HashMap::from([(
            "https://old.example.com/page".to_string(),
            b"<html>not found</html>".as_slice(),
        )]),
        ..Default::default()
    });
    let bucket = Arc::new(RecordingBucket::default());
    let p = pipeline(pool.clone(), fetcher, bucket.clone());

    let spirit = db::get_spirit(&pool, "x1").await.unwrap().unwrap();
    match p.process_spirit(&spirit).await {
        RowOutcome::Failed { reason } => assert_eq!(reason, "not an image"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(bucket.uploads().await.is_empty());
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let pool = setup_pool().await;
    seed(&pool, "abc", "Buffalo Trace", None).await;
    let fetcher = Arc::new(FakeFetcher::default());
    let bucket = Arc::new(RecordingBucket::default());
    let p = pipeline(pool.clone(), fetcher, bucket.clone());

    p.process_batch(BatchRequest::default()).await.unwrap();
    let first = db::get_spirit(&pool, "abc").await.unwrap().unwrap();
    let report = p.process_batch(BatchRequest::default()).await.unwrap();
    let second = db::get_spirit(&pool, "abc").await.unwrap().unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(first.image_url, second.image_url);
    assert_eq!(first.primary_image_id, second.primary_image_id);
    assert_eq!(db::list_spirit_images(&pool, "abc").await.unwrap().len(), 1);
    assert_eq!(bucket.uploads().await.len(), 2);
    // Bucket existence is checked once per pipeline.
    assert_eq!(*bucket.creates.lock().await, 1);
}

#[tokio::test]
async fn pages_are_disjoint_and_cover_the_table() {
    let pool = setup_pool().await;
    for i in 0..7 {
        seed(&pool, &format!("sp{i:02}"), &format!("Spirit {i}"), None).await;
    }
    let fetcher = Arc::new(FakeFetcher::default());
    let bucket = Arc::new(RecordingBucket::default());
    let p = pipeline(pool.clone(), fetcher, bucket);

    let mut offset = 0;
    let mut seen = 0;
    let mut calls = 0;
    loop {
        let report = p
            .process_batch(BatchRequest {
                batch_size: Some(3),
                offset: Some(offset),
            })
            .await
            .unwrap();
        calls += 1;
        seen += report.processed + report.failed;
        assert_eq!(report.total, 7);
        offset = report.next_offset;
        if !report.has_more {
            assert!(report.complete);
            break;
        }
    }
    assert_eq!(calls, 3);
    assert_eq!(seen, 7);
    assert_eq!(offset, 7);

    let past_end = p
        .process_batch(BatchRequest {
            batch_size: Some(3),
            offset: Some(7),
        })
        .await
        .unwrap();
    assert_eq!(past_end.processed, 0);
    assert_eq!(past_end.failed, 0);
    assert_eq!(past_end.next_offset, 7);
    assert!(past_end.complete);
}

#[tokio::test]
async fn oversized_batch_is_clamped() {
    let pool = setup_pool().await;
    for i in 0..60 {
        seed(&pool, &format!("sp{i:03}"), "Nameless", None).await;
    }
    let p = pipeline(
        pool,
        Arc::new(FakeFetcher::default()),
        Arc::new(RecordingBucket::default()),
    );
    let report = p
        .process_batch(BatchRequest {
            batch_size: Some(1000),
            offset: None,
        })
        .await
        .unwrap();
    assert_eq!(report.processed, 50);
    assert_eq!(report.next_offset, 50);
    assert!(report.has_more);
}

#[tokio::test]
async fn stats_reflect_hosted_rows() {
    let pool = setup_pool().await;
    seed(&pool, "abc", "Buffalo Trace", None).await;
    seed(&pool, "def", "Unknown Moonshine", None).await;
    seed(&pool, "ghi", "Other", Some("https://elsewhere.example.com/x.jpg")).await;
    let bucket = Arc::new(RecordingBucket::default());
    let p = pipeline(pool, Arc::new(FakeFetcher::default()), bucket);

    let before = p.stats().await.unwrap();
    assert_eq!(before.total, 3);
    assert_eq!(before.self_hosted, 0);
    assert!(!before.bucket_exists);
    assert_eq!(before.bucket_url, BUCKET_BASE);

    p.process_batch(BatchRequest::default()).await.unwrap();

    let after = p.stats().await.unwrap();
    assert_eq!(after.self_hosted, 1);
    assert_eq!(after.remaining, 2);
    assert_eq!(after.percent_complete, 33.3);
    assert!(after.bucket_exists);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rows_on_file_database_all_link() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("barrels.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    for i in 0..200 {
        seed(&pool, &format!("bt{i:03}"), &format!("Buffalo Trace {i}"), None).await;
    }

    let p = Pipeline::new(
        pool.clone(),
        resolver(),
        Arc::new(FakeFetcher::default()),
        Arc::new(RecordingBucket::default()),
        PipelineSettings {
            default_batch_size: 50,
            max_batch_size: 100,
            concurrency: 8,
            request_delay: Duration::ZERO,
        },
    );

    // Twice: the second pass re-links every row over its existing primary.
    for _ in 0..2 {
        let mut offset = 0;
        let mut uploaded = 0;
        loop {
            let report = p
                .process_batch(BatchRequest {
                    batch_size: Some(100),
                    offset: Some(offset),
                })
                .await
                .unwrap();
            assert_eq!(report.failed, 0);
            uploaded += report.uploaded;
            offset = report.next_offset;
            if !report.has_more {
                break;
            }
        }
        assert_eq!(uploaded, 200);
    }

    for i in 0..200 {
        let id = format!("bt{i:03}");
        let images = db::list_spirit_images(&pool, &id).await.unwrap();
        assert_eq!(images.len(), 1, "{id}");
        assert!(images[0].is_primary, "{id}");
        let spirit = db::get_spirit(&pool, &id).await.unwrap().unwrap();
        assert_eq!(spirit.primary_image_id.as_deref(), Some(images[0].id.as_str()));
    }
    assert_eq!(p.stats().await.unwrap().self_hosted, 200);
}
