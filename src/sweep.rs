//! Outer driver: repeat batches until the table is exhausted or the time
//! budget runs out.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::{BatchReport, BatchRequest, SweepRun, SweepSummary};
use crate::pipeline::Pipeline;

/// Anything that can run one batch.
#[async_trait]
pub trait BatchEndpoint: Send + Sync {
    async fn run_batch(&self, req: BatchRequest) -> Result<BatchReport>;
}

#[async_trait]
impl BatchEndpoint for Pipeline {
    async fn run_batch(&self, req: BatchRequest) -> Result<BatchReport> {
        self.process_batch(req).await
    }
}

/// `POST /api/images/process` on a running server.
#[derive(Clone)]
pub struct RemoteBatchEndpoint {
    http: Client,
    url: Url,
    bearer: Option<String>,
}

impl std::fmt::Debug for RemoteBatchEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBatchEndpoint")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RemoteBatchEndpoint {
    /// `base_url` is the server root, e.g. `http://localhost:8080`.
    pub fn new(base_url: &str, bearer: Option<String>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .with_context(|| format!("invalid endpoint url: {base_url}"))?;
        let url = base
            .join("api/images/process")
            .context("invalid endpoint url")?;
        let http = Client::builder()
            .user_agent(concat!("barrel-imagesync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, url, bearer })
    }

    pub fn build_request(&self, req: &BatchRequest) -> Result<reqwest::Request> {
        let mut builder = self.http.post(self.url.clone()).json(req);
        if let Some(token) = self.bearer.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }
        builder.build().context("failed to build batch request")
    }
}

#[async_trait]
impl BatchEndpoint for RemoteBatchEndpoint {
    async fn run_batch(&self, req: BatchRequest) -> Result<BatchReport> {
        let request = self.build_request(&req)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach batch endpoint")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("batch endpoint error {}: {}", status, body));
        }
        res.json::<BatchReport>()
            .await
            .context("invalid batch endpoint response")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOptions {
    pub batch_size: u32,
    /// Wall-clock allowance; checked before each batch.
    pub budget: Duration,
    /// Where a fresh run starts.
    pub start_offset: u32,
    /// Continue the latest incomplete run from its checkpoint.
    pub resume: bool,
}

impl SweepOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.sweep.batch_size,
            budget: cfg.sweep_budget(),
            start_offset: 0,
            resume: cfg.sweep.resume,
        }
    }
}

/// Drive batches through `endpoint`. With a `ledger` pool, progress is
/// checkpointed to `sweep_runs` after every batch.
///
/// Never fails: an error aborts the sweep and is reported in
/// `SweepSummary::error` next to whatever was accumulated before it.
pub async fn run_sweep(
    endpoint: &dyn BatchEndpoint,
    opts: &SweepOptions,
    ledger: Option<&Pool>,
) -> SweepSummary {
    let started = Instant::now();
    let mut summary = SweepSummary::default();
    let mut offset = opts.start_offset;

    let run = match ledger {
        Some(pool) => match open_run(pool, opts).await {
            Ok(run) => {
                offset = u32::try_from(run.last_offset).unwrap_or(opts.start_offset);
                summary.run_id = Some(run.id.clone());
                Some((pool, run.id))
            }
            Err(err) => {
                error!(?err, "could not open sweep run");
                summary.next_offset = offset;
                return finish(summary, started, Err(err));
            }
        },
        None => None,
    };

    info!(
        offset,
        batch_size = opts.batch_size,
        budget_secs = opts.budget.as_secs(),
        run_id = ?summary.run_id,
        "image sweep starting"
    );

    let ledger = run.as_ref().map(|(pool, id)| (*pool, id.as_str()));
    let outcome = drive(endpoint, opts, ledger, started, &mut offset, &mut summary).await;
    summary.next_offset = offset;
    finish(summary, started, outcome)
}

async fn open_run(pool: &Pool, opts: &SweepOptions) -> Result<SweepRun> {
    if opts.resume {
        if let Some(run) = db::latest_open_sweep_run(pool).await? {
            info!(run_id = %run.id, last_offset = run.last_offset, "resuming sweep run");
            return Ok(run);
        }
    }
    db::start_sweep_run(pool, opts.start_offset).await
}

/// Returns `Ok(true)` on exhaustion, `Ok(false)` when the budget ran out.
async fn drive(
    endpoint: &dyn BatchEndpoint,
    opts: &SweepOptions,
    ledger: Option<(&Pool, &str)>,
    started: Instant,
    offset: &mut u32,
    summary: &mut SweepSummary,
) -> Result<bool> {
    loop {
        if started.elapsed() >= opts.budget {
            info!(offset = *offset, "sweep time budget reached");
            return Ok(false);
        }

        let req = BatchRequest {
            batch_size: Some(opts.batch_size),
            offset: Some(*offset),
        };
        let report = endpoint
            .run_batch(req)
            .await
            .with_context(|| format!("batch at offset {} failed", *offset))?;

        // Remote reports may carry arbitrary counts.
        summary.batches_run = summary.batches_run.saturating_add(1);
        summary.total_processed = summary.total_processed.saturating_add(report.processed);
        summary.total_failed = summary.total_failed.saturating_add(report.failed);
        summary.total_uploaded = summary.total_uploaded.saturating_add(report.uploaded);
        summary.total_skipped = summary.total_skipped.saturating_add(report.skipped);

        if report.processed == 0 && report.failed == 0 {
            if let Some((pool, run_id)) = ledger {
                db::complete_sweep_run(pool, run_id).await?;
            }
            return Ok(true);
        }

        let advanced = offset
            .saturating_add(report.processed)
            .saturating_add(report.failed);
        if report.next_offset != advanced {
            warn!(
                reported = report.next_offset,
                tracked = advanced,
                "batch endpoint reported a different next offset; using tracked value"
            );
        }
        *offset = advanced;

        if let Some((pool, run_id)) = ledger {
            db::record_sweep_progress(pool, run_id, *offset, report.processed, report.failed)
                .await?;
        }
    }
}

fn finish(mut summary: SweepSummary, started: Instant, outcome: Result<bool>) -> SweepSummary {
    summary.duration = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match outcome {
        Ok(true) => {
            summary.complete = true;
            summary.message = "Image sweep complete".into();
        }
        Ok(false) => {
            summary.message = format!(
                "Time budget reached; resume from offset {}",
                summary.next_offset
            );
        }
        Err(err) => {
            error!(?err, "image sweep aborted");
            summary.message = "Image sweep aborted".into();
            summary.error = Some(format!("{err:#}"));
        }
    }
    info!(
        batches = summary.batches_run,
        processed = summary.total_processed,
        failed = summary.total_failed,
        complete = summary.complete,
        duration_ms = summary.duration,
        "image sweep finished"
    );
    summary
}
