use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use barrel_imagesync::db::{self, Pool};
use barrel_imagesync::model::{BatchReport, BatchRequest};
use barrel_imagesync::sweep::{run_sweep, BatchEndpoint, SweepOptions};

async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

fn report(processed: u32, failed: u32, next_offset: u32) -> BatchReport {
    BatchReport {
        processed,
        uploaded: processed,
        skipped: 0,
        failed,
        next_offset,
        has_more: processed > 0 || failed > 0,
        total: 100,
        complete: processed == 0 && failed == 0,
    }
}

/// Replays queued responses and records every request. Once the queue is
/// drained it reports an exhausted table.
#[derive(Clone, Default)]
struct ScriptedEndpoint {
    responses: Arc<Mutex<VecDeque<Result<BatchReport>>>>,
    requests: Arc<Mutex<Vec<BatchRequest>>>,
}

impl ScriptedEndpoint {
    fn with_responses(responses: Vec<Result<BatchReport>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn offsets(&self) -> Vec<u32> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|r| r.offset.unwrap_or(0))
            .collect()
    }
}

#[async_trait]
impl BatchEndpoint for ScriptedEndpoint {
    async fn run_batch(&self, req: BatchRequest) -> Result<BatchReport> {
        self.requests.lock().await.push(req);
        let next = self.responses.lock().await.pop_front();
        next.unwrap_or_else(|| Ok(report(0, 0, req.offset.unwrap_or(0))))
    }
}

fn opts(budget: Duration) -> SweepOptions {
    SweepOptions {
        batch_size: 10,
        budget,
        start_offset: 0,
        resume: true,
    }
}

#[tokio::test]
async fn sweep_runs_until_exhausted() {
    let ep = ScriptedEndpoint::with_responses(vec![
        Ok(report(10, 0, 10)),
        Ok(report(8, 2, 20)),
        Ok(report(3, 0, 23)),
    ]);
    let summary = run_sweep(&ep, &opts(Duration::from_secs(270)), None).await;

    assert!(summary.complete);
    assert_eq!(summary.error, None);
    assert_eq!(summary.batches_run, 4);
    assert_eq!(summary.total_processed, 21);
    assert_eq!(summary.total_failed, 2);
    assert_eq!(summary.total_uploaded, 21);
    assert_eq!(summary.next_offset, 23);
    assert_eq!(summary.message, "Image sweep complete");
    assert_eq!(ep.offsets().await, vec![0, 10, 20, 23]);

    let requests = ep.requests.lock().await.clone();
    assert!(requests.iter().all(|r| r.batch_size == Some(10)));
}

#[tokio::test]
async fn zero_budget_runs_no_batches() {
    let ep = ScriptedEndpoint::default();
    let summary = run_sweep(&ep, &opts(Duration::ZERO), None).await;

    assert!(!summary.complete);
    assert_eq!(summary.batches_run, 0);
    assert_eq!(summary.next_offset, 0);
    assert!(summary.message.contains("resume from offset 0"));
    assert!(ep.offsets().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn budget_stops_between_batches() {
    struct SlowEndpoint;

    #[async_trait]
    impl BatchEndpoint for SlowEndpoint {
        async fn run_batch(&self, req: BatchRequest) -> Result<BatchReport> {
            tokio::time::sleep(Duration::from_secs(100)).await;
            let offset = req.offset.unwrap_or(0);
            Ok(report(10, 0, offset + 10))
        }
    }

    let summary = run_sweep(&SlowEndpoint, &opts(Duration::from_secs(270)), None).await;
    // Checked at 0s, 100s and 200s; the fourth check at 300s stops it.
    assert_eq!(summary.batches_run, 3);
    assert!(!summary.complete);
    assert_eq!(summary.next_offset, 30);
    assert_eq!(summary.total_processed, 30);
    assert!(summary.duration >= 300_000);
}

#[tokio::test]
async fn batch_error_aborts_with_partial_totals() {
    let ep = ScriptedEndpoint::with_responses(vec![
        Ok(report(10, 0, 10)),
        Err(anyhow!("endpoint returned 500")),
        Ok(report(10, 0, 30)),
    ]);
    let summary = run_sweep(&ep, &opts(Duration::from_secs(270)), None).await;

    assert!(!summary.complete);
    assert_eq!(summary.batches_run, 1);
    assert_eq!(summary.total_processed, 10);
    assert_eq!(summary.next_offset, 10);
    assert_eq!(summary.message, "Image sweep aborted");
    let err = summary.error.unwrap();
    assert!(err.contains("offset 10"), "{err}");
    assert!(err.contains("endpoint returned 500"), "{err}");
}

#[tokio::test]
async fn tracked_offset_wins_over_reported() {
    // Endpoint claims a jump to 50 but only consumed 10 rows.
    let ep = ScriptedEndpoint::with_responses(vec![Ok(report(10, 0, 50))]);
    let summary = run_sweep(&ep, &opts(Duration::from_secs(270)), None).await;
    assert_eq!(ep.offsets().await, vec![0, 10]);
    assert_eq!(summary.next_offset, 10);
}

#[tokio::test]
async fn oversized_remote_counts_saturate() {
    let ep = ScriptedEndpoint::with_responses(vec![
        Ok(report(u32::MAX, 1, 0)),
        Ok(report(5, u32::MAX, 0)),
    ]);
    let summary = run_sweep(&ep, &opts(Duration::from_secs(270)), None).await;
    assert!(summary.complete);
    assert_eq!(summary.total_processed, u32::MAX);
    assert_eq!(summary.total_failed, u32::MAX);
    assert_eq!(summary.total_uploaded, u32::MAX);
    assert_eq!(summary.next_offset, u32::MAX);
    assert_eq!(ep.offsets().await, vec![0, u32::MAX, u32::MAX]);
}

#[tokio::test]
async fn all_failed_batch_still_advances() {
    let ep = ScriptedEndpoint::with_responses(vec![Ok(report(0, 10, 10))]);
    let summary = run_sweep(&ep, &opts(Duration::from_secs(270)), None).await;
    assert!(summary.complete);
    assert_eq!(summary.total_failed, 10);
    assert_eq!(ep.offsets().await, vec![0, 10]);
}

#[tokio::test]
async fn ledger_checkpoints_and_resumes() {
    let pool = setup_pool().await;

    let first = ScriptedEndpoint::with_responses(vec![Ok(report(10, 0, 10)), Ok(report(10, 0, 20))]);
    // Third batch fails and leaves the run open.
    first
        .responses
        .lock()
        .await
        .push_back(Err(anyhow!("function timed out")));
    let aborted = run_sweep(&first, &opts(Duration::from_secs(270)), Some(&pool)).await;
    assert!(aborted.error.is_some());
    let run_id = aborted.run_id.clone().unwrap();

    let run = db::get_sweep_run(&pool, &run_id).await.unwrap().unwrap();
    assert_eq!(run.last_offset, 20);
    assert_eq!(run.total_processed, 20);
    assert_eq!(run.completed_at, None);

    let second = ScriptedEndpoint::with_responses(vec![Ok(report(5, 0, 25))]);
    let resumed = run_sweep(&second, &opts(Duration::from_secs(270)), Some(&pool)).await;
    assert_eq!(resumed.run_id.as_deref(), Some(run_id.as_str()));
    assert!(resumed.complete);
    assert_eq!(second.offsets().await, vec![20, 25]);
    // Totals count this invocation only.
    assert_eq!(resumed.total_processed, 5);

    let run = db::get_sweep_run(&pool, &run_id).await.unwrap().unwrap();
    assert_eq!(run.last_offset, 25);
    assert_eq!(run.total_processed, 25);
    assert!(run.completed_at.is_some());
    assert!(db::latest_open_sweep_run(&pool).await.unwrap().is_none());

    // A finished run is not resumed; a fresh one starts at the configured offset.
    let third = ScriptedEndpoint::default();
    let fresh = run_sweep(&third, &opts(Duration::from_secs(270)), Some(&pool)).await;
    assert_ne!(fresh.run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(third.offsets().await, vec![0]);
}

#[tokio::test]
async fn no_resume_starts_a_new_run() {
    let pool = setup_pool().await;
    let open = db::start_sweep_run(&pool, 0).await.unwrap();
    db::record_sweep_progress(&pool, &open.id, 40, 40, 0).await.unwrap();

    let ep = ScriptedEndpoint::default();
    let mut o = opts(Duration::from_secs(270));
    o.resume = false;
    o.start_offset = 5;
    let summary = run_sweep(&ep, &o, Some(&pool)).await;

    assert_ne!(summary.run_id.as_deref(), Some(open.id.as_str()));
    assert_eq!(ep.offsets().await, vec![5]);
    let untouched = db::get_sweep_run(&pool, &open.id).await.unwrap().unwrap();
    assert_eq!(untouched.last_offset, 40);
}

#[tokio::test]
async fn summary_serializes_camel_case() {
    let ep = ScriptedEndpoint::default();
    let summary = run_sweep(&ep, &opts(Duration::from_secs(270)), None).await;
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["totalProcessed"], 0);
    assert_eq!(json["complete"], true);
    assert!(json.get("duration").is_some());
    assert!(json.get("error").is_none());
    assert!(json.get("runId").is_none());
}
