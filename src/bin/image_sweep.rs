use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use barrel_imagesync::config;
use barrel_imagesync::db;
use barrel_imagesync::pipeline::Pipeline;
use barrel_imagesync::sweep::{run_sweep, RemoteBatchEndpoint, SweepOptions};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Re-host spirit images batch by batch until done or out of time"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Drive a running server (e.g. http://localhost:8080) instead of processing in-process
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer token sent to --endpoint
    #[arg(long)]
    token: Option<String>,

    /// Rows per batch (default: sweep.batch_size)
    #[arg(long)]
    batch_size: Option<u32>,

    /// Time budget in seconds (default: sweep.budget_secs)
    #[arg(long)]
    budget_secs: Option<u64>,

    /// Offset for a fresh run
    #[arg(long, default_value = "0")]
    offset: u32,

    /// Start a new run even if an unfinished one exists
    #[arg(long)]
    no_resume: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let mut opts = SweepOptions::from_config(&cfg);
    if let Some(size) = args.batch_size {
        opts.batch_size = size.max(1);
    }
    if let Some(secs) = args.budget_secs {
        opts.budget = Duration::from_secs(secs);
    }
    opts.start_offset = args.offset;
    opts.resume = opts.resume && !args.no_resume;

    let summary = match args.endpoint.as_deref() {
        Some(base) => {
            info!(endpoint = base, "sweeping through remote batch endpoint");
            let endpoint = RemoteBatchEndpoint::new(base, args.token.clone(), cfg.fetch_timeout() * 10)?;
            run_sweep(&endpoint, &opts, None).await
        }
        None => {
            let pool = db::init_pool(&cfg.database_url()).await?;
            db::run_migrations(&pool).await?;
            let pipeline = Pipeline::from_config(&cfg, pool)?;
            run_sweep(&pipeline, &opts, Some(pipeline.pool())).await
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);

    match summary.error {
        Some(err) => Err(anyhow!("image sweep aborted: {err}")),
        None => Ok(()),
    }
}
