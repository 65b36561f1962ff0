//! Configuration loader and validator for the spirit image pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::resolver::{MatchPolicy, VerifiedImage};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    pub storage: Storage,
    pub pipeline: Pipeline,
    pub sweep: Sweep,
    /// Ordered pattern → URL table. Order matters under `first_match`.
    #[serde(default)]
    pub verified_images: Vec<VerifiedImage>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides the default `sqlite://{data_dir}/barrels.db`. `DATABASE_URL` wins over both.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Bearer secret required by the cron endpoint. Empty disables the check.
    #[serde(default)]
    pub cron_secret: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Supabase,
    Local,
}

/// Image bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    pub backend: StorageBackend,
    pub bucket: String,
    #[serde(default)]
    pub supabase_url: String,
    #[serde(default)]
    pub service_key: String,
    #[serde(default)]
    pub local_dir: String,
    #[serde(default)]
    pub public_base_url: String,
}

/// Batch driver tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    pub concurrency: usize,
    pub request_delay_ms: u64,
    pub fetch_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    #[serde(default)]
    pub match_policy: MatchPolicy,
}

/// Outer sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sweep {
    pub batch_size: u32,
    pub budget_secs: u64,
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_resume() -> bool {
    true
}

impl Config {
    /// Ensure required directories exist (`app.data_dir` and, for the local
    /// backend, `storage.local_dir`).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        if self.storage.backend == StorageBackend::Local && !self.storage.local_dir.trim().is_empty()
        {
            fs::create_dir_all(&self.storage.local_dir)?;
        }
        Ok(())
    }

    /// Resolve the database URL: `DATABASE_URL`, then `app.database_url`,
    /// then a SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                return url;
            }
        }
        match self.app.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.to_string(),
            _ => format!("sqlite://{}/barrels.db", self.app.data_dir.trim_end_matches('/')),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.fetch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.probe_timeout_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.pipeline.request_delay_ms)
    }

    pub fn sweep_budget(&self) -> Duration {
        Duration::from_secs(self.sweep.budget_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// Parse and validate a YAML document.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.server.host.trim().is_empty() {
        return Err(ConfigError::Invalid("server.host must be non-empty"));
    }

    let st = &cfg.storage;
    if st.bucket.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.bucket must be non-empty"));
    }
    match st.backend {
        StorageBackend::Supabase => {
            if st.supabase_url.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.supabase_url must be non-empty"));
            }
            if st.service_key.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.service_key must be non-empty"));
            }
        }
        StorageBackend::Local => {
            if st.local_dir.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.local_dir must be non-empty"));
            }
            if st.public_base_url.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.public_base_url must be non-empty"));
            }
        }
    }

    let p = &cfg.pipeline;
    if p.default_batch_size == 0 {
        return Err(ConfigError::Invalid("pipeline.default_batch_size must be > 0"));
    }
    if p.max_batch_size < p.default_batch_size {
        return Err(ConfigError::Invalid(
            "pipeline.max_batch_size must be >= pipeline.default_batch_size",
        ));
    }
    if p.concurrency == 0 {
        return Err(ConfigError::Invalid("pipeline.concurrency must be > 0"));
    }
    if p.fetch_timeout_secs == 0 {
        return Err(ConfigError::Invalid("pipeline.fetch_timeout_secs must be > 0"));
    }
    if p.probe_timeout_secs == 0 {
        return Err(ConfigError::Invalid("pipeline.probe_timeout_secs must be > 0"));
    }
    // request_delay_ms may be 0 to disable pacing

    if cfg.sweep.batch_size == 0 {
        return Err(ConfigError::Invalid("sweep.batch_size must be > 0"));
    }
    if cfg.sweep.budget_secs == 0 {
        return Err(ConfigError::Invalid("sweep.budget_secs must be > 0"));
    }

    for entry in &cfg.verified_images {
        if entry.pattern.trim().is_empty() {
            return Err(ConfigError::Invalid("verified_images[].pattern must be non-empty"));
        }
        if !(entry.url.starts_with("http://") || entry.url.starts_with("https://")) {
            return Err(ConfigError::Invalid("verified_images[].url must be an http(s) URL"));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

server:
  host: "0.0.0.0"
  port: 8080
  cron_secret: "CHANGE_ME"

storage:
  backend: supabase
  bucket: "spirit-images"
  supabase_url: "https://YOUR_PROJECT.supabase.co"
  service_key: "YOUR_SUPABASE_SERVICE_ROLE_KEY"

pipeline:
  default_batch_size: 20
  max_batch_size: 100
  concurrency: 4
  request_delay_ms: 1500
  fetch_timeout_secs: 30
  probe_timeout_secs: 5
  match_policy: first_match

sweep:
  batch_size: 20
  budget_secs: 270
  resume: true

verified_images:
  - pattern: "buffalo trace"
    url: "https://www.buffalotracedistillery.com/content/dam/sazerac/buffalo-trace/bottles/buffalo-trace-bourbon.jpg"
  - pattern: "eagle rare"
    url: "https://www.buffalotracedistillery.com/content/dam/sazerac/buffalo-trace/bottles/eagle-rare-10.jpg"
  - pattern: "blanton"
    url: "https://www.blantonsbourbon.com/sites/default/files/bottles/blantons-original.png"
  - pattern: "taylor"
    url: "https://www.buffalotracedistillery.com/content/dam/sazerac/buffalo-trace/bottles/eh-taylor-small-batch.jpg"
  - pattern: "maker's mark"
    url: "https://www.makersmark.com/sites/default/files/bottles/makers-mark-original.png"
  - pattern: "woodford reserve"
    url: "https://www.woodfordreserve.com/wp-content/uploads/bottles/distillers-select.png"
  - pattern: "wild turkey"
    url: "https://www.wildturkeybourbon.com/wp-content/uploads/bottles/wild-turkey-101.png"
  - pattern: "four roses"
    url: "https://fourrosesbourbon.com/wp-content/uploads/bottles/four-roses-small-batch.png"
"#
}
