use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A catalogued spirit row as seen by the image pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Spirit {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub primary_image_id: Option<String>,
}

/// Where a resolved source URL came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageSource {
    /// Curated pattern table.
    Verified,
    /// Previously stored `image_url` that passed a HEAD probe.
    Stored,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Verified => "verified",
            ImageSource::Stored => "stored",
        }
    }

    pub fn parse_source(s: &str) -> Option<Self> {
        match s {
            "verified" => Some(ImageSource::Verified),
            "stored" => Some(ImageSource::Stored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpiritImage {
    pub id: String,
    pub spirit_id: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    pub source: ImageSource,
    pub license: Option<String>,
    pub attribution: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub is_primary: bool,
}

/// Input of one batch invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Aggregate result of one batch. `processed` counts rows that did not fail
/// (`uploaded + skipped`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub processed: u32,
    pub uploaded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub next_offset: u32,
    pub has_more: bool,
    pub total: u32,
    pub complete: bool,
}

/// Progress snapshot for `GET /api/images/process`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageStats {
    pub total: u32,
    pub self_hosted: u32,
    pub remaining: u32,
    pub percent_complete: f64,
    pub bucket_exists: bool,
    pub bucket_url: String,
}

/// Persisted sweep checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepRun {
    pub id: String,
    pub last_offset: i64,
    pub total_processed: i64,
    pub total_failed: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of a full or budget-limited sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub message: String,
    /// Wall-clock milliseconds.
    pub duration: u64,
    pub total_processed: u32,
    pub total_failed: u32,
    pub total_uploaded: u32,
    pub total_skipped: u32,
    pub batches_run: u32,
    pub complete: bool,
    pub next_offset: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
