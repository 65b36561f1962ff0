//! Maps a spirit to the URL its image should be pulled from.
//!
//! Two sources, in order: the curated verified-image table, then the spirit's
//! previously stored `image_url` if it still answers a HEAD request.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fetcher::ImageFetcher;
use crate::model::{ImageSource, Spirit};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// One curated pattern → URL pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifiedImage {
    pub pattern: String,
    pub url: String,
}

/// How to choose between several matching patterns.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// First pattern in declaration order wins.
    #[default]
    FirstMatch,
    /// Longest pattern wins; equal lengths fall back to declaration order.
    LongestMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub url: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone)]
pub struct ImageResolver {
    table: Vec<VerifiedImage>,
    policy: MatchPolicy,
}

/// Lower-case, collapse whitespace and trim `"{name} {brand}"`.
pub fn search_key(name: &str, brand: &str) -> String {
    let joined = format!("{name} {brand}").to_lowercase();
    WHITESPACE.replace_all(joined.trim(), " ").into_owned()
}

impl ImageResolver {
    pub fn new(entries: Vec<VerifiedImage>, policy: MatchPolicy) -> Self {
        let table = entries
            .into_iter()
            .map(|e| VerifiedImage {
                pattern: search_key(&e.pattern, ""),
                url: e.url,
            })
            .filter(|e| !e.pattern.is_empty())
            .collect();
        Self { table, policy }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Case-insensitive substring lookup in the verified table.
    pub fn match_verified(&self, name: &str, brand: &str) -> Option<&VerifiedImage> {
        let key = search_key(name, brand);
        let mut candidates = self.table.iter().filter(|e| key.contains(&e.pattern));
        match self.policy {
            MatchPolicy::FirstMatch => candidates.next(),
            MatchPolicy::LongestMatch => candidates.fold(None, |best: Option<&VerifiedImage>, e| {
                match best {
                    Some(b) if b.pattern.len() >= e.pattern.len() => Some(b),
                    _ => Some(e),
                }
            }),
        }
    }

    /// Pick a source URL for `spirit`, or `None` if there is nothing usable.
    /// Probe errors count as "not reachable" and are never surfaced.
    pub async fn resolve(&self, spirit: &Spirit, fetcher: &dyn ImageFetcher) -> Option<ResolvedSource> {
        if let Some(hit) = self.match_verified(&spirit.name, &spirit.brand) {
            debug!(spirit_id = %spirit.id, pattern = %hit.pattern, "verified image match");
            return Some(ResolvedSource {
                url: hit.url.clone(),
                source: ImageSource::Verified,
            });
        }

        let stored = spirit.image_url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        if fetcher.probe(stored).await {
            debug!(spirit_id = %spirit.id, url = stored, "stored image url still reachable");
            Some(ResolvedSource {
                url: stored.to_string(),
                source: ImageSource::Stored,
            })
        } else {
            debug!(spirit_id = %spirit.id, url = stored, "stored image url unreachable");
            None
        }
    }
}
