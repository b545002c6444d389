// =============================================================================
// CandidatePool — component D
// =============================================================================
//
// Merges two independent, optional, ranked signal feeds with a disk-cached
// fallback chain, grounded on the reference coin-pool's cache-then-default
// discipline: fetch-with-retries -> write cache on success -> fall back to
// the last cache on failure (warn if stale) -> fall back to hard-coded
// defaults (scored feed only; the OI feed has no meaningful default).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::error::CoreError;

pub const DEFAULT_COINS: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "HYPEUSDT",
];

const FETCH_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];
const FETCH_TIMEOUT_SECS: u64 = 30;
const STALE_CACHE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOrigin {
    ScoredFeed,
    OiGrowthFeed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub symbol: String,
    pub score: f64,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OiGrowthEntry {
    pub symbol: String,
    pub rank: u32,
    pub oi_delta_pct: f64,
    pub oi_delta_value: f64,
    pub price_delta_pct: f64,
    pub net_long: f64,
    pub net_short: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    pub origins: Vec<FeedOrigin>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile<T> {
    fetched_at: DateTime<Utc>,
    source_type: String,
    entries: Vec<T>,
}

pub struct CandidatePoolConfig {
    pub scored_feed_url: Option<String>,
    pub oi_growth_feed_url: Option<String>,
    pub use_default_coins: bool,
    pub default_coins: Vec<String>,
    pub cache_dir: PathBuf,
}

impl Default for CandidatePoolConfig {
    fn default() -> Self {
        Self {
            scored_feed_url: None,
            oi_growth_feed_url: None,
            use_default_coins: true,
            default_coins: DEFAULT_COINS.iter().map(|s| s.to_string()).collect(),
            cache_dir: PathBuf::from("./data/candidate_cache"),
        }
    }
}

pub struct CandidatePool {
    config: CandidatePoolConfig,
    client: reqwest::Client,
}

impl CandidatePool {
    pub fn new(config: CandidatePoolConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn scored_cache_path(&self) -> PathBuf {
        self.config.cache_dir.join("latest.json")
    }

    fn oi_cache_path(&self) -> PathBuf {
        self.config.cache_dir.join("oi_top_latest.json")
    }

    #[instrument(skip(self), name = "candidate_pool.fetch_scored_feed")]
    pub async fn fetch_scored_feed(&self) -> Vec<ScoredEntry> {
        let Some(url) = self.config.scored_feed_url.as_ref().filter(|u| !u.is_empty()) else {
            if self.config.use_default_coins {
                return self
                    .config
                    .default_coins
                    .iter()
                    .enumerate()
                    .map(|(i, s)| ScoredEntry {
                        symbol: s.clone(),
                        score: (self.config.default_coins.len() - i) as f64,
                        flags: Vec::new(),
                    })
                    .collect();
            }
            return Vec::new();
        };

        match fetch_with_retries::<Vec<ScoredEntry>>(&self.client, url).await {
            Ok(entries) => {
                write_cache(&self.scored_cache_path(), &entries).await;
                entries
            }
            Err(e) => {
                warn!(error = %e, "scored feed fetch exhausted retries, falling back to cache");
                match load_cache::<ScoredEntry>(&self.scored_cache_path()).await {
                    Some(entries) => entries,
                    None => {
                        warn!("no scored feed cache available, falling back to default coins");
                        self.config
                            .default_coins
                            .iter()
                            .enumerate()
                            .map(|(i, s)| ScoredEntry {
                                symbol: s.clone(),
                                score: (self.config.default_coins.len() - i) as f64,
                                flags: Vec::new(),
                            })
                            .collect()
                    }
                }
            }
        }
    }

    #[instrument(skip(self), name = "candidate_pool.fetch_oi_growth_feed")]
    pub async fn fetch_oi_growth_feed(&self) -> Vec<OiGrowthEntry> {
        let Some(url) = self.config.oi_growth_feed_url.as_ref().filter(|u| !u.is_empty()) else {
            return Vec::new();
        };

        match fetch_with_retries::<Vec<OiGrowthEntry>>(&self.client, url).await {
            Ok(entries) => {
                write_cache(&self.oi_cache_path(), &entries).await;
                entries
            }
            Err(e) => {
                warn!(error = %e, "OI growth feed fetch exhausted retries, falling back to cache");
                load_cache::<OiGrowthEntry>(&self.oi_cache_path())
                    .await
                    .unwrap_or_default()
            }
        }
    }

    /// Union of the top `ai_limit` scored-feed symbols (by score desc) plus
    /// every OI-growth symbol; each entry tags the feeds it originated from.
    pub async fn merged(&self, ai_limit: usize) -> Vec<CandidateCoin> {
        let scored = self.fetch_scored_feed().await;
        let oi_growth = self.fetch_oi_growth_feed().await;
        merge_feeds(&scored, &oi_growth, ai_limit)
    }

    /// Origin tags so the engine's per-candidate prompt block can mention
    /// which feed(s) surfaced a symbol. Mirrors `HashSet` semantics on top of
    /// the `Vec` wire representation used for JSON stability.
    pub fn origin_set(coin: &CandidateCoin) -> HashSet<FeedOrigin> {
        coin.origins.iter().copied().collect()
    }
}

/// Union of the top `ai_limit` scored entries (by score desc) plus every
/// OI-growth entry; each resulting coin tags the feed(s) it originated from.
/// Extracted as a free function so callers that fetch the two feeds under
/// different per-trader enable flags (see `autotrader`) can merge without
/// going through `CandidatePool::merged`'s own fetch calls.
pub fn merge_feeds(scored: &[ScoredEntry], oi_growth: &[OiGrowthEntry], ai_limit: usize) -> Vec<CandidateCoin> {
    let mut sorted_scored: Vec<&ScoredEntry> = scored.iter().collect();
    sorted_scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let top_scored = sorted_scored.into_iter().take(ai_limit);

    let mut merged: Vec<CandidateCoin> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for entry in top_scored {
        index.insert(entry.symbol.clone(), merged.len());
        merged.push(CandidateCoin {
            symbol: entry.symbol.clone(),
            origins: vec![FeedOrigin::ScoredFeed],
        });
    }

    for entry in oi_growth {
        if let Some(&pos) = index.get(&entry.symbol) {
            if !merged[pos].origins.contains(&FeedOrigin::OiGrowthFeed) {
                merged[pos].origins.push(FeedOrigin::OiGrowthFeed);
            }
        } else {
            index.insert(entry.symbol.clone(), merged.len());
            merged.push(CandidateCoin {
                symbol: entry.symbol.clone(),
                origins: vec![FeedOrigin::OiGrowthFeed],
            });
        }
    }

    merged
}

async fn fetch_with_retries<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T, CoreError> {
    let mut last_err = None;
    for (attempt, delay) in std::iter::once(0).chain(FETCH_RETRY_DELAYS_SECS).enumerate() {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        let result = tokio::time::timeout(Duration::from_secs(FETCH_TIMEOUT_SECS), client.get(url).send()).await;
        match result {
            Ok(Ok(resp)) if resp.status().is_success() => {
                return resp.json::<T>().await.map_err(|e| CoreError::Parse(e.to_string()));
            }
            Ok(Ok(resp)) => {
                last_err = Some(CoreError::TransientIo(format!("status {}", resp.status())));
            }
            Ok(Err(e)) => last_err = Some(CoreError::TransientIo(e.to_string())),
            Err(_) => last_err = Some(CoreError::TransientIo("feed fetch timed out".to_string())),
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::TransientIo("feed fetch failed".to_string())))
}

async fn write_cache<T: Serialize>(path: &Path, entries: &[T]) {
    let Some(parent) = path.parent() else { return };
    if tokio::fs::create_dir_all(parent).await.is_err() {
        return;
    }
    let cache = CacheFile {
        fetched_at: Utc::now(),
        source_type: "api".to_string(),
        entries,
    };
    let Ok(json) = serde_json::to_vec_pretty(&cache) else { return };
    let tmp_path = path.with_extension("tmp");
    if tokio::fs::write(&tmp_path, json).await.is_ok() {
        let _ = tokio::fs::rename(&tmp_path, path).await;
    }
}

async fn load_cache<T: serde::de::DeserializeOwned>(path: &Path) -> Option<Vec<T>> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let cache: CacheFile<T> = serde_json::from_slice(&bytes).ok()?;
    let age = Utc::now().signed_duration_since(cache.fetched_at);
    if age.num_hours() >= STALE_CACHE_HOURS {
        warn!(
            age_hours = age.num_hours(),
            path = %path.display(),
            "candidate pool cache is stale but is being used anyway"
        );
    }
    Some(cache.entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_url_and_defaults_enabled_returns_default_set() {
        let pool = CandidatePool::new(CandidatePoolConfig::default(), reqwest::Client::new());
        let entries = pool.fetch_scored_feed().await;
        let symbols: Vec<&str> = entries.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, DEFAULT_COINS);
    }

    #[tokio::test]
    async fn no_url_and_defaults_disabled_returns_empty() {
        let mut config = CandidatePoolConfig::default();
        config.use_default_coins = false;
        let pool = CandidatePool::new(config, reqwest::Client::new());
        assert!(pool.fetch_scored_feed().await.is_empty());
    }

    #[tokio::test]
    async fn merged_combines_scored_and_oi_growth_with_tags() {
        let pool = CandidatePool::new(CandidatePoolConfig::default(), reqwest::Client::new());
        let merged = pool.merged(3).await;
        assert_eq!(merged.len(), 3);
        assert!(merged.iter().all(|c| c.origins.contains(&FeedOrigin::ScoredFeed)));
    }

    #[tokio::test]
    async fn fallback_to_cache_when_url_unreachable() {
        let tmp = std::env::temp_dir().join(format!("candidate-pool-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&tmp).await.unwrap();
        let cache = CacheFile {
            fetched_at: Utc::now() - chrono::Duration::minutes(10),
            source_type: "api".to_string(),
            entries: vec![ScoredEntry {
                symbol: "XYZUSDT".to_string(),
                score: 1.0,
                flags: vec![],
            }],
        };
        tokio::fs::write(tmp.join("latest.json"), serde_json::to_vec(&cache).unwrap())
            .await
            .unwrap();

        let config = CandidatePoolConfig {
            scored_feed_url: Some("http://127.0.0.1:1/unreachable".to_string()),
            oi_growth_feed_url: None,
            use_default_coins: true,
            default_coins: DEFAULT_COINS.iter().map(|s| s.to_string()).collect(),
            cache_dir: tmp.clone(),
        };
        let pool = CandidatePool::new(config, reqwest::Client::new());
        let entries = pool.fetch_scored_feed().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].symbol, "XYZUSDT");

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }
}
