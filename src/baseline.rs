//! Baseline price resolver: wraps the external reference feed into
//! normalized buy/sell quotes per SKU. The last good feed is cached in
//! memory and mirrored to disk so a feed outage degrades instead of
//! blinding the divergence checks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{Config, FEED_FETCH_ATTEMPTS, FEED_FETCH_BACKOFF_MS};
use crate::currency::{parse_price, round_to_scrap};
use crate::error::{AppError, PricingError, Result};
use crate::schema::quality_tier;
use crate::types::{BaselineQuote, Currencies};

/// One raw price point from the external feed. `value` is the reference
/// price, `value_high` the upper bound when the authority publishes a range,
/// in units of `currency` ("keys" or "metal").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFeedItem {
    pub sku: String,
    #[serde(default)]
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub value_high: Option<f64>,
    pub currency: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FeedFile {
    items: Vec<RawFeedItem>,
}

/// Immutable view of one fetched feed. Cycles hold an `Arc` of the snapshot
/// they started with, so a mid-cycle refresh never changes their inputs.
#[derive(Debug, Default)]
pub struct BaselineSnapshot {
    items: HashMap<String, RawFeedItem>,
    pub fetched_at: i64,
}

impl BaselineSnapshot {
    fn from_feed(items: Vec<RawFeedItem>, fetched_at: i64) -> Self {
        let items = items.into_iter().map(|i| (i.sku.clone(), i)).collect();
        Self { items, fetched_at }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Normalized quote for a SKU at the given key price: `value` becomes the
    /// buy side, `value_high` (or `value`) the sell side, both converted to
    /// metal and re-split into keys/metal.
    pub fn quote(&self, sku: &str, key_metal: f64) -> std::result::Result<BaselineQuote, PricingError> {
        let item = self.items.get(sku).ok_or(PricingError::BaselineUnavailable)?;

        let unit = if item.currency == "keys" { key_metal } else { 1.0 };
        let buy_metal = round_to_scrap(item.value * unit);
        let sell_metal = round_to_scrap(item.value_high.unwrap_or(item.value) * unit);

        if buy_metal == 0.0 && sell_metal == 0.0 {
            return Err(PricingError::BaselineZeroPrice);
        }

        Ok(BaselineQuote {
            buy: parse_price(&Currencies::metal_only(buy_metal), key_metal),
            sell: parse_price(&Currencies::metal_only(sell_metal), key_metal),
            tier: quality_tier(sku),
        })
    }

    /// Metal value of the denominating currency item itself. Only meaningful
    /// when the feed prices it in metal.
    pub fn key_metal(&self, key_sku: &str) -> Option<f64> {
        let item = self.items.get(key_sku)?;
        if item.currency != "metal" || item.value <= 0.0 {
            return None;
        }
        Some(round_to_scrap(item.value))
    }
}

pub struct BaselineResolver {
    url: String,
    cache_path: PathBuf,
    client: reqwest::Client,
    snapshot: RwLock<Arc<BaselineSnapshot>>,
}

impl BaselineResolver {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        // Seed from the disk cache when one exists; refresh replaces it.
        let snapshot = match load_cache(&PathBuf::from(&cfg.baseline_cache_path)) {
            Some(snap) => {
                info!(items = snap.len(), "Baseline cache loaded from disk");
                Arc::new(snap)
            }
            None => Arc::new(BaselineSnapshot::default()),
        };

        Ok(Self {
            url: cfg.baseline_feed_url.clone(),
            cache_path: PathBuf::from(&cfg.baseline_cache_path),
            client,
            snapshot: RwLock::new(snapshot),
        })
    }

    pub async fn snapshot(&self) -> Arc<BaselineSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Fetch the feed with bounded retries. On success the snapshot is
    /// swapped and mirrored to the cache file; on failure the last good
    /// snapshot (memory or disk) stays in service. Only a cold start with no
    /// cache at all propagates an error.
    pub async fn refresh(&self) -> Result<()> {
        let mut last_err: Option<AppError> = None;

        for attempt in 0..FEED_FETCH_ATTEMPTS {
            if attempt > 0 {
                let backoff = FEED_FETCH_BACKOFF_MS
                    .get(attempt as usize - 1)
                    .copied()
                    .unwrap_or(*FEED_FETCH_BACKOFF_MS.last().unwrap_or(&15_000));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            match self.fetch_once().await {
                Ok(items) => {
                    let snap = Arc::new(BaselineSnapshot::from_feed(items, now_secs()));
                    info!(items = snap.len(), "Baseline feed refreshed");
                    self.write_cache(&snap).await;
                    *self.snapshot.write().await = snap;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, "Baseline feed fetch failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        if !self.snapshot.read().await.is_empty() {
            warn!("Baseline feed unavailable, serving last cached snapshot");
            return Ok(());
        }
        if let Some(snap) = load_cache(&self.cache_path) {
            warn!(items = snap.len(), "Baseline feed unavailable, loaded disk cache");
            *self.snapshot.write().await = Arc::new(snap);
            return Ok(());
        }
        Err(AppError::FeedUnavailable(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no attempts made".to_string()),
        ))
    }

    async fn fetch_once(&self) -> Result<Vec<RawFeedItem>> {
        let feed: FeedFile = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if feed.items.is_empty() {
            return Err(AppError::FeedUnavailable(
                "feed returned no items".to_string(),
            ));
        }
        Ok(feed.items)
    }

    async fn write_cache(&self, snap: &BaselineSnapshot) {
        let file = FeedFile {
            items: snap.items.values().cloned().collect(),
        };
        let json = match serde_json::to_vec(&file) {
            Ok(j) => j,
            Err(e) => {
                warn!("Baseline cache serialization failed: {e}");
                return;
            }
        };
        if let Some(parent) = self.cache_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&self.cache_path, json).await {
            warn!("Baseline cache write failed: {e}");
        }
    }
}

fn load_cache(path: &PathBuf) -> Option<BaselineSnapshot> {
    let raw = std::fs::read_to_string(path).ok()?;
    let feed: FeedFile = serde_json::from_str(&raw).ok()?;
    if feed.items.is_empty() {
        return None;
    }
    Some(BaselineSnapshot::from_feed(feed.items, 0))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualityTier;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: f64 = 62.11;

    fn cfg_for(url: String, cache: &std::path::Path) -> Config {
        Config {
            baseline_feed_url: url,
            baseline_cache_path: cache.to_string_lossy().into_owned(),
            ..Config::default()
        }
    }

    fn feed_json() -> serde_json::Value {
        serde_json::json!({
            "items": [
                { "sku": "378;6", "name": "Team Captain", "value": 20.0, "value_high": 22.0, "currency": "metal" },
                { "sku": "30743;5;u13", "name": "Burning Hat", "value": 3.0, "currency": "keys" },
                { "sku": "5021;6", "name": "Mann Co. Supply Crate Key", "value": 62.11, "currency": "metal" },
                { "sku": "111;6", "name": "Free Hat", "value": 0.0, "currency": "metal" }
            ]
        })
    }

    #[test]
    fn quote_converts_key_denominated_values() {
        let snap = BaselineSnapshot::from_feed(
            vec![RawFeedItem {
                sku: "30743;5;u13".into(),
                name: String::new(),
                value: 3.0,
                value_high: None,
                currency: "keys".into(),
            }],
            0,
        );
        let quote = snap.quote("30743;5;u13", KEY).unwrap();
        assert_eq!(quote.buy.keys, 3);
        assert!((quote.buy.metal - 0.0).abs() < 1e-9);
        assert_eq!(quote.tier, QualityTier::Rare);
    }

    #[test]
    fn quote_uses_value_high_for_sell() {
        let snap = BaselineSnapshot::from_feed(
            vec![RawFeedItem {
                sku: "378;6".into(),
                name: String::new(),
                value: 20.0,
                value_high: Some(22.0),
                currency: "metal".into(),
            }],
            0,
        );
        let quote = snap.quote("378;6", KEY).unwrap();
        assert!((quote.buy.metal - 20.0).abs() < 1e-9);
        assert!((quote.sell.metal - 22.0).abs() < 1e-9);
    }

    #[test]
    fn zero_priced_quote_is_rejected() {
        let snap = BaselineSnapshot::from_feed(
            vec![RawFeedItem {
                sku: "111;6".into(),
                name: String::new(),
                value: 0.0,
                value_high: None,
                currency: "metal".into(),
            }],
            0,
        );
        assert_eq!(snap.quote("111;6", KEY), Err(PricingError::BaselineZeroPrice));
        assert_eq!(snap.quote("404;6", KEY), Err(PricingError::BaselineUnavailable));
    }

    #[tokio::test]
    async fn refresh_populates_snapshot_and_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feed_json()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("baseline-cache.json");
        let resolver = BaselineResolver::new(&cfg_for(server.uri(), &cache)).unwrap();

        resolver.refresh().await.unwrap();
        let snap = resolver.snapshot().await;
        assert_eq!(snap.len(), 4);
        assert_eq!(snap.key_metal("5021;6"), Some(62.11));
        assert!(cache.exists());
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("baseline-cache.json");
        std::fs::write(&cache, feed_json().to_string()).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let resolver = BaselineResolver::new(&cfg_for(server.uri(), &cache)).unwrap();
        // Cache was loaded at construction, so refresh degrades silently.
        resolver.refresh().await.unwrap();
        assert_eq!(resolver.snapshot().await.len(), 4);
    }
}
