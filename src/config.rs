use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, Result};

/// Reconnect backoff values in milliseconds.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[1_000, 2_000, 4_000, 8_000, 16_000];

/// Heartbeat ping interval (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Debounce window for coalescing listing-update events into one batched
/// upsert (seconds).
pub const INGEST_BATCH_INTERVAL_SECS: u64 = 10;

/// Outbound dispatcher drain tick (milliseconds): one price per tick.
pub const EMIT_INTERVAL_MS: u64 = 20;

/// Pricing cycle cadence (seconds).
pub const PRICING_INTERVAL_SECS: u64 = 15 * 60;

/// Moving-average smoothing cadence (seconds).
pub const MOVING_AVG_INTERVAL_SECS: u64 = 15 * 60;

/// Retention sweep cadence (seconds); the sweep additionally runs right
/// before every pricing cycle.
pub const SWEEP_INTERVAL_SECS: u64 = 15 * 60;

/// Baseline feed refresh cadence (seconds).
pub const BASELINE_REFRESH_INTERVAL_SECS: u64 = 30 * 60;

/// Key price stability check cadence (seconds).
pub const KEY_STABILITY_INTERVAL_SECS: u64 = 30 * 60;

/// Old key price cleanup cadence (seconds).
pub const KEY_CLEANUP_INTERVAL_SECS: u64 = 30 * 60;

/// Allow-list / bounds file reload poll cadence (seconds).
pub const ITEM_LIST_POLL_SECS: u64 = 30;

/// Stale pricelist entry report cadence (seconds).
pub const STALE_CHECK_INTERVAL_SECS: u64 = 5 * 60;

/// Bounded parallelism for per-item derivations inside one pricing cycle.
pub const DERIVE_CONCURRENCY: usize = 15;

/// Bounded parallelism for the startup listing-stats rebuild.
pub const STATS_INIT_CONCURRENCY: usize = 10;

/// Exponential moving average smoothing factor for listing counts.
pub const EMA_ALPHA: f64 = 0.35;

/// Moving averages never drop below this floor.
pub const EMA_FLOOR: f64 = 0.05;

/// Moving-average updates smaller than this are suppressed to avoid write
/// amplification.
pub const EMA_EPSILON: f64 = 1e-6;

/// Key price rows older than this many days are deleted.
pub const KEY_PRICE_MAX_AGE_DAYS: i64 = 30;

/// Baseline feed fetch attempts before degrading to cache.
pub const FEED_FETCH_ATTEMPTS: u32 = 3;

/// Backoff between baseline feed fetch attempts (milliseconds).
pub const FEED_FETCH_BACKOFF_MS: &[u64] = &[1_000, 5_000, 15_000];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceSwingLimits {
    /// Maximum fractional buy increase against recent history (0.1 = 10%).
    pub max_buy_increase: f64,
    /// Maximum fractional sell decrease against recent history.
    pub max_sell_decrease: f64,
}

impl Default for PriceSwingLimits {
    fn default() -> Self {
        Self {
            max_buy_increase: 0.1,
            max_sell_decrease: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaxPercentageDifferences {
    /// Upper bound on buy divergence from baseline, in percent.
    pub buy: f64,
    /// Lower bound on sell divergence from baseline, in percent (negative).
    pub sell: f64,
}

impl Default for MaxPercentageDifferences {
    fn default() -> Self {
        Self {
            buy: 10.0,
            sell: -10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub listing_stream_url: String,
    pub baseline_feed_url: String,
    pub log_level: String,
    pub db_path: String,
    pub pricelist_path: String,
    pub item_list_path: String,
    pub schema_path: String,
    pub baseline_cache_path: String,
    pub ws_log_path: String,

    /// Ingest every item regardless of the allow-list. Pricing still only
    /// covers allow-listed names.
    pub price_all_items: bool,
    /// When per-item derivation fails, publish the baseline quote verbatim
    /// instead of skipping the item.
    pub fallback_onto_baseline: bool,
    /// Skip sell candidates that are z-score outliers against the SKU's
    /// recorded sell history.
    pub sell_history_guard: bool,

    /// Owners whose listings are evaluated ahead of everyone else's.
    pub trusted_steam_ids: Vec<String>,
    /// Owners whose listings are dropped on ingest.
    pub excluded_steam_ids: Vec<String>,
    /// Blocked free-text terms, matched on word boundaries.
    pub excluded_listing_descriptions: Vec<String>,
    /// Blocked float-valued attributes (cosmetic variants), keyed by the
    /// variant name that exempts items carrying it in their own name.
    pub blocked_attributes: HashMap<String, f64>,

    pub min_sell_margin: f64,
    pub max_percentage_differences: MaxPercentageDifferences,
    pub price_swing_limits: PriceSwingLimits,

    /// SKU and name of the denominating currency item.
    pub key_sku: String,
    pub key_item_name: String,

    /// Pricelist entries older than this many seconds are reported as stale.
    pub stale_price_age_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listing_stream_url: "wss://ws.backpack.tf/events".to_string(),
            baseline_feed_url: "https://autobot.tf/json/pricelist-array".to_string(),
            log_level: "info".to_string(),
            db_path: "autopricer.db".to_string(),
            pricelist_path: "files/pricelist.json".to_string(),
            item_list_path: "files/item_list.json".to_string(),
            schema_path: "files/schema.json".to_string(),
            baseline_cache_path: "files/baseline-cache.json".to_string(),
            ws_log_path: "logs/websocket.log".to_string(),
            price_all_items: false,
            fallback_onto_baseline: false,
            sell_history_guard: true,
            trusted_steam_ids: Vec::new(),
            excluded_steam_ids: Vec::new(),
            excluded_listing_descriptions: Vec::new(),
            blocked_attributes: HashMap::new(),
            min_sell_margin: 0.11,
            max_percentage_differences: MaxPercentageDifferences::default(),
            price_swing_limits: PriceSwingLimits::default(),
            key_sku: "5021;6".to_string(),
            key_item_name: "Mann Co. Supply Crate Key".to_string(),
            stale_price_age_secs: 2 * 3600,
        }
    }
}

impl Config {
    /// Load from a JSON config file; missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let cfg: Config = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid config {}: {e}", path.display())))?;
        if cfg.min_sell_margin < 0.0 {
            return Err(AppError::Config("minSellMargin must be >= 0".to_string()));
        }
        Ok(cfg)
    }
}
