use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Currencies
// ---------------------------------------------------------------------------

/// A price expressed in whole keys plus fractional metal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Currencies {
    #[serde(default)]
    pub keys: i64,
    #[serde(default)]
    pub metal: f64,
}

impl Currencies {
    pub fn new(keys: i64, metal: f64) -> Self {
        Self { keys, metal }
    }

    pub fn metal_only(metal: f64) -> Self {
        Self { keys: 0, metal }
    }

    pub fn is_zero(&self) -> bool {
        self.keys == 0 && self.metal == 0.0
    }
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Buy,
    Sell,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Buy => "buy",
            Intent::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Intent::Buy),
            "sell" => Some(Intent::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An active classified listing. One owner holds at most one listing per
/// item per side; a newer event for the same key overwrites in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub name: String,
    pub sku: String,
    pub intent: Intent,
    pub currencies: Currencies,
    pub steamid: String,
    /// Unix seconds of the last update event for this listing.
    pub updated: i64,
}

/// Natural key of a listing row, used for de-duplication in batched writes.
pub type ListingKey = (String, String, Intent, String);

impl Listing {
    pub fn key(&self) -> ListingKey {
        (
            self.name.clone(),
            self.sku.clone(),
            self.intent,
            self.steamid.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Priced items
// ---------------------------------------------------------------------------

/// Source tag expected by downstream pricelist consumers.
pub const PRICE_SOURCE: &str = "bptf";

/// A finalized pricelist row. Invariant: buy value in metal-equivalent is
/// strictly below sell value by at least the configured margin at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedItem {
    pub name: String,
    pub sku: String,
    pub source: String,
    pub buy: Currencies,
    pub sell: Currencies,
    /// Unix seconds of the update that produced this price.
    pub time: i64,
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Quality tier of a SKU, used to relax baseline divergence validation for
/// item classes whose market prices legitimately wander far from baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Standard,
    /// Unusual and other rare qualities, including australium variants.
    Rare,
    Killstreak,
}

impl QualityTier {
    pub fn bypasses_divergence_check(&self) -> bool {
        !matches!(self, QualityTier::Standard)
    }
}

/// Normalized external reference quote for one SKU, both sides re-split into
/// keys/metal at the current key price.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineQuote {
    pub buy: Currencies,
    pub sell: Currencies,
    pub tier: QualityTier,
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Which source produced a provisional price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Listings,
    Baseline,
}

/// Pre-finalization buy/sell pair out of the derivation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionalPrice {
    pub buy: Currencies,
    pub sell: Currencies,
    pub source: PriceSource,
}

/// Immutable per-cycle pricing inputs. Snapshotted once per cycle so every
/// derivation in the cycle sees the same key price and baseline.
#[derive(Clone)]
pub struct PricingContext {
    pub key_metal: f64,
    pub baseline: std::sync::Arc<crate::baseline::BaselineSnapshot>,
}

/// Current metal value of one key. Written by the bootstrap and the key
/// price stabilizer; read (snapshotted) once per pricing cycle.
pub struct SharedKeyPrice(tokio::sync::RwLock<f64>);

impl SharedKeyPrice {
    pub fn new(metal: f64) -> Self {
        Self(tokio::sync::RwLock::new(metal))
    }

    pub async fn get(&self) -> f64 {
        *self.0.read().await
    }

    pub async fn set(&self, metal: f64) {
        *self.0.write().await = metal;
    }
}

// ---------------------------------------------------------------------------
// Item bounds
// ---------------------------------------------------------------------------

/// Optional per-item price clamps. Each field is independently optional;
/// absence means unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemBounds {
    pub min_buy_keys: Option<i64>,
    pub max_buy_keys: Option<i64>,
    pub min_buy_metal: Option<f64>,
    pub max_buy_metal: Option<f64>,
    pub min_sell_keys: Option<i64>,
    pub max_sell_keys: Option<i64>,
    pub min_sell_metal: Option<f64>,
    pub max_sell_metal: Option<f64>,
}

// ---------------------------------------------------------------------------
// Stream events — parsed frames routed from the WS manager to ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ListingUpdateEvent {
    pub name: String,
    pub steamid: String,
    pub intent: Intent,
    /// Raw currencies payload; validated and normalized by the filter chain.
    pub currencies: serde_json::Value,
    pub details: Option<String>,
    /// float_value attributes carried by the listed item (cosmetic variants).
    pub float_attributes: Vec<f64>,
    /// Whether the event carried an originating-agent marker.
    pub has_user_agent: bool,
}

#[derive(Debug, Clone)]
pub struct ListingDeleteEvent {
    pub name: String,
    pub steamid: String,
    pub intent: Intent,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Update(ListingUpdateEvent),
    Delete(ListingDeleteEvent),
}
