//! Database row types used by the runtime-checked sqlx queries.

use crate::types::{Currencies, Intent, Listing};

#[derive(Debug, sqlx::FromRow)]
pub struct ListingRow {
    pub name: String,
    pub sku: String,
    pub intent: String,
    pub steamid: String,
    pub currency_keys: i64,
    pub currency_metal: f64,
    pub updated: i64,
}

impl ListingRow {
    /// Returns None for intent values outside the table's CHECK constraint.
    pub fn into_listing(self) -> Option<Listing> {
        Some(Listing {
            intent: Intent::parse(&self.intent)?,
            name: self.name,
            sku: self.sku,
            currencies: Currencies::new(self.currency_keys, self.currency_metal),
            steamid: self.steamid,
            updated: self.updated,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ListingStatsRow {
    pub sku: String,
    pub current_buy_count: i64,
    pub current_sell_count: i64,
    pub moving_avg_buy_count: Option<f64>,
    pub moving_avg_sell_count: Option<f64>,
    pub last_updated: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct PriceHistoryRow {
    pub buy_metal: f64,
    pub sell_metal: f64,
    pub timestamp: i64,
}
