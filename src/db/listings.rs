//! Listing store: the durable table of active classified listings, plus the
//! activity-adaptive retention sweep.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, error, info};

use crate::db::models::{ListingRow, ListingStatsRow};
use crate::error::Result;
use crate::types::{Intent, Listing, ListingKey};

/// Failsafe: listings older than this are deleted regardless of activity
/// band, protecting against stale stats rows.
pub const HARD_MAX_AGE_SECS: i64 = 5 * 24 * 3600;

/// Maximum listing age for a side whose smoothed listing count is `ema`.
/// Busier items cycle their books faster, so their listings go stale sooner.
pub fn band_max_age_secs(ema: f64) -> i64 {
    if ema > 10.0 {
        35 * 60
    } else if ema > 8.0 {
        2 * 3600
    } else if ema > 6.0 {
        6 * 3600
    } else if ema > 4.0 {
        24 * 3600
    } else if ema > 2.0 {
        3 * 24 * 3600
    } else {
        5 * 24 * 3600
    }
}

#[derive(Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite by natural key. An existing row only gives way to
    /// a newer event (last-timestamp-wins).
    pub async fn upsert(&self, listing: &Listing) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO listings (name, sku, intent, steamid, currency_keys, currency_metal, updated)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (name, sku, intent, steamid) DO UPDATE SET
                currency_keys = excluded.currency_keys,
                currency_metal = excluded.currency_metal,
                updated = excluded.updated
            WHERE excluded.updated >= listings.updated
            "#,
        )
        .bind(&listing.name)
        .bind(&listing.sku)
        .bind(listing.intent.as_str())
        .bind(&listing.steamid)
        .bind(listing.currencies.keys)
        .bind(listing.currencies.metal)
        .bind(listing.updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Batched upsert for the ingest debounce window. Input is de-duplicated
    /// by natural key, keeping the last event per key. Returns the distinct
    /// SKUs touched so the caller can refresh their activity stats.
    pub async fn upsert_batch(&self, listings: Vec<Listing>) -> Result<Vec<String>> {
        if listings.is_empty() {
            return Ok(Vec::new());
        }

        let mut deduped: HashMap<ListingKey, Listing> = HashMap::with_capacity(listings.len());
        for listing in listings {
            deduped.insert(listing.key(), listing);
        }
        let rows: Vec<Listing> = deduped.into_values().collect();

        let mut skus: Vec<String> = rows.iter().map(|l| l.sku.clone()).collect();
        skus.sort();
        skus.dedup();

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO listings (name, sku, intent, steamid, currency_keys, currency_metal, updated) ",
        );
        builder.push_values(rows.iter(), |mut b, l| {
            b.push_bind(&l.name)
                .push_bind(&l.sku)
                .push_bind(l.intent.as_str())
                .push_bind(&l.steamid)
                .push_bind(l.currencies.keys)
                .push_bind(l.currencies.metal)
                .push_bind(l.updated);
        });
        builder.push(
            r#"
            ON CONFLICT (name, sku, intent, steamid) DO UPDATE SET
                currency_keys = excluded.currency_keys,
                currency_metal = excluded.currency_metal,
                updated = excluded.updated
            WHERE excluded.updated >= listings.updated
            "#,
        );
        builder.build().execute(&self.pool).await?;

        Ok(skus)
    }

    /// Remove one owner's listing for an item/side. Returns the SKU of the
    /// removed listing, if any row matched.
    pub async fn remove(
        &self,
        steamid: &str,
        name: &str,
        intent: Intent,
    ) -> Result<Option<String>> {
        let sku: Option<(String,)> = sqlx::query_as(
            "SELECT sku FROM listings WHERE steamid = ? AND name = ? AND intent = ? LIMIT 1",
        )
        .bind(steamid)
        .bind(name)
        .bind(intent.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if sku.is_some() {
            sqlx::query("DELETE FROM listings WHERE steamid = ? AND name = ? AND intent = ?")
                .bind(steamid)
                .bind(name)
                .bind(intent.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(sku.map(|(s,)| s))
    }

    /// Current listings for one item and side, unordered.
    pub async fn query(&self, name: &str, intent: Intent) -> Result<Vec<Listing>> {
        let rows: Vec<ListingRow> =
            sqlx::query_as("SELECT * FROM listings WHERE name = ? AND intent = ?")
                .bind(name)
                .bind(intent.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().filter_map(ListingRow::into_listing).collect())
    }

    pub async fn distinct_skus(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT sku FROM listings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    /// Delete listings whose age exceeds their activity band's threshold,
    /// buy and sell sides banded independently. Never errors the caller:
    /// failures are logged per band and the sweep moves on.
    pub async fn sweep_expired(&self) {
        let now = now_secs();

        let stats: Vec<ListingStatsRow> = match sqlx::query_as(
            "SELECT * FROM listing_stats",
        )
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!("Retention sweep could not read listing stats: {e}");
                Vec::new()
            }
        };

        let mut deleted_total: u64 = 0;
        for intent in [Intent::Buy, Intent::Sell] {
            // Group SKUs by their band cutoff so each band is one DELETE.
            let mut bands: HashMap<i64, Vec<&str>> = HashMap::new();
            for row in &stats {
                let ema = match intent {
                    Intent::Buy => row.moving_avg_buy_count,
                    Intent::Sell => row.moving_avg_sell_count,
                }
                .unwrap_or(0.0);
                bands
                    .entry(band_max_age_secs(ema))
                    .or_default()
                    .push(&row.sku);
            }

            for (max_age, skus) in bands {
                let cutoff = now - max_age;
                let mut builder: QueryBuilder<Sqlite> =
                    QueryBuilder::new("DELETE FROM listings WHERE intent = ");
                builder.push_bind(intent.as_str());
                builder.push(" AND updated <= ");
                builder.push_bind(cutoff);
                builder.push(" AND sku IN (");
                let mut separated = builder.separated(", ");
                for sku in &skus {
                    separated.push_bind(*sku);
                }
                builder.push(")");

                match builder.build().execute(&self.pool).await {
                    Ok(result) => deleted_total += result.rows_affected(),
                    Err(e) => error!(
                        intent = %intent,
                        max_age_secs = max_age,
                        "Retention sweep band failed: {e}"
                    ),
                }
            }
        }

        // Failsafe for rows whose SKU has no stats row or whose stats went stale.
        match sqlx::query("DELETE FROM listings WHERE updated <= ?")
            .bind(now - HARD_MAX_AGE_SECS)
            .execute(&self.pool)
            .await
        {
            Ok(result) => deleted_total += result.rows_affected(),
            Err(e) => error!("Retention sweep failsafe failed: {e}"),
        }

        if deleted_total > 0 {
            info!(deleted = deleted_total, "Retention sweep removed expired listings");
        } else {
            debug!("Retention sweep found nothing to remove");
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
