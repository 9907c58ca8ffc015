//! Per-SKU listing activity statistics. Raw counts are recomputed after every
//! listing mutation; a periodic pass folds them into exponential moving
//! averages that drive the retention bands.

use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{stream, StreamExt};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::{EMA_ALPHA, EMA_EPSILON, EMA_FLOOR, STATS_INIT_CONCURRENCY};
use crate::db::models::ListingStatsRow;
use crate::error::Result;

#[derive(Clone)]
pub struct ActivityStats {
    pool: SqlitePool,
}

impl ActivityStats {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Recount current buy/sell listings for one SKU and upsert its stats row.
    pub async fn update_for_sku(&self, sku: &str) -> Result<()> {
        let (buy, sell): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE intent = 'buy'),
                COUNT(*) FILTER (WHERE intent = 'sell')
            FROM listings WHERE sku = ?
            "#,
        )
        .bind(sku)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO listing_stats (sku, current_buy_count, current_sell_count, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (sku) DO UPDATE SET
                current_buy_count = excluded.current_buy_count,
                current_sell_count = excluded.current_sell_count,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(sku)
        .bind(buy)
        .bind(sell)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh stats for a batch of SKUs; per-SKU failures are logged and do
    /// not stop the rest of the batch.
    pub async fn update_for_skus(&self, skus: &[String]) {
        for sku in skus {
            if let Err(e) = self.update_for_sku(sku).await {
                warn!(sku = %sku, "Listing stats update failed: {e}");
            }
        }
    }

    /// Rebuild stats for every SKU present in the listings table, with
    /// bounded concurrency. Run once at startup.
    pub async fn initialize_all(&self, skus: Vec<String>) {
        let total = skus.len();
        stream::iter(skus)
            .map(|sku| {
                let stats = self.clone();
                async move {
                    if let Err(e) = stats.update_for_sku(&sku).await {
                        warn!(sku = %sku, "Listing stats init failed: {e}");
                    }
                }
            })
            .buffer_unordered(STATS_INIT_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        info!(skus = total, "Listing stats initialized");
    }

    /// Fold current counts into the moving averages: EMA with α = 0.35,
    /// floored at 0.05 and rounded to 2 decimals. Rows whose averages move by
    /// less than epsilon are skipped to avoid write amplification.
    pub async fn update_moving_averages(&self) -> Result<()> {
        let rows: Vec<ListingStatsRow> = sqlx::query_as("SELECT * FROM listing_stats")
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let now = now_secs();
        let mut updated = 0usize;
        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let prev_buy = row.moving_avg_buy_count.unwrap_or(row.current_buy_count as f64);
            let prev_sell = row
                .moving_avg_sell_count
                .unwrap_or(row.current_sell_count as f64);

            let new_buy = smooth(row.current_buy_count as f64, prev_buy);
            let new_sell = smooth(row.current_sell_count as f64, prev_sell);

            // A NULL average is seeded unconditionally; after that, changes
            // below epsilon are suppressed.
            let unseeded =
                row.moving_avg_buy_count.is_none() || row.moving_avg_sell_count.is_none();
            if !unseeded
                && (new_buy - prev_buy).abs() <= EMA_EPSILON
                && (new_sell - prev_sell).abs() <= EMA_EPSILON
            {
                continue;
            }

            sqlx::query(
                r#"
                UPDATE listing_stats
                SET moving_avg_buy_count = ?, moving_avg_sell_count = ?, last_updated = ?
                WHERE sku = ?
                "#,
            )
            .bind(new_buy)
            .bind(new_sell)
            .bind(now)
            .bind(&row.sku)
            .execute(&mut *tx)
            .await?;
            updated += 1;
        }
        tx.commit().await?;

        if updated > 0 {
            info!(updated, total = rows.len(), "Moving averages updated");
        } else {
            debug!("No moving averages changed");
        }
        Ok(())
    }

    pub async fn get(&self, sku: &str) -> Result<Option<ListingStatsRow>> {
        Ok(sqlx::query_as("SELECT * FROM listing_stats WHERE sku = ?")
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?)
    }
}

fn smooth(current: f64, prev_avg: f64) -> f64 {
    let ema = EMA_ALPHA * current + (1.0 - EMA_ALPHA) * prev_avg;
    let clamped = ema.max(EMA_FLOOR);
    (clamped * 100.0).round() / 100.0
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
    use crate::db::listings::ListingStore;
    use crate::types::{Currencies, Intent, Listing};

    fn listing(sku: &str, intent: Intent, steamid: &str) -> Listing {
        Listing {
            name: "Team Captain".to_string(),
            sku: sku.to_string(),
            intent,
            currencies: Currencies::metal_only(10.0),
            steamid: steamid.to_string(),
            updated: 100,
        }
    }

    #[test]
    fn smoothing_floors_and_rounds() {
        // α·current + (1-α)·prev = 0.35*4 + 0.65*2 = 2.7
        assert!((smooth(4.0, 2.0) - 2.7).abs() < 1e-9);
        // Decayed-to-nothing averages bottom out at the floor.
        assert!((smooth(0.0, 0.0) - EMA_FLOOR).abs() < 1e-9);
        // Rounded to 2 decimals.
        assert!((smooth(1.0, 1.01) - 1.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn counts_follow_listing_mutations() {
        let pool = crate::db::connect_memory().await;
        let store = ListingStore::new(pool.clone());
        let stats = ActivityStats::new(pool);

        store.upsert(&listing("378;6", Intent::Buy, "a")).await.unwrap();
        store.upsert(&listing("378;6", Intent::Buy, "b")).await.unwrap();
        store.upsert(&listing("378;6", Intent::Sell, "c")).await.unwrap();
        stats.update_for_sku("378;6").await.unwrap();

        let row = stats.get("378;6").await.unwrap().unwrap();
        assert_eq!(row.current_buy_count, 2);
        assert_eq!(row.current_sell_count, 1);
        assert!(row.moving_avg_buy_count.is_none());
    }

    #[tokio::test]
    async fn moving_average_seeds_from_current_count() {
        let pool = crate::db::connect_memory().await;
        let store = ListingStore::new(pool.clone());
        let stats = ActivityStats::new(pool);

        for owner in ["a", "b", "c", "d"] {
            store.upsert(&listing("378;6", Intent::Buy, owner)).await.unwrap();
        }
        stats.update_for_sku("378;6").await.unwrap();
        stats.update_moving_averages().await.unwrap();

        // First pass seeds the previous average with the current count, so
        // the EMA equals the count itself.
        let row = stats.get("378;6").await.unwrap().unwrap();
        assert!((row.moving_avg_buy_count.unwrap() - 4.0).abs() < 1e-9);
        assert!((row.moving_avg_sell_count.unwrap() - EMA_FLOOR).abs() < 1e-9);
    }
}
