//! Append-only price history tables: one per-SKU table feeding the swing
//! guard and sell-side outlier checks, and one dedicated table for the
//! denominating currency item feeding the key price stabilizer.

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::models::PriceHistoryRow;
use crate::error::Result;

#[derive(Clone)]
pub struct PriceHistory {
    pool: SqlitePool,
}

/// One accepted finalized price, queued for the cycle's batched insert.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sku: String,
    pub buy_metal: f64,
    pub sell_metal: f64,
    pub timestamp: i64,
}

impl PriceHistory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Single batched insert for all prices accepted in one cycle.
    pub async fn append_batch(&self, entries: &[HistoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO price_history (sku, buy_metal, sell_metal, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(&entry.sku)
            .bind(entry.buy_metal)
            .bind(entry.sell_metal)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent history rows for a SKU, newest first.
    pub async fn recent(&self, sku: &str, limit: i64) -> Result<Vec<PriceHistoryRow>> {
        Ok(sqlx::query_as(
            "SELECT buy_metal, sell_metal, timestamp FROM price_history
             WHERE sku = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(sku)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Most recent recorded sell prices for a SKU, newest first.
    pub async fn recent_sells(&self, sku: &str, limit: i64) -> Result<Vec<f64>> {
        Ok(self
            .recent(sku, limit)
            .await?
            .into_iter()
            .map(|r| r.sell_metal)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Key prices
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct KeyPriceHistory {
    pool: SqlitePool,
    sku: String,
}

/// Buy/sell samples inside one stabilizer window.
#[derive(Debug, Default, Clone)]
pub struct KeyPriceWindow {
    pub buys: Vec<f64>,
    pub sells: Vec<f64>,
}

impl KeyPriceHistory {
    pub fn new(pool: SqlitePool, sku: String) -> Self {
        Self { pool, sku }
    }

    /// Record a derived key price. Values outside ±20% of the current key
    /// metal value are rejected as abnormal and only logged.
    pub async fn insert(
        &self,
        current_key_metal: f64,
        buy_metal: f64,
        sell_metal: f64,
        timestamp: i64,
    ) -> Result<()> {
        let lower = current_key_metal * 0.8;
        let upper = current_key_metal * 1.2;
        if buy_metal < lower || buy_metal > upper || sell_metal < lower || sell_metal > upper {
            warn!(
                buy = buy_metal,
                sell = sell_metal,
                key = current_key_metal,
                "Abnormal key price rejected"
            );
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO key_prices (sku, buy_metal, sell_metal, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.sku)
        .bind(buy_metal)
        .bind(sell_metal)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Samples recorded in `[from, to)`, in unix seconds.
    pub async fn window(&self, from: i64, to: i64) -> Result<KeyPriceWindow> {
        let rows: Vec<(f64, f64)> = sqlx::query_as(
            "SELECT buy_metal, sell_metal FROM key_prices
             WHERE sku = ? AND timestamp >= ? AND timestamp < ?",
        )
        .bind(&self.sku)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut window = KeyPriceWindow::default();
        for (buy, sell) in rows {
            window.buys.push(buy);
            window.sells.push(sell);
        }
        Ok(window)
    }

    pub async fn cleanup_older_than(&self, cutoff: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM key_prices WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(deleted = result.rows_affected(), "Old key prices cleaned up");
        }
        Ok(())
    }
}
