//! The durable pricelist snapshot. All finalized prices from a cycle are
//! merged into the in-memory snapshot and written through one atomic
//! write-temp-then-rename, so readers of the file always see a complete
//! prior or current snapshot.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::Result;
use crate::types::PricedItem;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PricelistFile {
    items: Vec<PricedItem>,
}

pub struct Pricelist {
    path: PathBuf,
    /// sku → latest accepted price. The write lock is the single-writer
    /// discipline: `commit` is the only mutation path.
    items: RwLock<HashMap<String, PricedItem>>,
}

impl Pricelist {
    /// Load the snapshot from disk, dropping malformed and zero-priced rows.
    /// A missing file starts an empty pricelist.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut items = HashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PricelistFile>(&raw) {
                Ok(file) => {
                    let total = file.items.len();
                    for item in file.items {
                        if item.name.is_empty() || item.sku.is_empty() {
                            continue;
                        }
                        if item.buy.is_zero() && item.sell.is_zero() {
                            continue;
                        }
                        items.insert(item.sku.clone(), item);
                    }
                    info!(
                        loaded = items.len(),
                        dropped = total - items.len(),
                        "Pricelist loaded from {}",
                        path.display()
                    );
                }
                Err(e) => warn!("Pricelist {} is invalid, starting empty: {e}", path.display()),
            },
            Err(_) => info!("No pricelist at {}, starting empty", path.display()),
        }

        Self {
            path,
            items: RwLock::new(items),
        }
    }

    pub async fn get(&self, sku: &str) -> Option<PricedItem> {
        self.items.read().await.get(sku).cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// Full snapshot, unordered.
    pub async fn read(&self) -> Vec<PricedItem> {
        self.items.read().await.values().cloned().collect()
    }

    /// Merge a batch of finalized prices and persist the whole snapshot via
    /// temp-file-then-rename.
    pub async fn commit(&self, diff: Vec<PricedItem>) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }

        // The write guard is held across the file replace so concurrent
        // commits serialize and the file matches the in-memory snapshot.
        let mut items = self.items.write().await;
        for item in diff {
            if item.name.is_empty() || item.sku.is_empty() {
                warn!("Skipping malformed pricelist row: {item:?}");
                continue;
            }
            items.insert(item.sku.clone(), item);
        }

        let file = PricelistFile {
            items: items.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Entries older than `max_age_secs`, for the staleness report.
    pub async fn stale_entries(&self, now: i64, max_age_secs: i64) -> Vec<(String, i64)> {
        self.items
            .read()
            .await
            .values()
            .filter(|item| now - item.time > max_age_secs)
            .map(|item| (item.name.clone(), now - item.time))
            .collect()
    }
}
