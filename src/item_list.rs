//! Hot-reloadable allow-list of priced item names and their optional price
//! bounds, maintained externally as `item_list.json`. A periodic task polls
//! the file's mtime and reloads on change.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use dashmap::{DashMap, DashSet};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::types::ItemBounds;

#[derive(Deserialize)]
struct ItemListFile {
    items: Vec<ItemListEntry>,
}

#[derive(Deserialize)]
struct ItemListEntry {
    name: String,
    #[serde(flatten)]
    bounds: ItemBounds,
}

pub struct ItemList {
    path: PathBuf,
    /// Ingest everything; the allow-list still scopes pricing.
    price_all: bool,
    names: DashSet<String>,
    bounds: DashMap<String, ItemBounds>,
    /// mtime (unix secs) of the last loaded file version.
    last_modified: AtomicU64,
}

impl ItemList {
    pub fn load(path: impl Into<PathBuf>, price_all: bool) -> Result<Self> {
        let list = Self {
            path: path.into(),
            price_all,
            names: DashSet::new(),
            bounds: DashMap::new(),
            last_modified: AtomicU64::new(0),
        };
        list.reload()?;
        Ok(list)
    }

    fn reload(&self) -> Result<()> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let file: ItemListFile = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("invalid item list {}: {e}", self.path.display()))
        })?;

        self.names.clear();
        self.bounds.clear();
        for entry in file.items {
            self.names.insert(entry.name.clone());
            self.bounds.insert(entry.name, entry.bounds);
        }
        info!(items = self.names.len(), "Item allow-list loaded");
        Ok(())
    }

    /// Reload if the file changed since the last poll. Read errors are logged
    /// and the previous list stays in effect.
    pub fn reload_if_changed(&self) {
        let mtime_secs = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(m) => m
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            Err(e) => {
                warn!("Cannot stat item list {}: {e}", self.path.display());
                return;
            }
        };

        if self.last_modified.swap(mtime_secs, Ordering::Relaxed) == mtime_secs {
            return;
        }
        if let Err(e) = self.reload() {
            warn!("Item list reload failed: {e}");
        }
    }

    /// Whether events for this item should be ingested.
    pub fn tracks(&self, name: &str) -> bool {
        self.price_all || self.names.contains(name)
    }

    /// Names eligible for the pricing cycle.
    pub fn allowed_names(&self) -> Vec<String> {
        self.names.iter().map(|r| r.key().clone()).collect()
    }

    pub fn bounds_for(&self, name: &str) -> ItemBounds {
        self.bounds
            .get(name)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }
}
