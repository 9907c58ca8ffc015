//! Name ↔ SKU resolution, supplied by an injected schema service, plus the
//! SKU quality conventions used to tag quality tiers.
//!
//! SKU format: `<defindex>;<quality>[;<variant>...]`. Qualities 5 and 14 and
//! the `;australium` variant are rare tier; `;kt-<n>` marks killstreak tier.

use std::path::Path;

use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::types::QualityTier;

pub trait SkuResolver: Send + Sync {
    fn sku_from_name(&self, name: &str) -> Option<String>;
    fn name_from_sku(&self, sku: &str) -> Option<String>;
}

/// Schema service backed by a JSON dump: `{"items": [{"name": ..., "sku": ...}]}`.
pub struct FileSchema {
    by_name: DashMap<String, String>,
    by_sku: DashMap<String, String>,
}

#[derive(Deserialize)]
struct SchemaFile {
    items: Vec<SchemaEntry>,
}

#[derive(Deserialize)]
struct SchemaEntry {
    name: String,
    sku: String,
}

impl FileSchema {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read schema {}: {e}", path.display()))
        })?;
        let file: SchemaFile = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid schema {}: {e}", path.display())))?;

        let by_name = DashMap::new();
        let by_sku = DashMap::new();
        for entry in file.items {
            by_name.insert(entry.name.clone(), entry.sku.clone());
            by_sku.insert(entry.sku, entry.name);
        }
        Ok(Self { by_name, by_sku })
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let by_name = DashMap::new();
        let by_sku = DashMap::new();
        for (name, sku) in pairs {
            by_name.insert(name.to_string(), sku.to_string());
            by_sku.insert(sku.to_string(), name.to_string());
        }
        Self { by_name, by_sku }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

impl SkuResolver for FileSchema {
    fn sku_from_name(&self, name: &str) -> Option<String> {
        self.by_name.get(name).map(|r| r.value().clone())
    }

    fn name_from_sku(&self, sku: &str) -> Option<String> {
        self.by_sku.get(sku).map(|r| r.value().clone())
    }
}

/// Quality component of a SKU (second `;`-separated field).
pub fn quality(sku: &str) -> Option<&str> {
    sku.split(';').nth(1)
}

pub fn quality_tier(sku: &str) -> QualityTier {
    if sku.contains(";kt-") {
        return QualityTier::Killstreak;
    }
    if matches!(quality(sku), Some("5") | Some("14")) || sku.contains(";australium") {
        return QualityTier::Rare;
    }
    QualityTier::Standard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_both_directions() {
        let schema = FileSchema::from_pairs(&[("Team Captain", "378;6")]);
        assert_eq!(schema.sku_from_name("Team Captain").as_deref(), Some("378;6"));
        assert_eq!(schema.name_from_sku("378;6").as_deref(), Some("Team Captain"));
        assert!(schema.sku_from_name("Unknown Hat").is_none());
    }

    #[test]
    fn quality_tiers() {
        assert_eq!(quality_tier("378;6"), QualityTier::Standard);
        assert_eq!(quality_tier("378;5;u13"), QualityTier::Rare);
        assert_eq!(quality_tier("378;14"), QualityTier::Rare);
        assert_eq!(quality_tier("205;11;australium"), QualityTier::Rare);
        assert_eq!(quality_tier("205;6;kt-3"), QualityTier::Killstreak);
    }
}
