//! Ingestion pipeline: screens raw stream events through the filter chain,
//! coalesces surviving updates inside a debounce window into one batched
//! upsert, and applies deletes immediately. Every mutation refreshes the
//! affected SKUs' activity stats.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::config::{Config, INGEST_BATCH_INTERVAL_SECS};
use crate::db::listings::ListingStore;
use crate::db::stats::ActivityStats;
use crate::item_list::ItemList;
use crate::schema::SkuResolver;
use crate::types::{Currencies, Listing, ListingKey, ListingUpdateEvent, StreamEvent};

// ---------------------------------------------------------------------------
// Filter chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Item is not in the interest set.
    NotTracked,
    /// No originating-agent marker: human-posted noise.
    NoAgentMarker,
    /// Currencies payload carried no recognized unit.
    BadCurrencies,
    SkuUnresolvable,
    ExcludedOwner,
    /// Free-text details missing or matching a blocked term.
    BlockedDescription,
    /// Item carries a blocked float-valued attribute without a name exemption.
    BlockedAttribute,
}

#[derive(Debug, Default)]
struct RejectCounters {
    not_tracked: u64,
    no_agent: u64,
    bad_currencies: u64,
    unresolvable: u64,
    excluded_owner: u64,
    blocked_description: u64,
    blocked_attribute: u64,
}

impl RejectCounters {
    fn bump(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::NotTracked => self.not_tracked += 1,
            RejectReason::NoAgentMarker => self.no_agent += 1,
            RejectReason::BadCurrencies => self.bad_currencies += 1,
            RejectReason::SkuUnresolvable => self.unresolvable += 1,
            RejectReason::ExcludedOwner => self.excluded_owner += 1,
            RejectReason::BlockedDescription => self.blocked_description += 1,
            RejectReason::BlockedAttribute => self.blocked_attribute += 1,
        }
    }

    fn total(&self) -> u64 {
        self.not_tracked
            + self.no_agent
            + self.bad_currencies
            + self.unresolvable
            + self.excluded_owner
            + self.blocked_description
            + self.blocked_attribute
    }
}

pub struct ListingFilter {
    item_list: Arc<ItemList>,
    schema: Arc<dyn SkuResolver>,
    excluded_owners: HashSet<String>,
    blocked_terms: Vec<Regex>,
    /// (exempting name fragment, blocked float value) pairs.
    blocked_attributes: Vec<(String, f64)>,
}

impl ListingFilter {
    pub fn new(cfg: &Config, item_list: Arc<ItemList>, schema: Arc<dyn SkuResolver>) -> Self {
        let blocked_terms = cfg
            .excluded_listing_descriptions
            .iter()
            .filter_map(|term| {
                match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(term = %term, "Unusable blocked term: {e}");
                        None
                    }
                }
            })
            .collect();

        Self {
            item_list,
            schema,
            excluded_owners: cfg.excluded_steam_ids.iter().cloned().collect(),
            blocked_terms,
            blocked_attributes: cfg
                .blocked_attributes
                .iter()
                .map(|(name, value)| (name.clone(), *value))
                .collect(),
        }
    }

    /// Run one update event through the filter chain. Survivors come back as
    /// a store-ready listing stamped with `now`.
    pub fn screen(
        &self,
        event: &ListingUpdateEvent,
        now: i64,
    ) -> Result<Listing, RejectReason> {
        if !self.item_list.tracks(&event.name) {
            return Err(RejectReason::NotTracked);
        }
        if !event.has_user_agent {
            return Err(RejectReason::NoAgentMarker);
        }
        let currencies =
            parse_currencies(&event.currencies).ok_or(RejectReason::BadCurrencies)?;
        let sku = self
            .schema
            .sku_from_name(&event.name)
            .ok_or(RejectReason::SkuUnresolvable)?;
        if self.excluded_owners.contains(&event.steamid) {
            return Err(RejectReason::ExcludedOwner);
        }

        // A listing must carry free-text details, and they must clear the
        // blocked-term list.
        let details = event.details.as_deref().unwrap_or("");
        if details.is_empty() {
            return Err(RejectReason::BlockedDescription);
        }
        let normalized: String = details.nfkd().collect::<String>().to_lowercase();
        let normalized = normalized.trim();
        if self.blocked_terms.iter().any(|re| re.is_match(normalized)) {
            return Err(RejectReason::BlockedDescription);
        }

        let exempted = self
            .blocked_attributes
            .iter()
            .any(|(fragment, _)| event.name.contains(fragment));
        if !exempted
            && event.float_attributes.iter().any(|fv| {
                self.blocked_attributes
                    .iter()
                    .any(|(_, blocked)| (fv - blocked).abs() < f64::EPSILON)
            })
        {
            return Err(RejectReason::BlockedAttribute);
        }

        Ok(Listing {
            name: event.name.clone(),
            sku,
            intent: event.intent,
            currencies,
            steamid: event.steamid.clone(),
            updated: now,
        })
    }
}

/// Accept a currencies payload only when it is an object carrying at least
/// one recognized unit; unrecognized fields are dropped, missing ones
/// default to zero.
fn parse_currencies(value: &serde_json::Value) -> Option<Currencies> {
    let obj = value.as_object()?;
    if !obj.contains_key("keys") && !obj.contains_key("metal") {
        return None;
    }
    let keys = obj
        .get("keys")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .trunc() as i64;
    let metal = obj.get("metal").and_then(|v| v.as_f64()).unwrap_or(0.0);
    Some(Currencies { keys, metal })
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct IngestPipeline {
    event_rx: mpsc::Receiver<StreamEvent>,
    store: ListingStore,
    stats: ActivityStats,
    filter: ListingFilter,
}

impl IngestPipeline {
    pub fn new(
        event_rx: mpsc::Receiver<StreamEvent>,
        store: ListingStore,
        stats: ActivityStats,
        filter: ListingFilter,
    ) -> Self {
        Self {
            event_rx,
            store,
            stats,
            filter,
        }
    }

    pub async fn run(mut self) {
        let mut flush = interval(Duration::from_secs(INGEST_BATCH_INTERVAL_SECS));
        flush.tick().await; // consume immediate first tick

        let mut pending: HashMap<ListingKey, Listing> = HashMap::new();
        let mut rejected = RejectCounters::default();
        let mut accepted: u64 = 0;

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(StreamEvent::Update(update)) => {
                            match self.filter.screen(&update, now_secs()) {
                                Ok(listing) => {
                                    accepted += 1;
                                    // Within the window, the last event per
                                    // natural key wins.
                                    pending.insert(listing.key(), listing);
                                }
                                Err(reason) => {
                                    debug!(item = %update.name, ?reason, "Listing event rejected");
                                    rejected.bump(reason);
                                }
                            }
                        }
                        Some(StreamEvent::Delete(delete)) => {
                            match self.store.remove(&delete.steamid, &delete.name, delete.intent).await {
                                Ok(Some(sku)) => self.stats.update_for_skus(&[sku]).await,
                                Ok(None) => {}
                                Err(e) => warn!(item = %delete.name, "Listing delete failed: {e}"),
                            }
                        }
                        None => {
                            self.flush(&mut pending).await;
                            info!("Event channel closed, ingest pipeline stopping");
                            return;
                        }
                    }
                }

                _ = flush.tick() => {
                    if accepted > 0 || rejected.total() > 0 {
                        info!(
                            accepted,
                            rejected = rejected.total(),
                            not_tracked = rejected.not_tracked,
                            no_agent = rejected.no_agent,
                            bad_currencies = rejected.bad_currencies,
                            unresolvable = rejected.unresolvable,
                            excluded_owner = rejected.excluded_owner,
                            blocked_description = rejected.blocked_description,
                            blocked_attribute = rejected.blocked_attribute,
                            "Ingest window summary"
                        );
                    }
                    accepted = 0;
                    rejected = RejectCounters::default();
                    self.flush(&mut pending).await;
                }
            }
        }
    }

    async fn flush(&self, pending: &mut HashMap<ListingKey, Listing>) {
        if pending.is_empty() {
            return;
        }
        let batch: Vec<Listing> = pending.drain().map(|(_, l)| l).collect();
        let count = batch.len();
        match self.store.upsert_batch(batch).await {
            Ok(skus) => {
                debug!(listings = count, skus = skus.len(), "Ingest batch written");
                self.stats.update_for_skus(&skus).await;
            }
            Err(e) => warn!("Ingest batch write failed: {e}"),
        }
    }
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
    use crate::schema::FileSchema;
    use crate::types::Intent;
    use std::io::Write;

    fn item_list() -> Arc<ItemList> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(
            br#"{"items":[{"name":"Team Captain"},{"name":"Australium Gold Rocket Launcher"}]}"#,
        )
        .unwrap();
        f.flush().unwrap();
        Arc::new(ItemList::load(f.path(), false).unwrap())
    }

    fn filter_with(cfg: Config) -> ListingFilter {
        let schema = Arc::new(FileSchema::from_pairs(&[
            ("Team Captain", "378;6"),
            ("Australium Gold Rocket Launcher", "205;11;australium"),
        ]));
        ListingFilter::new(&cfg, item_list(), schema)
    }

    fn event() -> ListingUpdateEvent {
        ListingUpdateEvent {
            name: "Team Captain".to_string(),
            steamid: "76561198000000001".to_string(),
            intent: Intent::Sell,
            currencies: serde_json::json!({"keys": 1, "metal": 3.55}),
            details: Some("selling this hat".to_string()),
            float_attributes: vec![],
            has_user_agent: true,
        }
    }

    #[test]
    fn accepts_clean_event() {
        let filter = filter_with(Config::default());
        let listing = filter.screen(&event(), 1_000).unwrap();
        assert_eq!(listing.sku, "378;6");
        assert_eq!(listing.currencies, Currencies::new(1, 3.55));
        assert_eq!(listing.updated, 1_000);
    }

    #[test]
    fn rejects_untracked_item() {
        let filter = filter_with(Config::default());
        let mut ev = event();
        ev.name = "Unlisted Hat".to_string();
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::NotTracked));
    }

    #[test]
    fn rejects_missing_agent_marker() {
        let filter = filter_with(Config::default());
        let mut ev = event();
        ev.has_user_agent = false;
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::NoAgentMarker));
    }

    #[test]
    fn rejects_unrecognized_currencies() {
        let filter = filter_with(Config::default());
        let mut ev = event();
        ev.currencies = serde_json::json!({"gems": 40});
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::BadCurrencies));
        ev.currencies = serde_json::Value::Null;
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::BadCurrencies));
    }

    #[test]
    fn rejects_excluded_owner() {
        let cfg = Config {
            excluded_steam_ids: vec!["76561198000000001".to_string()],
            ..Config::default()
        };
        let filter = filter_with(cfg);
        assert_eq!(filter.screen(&event(), 0), Err(RejectReason::ExcludedOwner));
    }

    #[test]
    fn blocked_term_matches_on_word_boundaries() {
        let cfg = Config {
            excluded_listing_descriptions: vec!["spell".to_string()],
            ..Config::default()
        };
        let filter = filter_with(cfg);

        let mut ev = event();
        ev.details = Some("has a SPELL on it".to_string());
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::BlockedDescription));

        // Substring inside a larger word is not a match.
        ev.details = Some("misspelled tag".to_string());
        assert!(filter.screen(&ev, 0).is_ok());
    }

    #[test]
    fn blocked_term_matches_after_unicode_normalization() {
        let cfg = Config {
            excluded_listing_descriptions: vec!["spell".to_string()],
            ..Config::default()
        };
        let filter = filter_with(cfg);
        let mut ev = event();
        // Fullwidth letters decompose to ASCII under NFKD.
        ev.details = Some("ｓｐｅｌｌ included".to_string());
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::BlockedDescription));
    }

    #[test]
    fn missing_details_are_rejected() {
        let filter = filter_with(Config::default());
        let mut ev = event();
        ev.details = None;
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::BlockedDescription));
    }

    #[test]
    fn blocked_attribute_drops_unless_name_exempted() {
        let cfg = Config {
            blocked_attributes: [("Australium Gold".to_string(), 15185211.0)]
                .into_iter()
                .collect(),
            ..Config::default()
        };
        let filter = filter_with(cfg);

        let mut ev = event();
        ev.float_attributes = vec![15185211.0];
        assert_eq!(filter.screen(&ev, 0), Err(RejectReason::BlockedAttribute));

        // An item whose own name carries the variant is exempt.
        ev.name = "Australium Gold Rocket Launcher".to_string();
        assert!(filter.screen(&ev, 0).is_ok());

        // Non-blocked floats pass untouched.
        ev.name = "Team Captain".to_string();
        ev.float_attributes = vec![99.0];
        assert!(filter.screen(&ev, 0).is_ok());
    }

    #[test]
    fn currencies_parser_defaults_missing_unit_to_zero() {
        let c = parse_currencies(&serde_json::json!({"metal": 2.44})).unwrap();
        assert_eq!(c, Currencies::new(0, 2.44));
        assert!(parse_currencies(&serde_json::json!({})).is_none());
        assert!(parse_currencies(&serde_json::json!("3 keys")).is_none());
    }
}
