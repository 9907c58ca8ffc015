//! The pricing cycle: iterates every allow-listed item with bounded
//! parallelism, derives and finalizes prices, and lands the results in one
//! atomic pricelist commit plus one batched history insert. Per-item
//! failures never abort the cycle.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{stream, StreamExt};
use tracing::{debug, info, warn};

use crate::baseline::BaselineResolver;
use crate::config::{Config, DERIVE_CONCURRENCY};
use crate::currency::to_metal;
use crate::db::history::{HistoryEntry, KeyPriceHistory, PriceHistory};
use crate::db::listings::ListingStore;
use crate::emitter::EmitQueue;
use crate::error::{AppError, PricingError, Result};
use crate::item_list::ItemList;
use crate::pricelist::Pricelist;
use crate::pricer::derive::{derive, DerivationInputs, DerivationSettings};
use crate::pricer::finalize::{finalize, SwingReference};
use crate::schema::SkuResolver;
use crate::stats::mean;
use crate::types::{Intent, PricedItem, PricingContext, SharedKeyPrice};

pub struct PricingCycle {
    store: ListingStore,
    history: PriceHistory,
    key_history: KeyPriceHistory,
    baseline: Arc<BaselineResolver>,
    pricelist: Arc<Pricelist>,
    item_list: Arc<ItemList>,
    schema: Arc<dyn SkuResolver>,
    emitter: Arc<EmitQueue>,
    key_price: Arc<SharedKeyPrice>,
    settings: DerivationSettings,
    min_sell_margin: f64,
    swing: crate::config::PriceSwingLimits,
    key_sku: String,
}

/// Per-cycle outcome counters, logged as the cycle summary.
#[derive(Debug, Default)]
struct CycleCounters {
    priced: usize,
    insufficient: usize,
    filtered_out: usize,
    no_baseline: usize,
    diverged: usize,
    swing_rejected: usize,
    unresolvable: usize,
    other: usize,
}

impl CycleCounters {
    fn record(&mut self, err: &AppError) {
        match err {
            AppError::Pricing(PricingError::InsufficientListings { .. }) => {
                self.insufficient += 1
            }
            AppError::Pricing(PricingError::NotEnoughAfterFiltering) => self.filtered_out += 1,
            AppError::Pricing(
                PricingError::BaselineUnavailable | PricingError::BaselineZeroPrice,
            ) => self.no_baseline += 1,
            AppError::Pricing(PricingError::DivergenceRejected(_)) => self.diverged += 1,
            AppError::Pricing(PricingError::SwingRejected(_)) => self.swing_rejected += 1,
            AppError::Pricing(PricingError::SkuUnresolvable) => self.unresolvable += 1,
            _ => self.other += 1,
        }
    }
}

impl PricingCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &Config,
        store: ListingStore,
        history: PriceHistory,
        key_history: KeyPriceHistory,
        baseline: Arc<BaselineResolver>,
        pricelist: Arc<Pricelist>,
        item_list: Arc<ItemList>,
        schema: Arc<dyn SkuResolver>,
        emitter: Arc<EmitQueue>,
        key_price: Arc<SharedKeyPrice>,
    ) -> Self {
        Self {
            store,
            history,
            key_history,
            baseline,
            pricelist,
            item_list,
            schema,
            emitter,
            key_price,
            settings: DerivationSettings::from_config(cfg),
            min_sell_margin: cfg.min_sell_margin,
            swing: cfg.price_swing_limits.clone(),
            key_sku: cfg.key_sku.clone(),
        }
    }

    /// One full pricing pass over the allow-list.
    pub async fn run_cycle(&self) -> Result<()> {
        self.store.sweep_expired().await;

        let key_metal = self.key_price.get().await;
        let ctx = PricingContext {
            key_metal,
            baseline: self.baseline.snapshot().await,
        };
        if ctx.baseline.is_empty() {
            warn!("Pricing cycle starting with an empty baseline snapshot");
        }

        let names = self.item_list.allowed_names();
        if names.is_empty() {
            info!("Item allow-list is empty, skipping pricing cycle");
            return Ok(());
        }

        let outcomes: Vec<(String, Result<(PricedItem, HistoryEntry)>)> =
            stream::iter(names.into_iter())
                .map(|name| {
                    let ctx = ctx.clone();
                    async move {
                        let outcome = self.price_one(&name, &ctx).await;
                        (name, outcome)
                    }
                })
                .buffer_unordered(DERIVE_CONCURRENCY)
                .collect()
                .await;

        let now = now_secs();
        let mut counters = CycleCounters::default();
        let mut priced: Vec<PricedItem> = Vec::new();
        let mut entries: Vec<HistoryEntry> = Vec::new();

        for (name, outcome) in outcomes {
            match outcome {
                Ok((item, entry)) => {
                    if item.sku == self.key_sku {
                        // The key's derived price feeds the stabilizer's
                        // history instead of the pricelist; the stabilizer is
                        // the sole writer of the key's published price.
                        if let Err(e) = self
                            .key_history
                            .insert(key_metal, entry.buy_metal, entry.sell_metal, now)
                            .await
                        {
                            warn!("Key price insert failed: {e}");
                        }
                        continue;
                    }
                    priced.push(item);
                    entries.push(entry);
                    counters.priced += 1;
                }
                Err(e) => {
                    counters.record(&e);
                    match &e {
                        // Rejections carry the offending values for audit.
                        AppError::Pricing(
                            PricingError::DivergenceRejected(_) | PricingError::SwingRejected(_),
                        ) => info!(item = %name, "Price update rejected: {e}"),
                        _ => debug!(item = %name, "Couldn't price: {e}"),
                    }
                }
            }
        }

        if !priced.is_empty() {
            self.pricelist.commit(priced.clone()).await?;
            self.history.append_batch(&entries).await?;
            for item in priced {
                self.emitter.enqueue(item);
            }
        }

        info!(
            priced = counters.priced,
            insufficient = counters.insufficient,
            filtered_out = counters.filtered_out,
            no_baseline = counters.no_baseline,
            diverged = counters.diverged,
            swing_rejected = counters.swing_rejected,
            unresolvable = counters.unresolvable,
            other = counters.other,
            "Pricing cycle complete"
        );
        Ok(())
    }

    async fn price_one(
        &self,
        name: &str,
        ctx: &PricingContext,
    ) -> Result<(PricedItem, HistoryEntry)> {
        let sku = self
            .schema
            .sku_from_name(name)
            .ok_or(PricingError::SkuUnresolvable)?;

        let buy_listings = self.store.query(name, Intent::Buy).await?;
        let sell_listings = self.store.query(name, Intent::Sell).await?;
        let recent_sells = if self.settings.sell_history_guard {
            self.history.recent_sells(&sku, 10).await?
        } else {
            Vec::new()
        };

        let inputs = DerivationInputs {
            buy_listings,
            sell_listings,
            baseline: ctx.baseline.quote(&sku, ctx.key_metal),
            recent_sells,
        };
        let provisional = derive(name, inputs, ctx, &self.settings)?;

        let history_rows = self.history.recent(&sku, 5).await?;
        let reference = if history_rows.is_empty() {
            self.pricelist.get(&sku).await.map(|prev| SwingReference {
                buy_metal: to_metal(&prev.buy, ctx.key_metal),
                sell_metal: to_metal(&prev.sell, ctx.key_metal),
            })
        } else {
            let buys: Vec<f64> = history_rows.iter().map(|r| r.buy_metal).collect();
            let sells: Vec<f64> = history_rows.iter().map(|r| r.sell_metal).collect();
            Some(SwingReference {
                buy_metal: mean(&buys),
                sell_metal: mean(&sells),
            })
        };

        let bounds = self.item_list.bounds_for(name);
        let (item, entry) = finalize(
            &provisional,
            name,
            &sku,
            ctx.key_metal,
            self.min_sell_margin,
            &bounds,
            reference,
            &self.swing,
            now_secs(),
        )?;
        Ok((item, entry))
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
