mod baseline;
mod config;
mod currency;
mod db;
mod emitter;
mod error;
mod ingest;
mod item_list;
mod key_stabilizer;
mod pricelist;
mod pricer;
mod schema;
mod scheduler;
mod stats;
mod types;
mod ws;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::baseline::BaselineResolver;
use crate::config::{
    Config, BASELINE_REFRESH_INTERVAL_SECS, CHANNEL_CAPACITY, ITEM_LIST_POLL_SECS,
    KEY_CLEANUP_INTERVAL_SECS, KEY_PRICE_MAX_AGE_DAYS, KEY_STABILITY_INTERVAL_SECS,
    MOVING_AVG_INTERVAL_SECS, PRICING_INTERVAL_SECS, STALE_CHECK_INTERVAL_SECS,
    SWEEP_INTERVAL_SECS,
};
use crate::db::history::{KeyPriceHistory, PriceHistory};
use crate::db::listings::ListingStore;
use crate::db::stats::ActivityStats;
use crate::emitter::{BroadcastPublisher, EmitQueue};
use crate::error::{AppError, Result};
use crate::ingest::{IngestPipeline, ListingFilter};
use crate::item_list::ItemList;
use crate::key_stabilizer::KeyStabilizer;
use crate::pricelist::Pricelist;
use crate::pricer::cycle::PricingCycle;
use crate::schema::{FileSchema, SkuResolver};
use crate::scheduler::spawn_periodic;
use crate::types::{Currencies, PricedItem, SharedKeyPrice, PRICE_SOURCE};
use crate::ws::event_log::EventLog;
use crate::ws::WsManager;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let cfg = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Storage ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let store = ListingStore::new(pool.clone());
    let activity = ActivityStats::new(pool.clone());
    let history = PriceHistory::new(pool.clone());
    let key_history = KeyPriceHistory::new(pool.clone(), cfg.key_sku.clone());

    // --- Injected capabilities and artifacts ---
    let schema_impl = FileSchema::load(&cfg.schema_path)?;
    info!(items = schema_impl.len(), "Schema loaded");
    let schema: Arc<dyn SkuResolver> = Arc::new(schema_impl);

    let item_list = Arc::new(ItemList::load(&cfg.item_list_path, cfg.price_all_items)?);
    let pricelist = Arc::new(Pricelist::load(&cfg.pricelist_path));

    // --- Baseline bootstrap: a live feed or a cache is required to start ---
    let baseline = Arc::new(BaselineResolver::new(&cfg)?);
    baseline.refresh().await?;

    let key_metal = baseline
        .snapshot()
        .await
        .key_metal(&cfg.key_sku)
        .ok_or_else(|| {
            AppError::Config(format!(
                "baseline feed does not price the key item {}",
                cfg.key_sku
            ))
        })?;
    let key_price = Arc::new(SharedKeyPrice::new(key_metal));
    info!(key_metal, "Key price bootstrapped from baseline");

    // --- Outbound dispatcher ---
    let (price_tx, _) = broadcast::channel::<PricedItem>(CHANNEL_CAPACITY);
    let emitter = EmitQueue::new(Arc::new(BroadcastPublisher::new(price_tx)));
    tokio::spawn(Arc::clone(&emitter).run());

    // Publish the seeded key price so subscribers have a denomination.
    let key_item = PricedItem {
        name: cfg.key_item_name.clone(),
        sku: cfg.key_sku.clone(),
        source: PRICE_SOURCE.to_string(),
        buy: Currencies::metal_only(key_metal),
        sell: Currencies::metal_only(key_metal),
        time: now_secs(),
    };
    pricelist.commit(vec![key_item.clone()]).await?;
    emitter.enqueue(key_item);

    // --- Startup stats rebuild ---
    let skus = store.distinct_skus().await?;
    activity.initialize_all(skus).await;

    // --- Ingestion path ---
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let ws = WsManager::new(
        cfg.listing_stream_url.clone(),
        event_tx,
        EventLog::new(&cfg.ws_log_path),
    );
    tokio::spawn(ws.run());

    let filter = ListingFilter::new(&cfg, Arc::clone(&item_list), Arc::clone(&schema));
    let pipeline = IngestPipeline::new(event_rx, store.clone(), activity.clone(), filter);
    tokio::spawn(pipeline.run());

    // --- Pricing ---
    let cycle = Arc::new(PricingCycle::new(
        &cfg,
        store.clone(),
        history.clone(),
        key_history.clone(),
        Arc::clone(&baseline),
        Arc::clone(&pricelist),
        Arc::clone(&item_list),
        Arc::clone(&schema),
        Arc::clone(&emitter),
        Arc::clone(&key_price),
    ));
    let stabilizer = Arc::new(KeyStabilizer::new(
        key_history.clone(),
        Arc::clone(&pricelist),
        Arc::clone(&emitter),
        Arc::clone(&key_price),
        cfg.key_sku.clone(),
        cfg.key_item_name.clone(),
    ));

    // First pass on startup; scheduled runs take over from here.
    if let Err(e) = cycle.run_cycle().await {
        error!("Initial pricing cycle failed: {e}");
    }
    if let Err(e) = stabilizer.check().await {
        error!("Initial key stability check failed: {e}");
    }

    // --- Periodic jobs ---
    spawn_periodic(
        "baseline-refresh",
        Duration::from_secs(BASELINE_REFRESH_INTERVAL_SECS),
        {
            let baseline = Arc::clone(&baseline);
            move || {
                let baseline = Arc::clone(&baseline);
                async move { baseline.refresh().await }
            }
        },
    );
    spawn_periodic(
        "pricing-cycle",
        Duration::from_secs(PRICING_INTERVAL_SECS),
        {
            let cycle = Arc::clone(&cycle);
            move || {
                let cycle = Arc::clone(&cycle);
                async move { cycle.run_cycle().await }
            }
        },
    );
    spawn_periodic(
        "moving-averages",
        Duration::from_secs(MOVING_AVG_INTERVAL_SECS),
        {
            let activity = activity.clone();
            move || {
                let activity = activity.clone();
                async move { activity.update_moving_averages().await }
            }
        },
    );
    spawn_periodic(
        "retention-sweep",
        Duration::from_secs(SWEEP_INTERVAL_SECS),
        {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move {
                    store.sweep_expired().await;
                    Ok(())
                }
            }
        },
    );
    spawn_periodic(
        "key-stability",
        Duration::from_secs(KEY_STABILITY_INTERVAL_SECS),
        {
            let stabilizer = Arc::clone(&stabilizer);
            move || {
                let stabilizer = Arc::clone(&stabilizer);
                async move { stabilizer.check().await }
            }
        },
    );
    spawn_periodic(
        "key-price-cleanup",
        Duration::from_secs(KEY_CLEANUP_INTERVAL_SECS),
        {
            let key_history = key_history.clone();
            move || {
                let key_history = key_history.clone();
                async move {
                    key_history
                        .cleanup_older_than(now_secs() - KEY_PRICE_MAX_AGE_DAYS * 86_400)
                        .await
                }
            }
        },
    );
    spawn_periodic(
        "item-list-reload",
        Duration::from_secs(ITEM_LIST_POLL_SECS),
        {
            let item_list = Arc::clone(&item_list);
            move || {
                let item_list = Arc::clone(&item_list);
                async move {
                    item_list.reload_if_changed();
                    Ok(())
                }
            }
        },
    );
    spawn_periodic(
        "stale-price-report",
        Duration::from_secs(STALE_CHECK_INTERVAL_SECS),
        {
            let pricelist = Arc::clone(&pricelist);
            let max_age = cfg.stale_price_age_secs;
            move || {
                let pricelist = Arc::clone(&pricelist);
                async move {
                    let stale = pricelist.stale_entries(now_secs(), max_age).await;
                    if !stale.is_empty() {
                        warn!(
                            count = stale.len(),
                            "Pricelist entries older than {max_age}s"
                        );
                        for (name, age) in stale.iter().take(5) {
                            warn!("  stale: {name} ({age}s old)");
                        }
                    }
                    Ok(())
                }
            }
        },
    );

    info!("Autopricer running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; periodic jobs will not re-arm");
    Ok(())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
