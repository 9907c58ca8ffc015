//! Key price stabilizer: a windowed feedback loop over the recorded key
//! prices that nudges the denominating currency's published price toward
//! stability. This task is the sole writer of the key's pricelist entry.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::currency::round_to_scrap;
use crate::db::history::{KeyPriceHistory, KeyPriceWindow};
use crate::emitter::EmitQueue;
use crate::error::Result;
use crate::pricelist::Pricelist;
use crate::stats::{mean, std_dev};
use crate::types::{Currencies, PricedItem, SharedKeyPrice, PRICE_SOURCE};

/// Window mean must move by more than this before a nudge is applied.
const CHANGE_THRESHOLD: f64 = 0.33;

/// Recent-window volatility above this only raises an alert.
const STD_THRESHOLD: f64 = 0.66;

/// One nudge step, in metal.
const STEP: f64 = 0.11;

/// Minimum sell-over-buy spread for the key.
const MIN_SPREAD: f64 = 0.33;

/// Stabilizer window length (seconds). The recent window covers
/// `[now - WINDOW, now)`, the prior window the 3 hours before that.
const WINDOW_SECS: i64 = 3 * 3600;

#[derive(Debug, Clone, PartialEq)]
pub enum KeyDecision {
    /// One of the windows has no samples.
    InsufficientData,
    /// Recent window is too volatile to act on.
    Volatile { std_buy: f64, std_sell: f64 },
    /// Write this buy/sell pair; `nudged` names the side that moved, if any.
    Write {
        buy: f64,
        sell: f64,
        nudged: Option<&'static str>,
    },
}

/// Pure decision function over the two windows.
pub fn decide(recent: &KeyPriceWindow, prior: &KeyPriceWindow) -> KeyDecision {
    if recent.buys.is_empty() || prior.buys.is_empty() {
        return KeyDecision::InsufficientData;
    }

    let recent_buy = mean(&recent.buys);
    let recent_sell = mean(&recent.sells);
    let std_buy = std_dev(&recent.buys);
    let std_sell = std_dev(&recent.sells);

    if std_sell > STD_THRESHOLD || std_buy > STD_THRESHOLD {
        return KeyDecision::Volatile { std_buy, std_sell };
    }

    let sell_delta = recent_sell - mean(&prior.sells);
    let buy_delta = recent_buy - mean(&prior.buys);

    let mut raw_sell = recent_sell;
    let mut raw_buy = recent_buy;

    if sell_delta.abs() > CHANGE_THRESHOLD {
        raw_sell += if sell_delta > 0.0 { STEP } else { -STEP };
        let sell = round_to_scrap(raw_sell);
        let mut buy = round_to_scrap(raw_buy);
        if sell - buy < MIN_SPREAD {
            buy = round_to_scrap(sell - MIN_SPREAD);
        }
        return KeyDecision::Write {
            buy,
            sell,
            nudged: Some("sell"),
        };
    }

    if buy_delta.abs() > CHANGE_THRESHOLD {
        // Buy moves against its drift to damp it.
        raw_buy += if buy_delta > 0.0 { -STEP } else { STEP };
        let sell = round_to_scrap(raw_sell);
        let mut buy = round_to_scrap(raw_buy);
        if sell - buy < MIN_SPREAD {
            buy = round_to_scrap(sell - MIN_SPREAD);
        }
        return KeyDecision::Write {
            buy,
            sell,
            nudged: Some("buy"),
        };
    }

    let sell = round_to_scrap(raw_sell);
    let mut buy = round_to_scrap(raw_buy);
    if sell - buy <= MIN_SPREAD {
        buy = round_to_scrap(sell - MIN_SPREAD);
    }
    KeyDecision::Write {
        buy,
        sell,
        nudged: None,
    }
}

pub struct KeyStabilizer {
    key_history: KeyPriceHistory,
    pricelist: Arc<Pricelist>,
    emitter: Arc<EmitQueue>,
    key_price: Arc<SharedKeyPrice>,
    key_sku: String,
    key_name: String,
}

impl KeyStabilizer {
    pub fn new(
        key_history: KeyPriceHistory,
        pricelist: Arc<Pricelist>,
        emitter: Arc<EmitQueue>,
        key_price: Arc<SharedKeyPrice>,
        key_sku: String,
        key_name: String,
    ) -> Self {
        Self {
            key_history,
            pricelist,
            emitter,
            key_price,
            key_sku,
            key_name,
        }
    }

    pub async fn check(&self) -> Result<()> {
        let now = now_secs();
        let recent = self.key_history.window(now - WINDOW_SECS, now).await?;
        let prior = self
            .key_history
            .window(now - 2 * WINDOW_SECS, now - WINDOW_SECS)
            .await?;

        match decide(&recent, &prior) {
            KeyDecision::InsufficientData => {
                info!("Not enough key price data in one of the windows, skipping stability check");
            }
            KeyDecision::Volatile { std_buy, std_sell } => {
                warn!(
                    "ALERT: high key price volatility (std buy {std_buy:.3}, std sell {std_sell:.3}), holding price"
                );
            }
            KeyDecision::Write { buy, sell, nudged } => {
                let item = PricedItem {
                    name: self.key_name.clone(),
                    sku: self.key_sku.clone(),
                    source: PRICE_SOURCE.to_string(),
                    buy: Currencies::metal_only(buy),
                    sell: Currencies::metal_only(sell),
                    time: now,
                };
                self.pricelist.commit(vec![item.clone()]).await?;
                // Derivations denominate keys in the sell metal value.
                self.key_price.set(sell).await;
                self.emitter.enqueue(item);

                match nudged {
                    Some(side) => info!(
                        buy,
                        sell, "Key price {side} nudged by one step toward window drift"
                    ),
                    None => info!(buy, sell, "Key price stable over both windows"),
                }
            }
        }
        Ok(())
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
