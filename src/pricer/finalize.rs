//! Price finalization: currency normalization, margin enforcement, bound
//! clamping and the swing guard. Accepted prices come back paired with the
//! history entry the cycle batches into `price_history`.

use tracing::info;

use crate::config::PriceSwingLimits;
use crate::currency::{parse_price, round_to_scrap, to_metal};
use crate::db::history::HistoryEntry;
use crate::error::PricingError;
use crate::types::{Currencies, ItemBounds, PricedItem, ProvisionalPrice, PRICE_SOURCE};

/// Metal-equivalent reference levels the swing guard compares against: the
/// mean of the last few history entries, or the previous pricelist entry
/// when no history exists yet.
#[derive(Debug, Clone, Copy)]
pub struct SwingReference {
    pub buy_metal: f64,
    pub sell_metal: f64,
}

pub fn finalize(
    provisional: &ProvisionalPrice,
    name: &str,
    sku: &str,
    key_metal: f64,
    min_sell_margin: f64,
    bounds: &ItemBounds,
    reference: Option<SwingReference>,
    swing: &PriceSwingLimits,
    now: i64,
) -> Result<(PricedItem, HistoryEntry), PricingError> {
    if provisional.buy.is_zero() || provisional.sell.is_zero() {
        return Err(PricingError::MalformedItemSkipped);
    }

    let mut buy = Currencies {
        keys: provisional.buy.keys,
        metal: round_to_scrap(provisional.buy.metal),
    };
    let mut sell = Currencies {
        keys: provisional.sell.keys,
        metal: round_to_scrap(provisional.sell.metal),
    };

    buy = parse_price(&buy, key_metal);
    sell = parse_price(&sell, key_metal);

    // An inverted or flat spread collapses onto the buy side plus margin.
    if to_metal(&buy, key_metal) >= to_metal(&sell, key_metal) {
        sell = Currencies {
            keys: buy.keys,
            metal: round_to_scrap(buy.metal + min_sell_margin),
        };
    }

    buy.keys = clamp_i64(buy.keys, bounds.min_buy_keys, bounds.max_buy_keys);
    buy.metal = clamp_f64(buy.metal, bounds.min_buy_metal, bounds.max_buy_metal);
    sell.keys = clamp_i64(sell.keys, bounds.min_sell_keys, bounds.max_sell_keys);
    sell.metal = clamp_f64(sell.metal, bounds.min_sell_metal, bounds.max_sell_metal);

    if buy.is_zero() || sell.is_zero() {
        return Err(PricingError::MalformedItemSkipped);
    }

    let next_buy = to_metal(&buy, key_metal);
    let next_sell = to_metal(&sell, key_metal);

    if let Some(r) = reference {
        if next_buy > r.buy_metal
            && (next_buy - r.buy_metal) / r.buy_metal > swing.max_buy_increase
        {
            let msg = format!(
                "buy {next_buy:.2} vs recent avg {:.2} exceeds +{:.0}%",
                r.buy_metal,
                swing.max_buy_increase * 100.0
            );
            info!(item = name, sku = sku, "Swing guard rejected update: {msg}");
            return Err(PricingError::SwingRejected(msg));
        }
        if next_sell < r.sell_metal
            && (r.sell_metal - next_sell) / r.sell_metal > swing.max_sell_decrease
        {
            let msg = format!(
                "sell {next_sell:.2} vs recent avg {:.2} exceeds -{:.0}%",
                r.sell_metal,
                swing.max_sell_decrease * 100.0
            );
            info!(item = name, sku = sku, "Swing guard rejected update: {msg}");
            return Err(PricingError::SwingRejected(msg));
        }
    }

    let item = PricedItem {
        name: name.to_string(),
        sku: sku.to_string(),
        source: PRICE_SOURCE.to_string(),
        buy,
        sell,
        time: now,
    };
    let entry = HistoryEntry {
        sku: sku.to_string(),
        buy_metal: next_buy,
        sell_metal: next_sell,
        timestamp: now,
    };
    Ok((item, entry))
}

fn clamp_i64(value: i64, min: Option<i64>, max: Option<i64>) -> i64 {
    let mut v = value;
    if let Some(min) = min {
        v = v.max(min);
    }
    if let Some(max) = max {
        v = v.min(max);
    }
    v
}

fn clamp_f64(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut v = value;
    if let Some(min) = min {
        v = v.max(min);
    }
    if let Some(max) = max {
        v = v.min(max);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceSource;

    const KEY: f64 = 62.11;

    fn provisional(buy: Currencies, sell: Currencies) -> ProvisionalPrice {
        ProvisionalPrice {
            buy,
            sell,
            source: PriceSource::Listings,
        }
    }

    fn swing() -> PriceSwingLimits {
        PriceSwingLimits {
            max_buy_increase: 0.1,
            max_sell_decrease: 0.1,
        }
    }

    fn run(
        prov: ProvisionalPrice,
        bounds: &ItemBounds,
        reference: Option<SwingReference>,
    ) -> Result<(PricedItem, HistoryEntry), PricingError> {
        finalize(
            &prov,
            "Team Captain",
            "378;6",
            KEY,
            0.11,
            bounds,
            reference,
            &swing(),
            1_000,
        )
    }

    #[test]
    fn normalizes_and_rounds_both_sides() {
        let (item, entry) = run(
            provisional(
                Currencies::metal_only(10.13),
                Currencies::metal_only(12.08),
            ),
            &ItemBounds::default(),
            None,
        )
        .unwrap();
        assert!((item.buy.metal - 10.11).abs() < 1e-9);
        assert!((item.sell.metal - 12.11).abs() < 1e-9);
        assert!((entry.buy_metal - 10.11).abs() < 1e-9);
        assert_eq!(item.time, 1_000);
        assert_eq!(item.source, PRICE_SOURCE);
    }

    #[test]
    fn inverted_spread_forces_margin_above_buy() {
        let (item, _) = run(
            provisional(
                Currencies::metal_only(12.0),
                Currencies::metal_only(11.0),
            ),
            &ItemBounds::default(),
            None,
        )
        .unwrap();
        assert!((item.buy.metal - 12.0).abs() < 1e-9);
        assert_eq!(item.sell.keys, item.buy.keys);
        assert!((item.sell.metal - 12.11).abs() < 1e-9);
    }

    #[test]
    fn metal_overflow_splits_into_keys() {
        let (item, _) = run(
            provisional(
                Currencies::metal_only(KEY + 5.0),
                Currencies::metal_only(KEY + 10.0),
            ),
            &ItemBounds::default(),
            None,
        )
        .unwrap();
        assert_eq!(item.buy.keys, 1);
        assert_eq!(item.sell.keys, 1);
        assert!(item.buy.metal < KEY);
    }

    #[test]
    fn bounds_clamp_each_component_independently() {
        let bounds = ItemBounds {
            max_buy_metal: Some(9.0),
            min_sell_metal: Some(15.0),
            ..ItemBounds::default()
        };
        let (item, _) = run(
            provisional(
                Currencies::metal_only(10.0),
                Currencies::metal_only(12.0),
            ),
            &bounds,
            None,
        )
        .unwrap();
        assert!((item.buy.metal - 9.0).abs() < 1e-9);
        assert!((item.sell.metal - 15.0).abs() < 1e-9);
    }

    #[test]
    fn swing_guard_rejects_large_sell_drop() {
        let reference = Some(SwingReference {
            buy_metal: 80.0,
            sell_metal: 100.0,
        });
        // 100 -> 85 is a 15% drop: rejected.
        let err = run(
            provisional(
                Currencies::metal_only(80.0),
                Currencies::metal_only(85.03),
            ),
            &ItemBounds::default(),
            reference,
        )
        .unwrap_err();
        assert!(matches!(err, PricingError::SwingRejected(_)));

        // 100 -> 92 is within the 10% limit: accepted.
        let (item, _) = run(
            provisional(
                Currencies::metal_only(80.0),
                Currencies::metal_only(92.07),
            ),
            &ItemBounds::default(),
            reference,
        )
        .unwrap();
        assert!((to_metal(&item.sell, KEY) - 92.07).abs() < 0.06);
    }

    #[test]
    fn swing_guard_rejects_large_buy_increase() {
        let reference = Some(SwingReference {
            buy_metal: 100.0,
            sell_metal: 120.0,
        });
        let err = run(
            provisional(
                Currencies::metal_only(112.2),
                Currencies::metal_only(120.01),
            ),
            &ItemBounds::default(),
            reference,
        )
        .unwrap_err();
        assert!(matches!(err, PricingError::SwingRejected(_)));
    }

    #[test]
    fn no_reference_allows_any_move() {
        let (item, _) = run(
            provisional(
                Currencies::metal_only(1.0),
                Currencies::metal_only(500.0),
            ),
            &ItemBounds::default(),
            None,
        )
        .unwrap();
        assert!(to_metal(&item.sell, KEY) > 400.0);
    }

    #[test]
    fn zero_priced_sides_are_never_returned() {
        let err = run(
            provisional(Currencies::metal_only(0.0), Currencies::metal_only(12.0)),
            &ItemBounds::default(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, PricingError::MalformedItemSkipped);
    }
}
