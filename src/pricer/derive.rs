//! Price derivation: turns the current listing book plus the baseline quote
//! into a provisional buy/sell pair.
//!
//! Sources are tried in order — listings first, then (when the fallback
//! policy is enabled) the baseline verbatim — and the first success wins.

use std::collections::HashSet;

use tracing::debug;

use crate::config::Config;
use crate::currency::{percentage_difference, round_to_scrap, to_metal};
use crate::error::PricingError;
use crate::stats::{mean, std_dev, z_score};
use crate::types::{
    BaselineQuote, Currencies, Intent, Listing, PriceSource, PricingContext, ProvisionalPrice,
};

/// Listings with |z| above this against their cohort are outliers.
const OUTLIER_Z: f64 = 3.0;

/// Outlier filtering only kicks in at this many buy listings; below it the
/// sample is too small for a meaningful standard deviation.
const OUTLIER_MIN_SAMPLE: usize = 10;

#[derive(Debug, Clone)]
pub struct DerivationSettings {
    pub trusted: HashSet<String>,
    pub fallback_onto_baseline: bool,
    pub sell_history_guard: bool,
    /// Upper bound on buy divergence from baseline, percent.
    pub max_buy_divergence_pct: f64,
    /// Lower bound on sell divergence from baseline, percent (negative).
    pub max_sell_divergence_pct: f64,
}

impl DerivationSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            trusted: cfg.trusted_steam_ids.iter().cloned().collect(),
            fallback_onto_baseline: cfg.fallback_onto_baseline,
            sell_history_guard: cfg.sell_history_guard,
            max_buy_divergence_pct: cfg.max_percentage_differences.buy,
            max_sell_divergence_pct: cfg.max_percentage_differences.sell,
        }
    }
}

pub struct DerivationInputs {
    pub buy_listings: Vec<Listing>,
    pub sell_listings: Vec<Listing>,
    pub baseline: Result<BaselineQuote, PricingError>,
    /// Last recorded sell prices for this SKU, newest first.
    pub recent_sells: Vec<f64>,
}

/// Order listings for evaluation: trusted owners ahead of everyone else,
/// then by price within each trust partition — descending for buy (highest
/// bid first), ascending for sell (most competitive first).
pub fn order_listings(
    mut listings: Vec<Listing>,
    intent: Intent,
    trusted: &HashSet<String>,
    key_metal: f64,
) -> Vec<Listing> {
    listings.sort_by(|a, b| {
        let a_rank = u8::from(!trusted.contains(&a.steamid));
        let b_rank = u8::from(!trusted.contains(&b.steamid));
        a_rank.cmp(&b_rank).then_with(|| {
            let va = to_metal(&a.currencies, key_metal);
            let vb = to_metal(&b.currencies, key_metal);
            match intent {
                Intent::Buy => vb.partial_cmp(&va),
                Intent::Sell => va.partial_cmp(&vb),
            }
            .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    listings
}

/// Derive a provisional price for one item. Any failure past the baseline
/// resolution falls back to the baseline quote verbatim when the fallback
/// policy is enabled.
pub fn derive(
    name: &str,
    inputs: DerivationInputs,
    ctx: &PricingContext,
    settings: &DerivationSettings,
) -> Result<ProvisionalPrice, PricingError> {
    // Without a usable baseline there is nothing to validate against and
    // nothing to fall back to.
    let baseline = inputs.baseline?;

    let result = derive_from_listings(
        &inputs.buy_listings,
        &inputs.sell_listings,
        &inputs.recent_sells,
        &baseline,
        ctx.key_metal,
        settings,
    );

    match result {
        Ok((buy, sell)) => Ok(ProvisionalPrice {
            buy,
            sell,
            source: PriceSource::Listings,
        }),
        Err(e) if settings.fallback_onto_baseline => {
            debug!(item = name, "Falling back to baseline: {e}");
            Ok(ProvisionalPrice {
                buy: baseline.buy,
                sell: baseline.sell,
                source: PriceSource::Baseline,
            })
        }
        Err(e) => Err(e),
    }
}

fn derive_from_listings(
    buy_listings: &[Listing],
    sell_listings: &[Listing],
    recent_sells: &[f64],
    baseline: &BaselineQuote,
    key_metal: f64,
    settings: &DerivationSettings,
) -> Result<(Currencies, Currencies), PricingError> {
    if buy_listings.is_empty() {
        return Err(PricingError::InsufficientListings { side: Intent::Buy });
    }
    if sell_listings.is_empty() {
        return Err(PricingError::InsufficientListings { side: Intent::Sell });
    }

    let buy_ordered = order_listings(buy_listings.to_vec(), Intent::Buy, &settings.trusted, key_metal);
    let sell_ordered =
        order_listings(sell_listings.to_vec(), Intent::Sell, &settings.trusted, key_metal);

    let buy = average_buy(&buy_ordered, key_metal)?;
    let sell = pick_sell(
        &sell_ordered,
        recent_sells,
        settings.sell_history_guard,
        key_metal,
    )?;

    check_divergence(&buy, &sell, baseline, key_metal, settings)?;
    Ok((buy, sell))
}

/// Buy side: mean of the top 3 ordered listings. Samples of 10 or more are
/// first cleaned of z-score outliers across the whole set.
fn average_buy(ordered: &[Listing], key_metal: f64) -> Result<Currencies, PricingError> {
    if ordered.len() < 3 {
        return Err(PricingError::InsufficientListings { side: Intent::Buy });
    }

    if ordered.len() < OUTLIER_MIN_SAMPLE {
        let top = &ordered[..3];
        let keys: i64 = top.iter().map(|l| l.currencies.keys).sum();
        let metal: f64 = top.iter().map(|l| l.currencies.metal).sum();
        return Ok(Currencies {
            keys: keys / 3,
            metal: metal / 3.0,
        });
    }

    let values: Vec<f64> = ordered
        .iter()
        .map(|l| to_metal(&l.currencies, key_metal))
        .collect();
    let m = mean(&values);
    let sd = std_dev(&values);

    let filtered: Vec<f64> = values
        .into_iter()
        .filter(|&v| z_score(v, m, sd).abs() <= OUTLIER_Z)
        .collect();
    if filtered.len() < 3 {
        return Err(PricingError::NotEnoughAfterFiltering);
    }

    let filtered_mean = mean(&filtered[..3]);
    if !filtered_mean.is_finite() || filtered_mean <= 0.0 {
        return Err(PricingError::MalformedItemSkipped);
    }

    let keys = (filtered_mean / key_metal).trunc() as i64;
    let metal = round_to_scrap(filtered_mean - keys as f64 * key_metal);
    Ok(Currencies { keys, metal })
}

/// Sell side: the most competitive listing in the trust-respecting order.
/// With the history guard on, candidates that are z-score outliers against
/// the SKU's recorded sell prices are skipped; if every candidate is
/// flagged, the single cheapest listing wins anyway.
fn pick_sell(
    ordered: &[Listing],
    recent_sells: &[f64],
    guard: bool,
    key_metal: f64,
) -> Result<Currencies, PricingError> {
    let first = ordered
        .first()
        .ok_or(PricingError::InsufficientListings { side: Intent::Sell })?;

    // The guard needs a few history points before it can call anything an
    // outlier.
    if !guard || recent_sells.len() < 3 {
        return Ok(first.currencies);
    }

    let m = mean(recent_sells);
    let sd = std_dev(recent_sells);
    for listing in ordered {
        let value = to_metal(&listing.currencies, key_metal);
        if z_score(value, m, sd).abs() <= OUTLIER_Z {
            return Ok(listing.currencies);
        }
    }

    let cheapest = ordered
        .iter()
        .min_by(|a, b| {
            to_metal(&a.currencies, key_metal)
                .partial_cmp(&to_metal(&b.currencies, key_metal))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .ok_or(PricingError::InsufficientListings { side: Intent::Sell })?;
    Ok(cheapest.currencies)
}

/// Rare-quality and killstreak tiers only need a sane spread; everything
/// else must land within the configured percentage band of the baseline.
fn check_divergence(
    buy: &Currencies,
    sell: &Currencies,
    baseline: &BaselineQuote,
    key_metal: f64,
    settings: &DerivationSettings,
) -> Result<(), PricingError> {
    let our_buy = to_metal(buy, key_metal);
    let our_sell = to_metal(sell, key_metal);

    if baseline.tier.bypasses_divergence_check() {
        if our_buy <= our_sell {
            return Ok(());
        }
        return Err(PricingError::DivergenceRejected(format!(
            "buy {our_buy} above sell {our_sell} for relaxed-tier item"
        )));
    }

    let base_buy = to_metal(&baseline.buy, key_metal);
    let base_sell = to_metal(&baseline.sell, key_metal);

    let buy_diff = percentage_difference(base_buy, our_buy);
    let sell_diff = percentage_difference(base_sell, our_sell);
    if !buy_diff.is_finite() || !sell_diff.is_finite() {
        return Err(PricingError::DivergenceRejected(
            "non-finite divergence".to_string(),
        ));
    }

    if buy_diff > settings.max_buy_divergence_pct {
        return Err(PricingError::DivergenceRejected(format!(
            "buying {buy_diff:.1}% above baseline {base_buy}"
        )));
    }
    if sell_diff < settings.max_sell_divergence_pct {
        return Err(PricingError::DivergenceRejected(format!(
            "selling {sell_diff:.1}% below baseline {base_sell}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualityTier;
    use std::sync::Arc;

    const KEY: f64 = 62.11;

    fn listing(steamid: &str, keys: i64, metal: f64, intent: Intent) -> Listing {
        Listing {
            name: "Team Captain".to_string(),
            sku: "378;6".to_string(),
            intent,
            currencies: Currencies::new(keys, metal),
            steamid: steamid.to_string(),
            updated: 0,
        }
    }

    fn buy(steamid: &str, metal: f64) -> Listing {
        listing(steamid, 0, metal, Intent::Buy)
    }

    fn sell(steamid: &str, metal: f64) -> Listing {
        listing(steamid, 0, metal, Intent::Sell)
    }

    fn settings() -> DerivationSettings {
        DerivationSettings {
            trusted: HashSet::new(),
            fallback_onto_baseline: false,
            sell_history_guard: false,
            max_buy_divergence_pct: 10.0,
            max_sell_divergence_pct: -10.0,
        }
    }

    fn quote(buy_metal: f64, sell_metal: f64, tier: QualityTier) -> BaselineQuote {
        BaselineQuote {
            buy: Currencies::metal_only(buy_metal),
            sell: Currencies::metal_only(sell_metal),
            tier,
        }
    }

    fn ctx() -> PricingContext {
        PricingContext {
            key_metal: KEY,
            baseline: Arc::new(crate::baseline::BaselineSnapshot::default()),
        }
    }

    #[test]
    fn three_buy_listings_average_without_filtering() {
        let ordered = order_listings(
            vec![buy("a", 10.0), buy("b", 12.0), buy("c", 14.0)],
            Intent::Buy,
            &HashSet::new(),
            KEY,
        );
        let avg = average_buy(&ordered, KEY).unwrap();
        assert_eq!(avg.keys, 0);
        assert!((avg.metal - 12.0).abs() < 1e-9);
    }

    #[test]
    fn fewer_than_three_buys_is_insufficient() {
        let err = average_buy(&[buy("a", 10.0), buy("b", 11.0)], KEY).unwrap_err();
        assert_eq!(err, PricingError::InsufficientListings { side: Intent::Buy });
    }

    #[test]
    fn large_sample_drops_outliers_before_averaging() {
        // 11 listings clustered around 10 metal and one wild outlier at 500.
        let mut listings: Vec<Listing> = (0..11)
            .map(|i| buy(&format!("c{i}"), 9.5 + (i as f64) * 0.11))
            .collect();
        listings.push(buy("whale", 500.0));

        let ordered = order_listings(listings, Intent::Buy, &HashSet::new(), KEY);
        let avg = average_buy(&ordered, KEY).unwrap();

        // The outlier sorts to the front, so without filtering the top-3 mean
        // would be pulled far above the cluster. After filtering it is the
        // mean of the three highest cluster listings.
        assert!(to_metal(&avg, KEY) < 20.0, "avg = {avg:?}");
        assert!(to_metal(&avg, KEY) > 9.0, "avg = {avg:?}");
    }

    #[test]
    fn identical_large_sample_has_no_outliers() {
        let listings: Vec<Listing> = (0..12).map(|i| buy(&format!("c{i}"), 10.0)).collect();
        let avg = average_buy(&listings, KEY).unwrap();
        assert!((avg.metal - 10.0).abs() < 1e-9);
    }

    #[test]
    fn trust_promotion_preserves_price_order_within_partitions() {
        let mut trusted = HashSet::new();
        trusted.insert("ownerB".to_string());

        let ordered = order_listings(
            vec![sell("ownerA", 20.0), sell("ownerB", 25.0), sell("ownerC", 18.0)],
            Intent::Sell,
            &trusted,
            KEY,
        );

        // Trusted listing first, then the untrusted partition cheapest-first.
        let owners: Vec<&str> = ordered.iter().map(|l| l.steamid.as_str()).collect();
        assert_eq!(owners, vec!["ownerB", "ownerC", "ownerA"]);

        // The chosen sell price is the head of the trust-respecting order.
        let chosen = pick_sell(&ordered, &[], false, KEY).unwrap();
        assert!((chosen.metal - 25.0).abs() < 1e-9);
    }

    #[test]
    fn sell_history_guard_skips_outlier_candidates() {
        let history = vec![20.0, 20.11, 19.89, 20.22, 20.0, 19.78, 20.11, 20.0, 20.33, 19.89];
        let ordered = order_listings(
            vec![sell("dumper", 1.0), sell("fair", 19.89)],
            Intent::Sell,
            &HashSet::new(),
            KEY,
        );
        // The 1 metal listing sorts first but is an outlier against history.
        let chosen = pick_sell(&ordered, &history, true, KEY).unwrap();
        assert!((chosen.metal - 19.89).abs() < 1e-9);
    }

    #[test]
    fn sell_guard_falls_back_to_cheapest_when_all_flagged() {
        let mut history = vec![20.0; 9];
        history.push(20.11);
        // Candidates arrive in trust order, not price order; both are far
        // outside history so the cheapest one wins.
        let ordered = vec![sell("a", 90.0), sell("b", 80.0)];
        let chosen = pick_sell(&ordered, &history, true, KEY).unwrap();
        assert!((chosen.metal - 80.0).abs() < 1e-9);
    }

    #[test]
    fn flat_sell_history_flags_nothing() {
        // Identical history points have zero spread; the guard cannot call
        // anything an outlier, so the head of the order is kept.
        let history = vec![20.0; 10];
        let ordered = vec![sell("a", 90.0)];
        let chosen = pick_sell(&ordered, &history, true, KEY).unwrap();
        assert!((chosen.metal - 90.0).abs() < 1e-9);
    }

    #[test]
    fn divergent_buy_is_rejected() {
        let baseline = quote(10.0, 12.0, QualityTier::Standard);
        let err = check_divergence(
            &Currencies::metal_only(11.55),
            &Currencies::metal_only(12.0),
            &baseline,
            KEY,
            &settings(),
        )
        .unwrap_err();
        assert!(matches!(err, PricingError::DivergenceRejected(_)));

        // Within +10% passes.
        check_divergence(
            &Currencies::metal_only(10.89),
            &Currencies::metal_only(12.0),
            &baseline,
            KEY,
            &settings(),
        )
        .unwrap();
    }

    #[test]
    fn rare_tier_only_requires_sane_spread() {
        let baseline = quote(10.0, 12.0, QualityTier::Rare);
        // Wildly divergent but buy <= sell: accepted.
        check_divergence(
            &Currencies::metal_only(100.0),
            &Currencies::metal_only(120.0),
            &baseline,
            KEY,
            &settings(),
        )
        .unwrap();
        // Inverted spread: rejected.
        let err = check_divergence(
            &Currencies::metal_only(120.0),
            &Currencies::metal_only(100.0),
            &baseline,
            KEY,
            &settings(),
        )
        .unwrap_err();
        assert!(matches!(err, PricingError::DivergenceRejected(_)));
    }

    #[test]
    fn missing_side_fails_without_fallback() {
        let inputs = DerivationInputs {
            buy_listings: vec![buy("a", 10.0), buy("b", 11.0), buy("c", 12.0)],
            sell_listings: vec![],
            baseline: Ok(quote(10.0, 12.0, QualityTier::Standard)),
            recent_sells: vec![],
        };
        let err = derive("Team Captain", inputs, &ctx(), &settings()).unwrap_err();
        assert_eq!(err, PricingError::InsufficientListings { side: Intent::Sell });
    }

    #[test]
    fn fallback_returns_baseline_verbatim() {
        let mut s = settings();
        s.fallback_onto_baseline = true;
        let inputs = DerivationInputs {
            buy_listings: vec![],
            sell_listings: vec![sell("a", 12.0)],
            baseline: Ok(quote(10.0, 12.0, QualityTier::Standard)),
            recent_sells: vec![],
        };
        let price = derive("Team Captain", inputs, &ctx(), &s).unwrap();
        assert_eq!(price.source, PriceSource::Baseline);
        assert!((price.buy.metal - 10.0).abs() < 1e-9);
        assert!((price.sell.metal - 12.0).abs() < 1e-9);
    }

    #[test]
    fn missing_baseline_fails_even_with_fallback() {
        let mut s = settings();
        s.fallback_onto_baseline = true;
        let inputs = DerivationInputs {
            buy_listings: vec![buy("a", 10.0)],
            sell_listings: vec![sell("b", 12.0)],
            baseline: Err(PricingError::BaselineUnavailable),
            recent_sells: vec![],
        };
        let err = derive("Team Captain", inputs, &ctx(), &s).unwrap_err();
        assert_eq!(err, PricingError::BaselineUnavailable);
    }

    #[test]
    fn full_derivation_happy_path() {
        let inputs = DerivationInputs {
            buy_listings: vec![buy("a", 10.0), buy("b", 10.22), buy("c", 10.11)],
            sell_listings: vec![sell("d", 11.0), sell("e", 12.0)],
            baseline: Ok(quote(10.0, 11.5, QualityTier::Standard)),
            recent_sells: vec![],
        };
        let price = derive("Team Captain", inputs, &ctx(), &settings()).unwrap();
        assert_eq!(price.source, PriceSource::Listings);
        assert!((price.buy.metal - 10.11).abs() < 1e-6);
        assert!((price.sell.metal - 11.0).abs() < 1e-9);
    }
}
