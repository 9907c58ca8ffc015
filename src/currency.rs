//! Metal/key arithmetic. All stored metal amounts are multiples of one scrap
//! (0.11 refined); every derived value passes through [`round_to_scrap`]
//! before it is persisted or compared.

use crate::types::Currencies;

/// One scrap in refined metal.
pub const SCRAP: f64 = 0.11;

/// Round a refined-metal amount to the nearest scrap increment.
///
/// The fractional part snaps to the closest multiple of 0.11; a fraction that
/// rounds to nine steps (0.99) carries into the next whole refined.
pub fn round_to_scrap(value: f64) -> f64 {
    let whole = value.floor();
    let steps = ((value - whole) / SCRAP).round();
    let out = if steps == 9.0 {
        whole + 1.0
    } else {
        whole + steps * SCRAP
    };
    (out * 100.0).round() / 100.0
}

/// Collapse a keys+metal pair into a single metal-equivalent scalar at the
/// given key price, rounded to the nearest scrap.
pub fn to_metal(currencies: &Currencies, key_metal: f64) -> f64 {
    round_to_scrap(currencies.keys as f64 * key_metal + currencies.metal)
}

/// Re-split a price into the canonical keys/metal representation at the
/// current key price: as many whole keys as the total value affords, with the
/// remainder as scrap-rounded metal.
pub fn parse_price(original: &Currencies, key_metal: f64) -> Currencies {
    let metal = round_to_scrap(original.keys as f64 * key_metal) + original.metal;
    Currencies {
        keys: (metal / key_metal).trunc() as i64,
        metal: round_to_scrap(metal % key_metal),
    }
}

/// Percentage difference of `value` relative to `reference`.
pub fn percentage_difference(reference: f64, value: f64) -> f64 {
    if reference == 0.0 {
        return if value == 0.0 { 0.0 } else { 100.0 };
    }
    (value - reference) / reference.abs() * 100.0
}
