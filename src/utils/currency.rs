//! TF2 currency arithmetic.
//!
//! Prices are carried in refined metal (ref). One refined is nine scrap, so
//! metal amounts are multiples of 1/9 and are displayed to two decimals
//! (0.11, 0.22, ..., 0.88). Keys trade at a floating price in ref.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Scrap metal per refined metal.
pub const SCRAP_PER_REF: Decimal = dec!(9);

/// Convert a keys + metal price to refined metal.
pub fn to_refined(keys: Decimal, metal: Decimal, key_price_ref: Decimal) -> Decimal {
    keys * key_price_ref + metal
}

/// Round a refined amount to the nearest scrap, expressed in ref with two decimals.
pub fn round_to_scrap(value: Decimal) -> Decimal {
    let scrap = (value * SCRAP_PER_REF).round();
    (scrap / SCRAP_PER_REF).round_dp(2)
}

/// Split a refined amount into whole keys and leftover metal.
pub fn split_keys(value: Decimal, key_price_ref: Decimal) -> (Decimal, Decimal) {
    if key_price_ref <= Decimal::ZERO {
        return (Decimal::ZERO, value);
    }
    let keys = (value / key_price_ref).floor();
    (keys, round_to_scrap(value - keys * key_price_ref))
}

/// Human-readable "N keys, M ref" form. Negative amounts get a leading minus.
pub fn format_price(value: Decimal, key_price_ref: Decimal) -> String {
    let sign = if value.is_sign_negative() && !value.is_zero() { "-" } else { "" };
    let (keys, metal) = split_keys(value.abs(), key_price_ref);
    if keys.is_zero() {
        format!("{sign}{} ref", metal.normalize())
    } else {
        format!("{sign}{} keys, {} ref", keys.normalize(), metal.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_refined() {
        assert_eq!(to_refined(dec!(2), dec!(3.33), dec!(60)), dec!(123.33));
        assert_eq!(to_refined(Decimal::ZERO, dec!(0.11), dec!(60)), dec!(0.11));
    }

    #[test]
    fn test_round_to_scrap() {
        assert_eq!(round_to_scrap(dec!(1.30)), dec!(1.33));
        assert_eq!(round_to_scrap(dec!(0.05)), dec!(0));
        assert_eq!(round_to_scrap(dec!(2.89)), dec!(2.89));
    }

    #[test]
    fn test_split_keys() {
        assert_eq!(split_keys(dec!(125.11), dec!(60)), (dec!(2), dec!(5.11)));
        assert_eq!(split_keys(dec!(10), Decimal::ZERO), (Decimal::ZERO, dec!(10)));
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(dec!(125.11), dec!(60)), "2 keys, 5.11 ref");
        assert_eq!(format_price(dec!(0.33), dec!(60)), "0.33 ref");
        assert_eq!(format_price(dec!(-65.22), dec!(60)), "-1 keys, 5.22 ref");
    }
}
