//! Facilitator fee computation.
//!
//! A pure function over base-unit integers: the facilitator keeps
//! `floor(amount * FEE_BPS / 10000)` and the merchant nets the rest. The
//! breakdown is rendered for every response, accepted or rejected, so
//! clients always see the fee split they would be charged.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Facilitator fee in basis points (1%).
pub const FEE_BPS: u128 = 100;

/// Longest base-unit amount accepted, in decimal digits. Keeps amounts well
/// inside `u128` and the display mantissa.
pub const MAX_AMOUNT_DIGITS: usize = 28;

/// One leg of a fee breakdown: the same amount in human units and base units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountLeg {
    /// Decimal string in whole-token units, trailing zeros trimmed.
    pub human: String,
    /// Integer string in token base units.
    pub base: String,
    pub symbol: String,
}

/// Gross/fee/net decomposition of a payment amount.
///
/// Invariant: `fee.base + net.base == amount.base` exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub amount: AmountLeg,
    pub fee: AmountLeg,
    pub net: AmountLeg,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("Invalid amount: expected a decimal string of base units")]
    NotANumber,
    #[error("Invalid amount: exceeds {MAX_AMOUNT_DIGITS} digits")]
    TooLarge,
}

/// Parse a base-unit amount from its wire form.
pub fn parse_base_units(input: &str) -> Result<u128, AmountParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountParseError::NotANumber);
    }
    if trimmed.len() > MAX_AMOUNT_DIGITS {
        return Err(AmountParseError::TooLarge);
    }
    trimmed.parse().map_err(|_| AmountParseError::NotANumber)
}

/// Split a gross amount into `(fee, net)` at `bps` basis points.
pub fn split_amount(amount: u128, bps: u128) -> (u128, u128) {
    let fee = amount * bps / 10_000;
    (fee, amount - fee)
}

/// Render a base-unit amount in whole-token units, trailing zeros trimmed.
pub fn human_units(amount: u128, decimals: u8) -> String {
    match i128::try_from(amount)
        .ok()
        .and_then(|amount| Decimal::try_from_i128_with_scale(amount, decimals as u32).ok())
    {
        Some(decimal) => decimal.normalize().to_string(),
        // Out of display mantissa range; the base-unit string is still exact.
        None => amount.to_string(),
    }
}

/// Build the full gross/fee/net breakdown for an amount.
pub fn breakdown(amount: u128, decimals: u8, symbol: &str) -> FeeBreakdown {
    let (fee, net) = split_amount(amount, FEE_BPS);
    let leg = |value: u128| AmountLeg {
        human: human_units(value, decimals),
        base: value.to_string(),
        symbol: symbol.to_string(),
    };
    FeeBreakdown {
        amount: leg(amount),
        fee: leg(fee),
        net: leg(net),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_usdc_splits_into_one_percent_fee() {
        let breakdown = breakdown(1_000_000, 6, "usdc");
        assert_eq!(breakdown.amount.human, "1");
        assert_eq!(breakdown.fee.human, "0.01");
        assert_eq!(breakdown.net.human, "0.99");
        assert_eq!(breakdown.fee.base, "10000");
        assert_eq!(breakdown.net.base, "990000");
    }

    #[test]
    fn fee_plus_net_equals_amount_exactly() {
        for amount in [0u128, 1, 99, 100, 101, 9_999, 10_001, 1_000_000_000_000_000_000] {
            let (fee, net) = split_amount(amount, FEE_BPS);
            assert_eq!(fee + net, amount);
            assert_eq!(fee, amount * FEE_BPS / 10_000);
        }
    }

    #[test]
    fn fee_rounds_down() {
        // 99 base units at 1% -> 0.99, floored to 0.
        let (fee, net) = split_amount(99, FEE_BPS);
        assert_eq!(fee, 0);
        assert_eq!(net, 99);
        let (fee, _) = split_amount(199, FEE_BPS);
        assert_eq!(fee, 1);
    }

    #[test]
    fn human_units_trims_trailing_zeros() {
        assert_eq!(human_units(1_000_000, 6), "1");
        assert_eq!(human_units(1_500_000, 6), "1.5");
        assert_eq!(human_units(10_000, 6), "0.01");
        assert_eq!(human_units(0, 6), "0");
        assert_eq!(human_units(1, 18), "0.000000000000000001");
    }

    #[test]
    fn parse_base_units_accepts_digits_only() {
        assert_eq!(parse_base_units("1000000").unwrap(), 1_000_000);
        assert_eq!(parse_base_units(" 42 ").unwrap(), 42);
        assert!(matches!(
            parse_base_units("1.5"),
            Err(AmountParseError::NotANumber)
        ));
        assert!(matches!(
            parse_base_units("-3"),
            Err(AmountParseError::NotANumber)
        ));
        assert!(matches!(
            parse_base_units(""),
            Err(AmountParseError::NotANumber)
        ));
        let too_long = "9".repeat(MAX_AMOUNT_DIGITS + 1);
        assert!(matches!(
            parse_base_units(&too_long),
            Err(AmountParseError::TooLarge)
        ));
    }
}
