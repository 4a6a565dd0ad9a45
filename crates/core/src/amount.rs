//! Exact token amount handling.
//!
//! Amounts cross the gateway boundary as fixed-point base units (the
//! token's smallest denomination) and are shown to humans as decimal
//! strings. Both conversions are string-based and exact: no floating
//! point is involved at any step, so a value that survives parsing is
//! always reproduced bit-for-bit by formatting.
//!
//! The token's declared precision is 18 decimals in the deployed
//! configuration; [`TokenAmount`] hardcodes it as [`TOKEN_DECIMALS`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal precision of the token (base units per whole token = 10^18).
pub const TOKEN_DECIMALS: u32 = 18;

const BASE_UNITS_PER_TOKEN: u128 = 10u128.pow(TOKEN_DECIMALS);

/// Errors produced when parsing a decimal amount string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountParseError {
    /// Input is not a plain decimal number.
    #[error("not a decimal number: {0:?}")]
    NotDecimal(String),

    /// More fractional digits than the token can represent. Accepting
    /// the value would silently round base units, so it is rejected.
    #[error("too many decimal places: {got} (max {TOKEN_DECIMALS})")]
    TooManyDecimals { got: usize },

    /// Value exceeds the representable range.
    #[error("amount overflows the representable range")]
    Overflow,
}

/// A token quantity in base units.
///
/// Wraps a `u128`: with 18 decimals this covers any plausible token
/// supply. Negative quantities are unrepresentable; debits and credits
/// are expressed by the operation, not the sign.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TokenAmount(u128);

impl TokenAmount {
    /// Zero tokens.
    pub const ZERO: TokenAmount = TokenAmount(0);

    /// Wrap a raw base-unit quantity.
    pub const fn from_base_units(units: u128) -> Self {
        Self(units)
    }

    /// Construct from a whole number of tokens.
    pub const fn from_tokens(tokens: u64) -> Self {
        Self(tokens as u128 * BASE_UNITS_PER_TOKEN)
    }

    /// The raw base-unit quantity.
    pub const fn base_units(&self) -> u128 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse a human-readable decimal string ("12.5", "0.000000000000000001").
    ///
    /// The conversion is exact: fractional digits beyond the token
    /// precision are an error, never rounded.
    pub fn parse(input: &str) -> Result<Self, AmountParseError> {
        let input = input.trim();
        let (whole, frac) = match input.split_once('.') {
            Some((w, f)) => (w, f),
            None => (input, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(AmountParseError::NotDecimal(input.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountParseError::NotDecimal(input.to_string()));
        }
        if frac.len() > TOKEN_DECIMALS as usize {
            return Err(AmountParseError::TooManyDecimals { got: frac.len() });
        }

        let whole_units: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u128>()
                .map_err(|_| AmountParseError::Overflow)?
        };

        // Right-pad the fraction to full precision: "5" -> 5 * 10^17.
        let frac_units: u128 = if frac.is_empty() {
            0
        } else {
            let digits: u128 = frac
                .parse::<u128>()
                .map_err(|_| AmountParseError::Overflow)?;
            digits * 10u128.pow(TOKEN_DECIMALS - frac.len() as u32)
        };

        whole_units
            .checked_mul(BASE_UNITS_PER_TOKEN)
            .and_then(|w| w.checked_add(frac_units))
            .map(TokenAmount)
            .ok_or(AmountParseError::Overflow)
    }

    /// Format as a human-readable decimal string with trailing zeros
    /// trimmed ("12.5", not "12.500000000000000000").
    pub fn format(&self) -> String {
        let whole = self.0 / BASE_UNITS_PER_TOKEN;
        let frac = self.0 % BASE_UNITS_PER_TOKEN;

        if frac == 0 {
            return whole.to_string();
        }

        let frac_str = format!("{:0width$}", frac, width = TOKEN_DECIMALS as usize);
        format!("{}.{}", whole, frac_str.trim_end_matches('0'))
    }

    pub fn checked_add(&self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(other.0).map(TokenAmount)
    }

    pub fn checked_sub(&self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_sub(other.0).map(TokenAmount)
    }

    /// Subtraction clamped at zero, for advisory cache updates where a
    /// stale cache must not underflow.
    pub fn saturating_sub(&self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}
