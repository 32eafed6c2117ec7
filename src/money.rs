//! Money Validation Module
//!
//! Every amount entering the ledger goes through this module. Balances and
//! amounts are persisted as `DECIMAL(18, 2)`: 16 integer digits and exactly
//! two fractional digits.
//!
//! ## Rules
//! 1. Amounts must be strictly positive.
//! 2. More than two fractional digits is rejected, never rounded.
//! 3. Results are rescaled to two fractional digits so `40` and `40.00`
//!    compare and render identically.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::core_types::Amount;
use crate::error::LedgerError;

/// Fractional digits of `DECIMAL(18, 2)`.
pub const SCALE: u32 = 2;

/// Total digits of `DECIMAL(18, 2)`.
pub const PRECISION: u32 = 18;

/// Largest value representable as `DECIMAL(18, 2)`.
pub fn max_amount() -> Amount {
    // 10^16 - 0.01
    Decimal::new(9_999_999_999_999_999_99, SCALE)
}

/// Validate a transfer / ledger amount and rescale it to storage precision.
///
/// # Errors
/// * `InvalidAmount` - zero, negative, or more than two fractional digits
/// * `Overflow` - does not fit `DECIMAL(18, 2)`
pub fn validate_amount(amount: Amount) -> Result<Amount, LedgerError> {
    if amount.is_sign_negative() || amount.is_zero() {
        return Err(LedgerError::InvalidAmount(format!(
            "{amount} must be greater than zero"
        )));
    }

    let normalized = amount.normalize();
    if normalized.scale() > SCALE {
        return Err(LedgerError::InvalidAmount(format!(
            "{amount} has more than {SCALE} fractional digits"
        )));
    }

    if normalized > max_amount() {
        return Err(LedgerError::Overflow);
    }

    Ok(to_storage(normalized))
}

/// Parse a client-provided amount string.
///
/// Only plain decimal notation is accepted: no sign, no exponent, and both
/// sides of the dot must be present (`0.5`, not `.5` or `5.`).
pub fn parse_amount(amount_str: &str) -> Result<Amount, LedgerError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(LedgerError::InvalidAmount("empty string".into()));
    }

    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(LedgerError::InvalidAmount(format!(
            "{amount_str} must be unsigned"
        )));
    }

    let mut parts = amount_str.split('.');
    let whole = parts.next().unwrap_or_default();
    let frac = parts.next();
    if parts.next().is_some() {
        return Err(LedgerError::InvalidAmount("multiple decimal points".into()));
    }

    let digits_only = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !digits_only(whole) || frac.is_some_and(|f| !digits_only(f)) {
        return Err(LedgerError::InvalidAmount(format!(
            "{amount_str} is not a plain decimal number"
        )));
    }

    let amount = Decimal::from_str(amount_str)
        .map_err(|e| LedgerError::InvalidAmount(format!("{amount_str}: {e}")))?;

    validate_amount(amount)
}

/// Apply a signed delta to a balance, enforcing the storage bounds.
///
/// A negative result is reported by the caller (it knows which account and
/// request it belongs to); this function only guards against overflow.
pub fn apply_delta(balance: Amount, delta: Amount) -> Result<Amount, LedgerError> {
    let next = balance.checked_add(delta).ok_or(LedgerError::Overflow)?;
    if next > max_amount() {
        return Err(LedgerError::Overflow);
    }
    Ok(to_storage(next))
}

/// Rescale to exactly two fractional digits.
#[inline]
pub fn to_storage(amount: Amount) -> Amount {
    let mut amount = amount;
    amount.rescale(SCALE);
    amount
}
