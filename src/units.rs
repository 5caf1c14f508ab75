//! Conversion between human token amounts and integer wei.
//!
//! Amounts crossing the presentation boundary are decimal strings in whole-token units (e.g.
//! `"150.5"`). On chain, and in the session's internal state, they are 18-decimal fixed-point
//! integers ("wei").

use alloy::primitives::utils::{format_ether, parse_ether};

use crate::{
    Error, Result,
    error::{ResultExt, ensure},
    types::common::TokenAmount,
};

/// Number of fractional decimal digits in one whole token.
pub const TOKEN_DECIMALS: usize = 18;

/// Convert a human decimal amount into wei.
///
/// A missing amount is treated as zero rather than an error, with a logged diagnostic. This
/// mirrors how the dashboard treats an empty amount field.
pub fn ether_to_wei(amount: Option<&str>) -> Result<TokenAmount> {
    let Some(amount) = amount else {
        tracing::warn!("missing token amount, treating as 0");
        return Ok(TokenAmount::ZERO);
    };
    let amount = amount.trim();
    ensure!(
        !amount.is_empty(),
        Error::bad_request().context("empty token amount")
    );
    ensure!(
        !amount.starts_with('-'),
        Error::bad_request().context(format!("negative token amount {amount}"))
    );
    if let Some((_, fraction)) = amount.split_once('.') {
        ensure!(
            fraction.len() <= TOKEN_DECIMALS,
            Error::bad_request().context(format!(
                "token amount {amount} has more than {TOKEN_DECIMALS} fractional digits"
            ))
        );
    }
    parse_ether(amount)
        .context(|| Error::bad_request().context(format!("invalid token amount {amount:?}")))
}

/// Convert a wei amount into its shortest human decimal representation.
///
/// Trailing fractional zeros are dropped, as is the decimal point for whole amounts, so that
/// `wei_to_ether(ether_to_wei(s)) == s` for any canonical decimal string `s`.
pub fn wei_to_ether(amount: Option<TokenAmount>) -> String {
    let Some(amount) = amount else {
        return "0".to_string();
    };
    let formatted = format_ether(amount);
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                whole.to_string()
            } else {
                format!("{whole}.{fraction}")
            }
        }
        None => formatted,
    }
}
