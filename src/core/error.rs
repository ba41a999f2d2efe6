//! Error types surfaced by the quote layer and the rebalance engine.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::core::price::Attempt;

/// Failure of a single quote source. The chain recovers from all of these by
/// moving on to the next provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("rate limited")]
    RateLimited,

    #[error("HTTP error: {0}")]
    HttpStatus(u16),

    #[error("no identifier configured for {0}")]
    Unsupported(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid price {price} for {asset}")]
    InvalidPrice { asset: String, price: String },
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout(0)
        } else if let Some(status) = err.status() {
            SourceError::HttpStatus(status.as_u16())
        } else if err.is_decode() {
            SourceError::Parse(err.to_string())
        } else {
            SourceError::Transport(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum QuoteError {
    #[error("all sources exhausted for {asset} (tried: {})", describe_attempts(.attempts))]
    AllSourcesExhausted {
        asset: String,
        attempts: Vec<Attempt>,
    },
}

fn describe_attempts(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no providers configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.outcome))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while selecting or committing tax lots.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaxError {
    #[error("insufficient lots for {asset}: requested {requested}, available {available}")]
    InsufficientLots {
        asset: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("unknown lot {lot_id} for {asset}")]
    UnknownLot { asset: String, lot_id: String },

    #[error("lot {0} listed more than once")]
    DuplicateLot(String),

    #[error("sell quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("lot {lot_id} has {remaining} remaining, plan consumes {consumed}")]
    OverConsumed {
        lot_id: String,
        remaining: Decimal,
        consumed: Decimal,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("no usable quote for {0}")]
    MissingQuote(String),

    #[error("total portfolio value must be positive, got {0}")]
    InvalidTotal(Decimal),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::price::AttemptOutcome;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[test]
    fn test_exhausted_lists_providers_in_order() {
        let attempts = vec![
            Attempt {
                provider: "jupiter".to_string(),
                outcome: AttemptOutcome::Timeout,
                latency: Duration::from_millis(10),
                at: Utc::now(),
            },
            Attempt {
                provider: "kraken".to_string(),
                outcome: AttemptOutcome::RateLimited,
                latency: Duration::from_millis(3),
                at: Utc::now(),
            },
        ];
        let err = QuoteError::AllSourcesExhausted {
            asset: "SOL".to_string(),
            attempts,
        };
        assert_eq!(
            err.to_string(),
            "all sources exhausted for SOL (tried: jupiter: timeout, kraken: rate limited)"
        );
    }

    #[test]
    fn test_insufficient_lots_message() {
        let err = TaxError::InsufficientLots {
            asset: "SOL".to_string(),
            requested: dec!(10),
            available: dec!(7.5),
        };
        assert_eq!(
            err.to_string(),
            "insufficient lots for SOL: requested 10, available 7.5"
        );
    }
}
