//! Pricing abstractions and core types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

use crate::core::error::SourceError;

/// Reference data for a tradable asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    /// Decimal places used when presenting or generating prices.
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Solana mint address, used by the Jupiter price API.
    #[serde(default)]
    pub mint: Option<String>,
    #[serde(default)]
    pub coingecko_id: Option<String>,
    #[serde(default)]
    pub kraken_pair: Option<String>,
    /// Anchor for synthetic quotes when no price was ever observed.
    #[serde(default)]
    pub fallback_price: Option<Decimal>,
    /// Base slippage rate as a fraction of notional (0.001 = 10 bp).
    #[serde(default)]
    pub slippage_rate: Option<Decimal>,
}

fn default_precision() -> u32 {
    6
}

impl Asset {
    pub fn new(symbol: &str) -> Self {
        Asset {
            symbol: symbol.to_string(),
            precision: default_precision(),
            mint: None,
            coingecko_id: None,
            kraken_pair: None,
            fallback_price: None,
            slippage_rate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub asset: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Set when the price was generated locally because every source failed.
    #[serde(default)]
    pub synthetic: bool,
}

impl Quote {
    pub fn new(asset: &str, price: Decimal, source: &str) -> Self {
        Quote {
            asset: asset.to_string(),
            price,
            timestamp: Utc::now(),
            source: source.to_string(),
            synthetic: false,
        }
    }
}

/// Result of a single provider call as recorded for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    Timeout,
    RateLimited,
    HttpStatus(u16),
    Unsupported,
    Failed(String),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

impl From<&SourceError> for AttemptOutcome {
    fn from(err: &SourceError) -> Self {
        match err {
            SourceError::Timeout(_) => AttemptOutcome::Timeout,
            SourceError::RateLimited => AttemptOutcome::RateLimited,
            SourceError::HttpStatus(code) => AttemptOutcome::HttpStatus(*code),
            SourceError::Unsupported(_) => AttemptOutcome::Unsupported,
            other => AttemptOutcome::Failed(other.to_string()),
        }
    }
}

impl Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "ok"),
            AttemptOutcome::Timeout => write!(f, "timeout"),
            AttemptOutcome::RateLimited => write!(f, "rate limited"),
            AttemptOutcome::HttpStatus(code) => write!(f, "http {code}"),
            AttemptOutcome::Unsupported => write!(f, "unsupported"),
            AttemptOutcome::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub at: DateTime<Utc>,
}

/// A single upstream price provider.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &str;

    async fn query_price(&self, asset: &Asset) -> Result<Quote, SourceError>;
}
