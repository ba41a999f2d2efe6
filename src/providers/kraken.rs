use crate::core::error::SourceError;
use crate::core::price::{Asset, Quote, QuoteSource};
use crate::providers::util::{build_client, check_status};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_BASE_URL: &str = "https://api.kraken.com";

/// Kraken public ticker. Only covers assets with a USD pair.
pub struct KrakenSource {
    base_url: String,
    client: reqwest::Client,
}

impl KrakenSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(KrakenSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }
}

#[derive(Deserialize, Debug)]
struct TickerResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, Ticker>,
}

#[derive(Deserialize, Debug)]
struct Ticker {
    /// Last trade closed: [price, lot volume].
    c: Vec<String>,
}

#[async_trait]
impl QuoteSource for KrakenSource {
    fn name(&self) -> &str {
        "kraken"
    }

    #[instrument(name = "KrakenPriceFetch", skip(self, asset), fields(symbol = %asset.symbol))]
    async fn query_price(&self, asset: &Asset) -> Result<Quote, SourceError> {
        let pair = asset
            .kraken_pair
            .as_deref()
            .ok_or_else(|| SourceError::Unsupported(asset.symbol.clone()))?;

        let url = format!("{}/0/public/Ticker?pair={}", self.base_url, pair);
        debug!("Requesting price data from {}", url);

        let response = self.client.get(&url).send().await?;
        let data: TickerResponse = check_status(response)?
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        if data.error.iter().any(|e| e.contains("Rate limit")) {
            return Err(SourceError::RateLimited);
        }

        let last = data
            .result
            .get(pair)
            .and_then(|t| t.c.first())
            .ok_or_else(|| SourceError::Parse(format!("no ticker for pair {pair}")))?;

        let price = Decimal::from_str(last)
            .map_err(|e| SourceError::Parse(format!("bad price '{last}': {e}")))?;
        if price <= Decimal::ZERO {
            return Err(SourceError::InvalidPrice {
                asset: asset.symbol.clone(),
                price: last.clone(),
            });
        }

        Ok(Quote::new(&asset.symbol, price, self.name()))
    }
}
