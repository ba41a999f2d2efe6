use crate::core::error::SourceError;
use crate::core::price::{Asset, Quote, QuoteSource};
use crate::providers::util::{build_client, check_status, positive_price};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_BASE_URL: &str = "https://price.jup.ag/v4";

/// Jupiter price API, keyed by mint address.
pub struct JupiterSource {
    base_url: String,
    client: reqwest::Client,
}

impl JupiterSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(JupiterSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }
}

#[derive(Deserialize, Debug)]
struct JupiterPriceResponse {
    data: HashMap<String, JupiterPrice>,
}

#[derive(Deserialize, Debug)]
struct JupiterPrice {
    price: f64,
}

#[async_trait]
impl QuoteSource for JupiterSource {
    fn name(&self) -> &str {
        "jupiter"
    }

    #[instrument(name = "JupiterPriceFetch", skip(self, asset), fields(symbol = %asset.symbol))]
    async fn query_price(&self, asset: &Asset) -> Result<Quote, SourceError> {
        let mint = asset
            .mint
            .as_deref()
            .ok_or_else(|| SourceError::Unsupported(asset.symbol.clone()))?;

        let url = format!("{}/price?ids={}", self.base_url, mint);
        debug!("Requesting price data from {}", url);

        let response = self.client.get(&url).send().await?;
        let data: JupiterPriceResponse = check_status(response)?
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        let price = data
            .data
            .get(mint)
            .ok_or_else(|| SourceError::Parse(format!("no price data for mint {mint}")))?;

        Ok(Quote::new(
            &asset.symbol,
            positive_price(&asset.symbol, price.price)?,
            self.name(),
        ))
    }
}
