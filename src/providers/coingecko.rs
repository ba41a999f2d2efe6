use crate::core::error::SourceError;
use crate::core::price::{Asset, Quote, QuoteSource};
use crate::providers::util::{build_client, check_status, positive_price};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

pub struct CoinGeckoSource {
    base_url: String,
    client: reqwest::Client,
}

impl CoinGeckoSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(CoinGeckoSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }
}

#[derive(Deserialize, Debug)]
struct UsdPrice {
    usd: Option<f64>,
}

#[async_trait]
impl QuoteSource for CoinGeckoSource {
    fn name(&self) -> &str {
        "coingecko"
    }

    #[instrument(name = "CoinGeckoPriceFetch", skip(self, asset), fields(symbol = %asset.symbol))]
    async fn query_price(&self, asset: &Asset) -> Result<Quote, SourceError> {
        let id = asset
            .coingecko_id
            .as_deref()
            .ok_or_else(|| SourceError::Unsupported(asset.symbol.clone()))?;

        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.base_url, id
        );
        debug!("Requesting price data from {}", url);

        let response = self.client.get(&url).send().await?;
        let data: HashMap<String, UsdPrice> = check_status(response)?
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        let price = data
            .get(id)
            .and_then(|p| p.usd)
            .ok_or_else(|| SourceError::Parse(format!("no usd price for {id}")))?;

        Ok(Quote::new(
            &asset.symbol,
            positive_price(&asset.symbol, price)?,
            self.name(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn msol() -> Asset {
        Asset {
            coingecko_id: Some("marinade-staked-sol".to_string()),
            ..Asset::new("mSOL")
        }
    }

    async fn create_mock_server(status: u16, body: &str) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .and(query_param("ids", "marinade-staked-sol"))
            .and(query_param("vs_currencies", "usd"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&mock_server)
            .await;
        mock_server
    }

    #[tokio::test]
    async fn test_successful_price_fetch() {
        let server =
            create_mock_server(200, r#"{"marinade-staked-sol": {"usd": 195.25}}"#).await;
        let source = CoinGeckoSource::new(&server.uri(), Duration::from_secs(5)).unwrap();

        let quote = source.query_price(&msol()).await.unwrap();
        assert_eq!(quote.price, dec!(195.25));
        assert_eq!(quote.source, "coingecko");
    }

    #[tokio::test]
    async fn test_server_error() {
        let server = create_mock_server(500, "").await;
        let source = CoinGeckoSource::new(&server.uri(), Duration::from_secs(5)).unwrap();

        let err = source.query_price(&msol()).await.unwrap_err();
        assert_eq!(err, SourceError::HttpStatus(500));
        assert_eq!(err.to_string(), "HTTP error: 500");
    }

    #[tokio::test]
    async fn test_zero_price_is_rejected() {
        let server = create_mock_server(200, r#"{"marinade-staked-sol": {"usd": 0}}"#).await;
        let source = CoinGeckoSource::new(&server.uri(), Duration::from_secs(5)).unwrap();

        let err = source.query_price(&msol()).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidPrice { .. }));
    }
}
