use crate::core::basket::Basket;
use crate::core::guardrail::{GuardrailPolicy, MarketContext, RebalanceClock, RebalanceCost};
use crate::core::price::Asset;
use crate::core::simulator::{CostModel, Session};
use crate::core::tax::{Lot, LotMethod, TaxRates};
use crate::providers::synthetic::SyntheticConfig;
use crate::providers::{coingecko, jupiter, kraken};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProvidersConfig {
    /// Providers in the order they are tried.
    #[serde(default = "default_provider_order")]
    pub order: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub jupiter: Option<ProviderEndpoint>,
    pub coingecko: Option<ProviderEndpoint>,
    pub kraken: Option<ProviderEndpoint>,
}

fn default_provider_order() -> Vec<String> {
    vec![
        "jupiter".to_string(),
        "coingecko".to_string(),
        "kraken".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            order: default_provider_order(),
            timeout_secs: default_timeout_secs(),
            jupiter: Some(ProviderEndpoint {
                base_url: jupiter::DEFAULT_BASE_URL.to_string(),
            }),
            coingecko: Some(ProviderEndpoint {
                base_url: coingecko::DEFAULT_BASE_URL.to_string(),
            }),
            kraken: Some(ProviderEndpoint {
                base_url: kraken::DEFAULT_BASE_URL.to_string(),
            }),
        }
    }
}

impl ProvidersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base URL for a provider, falling back to its public endpoint.
    pub fn base_url(&self, provider: &str) -> Option<&str> {
        let (endpoint, default) = match provider {
            "jupiter" => (&self.jupiter, jupiter::DEFAULT_BASE_URL),
            "coingecko" => (&self.coingecko, coingecko::DEFAULT_BASE_URL),
            "kraken" => (&self.kraken, kraken::DEFAULT_BASE_URL),
            _ => return None,
        };
        Some(endpoint.as_ref().map_or(default, |e| e.base_url.as_str()))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    /// Maximum concurrent lookups when fetching several quotes.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_capacity() -> usize {
    crate::store::memory::DEFAULT_CAPACITY
}

fn default_freshness_secs() -> u64 {
    crate::store::memory::DEFAULT_FRESHNESS.as_secs()
}

fn default_concurrency() -> usize {
    crate::providers::service::DEFAULT_CONCURRENCY
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: default_capacity(),
            freshness_secs: default_freshness_secs(),
            concurrency: default_concurrency(),
        }
    }
}

impl CacheConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TaxConfig {
    #[serde(default)]
    pub method: LotMethod,
    #[serde(default)]
    pub rates: TaxRates,
}

/// The user's holdings and rebalance history, loaded fresh on every run.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PortfolioConfig {
    pub basket: Basket,
    pub total_value: Decimal,
    #[serde(default)]
    pub lots: Vec<Lot>,
    #[serde(default)]
    pub last_rebalance: Option<DateTime<Utc>>,
    /// Portfolio values over time, oldest first.
    #[serde(default)]
    pub nav_history: Vec<Decimal>,
    /// Daily closes per asset, oldest first. Feeds the volatility cap.
    #[serde(default)]
    pub price_history: BTreeMap<String, Vec<Decimal>>,
}

impl PortfolioConfig {
    pub fn session(&self) -> Session {
        Session {
            basket: self.basket.clone(),
            lots: self.lots.clone(),
            total_value: self.total_value,
        }
    }

    pub fn clock(&self, now: DateTime<Utc>) -> RebalanceClock {
        RebalanceClock {
            now,
            last_rebalance: self.last_rebalance,
        }
    }

    pub fn market_context(&self, estimated_cost: Decimal) -> MarketContext<'_> {
        MarketContext {
            nav_history: &self.nav_history,
            price_history: Some(&self.price_history),
            cost: Some(RebalanceCost {
                estimated_cost,
                portfolio_value: self.total_value,
            }),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_assets")]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub guardrail: GuardrailPolicy,
    #[serde(default)]
    pub costs: CostModel,
    #[serde(default)]
    pub tax: TaxConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
    pub portfolio: PortfolioConfig,
}

fn asset(
    symbol: &str,
    mint: &str,
    coingecko_id: &str,
    kraken_pair: Option<&str>,
    fallback_price: Decimal,
) -> Asset {
    Asset {
        mint: Some(mint.to_string()),
        coingecko_id: Some(coingecko_id.to_string()),
        kraken_pair: kraken_pair.map(str::to_string),
        fallback_price: Some(fallback_price),
        ..Asset::new(symbol)
    }
}

/// Reference data for the supported Solana assets.
pub fn default_assets() -> Vec<Asset> {
    vec![
        asset(
            "SOL",
            "So11111111111111111111111111111111111111112",
            "solana",
            Some("SOLUSD"),
            dec!(180),
        ),
        asset(
            "mSOL",
            "mSoLzYCxHdYgdzU16g5QSh3i5K3z3KZK7ytfqcJm7So",
            "marinade-staked-sol",
            None,
            dec!(190),
        ),
        asset(
            "stSOL",
            "7dHbWXmci3dT8UFYWYZweBLXgycu7Y3iL6trKn1Y7ARj",
            "lido-staked-sol",
            None,
            dec!(185),
        ),
        Asset {
            precision: 10,
            ..asset(
                "BONK",
                "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263",
                "bonk",
                None,
                dec!(0.000025),
            )
        },
        asset(
            "USDC",
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            "usd-coin",
            Some("USDCUSD"),
            dec!(0.9999),
        ),
        asset(
            "USDT",
            "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB",
            "tether",
            Some("USDTUSD"),
            dec!(0.9998),
        ),
    ]
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("io", "solbasket", "solbasket")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    pub fn asset(&self, symbol: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    /// Reference data for every basket asset. Symbols without configured
    /// reference data get a bare entry.
    pub fn basket_assets(&self) -> Vec<Asset> {
        self.portfolio
            .basket
            .symbols()
            .map(|s| self.asset(s).cloned().unwrap_or_else(|| Asset::new(s)))
            .collect()
    }

    /// Cost model with per-asset slippage overrides applied.
    pub fn cost_model(&self) -> CostModel {
        self.costs.clone().with_assets(&self.assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guardrail::RebalanceMode;

    #[test]
    fn test_config_deserialization_with_defaults() {
        let yaml_str = r#"
portfolio:
  total_value: 10000
  basket:
    SOL: 60
    USDC: 40
  lots:
    - id: "sol-1"
      asset: "SOL"
      acquired_at: "2024-01-15T00:00:00Z"
      quantity: 20
      cost_basis: 95.5
"#;

        let config: AppConfig = serde_yaml::from_str(yaml_str).expect("Failed to deserialize");
        assert_eq!(config.assets.len(), 6);
        assert_eq!(config.providers.order, vec!["jupiter", "coingecko", "kraken"]);
        assert_eq!(config.providers.timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.freshness(), Duration::from_secs(7));
        assert_eq!(config.guardrail.drift_threshold, dec!(2));
        assert_eq!(config.tax.method, LotMethod::Fifo);
        assert_eq!(config.tax.rates.short_term, dec!(0.22));
        assert_eq!(config.synthetic.seed, 42);

        let session = config.portfolio.session();
        assert_eq!(session.basket.weight("SOL"), Some(dec!(60)));
        assert_eq!(session.lots[0].cost_basis, dec!(95.5));
        assert!(config.portfolio.last_rebalance.is_none());

        assert_eq!(
            config.providers.base_url("jupiter"),
            Some(jupiter::DEFAULT_BASE_URL)
        );
        assert!(config.providers.base_url("binance").is_none());
    }

    #[test]
    fn test_config_overrides() {
        let yaml_str = r#"
assets:
  - symbol: "SOL"
    mint: "So11111111111111111111111111111111111111112"
    slippage_rate: 0.0025
providers:
  order: ["coingecko"]
  timeout_secs: 3
  coingecko:
    base_url: "http://localhost:9999"
guardrail:
  mode: cost_aware
  drift_threshold: 5
  max_drawdown_pct: 15
  vol_cap_pct: 25
tax:
  method: hifo
  rates:
    short_term: 0.3
portfolio:
  total_value: 500
  basket:
    SOL: 100
    JUP: 0
  price_history:
    SOL: [100, 110, 105]
"#;
        let config: AppConfig = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(config.providers.order, vec!["coingecko"]);
        assert_eq!(
            config.providers.base_url("coingecko"),
            Some("http://localhost:9999")
        );
        assert_eq!(config.guardrail.max_drawdown_pct, Some(dec!(15)));
        assert_eq!(config.guardrail.mode, RebalanceMode::CostAware);
        assert_eq!(config.guardrail.vol_cap_pct, Some(dec!(25)));
        assert_eq!(config.guardrail.reserve_asset, "USDC");

        let context = config.portfolio.market_context(dec!(12));
        assert_eq!(context.price_history.unwrap()["SOL"].len(), 3);
        assert_eq!(context.cost.unwrap().portfolio_value, dec!(500));
        assert_eq!(config.tax.method, LotMethod::Hifo);
        assert_eq!(config.tax.rates.long_term, dec!(0.15));
        assert_eq!(config.cost_model().base_rate("SOL"), dec!(0.0025));

        let assets = config.basket_assets();
        let symbols: Vec<_> = assets.iter().map(|a| a.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["JUP", "SOL"]);
        assert!(assets[0].mint.is_none());
    }
}
