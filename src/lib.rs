pub mod cli;
pub mod core;
pub mod providers;
pub mod store;

use crate::core::config::AppConfig;
use crate::core::price::QuoteSource;
use crate::core::tax::LotMethod;
use crate::providers::coingecko::CoinGeckoSource;
use crate::providers::jupiter::JupiterSource;
use crate::providers::kraken::KrakenSource;
use crate::providers::{QuoteService, SourceChain, SyntheticPricer};
use crate::store::QuoteCache;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, info};

pub enum AppCommand {
    Quotes {
        json: bool,
    },
    Rebalance,
    Lots,
    Tax {
        asset: String,
        quantity: Decimal,
        method: Option<LotMethod>,
    },
}

/// Builds the quote service described by the configuration: providers in the
/// configured order behind a fresh cache.
pub fn build_quote_service(config: &AppConfig) -> Result<QuoteService> {
    let timeout = config.providers.timeout();
    let mut sources: Vec<Box<dyn QuoteSource>> = Vec::new();

    for name in &config.providers.order {
        let base_url = config
            .providers
            .base_url(name)
            .with_context(|| format!("Unknown quote provider '{name}'"))?;
        let source: Box<dyn QuoteSource> = match name.as_str() {
            "jupiter" => Box::new(JupiterSource::new(base_url, timeout)?),
            "coingecko" => Box::new(CoinGeckoSource::new(base_url, timeout)?),
            "kraken" => Box::new(KrakenSource::new(base_url, timeout)?),
            _ => anyhow::bail!("Unknown quote provider '{name}'"),
        };
        debug!("Using provider {} at {}", name, base_url);
        sources.push(source);
    }

    let cache = QuoteCache::new(config.cache.capacity, config.cache.freshness());
    Ok(QuoteService::new(
        cache,
        SourceChain::new(sources, timeout),
        SyntheticPricer::new(config.synthetic.clone()),
    )
    .with_concurrency(config.cache.concurrency))
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("solbasket starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let service = build_quote_service(&config)?;

    match command {
        AppCommand::Quotes { json } => cli::quotes::run(&config, &service, json).await,
        AppCommand::Rebalance => cli::rebalance::run(&config, &service).await,
        AppCommand::Lots => cli::lots::run(&config, &service).await,
        AppCommand::Tax {
            asset,
            quantity,
            method,
        } => cli::tax::run(&config, &service, &asset, quantity, method).await,
    }
}
