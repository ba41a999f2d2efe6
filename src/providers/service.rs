use crate::core::cache::CacheHealth;
use crate::core::price::{Asset, Quote};
use crate::providers::chain::{SourceChain, SourceHealth};
use crate::providers::synthetic::SyntheticPricer;
use crate::store::{QuoteCache, StaleQuote};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument, warn};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Cache in front of the source chain, with a synthetic fallback so a caller
/// always gets a quote.
pub struct QuoteService {
    cache: QuoteCache,
    chain: SourceChain,
    synthetic: SyntheticPricer,
    synthetic_fallbacks: AtomicU64,
    concurrency: usize,
}

impl QuoteService {
    pub fn new(cache: QuoteCache, chain: SourceChain, synthetic: SyntheticPricer) -> Self {
        QuoteService {
            cache,
            chain,
            synthetic,
            synthetic_fallbacks: AtomicU64::new(0),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[instrument(name = "GetQuote", skip(self, asset), fields(symbol = %asset.symbol))]
    pub async fn get_quote(&self, asset: &Asset) -> Quote {
        if let Some(quote) = self.cache.get(&asset.symbol).await {
            return quote;
        }

        match self.chain.query(asset).await {
            Ok(quote) => {
                self.cache.put(&asset.symbol, quote.clone()).await;
                quote
            }
            Err(e) => {
                warn!("{}, using synthetic price", e);
                self.synthetic_fallbacks.fetch_add(1, Ordering::Relaxed);
                let anchor = self
                    .cache
                    .last_known(&asset.symbol)
                    .await
                    .map(|stale| stale.quote.price);
                self.synthetic.next_quote(asset, anchor).await
            }
        }
    }

    /// Quotes for every distinct symbol in `assets`, fetched with bounded
    /// parallelism. Each symbol is looked up once.
    pub async fn get_quote_all(&self, assets: &[Asset]) -> HashMap<String, Quote> {
        let mut seen = HashSet::new();
        let unique: Vec<&Asset> = assets
            .iter()
            .filter(|a| seen.insert(a.symbol.as_str()))
            .collect();
        debug!("Fetching quotes for {} assets", unique.len());

        stream::iter(unique)
            .map(|asset| async move { (asset.symbol.clone(), self.get_quote(asset).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    pub fn cache_health(&self) -> CacheHealth {
        self.cache.health()
    }

    pub async fn source_health(&self) -> SourceHealth {
        self.chain.health().await
    }

    pub async fn last_known(&self, symbol: &str) -> Option<StaleQuote> {
        self.cache.last_known(symbol).await
    }

    pub fn synthetic_fallbacks(&self) -> u64 {
        self.synthetic_fallbacks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SourceError;
    use crate::core::price::QuoteSource;
    use crate::providers::chain::DEFAULT_PROVIDER_TIMEOUT;
    use crate::providers::chain::tests::MockSource;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn service(sources: Vec<Box<dyn QuoteSource>>, freshness: Duration) -> QuoteService {
        QuoteService::new(
            QuoteCache::new(100, freshness),
            SourceChain::new(sources, DEFAULT_PROVIDER_TIMEOUT),
            SyntheticPricer::default(),
        )
    }

    #[tokio::test]
    async fn test_second_call_within_window_is_a_cache_hit() {
        let source = MockSource::ok("jupiter", dec!(180));
        let calls = Arc::clone(&source.calls);
        let service = service(vec![Box::new(source)], Duration::from_secs(60));
        let sol = Asset::new("SOL");

        let first = service.get_quote(&sol).await;
        let hits_before = service.cache_health().hits;
        let second = service.get_quote(&sol).await;

        assert_eq!(first, second);
        assert_eq!(service.cache_health().hits, hits_before + 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_sources_failing_returns_synthetic_quote() {
        let service = service(
            vec![
                Box::new(MockSource::failing("jupiter", SourceError::HttpStatus(503))),
                Box::new(MockSource::failing("coingecko", SourceError::RateLimited)),
            ],
            Duration::from_secs(60),
        );
        let usdc = Asset {
            fallback_price: Some(dec!(0.9999)),
            ..Asset::new("USDC")
        };

        let quote = service.get_quote(&usdc).await;
        assert!(quote.synthetic);
        assert!(quote.price > dec!(0.94) && quote.price < dec!(1.05));
        assert_eq!(service.synthetic_fallbacks(), 1);
        // Synthetic quotes never enter the cache.
        assert_eq!(service.cache_health().size, 0);

        let _ = service.get_quote(&usdc).await;
        assert_eq!(service.synthetic_fallbacks(), 2);
    }

    #[tokio::test]
    async fn test_synthetic_anchors_to_last_real_price() {
        let cache = QuoteCache::new(100, Duration::from_millis(10));
        cache
            .put("SOL", Quote::new("SOL", dec!(200), "jupiter"))
            .await;
        let service = QuoteService::new(
            cache,
            SourceChain::new(
                vec![Box::new(MockSource::failing("jupiter", SourceError::RateLimited))],
                DEFAULT_PROVIDER_TIMEOUT,
            ),
            SyntheticPricer::default(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let quote = service.get_quote(&Asset::new("SOL")).await;
        assert!(quote.synthetic);
        assert!(quote.price >= dec!(190) && quote.price <= dec!(210));
    }

    #[tokio::test]
    async fn test_get_quote_all_dedups_symbols() {
        let source = MockSource::ok("jupiter", dec!(1));
        let calls = Arc::clone(&source.calls);
        let service =
            service(vec![Box::new(source)], Duration::from_secs(60)).with_concurrency(2);
        let assets = vec![
            Asset::new("SOL"),
            Asset::new("USDC"),
            Asset::new("SOL"),
            Asset::new("BONK"),
        ];

        let quotes = service.get_quote_all(&assets).await;
        assert_eq!(quotes.len(), 3);
        assert_eq!(quotes["BONK"].asset, "BONK");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_asset_does_not_stall_others() {
        let source = MockSource {
            symbol_delays: HashMap::from([
                ("SOL", Duration::from_millis(400)),
                ("BONK", Duration::from_millis(400)),
            ]),
            ..MockSource::ok("jupiter", dec!(1))
        };
        let service = service(vec![Box::new(source)], Duration::from_secs(60));
        let assets: Vec<_> = ["SOL", "USDC", "BONK", "mSOL"]
            .into_iter()
            .map(Asset::new)
            .collect();

        let started = Instant::now();
        let quotes = service.get_quote_all(&assets).await;
        let elapsed = started.elapsed();

        assert_eq!(quotes.len(), 4);
        assert!(quotes.values().all(|q| !q.synthetic));
        assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_synthetic_prices_reproducible_under_concurrency() {
        let symbols = ["SOL", "USDC", "BONK", "mSOL"];
        let assets: Vec<_> = symbols
            .iter()
            .map(|s| Asset {
                fallback_price: Some(dec!(100)),
                ..Asset::new(s)
            })
            .collect();

        let mut runs = Vec::new();
        for round in 0..5 {
            // Rotate which asset's sources fail first.
            let symbol_delays = symbols
                .iter()
                .enumerate()
                .map(|(i, s)| (*s, Duration::from_millis(((i + round) % 4) as u64 * 5)))
                .collect();
            let source = MockSource {
                symbol_delays,
                ..MockSource::failing("jupiter", SourceError::HttpStatus(503))
            };
            let service = service(vec![Box::new(source)], Duration::from_secs(60));
            let prices: HashMap<_, _> = service
                .get_quote_all(&assets)
                .await
                .into_iter()
                .map(|(symbol, quote)| (symbol, quote.price))
                .collect();
            assert_eq!(service.synthetic_fallbacks(), 4);
            runs.push(prices);
        }

        assert!(runs.windows(2).all(|pair| pair[0] == pair[1]), "{runs:?}");
    }
}
