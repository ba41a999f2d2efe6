//! Ordered cascade over quote sources with per-provider health tracking.

use crate::core::error::{QuoteError, SourceError};
use crate::core::price::{Asset, Attempt, AttemptOutcome, Quote, QuoteSource};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);
const RECENT_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub last_outcome: Option<AttemptOutcome>,
    pub last_latency: Option<Duration>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub successes: u64,
    pub failures: u64,
    /// Calls in the rolling window the statistics below are computed over.
    pub recent_calls: usize,
    pub avg_latency: Option<Duration>,
    pub p50_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    /// Failed share of the rolling window, in percent.
    pub error_rate: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceHealth {
    /// One entry per provider, in chain order.
    pub providers: Vec<ProviderHealth>,
    /// Most recent attempts across all providers, oldest first.
    pub recent_attempts: Vec<Attempt>,
}

impl ProviderHealth {
    pub fn new(provider: &str) -> Self {
        ProviderHealth {
            provider: provider.to_string(),
            last_outcome: None,
            last_latency: None,
            last_attempt_at: None,
            successes: 0,
            failures: 0,
            recent_calls: 0,
            avg_latency: None,
            p50_latency: None,
            p95_latency: None,
            error_rate: Decimal::ZERO,
        }
    }
}

struct HealthState {
    providers: Vec<ProviderHealth>,
    /// Latency and success of each provider's last calls.
    windows: Vec<VecDeque<(Duration, bool)>>,
    recent: VecDeque<Attempt>,
}

pub struct SourceChain {
    sources: Vec<Box<dyn QuoteSource>>,
    timeout: Duration,
    health: Mutex<HealthState>,
}

impl SourceChain {
    pub fn new(sources: Vec<Box<dyn QuoteSource>>, timeout: Duration) -> Self {
        let providers = sources.iter().map(|s| ProviderHealth::new(s.name())).collect();
        let windows = sources.iter().map(|_| VecDeque::new()).collect();
        SourceChain {
            sources,
            timeout,
            health: Mutex::new(HealthState {
                providers,
                windows,
                recent: VecDeque::with_capacity(RECENT_ATTEMPTS),
            }),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Tries each source in order and returns the first valid quote. A failing
    /// source is never retried within the same query.
    pub async fn query(&self, asset: &Asset) -> Result<Quote, QuoteError> {
        let mut attempts = Vec::with_capacity(self.sources.len());

        for (index, source) in self.sources.iter().enumerate() {
            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, source.query_price(asset)).await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(self.timeout.as_millis() as u64)),
            };
            let latency = started.elapsed();

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(e) => AttemptOutcome::from(e),
            };
            let attempt = Attempt {
                provider: source.name().to_string(),
                outcome,
                latency,
                at: Utc::now(),
            };
            self.record(index, attempt.clone()).await;

            match result {
                Ok(quote) => {
                    debug!(
                        provider = source.name(),
                        symbol = %asset.symbol,
                        price = %quote.price,
                        ?latency,
                        "Quote source succeeded"
                    );
                    return Ok(quote);
                }
                Err(e) => {
                    warn!(
                        provider = source.name(),
                        symbol = %asset.symbol,
                        error = %e,
                        "Quote source failed, trying next"
                    );
                    attempts.push(attempt);
                }
            }
        }

        info!(symbol = %asset.symbol, "All quote sources exhausted");
        Err(QuoteError::AllSourcesExhausted {
            asset: asset.symbol.clone(),
            attempts,
        })
    }

    async fn record(&self, index: usize, attempt: Attempt) {
        let mut health = self.health.lock().await;
        if let Some(entry) = health.providers.get_mut(index) {
            if attempt.outcome.is_success() {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            entry.last_outcome = Some(attempt.outcome.clone());
            entry.last_latency = Some(attempt.latency);
            entry.last_attempt_at = Some(attempt.at);
        }
        if let Some(window) = health.windows.get_mut(index) {
            if window.len() == RECENT_ATTEMPTS {
                window.pop_front();
            }
            window.push_back((attempt.latency, attempt.outcome.is_success()));
        }
        if health.recent.len() == RECENT_ATTEMPTS {
            health.recent.pop_front();
        }
        health.recent.push_back(attempt);
    }

    pub async fn health(&self) -> SourceHealth {
        let health = self.health.lock().await;
        let providers = health
            .providers
            .iter()
            .zip(&health.windows)
            .map(|(provider, window)| {
                let mut provider = provider.clone();
                apply_window_stats(&mut provider, window);
                provider
            })
            .collect();
        SourceHealth {
            providers,
            recent_attempts: health.recent.iter().cloned().collect(),
        }
    }
}

/// Mean, median, 95th percentile (nearest rank, or the maximum below 20
/// samples) and error rate over a provider's window.
fn apply_window_stats(provider: &mut ProviderHealth, window: &VecDeque<(Duration, bool)>) {
    provider.recent_calls = window.len();
    if window.is_empty() {
        return;
    }

    let mut latencies: Vec<Duration> = window.iter().map(|(latency, _)| *latency).collect();
    latencies.sort();
    let n = latencies.len();

    provider.avg_latency = Some(latencies.iter().sum::<Duration>() / n as u32);
    provider.p50_latency = Some(if n % 2 == 1 {
        latencies[n / 2]
    } else {
        (latencies[n / 2 - 1] + latencies[n / 2]) / 2
    });
    provider.p95_latency = if n >= 20 {
        latencies.get((n * 95).div_ceil(100) - 1).copied()
    } else {
        latencies.last().copied()
    };

    let failures = window.iter().filter(|(_, ok)| !ok).count();
    provider.error_rate =
        (Decimal::from(failures) * Decimal::from(100) / Decimal::from(n)).round_dp(2);
}
