//! Locally generated quotes used when every upstream source has failed.

use crate::core::price::{Asset, Quote};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

pub const SYNTHETIC_SOURCE: &str = "synthetic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Largest relative move of a single step.
    #[serde(default = "default_step_pct")]
    pub step_pct: Decimal,
    /// Largest relative distance from the anchor.
    #[serde(default = "default_band_pct")]
    pub band_pct: Decimal,
    /// Anchor for assets with neither an observed nor a configured price.
    #[serde(default = "default_price")]
    pub default_price: Decimal,
}

fn default_seed() -> u64 {
    42
}

fn default_step_pct() -> Decimal {
    dec!(0.01)
}

fn default_band_pct() -> Decimal {
    dec!(0.05)
}

fn default_price() -> Decimal {
    Decimal::ONE
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            seed: default_seed(),
            step_pct: default_step_pct(),
            band_pct: default_band_pct(),
            default_price: default_price(),
        }
    }
}

struct Walk {
    rng: StdRng,
    anchor: Decimal,
    last: Decimal,
}

/// Bounded random walk per asset. Each asset draws from its own stream,
/// seeded from the configured seed and the symbol, so prices depend only on
/// that asset's call sequence and not on how concurrent lookups interleave.
pub struct SyntheticPricer {
    config: SyntheticConfig,
    walks: Mutex<HashMap<String, Walk>>,
}

/// FNV-1a, stable across builds and platforms.
fn symbol_hash(symbol: &str) -> u64 {
    symbol.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

impl SyntheticPricer {
    pub fn new(config: SyntheticConfig) -> Self {
        SyntheticPricer {
            config,
            walks: Mutex::new(HashMap::new()),
        }
    }

    /// Picks the anchor: last observed real price, then the asset's configured
    /// fallback, then the global default.
    pub fn anchor_for(&self, asset: &Asset, last_known: Option<Decimal>) -> Decimal {
        last_known
            .filter(|p| *p > Decimal::ZERO)
            .or(asset.fallback_price.filter(|p| *p > Decimal::ZERO))
            .unwrap_or(self.config.default_price)
    }

    pub async fn next_quote(&self, asset: &Asset, last_known: Option<Decimal>) -> Quote {
        let anchor = self.anchor_for(asset, last_known);
        let mut walks = self.walks.lock().await;
        let walk = walks.entry(asset.symbol.clone()).or_insert_with(|| Walk {
            rng: StdRng::seed_from_u64(self.config.seed ^ symbol_hash(&asset.symbol)),
            anchor,
            last: anchor,
        });

        let draw: f64 = walk.rng.gen_range(-1.0..=1.0);
        let step = Decimal::from_f64(draw).unwrap_or(Decimal::ZERO) * self.config.step_pct;

        // A new anchor restarts the walk from it.
        let previous = if walk.anchor == anchor {
            walk.last
        } else {
            anchor
        };

        let low = anchor * (Decimal::ONE - self.config.band_pct);
        let high = anchor * (Decimal::ONE + self.config.band_pct);
        let mut price = (previous * (Decimal::ONE + step))
            .clamp(low, high)
            .round_dp(asset.precision);
        if price <= Decimal::ZERO {
            price = anchor;
        }

        walk.anchor = anchor;
        walk.last = price;
        debug!(symbol = %asset.symbol, %anchor, %price, "Generated synthetic quote");

        Quote {
            synthetic: true,
            ..Quote::new(&asset.symbol, price, SYNTHETIC_SOURCE)
        }
    }
}

impl Default for SyntheticPricer {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bonk() -> Asset {
        Asset {
            fallback_price: Some(dec!(0.000025)),
            precision: 8,
            ..Asset::new("BONK")
        }
    }

    #[tokio::test]
    async fn test_walk_stays_inside_band() {
        let pricer = SyntheticPricer::default();
        let sol = Asset::new("SOL");
        for _ in 0..200 {
            let quote = pricer.next_quote(&sol, Some(dec!(180))).await;
            assert!(quote.synthetic);
            assert_eq!(quote.source, SYNTHETIC_SOURCE);
            assert!(quote.price >= dec!(171) && quote.price <= dec!(189));
        }
    }

    #[tokio::test]
    async fn test_same_seed_is_reproducible() {
        let a = SyntheticPricer::default();
        let b = SyntheticPricer::default();
        let sol = Asset::new("SOL");
        for _ in 0..10 {
            let qa = a.next_quote(&sol, Some(dec!(180))).await;
            let qb = b.next_quote(&sol, Some(dec!(180))).await;
            assert_eq!(qa.price, qb.price);
        }
    }

    #[tokio::test]
    async fn test_interleaving_does_not_change_prices() {
        let a = SyntheticPricer::default();
        let b = SyntheticPricer::default();
        let sol = Asset::new("SOL");

        let sol_first = a.next_quote(&sol, Some(dec!(180))).await;
        let bonk_second = a.next_quote(&bonk(), None).await;
        let bonk_first = b.next_quote(&bonk(), None).await;
        let sol_second = b.next_quote(&sol, Some(dec!(180))).await;

        assert_eq!(sol_first.price, sol_second.price);
        assert_eq!(bonk_first.price, bonk_second.price);
    }

    #[test]
    fn test_symbol_hash_is_stable() {
        assert_eq!(symbol_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(symbol_hash("a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(symbol_hash("SOL"), symbol_hash("mSOL"));
    }

    #[tokio::test]
    async fn test_anchor_precedence() {
        let pricer = SyntheticPricer::default();
        assert_eq!(pricer.anchor_for(&bonk(), Some(dec!(0.00003))), dec!(0.00003));
        assert_eq!(pricer.anchor_for(&bonk(), None), dec!(0.000025));
        assert_eq!(pricer.anchor_for(&Asset::new("XYZ"), None), Decimal::ONE);

        let quote = pricer.next_quote(&bonk(), None).await;
        assert!(quote.price > Decimal::ZERO);
        assert!(quote.price <= dec!(0.00002625));
    }
}
