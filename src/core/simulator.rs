//! Turns a target basket and live quotes into a cost-aware trade list.

use crate::core::basket::Basket;
use crate::core::error::SimulationError;
use crate::core::price::{Asset, Quote};
use crate::core::tax::Lot;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use tracing::{debug, instrument};

/// Caller-owned state for one simulation: the target basket, the lot
/// history and the total portfolio value to allocate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub basket: Basket,
    #[serde(default)]
    pub lots: Vec<Lot>,
    pub total_value: Decimal,
}

impl Session {
    /// Quantity held across open lots of an asset.
    pub fn held_quantity(&self, asset: &str) -> Decimal {
        self.lots
            .iter()
            .filter(|l| l.asset == asset && !l.is_retired())
            .map(|l| l.quantity)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Base slippage per asset as a fraction of notional.
    #[serde(default = "default_base_rates")]
    pub base_rates: HashMap<String, Decimal>,
    #[serde(default = "default_rate")]
    pub default_rate: Decimal,
    /// Trades must exceed this notional; anything at or below it is skipped.
    #[serde(default = "default_min_trade_notional")]
    pub min_trade_notional: Decimal,
}

fn default_base_rates() -> HashMap<String, Decimal> {
    HashMap::from([
        ("USDC".to_string(), dec!(0.0005)),
        ("USDT".to_string(), dec!(0.0005)),
        ("SOL".to_string(), dec!(0.001)),
        ("mSOL".to_string(), dec!(0.002)),
        ("stSOL".to_string(), dec!(0.002)),
        ("BONK".to_string(), dec!(0.005)),
    ])
}

fn default_rate() -> Decimal {
    dec!(0.003)
}

fn default_min_trade_notional() -> Decimal {
    Decimal::ONE
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel {
            base_rates: default_base_rates(),
            default_rate: default_rate(),
            min_trade_notional: default_min_trade_notional(),
        }
    }
}

impl CostModel {
    /// Overrides base rates with the ones configured on assets.
    pub fn with_assets(mut self, assets: &[Asset]) -> Self {
        for asset in assets {
            if let Some(rate) = asset.slippage_rate {
                self.base_rates.insert(asset.symbol.clone(), rate);
            }
        }
        self
    }

    pub fn base_rate(&self, asset: &str) -> Decimal {
        self.base_rates
            .get(asset)
            .copied()
            .unwrap_or(self.default_rate)
    }

    /// Size ladder: larger trades move the market more.
    pub fn size_multiplier(notional: Decimal) -> Decimal {
        if notional > dec!(10000) {
            dec!(2)
        } else if notional > dec!(1000) {
            dec!(1.5)
        } else {
            Decimal::ONE
        }
    }

    pub fn slippage(&self, asset: &str, notional: Decimal) -> Decimal {
        notional * self.base_rate(asset) * Self::size_multiplier(notional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub asset: String,
    pub side: Side,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub price: Decimal,
    pub slippage: Decimal,
    pub synthetic_price: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalancePlan {
    pub trades: Vec<Trade>,
    /// Assets whose difference to target did not exceed the minimum notional.
    pub skipped: Vec<String>,
    pub total_slippage: Decimal,
    /// Assets priced from synthetic quotes.
    pub synthetic_assets: Vec<String>,
}

impl RebalancePlan {
    pub fn sells(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(|t| t.side == Side::Sell)
    }

    pub fn turnover(&self) -> Decimal {
        self.trades.iter().map(|t| t.notional).sum()
    }
}

fn usable_quote<'a>(
    quotes: &'a HashMap<String, Quote>,
    asset: &str,
) -> Result<&'a Quote, SimulationError> {
    quotes
        .get(asset)
        .filter(|q| q.price > Decimal::ZERO)
        .ok_or_else(|| SimulationError::MissingQuote(asset.to_string()))
}

/// Computes the trades that bring each basket asset to its target value.
/// Holdings are never modified.
#[instrument(name = "SimulateRebalance", skip_all, fields(assets = session.basket.len()))]
pub fn simulate(
    session: &Session,
    quotes: &HashMap<String, Quote>,
    cost_model: &CostModel,
) -> Result<RebalancePlan, SimulationError> {
    if session.total_value <= Decimal::ZERO {
        return Err(SimulationError::InvalidTotal(session.total_value));
    }

    let mut trades = Vec::new();
    let mut skipped = Vec::new();
    let mut synthetic_assets = Vec::new();

    for (symbol, weight) in session.basket.iter() {
        let quote = usable_quote(quotes, symbol)?;
        if quote.synthetic {
            synthetic_assets.push(symbol.to_string());
        }

        let target = session.total_value * weight / dec!(100);
        let current = session.held_quantity(symbol) * quote.price;
        let difference = target - current;
        let notional = difference.abs();

        if notional <= cost_model.min_trade_notional {
            debug!(symbol, %notional, "Trade below minimum notional, skipping");
            skipped.push(symbol.to_string());
            continue;
        }

        trades.push(Trade {
            asset: symbol.to_string(),
            side: if difference > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            },
            quantity: notional / quote.price,
            notional,
            price: quote.price,
            slippage: cost_model.slippage(symbol, notional),
            synthetic_price: quote.synthetic,
        });
    }

    // Most liquid assets first, then smallest trades.
    trades.sort_by(|a, b| {
        cost_model
            .base_rate(&a.asset)
            .cmp(&cost_model.base_rate(&b.asset))
            .then(a.notional.cmp(&b.notional))
            .then(a.asset.cmp(&b.asset))
    });

    let total_slippage = trades.iter().map(|t| t.slippage).sum();
    debug!(trades = trades.len(), %total_slippage, "Simulated rebalance");
    Ok(RebalancePlan {
        trades,
        skipped,
        total_slippage,
        synthetic_assets,
    })
}

/// Current weights in percent of the held value, over every asset with open
/// lots.
pub fn current_weights(
    session: &Session,
    quotes: &HashMap<String, Quote>,
) -> Result<HashMap<String, Decimal>, SimulationError> {
    let mut values: HashMap<String, Decimal> = HashMap::new();
    for lot in session.lots.iter().filter(|l| !l.is_retired()) {
        let price = usable_quote(quotes, &lot.asset)?.price;
        *values.entry(lot.asset.clone()).or_default() += lot.quantity * price;
    }

    let total: Decimal = values.values().copied().sum();
    if total <= Decimal::ZERO {
        return Ok(HashMap::new());
    }
    Ok(values
        .into_iter()
        .map(|(asset, value)| (asset, value * dec!(100) / total))
        .collect())
}
