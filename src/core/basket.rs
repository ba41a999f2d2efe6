use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Allowed distance of the weight total from 100.
pub const WEIGHT_TOLERANCE: Decimal = dec!(0.1);

/// Target allocation: asset symbol to weight in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Basket {
    weights: BTreeMap<String, Decimal>,
}

/// Raised as a warning when the weights do not sum to 100 within tolerance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasketWeightMismatch {
    pub total: Decimal,
    pub tolerance: Decimal,
}

impl Display for BasketWeightMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "basket weights sum to {}% (expected 100 ± {})",
            self.total.normalize(),
            self.tolerance
        )
    }
}

impl Basket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, symbol: &str, weight: Decimal) -> Self {
        self.set(symbol, weight);
        self
    }

    pub fn set(&mut self, symbol: &str, weight: Decimal) {
        self.weights.insert(symbol.to_string(), weight);
    }

    pub fn weight(&self, symbol: &str) -> Option<Decimal> {
        self.weights.get(symbol).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn total(&self) -> Decimal {
        self.weights.values().copied().sum()
    }

    /// Flags a total outside 100 ± tolerance. Never changes the weights.
    pub fn validate(&self) -> Option<BasketWeightMismatch> {
        let total = self.total();
        if (total - dec!(100)).abs() > WEIGHT_TOLERANCE {
            Some(BasketWeightMismatch {
                total,
                tolerance: WEIGHT_TOLERANCE,
            })
        } else {
            None
        }
    }

    /// Rescales the weights proportionally so they sum to 100. An empty or
    /// zero-weight basket is returned unchanged.
    pub fn normalize(&self) -> Basket {
        let total = self.total();
        if total <= Decimal::ZERO {
            return self.clone();
        }
        let weights = self
            .weights
            .iter()
            .map(|(k, v)| (k.clone(), *v * dec!(100) / total))
            .collect();
        Basket { weights }
    }
}

impl FromIterator<(String, Decimal)> for Basket {
    fn from_iter<T: IntoIterator<Item = (String, Decimal)>>(iter: T) -> Self {
        Basket {
            weights: iter.into_iter().collect(),
        }
    }
}
