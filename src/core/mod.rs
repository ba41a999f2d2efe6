//! Core domain: quotes, baskets, guardrails, trade simulation and tax lots.

pub mod basket;
pub mod cache;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod log;
pub mod price;
pub mod simulator;
pub mod tax;

pub use basket::{Basket, BasketWeightMismatch};
pub use error::{QuoteError, SimulationError, SourceError, TaxError};
pub use price::{Asset, Quote, QuoteSource};
