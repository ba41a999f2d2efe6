pub mod chain;
pub mod coingecko;
pub mod jupiter;
pub mod kraken;
pub mod service;
pub mod synthetic;
pub mod util;

pub use chain::{SourceChain, SourceHealth};
pub use service::QuoteService;
pub use synthetic::{SyntheticConfig, SyntheticPricer};
