pub mod memory;

pub use memory::{QuoteCache, StaleQuote};
