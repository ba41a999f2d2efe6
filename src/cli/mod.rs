pub mod lots;
pub mod quotes;
pub mod rebalance;
pub mod setup;
pub mod tax;
pub mod ui;
