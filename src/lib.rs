//! CrabSim Backend Library
//!
//! Paper-trading ledger and accounting engine: agent accounts, order
//! execution with weighted-average cost accounting, prediction-market
//! betting and resolution, mark-to-market valuation, and the durable
//! single-blob state store backing all of it.

pub mod config;
pub mod feed;
pub mod ledger;
pub mod sim;
pub mod store;

pub use config::Config;
pub use ledger::{LedgerService, Registration};
pub use sim::error::SimError;
pub use sim::execution::{Fill, OrderSide};
pub use sim::prediction::PredictionMarket;
