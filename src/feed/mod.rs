//! Market Data Ports
//!
//! The ledger consumes prices and prediction-market listings through the
//! [`MarketDataFeed`] trait and never talks to an upstream directly. Feed
//! calls are fallible and time-bounded, carry no ledger side effects, and
//! always run outside the ledger lock.

pub mod http;
pub mod symbols;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::sim::prediction::PredictionMarket;

/// A spot price for a (normalized) symbol.
#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// Transport-level failure (DNS, connect, timeout).
    Unreachable(String),
    /// Upstream answered with a non-success status.
    HttpStatus(u16),
    /// Body arrived but could not be interpreted.
    InvalidResponse(String),
    /// Response was well-formed but carried no usable price.
    MissingPrice,
    /// No upstream credentials configured.
    MissingCredentials,
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(detail) => write!(f, "market_data_unreachable: {}", detail),
            Self::HttpStatus(status) => write!(f, "market_data_http_error: {}", status),
            Self::InvalidResponse(detail) => write!(f, "market_data_invalid_response: {}", detail),
            Self::MissingPrice => write!(f, "market_data_missing_price"),
            Self::MissingCredentials => write!(f, "missing_market_data_credentials"),
        }
    }
}

impl std::error::Error for FeedError {}

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Fetch a spot price. Returns the normalized symbol the price was
    /// quoted under together with a strictly positive price.
    async fn fetch_price(&self, symbol: &str) -> Result<Quote, FeedError>;

    /// Fetch up to `limit` active prediction markets with current odds.
    async fn fetch_markets(&self, limit: usize) -> Result<Vec<PredictionMarket>, FeedError>;
}

/// Deterministic in-memory feed for tests and offline runs.
#[derive(Default)]
pub struct StaticFeed {
    prices: RwLock<HashMap<String, f64>>,
    markets: RwLock<Vec<PredictionMarket>>,
}

impl StaticFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices
            .write()
            .insert(symbol.trim().to_uppercase(), price);
    }

    pub fn remove_price(&self, symbol: &str) {
        self.prices.write().remove(&symbol.trim().to_uppercase());
    }

    pub fn set_markets(&self, markets: Vec<PredictionMarket>) {
        *self.markets.write() = markets;
    }
}

#[async_trait]
impl MarketDataFeed for StaticFeed {
    async fn fetch_price(&self, symbol: &str) -> Result<Quote, FeedError> {
        let normalized =
            symbols::normalize_trade_symbol(symbol).ok_or(FeedError::MissingPrice)?;
        let price = self
            .prices
            .read()
            .get(&normalized)
            .copied()
            .ok_or(FeedError::MissingPrice)?;
        if !(price > 0.0) {
            return Err(FeedError::MissingPrice);
        }
        Ok(Quote {
            symbol: normalized,
            price,
        })
    }

    async fn fetch_markets(&self, limit: usize) -> Result<Vec<PredictionMarket>, FeedError> {
        Ok(self.markets.read().iter().take(limit).cloned().collect())
    }
}
