//! HTTP Market Data Feed
//!
//! Polled REST implementation of [`MarketDataFeed`]: Alpaca data
//! endpoints for stocks, crypto, and options, Jupiter for pre-IPO
//! tokens, and the Polymarket Gamma listing for prediction markets.
//! Upstream payloads are stringly typed in places (arrays shipped as
//! JSON-encoded strings, numbers as strings), so parsing is tolerant and
//! anything unusable is skipped rather than failing the whole fetch.

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::feed::{symbols, FeedError, MarketDataFeed, Quote};
use crate::sim::prediction::PredictionMarket;

const USER_AGENT: &str = "CrabTrading/1.0 (+https://crabtrading.ai)";

lazy_static! {
    /// Solana mints for pre-IPO tokens. Override per symbol with
    /// CRAB_SOL_MINT_<SYMBOL>.
    static ref PREIPO_TOKEN_MINTS: HashMap<&'static str, &'static str> =
        [("SPACEX", "PreANxuXjsy2pvisWWMNB6YaJNzr7681wJJr2rHsfTh")]
            .into_iter()
            .collect();
}

pub struct HttpMarketDataFeed {
    client: reqwest::Client,
    config: FeedConfig,
}

impl HttpMarketDataFeed {
    pub fn new(config: FeedConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }

    fn alpaca_credentials(&self) -> Result<(&str, &str), FeedError> {
        match (&self.config.alpaca_key_id, &self.config.alpaca_secret_key) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Ok((key, secret))
            }
            _ => Err(FeedError::MissingCredentials),
        }
    }

    async fn get_json(&self, url: &str, authed: bool) -> Result<Value, FeedError> {
        let mut request = self.client.get(url);
        if authed {
            let (key, secret) = self.alpaca_credentials()?;
            request = request
                .header("APCA-API-KEY-ID", key)
                .header("APCA-API-SECRET-KEY", secret);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FeedError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| FeedError::InvalidResponse(e.to_string()))
    }

    /// Latest trade, then latest quote ask/bid, via the IEX feed.
    async fn fetch_stock_price(&self, symbol: &str) -> Result<f64, FeedError> {
        let base = &self.config.alpaca_data_base;
        let trade_url = format!("{}/v2/stocks/{}/trades/latest?feed=iex", base, symbol);
        let mut last_error = FeedError::MissingPrice;
        match self.get_json(&trade_url, true).await {
            Ok(payload) => {
                if let Some(px) = positive_f64(nested(&payload, &["trade", "p"])) {
                    return Ok(px);
                }
            }
            Err(e) => last_error = e,
        }

        let quote_url = format!("{}/v2/stocks/{}/quotes/latest?feed=iex", base, symbol);
        match self.get_json(&quote_url, true).await {
            Ok(payload) => {
                if let Some(px) = positive_f64(nested(&payload, &["quote", "ap"]))
                    .or_else(|| positive_f64(nested(&payload, &["quote", "bp"])))
                {
                    return Ok(px);
                }
            }
            Err(e) => last_error = e,
        }
        Err(last_error)
    }

    async fn fetch_crypto_price(&self, normalized: &str) -> Result<f64, FeedError> {
        let pair = slash_pair(normalized);
        let encoded = pair.replace('/', "%2F");
        let base = &self.config.alpaca_data_base;
        let trade_url = format!(
            "{}/v1beta3/crypto/us/latest/trades?symbols={}",
            base, encoded
        );
        let mut last_error = FeedError::MissingPrice;
        match self.get_json(&trade_url, true).await {
            Ok(payload) => {
                if let Some(px) = positive_f64(nested(&payload, &["trades", pair.as_str(), "p"])) {
                    return Ok(px);
                }
            }
            Err(e) => last_error = e,
        }

        let quote_url = format!(
            "{}/v1beta3/crypto/us/latest/quotes?symbols={}",
            base, encoded
        );
        match self.get_json(&quote_url, true).await {
            Ok(payload) => {
                let ap = positive_f64(nested(&payload, &["quotes", pair.as_str(), "ap"]));
                let bp = positive_f64(nested(&payload, &["quotes", pair.as_str(), "bp"]));
                match (ap, bp) {
                    (Some(ap), Some(bp)) => return Ok((ap + bp) / 2.0),
                    (Some(px), None) | (None, Some(px)) => return Ok(px),
                    (None, None) => {}
                }
            }
            Err(e) => last_error = e,
        }
        Err(last_error)
    }

    async fn fetch_option_price(&self, symbol: &str) -> Result<f64, FeedError> {
        let base = &self.config.alpaca_data_base;
        let trade_url = format!("{}/v1beta1/options/trades/latest?symbols={}", base, symbol);
        let mut last_error = FeedError::MissingPrice;
        match self.get_json(&trade_url, true).await {
            Ok(payload) => {
                if let Some(px) = positive_f64(nested(&payload, &["trades", symbol, "p"])) {
                    return Ok(px);
                }
            }
            Err(e) => last_error = e,
        }

        let quote_url = format!("{}/v1beta1/options/quotes/latest?symbols={}", base, symbol);
        match self.get_json(&quote_url, true).await {
            Ok(payload) => {
                if let Some(px) = positive_f64(nested(&payload, &["quotes", symbol, "ap"]))
                    .or_else(|| positive_f64(nested(&payload, &["quotes", symbol, "bp"])))
                {
                    return Ok(px);
                }
            }
            Err(e) => last_error = e,
        }
        Err(last_error)
    }

    /// Pre-IPO tokens price off their Solana mint via Jupiter.
    async fn fetch_preipo_price(&self, normalized: &str) -> Result<f64, FeedError> {
        let token = normalized
            .strip_prefix(symbols::PREIPO_PREFIX)
            .unwrap_or(normalized);
        let mint = std::env::var(format!("CRAB_SOL_MINT_{}", token))
            .ok()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| PREIPO_TOKEN_MINTS.get(token).map(|m| m.to_string()))
            .ok_or(FeedError::MissingPrice)?;

        let url = format!("{}?ids={}", self.config.jupiter_price_base, mint);
        let payload = self.get_json(&url, false).await?;
        positive_f64(nested(&payload, &[mint.as_str(), "usdPrice"]))
            .or_else(|| positive_f64(nested(&payload, &[mint.as_str(), "price"])))
            .ok_or(FeedError::MissingPrice)
    }
}

#[async_trait]
impl MarketDataFeed for HttpMarketDataFeed {
    async fn fetch_price(&self, symbol: &str) -> Result<Quote, FeedError> {
        let normalized =
            symbols::normalize_trade_symbol(symbol).ok_or(FeedError::MissingPrice)?;

        let price = if symbols::is_preipo_symbol(&normalized) {
            self.fetch_preipo_price(&normalized).await?
        } else if symbols::is_option_symbol(&normalized) {
            self.fetch_option_price(&normalized).await?
        } else if symbols::is_crypto_symbol(&normalized) {
            self.fetch_crypto_price(&normalized).await?
        } else {
            self.fetch_stock_price(&normalized).await?
        };

        debug!(symbol = %normalized, price, "feed price");
        Ok(Quote {
            symbol: normalized,
            price,
        })
    }

    async fn fetch_markets(&self, limit: usize) -> Result<Vec<PredictionMarket>, FeedError> {
        let safe_limit = limit.clamp(1, 100);
        let url = format!(
            "{}/markets?active=true&closed=false&limit={}",
            self.config.gamma_base, safe_limit
        );
        let payload = self.get_json(&url, false).await?;
        let Value::Array(items) = payload else {
            return Err(FeedError::InvalidResponse("expected market array".to_string()));
        };

        let mut markets = Vec::new();
        for item in items {
            match parse_gamma_market(&item) {
                Some(market) => markets.push(market),
                None => {
                    warn!(item = %clip(&item.to_string(), 160), "skipping unusable gamma market");
                }
            }
        }
        Ok(markets)
    }
}

fn parse_gamma_market(item: &Value) -> Option<PredictionMarket> {
    let obj = item.as_object()?;
    let market_id = ["id", "conditionId", "slug"]
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();
    let question = ["question", "title", "slug"]
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_str))
        .unwrap_or(&market_id)
        .to_string();

    let names = coerce_string_list(obj.get("outcomes"));
    let prices = coerce_string_list(obj.get("outcomePrices"));
    let mut outcomes = std::collections::BTreeMap::new();
    for (idx, name) in names.iter().enumerate() {
        let key = name.trim().to_uppercase();
        if key.is_empty() {
            continue;
        }
        let price = prices
            .get(idx)
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0);
        if price > 0.0 {
            outcomes.insert(key, price);
        }
    }
    if outcomes.is_empty() {
        return None;
    }

    Some(PredictionMarket {
        market_id,
        question,
        outcomes,
        resolved: false,
        winning_outcome: String::new(),
    })
}

/// Gamma sometimes returns JSON arrays as a string (e.g.
/// "[\"Yes\",\"No\"]"); accept both forms.
fn coerce_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => serde_json::from_str::<Vec<Value>>(s)
            .map(|items| {
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn nested<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |acc, key| acc.get(*key))
}

fn positive_f64(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|px| *px > 0.0)
}

/// BTCUSD -> BTC/USD, the spelling Alpaca's crypto endpoints quote under.
fn slash_pair(normalized: &str) -> String {
    for quote in ["USDT", "USDC", "USD", "BTC", "ETH"] {
        if let Some(base) = normalized.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{}/{}", base, quote);
            }
        }
    }
    normalized.to_string()
}

fn clip(text: &str, max_len: usize) -> String {
    text.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_gamma_market_with_string_encoded_arrays() {
        let item = json!({
            "id": "mk-1",
            "question": "Will it happen?",
            "outcomes": "[\"Yes\",\"No\"]",
            "outcomePrices": "[\"0.42\",\"0.58\"]"
        });
        let market = parse_gamma_market(&item).unwrap();
        assert_eq!(market.market_id, "mk-1");
        assert_eq!(market.outcomes["YES"], 0.42);
        assert_eq!(market.outcomes["NO"], 0.58);
        assert!(!market.resolved);
    }

    #[test]
    fn test_parse_gamma_market_skips_zero_priced_outcomes() {
        let item = json!({
            "conditionId": "mk-2",
            "outcomes": ["Yes", "No"],
            "outcomePrices": ["0.0", "1.0"]
        });
        let market = parse_gamma_market(&item).unwrap();
        assert!(!market.outcomes.contains_key("YES"));
        assert_eq!(market.outcomes["NO"], 1.0);
    }

    #[test]
    fn test_parse_gamma_market_rejects_empty() {
        assert!(parse_gamma_market(&json!({"id": "x"})).is_none());
        assert!(parse_gamma_market(&json!("not an object")).is_none());
    }

    #[test]
    fn test_slash_pair() {
        assert_eq!(slash_pair("BTCUSD"), "BTC/USD");
        assert_eq!(slash_pair("ETHBTC"), "ETH/BTC");
        assert_eq!(slash_pair("AAPL"), "AAPL");
    }
}
