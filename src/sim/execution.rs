//! Order Execution Engine
//!
//! Applies market orders against a fetched fill price under the ledger
//! lock. Risk checks run before any mutation, so a rejected order leaves
//! cash and positions untouched; the one exception is the daily-loss
//! breach, which latches `blocked` on the account as it rejects. Orders
//! either fully apply (cash, position, cost basis, event, persistence) or
//! fully fail.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::feed::{symbols, MarketDataFeed};
use crate::ledger::LedgerService;
use crate::sim::error::SimError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A successfully applied order.
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub order_id: String,
    pub account_id: String,
    pub display_name: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub fill_price: f64,
    pub multiplier: f64,
    pub notional: f64,
    /// "realtime" when the price came from the feed, "cache_fallback"
    /// when the last cached price was used, "direct" for caller-priced
    /// fills.
    pub price_source: String,
}

impl LedgerService {
    /// Apply an order at a caller-supplied fill price.
    pub fn execute_order(
        &self,
        account_ident: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        fill_price: f64,
        multiplier: f64,
    ) -> Result<Fill, SimError> {
        if !(qty > 0.0) {
            return Err(SimError::InvalidOrder {
                reason: "qty_must_be_positive",
            });
        }
        if !(fill_price > 0.0) {
            return Err(SimError::InvalidOrder {
                reason: "fill_price_must_be_positive",
            });
        }
        if !(multiplier >= 1.0) {
            return Err(SimError::InvalidOrder {
                reason: "multiplier_must_be_at_least_one",
            });
        }
        let symbol = symbols::normalize_trade_symbol(symbol).ok_or(SimError::InvalidSymbol)?;

        let risk = self.config().risk.clone();
        let mut inner = self.lock();
        let state = &mut inner.state;
        let account_id = state.resolve(account_ident).ok_or(SimError::AgentNotFound)?;

        let account = state
            .accounts
            .get(&account_id)
            .ok_or(SimError::AgentNotFound)?;
        if account.blocked {
            return Err(SimError::AgentBlocked);
        }

        let current_qty = account.position_qty(&symbol);
        let signed_qty = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let target_qty = current_qty + signed_qty;
        if target_qty.abs() > risk.max_abs_position_per_symbol {
            return Err(SimError::RiskMaxPosition);
        }

        let notional = qty * fill_price * multiplier;
        match side {
            OrderSide::Buy => {
                if account.cash < notional {
                    return Err(SimError::InsufficientCash);
                }
            }
            OrderSide::Sell => {
                if current_qty < qty {
                    return Err(SimError::InsufficientPosition);
                }
            }
        }

        let drawdown = account.realized_pnl + account.adverse_marks(&state.stock_prices);
        if drawdown <= -risk.max_daily_loss {
            if let Some(account) = state.accounts.get_mut(&account_id) {
                account.blocked = true;
            }
            warn!(account_id = %account_id, drawdown, "daily loss limit breached, account blocked");
            inner.persist();
            return Err(SimError::RiskMaxDailyLoss);
        }

        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(SimError::AgentNotFound)?;
        match side {
            OrderSide::Buy => account.cash -= notional,
            OrderSide::Sell => account.cash += notional,
        }
        account.apply_trade(&symbol, signed_qty, fill_price, multiplier);
        let display_name = account.display_name.clone();

        state.stock_prices.insert(symbol.clone(), fill_price);
        state.record_event(
            "stock_order",
            &account_id,
            json!({
                "symbol": symbol,
                "side": side.to_string(),
                "qty": qty,
                "fill_price": fill_price,
                "multiplier": multiplier,
                "notional": notional,
            }),
        );
        inner.persist();

        info!(
            account_id = %account_id,
            symbol = %symbol,
            side = %side,
            qty,
            fill_price,
            notional,
            "order filled"
        );
        Ok(Fill {
            order_id: Uuid::new_v4().to_string(),
            account_id,
            display_name,
            symbol,
            side,
            qty,
            fill_price,
            multiplier,
            notional,
            price_source: "direct".to_string(),
        })
    }

    /// Price an order off the feed and apply it. The feed round-trip runs
    /// outside the ledger lock; on feed failure the last cached price is
    /// used, and with no cache the order fails closed.
    pub async fn execute_market_order(
        &self,
        feed: &dyn MarketDataFeed,
        account_ident: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
    ) -> Result<Fill, SimError> {
        let normalized = symbols::normalize_trade_symbol(symbol).ok_or(SimError::InvalidSymbol)?;

        let (symbol, price, source) = match feed.fetch_price(&normalized).await {
            Ok(quote) => (quote.symbol, quote.price, "realtime"),
            Err(feed_err) => match self.cached_price(&normalized) {
                Some(px) => {
                    warn!(symbol = %normalized, error = %feed_err, "feed failed, filling from cached price");
                    (normalized, px, "cache_fallback")
                }
                None => {
                    return Err(SimError::MarketDataUnavailable {
                        detail: feed_err.to_string(),
                    })
                }
            },
        };

        let multiplier = symbols::contract_multiplier(&symbol);
        let mut fill = self.execute_order(account_ident, &symbol, side, qty, price, multiplier)?;
        fill.price_source = source.to_string();
        Ok(fill)
    }

    /// Last known positive price for a symbol, checking crypto alias
    /// spellings the cache may have been written under.
    pub fn cached_price(&self, normalized: &str) -> Option<f64> {
        let aliases = symbols::crypto_symbol_aliases(normalized);
        self.with_state(|s| {
            aliases
                .iter()
                .filter_map(|alias| s.stock_prices.get(alias.as_str()).copied())
                .find(|px| *px > 0.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::feed::StaticFeed;
    use crate::ledger::LedgerService;

    fn service() -> (LedgerService, String) {
        let svc = LedgerService::open_ephemeral(Config::for_tests()).unwrap();
        let reg = svc.create_account("trader", "", false).unwrap();
        (svc, reg.account_id)
    }

    #[test]
    fn test_round_trip_conserves_cash() {
        let (svc, id) = service();
        let start = svc.account_snapshot(&id).unwrap().cash;
        svc.execute_order(&id, "AAPL", OrderSide::Buy, 10.0, 100.0, 1.0).unwrap();
        svc.execute_order(&id, "AAPL", OrderSide::Sell, 10.0, 100.0, 1.0).unwrap();
        let account = svc.account_snapshot(&id).unwrap();
        assert!((account.cash - start).abs() < 1e-9);
        assert_eq!(account.realized_pnl, 0.0);
        assert!(account.positions.is_empty());
    }

    #[test]
    fn test_partial_close_books_profit() {
        let (svc, id) = service();
        svc.execute_order(&id, "AAPL", OrderSide::Buy, 10.0, 100.0, 1.0).unwrap();
        svc.execute_order(&id, "AAPL", OrderSide::Sell, 4.0, 110.0, 1.0).unwrap();
        let account = svc.account_snapshot(&id).unwrap();
        let pos = account.positions.get("AAPL").unwrap();
        assert_eq!(pos.qty, 6.0);
        assert_eq!(pos.avg_cost, 100.0);
        assert!((account.realized_pnl - 40.0).abs() < 1e-9);
        // 2000 - 1000 + 440
        assert!((account.cash - 1440.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_cash_leaves_state_untouched() {
        let (svc, id) = service();
        let before = svc.account_snapshot(&id).unwrap();
        let err = svc
            .execute_order(&id, "NVDA", OrderSide::Buy, 50.0, 125.0, 1.0)
            .unwrap_err();
        assert_eq!(err, SimError::InsufficientCash);
        let after = svc.account_snapshot(&id).unwrap();
        assert_eq!(after.cash, before.cash);
        assert!(after.positions.is_empty());
    }

    #[test]
    fn test_selling_more_than_held_is_rejected() {
        let (svc, id) = service();
        svc.execute_order(&id, "AAPL", OrderSide::Buy, 5.0, 100.0, 1.0).unwrap();
        let err = svc
            .execute_order(&id, "AAPL", OrderSide::Sell, 8.0, 100.0, 1.0)
            .unwrap_err();
        assert_eq!(err, SimError::InsufficientPosition);
        assert_eq!(svc.account_snapshot(&id).unwrap().position_qty("AAPL"), 5.0);
    }

    #[test]
    fn test_position_cap_reject_is_side_effect_free() {
        let (svc, id) = service();
        let before = svc.account_snapshot(&id).unwrap();
        let err = svc
            .execute_order(&id, "PENNY", OrderSide::Buy, 150.0, 1.0, 1.0)
            .unwrap_err();
        assert_eq!(err, SimError::RiskMaxPosition);
        let after = svc.account_snapshot(&id).unwrap();
        assert_eq!(after.cash, before.cash);
        assert!(after.positions.is_empty());
        assert!(svc.with_state(|s| !s.stock_prices.contains_key("PENNY")));
    }

    #[test]
    fn test_daily_loss_breach_blocks_account() {
        let (svc, id) = service();
        // Max out cash, then mark the position far underwater.
        svc.execute_order(&id, "AAPL", OrderSide::Buy, 20.0, 100.0, 1.0).unwrap();
        {
            let mut inner = svc.lock();
            inner.state.stock_prices.insert("AAPL".to_string(), 40.0);
        }

        // (40 - 100) * 20 = -1200 <= -1000 (test risk limit).
        let err = svc
            .execute_order(&id, "AAPL", OrderSide::Sell, 1.0, 40.0, 1.0)
            .unwrap_err();
        assert_eq!(err, SimError::RiskMaxDailyLoss);
        let account = svc.account_snapshot(&id).unwrap();
        assert!(account.blocked);
        assert_eq!(account.position_qty("AAPL"), 20.0);

        // Blocked accounts reject everything afterwards.
        let err = svc
            .execute_order(&id, "MSFT", OrderSide::Buy, 1.0, 1.0, 1.0)
            .unwrap_err();
        assert_eq!(err, SimError::AgentBlocked);
    }

    #[test]
    fn test_fill_price_written_to_price_table() {
        let (svc, id) = service();
        svc.execute_order(&id, "TSLA", OrderSide::Buy, 1.0, 191.5, 1.0).unwrap();
        assert_eq!(svc.last_price("TSLA"), Some(191.5));
    }

    #[test]
    fn test_invalid_order_parameters() {
        let (svc, id) = service();
        assert!(matches!(
            svc.execute_order(&id, "AAPL", OrderSide::Buy, 0.0, 100.0, 1.0).unwrap_err(),
            SimError::InvalidOrder { .. }
        ));
        assert!(matches!(
            svc.execute_order(&id, "AAPL", OrderSide::Buy, 1.0, 0.0, 1.0).unwrap_err(),
            SimError::InvalidOrder { .. }
        ));
        assert_eq!(
            svc.execute_order(&id, "  ", OrderSide::Buy, 1.0, 100.0, 1.0).unwrap_err(),
            SimError::InvalidSymbol
        );
        assert_eq!(
            svc.execute_order("ghost", "AAPL", OrderSide::Buy, 1.0, 100.0, 1.0).unwrap_err(),
            SimError::AgentNotFound
        );
    }

    #[tokio::test]
    async fn test_market_order_uses_feed_price() {
        let (svc, id) = service();
        let feed = StaticFeed::new();
        feed.set_price("AAPL", 210.0);
        let fill = svc
            .execute_market_order(&feed, &id, "aapl", OrderSide::Buy, 2.0)
            .await
            .unwrap();
        assert_eq!(fill.fill_price, 210.0);
        assert_eq!(fill.price_source, "realtime");
        assert_eq!(svc.last_price("AAPL"), Some(210.0));
    }

    #[tokio::test]
    async fn test_market_order_falls_back_to_cached_price() {
        let (svc, id) = service();
        let feed = StaticFeed::new();
        feed.set_price("TSLA", 185.0);
        svc.execute_market_order(&feed, &id, "TSLA", OrderSide::Buy, 1.0)
            .await
            .unwrap();

        feed.remove_price("TSLA");
        let fill = svc
            .execute_market_order(&feed, &id, "TSLA", OrderSide::Buy, 1.0)
            .await
            .unwrap();
        assert_eq!(fill.fill_price, 185.0);
        assert_eq!(fill.price_source, "cache_fallback");
    }

    #[tokio::test]
    async fn test_market_order_fails_closed_without_cache() {
        let (svc, id) = service();
        let feed = StaticFeed::new();
        let err = svc
            .execute_market_order(&feed, &id, "ZZZZ", OrderSide::Buy, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::MarketDataUnavailable { .. }));
    }
}
