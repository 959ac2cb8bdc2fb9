//! Mark-to-Market Valuation & Leaderboard
//!
//! Values accounts at the last observed prices rather than cost. Poly
//! holdings are marked at current odds and only while the market is
//! unresolved; resolved markets have already paid out and their books are
//! gone. The refresh path trades freshness for availability: prices are
//! fetched outside the ledger lock and per-symbol failures keep the stale
//! price.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::feed::{symbols, MarketDataFeed};
use crate::ledger::account::Account;
use crate::ledger::{LedgerService, LedgerState};
use crate::sim::error::SimError;

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub symbol: String,
    pub qty: f64,
    pub last_price: f64,
    pub market_value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Valuation {
    pub cash: f64,
    pub stock_value: f64,
    pub crypto_value: f64,
    pub poly_value: f64,
    pub equity: f64,
    pub return_pct: f64,
    pub positions: Vec<PositionView>,
    pub has_open_position: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardRow {
    pub account_id: String,
    pub display_name: String,
    pub avatar: String,
    pub equity: f64,
    pub cash: f64,
    pub stock_value: f64,
    pub crypto_value: f64,
    pub poly_value: f64,
    pub return_pct: f64,
    pub has_open_position: bool,
    pub eligible: bool,
}

/// Value one account against the state's price and odds tables.
pub fn value_account(state: &LedgerState, account: &Account, starting_cash: f64) -> Valuation {
    let mut stock_value = 0.0;
    let mut crypto_value = 0.0;
    let mut positions = Vec::new();
    for (symbol, pos) in &account.positions {
        let last_price = state.stock_prices.get(symbol).copied().unwrap_or(0.0);
        let market_value = pos.qty * last_price * symbols::contract_multiplier(symbol);
        if symbols::is_crypto_symbol(symbol) {
            crypto_value += market_value;
        } else {
            stock_value += market_value;
        }
        positions.push(PositionView {
            symbol: symbol.clone(),
            qty: pos.qty,
            last_price,
            market_value,
        });
    }
    positions.sort_by(|a, b| {
        b.market_value
            .abs()
            .partial_cmp(&a.market_value.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut poly_value = 0.0;
    for (market_id, outcomes) in &account.poly_positions {
        let Some(market) = state.poly_markets.get(market_id) else {
            continue;
        };
        if market.resolved {
            continue;
        }
        for (outcome, holding) in outcomes {
            if let Some(odds) = market.outcomes.get(outcome) {
                if *odds > 0.0 {
                    poly_value += holding.shares * odds;
                }
            }
        }
    }

    let equity = account.cash + stock_value + crypto_value + poly_value;
    let return_pct = if starting_cash > 0.0 {
        (equity - starting_cash) / starting_cash * 100.0
    } else {
        0.0
    };

    Valuation {
        cash: account.cash,
        stock_value,
        crypto_value,
        poly_value,
        equity,
        return_pct,
        has_open_position: account.has_open_position(),
        positions,
    }
}

impl LedgerService {
    pub fn valuation(&self, identifier: &str) -> Result<Valuation, SimError> {
        let starting_cash = self.config().starting_cash;
        self.with_state(|state| {
            let account_id = state.resolve(identifier).ok_or(SimError::AgentNotFound)?;
            let account = state.accounts.get(&account_id).ok_or(SimError::AgentNotFound)?;
            Ok(value_account(state, account, starting_cash))
        })
    }

    /// All accounts valued under one lock acquisition, sorted by equity
    /// descending. The sort is stable and rows enter in registration
    /// order, so equal-equity accounts keep their relative order across
    /// repeated calls. Accounts with no open position and no stock trade
    /// history are filtered out unless `include_inactive` is set.
    pub fn leaderboard(&self, include_inactive: bool) -> Vec<LeaderboardRow> {
        let starting_cash = self.config().starting_cash;
        let hide_test = self.config().hide_test_data;
        let mut rows = self.with_state(|state| {
            // Agents keep leaderboard standing from past stock trades even
            // after fully exiting their positions.
            let mut traded_stock: HashSet<String> = HashSet::new();
            for event in state.activity.events() {
                if event.kind != "stock_order" {
                    continue;
                }
                let symbol = event
                    .details
                    .get("symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if symbol.is_empty() || symbols::is_crypto_symbol(symbol) {
                    continue;
                }
                let id = state
                    .resolve(&event.account_id)
                    .unwrap_or_else(|| event.account_id.clone());
                if !id.is_empty() {
                    traded_stock.insert(id);
                }
            }

            let mut rows: Vec<(String, LeaderboardRow)> = Vec::new();
            for (account_id, account) in &state.accounts {
                if hide_test && (account.is_test || state.test_agents.contains(account_id)) {
                    continue;
                }
                let valuation = value_account(state, account, starting_cash);
                let eligible =
                    valuation.has_open_position || traded_stock.contains(account_id);
                rows.push((
                    account.registered_at.clone(),
                    LeaderboardRow {
                        account_id: account_id.clone(),
                        display_name: account.display_name.clone(),
                        avatar: account.avatar.clone(),
                        equity: valuation.equity,
                        cash: valuation.cash,
                        stock_value: valuation.stock_value,
                        crypto_value: valuation.crypto_value,
                        poly_value: valuation.poly_value,
                        return_pct: valuation.return_pct,
                        has_open_position: valuation.has_open_position,
                        eligible,
                    },
                ));
            }
            // Registration order first, then a stable sort by equity keeps
            // tie order deterministic.
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            rows.into_iter().map(|(_, row)| row).collect::<Vec<_>>()
        });

        if !include_inactive {
            rows.retain(|row| row.eligible);
        }
        rows.sort_by(|a, b| {
            b.equity
                .partial_cmp(&a.equity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows
    }

    /// Re-fetch prices for every held symbol and odds for every held
    /// market, behind a minimum-interval gate. Individual symbol failures
    /// keep the stale price. Returns whether anything changed.
    pub async fn refresh_mark_to_market(&self, feed: &dyn MarketDataFeed, force: bool) -> bool {
        let interval = Duration::from_secs(self.config().mark_to_market_refresh_secs);
        {
            let mut last_attempt = self.mtm_last_attempt.lock();
            if !force {
                if let Some(at) = *last_attempt {
                    if at.elapsed() < interval {
                        return false;
                    }
                }
            }
            *last_attempt = Some(Instant::now());
        }

        let (tracked_symbols, tracked_markets) = self.with_state(|state| {
            let mut symbols_set: BTreeSet<String> = BTreeSet::new();
            let mut markets: BTreeSet<String> = BTreeSet::new();
            for account in state.accounts.values() {
                for (symbol, pos) in &account.positions {
                    if pos.qty != 0.0 {
                        symbols_set.insert(symbol.clone());
                    }
                }
                for (market_id, outcomes) in &account.poly_positions {
                    if outcomes.values().any(|h| h.shares != 0.0) {
                        markets.insert(market_id.clone());
                    }
                }
            }
            (symbols_set, markets)
        });

        // Feed round-trips happen with the ledger lock released.
        let mut price_updates: Vec<(String, f64)> = Vec::new();
        for symbol in tracked_symbols.into_iter().take(60) {
            match feed.fetch_price(&symbol).await {
                Ok(quote) => {
                    if quote.symbol != symbol {
                        price_updates.push((symbol.clone(), quote.price));
                    }
                    price_updates.push((quote.symbol, quote.price));
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "price refresh failed, keeping stale price");
                }
            }
        }

        let mut market_updates = Vec::new();
        if !tracked_markets.is_empty() {
            match feed.fetch_markets(100).await {
                Ok(markets) => {
                    market_updates = markets
                        .into_iter()
                        .filter(|m| tracked_markets.contains(&m.market_id))
                        .collect();
                }
                Err(e) => {
                    debug!(error = %e, "market list refresh failed");
                }
            }
        }

        if price_updates.is_empty() && market_updates.is_empty() {
            return false;
        }

        let mut inner = self.lock();
        let mut changed = false;
        for (symbol, px) in price_updates {
            let old = inner.state.stock_prices.get(&symbol).copied();
            if old != Some(px) {
                changed = true;
            }
            inner.state.stock_prices.insert(symbol, px);
        }
        if inner.state.merge_markets(&market_updates) {
            changed = true;
        }
        if changed {
            inner.persist();
        }
        changed
    }
}
