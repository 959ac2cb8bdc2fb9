//! Prediction Market Engine
//!
//! Binary/multi-outcome markets quoted in fractional odds. A bet converts
//! cash into outcome shares at the listed odds; resolution pays one unit
//! of cash per winning share, exactly once, and clears every account's
//! book for the market.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

use crate::ledger::{LedgerService, LedgerState};
use crate::sim::error::SimError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionMarket {
    #[serde(default)]
    pub market_id: String,
    #[serde(default)]
    pub question: String,
    /// Outcome name -> odds, read as price-per-share in (0, 1].
    #[serde(default)]
    pub outcomes: BTreeMap<String, f64>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub winning_outcome: String,
}

impl PredictionMarket {
    pub fn sample(market_id: &str, question: &str, outcomes: &[(&str, f64)]) -> Self {
        Self {
            market_id: market_id.to_string(),
            question: question.to_string(),
            outcomes: outcomes
                .iter()
                .map(|(name, odds)| (name.to_string(), *odds))
                .collect(),
            resolved: false,
            winning_outcome: String::new(),
        }
    }
}

/// Accepted bet, echoed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct BetReceipt {
    pub account_id: String,
    pub display_name: String,
    pub market_id: String,
    pub outcome: String,
    pub amount: f64,
    pub shares: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub account_id: String,
    pub display_name: String,
    pub payout: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionReport {
    pub market_id: String,
    pub winning_outcome: String,
    pub payouts: Vec<Payout>,
}

impl LedgerState {
    /// Merge feed-fetched markets into the table. Resolved markets are
    /// immutable and never touched. Returns whether anything changed.
    pub fn merge_markets(&mut self, incoming: &[PredictionMarket]) -> bool {
        let mut changed = false;
        for market in incoming {
            let id = market.market_id.trim();
            if id.is_empty() {
                continue;
            }
            if let Some(existing) = self.poly_markets.get(id) {
                if existing.resolved || existing == market {
                    continue;
                }
            }
            self.poly_markets.insert(id.to_string(), market.clone());
            changed = true;
        }
        changed
    }
}

impl LedgerService {
    pub fn list_markets(&self) -> Vec<PredictionMarket> {
        self.with_state(|s| s.poly_markets.values().cloned().collect())
    }

    /// Merge feed data under the lock, persisting only when it changed.
    pub fn sync_markets(&self, incoming: &[PredictionMarket]) -> bool {
        let mut inner = self.lock();
        let changed = inner.state.merge_markets(incoming);
        if changed {
            inner.persist();
        }
        changed
    }

    /// Convert `amount` of cash into shares of `outcome` at the listed
    /// odds.
    pub fn place_bet(
        &self,
        account_ident: &str,
        market_id: &str,
        outcome: &str,
        amount: f64,
    ) -> Result<BetReceipt, SimError> {
        if !(amount > 0.0) {
            return Err(SimError::InvalidOrder {
                reason: "amount_must_be_positive",
            });
        }
        let market_id = market_id.trim().to_string();
        let outcome = outcome.trim().to_uppercase();

        let mut inner = self.lock();
        let state = &mut inner.state;
        let account_id = state.resolve(account_ident).ok_or(SimError::AgentNotFound)?;

        let market = state
            .poly_markets
            .get(&market_id)
            .ok_or(SimError::MarketNotFound)?;
        if market.resolved {
            return Err(SimError::MarketAlreadyResolved);
        }
        let odds = *market.outcomes.get(&outcome).ok_or(SimError::InvalidOutcome)?;
        if !(odds > 0.0) {
            return Err(SimError::InvalidOdds);
        }

        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(SimError::AgentNotFound)?;
        if account.cash < amount {
            return Err(SimError::InsufficientCash);
        }

        let shares = amount / odds;
        account.cash -= amount;
        account.add_poly_stake(&market_id, &outcome, shares, amount);
        let display_name = account.display_name.clone();

        state.record_event(
            "poly_bet",
            &account_id,
            json!({
                "market_id": market_id,
                "outcome": outcome,
                "amount": amount,
                "shares": shares,
            }),
        );
        inner.persist();

        info!(account_id = %account_id, market_id = %market_id, outcome = %outcome, amount, shares, "bet accepted");
        Ok(BetReceipt {
            account_id,
            display_name,
            market_id,
            outcome,
            amount,
            shares,
        })
    }

    /// Settle a market exactly once: pay one unit per winning share and
    /// drop every account's book for the market, winners and losers
    /// alike. A second resolution attempt always fails, whatever outcome
    /// it names.
    pub fn resolve_market(
        &self,
        market_id: &str,
        winning_outcome: &str,
    ) -> Result<ResolutionReport, SimError> {
        let market_id = market_id.trim().to_string();
        let winning = winning_outcome.trim().to_uppercase();

        let mut inner = self.lock();
        let state = &mut inner.state;

        let market = state
            .poly_markets
            .get_mut(&market_id)
            .ok_or(SimError::MarketNotFound)?;
        if !market.outcomes.contains_key(&winning) {
            return Err(SimError::InvalidWinningOutcome);
        }
        if market.resolved {
            return Err(SimError::MarketAlreadyResolved);
        }
        market.resolved = true;
        market.winning_outcome = winning.clone();

        let mut payouts = Vec::new();
        for (account_id, account) in state.accounts.iter_mut() {
            let shares = account.poly_shares(&market_id, &winning);
            if shares > 0.0 {
                account.cash += shares;
                account.poly_realized_pnl += shares;
                payouts.push(Payout {
                    account_id: account_id.clone(),
                    display_name: account.display_name.clone(),
                    payout: shares,
                });
            }
            account.clear_poly_market(&market_id);
        }

        state.record_event(
            "poly_resolve",
            "",
            json!({
                "market_id": market_id,
                "winning_outcome": winning,
                "payout_count": payouts.len(),
            }),
        );
        inner.persist();

        info!(market_id = %market_id, winning_outcome = %winning, payouts = payouts.len(), "market resolved");
        Ok(ResolutionReport {
            market_id,
            winning_outcome: winning,
            payouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn service_with_market() -> (LedgerService, String) {
        let svc = LedgerService::open_ephemeral(Config::for_tests()).unwrap();
        let market = PredictionMarket::sample(
            "poly-test-1",
            "Will it rain tomorrow?",
            &[("YES", 0.4), ("NO", 0.6)],
        );
        svc.sync_markets(std::slice::from_ref(&market));
        (svc, market.market_id)
    }

    #[test]
    fn test_bet_converts_cash_to_shares_at_odds() {
        let (svc, market_id) = service_with_market();
        let reg = svc.create_account("bettor", "", false).unwrap();
        let receipt = svc.place_bet(&reg.account_id, &market_id, "yes", 4.0).unwrap();
        assert!((receipt.shares - 10.0).abs() < 1e-9);

        let account = svc.account_snapshot(&reg.account_id).unwrap();
        assert!((account.cash - (reg.starting_cash - 4.0)).abs() < 1e-9);
        assert!((account.poly_shares(&market_id, "YES") - 10.0).abs() < 1e-9);
        assert_eq!(
            account.poly_positions[&market_id]["YES"].cost_basis,
            4.0
        );
    }

    #[test]
    fn test_bet_rejections() {
        let (svc, market_id) = service_with_market();
        let reg = svc.create_account("bettor", "", false).unwrap();

        assert_eq!(
            svc.place_bet(&reg.account_id, "nope", "YES", 1.0).unwrap_err(),
            SimError::MarketNotFound
        );
        assert_eq!(
            svc.place_bet(&reg.account_id, &market_id, "MAYBE", 1.0).unwrap_err(),
            SimError::InvalidOutcome
        );
        assert_eq!(
            svc.place_bet(&reg.account_id, &market_id, "YES", 1e9).unwrap_err(),
            SimError::InsufficientCash
        );
        assert_eq!(
            svc.place_bet("ghost", &market_id, "YES", 1.0).unwrap_err(),
            SimError::AgentNotFound
        );

        let dead = PredictionMarket::sample("poly-dead", "Q", &[("YES", 0.0), ("NO", 1.0)]);
        svc.sync_markets(std::slice::from_ref(&dead));
        assert_eq!(
            svc.place_bet(&reg.account_id, "poly-dead", "YES", 1.0).unwrap_err(),
            SimError::InvalidOdds
        );
    }

    #[test]
    fn test_resolution_pays_winners_and_clears_all_books() {
        let (svc, market_id) = service_with_market();
        let winner = svc.create_account("winner", "", false).unwrap();
        let loser = svc.create_account("loser", "", false).unwrap();
        svc.place_bet(&winner.account_id, &market_id, "YES", 4.0).unwrap();
        svc.place_bet(&loser.account_id, &market_id, "NO", 6.0).unwrap();

        let report = svc.resolve_market(&market_id, "YES").unwrap();
        assert_eq!(report.payouts.len(), 1);
        assert_eq!(report.payouts[0].account_id, winner.account_id);
        assert!((report.payouts[0].payout - 10.0).abs() < 1e-9);

        let w = svc.account_snapshot(&winner.account_id).unwrap();
        // 2000 - 4 staked + 10 payout.
        assert!((w.cash - (winner.starting_cash - 4.0 + 10.0)).abs() < 1e-9);
        assert!((w.poly_realized_pnl - 10.0).abs() < 1e-9);
        assert!(w.poly_positions.get(&market_id).is_none());

        let l = svc.account_snapshot(&loser.account_id).unwrap();
        assert!(l.poly_positions.get(&market_id).is_none());
        assert_eq!(l.poly_realized_pnl, 0.0);
    }

    #[test]
    fn test_resolution_is_exactly_once() {
        let (svc, market_id) = service_with_market();
        let reg = svc.create_account("bettor", "", false).unwrap();
        svc.place_bet(&reg.account_id, &market_id, "YES", 4.0).unwrap();

        svc.resolve_market(&market_id, "YES").unwrap();
        let cash_after = svc.account_snapshot(&reg.account_id).unwrap().cash;

        // Re-resolving fails even with a different outcome argument.
        assert_eq!(
            svc.resolve_market(&market_id, "NO").unwrap_err(),
            SimError::MarketAlreadyResolved
        );
        assert_eq!(
            svc.resolve_market(&market_id, "YES").unwrap_err(),
            SimError::MarketAlreadyResolved
        );
        assert_eq!(svc.account_snapshot(&reg.account_id).unwrap().cash, cash_after);
    }

    #[test]
    fn test_resolution_rejects_unknown_market_and_outcome() {
        let (svc, market_id) = service_with_market();
        assert_eq!(
            svc.resolve_market("nope", "YES").unwrap_err(),
            SimError::MarketNotFound
        );
        assert_eq!(
            svc.resolve_market(&market_id, "MAYBE").unwrap_err(),
            SimError::InvalidWinningOutcome
        );
    }

    #[test]
    fn test_bets_rejected_after_resolution() {
        let (svc, market_id) = service_with_market();
        let reg = svc.create_account("late_bettor", "", false).unwrap();
        svc.resolve_market(&market_id, "NO").unwrap();
        assert_eq!(
            svc.place_bet(&reg.account_id, &market_id, "YES", 1.0).unwrap_err(),
            SimError::MarketAlreadyResolved
        );
    }

    #[test]
    fn test_merge_never_touches_resolved_markets() {
        let (svc, market_id) = service_with_market();
        svc.resolve_market(&market_id, "YES").unwrap();

        let refreshed = PredictionMarket::sample(&market_id, "changed?", &[("YES", 0.9), ("NO", 0.1)]);
        assert!(!svc.sync_markets(std::slice::from_ref(&refreshed)));
        let markets = svc.list_markets();
        let m = markets.iter().find(|m| m.market_id == market_id).unwrap();
        assert!(m.resolved);
        assert_eq!(m.outcomes["YES"], 0.4);
    }
}
