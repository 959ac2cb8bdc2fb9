//! Agent Account Model
//!
//! Cash, open positions with weighted-average cost basis, and prediction
//! market holdings for one agent. All position mutation funnels through
//! [`Account::apply_trade`], which owns the no-zero-residue invariant:
//! a symbol key exists iff its quantity is nonzero, and every open
//! position carries a cost basis.

use std::collections::BTreeMap;

/// One open position in a symbol. `qty` is signed; `avg_cost` is the
/// weighted-average entry price per unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub qty: f64,
    pub avg_cost: f64,
}

/// Shares held in one outcome of a prediction market, with the cash spent
/// acquiring them (0 for holdings migrated from data that predates cost
/// tracking).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolyHolding {
    pub shares: f64,
    pub cost_basis: f64,
}

#[derive(Debug, Clone)]
pub struct Account {
    /// Immutable primary key (UUID string).
    pub account_id: String,
    /// Mutable, globally unique handle shown in UI/API responses.
    pub display_name: String,
    pub cash: f64,
    pub registered_at: String,
    pub description: String,
    pub avatar: String,
    pub is_test: bool,
    pub positions: BTreeMap<String, Position>,
    pub realized_pnl: f64,
    /// market_id -> outcome -> holding.
    pub poly_positions: BTreeMap<String, BTreeMap<String, PolyHolding>>,
    pub poly_realized_pnl: f64,
    /// Latched on a hard risk breach; there is no automatic unblock.
    pub blocked: bool,
}

impl Account {
    pub fn new(account_id: String, display_name: String, cash: f64, registered_at: String) -> Self {
        Self {
            account_id,
            display_name,
            cash,
            registered_at,
            description: String::new(),
            avatar: "🦀".to_string(),
            is_test: false,
            positions: BTreeMap::new(),
            realized_pnl: 0.0,
            poly_positions: BTreeMap::new(),
            poly_realized_pnl: 0.0,
            blocked: false,
        }
    }

    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.qty).unwrap_or(0.0)
    }

    /// Apply a signed fill to the position book.
    ///
    /// Same-sign fills accumulate into the weighted-average cost;
    /// opposite-sign fills realize P&L on the closing quantity, and a
    /// sign flip reopens the residual at the fill price. Cash is the
    /// caller's concern; this only maintains positions and realized P&L.
    pub fn apply_trade(&mut self, symbol: &str, signed_qty: f64, fill_price: f64, multiplier: f64) {
        let (old_qty, old_avg) = match self.positions.get(symbol) {
            Some(p) => (p.qty, p.avg_cost),
            None => (0.0, fill_price),
        };
        let new_qty = old_qty + signed_qty;

        if old_qty == 0.0 || old_qty * signed_qty > 0.0 {
            let total_abs = old_qty.abs() + signed_qty.abs();
            let new_avg = (old_qty.abs() * old_avg + signed_qty.abs() * fill_price) / total_abs;
            self.set_position(symbol, new_qty, new_avg);
        } else {
            let closing = old_qty.abs().min(signed_qty.abs());
            let mut pnl_per_unit = fill_price - old_avg;
            if old_qty < 0.0 {
                pnl_per_unit = -pnl_per_unit;
            }
            self.realized_pnl += pnl_per_unit * closing * multiplier;
            if old_qty * new_qty < 0.0 {
                // Flip: the residual is a fresh position at the fill price.
                self.set_position(symbol, new_qty, fill_price);
            } else {
                self.set_position(symbol, new_qty, old_avg);
            }
        }
    }

    /// Sole writer of the positions map: a zero quantity removes the key.
    fn set_position(&mut self, symbol: &str, qty: f64, avg_cost: f64) {
        if qty == 0.0 {
            self.positions.remove(symbol);
        } else {
            self.positions
                .insert(symbol.to_string(), Position { qty, avg_cost });
        }
    }

    /// Adverse open-position marks against the given price table: only
    /// symbols currently underwater contribute, as a negative number.
    /// Symbols with no known price are skipped.
    pub fn adverse_marks(&self, prices: &BTreeMap<String, f64>) -> f64 {
        self.positions
            .iter()
            .filter_map(|(symbol, pos)| {
                let px = prices.get(symbol)?;
                Some(((px - pos.avg_cost) * pos.qty).min(0.0))
            })
            .sum()
    }

    pub fn poly_shares(&self, market_id: &str, outcome: &str) -> f64 {
        self.poly_positions
            .get(market_id)
            .and_then(|m| m.get(outcome))
            .map(|h| h.shares)
            .unwrap_or(0.0)
    }

    pub fn add_poly_stake(&mut self, market_id: &str, outcome: &str, shares: f64, cost: f64) {
        let holding = self
            .poly_positions
            .entry(market_id.to_string())
            .or_default()
            .entry(outcome.to_string())
            .or_default();
        holding.shares += shares;
        holding.cost_basis += cost;
    }

    /// Drop the whole book for a market (post-resolution cleanup).
    pub fn clear_poly_market(&mut self, market_id: &str) -> Option<BTreeMap<String, PolyHolding>> {
        self.poly_positions.remove(market_id)
    }

    pub fn has_open_position(&self) -> bool {
        !self.positions.is_empty()
            || self
                .poly_positions
                .values()
                .any(|m| m.values().any(|h| h.shares != 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new(
            "u-1".to_string(),
            "crab".to_string(),
            2000.0,
            "2026-01-01T00:00:00Z".to_string(),
        )
    }

    #[test]
    fn test_weighted_average_accumulation() {
        let mut a = account();
        a.apply_trade("AAPL", 10.0, 100.0, 1.0);
        a.apply_trade("AAPL", 5.0, 130.0, 1.0);
        let pos = a.positions.get("AAPL").unwrap();
        assert_eq!(pos.qty, 15.0);
        // (10*100 + 5*130) / 15
        assert!((pos.avg_cost - 110.0).abs() < 1e-9);
        assert_eq!(a.realized_pnl, 0.0);
    }

    #[test]
    fn test_partial_close_realizes_and_keeps_avg() {
        let mut a = account();
        a.apply_trade("AAPL", 10.0, 100.0, 1.0);
        a.apply_trade("AAPL", -4.0, 110.0, 1.0);
        let pos = a.positions.get("AAPL").unwrap();
        assert_eq!(pos.qty, 6.0);
        assert_eq!(pos.avg_cost, 100.0);
        assert!((a.realized_pnl - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_sign_flip_opens_residual_at_fill_price() {
        let mut a = account();
        a.apply_trade("TSLA", 5.0, 100.0, 1.0);
        a.apply_trade("TSLA", -8.0, 120.0, 1.0);
        let pos = a.positions.get("TSLA").unwrap();
        assert_eq!(pos.qty, -3.0);
        assert_eq!(pos.avg_cost, 120.0);
        assert!((a.realized_pnl - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_cover_flips_pnl_sign() {
        let mut a = account();
        a.apply_trade("NVDA", -10.0, 100.0, 1.0);
        a.apply_trade("NVDA", 10.0, 90.0, 1.0);
        assert!(a.positions.is_empty());
        assert!((a.realized_pnl - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_position_leaves_no_residue() {
        let mut a = account();
        a.apply_trade("MSFT", 3.0, 420.0, 1.0);
        a.apply_trade("MSFT", -3.0, 420.0, 1.0);
        assert!(!a.positions.contains_key("MSFT"));
        assert_eq!(a.realized_pnl, 0.0);
    }

    #[test]
    fn test_option_multiplier_scales_realized_pnl() {
        let mut a = account();
        a.apply_trade("AAPL261218C00210000", 2.0, 3.5, 100.0);
        a.apply_trade("AAPL261218C00210000", -2.0, 4.0, 100.0);
        assert!((a.realized_pnl - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_adverse_marks_count_only_losses() {
        let mut a = account();
        a.apply_trade("AAPL", 10.0, 100.0, 1.0);
        a.apply_trade("BTCUSD", 1.0, 45000.0, 1.0);
        let prices: BTreeMap<String, f64> = [
            ("AAPL".to_string(), 90.0),
            ("BTCUSD".to_string(), 50000.0),
        ]
        .into_iter()
        .collect();
        // AAPL is down 100, BTC gain does not offset.
        assert!((a.adverse_marks(&prices) - (-100.0)).abs() < 1e-9);
    }

    #[test]
    fn test_poly_stake_accumulates() {
        let mut a = account();
        a.add_poly_stake("m1", "YES", 25.0, 10.0);
        a.add_poly_stake("m1", "YES", 25.0, 10.0);
        assert_eq!(a.poly_shares("m1", "YES"), 50.0);
        let h = a.poly_positions["m1"]["YES"];
        assert_eq!(h.cost_basis, 20.0);
        assert!(a.clear_poly_market("m1").is_some());
        assert!(!a.has_open_position());
    }
}
