//! Versioned Snapshot Document
//!
//! The whole ledger serializes to one JSON document. Accounts persist in
//! the historical two-map shape (`positions` + `avg_cost`,
//! `poly_positions` + `poly_cost_basis`); conversion to the typed
//! in-memory model pairs them back up and drops zero-quantity residue.
//! Every field is optional on read so any subset of keys loads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::ledger::account::{Account, PolyHolding, Position};
use crate::ledger::activity::ActivityEvent;
use crate::ledger::LedgerState;
use crate::sim::prediction::PredictionMarket;

pub const SNAPSHOT_VERSION: u32 = 5;

const DEFAULT_AVATAR: &str = "🦀";

pub fn is_uuid_like(value: &str) -> bool {
    Uuid::parse_str(value.trim()).is_ok()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountDoc {
    #[serde(default)]
    pub agent_uuid: String,
    #[serde(default, alias = "agent_id")]
    pub display_name: String,
    #[serde(default)]
    pub cash: f64,
    #[serde(default)]
    pub registered_at: String,
    #[serde(default, alias = "about")]
    pub description: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub positions: BTreeMap<String, f64>,
    #[serde(default)]
    pub avg_cost: BTreeMap<String, f64>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub poly_positions: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub poly_cost_basis: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub poly_realized_pnl: f64,
    #[serde(default)]
    pub blocked: bool,
}

impl AccountDoc {
    /// Rebuild the typed account. `fallback_identifier` is the map key
    /// the document was stored under; legacy snapshots keyed accounts by
    /// display name, newer ones by id.
    pub fn into_account(self, fallback_identifier: &str) -> Account {
        let fallback = fallback_identifier.trim();
        let account_id = if is_uuid_like(&self.agent_uuid) {
            self.agent_uuid.trim().to_string()
        } else if is_uuid_like(fallback) {
            fallback.to_string()
        } else {
            Uuid::new_v4().to_string()
        };

        let display_name = {
            let name = self.display_name.trim();
            if !name.is_empty() {
                name.to_string()
            } else if !fallback.is_empty() {
                fallback.to_string()
            } else {
                format!("agent-{}", &account_id[..8])
            }
        };

        let mut positions = BTreeMap::new();
        for (symbol, qty) in self.positions {
            if qty == 0.0 {
                continue;
            }
            let avg_cost = self.avg_cost.get(&symbol).copied().unwrap_or(0.0);
            positions.insert(symbol, Position { qty, avg_cost });
        }

        let mut poly_positions: BTreeMap<String, BTreeMap<String, PolyHolding>> = BTreeMap::new();
        for (market_id, outcomes) in self.poly_positions {
            let mut holdings = BTreeMap::new();
            for (outcome, shares) in outcomes {
                if shares == 0.0 {
                    continue;
                }
                let cost_basis = self
                    .poly_cost_basis
                    .get(&market_id)
                    .and_then(|m| m.get(&outcome))
                    .copied()
                    .unwrap_or(0.0);
                holdings.insert(outcome, PolyHolding { shares, cost_basis });
            }
            if !holdings.is_empty() {
                poly_positions.insert(market_id, holdings);
            }
        }

        let avatar = {
            let a = self.avatar.trim();
            if a.is_empty() {
                DEFAULT_AVATAR.to_string()
            } else {
                a.to_string()
            }
        };

        Account {
            account_id,
            display_name,
            cash: self.cash,
            registered_at: self.registered_at.trim().to_string(),
            description: self.description.trim().to_string(),
            avatar,
            is_test: self.is_test,
            positions,
            realized_pnl: self.realized_pnl,
            poly_positions,
            poly_realized_pnl: self.poly_realized_pnl,
            blocked: self.blocked,
        }
    }

    pub fn from_account(account: &Account) -> Self {
        Self {
            agent_uuid: account.account_id.clone(),
            display_name: account.display_name.clone(),
            cash: account.cash,
            registered_at: account.registered_at.clone(),
            description: account.description.clone(),
            avatar: account.avatar.clone(),
            is_test: account.is_test,
            positions: account
                .positions
                .iter()
                .map(|(symbol, pos)| (symbol.clone(), pos.qty))
                .collect(),
            avg_cost: account
                .positions
                .iter()
                .map(|(symbol, pos)| (symbol.clone(), pos.avg_cost))
                .collect(),
            realized_pnl: account.realized_pnl,
            poly_positions: account
                .poly_positions
                .iter()
                .map(|(market_id, outcomes)| {
                    (
                        market_id.clone(),
                        outcomes
                            .iter()
                            .map(|(outcome, h)| (outcome.clone(), h.shares))
                            .collect(),
                    )
                })
                .collect(),
            poly_cost_basis: account
                .poly_positions
                .iter()
                .map(|(market_id, outcomes)| {
                    (
                        market_id.clone(),
                        outcomes
                            .iter()
                            .map(|(outcome, h)| (outcome.clone(), h.cost_basis))
                            .collect(),
                    )
                })
                .collect(),
            poly_realized_pnl: account.poly_realized_pnl,
            blocked: account.blocked,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDoc {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountDoc>,
    #[serde(default, alias = "agent_name_to_id")]
    pub agent_name_to_uuid: BTreeMap<String, String>,
    #[serde(default)]
    pub agent_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub key_to_agent: BTreeMap<String, String>,
    #[serde(default)]
    pub registration_challenges: BTreeMap<String, Value>,
    #[serde(default)]
    pub pending_by_agent: BTreeMap<String, String>,
    #[serde(default)]
    pub registration_by_api_key: BTreeMap<String, String>,
    /// Follower -> followed entries; legacy rows may be plain id/name
    /// strings or config objects carrying an id field.
    #[serde(default)]
    pub agent_following: BTreeMap<String, Vec<Value>>,
    /// `None` when the key was absent, so the loader can keep seeded
    /// defaults instead of clearing them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_prices: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poly_markets: Option<BTreeMap<String, PredictionMarket>>,
    #[serde(default)]
    pub activity_log: Vec<ActivityEvent>,
    #[serde(default)]
    pub next_activity_id: i64,
    #[serde(default)]
    pub test_agents: Vec<String>,
}

impl SnapshotDoc {
    pub fn from_state(state: &LedgerState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            accounts: state
                .accounts
                .iter()
                .map(|(id, account)| (id.clone(), AccountDoc::from_account(account)))
                .collect(),
            agent_name_to_uuid: state.name_to_id.clone(),
            agent_keys: state.agent_keys.clone(),
            key_to_agent: state.key_to_agent.clone(),
            registration_challenges: state.registration_challenges.clone(),
            pending_by_agent: state.pending_by_agent.clone(),
            registration_by_api_key: state.registration_by_api_key.clone(),
            agent_following: state
                .agent_following
                .iter()
                .map(|(follower, targets)| {
                    (
                        follower.clone(),
                        targets.iter().map(|t| Value::String(t.clone())).collect(),
                    )
                })
                .collect(),
            stock_prices: Some(state.stock_prices.clone()),
            poly_markets: Some(state.poly_markets.clone()),
            activity_log: state.activity.events().to_vec(),
            next_activity_id: state.activity.next_id() as i64,
            test_agents: state.test_agents.iter().cloned().collect(),
        }
    }
}
