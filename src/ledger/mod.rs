//! Ledger Store
//!
//! Authoritative in-memory map of agent accounts plus every index derived
//! from them (display name -> id, API key <-> id), the prediction-market
//! table, the last-known price table, and the capped activity log. One
//! `parking_lot::Mutex` guards the whole store *and* the open state
//! database handle, so each mutating operation persists inside the same
//! critical section that changed it. Feed I/O never happens under this
//! lock.

pub mod account;
pub mod activity;

use parking_lot::{Mutex, MutexGuard};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::sim::error::SimError;
use crate::sim::prediction::PredictionMarket;
use crate::store::{self, StateStore};

use account::Account;
use activity::{ActivityEvent, ActivityLog};

/// Everything the single lock protects.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    /// Accounts keyed by immutable id.
    pub accounts: BTreeMap<String, Account>,
    /// Display name -> account id (case-sensitive).
    pub name_to_id: BTreeMap<String, String>,
    /// Account id -> API key.
    pub agent_keys: BTreeMap<String, String>,
    /// API key -> account id (reverse of `agent_keys`).
    pub key_to_agent: BTreeMap<String, String>,
    /// Claim token -> opaque registration challenge payload.
    pub registration_challenges: BTreeMap<String, Value>,
    /// Display name -> pending claim token.
    pub pending_by_agent: BTreeMap<String, String>,
    /// API key -> claim token for keys issued before the claim completed.
    pub registration_by_api_key: BTreeMap<String, String>,
    /// Follower id -> followed account ids.
    pub agent_following: BTreeMap<String, Vec<String>>,
    /// Last observed price per symbol.
    pub stock_prices: BTreeMap<String, f64>,
    pub poly_markets: BTreeMap<String, PredictionMarket>,
    pub activity: ActivityLog,
    pub test_agents: BTreeSet<String>,
}

impl LedgerState {
    /// Fresh state with the seeded demo price table and sample markets
    /// used before any snapshot exists.
    pub fn seeded() -> Self {
        let mut state = Self::default();
        for (symbol, px) in [
            ("AAPL", 210.0),
            ("TSLA", 185.0),
            ("NVDA", 125.0),
            ("MSFT", 420.0),
            ("BTCUSD", 45000.0),
            ("ETHUSD", 2500.0),
        ] {
            state.stock_prices.insert(symbol.to_string(), px);
        }
        for market in [
            PredictionMarket::sample(
                "poly-us-recession-2026",
                "Will the US enter recession in 2026?",
                &[("YES", 0.42), ("NO", 0.58)],
            ),
            PredictionMarket::sample(
                "poly-btc-150k-2026",
                "Will BTC touch 150k before 2027?",
                &[("YES", 0.35), ("NO", 0.65)],
            ),
        ] {
            state.poly_markets.insert(market.market_id.clone(), market);
        }
        state
    }

    /// Resolve an account id or display name to the account id.
    pub fn resolve(&self, identifier: &str) -> Option<String> {
        let ident = identifier.trim();
        if ident.is_empty() {
            return None;
        }
        if self.accounts.contains_key(ident) {
            return Some(ident.to_string());
        }
        self.name_to_id.get(ident).cloned()
    }

    pub fn display_name_for(&self, identifier: &str) -> String {
        match self.resolve(identifier) {
            Some(id) => self
                .accounts
                .get(&id)
                .map(|a| a.display_name.clone())
                .unwrap_or_else(|| identifier.trim().to_string()),
            None => identifier.trim().to_string(),
        }
    }

    /// Append an activity event, resolving the denormalized display name.
    pub fn record_event(&mut self, kind: &str, account_ident: &str, details: Value) -> ActivityEvent {
        let account_id = self
            .resolve(account_ident)
            .unwrap_or_else(|| account_ident.trim().to_string());
        let display_name = self
            .accounts
            .get(&account_id)
            .map(|a| a.display_name.clone())
            .unwrap_or_default();
        self.activity.record(kind, &account_id, &display_name, details)
    }
}

pub(crate) struct LedgerInner {
    pub state: LedgerState,
    pub store: StateStore,
}

impl LedgerInner {
    /// Synchronous persistence inside the caller's critical section. A
    /// write failure keeps the service available and is surfaced in the
    /// log only.
    pub fn persist(&self) {
        if let Err(e) = store::persist_state(&self.store, &self.state) {
            error!(error = %e, "ledger state persist failed");
        }
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub account_id: String,
    pub display_name: String,
    pub api_key: String,
    pub starting_cash: f64,
}

/// Per-structure removal counts from a purge, for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub account_id: String,
    pub display_name: String,
    pub deleted_account: bool,
    pub removed_api_keys: usize,
    pub removed_key_mappings: usize,
    pub removed_name_mappings: usize,
    pub removed_registration_challenges: usize,
    pub removed_pending_registrations: usize,
    pub removed_registration_keys: usize,
    pub removed_following_outgoing: usize,
    pub removed_following_incoming: usize,
    pub removed_activity_events: usize,
    pub removed_test_flags: usize,
}

pub struct LedgerService {
    inner: Mutex<LedgerInner>,
    config: Config,
    /// Mark-to-market refresh gate; see `sim::valuation`.
    pub(crate) mtm_last_attempt: Mutex<Option<std::time::Instant>>,
}

impl LedgerService {
    /// Open the backing store, load (and migrate if needed) the latest
    /// snapshot, and wrap everything behind the ledger lock.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let store = StateStore::open(&config.state_db)?;
        Self::from_store(store, config)
    }

    /// In-memory variant for tests and ephemeral runs.
    pub fn open_ephemeral(config: Config) -> anyhow::Result<Self> {
        let store = StateStore::open_in_memory()?;
        Self::from_store(store, config)
    }

    fn from_store(store: StateStore, config: Config) -> anyhow::Result<Self> {
        let (state, needs_resave) = store::load_state(&store, &config.legacy_state_file);
        info!(
            accounts = state.accounts.len(),
            events = state.activity.len(),
            markets = state.poly_markets.len(),
            "ledger state loaded"
        );
        let inner = LedgerInner { state, store };
        if needs_resave {
            inner.persist();
        }
        Ok(Self {
            inner: Mutex::new(inner),
            config,
            mtm_last_attempt: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock()
    }

    /// Run a read-only closure against a consistent point-in-time view.
    pub fn with_state<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> R {
        f(&self.lock().state)
    }

    pub fn resolve(&self, identifier: &str) -> Option<String> {
        self.with_state(|s| s.resolve(identifier))
    }

    pub fn account_snapshot(&self, identifier: &str) -> Option<Account> {
        self.with_state(|s| s.resolve(identifier).and_then(|id| s.accounts.get(&id).cloned()))
    }

    pub fn account_for_api_key(&self, api_key: &str) -> Option<String> {
        self.with_state(|s| s.key_to_agent.get(api_key.trim()).cloned())
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        let key = symbol.trim().to_uppercase();
        self.with_state(|s| s.stock_prices.get(&key).copied().filter(|px| *px > 0.0))
    }

    /// Register a new agent with the configured starting balance and a
    /// fresh API key.
    pub fn create_account(
        &self,
        display_name: &str,
        description: &str,
        is_test: bool,
    ) -> Result<Registration, SimError> {
        let name = display_name.trim();
        if !valid_agent_name(name) {
            return Err(SimError::InvalidAgentName);
        }

        let mut inner = self.lock();
        if inner.state.resolve(name).is_some() {
            return Err(SimError::NameAlreadyExists {
                name: name.to_string(),
            });
        }

        let account_id = Uuid::new_v4().to_string();
        let api_key = generate_api_key();
        let mut account = Account::new(
            account_id.clone(),
            name.to_string(),
            self.config.starting_cash,
            chrono::Utc::now().to_rfc3339(),
        );
        account.description = description.trim().to_string();
        account.is_test = is_test;

        let state = &mut inner.state;
        state.accounts.insert(account_id.clone(), account);
        state.name_to_id.insert(name.to_string(), account_id.clone());
        state.agent_keys.insert(account_id.clone(), api_key.clone());
        state.key_to_agent.insert(api_key.clone(), account_id.clone());
        if is_test {
            state.test_agents.insert(account_id.clone());
        }
        state.record_event(
            "agent_registered",
            &account_id,
            json!({ "initial_cash": self.config.starting_cash, "is_test": is_test }),
        );
        inner.persist();

        info!(account_id = %account_id, display_name = %name, "agent registered");
        Ok(Registration {
            account_id,
            display_name: name.to_string(),
            api_key,
            starting_cash: self.config.starting_cash,
        })
    }

    /// Change an agent's display name, rewriting the name index and the
    /// denormalized name cached on previously recorded events.
    pub fn rename_account(&self, identifier: &str, new_name: &str) -> Result<(), SimError> {
        let name = new_name.trim();
        if !valid_agent_name(name) {
            return Err(SimError::InvalidAgentName);
        }

        let mut inner = self.lock();
        let state = &mut inner.state;
        let account_id = state.resolve(identifier).ok_or(SimError::AgentNotFound)?;
        if let Some(holder) = state.name_to_id.get(name) {
            if *holder != account_id {
                return Err(SimError::NameAlreadyExists {
                    name: name.to_string(),
                });
            }
        }

        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(SimError::AgentNotFound)?;
        let old_name = std::mem::replace(&mut account.display_name, name.to_string());
        state.name_to_id.remove(&old_name);
        state.name_to_id.insert(name.to_string(), account_id.clone());
        state.activity.rename_account(&account_id, name);
        inner.persist();
        Ok(())
    }

    pub fn record_event(&self, kind: &str, account_ident: &str, details: Value) -> ActivityEvent {
        let mut inner = self.lock();
        let event = inner.state.record_event(kind, account_ident, details);
        inner.persist();
        event
    }

    /// Cascading removal of one account and every reference to it. Safe
    /// against partially migrated legacy data: rows carrying only a
    /// display name are matched through the alias set.
    pub fn purge_account(&self, identifier: &str) -> Result<PurgeReport, SimError> {
        let mut inner = self.lock();
        let state = &mut inner.state;
        let account_id = state.resolve(identifier).ok_or(SimError::AgentNotFound)?;
        let account = state
            .accounts
            .get(&account_id)
            .ok_or(SimError::AgentNotFound)?;

        let display_name = account.display_name.clone();
        let mut aliases: HashSet<String> = HashSet::new();
        for alias in [account_id.as_str(), display_name.as_str(), identifier.trim()] {
            if !alias.is_empty() {
                aliases.insert(alias.to_string());
            }
        }

        let mut report = PurgeReport {
            account_id: account_id.clone(),
            display_name: display_name.clone(),
            deleted_account: true,
            ..Default::default()
        };

        let mut removed_keys: HashSet<String> = HashSet::new();
        state.agent_keys.retain(|id, key| {
            if *id == account_id {
                removed_keys.insert(key.clone());
                false
            } else {
                true
            }
        });
        report.removed_api_keys = removed_keys.len();

        state.key_to_agent.retain(|key, id| {
            let drop = removed_keys.contains(key) || *id == account_id;
            if drop {
                report.removed_key_mappings += 1;
            }
            !drop
        });

        state.name_to_id.retain(|name, id| {
            let drop = aliases.contains(name) || *id == account_id;
            if drop {
                report.removed_name_mappings += 1;
            }
            !drop
        });

        let mut removed_tokens: HashSet<String> = HashSet::new();
        state.registration_challenges.retain(|token, challenge| {
            let challenge_id = challenge
                .get("agent_uuid")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let challenge_name = challenge
                .get("agent_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let drop = challenge_id == account_id || aliases.contains(challenge_name);
            if drop {
                removed_tokens.insert(token.clone());
            }
            !drop
        });
        report.removed_registration_challenges = removed_tokens.len();

        state.pending_by_agent.retain(|name, token| {
            let drop = aliases.contains(name) || removed_tokens.contains(token);
            if drop {
                report.removed_pending_registrations += 1;
            }
            !drop
        });

        state.registration_by_api_key.retain(|key, token| {
            let drop = removed_keys.contains(key) || removed_tokens.contains(token);
            if drop {
                report.removed_registration_keys += 1;
            }
            !drop
        });

        if let Some(targets) = state.agent_following.remove(&account_id) {
            report.removed_following_outgoing = targets.len();
        }
        for targets in state.agent_following.values_mut() {
            let before = targets.len();
            targets.retain(|target| *target != account_id);
            report.removed_following_incoming += before - targets.len();
        }

        report.removed_activity_events = state.activity.purge_account(&account_id, &aliases);

        let before_test = state.test_agents.len();
        state.test_agents.remove(&account_id);
        for alias in &aliases {
            state.test_agents.remove(alias);
        }
        report.removed_test_flags = before_test - state.test_agents.len();

        state.accounts.remove(&account_id);
        inner.persist();

        info!(
            account_id = %report.account_id,
            display_name = %report.display_name,
            events = report.removed_activity_events,
            "agent purged"
        );
        Ok(report)
    }
}

/// Display names: 3-64 chars of [A-Za-z0-9_-].
pub fn valid_agent_name(name: &str) -> bool {
    let len = name.chars().count();
    (3..=64).contains(&len)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn generate_api_key() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("crab_{}", token)
}
