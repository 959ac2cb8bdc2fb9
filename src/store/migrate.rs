//! Snapshot Repair & Migration
//!
//! Every load runs this normalization pass so partially written or legacy
//! snapshots come back consistent: identifier references (which may be
//! ids or display names) resolve to ids, display-name collisions dedupe
//! with numeric suffixes, the key<->id maps reconcile from whichever side
//! survived, and counters re-derive from the data when missing. Each step
//! is pure over the document; the returned flag tells the loader to
//! persist the repaired form immediately.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::ledger::account::Account;
use crate::ledger::activity::{derive_next_id, ActivityLog};
use crate::ledger::LedgerState;
use crate::store::snapshot::{is_uuid_like, SnapshotDoc};

/// Rebuild a consistent [`LedgerState`] from a snapshot document.
/// Returns the state and whether repairs changed anything.
pub fn restore(doc: SnapshotDoc) -> (LedgerState, bool) {
    let mut changed = false;

    let mut accounts: BTreeMap<String, Account> = BTreeMap::new();
    for (key, account_doc) in doc.accounts {
        let had_uuid = is_uuid_like(&account_doc.agent_uuid);
        let account = account_doc.into_account(&key);
        if !had_uuid {
            changed = true;
        }
        accounts.insert(account.account_id.clone(), account);
    }

    // Display names must be unique; collisions keep the first holder and
    // suffix the rest.
    let mut name_to_id: BTreeMap<String, String> = BTreeMap::new();
    for (account_id, account) in accounts.iter_mut() {
        let mut name = account.display_name.trim().to_string();
        if name.is_empty() {
            name = format!("agent-{}", &account_id[..8.min(account_id.len())]);
        }
        let base = name.clone();
        let mut suffix = 2;
        while name_to_id
            .get(&name)
            .is_some_and(|holder| holder != account_id)
        {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        if account.display_name != name {
            account.display_name = name.clone();
            changed = true;
        }
        name_to_id.insert(name, account_id.clone());
    }

    let resolve = |identifier: &str| -> Option<String> {
        let ident = identifier.trim();
        if ident.is_empty() {
            return None;
        }
        if accounts.contains_key(ident) {
            return Some(ident.to_string());
        }
        name_to_id.get(ident).cloned()
    };

    let mut agent_keys: BTreeMap<String, String> = BTreeMap::new();
    for (identifier, token) in &doc.agent_keys {
        let token = token.trim();
        match resolve(identifier) {
            Some(account_id) if !token.is_empty() => {
                if *identifier != account_id {
                    changed = true;
                }
                agent_keys.insert(account_id, token.to_string());
            }
            _ => changed = true,
        }
    }

    let mut key_to_agent: BTreeMap<String, String> = BTreeMap::new();
    for (token, identifier) in &doc.key_to_agent {
        let token = token.trim();
        match resolve(identifier) {
            Some(account_id) if !token.is_empty() => {
                if *identifier != account_id {
                    changed = true;
                }
                key_to_agent.insert(token.to_string(), account_id);
            }
            _ => changed = true,
        }
    }

    // Reconcile the key maps when only one side survived a partial write.
    for (account_id, token) in &agent_keys {
        if !key_to_agent.contains_key(token) {
            key_to_agent.insert(token.clone(), account_id.clone());
            changed = true;
        }
    }
    for (token, account_id) in &key_to_agent {
        if !agent_keys.contains_key(account_id) {
            agent_keys.insert(account_id.clone(), token.clone());
            changed = true;
        }
    }

    let mut agent_following: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (follower, targets) in &doc.agent_following {
        let Some(follower_id) = resolve(follower) else {
            changed = true;
            continue;
        };
        let mut seen = BTreeSet::new();
        let mut resolved_targets = Vec::new();
        for target in targets {
            let identifier = match target {
                Value::String(s) => s.clone(),
                Value::Object(map) => ["agent_uuid", "target_agent_uuid", "agent_id", "target_agent_id"]
                    .iter()
                    .find_map(|field| map.get(*field).and_then(Value::as_str))
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            match resolve(&identifier) {
                Some(target_id) if seen.insert(target_id.clone()) => {
                    if identifier != target_id || !matches!(target, Value::String(_)) {
                        changed = true;
                    }
                    resolved_targets.push(target_id);
                }
                _ => changed = true,
            }
        }
        agent_following.insert(follower_id, resolved_targets);
    }

    let mut test_agents: BTreeSet<String> = BTreeSet::new();
    for identifier in &doc.test_agents {
        match resolve(identifier) {
            Some(account_id) => {
                if *identifier != account_id {
                    changed = true;
                }
                test_agents.insert(account_id);
            }
            None => changed = true,
        }
    }
    for (account_id, account) in &accounts {
        if account.is_test {
            test_agents.insert(account_id.clone());
        }
    }

    let mut events = doc.activity_log;
    for event in &mut events {
        if event.account_id.trim().is_empty() {
            if let Some(account_id) = resolve(&event.display_name) {
                event.account_id = account_id;
                changed = true;
            }
        }
        if let Some(account) = resolve(&event.account_id).and_then(|id| accounts.get(&id)) {
            if event.display_name != account.display_name {
                event.display_name = account.display_name.clone();
                changed = true;
            }
        }
    }
    let next_id = if doc.next_activity_id > 0 {
        doc.next_activity_id as u64
    } else {
        derive_next_id(&events)
    };
    let activity = ActivityLog::from_parts(events, next_id);

    let seeded = LedgerState::seeded();
    let state = LedgerState {
        accounts,
        name_to_id,
        agent_keys,
        key_to_agent,
        registration_challenges: doc.registration_challenges,
        pending_by_agent: doc.pending_by_agent,
        registration_by_api_key: doc.registration_by_api_key,
        agent_following,
        stock_prices: doc.stock_prices.unwrap_or(seeded.stock_prices),
        poly_markets: doc.poly_markets.unwrap_or(seeded.poly_markets),
        activity,
        test_agents,
    };
    (state, changed)
}
