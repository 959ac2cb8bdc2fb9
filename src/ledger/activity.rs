//! Capped Activity Log
//!
//! Append-only operation journal with monotonically increasing ids. The
//! log doubles as the audit trail and the only source for equity-curve
//! reconstruction, so events denormalize the actor's display name and the
//! log takes part in rename fix-ups and purges. A fixed cap bounds memory;
//! dropping the oldest entries past it is intended behavior.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Default maximum number of retained events.
pub const ACTIVITY_LOG_CAP: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    #[serde(default)]
    pub id: u64,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Immutable actor id; may be empty on legacy rows that only carried
    /// a display name.
    #[serde(rename = "agent_uuid", default)]
    pub account_id: String,
    /// Denormalized display name at the time of the event; rewritten on
    /// rename.
    #[serde(rename = "agent_id", default)]
    pub display_name: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ActivityLog {
    events: Vec<ActivityEvent>,
    next_id: u64,
    cap: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            cap: ACTIVITY_LOG_CAP,
        }
    }
}

impl ActivityLog {
    /// Rebuild from persisted parts. A non-positive `next_id` is
    /// re-derived from the maximum event id present.
    pub fn from_parts(events: Vec<ActivityEvent>, next_id: u64) -> Self {
        let next_id = if next_id > 0 {
            next_id
        } else {
            derive_next_id(&events)
        };
        Self {
            events,
            next_id,
            cap: ACTIVITY_LOG_CAP,
        }
    }

    pub fn record(&mut self, kind: &str, account_id: &str, display_name: &str, details: Value) -> ActivityEvent {
        let event = ActivityEvent {
            id: self.next_id,
            kind: kind.to_string(),
            account_id: account_id.to_string(),
            display_name: display_name.to_string(),
            details,
            created_at: Utc::now().to_rfc3339(),
        };
        self.next_id += 1;
        self.events.push(event.clone());
        if self.events.len() > self.cap {
            let excess = self.events.len() - self.cap;
            self.events.drain(..excess);
        }
        event
    }

    /// Rewrite the denormalized display name on every event attributed to
    /// `account_id`. Returns how many events changed.
    pub fn rename_account(&mut self, account_id: &str, new_name: &str) -> usize {
        let mut changed = 0;
        for event in &mut self.events {
            if event.account_id == account_id && event.display_name != new_name {
                event.display_name = new_name.to_string();
                changed += 1;
            }
        }
        changed
    }

    /// Remove every event attributed to the account, matching by id or by
    /// any known alias for legacy rows with no id. Returns the count
    /// removed.
    pub fn purge_account(&mut self, account_id: &str, aliases: &HashSet<String>) -> usize {
        let before = self.events.len();
        self.events.retain(|event| {
            event.account_id != account_id && !aliases.contains(&event.display_name)
        });
        before - self.events.len()
    }

    pub fn events(&self) -> &[ActivityEvent] {
        &self.events
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub fn derive_next_id(events: &[ActivityEvent]) -> u64 {
    events.iter().map(|e| e.id).max().unwrap_or(0) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_monotonic() {
        let mut log = ActivityLog::default();
        let a = log.record("stock_order", "u-1", "crab", json!({}));
        let b = log.record("poly_bet", "u-1", "crab", json!({}));
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(log.next_id(), 3);
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut log = ActivityLog {
            cap: 3,
            ..Default::default()
        };
        for _ in 0..5 {
            log.record("tick", "u-1", "crab", json!({}));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.events()[0].id, 3);
        assert_eq!(log.next_id(), 6);
    }

    #[test]
    fn test_rename_rewrites_denormalized_names() {
        let mut log = ActivityLog::default();
        log.record("stock_order", "u-1", "old", json!({}));
        log.record("stock_order", "u-2", "other", json!({}));
        assert_eq!(log.rename_account("u-1", "new"), 1);
        assert_eq!(log.events()[0].display_name, "new");
        assert_eq!(log.events()[1].display_name, "other");
    }

    #[test]
    fn test_purge_matches_ids_and_aliases() {
        let mut log = ActivityLog::default();
        log.record("stock_order", "u-1", "crab", json!({}));
        log.record("stock_order", "", "crab", json!({}));
        log.record("stock_order", "u-2", "other", json!({}));
        let aliases: HashSet<String> = ["crab".to_string()].into_iter().collect();
        assert_eq!(log.purge_account("u-1", &aliases), 2);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_next_id_rederived_when_missing() {
        let events = vec![ActivityEvent {
            id: 41,
            kind: "stock_order".to_string(),
            account_id: "u-1".to_string(),
            display_name: "crab".to_string(),
            details: json!({}),
            created_at: String::new(),
        }];
        let log = ActivityLog::from_parts(events, 0);
        assert_eq!(log.next_id(), 42);
    }
}
