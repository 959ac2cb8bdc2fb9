//! Durable State Store
//!
//! The entire ledger persists as one JSON blob in a single-row SQLite
//! table, replaced atomically on every commit. Startup prefers the SQLite
//! payload, falls back to the legacy plain-file snapshot (migrating it
//! into SQLite on the spot), and otherwise starts from the seeded empty
//! state. An unparseable payload also starts empty: the service staying
//! available wins over strict durability, and the failure is loud in the
//! log.

pub mod migrate;
pub mod snapshot;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{error, info, warn};

use crate::ledger::LedgerState;
use snapshot::SnapshotDoc;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS state_store (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open state db {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("init state schema")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory state db")?;
        conn.execute_batch(SCHEMA_SQL).context("init state schema")?;
        Ok(Self { conn })
    }

    pub fn load_payload(&self) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT payload FROM state_store WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .context("read state payload")
    }

    /// Atomic replace-on-commit of the whole snapshot.
    pub fn save_payload(&self, payload: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO state_store (id, payload, updated_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                params![payload, Utc::now().to_rfc3339()],
            )
            .context("write state payload")?;
        Ok(())
    }
}

pub fn persist_state(store: &StateStore, state: &LedgerState) -> Result<()> {
    let doc = SnapshotDoc::from_state(state);
    let payload = serde_json::to_string(&doc).context("serialize state snapshot")?;
    store.save_payload(&payload)
}

/// Load the latest state. The returned flag asks the caller to persist
/// immediately (repairs were applied, or a legacy file was migrated).
pub fn load_state(store: &StateStore, legacy_file: &Path) -> (LedgerState, bool) {
    match store.load_payload() {
        Ok(Some(payload)) => match serde_json::from_str::<SnapshotDoc>(&payload) {
            Ok(doc) => migrate::restore(doc),
            Err(e) => {
                error!(error = %e, "state payload unparseable, starting from empty state");
                (LedgerState::seeded(), false)
            }
        },
        Ok(None) => load_legacy_file(legacy_file),
        Err(e) => {
            error!(error = %e, "state payload unreadable, starting from empty state");
            (LedgerState::seeded(), false)
        }
    }
}

fn load_legacy_file(path: &Path) -> (LedgerState, bool) {
    if !path.exists() {
        return (LedgerState::seeded(), false);
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str::<SnapshotDoc>(&raw).map_err(Into::into));
    match parsed {
        Ok(doc) => {
            info!(file = %path.display(), "migrating legacy state file into sqlite store");
            let (state, _) = migrate::restore(doc);
            (state, true)
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "legacy state file unreadable, starting from empty state");
            (LedgerState::seeded(), false)
        }
    }
}
