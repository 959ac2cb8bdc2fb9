//! End-to-end ledger flow over an on-disk store: register, trade, bet,
//! resolve, rank, restart, purge. Exercises the persistence layer the way
//! the service uses it, including legacy-file migration.

use std::path::PathBuf;

use crabsim_backend::feed::StaticFeed;
use crabsim_backend::{Config, LedgerService, OrderSide, PredictionMarket, SimError};

fn config_for(db: PathBuf) -> Config {
    let mut config = Config::for_tests();
    config.state_db = db;
    config
}

#[tokio::test]
async fn test_full_ledger_flow_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");

    let reg = {
        let svc = LedgerService::open(config_for(db.clone())).unwrap();
        let reg = svc
            .create_account("integration_crab", "demo agent", false)
            .unwrap();

        let feed = StaticFeed::new();
        feed.set_price("AAPL", 100.0);
        svc.execute_market_order(&feed, "integration_crab", "AAPL", OrderSide::Buy, 10.0)
            .await
            .unwrap();

        let market = PredictionMarket::sample("poly-flow", "Will it ship?", &[("YES", 0.4), ("NO", 0.6)]);
        svc.sync_markets(std::slice::from_ref(&market));
        svc.place_bet(&reg.account_id, "poly-flow", "YES", 4.0).unwrap();
        reg
    };

    // Reopen from disk: everything is back.
    let svc = LedgerService::open(config_for(db.clone())).unwrap();
    let account = svc.account_snapshot("integration_crab").unwrap();
    assert_eq!(account.account_id, reg.account_id);
    assert_eq!(account.position_qty("AAPL"), 10.0);
    assert!((account.cash - (2000.0 - 1000.0 - 4.0)).abs() < 1e-9);
    assert!((account.poly_shares("poly-flow", "YES") - 10.0).abs() < 1e-9);
    assert_eq!(
        svc.account_for_api_key(&reg.api_key).as_deref(),
        Some(reg.account_id.as_str())
    );

    let report = svc.resolve_market("poly-flow", "YES").unwrap();
    assert_eq!(report.payouts.len(), 1);
    assert!((report.payouts[0].payout - 10.0).abs() < 1e-9);

    let leaderboard = svc.leaderboard(false);
    assert_eq!(leaderboard[0].display_name, "integration_crab");
    drop(svc);

    // Resolution is exactly-once even across restarts.
    let svc = LedgerService::open(config_for(db.clone())).unwrap();
    let account = svc.account_snapshot(&reg.account_id).unwrap();
    assert!(account.poly_positions.is_empty());
    assert!((account.cash - (2000.0 - 1000.0 - 4.0 + 10.0)).abs() < 1e-9);
    assert_eq!(
        svc.resolve_market("poly-flow", "NO").unwrap_err(),
        SimError::MarketAlreadyResolved
    );

    let purge = svc.purge_account("integration_crab").unwrap();
    assert!(purge.deleted_account);
    drop(svc);

    // The purge persisted; the freed name re-registers with a fresh id.
    let svc = LedgerService::open(config_for(db)).unwrap();
    assert!(svc.resolve("integration_crab").is_none());
    assert!(svc.account_for_api_key(&reg.api_key).is_none());
    let fresh = svc.create_account("integration_crab", "", false).unwrap();
    assert_ne!(fresh.account_id, reg.account_id);
}

#[test]
fn test_legacy_plain_file_migrates_into_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let legacy = dir.path().join("runtime_state.json");
    std::fs::write(
        &legacy,
        r#"{
            "version": 4,
            "accounts": {
                "legacy_crab": {
                    "agent_id": "legacy_crab",
                    "cash": 1750.0,
                    "positions": {"AAPL": 2.0},
                    "avg_cost": {"AAPL": 150.0}
                }
            },
            "agent_keys": {"legacy_crab": "legacy-key-123"}
        }"#,
    )
    .unwrap();

    let mut config = config_for(db.clone());
    config.legacy_state_file = legacy.clone();

    let account_id = {
        let svc = LedgerService::open(config.clone()).unwrap();
        let account = svc.account_snapshot("legacy_crab").unwrap();
        assert_eq!(account.cash, 1750.0);
        assert_eq!(account.positions.get("AAPL").unwrap().avg_cost, 150.0);
        // Key map keyed by name reconciles to the new id, both directions.
        assert_eq!(
            svc.account_for_api_key("legacy-key-123").as_deref(),
            Some(account.account_id.as_str())
        );
        account.account_id
    };

    // The migration re-saved into SQLite: the legacy file is no longer
    // needed.
    std::fs::remove_file(&legacy).unwrap();
    let svc = LedgerService::open(config).unwrap();
    assert_eq!(svc.resolve("legacy_crab").as_deref(), Some(account_id.as_str()));
}
