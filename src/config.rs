//! Runtime Configuration
//!
//! Everything is env-driven with sane defaults so the binary runs out of
//! the box. `.env` files are honored via dotenv.

use std::env;
use std::path::PathBuf;

/// Hard limits enforced by the execution engine.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_abs_position_per_symbol: f64,
    pub max_daily_loss: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_abs_position_per_symbol: 100.0,
            max_daily_loss: 5000.0,
        }
    }
}

/// Upstream market-data endpoints and credentials.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub alpaca_key_id: Option<String>,
    pub alpaca_secret_key: Option<String>,
    pub alpaca_data_base: String,
    pub gamma_base: String,
    pub jupiter_price_base: String,
    pub http_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            alpaca_key_id: None,
            alpaca_secret_key: None,
            alpaca_data_base: "https://data.alpaca.markets".to_string(),
            gamma_base: "https://gamma-api.polymarket.com".to_string(),
            jupiter_price_base: "https://lite-api.jup.ag/price/v3".to_string(),
            http_timeout_secs: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub state_db: PathBuf,
    pub legacy_state_file: PathBuf,
    pub starting_cash: f64,
    pub risk: RiskConfig,
    pub mark_to_market_refresh_secs: u64,
    pub hide_test_data: bool,
    pub feed: FeedConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let state_db = env::var("CRAB_STATE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_path("runtime_state.db"));
        let legacy_state_file = env::var("CRAB_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_path("runtime_state.json"));

        let starting_cash = env_f64("CRAB_STARTING_CASH", 2000.0, |v| v > 0.0);
        let risk = RiskConfig {
            max_abs_position_per_symbol: env_f64("CRAB_MAX_ABS_POSITION", 100.0, |v| v > 0.0),
            max_daily_loss: env_f64("CRAB_MAX_DAILY_LOSS", 5000.0, |v| v > 0.0),
        };
        let mark_to_market_refresh_secs = env::var("CRAB_MTM_REFRESH_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(300);
        let hide_test_data = env_flag("CRAB_HIDE_TEST_DATA");

        let feed = FeedConfig {
            alpaca_key_id: first_non_empty_env(&["APCA_API_KEY_ID", "ALPACA_API_KEY_ID", "ALPACA_API_KEY"]),
            alpaca_secret_key: first_non_empty_env(&[
                "APCA_API_SECRET_KEY",
                "ALPACA_API_SECRET_KEY",
                "ALPACA_API_SECRET",
            ]),
            alpaca_data_base: env::var("ALPACA_DATA_BASE_URL")
                .ok()
                .map(|base| base.trim_end_matches('/').trim_end_matches("/v2").to_string())
                .filter(|base| !base.is_empty())
                .unwrap_or_else(|| "https://data.alpaca.markets".to_string()),
            gamma_base: env::var("CRAB_GAMMA_BASE_URL")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string()),
            jupiter_price_base: env::var("CRAB_JUPITER_PRICE_URL")
                .unwrap_or_else(|_| "https://lite-api.jup.ag/price/v3".to_string()),
            http_timeout_secs: env::var("CRAB_MARKET_DATA_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&v| v > 0)
                .unwrap_or(8),
        };

        Self {
            state_db,
            legacy_state_file,
            starting_cash,
            risk,
            mark_to_market_refresh_secs,
            hide_test_data,
            feed,
        }
    }

    /// Fixed configuration for unit tests: tight daily-loss limit, no env
    /// reads, no on-disk paths.
    pub fn for_tests() -> Self {
        Self {
            state_db: PathBuf::from(":memory:"),
            legacy_state_file: PathBuf::from("/nonexistent/crabsim-legacy.json"),
            starting_cash: 2000.0,
            risk: RiskConfig {
                max_abs_position_per_symbol: 100.0,
                max_daily_loss: 1000.0,
            },
            mark_to_market_refresh_secs: 300,
            hide_test_data: false,
            feed: FeedConfig::default(),
        }
    }
}

fn default_data_path(file_name: &str) -> PathBuf {
    match env::var("HOME") {
        Ok(home) => PathBuf::from(home)
            .join(".local/share/crab-trading")
            .join(file_name),
        Err(_) => PathBuf::from(file_name),
    }
}

fn env_f64(name: &str, default: f64, valid: impl Fn(f64) -> bool) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|&v| valid(v))
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn first_non_empty_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}
