//! Trade Symbol Normalization & Classification
//!
//! Every symbol entering the ledger goes through [`normalize_trade_symbol`]
//! once, so the price table, positions, and activity log always agree on
//! spelling. Classification (stock vs crypto vs option vs pre-IPO token)
//! drives valuation legs and the contract multiplier.

use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};

/// Prefix for pre-IPO tokens (e.g. "PRE:SPACEX").
pub const PREIPO_PREFIX: &str = "PRE:";

/// OCC option contracts are worth 100 units of the underlying per contract.
const OPTION_CONTRACT_MULTIPLIER: f64 = 100.0;

lazy_static! {
    static ref CRYPTO_BASE_SYMBOLS: HashSet<&'static str> = [
        "BTC", "ETH", "SOL", "DOGE", "LTC", "BNB", "XRP", "ADA",
        "AVAX", "DOT", "MATIC", "LINK", "BCH", "ETC", "UNI", "ATOM",
        "TRX", "SHIB", "PEPE", "ARB", "OP", "NEAR",
    ]
    .into_iter()
    .collect();

    /// Companies that have listed publicly since users learned their
    /// private-market names. Input is folded to the exchange ticker.
    static ref LISTED_TICKER_ALIASES: HashMap<&'static str, &'static str> =
        [("FIGMA", "FIG")].into_iter().collect();
}

const CRYPTO_QUOTE_SYMBOLS: [&str; 5] = ["USDT", "USDC", "USD", "BTC", "ETH"];
const CRYPTO_FIAT_QUOTES: [&str; 3] = ["USD", "USDT", "USDC"];

/// Normalize a user-supplied symbol to its canonical ledger spelling.
///
/// Crypto pairs quoted in a fiat-equivalent (USD/USDT/USDC) fold to the
/// `<BASE>USD` form; a bare crypto base gets `USD` appended; OCC option
/// symbols pass through with any `O:` prefix stripped. Returns `None` for
/// an empty input.
pub fn normalize_trade_symbol(symbol: &str) -> Option<String> {
    let s: String = symbol.trim().to_uppercase().replace(' ', "");
    if s.is_empty() {
        return None;
    }

    if let Some(listed) = LISTED_TICKER_ALIASES.get(s.as_str()) {
        return Some((*listed).to_string());
    }
    if let Some(base) = s.strip_prefix(PREIPO_PREFIX) {
        if base.is_empty() {
            return None;
        }
        return Some(format!("{}{}", PREIPO_PREFIX, base));
    }

    let s = s.strip_prefix("O:").unwrap_or(&s).to_string();
    if is_occ_option_symbol(&s) {
        return Some(s);
    }

    for sep in ['/', '-', '_'] {
        if let Some((left, right)) = s.split_once(sep) {
            if CRYPTO_BASE_SYMBOLS.contains(left) && CRYPTO_QUOTE_SYMBOLS.contains(&right) {
                if CRYPTO_FIAT_QUOTES.contains(&right) {
                    return Some(format!("{}USD", left));
                }
                return Some(format!("{}{}", left, right));
            }
            return Some(s);
        }
    }

    if CRYPTO_BASE_SYMBOLS.contains(s.as_str()) {
        return Some(format!("{}USD", s));
    }

    for quote in CRYPTO_QUOTE_SYMBOLS {
        if let Some(base) = s.strip_suffix(quote) {
            if CRYPTO_BASE_SYMBOLS.contains(base) {
                if CRYPTO_FIAT_QUOTES.contains(&quote) {
                    return Some(format!("{}USD", base));
                }
                return Some(s);
            }
        }
    }

    Some(s)
}

/// True if `symbol` names a crypto asset (bare base or base+known quote).
pub fn is_crypto_symbol(symbol: &str) -> bool {
    let s = symbol.trim().to_uppercase();
    if s.is_empty() {
        return false;
    }
    if CRYPTO_BASE_SYMBOLS.contains(s.as_str()) {
        return true;
    }
    for sep in ['/', '-', '_'] {
        if let Some((left, right)) = s.split_once(sep) {
            return CRYPTO_BASE_SYMBOLS.contains(left) && CRYPTO_QUOTE_SYMBOLS.contains(&right);
        }
    }
    for quote in CRYPTO_QUOTE_SYMBOLS {
        if let Some(base) = s.strip_suffix(quote) {
            if CRYPTO_BASE_SYMBOLS.contains(base) {
                return true;
            }
        }
    }
    false
}

pub fn is_preipo_symbol(symbol: &str) -> bool {
    symbol.trim().to_uppercase().starts_with(PREIPO_PREFIX)
}

/// OCC format: 1-6 letter root, 6-digit expiry (yymmdd), C or P, 8-digit
/// strike in thousandths. Example: AAPL261218C00210000.
pub fn is_occ_option_symbol(symbol: &str) -> bool {
    let s = symbol.trim().to_uppercase();
    let s = s.strip_prefix("O:").unwrap_or(&s);
    let bytes = s.as_bytes();
    if bytes.len() < 16 || bytes.len() > 21 {
        return false;
    }
    let root_len = bytes.len() - 15;
    if root_len > 6 {
        return false;
    }
    let (root, rest) = bytes.split_at(root_len);
    if !root.iter().all(|b| b.is_ascii_uppercase()) {
        return false;
    }
    let (expiry, rest) = rest.split_at(6);
    if !expiry.iter().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let (right, strike) = rest.split_at(1);
    if right[0] != b'C' && right[0] != b'P' {
        return false;
    }
    strike.len() == 8 && strike.iter().all(|b| b.is_ascii_digit())
}

pub fn is_option_symbol(symbol: &str) -> bool {
    is_occ_option_symbol(symbol)
}

/// Notional multiplier for one unit of `symbol`: 100 for option
/// contracts, 1 for everything else.
pub fn contract_multiplier(symbol: &str) -> f64 {
    if is_option_symbol(symbol) {
        OPTION_CONTRACT_MULTIPLIER
    } else {
        1.0
    }
}

/// Alternate spellings under which a crypto price may already be cached
/// (slash pairs, sibling stable-coin quotes). First entry is canonical.
pub fn crypto_symbol_aliases(normalized: &str) -> Vec<String> {
    let s = normalized.trim().to_uppercase();
    if !is_crypto_symbol(&s) {
        return vec![s];
    }

    let mut base = "";
    let mut quote = "";
    for candidate in CRYPTO_QUOTE_SYMBOLS {
        if let Some(b) = s.strip_suffix(candidate) {
            base = b;
            quote = candidate;
            break;
        }
    }
    if base.is_empty() {
        return vec![s];
    }

    let mut aliases = vec![format!("{}{}", base, quote)];
    if CRYPTO_FIAT_QUOTES.contains(&quote) {
        for alt in [
            format!("{}USD", base),
            format!("{}USDT", base),
            format!("{}USDC", base),
            format!("{}/USD", base),
            format!("{}/USDT", base),
        ] {
            aliases.push(alt);
        }
    } else {
        aliases.push(format!("{}/{}", base, quote));
    }

    let mut seen = HashSet::new();
    aliases.retain(|a| seen.insert(a.clone()));
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_crypto_base() {
        assert_eq!(normalize_trade_symbol("btc").as_deref(), Some("BTCUSD"));
        assert_eq!(normalize_trade_symbol(" eth ").as_deref(), Some("ETHUSD"));
    }

    #[test]
    fn test_normalize_folds_fiat_quotes_to_usd() {
        assert_eq!(normalize_trade_symbol("BTC/USDT").as_deref(), Some("BTCUSD"));
        assert_eq!(normalize_trade_symbol("SOL-USDC").as_deref(), Some("SOLUSD"));
        assert_eq!(normalize_trade_symbol("ETHUSDT").as_deref(), Some("ETHUSD"));
    }

    #[test]
    fn test_normalize_keeps_crypto_cross_pairs() {
        assert_eq!(normalize_trade_symbol("ETH/BTC").as_deref(), Some("ETHBTC"));
    }

    #[test]
    fn test_normalize_plain_equity() {
        assert_eq!(normalize_trade_symbol("aapl").as_deref(), Some("AAPL"));
        assert_eq!(normalize_trade_symbol("FIGMA").as_deref(), Some("FIG"));
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(normalize_trade_symbol("").is_none());
        assert!(normalize_trade_symbol("PRE:").is_none());
    }

    #[test]
    fn test_option_symbol_detection() {
        assert!(is_occ_option_symbol("AAPL261218C00210000"));
        assert!(is_occ_option_symbol("O:TSLA260116P00185000"));
        assert!(!is_occ_option_symbol("AAPL"));
        assert!(!is_occ_option_symbol("AAPL261218X00210000"));
        assert_eq!(contract_multiplier("AAPL261218C00210000"), 100.0);
        assert_eq!(contract_multiplier("AAPL"), 1.0);
    }

    #[test]
    fn test_crypto_classifier() {
        assert!(is_crypto_symbol("BTCUSD"));
        assert!(is_crypto_symbol("DOGE"));
        assert!(!is_crypto_symbol("AAPL"));
        assert!(!is_crypto_symbol("PRE:SPACEX"));
    }

    #[test]
    fn test_crypto_aliases_cover_stable_quotes() {
        let aliases = crypto_symbol_aliases("BTCUSD");
        assert_eq!(aliases[0], "BTCUSD");
        assert!(aliases.contains(&"BTC/USD".to_string()));
        assert!(aliases.contains(&"BTCUSDT".to_string()));
        let aliases = crypto_symbol_aliases("ETHBTC");
        assert_eq!(aliases, vec!["ETHBTC".to_string(), "ETH/BTC".to_string()]);
    }
}
