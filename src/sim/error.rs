//! Simulator error taxonomy.
//!
//! Every ledger mutation returns one of these as a typed, recoverable
//! error; nothing here terminates the process. `Display` renders the
//! stable wire tokens callers match on.

/// Recoverable simulator errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    /// No account resolves from the given identifier.
    AgentNotFound,
    /// No prediction market with the given id.
    MarketNotFound,
    /// Buy notional (or bet amount) exceeds available cash.
    InsufficientCash,
    /// Sell quantity exceeds the held position.
    InsufficientPosition,
    /// Resulting |position| would exceed the per-symbol cap.
    RiskMaxPosition,
    /// Realized plus adverse unrealized losses breached the daily limit.
    RiskMaxDailyLoss,
    /// Account is suspended after a hard risk breach.
    AgentBlocked,
    /// Market has already been resolved.
    MarketAlreadyResolved,
    /// Another live account already holds the display name.
    NameAlreadyExists { name: String },
    /// Requested display name fails validation.
    InvalidAgentName,
    /// Outcome is not listed on the market.
    InvalidOutcome,
    /// Winning outcome passed to resolution is not listed on the market.
    InvalidWinningOutcome,
    /// Listed odds are not a positive price.
    InvalidOdds,
    /// Symbol is empty or unparseable.
    InvalidSymbol,
    /// Order parameters violate the contract (qty or price not positive).
    InvalidOrder { reason: &'static str },
    /// Upstream feed failed and no cached price exists.
    MarketDataUnavailable { detail: String },
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentNotFound => write!(f, "agent_not_found"),
            Self::MarketNotFound => write!(f, "market_not_found"),
            Self::InsufficientCash => write!(f, "insufficient_cash"),
            Self::InsufficientPosition => write!(f, "insufficient_position"),
            Self::RiskMaxPosition => write!(f, "risk_reject: max_abs_position_per_symbol"),
            Self::RiskMaxDailyLoss => write!(f, "risk_reject: max_daily_loss_breached"),
            Self::AgentBlocked => write!(f, "agent_blocked"),
            Self::MarketAlreadyResolved => write!(f, "market_already_resolved"),
            Self::NameAlreadyExists { name } => write!(f, "name_already_exists: {}", name),
            Self::InvalidAgentName => write!(f, "invalid_agent_name"),
            Self::InvalidOutcome => write!(f, "invalid_outcome"),
            Self::InvalidWinningOutcome => write!(f, "invalid_winning_outcome"),
            Self::InvalidOdds => write!(f, "invalid_odds"),
            Self::InvalidSymbol => write!(f, "invalid_symbol"),
            Self::InvalidOrder { reason } => write!(f, "invalid_order: {}", reason),
            Self::MarketDataUnavailable { detail } => {
                write!(f, "market_data_unavailable: {}", detail)
            }
        }
    }
}

impl std::error::Error for SimError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tokens_are_stable() {
        assert_eq!(SimError::InsufficientCash.to_string(), "insufficient_cash");
        assert_eq!(
            SimError::RiskMaxPosition.to_string(),
            "risk_reject: max_abs_position_per_symbol"
        );
        assert_eq!(SimError::AgentBlocked.to_string(), "agent_blocked");
    }
}
