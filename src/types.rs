// =============================================================================
// Shared types used across the Lattice grid-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Market kind a strategy trades on. One persisted state file exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstType {
    Spot,
    Futures,
}

impl InstType {
    /// Lower-case name used in state-file naming (`grid_data_spot.json`).
    pub fn file_tag(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Futures => "futures",
        }
    }
}

impl std::fmt::Display for InstType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "Spot"),
            Self::Futures => write!(f, "Futures"),
        }
    }
}

/// Direction of a grid strategy. Spot is always Long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn is_long(&self) -> bool {
        matches!(self, Self::Long)
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Long
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "Long"),
            Self::Short => write!(f, "Short"),
        }
    }
}

/// Buy/sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Whether an order opens or closes position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Open,
    Close,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Position side for futures orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl From<Direction> for PositionSide {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::Long,
            Direction::Short => Self::Short,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Supported order types: market, optionally carrying a limit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Display-only lifecycle status of a strategy. Not persisted; the
/// `running_strategies` list in the state file is what restarts use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyStatus {
    Added,
    Running,
    Stopped,
    /// Fully liquidated, with the reason ("stop-loss", "manual", ...).
    Closed(String),
    Error,
}

impl Default for StrategyStatus {
    fn default() -> Self {
        Self::Added
    }
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "Added"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Closed(reason) => write!(f, "Closed ({reason})"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// User-toggled guards on what the state machine may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operations {
    pub open_enabled: bool,
    pub close_enabled: bool,
}

impl Default for Operations {
    fn default() -> Self {
        Self {
            open_enabled: true,
            close_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_defaults_to_long() {
        assert_eq!(Direction::default(), Direction::Long);
        assert!(Direction::Long.is_long());
        assert!(!Direction::Short.is_long());
    }

    #[test]
    fn status_display_includes_close_reason() {
        let status = StrategyStatus::Closed("stop-loss".to_string());
        assert_eq!(status.to_string(), "Closed (stop-loss)");
    }

    #[test]
    fn operations_default_to_both_enabled() {
        let ops = Operations::default();
        assert!(ops.open_enabled);
        assert!(ops.close_enabled);
    }

    #[test]
    fn inst_type_roundtrips_through_serde() {
        let json = serde_json::to_string(&InstType::Futures).unwrap();
        assert_eq!(json, "\"Futures\"");
        let back: InstType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InstType::Futures);
    }
}
