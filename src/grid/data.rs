// =============================================================================
// Grid Data — per-strategy state: levels, fills, running totals, guards
// =============================================================================
//
// Invariants maintained here:
//   - Level indices are dense starting at 0; level k+1 can only fill after k.
//   - All monetary quantities are exact decimals; no binary floats anywhere.
//   - `total_realized_profit` is the sum of `profit - fee` over every close
//     fill observed since creation.
//
// Thread-safety: `GridData` itself is plain data. While a strategy runs it is
// owned by its trader task behind a lock held only for short, non-await
// sections; observers read derived snapshots.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::exchange::{FillResponse, SymbolConfig, Ticker};
use crate::types::{Direction, InstType, Operations, StrategyStatus};

// ---------------------------------------------------------------------------
// Level model
// ---------------------------------------------------------------------------

/// User-editable parameters of one grid level. Percent values are 100x the
/// ratio (1.0 means 1 %).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelParams {
    pub interval_percent: Decimal,
    pub open_rebound_percent: Decimal,
    pub close_rebound_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub invest_amount: Decimal,
}

/// One rung of the ladder: parameters plus, once filled, position data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    pub interval_percent: Decimal,
    pub open_rebound_percent: Decimal,
    pub close_rebound_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub invest_amount: Decimal,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_filled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,

    /// Price of the last take-profit close on this level. Survives
    /// `reset_level`; the open branch waits for price to fall back under it
    /// before re-arming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_take_profit_price: Option<Decimal>,
}

impl LevelConfig {
    fn from_params(params: LevelParams) -> Self {
        Self {
            interval_percent: params.interval_percent,
            open_rebound_percent: params.open_rebound_percent,
            close_rebound_percent: params.close_rebound_percent,
            take_profit_percent: params.take_profit_percent,
            invest_amount: params.invest_amount,
            filled_amount: None,
            filled_price: None,
            filled_time: None,
            is_filled: false,
            order_id: None,
            last_take_profit_price: None,
        }
    }

    fn apply_params(&mut self, params: LevelParams) {
        self.interval_percent = params.interval_percent;
        self.open_rebound_percent = params.open_rebound_percent;
        self.close_rebound_percent = params.close_rebound_percent;
        self.take_profit_percent = params.take_profit_percent;
        self.invest_amount = params.invest_amount;
    }

    /// Clear fill state, keeping parameters and the last-tp memory.
    fn clear_fill(&mut self) {
        self.filled_amount = None;
        self.filled_price = None;
        self.filled_time = None;
        self.is_filled = false;
        self.order_id = None;
    }
}

// ---------------------------------------------------------------------------
// Overall guards
// ---------------------------------------------------------------------------

/// Overall take-profit guard: stop everything once accumulated realized
/// profit reaches `profit_amount` (quote currency).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeProfitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_amount: Option<Decimal>,
}

impl TakeProfitConfig {
    pub fn enable(&mut self, profit_amount: Decimal) {
        self.enabled = true;
        self.profit_amount = Some(profit_amount);
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.profit_amount = None;
    }
}

/// Overall stop-loss guard: liquidate once unrealized P&L falls to
/// `-loss_amount` (quote currency; stored positive).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLossConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_amount: Option<Decimal>,
}

impl StopLossConfig {
    pub fn enable(&mut self, loss_amount: Decimal) {
        self.enabled = true;
        self.loss_amount = Some(loss_amount.abs());
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.loss_amount = None;
    }
}

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

/// Mark-to-market summary of the currently held levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMetrics {
    pub total_base: Decimal,
    pub avg_price: Decimal,
    pub total_value: Decimal,
    pub unrealized_pnl: Decimal,
}

impl PositionMetrics {
    fn empty() -> Self {
        Self {
            total_base: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            total_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        }
    }
}

/// Shape of the ladder right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridStatus {
    pub configured: bool,
    pub total_levels: u32,
    pub filled_levels: u32,
    pub last_filled_level: Option<u32>,
    pub next_level: Option<u32>,
    pub is_full: bool,
}

/// Display row derived from `GridData` on demand; never the source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct RowSnapshot {
    pub uid: String,
    pub exchange: String,
    pub pair: String,
    pub direction: String,
    pub status: String,
    pub operations: Operations,
    /// "filled/total", or None while unconfigured.
    pub current_layer: Option<String>,
    pub position_value: Option<String>,
    pub avg_price: Option<String>,
    pub unrealized_pnl: Option<String>,
    pub realized_profit: String,
    pub last_price: Option<String>,
    pub last_fill_price: Option<String>,
    pub open_trigger_price: Option<String>,
    pub tp_trigger_price: Option<String>,
    pub overall_take_profit: Option<String>,
    pub overall_stop_loss: Option<String>,
    pub last_time: Option<String>,
}

// ---------------------------------------------------------------------------
// GridData
// ---------------------------------------------------------------------------

/// Aggregate state of one grid strategy. The serialized form is the wire
/// schema of the persisted state file; runtime-only fields are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridData {
    pub uid: String,
    pub pair: String,
    pub exchange: String,
    pub inst_type: InstType,
    pub direction: Direction,
    pub take_profit_config: TakeProfitConfig,
    pub stop_loss_config: StopLossConfig,
    pub total_realized_profit: Decimal,
    pub grid_levels: BTreeMap<u32, LevelConfig>,
    pub operations: Operations,

    /// Futures margin parameters, passed through to orders unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_mode: Option<String>,

    #[serde(skip)]
    pub symbol_config: Option<SymbolConfig>,
    #[serde(skip)]
    pub last_price: Option<Decimal>,
    #[serde(skip)]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub status: StrategyStatus,
    /// Trigger prices mirrored by the trader for display.
    #[serde(skip)]
    pub open_trigger_price: Option<Decimal>,
    #[serde(skip)]
    pub tp_trigger_price: Option<Decimal>,
}

impl GridData {
    pub fn new(
        uid: impl Into<String>,
        pair: impl Into<String>,
        exchange: impl Into<String>,
        inst_type: InstType,
    ) -> Self {
        let uid = uid.into();
        let pair = pair.into();
        info!(%uid, %pair, %inst_type, "grid data created");
        Self {
            uid,
            pair,
            exchange: exchange.into(),
            inst_type,
            direction: Direction::Long,
            take_profit_config: TakeProfitConfig::default(),
            stop_loss_config: StopLossConfig::default(),
            total_realized_profit: Decimal::ZERO,
            grid_levels: BTreeMap::new(),
            operations: Operations::default(),
            leverage: None,
            margin_mode: None,
            symbol_config: None,
            last_price: None,
            last_update_time: None,
            status: StrategyStatus::Added,
            open_trigger_price: None,
            tp_trigger_price: None,
        }
    }

    // -------------------------------------------------------------------------
    // Simple predicates
    // -------------------------------------------------------------------------

    pub fn is_long(&self) -> bool {
        self.direction.is_long()
    }

    pub fn is_spot(&self) -> bool {
        self.inst_type == InstType::Spot
    }

    pub fn is_empty(&self) -> bool {
        self.grid_levels.is_empty()
    }

    pub fn has_filled_levels(&self) -> bool {
        self.grid_levels.values().any(|level| level.is_filled)
    }

    /// Total base amount across filled levels.
    pub fn total_filled_amount(&self) -> Decimal {
        self.grid_levels
            .values()
            .filter(|level| level.is_filled)
            .filter_map(|level| level.filled_amount)
            .sum()
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Change the strategy direction. Rejected once any level is filled.
    /// Spot strategies are always long; a requested Short is coerced.
    pub fn set_direction(&mut self, direction: Direction) -> EngineResult<()> {
        if self.has_filled_levels() {
            return Err(EngineError::State(
                "direction cannot change while levels are filled".into(),
            ));
        }

        let effective = if self.is_spot() {
            Direction::Long
        } else {
            direction
        };
        if effective != direction {
            debug!(uid = %self.uid, "spot strategy forced to long");
        }
        self.direction = effective;
        Ok(())
    }

    /// Modify an unfilled level, or create the next dense level.
    pub fn update_level(&mut self, level: u32, params: LevelParams) -> EngineResult<()> {
        if params.invest_amount <= Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "invest amount must be positive, got {}",
                params.invest_amount
            )));
        }
        if params.interval_percent < Decimal::ZERO
            || params.open_rebound_percent < Decimal::ZERO
            || params.close_rebound_percent < Decimal::ZERO
            || params.take_profit_percent < Decimal::ZERO
        {
            return Err(EngineError::Config("percentages must not be negative".into()));
        }

        let total = self.grid_levels.len() as u32;
        match self.grid_levels.get_mut(&level) {
            Some(existing) => {
                if existing.is_filled {
                    return Err(EngineError::Config(format!(
                        "level {level} is filled and cannot be modified"
                    )));
                }
                existing.apply_params(params);
            }
            None => {
                // Indices stay dense: only the next level can be created.
                if level != total {
                    return Err(EngineError::Config(format!(
                        "level {level} would leave a gap, next level is {total}"
                    )));
                }
                self.grid_levels.insert(level, LevelConfig::from_params(params));
            }
        }
        debug!(uid = %self.uid, level, "level configured");
        Ok(())
    }

    /// Clear the fill state of a level, preserving its parameters and
    /// last-tp memory. The caller must ensure no order is pending for it.
    pub fn reset_level(&mut self, level: u32) -> EngineResult<()> {
        let config = self.grid_levels.get_mut(&level).ok_or_else(|| {
            EngineError::State(format!("reset of unknown level {level}"))
        })?;
        config.clear_fill();
        debug!(uid = %self.uid, level, "level reset");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fill application
    // -------------------------------------------------------------------------

    /// Apply an open fill to a level. Level orderings stay hole-free: level k
    /// can only fill when every level below it is filled.
    pub fn apply_open_fill(&mut self, level: u32, fill: &FillResponse) -> EngineResult<()> {
        if !self.grid_levels.contains_key(&level) {
            return Err(EngineError::State(format!(
                "open fill for unknown level {level}"
            )));
        }
        if self.grid_levels[&level].is_filled {
            return Err(EngineError::State(format!(
                "open fill for already-filled level {level}"
            )));
        }
        if level > 0 {
            let below_filled = self
                .grid_levels
                .get(&(level - 1))
                .map(|l| l.is_filled)
                .unwrap_or(false);
            if !below_filled {
                return Err(EngineError::State(format!(
                    "open fill for level {level} while level {} is unfilled",
                    level - 1
                )));
            }
        }

        let filled_time = DateTime::<Utc>::from_timestamp_millis(fill.trade_time_ms)
            .unwrap_or_else(Utc::now);

        let config = self.grid_levels.get_mut(&level).expect("checked above");
        config.filled_amount = Some(fill.filled_base_amount);
        config.filled_price = Some(fill.filled_price);
        config.filled_time = Some(filled_time);
        config.is_filled = true;
        config.order_id = Some(fill.order_id.clone());

        info!(
            uid = %self.uid,
            level,
            price = %fill.filled_price,
            amount = %fill.filled_base_amount,
            "open fill applied"
        );
        Ok(())
    }

    /// Apply a take-profit close fill: accumulate `profit - fee`, remember
    /// the close price for the open damping, and reset the level.
    ///
    /// Returns the realized profit added.
    pub fn apply_close_fill(&mut self, level: u32, fill: &FillResponse) -> EngineResult<Decimal> {
        let config = self.grid_levels.get(&level).ok_or_else(|| {
            EngineError::State(format!("close fill for unknown level {level}"))
        })?;
        if !config.is_filled {
            return Err(EngineError::State(format!(
                "close fill for unfilled level {level}"
            )));
        }

        // Futures report the close profit; spot closes are computed from the
        // entry price.
        let gross_profit = match fill.profit {
            Some(profit) => profit,
            None => {
                let entry = config.filled_price.ok_or_else(|| {
                    EngineError::State(format!("filled level {level} has no entry price"))
                })?;
                let raw = (fill.filled_price - entry) * fill.filled_base_amount;
                if self.is_long() {
                    raw
                } else {
                    -raw
                }
            }
        };
        let realized = gross_profit - fill.fee;

        self.total_realized_profit += realized;
        let config = self.grid_levels.get_mut(&level).expect("checked above");
        config.last_take_profit_price = Some(fill.filled_price);
        config.clear_fill();

        info!(
            uid = %self.uid,
            level,
            %realized,
            total = %self.total_realized_profit,
            "close fill applied"
        );
        Ok(realized)
    }

    /// Apply a full liquidation: accumulate the reported profit (if any),
    /// reset every filled level, and mark the strategy closed.
    pub fn apply_liquidation(&mut self, fill: Option<&FillResponse>, reason: &str) {
        if let Some(fill) = fill {
            if let Some(profit) = fill.profit {
                self.total_realized_profit += profit - fill.fee;
            }
        }

        let filled: Vec<u32> = self
            .grid_levels
            .iter()
            .filter(|(_, config)| config.is_filled)
            .map(|(level, _)| *level)
            .collect();
        for level in filled {
            if let Some(config) = self.grid_levels.get_mut(&level) {
                config.clear_fill();
            }
        }

        self.status = StrategyStatus::Closed(reason.to_string());
        info!(uid = %self.uid, reason, "all positions liquidated");
    }

    // -------------------------------------------------------------------------
    // Derived metrics
    // -------------------------------------------------------------------------

    pub fn calculate_position_metrics(&self) -> PositionMetrics {
        let Some(current_price) = self.last_price else {
            return PositionMetrics::empty();
        };

        let mut total_base = Decimal::ZERO;
        let mut total_cost = Decimal::ZERO;
        for config in self.grid_levels.values().filter(|c| c.is_filled) {
            let (Some(amount), Some(entry)) = (config.filled_amount, config.filled_price) else {
                continue;
            };
            total_base += amount;
            total_cost += amount * entry;
        }

        if total_base.is_zero() {
            return PositionMetrics::empty();
        }

        let avg_price = total_cost / total_base;
        let raw_pnl = (current_price - avg_price) * total_base;
        PositionMetrics {
            total_base,
            avg_price,
            total_value: total_base * current_price,
            unrealized_pnl: if self.is_long() { raw_pnl } else { -raw_pnl },
        }
    }

    pub fn get_grid_status(&self) -> GridStatus {
        let total_levels = self.grid_levels.len() as u32;
        if total_levels == 0 {
            return GridStatus {
                configured: false,
                total_levels: 0,
                filled_levels: 0,
                last_filled_level: None,
                next_level: None,
                is_full: false,
            };
        }

        let filled_levels = self
            .grid_levels
            .values()
            .filter(|config| config.is_filled)
            .count() as u32;
        let last_filled_level = self
            .grid_levels
            .iter()
            .filter(|(_, config)| config.is_filled)
            .map(|(level, _)| *level)
            .max();
        let next_level = self
            .grid_levels
            .iter()
            .find(|(_, config)| !config.is_filled)
            .map(|(level, _)| *level);

        GridStatus {
            configured: true,
            total_levels,
            filled_levels,
            last_filled_level,
            next_level,
            is_full: filled_levels == total_levels,
        }
    }

    pub fn get_last_filled_level(&self) -> Option<u32> {
        self.get_grid_status().last_filled_level
    }

    pub fn get_next_level(&self) -> Option<u32> {
        self.get_grid_status().next_level
    }

    // -------------------------------------------------------------------------
    // Overall guards
    // -------------------------------------------------------------------------

    /// True iff overall take-profit is enabled and accumulated realized
    /// profit has reached the configured amount.
    pub fn check_take_profit_reached(&self) -> bool {
        match (self.take_profit_config.enabled, self.take_profit_config.profit_amount) {
            (true, Some(amount)) => self.total_realized_profit >= amount,
            _ => false,
        }
    }

    /// True iff overall stop-loss is enabled and unrealized P&L has fallen to
    /// the configured loss.
    pub fn check_stop_loss_reached(&self, unrealized_pnl: Decimal) -> bool {
        match (self.stop_loss_config.enabled, self.stop_loss_config.loss_amount) {
            (true, Some(amount)) => unrealized_pnl <= -amount,
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Record a tick. Ticks not newer than the last recorded one are
    /// discarded and `false` is returned.
    pub fn update_market_data(&mut self, ticker: &Ticker) -> bool {
        let Some(tick_time) = ticker.timestamp() else {
            return false;
        };
        if let Some(last) = self.last_update_time {
            if tick_time <= last {
                return false;
            }
        }

        self.last_price = Some(ticker.last_price);
        self.last_update_time = Some(tick_time);
        true
    }

    // -------------------------------------------------------------------------
    // Display projection
    // -------------------------------------------------------------------------

    /// Build the derived display row. Recomputed from scratch on demand.
    pub fn row_snapshot(&self) -> RowSnapshot {
        let grid_status = self.get_grid_status();
        let metrics = self.calculate_position_metrics();
        let has_position = !metrics.total_base.is_zero();

        let last_fill_price = self
            .get_last_filled_level()
            .and_then(|level| self.grid_levels.get(&level))
            .and_then(|config| config.filled_price);

        RowSnapshot {
            uid: self.uid.clone(),
            exchange: self.exchange.clone(),
            pair: self.pair.clone(),
            direction: self.direction.to_string(),
            status: self.status.to_string(),
            operations: self.operations,
            current_layer: grid_status.configured.then(|| {
                format!("{}/{}", grid_status.filled_levels, grid_status.total_levels)
            }),
            position_value: has_position.then(|| metrics.total_value.to_string()),
            avg_price: has_position.then(|| metrics.avg_price.to_string()),
            unrealized_pnl: has_position.then(|| metrics.unrealized_pnl.to_string()),
            realized_profit: self.total_realized_profit.to_string(),
            last_price: self.last_price.map(|p| p.to_string()),
            last_fill_price: last_fill_price.map(|p| p.to_string()),
            open_trigger_price: self.open_trigger_price.map(|p| p.to_string()),
            tp_trigger_price: self.tp_trigger_price.map(|p| p.to_string()),
            overall_take_profit: self
                .take_profit_config
                .enabled
                .then(|| self.take_profit_config.profit_amount)
                .flatten()
                .map(|a| a.to_string()),
            overall_stop_loss: self
                .stop_loss_config
                .enabled
                .then(|| self.stop_loss_config.loss_amount)
                .flatten()
                .map(|a| a.to_string()),
            last_time: self.last_update_time.map(|t| t.to_rfc3339()),
        }
    }
}
