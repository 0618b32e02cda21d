// =============================================================================
// Grid Trader — price-driven state machine for one running strategy
// =============================================================================
//
// One trader per strategy, driven by a single task. Per tick, with no order
// in flight:
//   1. stop-loss check (liquidate everything),
//   2. take-profit branch for the last filled level,
//   3. open branch for the next unfilled level.
// Both branches are rebound-confirmed: price must cross a trigger, run to an
// extreme, and reverse by the configured percentage before an order fires.
//
// At most one order is pending at any time. Fill events and the per-tick
// algorithm run on the same task, so a fill is always applied before the
// next tick of this strategy.
// =============================================================================

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::engine_config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{ExchangeConnector, FillResponse, OrderRequest, SymbolConfig, Ticker};
use crate::grid::data::GridData;
use crate::types::{InstType, OrderSide, OrderType, StrategyStatus, TradeSide};

// ---------------------------------------------------------------------------
// Transient state
// ---------------------------------------------------------------------------

/// Rebound bookkeeping. `extreme_price` tracks the open watch (running min
/// for long, max for short), `tp_extreme_price` the take-profit watch
/// (mirrored).
#[derive(Debug, Default)]
pub struct PriceState {
    pub trigger_price: Option<Decimal>,
    pub extreme_price: Option<Decimal>,
    pub tp_trigger_price: Option<Decimal>,
    pub tp_extreme_price: Option<Decimal>,
}

impl PriceState {
    pub fn reset(&mut self) {
        self.trigger_price = None;
        self.extreme_price = None;
        self.tp_trigger_price = None;
        self.tp_extreme_price = None;
    }

    fn update_extreme(&mut self, price: Decimal, is_long: bool) {
        self.extreme_price = Some(match self.extreme_price {
            None => price,
            Some(extreme) if is_long => extreme.min(price),
            Some(extreme) => extreme.max(price),
        });
    }

    fn update_tp_extreme(&mut self, price: Decimal, is_long: bool) {
        self.tp_extreme_price = Some(match self.tp_extreme_price {
            None => price,
            Some(extreme) if is_long => extreme.max(price),
            Some(extreme) => extreme.min(price),
        });
    }
}

/// What the pending order will do when it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Open,
    TakeProfit,
}

/// The single in-flight order, shared with the manager so user operations
/// (level reset, delete) can refuse while an order is pending.
#[derive(Debug, Default)]
pub struct OrderState {
    pub pending_order_id: Option<String>,
    pub pending_client_order_id: Option<String>,
    pub pending_level: Option<u32>,
    pub pending_kind: Option<PendingKind>,
}

impl OrderState {
    pub fn is_pending(&self) -> bool {
        self.pending_client_order_id.is_some()
    }

    fn set_pending(&mut self, client_order_id: String, level: u32, kind: PendingKind) {
        self.pending_client_order_id = Some(client_order_id);
        self.pending_level = Some(level);
        self.pending_kind = Some(kind);
        self.pending_order_id = None;
    }

    fn clear(&mut self) {
        self.pending_order_id = None;
        self.pending_client_order_id = None;
        self.pending_level = None;
        self.pending_kind = None;
    }

    /// Whether an incoming fill belongs to the pending order.
    fn matches(&self, client_order_id: &str, order_id: &str) -> bool {
        self.pending_client_order_id.as_deref() == Some(client_order_id)
            || (self.pending_order_id.is_some()
                && self.pending_order_id.as_deref() == Some(order_id))
    }
}

// ---------------------------------------------------------------------------
// Snapshot helpers (read under a short lock, used across awaits)
// ---------------------------------------------------------------------------

struct OrderContext {
    symbol_config: SymbolConfig,
    inst_type: InstType,
    is_long: bool,
    pair: String,
    uid: String,
    leverage: Option<u32>,
    margin_mode: Option<String>,
}

// ---------------------------------------------------------------------------
// GridTrader
// ---------------------------------------------------------------------------

pub struct GridTrader {
    uid: String,
    data: Arc<RwLock<GridData>>,
    connector: Arc<dyn ExchangeConnector>,
    events: EventBus,
    config: EngineConfig,
    price_state: PriceState,
    order_state: Arc<Mutex<OrderState>>,
    last_processed_price: Option<Decimal>,
}

impl GridTrader {
    pub fn new(
        uid: impl Into<String>,
        data: Arc<RwLock<GridData>>,
        connector: Arc<dyn ExchangeConnector>,
        events: EventBus,
        config: EngineConfig,
        order_state: Arc<Mutex<OrderState>>,
    ) -> Self {
        Self {
            uid: uid.into(),
            data,
            connector,
            events,
            config,
            price_state: PriceState::default(),
            order_state,
            last_processed_price: None,
        }
    }

    fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(uid = %self.uid, %message, "strategy error");
        self.events.publish(EngineEvent::StrategyError {
            uid: self.uid.clone(),
            message,
        });
    }

    fn emit_updated_and_save(&self) {
        self.events
            .publish(EngineEvent::StrategyUpdated(self.uid.clone()));
        self.events
            .publish(EngineEvent::SaveRequested(self.uid.clone()));
    }

    fn millis_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn order_context(&self) -> EngineResult<OrderContext> {
        let data = self.data.read();
        let symbol_config = data.symbol_config.clone().ok_or_else(|| {
            EngineError::Config("symbol config not cached; strategy not started".into())
        })?;
        Ok(OrderContext {
            symbol_config,
            inst_type: data.inst_type,
            is_long: data.is_long(),
            pair: data.pair.clone(),
            uid: data.uid.clone(),
            leverage: data.leverage,
            margin_mode: data.margin_mode.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Task loop
    // -------------------------------------------------------------------------

    /// Trader task body: merge fill events and ticks on one task so a fill
    /// for this strategy is always applied before its next tick. The stop
    /// flag is re-checked after every await.
    pub async fn run(
        mut self,
        mut tick_rx: broadcast::Receiver<Ticker>,
        mut fill_rx: mpsc::Receiver<(String, FillResponse)>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!(uid = %self.uid, "trader loop started");
        let throttle =
            std::time::Duration::from_millis(self.config.tick_min_process_interval_ms);
        let mut last_run: Option<tokio::time::Instant> = None;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }

                fill = fill_rx.recv() => {
                    let Some((client_order_id, fill)) = fill else { break };
                    if let Err(e) = self.handle_fill_event(&client_order_id, fill).await {
                        if self.fail(e) {
                            break;
                        }
                    }
                }

                tick = tick_rx.recv() => {
                    let mut ticker = match tick {
                        Ok(ticker) => ticker,
                        Err(broadcast::error::RecvError::Lagged(dropped)) => {
                            warn!(uid = %self.uid, dropped, "tick channel overflow, oldest ticks dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    // Collapse bursts down to the newest tick.
                    while let Ok(newer) = tick_rx.try_recv() {
                        ticker = newer;
                    }

                    // A stale-priced tick inside the throttle window is noise.
                    if self.last_processed_price == Some(ticker.last_price) {
                        if let Some(at) = last_run {
                            if at.elapsed() < throttle {
                                continue;
                            }
                        }
                    }
                    last_run = Some(tokio::time::Instant::now());

                    if let Err(e) = self.process_tick(ticker).await {
                        if self.fail(e) {
                            break;
                        }
                    }
                }
            }
        }

        info!(uid = %self.uid, "trader loop exited");
    }

    /// Handle a loop error. Returns true when the loop must exit.
    fn fail(&mut self, error: EngineError) -> bool {
        self.emit_error(error.to_string());
        if error.is_fatal() {
            error!(uid = %self.uid, %error, "fatal strategy error, stopping");
            self.data.write().status = StrategyStatus::Error;
            self.events
                .publish(EngineEvent::StrategyUpdated(self.uid.clone()));
            true
        } else {
            false
        }
    }

    // -------------------------------------------------------------------------
    // Per-tick algorithm
    // -------------------------------------------------------------------------

    /// Run the state machine for one tick. No-op while an order is pending,
    /// for stale ticks, and for unchanged prices.
    pub async fn process_tick(&mut self, ticker: Ticker) -> EngineResult<()> {
        if self.order_state.lock().is_pending() {
            return Ok(());
        }

        let current_price = ticker.last_price;
        let applied = self.data.write().update_market_data(&ticker);
        if !applied {
            return Ok(());
        }
        if self.last_processed_price == Some(current_price) {
            return Ok(());
        }
        self.last_processed_price = Some(current_price);

        let (grid_status, unrealized_pnl, operations) = {
            let data = self.data.read();
            let status = data.get_grid_status();
            let metrics = data.calculate_position_metrics();
            (status, metrics.unrealized_pnl, data.operations)
        };

        if !grid_status.configured {
            return Ok(());
        }

        let has_position = grid_status.filled_levels > 0;

        // Stop-loss wins over take-profit wins over opening.
        if has_position && self.data.read().check_stop_loss_reached(unrealized_pnl) {
            info!(uid = %self.uid, %unrealized_pnl, "overall stop-loss reached");
            self.close_all_positions("stop-loss").await?;
            return Ok(());
        }

        if has_position && operations.close_enabled && self.check_take_profit(current_price).await?
        {
            // A settled close may push accumulated profit over the overall
            // guard; pushed fills run the same check in handle_fill_event.
            if self.data.read().check_take_profit_reached() {
                info!(uid = %self.uid, "overall take-profit reached, liquidating");
                self.close_all_positions("take-profit").await?;
            }
            return Ok(());
        }

        if !grid_status.is_full && operations.open_enabled {
            self.check_open_position(current_price).await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Open branch
    // -------------------------------------------------------------------------

    async fn check_open_position(&mut self, current_price: Decimal) -> EngineResult<()> {
        struct OpenSnapshot {
            next_level: u32,
            is_long: bool,
            interval_percent: Decimal,
            open_rebound_percent: Decimal,
            last_tp_price: Option<Decimal>,
            base_price: Option<Decimal>,
        }

        let snapshot = {
            let data = self.data.read();
            let Some(next_level) = data.get_next_level() else {
                return Ok(());
            };
            let level_config = &data.grid_levels[&next_level];
            let base_price = if next_level == 0 {
                None
            } else {
                data.grid_levels
                    .get(&(next_level - 1))
                    .and_then(|config| config.filled_price)
            };
            OpenSnapshot {
                next_level,
                is_long: data.is_long(),
                interval_percent: level_config.interval_percent,
                open_rebound_percent: level_config.open_rebound_percent,
                last_tp_price: level_config.last_take_profit_price,
                base_price,
            }
        };

        // The first layer opens unconditionally on price availability.
        if snapshot.next_level == 0 {
            debug!(uid = %self.uid, %current_price, "opening first level");
            self.place_open_order(0, current_price).await;
            return Ok(());
        }

        let Some(base_price) = snapshot.base_price else {
            // Previous level has no recorded entry; nothing to anchor on.
            return Ok(());
        };

        let interval = snapshot.interval_percent / Decimal::ONE_HUNDRED;
        let trigger_price = if snapshot.is_long {
            base_price * (Decimal::ONE - interval)
        } else {
            base_price * (Decimal::ONE + interval)
        };
        self.price_state.trigger_price = Some(trigger_price);
        self.data.write().open_trigger_price = Some(trigger_price);

        // Prior take-profit damping: after a tp close on this level, wait for
        // price to re-enter the zone below (long) / above (short) the close.
        if let Some(last_tp) = snapshot.last_tp_price {
            let outside = if snapshot.is_long {
                current_price > last_tp
            } else {
                current_price < last_tp
            };
            if outside {
                return Ok(());
            }

            self.price_state.update_extreme(current_price, snapshot.is_long);
            if self.open_rebound_reached(current_price, snapshot.open_rebound_percent, snapshot.is_long)
            {
                debug!(uid = %self.uid, level = snapshot.next_level, "rebound confirmed after tp re-entry");
                self.place_open_order(snapshot.next_level, current_price).await;
            }
            return Ok(());
        }

        let triggered = if snapshot.is_long {
            current_price <= trigger_price
        } else {
            current_price >= trigger_price
        };
        if !triggered {
            return Ok(());
        }

        self.price_state.update_extreme(current_price, snapshot.is_long);
        if self.open_rebound_reached(current_price, snapshot.open_rebound_percent, snapshot.is_long)
        {
            debug!(
                uid = %self.uid,
                level = snapshot.next_level,
                %current_price,
                extreme = ?self.price_state.extreme_price,
                "open rebound confirmed"
            );
            self.place_open_order(snapshot.next_level, current_price).await;
        }
        Ok(())
    }

    fn open_rebound_reached(
        &self,
        current_price: Decimal,
        rebound_percent: Decimal,
        is_long: bool,
    ) -> bool {
        let Some(extreme) = self.price_state.extreme_price else {
            return false;
        };
        if extreme.is_zero() {
            return false;
        }
        let required = rebound_percent / Decimal::ONE_HUNDRED;
        let ratio = if is_long {
            (current_price - extreme) / extreme
        } else {
            (extreme - current_price) / extreme
        };
        ratio >= required
    }

    // -------------------------------------------------------------------------
    // Take-profit branch
    // -------------------------------------------------------------------------

    /// Returns true when a close order was issued (or attempted) this tick.
    async fn check_take_profit(&mut self, current_price: Decimal) -> EngineResult<bool> {
        struct TpSnapshot {
            level: u32,
            is_long: bool,
            entry_price: Decimal,
            take_profit_percent: Decimal,
            close_rebound_percent: Decimal,
        }

        let snapshot = {
            let data = self.data.read();
            let Some(level) = data.get_last_filled_level() else {
                return Ok(false);
            };
            let config = &data.grid_levels[&level];
            let Some(entry_price) = config.filled_price else {
                return Ok(false);
            };
            TpSnapshot {
                level,
                is_long: data.is_long(),
                entry_price,
                take_profit_percent: config.take_profit_percent,
                close_rebound_percent: config.close_rebound_percent,
            }
        };

        // Deterministic trigger: always derived from the fill price.
        let profit = snapshot.take_profit_percent / Decimal::ONE_HUNDRED;
        let tp_trigger = if snapshot.is_long {
            snapshot.entry_price * (Decimal::ONE + profit)
        } else {
            snapshot.entry_price * (Decimal::ONE - profit)
        };
        self.price_state.tp_trigger_price = Some(tp_trigger);
        self.data.write().tp_trigger_price = Some(tp_trigger);

        let triggered = if snapshot.is_long {
            current_price >= tp_trigger
        } else {
            current_price <= tp_trigger
        };
        if !triggered {
            return Ok(false);
        }

        self.price_state.update_tp_extreme(current_price, snapshot.is_long);

        let Some(tp_extreme) = self.price_state.tp_extreme_price else {
            return Ok(false);
        };
        if tp_extreme.is_zero() {
            return Ok(false);
        }
        let required = snapshot.close_rebound_percent / Decimal::ONE_HUNDRED;
        let ratio = if snapshot.is_long {
            (tp_extreme - current_price) / tp_extreme
        } else {
            (current_price - tp_extreme) / tp_extreme
        };
        if ratio < required {
            return Ok(false);
        }

        debug!(
            uid = %self.uid,
            level = snapshot.level,
            %current_price,
            %tp_extreme,
            "take-profit rebound confirmed"
        );
        self.place_take_profit_order(snapshot.level, current_price).await;
        self.price_state.reset();
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Order submission
    // -------------------------------------------------------------------------

    /// Round down to `precision` decimal places, then require `minimum`.
    fn adjust_order_size(
        value: Decimal,
        precision: u32,
        minimum: Decimal,
        what: &str,
    ) -> EngineResult<Decimal> {
        let adjusted = value.round_dp_with_strategy(precision, RoundingStrategy::ToZero);
        if adjusted < minimum {
            return Err(EngineError::Config(format!(
                "{what} {adjusted} below exchange minimum {minimum}"
            )));
        }
        Ok(adjusted)
    }

    async fn place_open_order(&mut self, level: u32, current_price: Decimal) {
        let context = match self.order_context() {
            Ok(context) => context,
            Err(e) => {
                self.emit_error(e.to_string());
                return;
            }
        };
        let invest_amount = {
            let data = self.data.read();
            data.grid_levels[&level].invest_amount
        };
        let sc = &context.symbol_config;

        // Validate both denominations against the exchange floor; a skipped
        // order must not touch price_state so the trigger re-arms next tick.
        let sized = (|| -> EngineResult<(Decimal, Decimal)> {
            let quote_size = Self::adjust_order_size(
                invest_amount,
                sc.quote_precision,
                sc.min_quote_amount,
                "quote size",
            )?;
            let base_size = Self::adjust_order_size(
                quote_size / current_price,
                sc.base_precision,
                sc.min_base_amount,
                "base size",
            )?;
            Ok((quote_size, base_size))
        })();
        let (quote_size, base_size) = match sized {
            Ok(sizes) => sizes,
            Err(e) => {
                self.emit_error(e.to_string());
                return;
            }
        };

        let price =
            current_price.round_dp_with_strategy(sc.price_precision, RoundingStrategy::ToZero);
        let client_order_id = format!(
            "grid_{}_{}_{}",
            context.uid,
            level,
            Self::millis_now()
        );

        let request = OrderRequest {
            inst_type: context.inst_type,
            symbol: sc.symbol.clone(),
            pair: context.pair.clone(),
            side: if context.is_long {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            trade_side: TradeSide::Open,
            position_side: self.data.read().direction.into(),
            order_type: OrderType::Market,
            // Spot market buys are quote-denominated, futures orders
            // base-denominated.
            base_size: (context.inst_type == InstType::Futures).then_some(base_size),
            quote_size: (context.inst_type == InstType::Spot).then_some(quote_size),
            price: Some(price),
            client_order_id: client_order_id.clone(),
            reduce_only: false,
            leverage: context.leverage,
            margin_mode: context.margin_mode,
        };

        self.order_state
            .lock()
            .set_pending(client_order_id.clone(), level, PendingKind::Open);

        info!(
            uid = %self.uid,
            level,
            %quote_size,
            %base_size,
            %price,
            "submitting open order"
        );
        match self.connector.place_order(request).await {
            Ok(response) => {
                self.order_state.lock().pending_order_id = Some(response.order_id.clone());
                self.price_state.reset();
                if let Some(fill) = response.fill {
                    self.settle_fill(level, PendingKind::Open, &fill);
                } else {
                    self.poll_pending_fill(&sc.symbol.clone(), &response.order_id, level, PendingKind::Open)
                        .await;
                }
            }
            Err(e) => {
                // Placement failure keeps the strategy running.
                self.order_state.lock().clear();
                self.emit_error(format!("open order failed: {e}"));
            }
        }
    }

    async fn place_take_profit_order(&mut self, level: u32, current_price: Decimal) {
        let context = match self.order_context() {
            Ok(context) => context,
            Err(e) => {
                self.emit_error(e.to_string());
                return;
            }
        };
        let filled_amount = {
            let data = self.data.read();
            data.grid_levels[&level].filled_amount
        };
        let Some(filled_amount) = filled_amount else {
            self.emit_error(format!("take-profit on level {level} with no filled amount"));
            return;
        };
        let sc = &context.symbol_config;

        let base_size = match Self::adjust_order_size(
            filled_amount,
            sc.base_precision,
            sc.min_base_amount,
            "position size",
        ) {
            Ok(size) => size,
            Err(e) => {
                self.emit_error(e.to_string());
                return;
            }
        };

        let price =
            current_price.round_dp_with_strategy(sc.price_precision, RoundingStrategy::ToZero);
        let client_order_id = format!(
            "grid_{}_{}_{}_tp",
            context.uid,
            level,
            Self::millis_now()
        );

        let request = OrderRequest {
            inst_type: context.inst_type,
            symbol: sc.symbol.clone(),
            pair: context.pair.clone(),
            side: if context.is_long {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            trade_side: TradeSide::Close,
            position_side: self.data.read().direction.into(),
            order_type: OrderType::Market,
            base_size: Some(base_size),
            quote_size: None,
            price: Some(price),
            client_order_id: client_order_id.clone(),
            reduce_only: true,
            leverage: context.leverage,
            margin_mode: context.margin_mode,
        };

        self.order_state
            .lock()
            .set_pending(client_order_id.clone(), level, PendingKind::TakeProfit);

        info!(uid = %self.uid, level, %base_size, %price, "submitting take-profit order");
        match self.connector.place_order(request).await {
            Ok(response) => {
                self.order_state.lock().pending_order_id = Some(response.order_id.clone());
                if let Some(fill) = response.fill {
                    self.settle_fill(level, PendingKind::TakeProfit, &fill);
                } else {
                    self.poll_pending_fill(
                        &sc.symbol.clone(),
                        &response.order_id,
                        level,
                        PendingKind::TakeProfit,
                    )
                    .await;
                }
            }
            Err(e) => {
                self.order_state.lock().clear();
                self.emit_error(format!("take-profit order failed: {e}"));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fill settlement
    // -------------------------------------------------------------------------

    /// Poll `get_fills` for a pending order within the configured budget.
    /// If the fill never shows up the pending order stays set and the user
    /// must intervene.
    async fn poll_pending_fill(
        &mut self,
        symbol: &str,
        order_id: &str,
        level: u32,
        kind: PendingKind,
    ) {
        for attempt in 1..=self.config.fill_poll_attempts {
            tokio::time::sleep(std::time::Duration::from_millis(
                self.config.fill_poll_interval_ms,
            ))
            .await;

            if !self.order_state.lock().is_pending() {
                // A pushed fill event settled the order while we slept.
                return;
            }

            match self.connector.get_fills(symbol, order_id).await {
                Ok(fills) => {
                    if let Some(fill) = fills.first() {
                        self.settle_fill(level, kind, fill);
                        return;
                    }
                    debug!(uid = %self.uid, order_id, attempt, "fill not yet visible");
                }
                Err(e) if e.is_transient() => {
                    debug!(uid = %self.uid, order_id, attempt, error = %e, "fill poll retry");
                }
                Err(e) => {
                    self.emit_error(format!("fill query failed: {e}"));
                    return;
                }
            }
        }

        self.emit_error(format!(
            "missing fill for order {order_id}; manual intervention required"
        ));
    }

    /// Apply a settled fill to the grid and clear the pending order.
    fn settle_fill(&mut self, level: u32, kind: PendingKind, fill: &FillResponse) {
        let result = match kind {
            PendingKind::Open => self.data.write().apply_open_fill(level, fill),
            PendingKind::TakeProfit => self
                .data
                .write()
                .apply_close_fill(level, fill)
                .map(|_realized| ()),
        };

        match result {
            Ok(()) => {
                self.order_state.lock().clear();
                self.emit_updated_and_save();
            }
            Err(e) => {
                // State errors here mean the grid and the exchange disagree.
                self.order_state.lock().clear();
                self.emit_error(e.to_string());
                self.data.write().status = StrategyStatus::Error;
            }
        }
    }

    /// Entry point for pushed order updates from the private stream.
    pub async fn handle_fill_event(
        &mut self,
        client_order_id: &str,
        fill: FillResponse,
    ) -> EngineResult<()> {
        let (level, kind) = {
            let state = self.order_state.lock();
            if !state.matches(client_order_id, &fill.order_id) {
                debug!(uid = %self.uid, client_order_id, "ignoring unrelated fill event");
                return Ok(());
            }
            let Some(level) = state.pending_level else {
                return Ok(());
            };
            // Correlate by client-order-id suffix: take-profit closes carry
            // "_tp", liquidations "_close_all", everything else opens.
            let kind = if client_order_id.ends_with("_tp") {
                PendingKind::TakeProfit
            } else if client_order_id.ends_with("_close_all") {
                debug!(uid = %self.uid, "liquidation fills settle synchronously");
                return Ok(());
            } else {
                PendingKind::Open
            };
            if let Some(pending_kind) = state.pending_kind {
                if pending_kind != kind {
                    warn!(
                        uid = %self.uid,
                        client_order_id,
                        ?pending_kind,
                        "fill suffix disagrees with the pending order kind"
                    );
                }
            }
            (level, kind)
        };

        self.settle_fill(level, kind, &fill);

        if kind == PendingKind::TakeProfit && self.data.read().check_take_profit_reached() {
            info!(uid = %self.uid, "overall take-profit reached, liquidating");
            self.close_all_positions("take-profit").await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Liquidation
    // -------------------------------------------------------------------------

    /// Sum every filled level and close the lot with one market order.
    /// On success all filled levels reset and the strategy shows
    /// `Closed (<reason>)`.
    pub async fn close_all_positions(&mut self, reason: &str) -> EngineResult<()> {
        let context = self.order_context()?;
        let total_amount = self.data.read().total_filled_amount();

        if total_amount <= Decimal::ZERO {
            // Nothing on the book: the strategy is closed outright.
            debug!(uid = %self.uid, "no position to liquidate");
            self.data.write().apply_liquidation(None, reason);
            self.emit_updated_and_save();
            return Ok(());
        }

        let sc = &context.symbol_config;
        Self::adjust_order_size(
            total_amount,
            sc.base_precision,
            sc.min_base_amount,
            "total position size",
        )
        .map_err(|e| {
            self.emit_error(e.to_string());
            e
        })?;

        info!(uid = %self.uid, reason, %total_amount, "liquidating all positions");
        let position_side = self.data.read().direction.into();
        match self
            .connector
            .close_all_positions(&context.pair, position_side)
            .await
        {
            Ok(response) => {
                let fill = match response.fill {
                    Some(fill) => Some(fill),
                    None => self
                        .connector
                        .get_fills(&sc.symbol, &response.order_id)
                        .await
                        .ok()
                        .and_then(|fills| fills.into_iter().next()),
                };

                self.data.write().apply_liquidation(fill.as_ref(), reason);
                self.price_state.reset();
                self.order_state.lock().clear();
                self.emit_updated_and_save();
                Ok(())
            }
            Err(e) => {
                self.emit_error(format!("liquidation failed: {e}"));
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for GridTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridTrader")
            .field("uid", &self.uid)
            .field("pending", &self.order_state.lock().is_pending())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{btc_usdt_spot, FillPlan, FillTemplate, MockConnector};
    use crate::types::Direction;
    use rust_decimal_macros::dec;

    struct Harness {
        trader: GridTrader,
        connector: Arc<MockConnector>,
        data: Arc<RwLock<GridData>>,
        events: broadcast::Receiver<EngineEvent>,
        next_ts: i64,
    }

    fn harness(inst_type: InstType, direction: Direction) -> Harness {
        let connector = Arc::new(MockConnector::new(inst_type));
        let mut config = btc_usdt_spot();
        config.inst_type = inst_type;
        connector.add_symbol(config.clone());

        let mut grid = GridData::new("ab12cd34", "BTC/USDT", "mock", inst_type);
        grid.set_direction(direction).unwrap();
        grid.symbol_config = Some(config);
        let data = Arc::new(RwLock::new(grid));

        let bus = EventBus::new();
        let events = bus.subscribe();
        let trader = GridTrader::new(
            "ab12cd34",
            data.clone(),
            connector.clone(),
            bus,
            EngineConfig::default(),
            Arc::new(Mutex::new(OrderState::default())),
        );

        Harness {
            trader,
            connector,
            data,
            events,
            next_ts: 1_700_000_000_000,
        }
    }

    fn level_params(
        interval: Decimal,
        open_rebound: Decimal,
        take_profit: Decimal,
        close_rebound: Decimal,
        invest: Decimal,
    ) -> crate::grid::data::LevelParams {
        crate::grid::data::LevelParams {
            interval_percent: interval,
            open_rebound_percent: open_rebound,
            close_rebound_percent: close_rebound,
            take_profit_percent: take_profit,
            invest_amount: invest,
        }
    }

    fn fill_at(price: Decimal, amount: Decimal) -> FillResponse {
        FillResponse {
            symbol: "BTCUSDT".into(),
            order_id: "seed".into(),
            client_order_id: None,
            trade_side: None,
            filled_price: price,
            filled_base_amount: amount,
            filled_quote_value: price * amount,
            fee: Decimal::ZERO,
            profit: None,
            trade_time_ms: 1_600_000_000_000,
        }
    }

    async fn feed(harness: &mut Harness, prices: &[Decimal]) {
        for price in prices {
            harness.next_ts += 1_000;
            harness
                .trader
                .process_tick(Ticker {
                    last_price: *price,
                    ts_ms: harness.next_ts,
                })
                .await
                .unwrap();
        }
    }

    // Scenario: long open on rebound. Level 0 filled at 100.00, level 1
    // triggers at 99.00, extreme reaches 98.80, the bounce back to 99.00 is
    // ~0.2024% >= 0.2% and fires the open.
    #[tokio::test]
    async fn long_open_fires_on_rebound() {
        let mut h = harness(InstType::Spot, Direction::Long);
        {
            let mut data = h.data.write();
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.update_level(1, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.apply_open_fill(0, &fill_at(dec!(100.00), dec!(1.0000)))
                .unwrap();
        }

        feed(&mut h, &[dec!(100.00), dec!(99.50), dec!(99.00), dec!(98.80)]).await;
        assert_eq!(h.connector.placed_count(), 0, "no order before the rebound");

        feed(&mut h, &[dec!(99.00)]).await;
        assert_eq!(h.connector.placed_count(), 1);

        let placed = h.connector.placed_orders.lock()[0].clone();
        assert_eq!(placed.quote_size, Some(dec!(100.00)));
        assert_eq!(placed.base_size, None);
        assert_eq!(placed.side, OrderSide::Buy);
        assert_eq!(placed.trade_side, TradeSide::Open);
        assert!(placed.client_order_id.starts_with("grid_ab12cd34_1_"));

        let data = h.data.read();
        let level = &data.grid_levels[&1];
        assert!(level.is_filled);
        assert_eq!(level.filled_price, Some(dec!(99.00)));
    }

    // Scenario: long take-profit. Entry 100.00, tp 1.5% -> trigger 101.50,
    // extreme 102.00, pullback to 101.60 is ~0.392% >= 0.3% and closes the
    // level; realized profit is reported profit minus fee.
    #[tokio::test]
    async fn long_take_profit_fires_on_pullback() {
        let mut h = harness(InstType::Spot, Direction::Long);
        {
            let mut data = h.data.write();
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.apply_open_fill(0, &fill_at(dec!(100.00), dec!(1.0000)))
                .unwrap();
        }
        h.connector.plan_fill(FillPlan::Immediate(FillTemplate {
            price: Some(dec!(101.60)),
            fee: dec!(0.10),
            profit: Some(dec!(1.60)),
        }));

        feed(&mut h, &[dec!(101.00), dec!(101.50), dec!(102.00)]).await;
        assert_eq!(h.connector.placed_count(), 0);

        feed(&mut h, &[dec!(101.60)]).await;
        assert_eq!(h.connector.placed_count(), 1);

        let placed = h.connector.placed_orders.lock()[0].clone();
        assert_eq!(placed.base_size, Some(dec!(1.0000)));
        assert_eq!(placed.side, OrderSide::Sell);
        assert!(placed.client_order_id.ends_with("_tp"));
        assert!(placed.reduce_only);

        let data = h.data.read();
        assert_eq!(data.total_realized_profit, dec!(1.50));
        assert!(!data.grid_levels[&0].is_filled);
        assert_eq!(data.grid_levels[&0].last_take_profit_price, Some(dec!(101.60)));
    }

    // Scenario: stop-loss liquidation. Two filled levels, loss limit 50;
    // -11 leaves it alone, -59 fires close_all and resets everything.
    #[tokio::test]
    async fn stop_loss_liquidates_everything() {
        let mut h = harness(InstType::Futures, Direction::Long);
        {
            let mut data = h.data.write();
            data.stop_loss_config.enable(dec!(50));
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(15.0), dec!(0.3), dec!(100)))
                .unwrap();
            data.update_level(1, level_params(dec!(1.0), dec!(0.2), dec!(15.0), dec!(0.3), dec!(100)))
                .unwrap();
            data.apply_open_fill(0, &fill_at(dec!(100), dec!(1.0))).unwrap();
            data.apply_open_fill(1, &fill_at(dec!(99), dec!(1.0))).unwrap();
        }
        *h.connector.close_all_plan.lock() = Some(FillPlan::Immediate(FillTemplate {
            price: Some(dec!(70.00)),
            fee: dec!(0.5),
            profit: Some(dec!(-59.0)),
        }));

        feed(&mut h, &[dec!(94.00)]).await;
        assert!(h.connector.close_all_calls.lock().is_empty());

        feed(&mut h, &[dec!(70.00)]).await;
        assert_eq!(h.connector.close_all_calls.lock().len(), 1);

        let data = h.data.read();
        assert!(!data.has_filled_levels());
        assert_eq!(data.total_realized_profit, dec!(-59.5));
        assert_eq!(data.status.to_string(), "Closed (stop-loss)");
    }

    // First tick after start with no prior price opens level 0 immediately.
    #[tokio::test]
    async fn first_level_opens_unconditionally() {
        let mut h = harness(InstType::Spot, Direction::Long);
        h.data
            .write()
            .update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
            .unwrap();

        feed(&mut h, &[dec!(100.00)]).await;
        assert_eq!(h.connector.placed_count(), 1);
        assert!(h.data.read().grid_levels[&0].is_filled);
    }

    // Opening is gated by the open_enabled toggle.
    #[tokio::test]
    async fn disabled_open_operation_blocks_the_open_branch() {
        let mut h = harness(InstType::Spot, Direction::Long);
        {
            let mut data = h.data.write();
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.operations.open_enabled = false;
        }

        feed(&mut h, &[dec!(100.00)]).await;
        assert_eq!(h.connector.placed_count(), 0);
    }

    // An order rounded below the exchange minimum is skipped with an error
    // event and no state change, so the trigger re-arms on the next tick.
    #[tokio::test]
    async fn undersized_order_is_skipped_and_rearms() {
        let mut h = harness(InstType::Spot, Direction::Long);
        h.data
            .write()
            .update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(4)))
            .unwrap();

        feed(&mut h, &[dec!(100.00)]).await;
        assert_eq!(h.connector.placed_count(), 0);

        let mut saw_error = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, EngineEvent::StrategyError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error, "undersized order must surface an error event");
        assert!(!h.data.read().grid_levels[&0].is_filled);
    }

    // A price change of exactly zero between ticks is skipped: the machine
    // only re-runs when the price actually moves.
    #[tokio::test]
    async fn unchanged_price_is_skipped() {
        let mut h = harness(InstType::Spot, Direction::Long);
        // Undersized invest makes every open attempt observable as an error.
        h.data
            .write()
            .update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(4)))
            .unwrap();

        let drain_errors = |events: &mut broadcast::Receiver<EngineEvent>| {
            let mut count = 0;
            while let Ok(event) = events.try_recv() {
                if matches!(event, EngineEvent::StrategyError { .. }) {
                    count += 1;
                }
            }
            count
        };

        feed(&mut h, &[dec!(100.00)]).await;
        assert_eq!(drain_errors(&mut h.events), 1);

        // Same price, newer timestamp: nothing runs.
        feed(&mut h, &[dec!(100.00)]).await;
        assert_eq!(drain_errors(&mut h.events), 0);

        // A real move runs the machine again.
        feed(&mut h, &[dec!(101.00)]).await;
        assert_eq!(drain_errors(&mut h.events), 1);
    }

    // A fill only visible through polling settles within the poll budget.
    #[tokio::test(start_paused = true)]
    async fn polled_fill_settles_the_order() {
        let mut h = harness(InstType::Spot, Direction::Long);
        h.data
            .write()
            .update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
            .unwrap();
        h.connector.plan_fill(FillPlan::Polled(FillTemplate {
            price: Some(dec!(100.00)),
            ..Default::default()
        }));

        feed(&mut h, &[dec!(100.00)]).await;

        assert_eq!(h.connector.placed_count(), 1);
        assert!(h.data.read().grid_levels[&0].is_filled);
        assert!(!h.trader.order_state.lock().is_pending());
    }

    // While an order is pending no further orders can fire; a pushed fill
    // event settles it and re-enables the machine.
    #[tokio::test(start_paused = true)]
    async fn pending_order_blocks_until_fill_arrives() {
        let mut h = harness(InstType::Spot, Direction::Long);
        {
            let mut data = h.data.write();
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.update_level(1, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
        }
        h.connector.plan_fill(FillPlan::Silent);

        // First tick opens level 0; the silent plan leaves it pending after
        // the poll budget is exhausted (virtual time).
        feed(&mut h, &[dec!(100.00)]).await;
        assert_eq!(h.connector.placed_count(), 1);

        let mut saw_missing_fill = false;
        while let Ok(event) = h.events.try_recv() {
            if let EngineEvent::StrategyError { message, .. } = event {
                saw_missing_fill |= message.contains("missing fill");
            }
        }
        assert!(saw_missing_fill);

        // Machine is frozen while pending.
        feed(&mut h, &[dec!(95.00), dec!(94.00), dec!(95.00)]).await;
        assert_eq!(h.connector.placed_count(), 1);

        // The late fill arrives over the private stream.
        let client_order_id = h.connector.placed_orders.lock()[0].client_order_id.clone();
        let order_id = "1000".to_string();
        let fill = FillResponse {
            order_id,
            client_order_id: Some(client_order_id.clone()),
            ..fill_at(dec!(100.00), dec!(1.0))
        };
        h.trader
            .handle_fill_event(&client_order_id, fill)
            .await
            .unwrap();

        assert!(h.data.read().grid_levels[&0].is_filled);
        assert!(!h.trader.order_state.lock().is_pending());
    }

    // After a take-profit close, the open branch waits for price to fall
    // back under the close price before re-arming (long damping).
    #[tokio::test]
    async fn open_after_take_profit_waits_for_reentry() {
        let mut h = harness(InstType::Spot, Direction::Long);
        {
            let mut data = h.data.write();
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.update_level(1, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.apply_open_fill(0, &fill_at(dec!(100.00), dec!(1.0))).unwrap();
            data.grid_levels.get_mut(&1).unwrap().last_take_profit_price = Some(dec!(99.50));
        }

        // Above the last tp price: damped even though 99.60 is above trigger.
        feed(&mut h, &[dec!(100.50), dec!(99.60)]).await;
        assert_eq!(h.connector.placed_count(), 0);

        // Re-entry below 99.50, extreme at 99.20, bounce of ~0.2%: fires.
        feed(&mut h, &[dec!(99.20), dec!(99.40)]).await;
        assert_eq!(h.connector.placed_count(), 1);
    }

    // Short symmetry: trigger above the previous fill, extreme is the max,
    // and the rebound is a pullback downwards.
    #[tokio::test]
    async fn short_open_fires_on_pullback() {
        let mut h = harness(InstType::Futures, Direction::Short);
        {
            let mut data = h.data.write();
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.update_level(1, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.apply_open_fill(0, &fill_at(dec!(100.00), dec!(1.0))).unwrap();
        }

        // Trigger at 101.00; run up to 101.30, pull back to 101.09
        // ((101.30-101.09)/101.30 ~ 0.207% >= 0.2%).
        feed(&mut h, &[dec!(100.50), dec!(101.00), dec!(101.30)]).await;
        assert_eq!(h.connector.placed_count(), 0);
        feed(&mut h, &[dec!(101.09)]).await;
        assert_eq!(h.connector.placed_count(), 1);

        let placed = h.connector.placed_orders.lock()[0].clone();
        assert_eq!(placed.side, OrderSide::Sell);
        assert!(placed.base_size.is_some());
        assert_eq!(placed.quote_size, None);
    }

    // A stale tick (ts <= last update) is discarded entirely.
    #[tokio::test]
    async fn stale_ticks_do_not_drive_the_machine() {
        let mut h = harness(InstType::Spot, Direction::Long);
        h.data
            .write()
            .update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
            .unwrap();

        h.trader
            .process_tick(Ticker { last_price: dec!(100.00), ts_ms: 2_000 })
            .await
            .unwrap();
        assert_eq!(h.connector.placed_count(), 1);

        // Reset fill state; an older tick must not reopen.
        h.data.write().reset_level(0).unwrap();
        h.trader
            .process_tick(Ticker { last_price: dec!(90.00), ts_ms: 1_000 })
            .await
            .unwrap();
        assert_eq!(h.connector.placed_count(), 1);
    }

    // Reaching the overall take-profit after a close fill liquidates what
    // is left and closes the strategy.
    #[tokio::test]
    async fn overall_take_profit_triggers_liquidation() {
        let mut h = harness(InstType::Spot, Direction::Long);
        {
            let mut data = h.data.write();
            data.take_profit_config.enable(dec!(1.0));
            data.update_level(0, level_params(dec!(1.0), dec!(0.2), dec!(1.5), dec!(0.3), dec!(100)))
                .unwrap();
            data.apply_open_fill(0, &fill_at(dec!(100.00), dec!(1.0))).unwrap();
        }

        // Feed the close through the pushed-fill path.
        {
            let mut state = h.trader.order_state.lock();
            state.set_pending("grid_ab12cd34_0_1_tp".into(), 0, PendingKind::TakeProfit);
            state.pending_order_id = Some("77".into());
        }
        let fill = FillResponse {
            order_id: "77".into(),
            client_order_id: Some("grid_ab12cd34_0_1_tp".into()),
            fee: dec!(0.10),
            profit: Some(dec!(1.60)),
            ..fill_at(dec!(101.60), dec!(1.0))
        };
        h.trader
            .handle_fill_event("grid_ab12cd34_0_1_tp", fill)
            .await
            .unwrap();

        let data = h.data.read();
        assert_eq!(data.total_realized_profit, dec!(1.50));
        assert_eq!(data.status.to_string(), "Closed (take-profit)");
    }
}
