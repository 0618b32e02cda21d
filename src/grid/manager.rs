// =============================================================================
// Strategy Manager — owns every (GridData, GridTrader) pair
// =============================================================================
//
// The registry mutex guards structural changes only; per-strategy state sits
// behind its own lock and is never touched while the registry lock is held
// across an await. Ticker subscriptions are reference-counted per pair: the
// first strategy on a pair subscribes, the last one leaving unsubscribes.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine_config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{ExchangeConnector, FillResponse, SymbolConfig, Ticker};
use crate::grid::data::{GridData, LevelParams, RowSnapshot};
use crate::grid::trader::{GridTrader, OrderState};
use crate::types::{Direction, InstType, Operations, StrategyStatus};

/// Running-task bundle of a started strategy.
struct TraderRuntime {
    stop_tx: watch::Sender<bool>,
    tick_tx: broadcast::Sender<Ticker>,
    fill_tx: mpsc::Sender<(String, FillResponse)>,
    join: tokio::task::JoinHandle<()>,
    connector: Arc<dyn ExchangeConnector>,
}

/// Registry entry: strategy data plus, while running, its task handles.
struct StrategyHandle {
    data: Arc<RwLock<GridData>>,
    order_state: Arc<Mutex<OrderState>>,
    runtime: Option<TraderRuntime>,
}

/// Aggregate view over all running strategies.
#[derive(Debug, Clone)]
pub struct RunningStatistics {
    pub total_running: usize,
    pub pairs: Vec<String>,
    pub total_investment: Decimal,
    pub total_unrealized_profit: Decimal,
    pub last_update: chrono::DateTime<Utc>,
}

pub struct StrategyManager {
    inst_type: InstType,
    config: EngineConfig,
    events: EventBus,
    strategies: Mutex<HashMap<String, StrategyHandle>>,
    /// normalized pair symbol -> subscribed strategy uids
    subscriptions: Mutex<HashMap<String, HashSet<String>>>,
}

impl StrategyManager {
    pub fn new(inst_type: InstType, config: EngineConfig, events: EventBus) -> Self {
        Self {
            inst_type,
            config,
            events,
            strategies: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn inst_type(&self) -> InstType {
        self.inst_type
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn normalize_pair(pair: &str) -> String {
        pair.replace('/', "")
    }

    fn fresh_uid(existing: &HashMap<String, StrategyHandle>) -> String {
        loop {
            let uid = Uuid::new_v4().simple().to_string()[..8].to_string();
            if !existing.contains_key(&uid) {
                return uid;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Creation and restoration
    // -------------------------------------------------------------------------

    /// Register a new strategy with empty levels and default operations.
    /// Returns the fresh 8-char uid.
    pub fn create_strategy(
        &self,
        symbol_config: &SymbolConfig,
        exchange: &str,
        direction: Direction,
    ) -> String {
        let mut strategies = self.strategies.lock();
        let uid = Self::fresh_uid(&strategies);

        let mut data = GridData::new(&uid, &symbol_config.pair, exchange, self.inst_type);
        // Spot coerces to long inside set_direction; no levels are filled yet
        // so this cannot fail.
        data.set_direction(direction).expect("fresh strategy has no fills");
        data.symbol_config = Some(symbol_config.clone());

        strategies.insert(
            uid.clone(),
            StrategyHandle {
                data: Arc::new(RwLock::new(data)),
                order_state: Arc::new(Mutex::new(OrderState::default())),
                runtime: None,
            },
        );
        drop(strategies);

        info!(%uid, pair = %symbol_config.pair, "strategy created");
        self.events.publish(EngineEvent::StrategyAdded(uid.clone()));
        uid
    }

    /// Re-register a strategy loaded from the persisted state file.
    pub fn restore_strategy(&self, data: GridData) -> String {
        let uid = data.uid.clone();
        self.strategies.lock().insert(
            uid.clone(),
            StrategyHandle {
                data: Arc::new(RwLock::new(data)),
                order_state: Arc::new(Mutex::new(OrderState::default())),
                runtime: None,
            },
        );
        debug!(%uid, "strategy restored");
        uid
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn uids(&self) -> Vec<String> {
        self.strategies.lock().keys().cloned().collect()
    }

    pub fn running_uids(&self) -> Vec<String> {
        self.strategies
            .lock()
            .iter()
            .filter(|(_, handle)| handle.runtime.is_some())
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    pub fn is_running(&self, uid: &str) -> bool {
        self.strategies
            .lock()
            .get(uid)
            .map(|handle| handle.runtime.is_some())
            .unwrap_or(false)
    }

    fn data_arc(&self, uid: &str) -> EngineResult<Arc<RwLock<GridData>>> {
        self.strategies
            .lock()
            .get(uid)
            .map(|handle| handle.data.clone())
            .ok_or_else(|| EngineError::NotFound(uid.to_string()))
    }

    /// Run a closure against a strategy's data under its lock.
    pub fn with_data<R>(
        &self,
        uid: &str,
        f: impl FnOnce(&mut GridData) -> R,
    ) -> EngineResult<R> {
        let data = self.data_arc(uid)?;
        let mut guard = data.write();
        Ok(f(&mut guard))
    }

    pub fn row_snapshot(&self, uid: &str) -> EngineResult<RowSnapshot> {
        let data = self.data_arc(uid)?;
        let guard = data.read();
        Ok(guard.row_snapshot())
    }

    pub fn row_snapshots(&self) -> Vec<RowSnapshot> {
        let handles: Vec<Arc<RwLock<GridData>>> = self
            .strategies
            .lock()
            .values()
            .map(|handle| handle.data.clone())
            .collect();
        handles.iter().map(|data| data.read().row_snapshot()).collect()
    }

    /// Clone out every strategy's persistable state.
    pub fn export_strategies(&self) -> HashMap<String, GridData> {
        let handles: Vec<(String, Arc<RwLock<GridData>>)> = self
            .strategies
            .lock()
            .iter()
            .map(|(uid, handle)| (uid.clone(), handle.data.clone()))
            .collect();
        handles
            .into_iter()
            .map(|(uid, data)| (uid, data.read().clone()))
            .collect()
    }

    pub fn running_statistics(&self) -> RunningStatistics {
        let handles: Vec<(Arc<RwLock<GridData>>, bool)> = self
            .strategies
            .lock()
            .values()
            .map(|handle| (handle.data.clone(), handle.runtime.is_some()))
            .collect();

        let mut stats = RunningStatistics {
            total_running: 0,
            pairs: Vec::new(),
            total_investment: Decimal::ZERO,
            total_unrealized_profit: Decimal::ZERO,
            last_update: Utc::now(),
        };

        for (data, running) in handles {
            if !running {
                continue;
            }
            let guard = data.read();
            stats.total_running += 1;
            stats.pairs.push(guard.pair.clone());
            for level in guard.grid_levels.values().filter(|level| level.is_filled) {
                stats.total_investment += level.invest_amount;
            }
            stats.total_unrealized_profit += guard.calculate_position_metrics().unrealized_pnl;
        }
        stats
    }

    // -------------------------------------------------------------------------
    // Configuration passthroughs
    // -------------------------------------------------------------------------

    pub fn update_level(&self, uid: &str, level: u32, params: LevelParams) -> EngineResult<()> {
        self.with_data(uid, |data| data.update_level(level, params))??;
        self.events
            .publish(EngineEvent::StrategyUpdated(uid.to_string()));
        Ok(())
    }

    /// Reset a level's fill state. Refused while an order is pending on it.
    pub fn reset_level(&self, uid: &str, level: u32) -> EngineResult<()> {
        let (data, order_state) = {
            let strategies = self.strategies.lock();
            let handle = strategies
                .get(uid)
                .ok_or_else(|| EngineError::NotFound(uid.to_string()))?;
            (handle.data.clone(), handle.order_state.clone())
        };

        if order_state.lock().pending_level == Some(level) {
            return Err(EngineError::State(format!(
                "level {level} has a pending order"
            )));
        }
        data.write().reset_level(level)?;
        self.events
            .publish(EngineEvent::StrategyUpdated(uid.to_string()));
        Ok(())
    }

    pub fn set_direction(&self, uid: &str, direction: Direction) -> EngineResult<()> {
        self.with_data(uid, |data| data.set_direction(direction))??;
        self.events
            .publish(EngineEvent::StrategyUpdated(uid.to_string()));
        Ok(())
    }

    pub fn set_operations(&self, uid: &str, operations: Operations) -> EngineResult<()> {
        self.with_data(uid, |data| data.operations = operations)?;
        self.events
            .publish(EngineEvent::StrategyUpdated(uid.to_string()));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a strategy: cache symbol metadata, spawn the trader task, and
    /// subscribe to its pair (first strategy on the pair only).
    pub async fn start_strategy(
        &self,
        uid: &str,
        connector: Arc<dyn ExchangeConnector>,
    ) -> EngineResult<()> {
        let (data, order_state, pair, symbol) = {
            let strategies = self.strategies.lock();
            let handle = strategies
                .get(uid)
                .ok_or_else(|| EngineError::NotFound(uid.to_string()))?;
            if handle.runtime.is_some() {
                return Err(EngineError::Config(format!("strategy {uid} already running")));
            }
            let guard = handle.data.read();
            if guard.is_empty() {
                return Err(EngineError::Config(
                    "no grid levels configured; configure at least one level".into(),
                ));
            }
            (
                handle.data.clone(),
                handle.order_state.clone(),
                guard.pair.clone(),
                Self::normalize_pair(&guard.pair),
            )
        };

        // Fetch and cache immutable pair metadata before the task spawns.
        let symbol_config = connector.get_symbol_config(&symbol, self.inst_type).await?;
        data.write().symbol_config = Some(symbol_config);

        let (tick_tx, tick_rx) = broadcast::channel(self.config.tick_channel_capacity.max(1));
        let (fill_tx, fill_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);

        let trader = GridTrader::new(
            uid,
            data.clone(),
            connector.clone(),
            self.events.clone(),
            self.config.clone(),
            order_state,
        );
        let join = tokio::spawn(trader.run(tick_rx, fill_rx, stop_rx));

        {
            let mut strategies = self.strategies.lock();
            let handle = strategies
                .get_mut(uid)
                .ok_or_else(|| EngineError::NotFound(uid.to_string()))?;
            handle.runtime = Some(TraderRuntime {
                stop_tx,
                tick_tx,
                fill_tx,
                join,
                connector: connector.clone(),
            });
        }
        data.write().status = StrategyStatus::Running;

        // Reference-counted subscription: only the first strategy on a pair
        // reaches the connector.
        let first = {
            let mut subscriptions = self.subscriptions.lock();
            let entry = subscriptions.entry(symbol).or_default();
            entry.insert(uid.to_string());
            entry.len() == 1
        };
        if first {
            connector.subscribe_ticker(&pair, uid).await?;
        }

        info!(%uid, %pair, "strategy started");
        self.events
            .publish(EngineEvent::StrategyStarted(uid.to_string()));
        Ok(())
    }

    /// Stop a strategy. A no-op returning success when already stopped.
    /// Waits for the trader's graceful exit within the configured timeout,
    /// then forces it. All grid data is preserved.
    pub async fn stop_strategy(&self, uid: &str) -> EngineResult<()> {
        let (data, runtime, pair) = {
            let mut strategies = self.strategies.lock();
            let handle = strategies
                .get_mut(uid)
                .ok_or_else(|| EngineError::NotFound(uid.to_string()))?;
            let Some(runtime) = handle.runtime.take() else {
                debug!(%uid, "stop on stopped strategy is a no-op");
                return Ok(());
            };
            let pair = handle.data.read().pair.clone();
            (handle.data.clone(), runtime, pair)
        };

        let _ = runtime.stop_tx.send(true);
        let timeout = std::time::Duration::from_millis(self.config.stop_timeout_ms);
        let mut join = runtime.join;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(_) => debug!(%uid, "trader exited gracefully"),
            Err(_) => {
                warn!(%uid, "trader did not stop in time, aborting its task");
                join.abort();
            }
        }

        // Drop the pair subscription when this was the last strategy on it.
        let last = {
            let mut subscriptions = self.subscriptions.lock();
            let symbol = Self::normalize_pair(&pair);
            match subscriptions.get_mut(&symbol) {
                Some(entry) => {
                    entry.remove(uid);
                    if entry.is_empty() {
                        subscriptions.remove(&symbol);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last {
            if let Err(e) = runtime.connector.unsubscribe_ticker(&pair, uid).await {
                warn!(%uid, %pair, error = %e, "unsubscribe failed");
            }
        }

        data.write().status = StrategyStatus::Stopped;
        info!(%uid, "strategy stopped");
        self.events
            .publish(EngineEvent::StrategyStopped(uid.to_string()));
        Ok(())
    }

    pub async fn stop_all(&self) {
        for uid in self.running_uids() {
            if let Err(e) = self.stop_strategy(&uid).await {
                warn!(%uid, error = %e, "stop failed during shutdown");
            }
        }
    }

    /// Delete a stopped (or stopping) strategy. Refused while position is
    /// held; liquidate first. The second delete of the same uid reports
    /// NotFound.
    pub async fn delete_strategy(&self, uid: &str) -> EngineResult<()> {
        if self.is_running(uid) {
            self.stop_strategy(uid).await?;
        }

        {
            let strategies = self.strategies.lock();
            let handle = strategies
                .get(uid)
                .ok_or_else(|| EngineError::NotFound(uid.to_string()))?;
            if handle.data.read().has_filled_levels() {
                return Err(EngineError::Config(
                    "strategy holds position; close it before deleting".into(),
                ));
            }
            if handle.order_state.lock().is_pending() {
                return Err(EngineError::State(
                    "strategy has a pending order; resolve it before deleting".into(),
                ));
            }
        }

        self.strategies.lock().remove(uid);
        info!(%uid, "strategy deleted");
        self.events
            .publish(EngineEvent::StrategyDeleted(uid.to_string()));
        Ok(())
    }

    /// Manually liquidate a stopped strategy through a one-shot trader.
    pub async fn close_position(
        &self,
        uid: &str,
        connector: Arc<dyn ExchangeConnector>,
    ) -> EngineResult<()> {
        let (data, order_state) = {
            let strategies = self.strategies.lock();
            let handle = strategies
                .get(uid)
                .ok_or_else(|| EngineError::NotFound(uid.to_string()))?;
            if handle.runtime.is_some() {
                return Err(EngineError::Config(
                    "stop the strategy before closing its position".into(),
                ));
            }
            (handle.data.clone(), handle.order_state.clone())
        };

        if data.read().symbol_config.is_none() {
            let symbol = Self::normalize_pair(&data.read().pair);
            let symbol_config = connector.get_symbol_config(&symbol, self.inst_type).await?;
            data.write().symbol_config = Some(symbol_config);
        }

        let mut trader = GridTrader::new(
            uid,
            data,
            connector,
            self.events.clone(),
            self.config.clone(),
            order_state,
        );
        trader.close_all_positions("manual").await
    }

    // -------------------------------------------------------------------------
    // Market-data and fill routing
    // -------------------------------------------------------------------------

    /// Fan a tick out to every running strategy subscribed to the pair.
    /// Delivery order across strategies is unspecified.
    pub fn process_market_data(&self, pair: &str, ticker: Ticker) {
        let symbol = Self::normalize_pair(pair);
        let uids: Vec<String> = match self.subscriptions.lock().get(&symbol) {
            Some(entry) => entry.iter().cloned().collect(),
            None => return,
        };

        let strategies = self.strategies.lock();
        for uid in uids {
            let Some(handle) = strategies.get(&uid) else {
                continue;
            };
            let Some(runtime) = &handle.runtime else {
                continue;
            };
            // Bounded ring: the oldest tick is dropped on overflow and the
            // trader logs the lag.
            let _ = runtime.tick_tx.send(ticker);
        }
    }

    /// Route a pushed fill event to the strategy that owns the order,
    /// correlated through the "grid_<uid>_..." client order id.
    pub fn route_fill_event(&self, client_order_id: &str, fill: FillResponse) {
        let Some(uid) = Self::uid_from_client_order_id(client_order_id) else {
            debug!(client_order_id, "fill event without grid client id");
            return;
        };

        let fill_tx = {
            let strategies = self.strategies.lock();
            strategies
                .get(&uid)
                .and_then(|handle| handle.runtime.as_ref())
                .map(|runtime| runtime.fill_tx.clone())
        };
        match fill_tx {
            Some(tx) => {
                if tx.try_send((client_order_id.to_string(), fill)).is_err() {
                    warn!(%uid, client_order_id, "fill channel full, event dropped");
                }
            }
            None => debug!(%uid, client_order_id, "fill event for idle strategy"),
        }
    }

    fn uid_from_client_order_id(client_order_id: &str) -> Option<String> {
        let rest = client_order_id.strip_prefix("grid_")?;
        let uid = rest.split('_').next()?;
        (!uid.is_empty()).then(|| uid.to_string())
    }
}

impl std::fmt::Debug for StrategyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyManager")
            .field("inst_type", &self.inst_type)
            .field("strategies", &self.strategies.lock().len())
            .field("subscribed_pairs", &self.subscriptions.lock().len())
            .finish()
    }
}
