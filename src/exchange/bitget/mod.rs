// =============================================================================
// Bitget Connector — normalized REST + WebSocket access behind the engine's
// connector trait
// =============================================================================
//
// Owns the signed REST client and both WebSocket tasks. Ticker subscriptions
// are reference-counted per pair: the first subscriber triggers the physical
// subscribe, the last unsubscribe tears it down, and the WS task replays the
// physical set after every reconnect.
// =============================================================================

pub mod rest;
pub mod ws;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::exchange::{
    ConnectionState, ExchangeConnector, ExchangeError, FillResponse, OrderRequest, OrderResponse,
    SymbolConfig, Ticker,
};
use crate::types::{InstType, OrderSide, OrderType, PositionSide, TradeSide};

use rest::BitgetRest;
use ws::WsCommand;

/// Capacity of the tick / fill broadcast rings handed to subscribers.
const STREAM_CAPACITY: usize = 1024;

/// Tracks the public/private legs and derives the combined state.
struct LegState {
    public_up: bool,
    private_up: bool,
}

impl LegState {
    fn combined(&self) -> ConnectionState {
        match (self.public_up, self.private_up) {
            (true, true) => ConnectionState::Ready,
            (true, false) => ConnectionState::PublicUp,
            (false, true) => ConnectionState::PrivateUp,
            (false, false) => ConnectionState::Connecting,
        }
    }
}

/// Bitget implementation of [`ExchangeConnector`].
pub struct BitgetConnector {
    inst_type: InstType,
    rest: Arc<BitgetRest>,

    tick_tx: broadcast::Sender<(String, Ticker)>,
    fill_tx: broadcast::Sender<(String, FillResponse)>,
    state_rx: watch::Receiver<ConnectionState>,

    /// Commands into the public stream task.
    commands: mpsc::Sender<WsCommand>,

    /// pair-symbol -> subscriber ids; guards the physical subscription.
    subscribers: Mutex<HashMap<String, HashSet<String>>>,

    /// Symbol metadata cache (idempotent REST lookups).
    symbol_cache: Mutex<HashMap<String, SymbolConfig>>,

    _public_task: tokio::task::JoinHandle<()>,
    _private_task: tokio::task::JoinHandle<()>,
}

impl BitgetConnector {
    /// Build the connector and spawn its I/O tasks.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        inst_type: InstType,
    ) -> Self {
        let rest = Arc::new(BitgetRest::new(api_key, secret, passphrase));

        let (tick_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (fill_tx, _) = broadcast::channel(STREAM_CAPACITY);
        // Both legs report in as they connect; until the first callback the
        // connector is simply disconnected.
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::channel(64);

        let legs = Arc::new(Mutex::new(LegState {
            public_up: false,
            private_up: false,
        }));
        let state_tx = Arc::new(state_tx);

        let physical: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let public_up = {
            let legs = legs.clone();
            let state_tx = state_tx.clone();
            move |up: bool| {
                let mut guard = legs.lock();
                guard.public_up = up;
                let _ = state_tx.send(guard.combined());
            }
        };
        let private_up = {
            let legs = legs.clone();
            let state_tx = state_tx.clone();
            move |up: bool| {
                let mut guard = legs.lock();
                guard.private_up = up;
                let _ = state_tx.send(guard.combined());
            }
        };

        let public_task = ws::spawn_public_stream(
            inst_type,
            physical,
            command_rx,
            tick_tx.clone(),
            public_up,
        );
        let private_task =
            ws::spawn_private_stream(inst_type, rest.clone(), fill_tx.clone(), private_up);

        info!(%inst_type, "Bitget connector started");

        Self {
            inst_type,
            rest,
            tick_tx,
            fill_tx,
            state_rx,
            commands: command_tx,
            subscribers: Mutex::new(HashMap::new()),
            symbol_cache: Mutex::new(HashMap::new()),
            _public_task: public_task,
            _private_task: private_task,
        }
    }

    /// "BTC/USDT" -> "BTCUSDT".
    fn pair_to_symbol(pair: &str) -> String {
        pair.replace('/', "")
    }

    async fn send_command(&self, command: WsCommand) -> Result<(), ExchangeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ExchangeError::Network("public stream task is gone".into()))
    }
}

#[async_trait]
impl ExchangeConnector for BitgetConnector {
    fn exchange_name(&self) -> &str {
        "bitget"
    }

    async fn get_symbol_config(
        &self,
        symbol: &str,
        inst_type: InstType,
    ) -> Result<SymbolConfig, ExchangeError> {
        if let Some(cached) = self.symbol_cache.lock().get(symbol) {
            return Ok(cached.clone());
        }

        let config = self.rest.get_symbol_config(symbol, inst_type).await?;
        self.symbol_cache
            .lock()
            .insert(symbol.to_string(), config.clone());
        Ok(config)
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
        self.rest.place_order(request).await
    }

    async fn get_fills(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Vec<FillResponse>, ExchangeError> {
        self.rest.get_fills(symbol, order_id, self.inst_type).await
    }

    async fn close_all_positions(
        &self,
        pair: &str,
        side: PositionSide,
    ) -> Result<OrderResponse, ExchangeError> {
        let symbol = Self::pair_to_symbol(pair);

        match self.inst_type {
            InstType::Futures => self.rest.close_positions(&symbol, side).await,
            InstType::Spot => {
                // Spot has no one-shot close: sell the full available base
                // balance with a market order instead.
                let config = self.get_symbol_config(&symbol, InstType::Spot).await?;
                let available = self.rest.get_spot_balance(&config.base_coin).await?;
                let size = available.round_dp_with_strategy(
                    config.base_precision,
                    rust_decimal::RoundingStrategy::ToZero,
                );
                if size < config.min_base_amount {
                    return Err(ExchangeError::Rejected(format!(
                        "spot balance {size} {} below tradable minimum",
                        config.base_coin
                    )));
                }

                let request = OrderRequest {
                    inst_type: InstType::Spot,
                    symbol: symbol.clone(),
                    pair: pair.to_string(),
                    side: OrderSide::Sell,
                    trade_side: TradeSide::Close,
                    position_side: side,
                    order_type: OrderType::Market,
                    base_size: Some(size),
                    quote_size: None,
                    price: None,
                    client_order_id: format!(
                        "grid_{}_{}_close_all",
                        symbol,
                        BitgetRest::timestamp_ms()
                    ),
                    reduce_only: true,
                    leverage: None,
                    margin_mode: None,
                };
                debug!(%symbol, %size, "spot close-all as market sell");
                self.rest.place_order(request).await
            }
        }
    }

    async fn subscribe_ticker(
        &self,
        pair: &str,
        subscriber_id: &str,
    ) -> Result<(), ExchangeError> {
        let symbol = Self::pair_to_symbol(pair);

        let first = {
            let mut subs = self.subscribers.lock();
            let entry = subs.entry(symbol.clone()).or_default();
            entry.insert(subscriber_id.to_string());
            entry.len() == 1
        };

        if first {
            debug!(pair, symbol, "first subscriber, opening physical subscription");
            self.send_command(WsCommand::Subscribe(symbol)).await?;
        }
        Ok(())
    }

    async fn unsubscribe_ticker(
        &self,
        pair: &str,
        subscriber_id: &str,
    ) -> Result<(), ExchangeError> {
        let symbol = Self::pair_to_symbol(pair);

        let last = {
            let mut subs = self.subscribers.lock();
            match subs.get_mut(&symbol) {
                Some(entry) => {
                    entry.remove(subscriber_id);
                    if entry.is_empty() {
                        subs.remove(&symbol);
                        true
                    } else {
                        false
                    }
                }
                None => {
                    warn!(pair, subscriber_id, "unsubscribe without subscription");
                    false
                }
            }
        };

        if last {
            debug!(pair, symbol, "last subscriber gone, closing physical subscription");
            self.send_command(WsCommand::Unsubscribe(symbol)).await?;
        }
        Ok(())
    }

    fn ticks(&self) -> broadcast::Receiver<(String, Ticker)> {
        self.tick_tx.subscribe()
    }

    fn fills(&self) -> broadcast::Receiver<(String, FillResponse)> {
        self.fill_tx.subscribe()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

impl std::fmt::Debug for BitgetConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetConnector")
            .field("inst_type", &self.inst_type)
            .field("subscribed_pairs", &self.subscribers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_to_symbol_strips_separator() {
        assert_eq!(BitgetConnector::pair_to_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(BitgetConnector::pair_to_symbol("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn leg_state_combination() {
        let mut legs = LegState {
            public_up: false,
            private_up: false,
        };
        assert_eq!(legs.combined(), ConnectionState::Connecting);
        legs.public_up = true;
        assert_eq!(legs.combined(), ConnectionState::PublicUp);
        legs.private_up = true;
        assert_eq!(legs.combined(), ConnectionState::Ready);
        legs.public_up = false;
        assert_eq!(legs.combined(), ConnectionState::PrivateUp);
    }
}
