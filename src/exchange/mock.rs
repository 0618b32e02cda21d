// =============================================================================
// Mock connector — scripted exchange used by the engine's tests
// =============================================================================
//
// Records every order, subscription, and liquidation call, and replays
// scripted fills and symbol configs. Fill behaviour per placed order comes
// from a FIFO plan: `Immediate` attaches the fill to the order response,
// `Polled` makes it visible through `get_fills`, `Silent` leaves the order
// unfilled entirely.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};

use crate::exchange::{
    ConnectionState, ExchangeConnector, ExchangeError, FillResponse, OrderRequest, OrderResponse,
    SymbolConfig, Ticker,
};
use crate::types::{InstType, PositionSide, TradeSide};

/// How the mock resolves the next placed order.
#[derive(Debug, Clone)]
pub enum FillPlan {
    /// Fill data returned synchronously with the order response.
    Immediate(FillTemplate),
    /// Fill only visible via `get_fills` polling.
    Polled(FillTemplate),
    /// No fill ever appears.
    Silent,
    /// Placement fails with this error.
    Fail(ExchangeError),
}

/// Partial fill description completed from the order request.
#[derive(Debug, Clone, Default)]
pub struct FillTemplate {
    /// Fill price; falls back to the request price.
    pub price: Option<Decimal>,
    pub fee: Decimal,
    pub profit: Option<Decimal>,
}

pub struct MockConnector {
    inst_type: InstType,
    symbol_configs: Mutex<HashMap<String, SymbolConfig>>,
    fill_plans: Mutex<VecDeque<FillPlan>>,
    fills_by_order: Mutex<HashMap<String, Vec<FillResponse>>>,
    next_order_id: AtomicU64,

    pub placed_orders: Mutex<Vec<OrderRequest>>,
    pub close_all_calls: Mutex<Vec<(String, PositionSide)>>,
    pub subscribe_calls: Mutex<Vec<(String, String)>>,
    pub unsubscribe_calls: Mutex<Vec<(String, String)>>,
    /// Next response to a close_all_positions call.
    pub close_all_plan: Mutex<Option<FillPlan>>,

    tick_tx: broadcast::Sender<(String, Ticker)>,
    fill_tx: broadcast::Sender<(String, FillResponse)>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MockConnector {
    pub fn new(inst_type: InstType) -> Self {
        let (tick_tx, _) = broadcast::channel(256);
        let (fill_tx, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Ready);
        Self {
            inst_type,
            symbol_configs: Mutex::new(HashMap::new()),
            fill_plans: Mutex::new(VecDeque::new()),
            fills_by_order: Mutex::new(HashMap::new()),
            next_order_id: AtomicU64::new(1000),
            placed_orders: Mutex::new(Vec::new()),
            close_all_calls: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            close_all_plan: Mutex::new(None),
            tick_tx,
            fill_tx,
            state_tx,
            state_rx,
        }
    }

    pub fn add_symbol(&self, config: SymbolConfig) {
        self.symbol_configs
            .lock()
            .insert(config.symbol.clone(), config);
    }

    pub fn plan_fill(&self, plan: FillPlan) {
        self.fill_plans.lock().push_back(plan);
    }

    pub fn push_tick(&self, pair: &str, ticker: Ticker) {
        let _ = self.tick_tx.send((pair.to_string(), ticker));
    }

    pub fn push_fill(&self, client_order_id: &str, fill: FillResponse) {
        let _ = self.fill_tx.send((client_order_id.to_string(), fill));
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn placed_count(&self) -> usize {
        self.placed_orders.lock().len()
    }

    fn build_fill(
        &self,
        request: &OrderRequest,
        order_id: &str,
        template: &FillTemplate,
    ) -> FillResponse {
        let price = template
            .price
            .or(request.price)
            .unwrap_or(Decimal::ZERO);
        let base_amount = match request.base_size {
            Some(base) => base,
            None => {
                let quote = request.quote_size.unwrap_or(Decimal::ZERO);
                if price.is_zero() {
                    Decimal::ZERO
                } else {
                    quote / price
                }
            }
        };

        FillResponse {
            symbol: request.symbol.clone(),
            order_id: order_id.to_string(),
            client_order_id: Some(request.client_order_id.clone()),
            trade_side: Some(request.trade_side),
            filled_price: price,
            filled_base_amount: base_amount,
            filled_quote_value: price * base_amount,
            fee: template.fee,
            profit: template.profit,
            trade_time_ms: 1_700_000_000_000 + self.next_order_id.load(Ordering::Relaxed) as i64,
        }
    }
}

#[async_trait]
impl ExchangeConnector for MockConnector {
    fn exchange_name(&self) -> &str {
        "mock"
    }

    async fn get_symbol_config(
        &self,
        symbol: &str,
        _inst_type: InstType,
    ) -> Result<SymbolConfig, ExchangeError> {
        self.symbol_configs
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidParam(format!("unknown symbol {symbol}")))
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
        let plan = self
            .fill_plans
            .lock()
            .pop_front()
            .unwrap_or(FillPlan::Immediate(FillTemplate::default()));

        if let FillPlan::Fail(error) = &plan {
            return Err(error.clone());
        }

        let order_id = self
            .next_order_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        self.placed_orders.lock().push(request.clone());

        let fill = match &plan {
            FillPlan::Immediate(template) => Some(self.build_fill(&request, &order_id, template)),
            FillPlan::Polled(template) => {
                let fill = self.build_fill(&request, &order_id, template);
                self.fills_by_order
                    .lock()
                    .insert(order_id.clone(), vec![fill]);
                None
            }
            FillPlan::Silent => None,
            FillPlan::Fail(_) => unreachable!("handled above"),
        };

        Ok(OrderResponse {
            order_id,
            client_order_id: Some(request.client_order_id),
            fill,
        })
    }

    async fn get_fills(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<Vec<FillResponse>, ExchangeError> {
        Ok(self
            .fills_by_order
            .lock()
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn close_all_positions(
        &self,
        pair: &str,
        side: PositionSide,
    ) -> Result<OrderResponse, ExchangeError> {
        self.close_all_calls
            .lock()
            .push((pair.to_string(), side));

        let plan = self
            .close_all_plan
            .lock()
            .take()
            .unwrap_or(FillPlan::Immediate(FillTemplate::default()));
        if let FillPlan::Fail(error) = &plan {
            return Err(error.clone());
        }

        let order_id = self
            .next_order_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let request = OrderRequest {
            inst_type: self.inst_type,
            symbol: pair.replace('/', ""),
            pair: pair.to_string(),
            side: crate::types::OrderSide::Sell,
            trade_side: TradeSide::Close,
            position_side: side,
            order_type: crate::types::OrderType::Market,
            base_size: None,
            quote_size: None,
            price: None,
            client_order_id: format!("grid_{order_id}_close_all"),
            reduce_only: true,
            leverage: None,
            margin_mode: None,
        };

        let fill = match &plan {
            FillPlan::Immediate(template) => Some(self.build_fill(&request, &order_id, template)),
            FillPlan::Polled(template) => {
                let fill = self.build_fill(&request, &order_id, template);
                self.fills_by_order
                    .lock()
                    .insert(order_id.clone(), vec![fill]);
                None
            }
            _ => None,
        };

        Ok(OrderResponse {
            order_id,
            client_order_id: Some(request.client_order_id),
            fill,
        })
    }

    async fn subscribe_ticker(
        &self,
        pair: &str,
        subscriber_id: &str,
    ) -> Result<(), ExchangeError> {
        self.subscribe_calls
            .lock()
            .push((pair.to_string(), subscriber_id.to_string()));
        Ok(())
    }

    async fn unsubscribe_ticker(
        &self,
        pair: &str,
        subscriber_id: &str,
    ) -> Result<(), ExchangeError> {
        self.unsubscribe_calls
            .lock()
            .push((pair.to_string(), subscriber_id.to_string()));
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

/// The SymbolConfig used throughout the engine tests (scenario values).
pub fn btc_usdt_spot() -> SymbolConfig {
    use std::str::FromStr;
    SymbolConfig {
        symbol: "BTCUSDT".into(),
        pair: "BTC/USDT".into(),
        base_coin: "BTC".into(),
        quote_coin: "USDT".into(),
        base_precision: 4,
        quote_precision: 2,
        price_precision: 2,
        min_base_amount: Decimal::from_str("0.0001").unwrap(),
        min_quote_amount: Decimal::from_str("5").unwrap(),
        inst_type: InstType::Spot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn streams_deliver_pushed_events() {
        let mock = MockConnector::new(InstType::Spot);
        let mut ticks = mock.ticks();
        let mut fills = mock.fills();

        mock.push_tick(
            "BTC/USDT",
            Ticker {
                last_price: dec!(100.00),
                ts_ms: 1_700_000_000_000,
            },
        );
        let (pair, ticker) = ticks.recv().await.unwrap();
        assert_eq!(pair, "BTC/USDT");
        assert_eq!(ticker.last_price, dec!(100.00));

        mock.push_fill(
            "grid_ab12cd34_0_1",
            FillResponse {
                symbol: "BTCUSDT".into(),
                order_id: "1".into(),
                client_order_id: Some("grid_ab12cd34_0_1".into()),
                trade_side: Some(TradeSide::Open),
                filled_price: dec!(100.00),
                filled_base_amount: dec!(1),
                filled_quote_value: dec!(100.00),
                fee: Decimal::ZERO,
                profit: None,
                trade_time_ms: 1_700_000_000_000,
            },
        );
        let (client_order_id, fill) = fills.recv().await.unwrap();
        assert_eq!(client_order_id, "grid_ab12cd34_0_1");
        assert_eq!(fill.order_id, "1");

        mock.set_connection_state(ConnectionState::Disconnected);
        assert_eq!(
            *mock.connection_state().borrow(),
            ConnectionState::Disconnected
        );
    }
}
