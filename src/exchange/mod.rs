// =============================================================================
// Exchange abstraction — the only surface the strategy engine consumes
// =============================================================================
//
// Connectors normalise REST + WebSocket access to one exchange: symbol
// metadata, order placement, fill queries, liquidation, and reference-counted
// ticker subscriptions. Market data and order updates are pushed out through
// broadcast streams; connection health through a watch channel.
// =============================================================================

pub mod bitget;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::types::{InstType, OrderSide, OrderType, PositionSide, TradeSide};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed connector failure. `Network` and `RateLimit` are transient and may
/// be retried within an operation's retry budget; the rest are permanent.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("network: {0}")]
    Network(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("rate limit: {0}")]
    RateLimit(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }
}

// ---------------------------------------------------------------------------
// Data transfer objects
// ---------------------------------------------------------------------------

/// Immutable per-pair metadata, fetched once at subscription time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolConfig {
    /// Exchange symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// Human pair representation, e.g. "BTC/USDT".
    pub pair: String,
    pub base_coin: String,
    pub quote_coin: String,
    /// Decimal places for base-coin amounts.
    pub base_precision: u32,
    /// Decimal places for quote-coin amounts.
    pub quote_precision: u32,
    /// Decimal places for prices.
    pub price_precision: u32,
    pub min_base_amount: Decimal,
    pub min_quote_amount: Decimal,
    pub inst_type: InstType,
}

/// Last-trade tick for one pair. The engine never sees raw exchange JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticker {
    pub last_price: Decimal,
    /// Exchange timestamp, milliseconds since the epoch.
    pub ts_ms: i64,
}

impl Ticker {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.ts_ms)
    }
}

/// Normalised order submission. Exactly one of `base_size` / `quote_size`
/// must be set.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub inst_type: InstType,
    pub symbol: String,
    pub pair: String,
    pub side: OrderSide,
    pub trade_side: TradeSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    /// Amount in base coin (futures orders, spot sells).
    pub base_size: Option<Decimal>,
    /// Amount in quote coin (spot market buys).
    pub quote_size: Option<Decimal>,
    /// Limit price; also attached to market orders for slippage reference.
    pub price: Option<Decimal>,
    pub client_order_id: String,
    pub reduce_only: bool,
    /// Futures margin parameters, passed through from user configuration.
    pub leverage: Option<u32>,
    pub margin_mode: Option<String>,
}

/// Result of a successful order submission. Market orders may carry
/// immediate fill data when the exchange reports it synchronously.
#[derive(Debug, Clone)]
pub struct OrderResponse {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub fill: Option<FillResponse>,
}

/// One fill of an order, normalised across spot and futures shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillResponse {
    pub symbol: String,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub trade_side: Option<TradeSide>,
    pub filled_price: Decimal,
    pub filled_base_amount: Decimal,
    pub filled_quote_value: Decimal,
    /// Always positive.
    pub fee: Decimal,
    /// Exchange-reported close profit (futures); spot closes report none.
    pub profit: Option<Decimal>,
    pub trade_time_ms: i64,
}

/// Connection state machine of a connector. Public and private legs come up
/// independently; `Ready` means both are up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    PublicUp,
    PrivateUp,
    Ready,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::PublicUp => write!(f, "PublicUp"),
            Self::PrivateUp => write!(f, "PrivateUp"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector trait
// ---------------------------------------------------------------------------

/// Capability set every exchange connector must provide. The engine consumes
/// only this surface; wire encodings stay inside the implementation.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Short exchange name, e.g. "bitget".
    fn exchange_name(&self) -> &str;

    /// Fetch immutable pair metadata. Idempotent and cacheable.
    async fn get_symbol_config(
        &self,
        symbol: &str,
        inst_type: InstType,
    ) -> Result<SymbolConfig, ExchangeError>;

    /// Submit a market or limit order.
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError>;

    /// Poll fills for an order. Eventually consistent: an empty result may
    /// mean "not yet visible".
    async fn get_fills(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Vec<FillResponse>, ExchangeError>;

    /// One-shot liquidation of all position for a side of a pair.
    async fn close_all_positions(
        &self,
        pair: &str,
        side: PositionSide,
    ) -> Result<OrderResponse, ExchangeError>;

    /// Reference-counted ticker subscription: one physical subscription per
    /// pair regardless of subscriber count.
    async fn subscribe_ticker(&self, pair: &str, subscriber_id: &str)
        -> Result<(), ExchangeError>;

    async fn unsubscribe_ticker(
        &self,
        pair: &str,
        subscriber_id: &str,
    ) -> Result<(), ExchangeError>;

    /// Stream of `(pair, ticker)` pushed by the public connection.
    fn ticks(&self) -> broadcast::Receiver<(String, Ticker)>;

    /// Stream of `(client_order_id, fill)` pushed by the private connection.
    fn fills(&self) -> broadcast::Receiver<(String, FillResponse)>;

    /// Connection health, updated by the connector's I/O tasks.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}
