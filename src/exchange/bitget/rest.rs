// =============================================================================
// Bitget V2 REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key and passphrase are never logged or serialized.
// Bitget signs `timestamp + METHOD + path[?query] + body` and transmits the
// signature base64-encoded in the ACCESS-SIGN header.
// =============================================================================

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::{ExchangeError, FillResponse, OrderRequest, OrderResponse, SymbolConfig};
use crate::types::{InstType, OrderType, PositionSide, TradeSide};

type HmacSha256 = Hmac<Sha256>;

/// Product type sent with every futures request.
const PRODUCT_TYPE: &str = "USDT-FUTURES";

/// Bitget V2 REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BitgetRest {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Response envelope and payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: String,
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotSymbolEntry {
    symbol: String,
    base_coin: String,
    quote_coin: String,
    quantity_precision: String,
    quote_precision: String,
    price_precision: String,
    min_trade_amount: String,
    #[serde(rename = "minTradeUSDT")]
    min_trade_usdt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractEntry {
    symbol: String,
    base_coin: String,
    quote_coin: String,
    volume_place: String,
    price_place: String,
    min_trade_num: String,
    #[serde(rename = "minTradeUSDT")]
    min_trade_usdt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlacedOrder {
    order_id: String,
    #[serde(default)]
    client_oid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotFillEntry {
    order_id: String,
    #[serde(default)]
    client_oid: Option<String>,
    price_avg: String,
    size: String,
    amount: String,
    #[serde(default)]
    fee_detail: Option<SpotFeeDetail>,
    c_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotFeeDetail {
    total_fee: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MixFillPage {
    fill_list: Vec<MixFillEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MixFillEntry {
    order_id: String,
    #[serde(default)]
    client_oid: Option<String>,
    price: String,
    base_volume: String,
    quote_volume: String,
    #[serde(default)]
    profit: Option<String>,
    #[serde(default)]
    trade_side: Option<String>,
    #[serde(default)]
    fee_detail: Vec<MixFeeDetail>,
    c_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MixFeeDetail {
    total_fee: String,
}

impl BitgetRest {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BitgetRest`.
    ///
    /// # Arguments
    /// * `api_key`    — Bitget API key (sent as a header).
    /// * `secret`     — secret key used exclusively for HMAC signing.
    /// * `passphrase` — API passphrase (sent as a header).
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        default_headers.insert("locale", HeaderValue::from_static("en-US"));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BitgetRest initialised (base_url=https://api.bitget.com)");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: "https://api.bitget.com".to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce the base64 HMAC-SHA256 signature of a pre-hash string.
    fn sign(&self, prehash: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the signed request headers for one call.
    fn auth_headers(&self, method: &str, path_with_query: &str, body: &str) -> HeaderMap {
        let ts = Self::timestamp_ms().to_string();
        let prehash = format!("{ts}{method}{path_with_query}{body}");
        let signature = self.sign(&prehash);

        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        insert("ACCESS-KEY", &self.api_key);
        insert("ACCESS-SIGN", &signature);
        insert("ACCESS-TIMESTAMP", &ts);
        insert("ACCESS-PASSPHRASE", &self.passphrase);
        headers
    }

    // -------------------------------------------------------------------------
    // Transport helpers
    // -------------------------------------------------------------------------

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        let path_with_query = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        let url = format!("{}{}", self.base_url, path_with_query);
        let headers = self.auth_headers("GET", &path_with_query, "");

        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(format!("GET {path} failed: {e}")))?;

        Self::decode_response(path, resp).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let body_str = body.to_string();
        let headers = self.auth_headers("POST", path, &body_str);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body_str)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(format!("POST {path} failed: {e}")))?;

        Self::decode_response(path, resp).await
    }

    async fn decode_response<T: serde::de::DeserializeOwned>(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimit(format!("{path} returned 429")));
        }
        if status.is_server_error() {
            return Err(ExchangeError::Network(format!("{path} returned {status}")));
        }

        let envelope: ApiEnvelope<T> = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse {path} response: {e}")))?;

        if envelope.code != "00000" {
            return Err(Self::map_api_error(&envelope.code, &envelope.msg));
        }

        envelope
            .data
            .ok_or_else(|| ExchangeError::Other(format!("{path} response missing data")))
    }

    /// Map a non-success Bitget code onto the typed error taxonomy.
    fn map_api_error(code: &str, msg: &str) -> ExchangeError {
        match code {
            // Signature, key, passphrase, timestamp-window failures.
            "40001" | "40002" | "40003" | "40005" | "40006" | "40009" | "40037" => {
                ExchangeError::Auth(format!("{code}: {msg}"))
            }
            // Request throttling.
            "429" | "30001" | "30002" | "30007" => ExchangeError::RateLimit(format!("{code}: {msg}")),
            // Malformed or out-of-range parameters.
            c if c.starts_with("400") => ExchangeError::InvalidParam(format!("{code}: {msg}")),
            // Business rejections (insufficient balance, closed market, ...).
            c if c.starts_with("43") || c.starts_with("45") => {
                ExchangeError::Rejected(format!("{code}: {msg}"))
            }
            _ => ExchangeError::Other(format!("{code}: {msg}")),
        }
    }

    fn dec(raw: &str, what: &str) -> Result<Decimal, ExchangeError> {
        Decimal::from_str(raw)
            .map_err(|e| ExchangeError::Other(format!("failed to parse {what} '{raw}': {e}")))
    }

    fn prec(raw: &str, what: &str) -> Result<u32, ExchangeError> {
        raw.parse::<u32>()
            .map_err(|e| ExchangeError::Other(format!("failed to parse {what} '{raw}': {e}")))
    }

    // -------------------------------------------------------------------------
    // Symbol metadata
    // -------------------------------------------------------------------------

    /// Fetch pair metadata. Spot reads `/api/v2/spot/public/symbols`, futures
    /// `/api/v2/mix/market/contracts`.
    #[instrument(skip(self), name = "bitget::get_symbol_config")]
    pub async fn get_symbol_config(
        &self,
        symbol: &str,
        inst_type: InstType,
    ) -> Result<SymbolConfig, ExchangeError> {
        match inst_type {
            InstType::Spot => {
                let entries: Vec<SpotSymbolEntry> = self
                    .get_json("/api/v2/spot/public/symbols", &format!("symbol={symbol}"))
                    .await?;
                let entry = entries
                    .into_iter()
                    .find(|e| e.symbol == symbol)
                    .ok_or_else(|| {
                        ExchangeError::InvalidParam(format!("unknown spot symbol {symbol}"))
                    })?;

                debug!(symbol, "spot symbol config retrieved");
                Ok(SymbolConfig {
                    pair: format!("{}/{}", entry.base_coin, entry.quote_coin),
                    symbol: entry.symbol,
                    base_precision: Self::prec(&entry.quantity_precision, "quantityPrecision")?,
                    quote_precision: Self::prec(&entry.quote_precision, "quotePrecision")?,
                    price_precision: Self::prec(&entry.price_precision, "pricePrecision")?,
                    min_base_amount: Self::dec(&entry.min_trade_amount, "minTradeAmount")?,
                    min_quote_amount: Self::dec(&entry.min_trade_usdt, "minTradeUSDT")?,
                    base_coin: entry.base_coin,
                    quote_coin: entry.quote_coin,
                    inst_type,
                })
            }
            InstType::Futures => {
                let entries: Vec<ContractEntry> = self
                    .get_json(
                        "/api/v2/mix/market/contracts",
                        &format!("productType={PRODUCT_TYPE}&symbol={symbol}"),
                    )
                    .await?;
                let entry = entries
                    .into_iter()
                    .find(|e| e.symbol == symbol)
                    .ok_or_else(|| {
                        ExchangeError::InvalidParam(format!("unknown contract {symbol}"))
                    })?;

                let volume_place = Self::prec(&entry.volume_place, "volumePlace")?;
                debug!(symbol, "contract config retrieved");
                Ok(SymbolConfig {
                    pair: format!("{}/{}", entry.base_coin, entry.quote_coin),
                    symbol: entry.symbol,
                    base_precision: volume_place,
                    // Contracts size in base units; quote amounts keep the
                    // same granularity as prices.
                    quote_precision: Self::prec(&entry.price_place, "pricePlace")?,
                    price_precision: Self::prec(&entry.price_place, "pricePlace")?,
                    min_base_amount: Self::dec(&entry.min_trade_num, "minTradeNum")?,
                    min_quote_amount: Self::dec(&entry.min_trade_usdt, "minTradeUSDT")?,
                    base_coin: entry.base_coin,
                    quote_coin: entry.quote_coin,
                    inst_type,
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit an order. Spot market buys size in quote coin, spot sells and
    /// all futures orders size in base coin.
    #[instrument(
        skip(self, request),
        fields(symbol = %request.symbol, side = %request.side, trade_side = %request.trade_side),
        name = "bitget::place_order"
    )]
    pub async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
        let size = match (request.base_size, request.quote_size) {
            (Some(base), None) => base,
            (None, Some(quote)) => quote,
            _ => {
                return Err(ExchangeError::InvalidParam(
                    "exactly one of base_size / quote_size must be set".into(),
                ))
            }
        };

        let placed: PlacedOrder = match request.inst_type {
            InstType::Spot => {
                let mut body = serde_json::json!({
                    "symbol": request.symbol,
                    "side": request.side.to_string(),
                    "orderType": request.order_type.to_string(),
                    "force": "gtc",
                    "size": size.to_string(),
                    "clientOid": request.client_order_id,
                });
                if request.order_type == OrderType::Limit {
                    let price = request.price.ok_or_else(|| {
                        ExchangeError::InvalidParam("limit order without price".into())
                    })?;
                    body["price"] = serde_json::Value::String(price.to_string());
                }
                self.post_json("/api/v2/spot/trade/place-order", &body).await?
            }
            InstType::Futures => {
                let mut body = serde_json::json!({
                    "symbol": request.symbol,
                    "productType": PRODUCT_TYPE,
                    "marginMode": request.margin_mode.as_deref().unwrap_or("crossed"),
                    "marginCoin": "USDT",
                    "size": size.to_string(),
                    "side": request.side.to_string(),
                    "tradeSide": request.trade_side.to_string(),
                    "orderType": request.order_type.to_string(),
                    "clientOid": request.client_order_id,
                    "reduceOnly": if request.reduce_only { "YES" } else { "NO" },
                });
                if request.order_type == OrderType::Limit {
                    let price = request.price.ok_or_else(|| {
                        ExchangeError::InvalidParam("limit order without price".into())
                    })?;
                    body["price"] = serde_json::Value::String(price.to_string());
                }
                if let Some(leverage) = request.leverage {
                    body["leverage"] = serde_json::Value::String(leverage.to_string());
                }
                self.post_json("/api/v2/mix/order/place-order", &body).await?
            }
        };

        debug!(order_id = %placed.order_id, "order placed");
        Ok(OrderResponse {
            order_id: placed.order_id,
            client_order_id: placed.client_oid.or(Some(request.client_order_id)),
            fill: None,
        })
    }

    /// One-shot liquidation of a futures position side.
    #[instrument(skip(self), name = "bitget::close_positions")]
    pub async fn close_positions(
        &self,
        symbol: &str,
        hold_side: PositionSide,
    ) -> Result<OrderResponse, ExchangeError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "holdSide": hold_side.to_string(),
        });

        // close-positions returns successList/failureList; the first success
        // carries the order id.
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ClosePage {
            success_list: Vec<PlacedOrder>,
            #[serde(default)]
            failure_list: Vec<serde_json::Value>,
        }

        let page: ClosePage = self.post_json("/api/v2/mix/order/close-positions", &body).await?;
        if !page.failure_list.is_empty() {
            warn!(symbol, failures = page.failure_list.len(), "partial close-positions failure");
        }
        let placed = page.success_list.into_iter().next().ok_or_else(|| {
            ExchangeError::Rejected(format!("close-positions placed no order for {symbol}"))
        })?;

        Ok(OrderResponse {
            order_id: placed.order_id,
            client_order_id: placed.client_oid,
            fill: None,
        })
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// Available spot balance for `coin`. Unknown coins report zero.
    #[instrument(skip(self), name = "bitget::get_spot_balance")]
    pub async fn get_spot_balance(&self, coin: &str) -> Result<Decimal, ExchangeError> {
        #[derive(Debug, Deserialize)]
        struct AssetEntry {
            coin: String,
            available: String,
        }

        let entries: Vec<AssetEntry> = self
            .get_json("/api/v2/spot/account/assets", &format!("coin={coin}"))
            .await?;

        match entries.into_iter().find(|e| e.coin == coin) {
            Some(entry) => Self::dec(&entry.available, "available"),
            None => {
                warn!(coin, "coin not found in assets, reporting zero balance");
                Ok(Decimal::ZERO)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Fetch the fills of one order, normalising the divergent spot and
    /// futures payload shapes.
    #[instrument(skip(self), name = "bitget::get_fills")]
    pub async fn get_fills(
        &self,
        symbol: &str,
        order_id: &str,
        inst_type: InstType,
    ) -> Result<Vec<FillResponse>, ExchangeError> {
        match inst_type {
            InstType::Spot => {
                let entries: Vec<SpotFillEntry> = self
                    .get_json(
                        "/api/v2/spot/trade/fills",
                        &format!("symbol={symbol}&orderId={order_id}"),
                    )
                    .await?;

                entries
                    .into_iter()
                    .map(|e| {
                        let fee = match &e.fee_detail {
                            Some(d) => Self::dec(&d.total_fee, "totalFee")?.abs(),
                            None => Decimal::ZERO,
                        };
                        Ok(FillResponse {
                            symbol: symbol.to_string(),
                            order_id: e.order_id,
                            client_order_id: e.client_oid,
                            trade_side: None,
                            filled_price: Self::dec(&e.price_avg, "priceAvg")?,
                            filled_base_amount: Self::dec(&e.size, "size")?,
                            filled_quote_value: Self::dec(&e.amount, "amount")?,
                            fee,
                            profit: None,
                            trade_time_ms: e.c_time.parse().unwrap_or(0),
                        })
                    })
                    .collect()
            }
            InstType::Futures => {
                let page: MixFillPage = self
                    .get_json(
                        "/api/v2/mix/order/fills",
                        &format!("symbol={symbol}&productType={PRODUCT_TYPE}&orderId={order_id}"),
                    )
                    .await?;

                page.fill_list
                    .into_iter()
                    .map(|e| {
                        let fee = e
                            .fee_detail
                            .first()
                            .map(|d| Self::dec(&d.total_fee, "totalFee").map(|f| f.abs()))
                            .transpose()?
                            .unwrap_or(Decimal::ZERO);
                        let trade_side = match e.trade_side.as_deref() {
                            Some("open") => Some(TradeSide::Open),
                            Some("close") => Some(TradeSide::Close),
                            _ => None,
                        };
                        Ok(FillResponse {
                            symbol: symbol.to_string(),
                            order_id: e.order_id,
                            client_order_id: e.client_oid,
                            trade_side,
                            filled_price: Self::dec(&e.price, "price")?,
                            filled_base_amount: Self::dec(&e.base_volume, "baseVolume")?,
                            filled_quote_value: Self::dec(&e.quote_volume, "quoteVolume")?,
                            fee,
                            profit: e
                                .profit
                                .as_deref()
                                .map(|p| Self::dec(p, "profit"))
                                .transpose()?,
                            trade_time_ms: e.c_time.parse().unwrap_or(0),
                        })
                    })
                    .collect()
            }
        }
    }

    /// Expose the signer to the WebSocket client for the login frame.
    pub(crate) fn ws_login_signature(&self, timestamp_secs: u64) -> String {
        self.sign(&format!("{timestamp_secs}GET/user/verify"))
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn passphrase(&self) -> &str {
        &self.passphrase
    }
}

impl std::fmt::Debug for BitgetRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetRest")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_mapping() {
        assert!(matches!(
            BitgetRest::map_api_error("40001", "invalid key"),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            BitgetRest::map_api_error("30001", "too many requests"),
            ExchangeError::RateLimit(_)
        ));
        assert!(matches!(
            BitgetRest::map_api_error("40099", "bad size"),
            ExchangeError::InvalidParam(_)
        ));
        assert!(matches!(
            BitgetRest::map_api_error("43012", "insufficient balance"),
            ExchangeError::Rejected(_)
        ));
    }

    #[test]
    fn signature_is_deterministic_base64() {
        let rest = BitgetRest::new("key", "secret", "pass");
        let a = rest.sign("1700000000000GET/api/v2/spot/trade/fills");
        let b = rest.sign("1700000000000GET/api/v2/spot/trade/fills");
        assert_eq!(a, b);
        assert!(BASE64.decode(&a).is_ok());
    }

    #[test]
    fn spot_fill_payload_parses() {
        let raw = r#"{
            "orderId": "123", "clientOid": "grid_ab_0_1",
            "priceAvg": "99.00", "size": "1.0101", "amount": "99.9999",
            "feeDetail": { "totalFee": "-0.10" }, "cTime": "1700000000000"
        }"#;
        let entry: SpotFillEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.order_id, "123");
        assert_eq!(entry.fee_detail.unwrap().total_fee, "-0.10");
    }

    #[test]
    fn mix_fill_page_parses() {
        let raw = r#"{
            "fillList": [{
                "orderId": "9", "price": "101.60", "baseVolume": "1.0000",
                "quoteVolume": "101.60", "profit": "1.60", "tradeSide": "close",
                "feeDetail": [{ "totalFee": "0.10" }], "cTime": "1700000000000"
            }]
        }"#;
        let page: MixFillPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.fill_list.len(), 1);
        assert_eq!(page.fill_list[0].profit.as_deref(), Some("1.60"));
    }
}
