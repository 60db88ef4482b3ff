//! Signed REST client for Binance-shaped spot and futures venues.
//!
//! Queries are HMAC-SHA256 signed (`query + &signature=<hex>`), the API key
//! travels in `X-MBX-APIKEY`, and every request carries the sync timeout.
//! Responses are parsed leniently: the venue moves fields between spellings
//! often enough that strict structs would be the fragile choice.

use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::domain::{OrderState, Side};

use super::rules::unit_from_precision;
use super::{ExchangeError, ExchangeKind, ExchangeOrder, FeeAccounting, TradingRules};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

pub fn base_url(kind: ExchangeKind, testnet: bool) -> &'static str {
    match (kind, testnet) {
        (ExchangeKind::Futures, false) => "https://fapi.binance.com",
        (ExchangeKind::Futures, true) => "https://testnet.binancefuture.com",
        (_, false) => "https://api.binance.com",
        (_, true) => "https://testnet.binance.vision",
    }
}

pub fn ws_url(kind: ExchangeKind, testnet: bool) -> &'static str {
    match (kind, testnet) {
        (ExchangeKind::Futures, false) => "wss://fstream.binance.com",
        (ExchangeKind::Futures, true) => "wss://stream.binancefuture.com",
        (_, false) => "wss://stream.binance.com:9443",
        (_, true) => "wss://testnet.binance.vision",
    }
}

/// Order WebSocket API endpoint (request/response, not a data stream).
pub fn ws_api_url(kind: ExchangeKind, testnet: bool) -> &'static str {
    match (kind, testnet) {
        (ExchangeKind::Futures, false) => "wss://ws-fapi.binance.com/ws-fapi/v1",
        (ExchangeKind::Futures, true) => "wss://testnet.binancefuture.com/ws-fapi/v1",
        (_, false) => "wss://ws-api.binance.com:443/ws-api/v3",
        (_, true) => "wss://testnet.binance.vision/ws-api/v3",
    }
}

#[derive(Clone)]
pub struct SpotRestClient {
    http: Client,
    base: String,
    api_key: String,
    api_secret: String,
    kind: ExchangeKind,
}

impl SpotRestClient {
    pub fn new(
        kind: ExchangeKind,
        api_key: String,
        api_secret: String,
        testnet: bool,
        sync_timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(sync_timeout)
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base: base_url(kind, testnet).to_string(),
            api_key,
            api_secret,
            kind,
        })
    }

    fn prefix(&self) -> &'static str {
        match self.kind {
            ExchangeKind::Futures => "/fapi/v1",
            _ => "/api/v3",
        }
    }

    pub fn supports_batch_orders(&self) -> bool {
        self.kind == ExchangeKind::Futures
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Venue(format!("bad api secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign a parameter set for the order WebSocket API: apiKey and
    /// timestamp added, keys sorted, HMAC signature appended. The venue
    /// signs the alphabetically-ordered query string regardless of the
    /// order the params travel in.
    pub(crate) fn signed_ws_params(
        &self,
        params: &[(String, String)],
    ) -> Result<serde_json::Map<String, Value>, ExchangeError> {
        let mut all: Vec<(String, String)> = params.to_vec();
        all.push(("apiKey".to_string(), self.api_key.clone()));
        all.push((
            "timestamp".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ));
        all.sort_by(|a, b| a.0.cmp(&b.0));

        let query: String = all
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query)?;

        let mut map = serde_json::Map::new();
        for (key, value) in all {
            map.insert(key, Value::String(value));
        }
        map.insert("signature".to_string(), Value::String(signature));
        Ok(map)
    }

    fn signed_query(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let suffix = format!(
            "{}timestamp={}&recvWindow={RECV_WINDOW_MS}",
            if query.is_empty() { "" } else { "&" },
            chrono::Utc::now().timestamp_millis()
        );
        query.push_str(&suffix);
        let signature = self.sign(&query)?;
        Ok(format!("{query}&signature={signature}"))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<Value, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{path}", self.base)
        } else {
            format!("{}{path}?{query}", self.base)
        };
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if ExchangeError::text_means_not_found(&body) {
                return Err(ExchangeError::OrderNotFound(body));
            }
            if status.as_u16() == 429 || status.as_u16() == 418 {
                return Err(ExchangeError::RateLimited(body));
            }
            return Err(ExchangeError::Venue(format!("{status}: {body}")));
        }
        serde_json::from_str(&body).map_err(|e| ExchangeError::Venue(format!("bad json: {e}")))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let query = self.signed_query(params)?;
        self.request(method, path, &query).await
    }

    // ==================== market data ====================

    /// Best bid/ask midpoint.
    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let path = format!("{}/ticker/bookTicker", self.prefix());
        let query = format!("symbol={symbol}");
        let value = self.request(reqwest::Method::GET, &path, &query).await?;
        let bid = value_f64(&value, &["bidPrice"]);
        let ask = value_f64(&value, &["askPrice"]);
        if bid > 0.0 && ask > 0.0 {
            Ok((bid + ask) / 2.0)
        } else {
            Err(ExchangeError::Venue(format!("bad ticker for {symbol}: {value}")))
        }
    }

    pub async fn trading_rules(&self, symbol: &str) -> Result<TradingRules, ExchangeError> {
        let path = format!("{}/exchangeInfo", self.prefix());
        let query = format!("symbol={symbol}");
        let value = self.request(reqwest::Method::GET, &path, &query).await?;

        let market = value["symbols"]
            .as_array()
            .and_then(|symbols| {
                symbols
                    .iter()
                    .find(|s| s["symbol"].as_str() == Some(symbol))
            })
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;

        let mut tick_size = 0.0;
        let mut step_size = 0.0;
        let mut min_notional = 0.0;
        if let Some(filters) = market["filters"].as_array() {
            for filter in filters {
                match filter["filterType"].as_str() {
                    Some("PRICE_FILTER") => tick_size = value_f64(filter, &["tickSize"]),
                    Some("LOT_SIZE") => step_size = value_f64(filter, &["stepSize"]),
                    Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                        min_notional = value_f64(filter, &["minNotional", "notional"])
                    }
                    _ => {}
                }
            }
        }
        if tick_size <= 0.0 {
            let (unit, _) = unit_from_precision(value_f64(market, &["pricePrecision"]).max(8.0));
            tick_size = unit;
        }
        if step_size <= 0.0 {
            let (unit, _) = unit_from_precision(value_f64(market, &["quantityPrecision"]).max(8.0));
            step_size = unit;
        }

        Ok(TradingRules {
            tick_size,
            price_decimals: unit_from_precision(tick_size).1,
            step_size,
            qty_decimals: unit_from_precision(step_size).1,
            min_notional,
        })
    }

    /// Taker fee from the authenticated fee endpoint.
    pub async fn taker_fee(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let (path, taker_key): (String, &str) = match self.kind {
            ExchangeKind::Futures => (
                "/fapi/v1/commissionRate".to_string(),
                "takerCommissionRate",
            ),
            _ => ("/sapi/v1/asset/tradeFee".to_string(), "takerCommission"),
        };
        let value = self
            .signed_request(reqwest::Method::GET, &path, &[("symbol", symbol.to_string())])
            .await?;

        // The spot endpoint wraps per-symbol entries in an array.
        let entry = match value.as_array() {
            Some(list) => list
                .iter()
                .find(|e| e["symbol"].as_str() == Some(symbol))
                .cloned()
                .unwrap_or(Value::Null),
            None => value,
        };
        let taker = value_f64(&entry, &[taker_key, "taker"]);
        if taker > 0.0 {
            Ok(taker)
        } else {
            Err(ExchangeError::Venue(format!("no taker fee for {symbol}")))
        }
    }

    // ==================== orders ====================

    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        quantity: f64,
        params: &std::collections::BTreeMap<String, String>,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut query_params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_uppercase()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", trim_float(quantity)),
            ("price", trim_float(price)),
        ];
        for (key, value) in self.forwardable_params(params) {
            query_params.push((key, value));
        }

        let path = format!("{}/order", self.prefix());
        let value = self
            .signed_request(reqwest::Method::POST, &path, &query_params)
            .await?;
        normalize_order(&value, symbol)
            .ok_or_else(|| ExchangeError::Venue(format!("order response missing id: {value}")))
    }

    /// Futures batch create: up to 5 orders per call.
    pub async fn place_batch(
        &self,
        symbol: &str,
        orders: &[(Side, f64, f64, std::collections::BTreeMap<String, String>)],
    ) -> Result<Vec<Value>, ExchangeError> {
        let batch: Vec<Value> = orders
            .iter()
            .map(|(side, price, quantity, params)| {
                let mut obj = serde_json::json!({
                    "symbol": symbol,
                    "side": side.as_str().to_uppercase(),
                    "type": "LIMIT",
                    "timeInForce": "GTC",
                    "quantity": trim_float(*quantity),
                    "price": trim_float(*price),
                });
                for (key, value) in self.forwardable_params(params) {
                    obj[key] = Value::String(value);
                }
                obj
            })
            .collect();

        let encoded = serde_json::to_string(&batch)
            .map_err(|e| ExchangeError::Venue(format!("encode batch: {e}")))?;
        let value = self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/batchOrders",
                &[("batchOrders", urlencode(&encoded))],
            )
            .await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| ExchangeError::Venue(format!("unexpected batch response: {value}")))
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let path = format!("{}/order", self.prefix());
        self.signed_request(
            reqwest::Method::DELETE,
            &path,
            &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
        )
        .await?;
        Ok(())
    }

    /// Futures batch cancel, symmetric to [`Self::place_batch`]. One result
    /// element per id; rejected elements carry a code/msg pair.
    pub async fn cancel_batch(
        &self,
        symbol: &str,
        order_ids: &[String],
    ) -> Result<Vec<Value>, ExchangeError> {
        let encoded = serde_json::to_string(&order_id_list(order_ids))
            .map_err(|e| ExchangeError::Venue(format!("encode cancel batch: {e}")))?;
        let value = self
            .signed_request(
                reqwest::Method::DELETE,
                "/fapi/v1/batchOrders",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderIdList", urlencode(&encoded)),
                ],
            )
            .await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| ExchangeError::Venue(format!("unexpected batch cancel response: {value}")))
    }

    /// Native amend: spot cancel-replace, futures order modify. Returns the
    /// replacing order.
    pub async fn edit_order(
        &self,
        symbol: &str,
        order_id: &str,
        side: Side,
        price: f64,
        quantity: f64,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let value = match self.kind {
            ExchangeKind::Futures => {
                self.signed_request(
                    reqwest::Method::PUT,
                    "/fapi/v1/order",
                    &[
                        ("symbol", symbol.to_string()),
                        ("orderId", order_id.to_string()),
                        ("side", side.as_str().to_uppercase()),
                        ("quantity", trim_float(quantity)),
                        ("price", trim_float(price)),
                    ],
                )
                .await?
            }
            _ => {
                let value = self
                    .signed_request(
                        reqwest::Method::POST,
                        "/api/v3/order/cancelReplace",
                        &[
                            ("symbol", symbol.to_string()),
                            ("cancelOrderId", order_id.to_string()),
                            ("cancelReplaceMode", "STOP_ON_FAILURE".to_string()),
                            ("side", side.as_str().to_uppercase()),
                            ("type", "LIMIT".to_string()),
                            ("timeInForce", "GTC".to_string()),
                            ("quantity", trim_float(quantity)),
                            ("price", trim_float(price)),
                        ],
                    )
                    .await?;
                value.get("newOrderResponse").cloned().unwrap_or(value)
            }
        };
        normalize_order(&value, symbol)
            .ok_or_else(|| ExchangeError::Venue(format!("edit response missing id: {value}")))
    }

    pub async fn get_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        let path = format!("{}/order", self.prefix());
        match self
            .signed_request(
                reqwest::Method::GET,
                &path,
                &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            )
            .await
        {
            Ok(value) => Ok(normalize_order(&value, symbol)),
            Err(ExchangeError::OrderNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let path = format!("{}/openOrders", self.prefix());
        let value = self
            .signed_request(reqwest::Method::GET, &path, &[("symbol", symbol.to_string())])
            .await?;
        let orders = value
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|raw| normalize_order(raw, symbol))
                    .filter(|o| o.is_active())
                    .collect()
            })
            .unwrap_or_default();
        Ok(orders)
    }

    /// Hedge-mode (dual-side positions) for the bilateral strategy; the
    /// venue answers with an error code when it is already set.
    pub async fn ensure_hedge_mode(&self) -> Result<(), ExchangeError> {
        if self.kind != ExchangeKind::Futures {
            return Ok(());
        }
        match self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/positionSide/dual",
                &[("dualSidePosition", "true".to_string())],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::Venue(msg))
                if msg.contains("-4059") || msg.contains("No need to change") =>
            {
                debug!("hedge mode already enabled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ==================== user stream ====================

    pub async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let path = match self.kind {
            ExchangeKind::Futures => "/fapi/v1/listenKey".to_string(),
            _ => "/api/v3/userDataStream".to_string(),
        };
        let value = self.request(reqwest::Method::POST, &path, "").await?;
        value["listenKey"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Venue(format!("no listenKey in {value}")))
    }

    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        let (path, query) = match self.kind {
            ExchangeKind::Futures => ("/fapi/v1/listenKey".to_string(), String::new()),
            _ => (
                "/api/v3/userDataStream".to_string(),
                format!("listenKey={listen_key}"),
            ),
        };
        self.request(reqwest::Method::PUT, &path, &query).await?;
        Ok(())
    }

    /// Futures forwards position-side parameters; spot drops them.
    pub(crate) fn forwardable_params<'a>(
        &self,
        params: &'a std::collections::BTreeMap<String, String>,
    ) -> Vec<(&'a str, String)> {
        if self.kind != ExchangeKind::Futures {
            return Vec::new();
        }
        params
            .iter()
            .filter(|(key, _)| matches!(key.as_str(), "positionSide" | "reduceOnly"))
            // Hedge mode rejects reduceOnly alongside an explicit positionSide.
            .filter(|(key, _)| !(key.as_str() == "reduceOnly" && params.contains_key("positionSide")))
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect()
    }
}

// ==================== response normalization ====================

/// Convert a raw venue order payload into the uniform shape. Returns None
/// when no order id can be found.
pub fn normalize_order(raw: &Value, default_symbol: &str) -> Option<ExchangeOrder> {
    let order_id = raw
        .get("orderId")
        .and_then(|v| {
            v.as_i64()
                .map(|n| n.to_string())
                .or_else(|| v.as_str().map(str::to_string))
        })
        .or_else(|| raw.get("id").and_then(|v| v.as_str().map(str::to_string)))?;

    let symbol = raw["symbol"].as_str().unwrap_or(default_symbol).to_string();
    let side = match raw["side"].as_str().unwrap_or("").to_lowercase().as_str() {
        "sell" => Side::Sell,
        _ => Side::Buy,
    };
    let filled = value_f64(raw, &["executedQty", "filled", "z"]);
    let quantity = value_f64(raw, &["origQty", "amount", "q"]);
    let status = map_order_status(raw["status"].as_str().unwrap_or(""), filled, quantity);

    // Average fill price when available, else the limit price.
    let avg_price = value_f64(raw, &["avgPrice"]);
    let cumulative_quote = value_f64(raw, &["cummulativeQuoteQty"]);
    let limit_price = value_f64(raw, &["price", "p"]);
    let price = if avg_price > 0.0 {
        avg_price
    } else if cumulative_quote > 0.0 && filled > 0.0 {
        cumulative_quote / filled
    } else {
        limit_price
    };

    let fee_accounting = fee_accounting_of(raw, &symbol);
    let fee = value_f64(raw, &["commission", "n"]);

    Some(ExchangeOrder {
        order_id,
        symbol,
        side,
        price,
        quantity,
        filled_quantity: filled,
        status,
        fee: (fee > 0.0).then_some(fee),
        fee_accounting,
        token_id: None,
        raw: Some(raw.clone()),
    })
}

fn fee_accounting_of(raw: &Value, symbol: &str) -> FeeAccounting {
    let quote = quote_asset(symbol);
    let commission_asset = raw["commissionAsset"]
        .as_str()
        .or_else(|| raw["N"].as_str())
        .or_else(|| {
            raw["fills"]
                .as_array()
                .and_then(|fills| fills.first())
                .and_then(|fill| fill["commissionAsset"].as_str())
        });
    match commission_asset {
        Some(asset) if !asset.is_empty() && !quote.eq_ignore_ascii_case(asset) => {
            FeeAccounting::ExternalToken
        }
        _ => FeeAccounting::QuoteDeduction,
    }
}

fn quote_asset(symbol: &str) -> &str {
    for quote in ["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB"] {
        if let Some(stripped) = symbol.strip_suffix(quote) {
            if !stripped.is_empty() {
                return quote;
            }
        }
    }
    ""
}

pub fn map_order_status(raw: &str, filled: f64, quantity: f64) -> OrderState {
    match raw.to_uppercase().as_str() {
        "NEW" | "ACCEPTED" => OrderState::Placed,
        "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
        "FILLED" => OrderState::Filled,
        "CANCELED" | "CANCELLED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderState::Cancelled,
        "REJECTED" => OrderState::Failed,
        _ => {
            if quantity > 0.0 && filled >= quantity {
                OrderState::Filled
            } else if filled > 0.0 {
                OrderState::PartiallyFilled
            } else {
                OrderState::Placed
            }
        }
    }
}

pub fn value_f64(value: &Value, keys: &[&str]) -> f64 {
    for key in keys {
        let entry = &value[*key];
        if let Some(n) = entry.as_f64() {
            return n;
        }
        if let Some(s) = entry.as_str() {
            if let Ok(n) = s.parse::<f64>() {
                return n;
            }
        }
    }
    0.0
}

pub(crate) fn trim_float(value: f64) -> String {
    let mut text = format!("{value:.8}");
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    text
}

/// Batch endpoints want numeric ids as numbers; anything unparseable goes
/// through as a string.
fn order_id_list(order_ids: &[String]) -> Value {
    Value::Array(
        order_ids
            .iter()
            .map(|id| {
                id.parse::<i64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::String(id.clone()))
            })
            .collect(),
    )
}

fn urlencode(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            _ => format!("%{:02X}", c as u32),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_numeric_and_string_fields() {
        let raw = json!({
            "orderId": 12345,
            "symbol": "BTCUSDT",
            "side": "BUY",
            "price": "99.50",
            "origQty": "0.01",
            "executedQty": "0.01",
            "status": "FILLED"
        });
        let order = normalize_order(&raw, "BTCUSDT").unwrap();
        assert_eq!(order.order_id, "12345");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.status, OrderState::Filled);
        assert_eq!(order.price, 99.5);
        assert_eq!(order.filled_quantity, 0.01);
    }

    #[test]
    fn external_fee_detected_from_commission_asset() {
        let bnb = json!({
            "orderId": 1, "symbol": "BTCUSDT", "side": "BUY", "price": "10",
            "origQty": "1", "executedQty": "1", "status": "FILLED",
            "fills": [{"commissionAsset": "BNB", "commission": "0.001"}]
        });
        let order = normalize_order(&bnb, "BTCUSDT").unwrap();
        assert!(matches!(order.fee_accounting, FeeAccounting::ExternalToken));

        let usdt = json!({
            "orderId": 2, "symbol": "BTCUSDT", "side": "BUY", "price": "10",
            "origQty": "1", "executedQty": "1", "status": "FILLED",
            "commissionAsset": "USDT"
        });
        let order = normalize_order(&usdt, "BTCUSDT").unwrap();
        assert!(matches!(order.fee_accounting, FeeAccounting::QuoteDeduction));
    }

    #[test]
    fn status_falls_back_to_fill_arithmetic() {
        assert_eq!(map_order_status("weird", 1.0, 1.0), OrderState::Filled);
        assert_eq!(map_order_status("weird", 0.5, 1.0), OrderState::PartiallyFilled);
        assert_eq!(map_order_status("weird", 0.0, 1.0), OrderState::Placed);
        assert_eq!(map_order_status("CANCELED", 0.0, 1.0), OrderState::Cancelled);
    }

    #[test]
    fn trim_float_drops_trailing_zeros() {
        assert_eq!(trim_float(99.5), "99.5");
        assert_eq!(trim_float(0.010000), "0.01");
        assert_eq!(trim_float(100.0), "100");
    }

    #[test]
    fn order_id_list_prefers_numbers() {
        let ids = vec!["123".to_string(), "abc-456".to_string()];
        let value = order_id_list(&ids);
        assert_eq!(value[0], json!(123));
        assert_eq!(value[1], json!("abc-456"));
    }

    #[test]
    fn ws_params_are_sorted_and_signed() {
        let client = SpotRestClient::new(
            ExchangeKind::Spot,
            "key".to_string(),
            "secret".to_string(),
            true,
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        let params = vec![
            ("symbol".to_string(), "BTCUSDT".to_string()),
            ("side".to_string(), "BUY".to_string()),
        ];
        let signed = client.signed_ws_params(&params).unwrap();
        assert_eq!(signed["apiKey"], json!("key"));
        assert!(signed.contains_key("timestamp"));
        assert!(signed.contains_key("signature"));

        // Keys before the appended signature stay alphabetical, which is
        // the order the venue verifies the signature against.
        let keys: Vec<&String> = signed.keys().filter(|k| *k != "signature").collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn order_id_missing_yields_none() {
        assert!(normalize_order(&json!({"symbol": "X"}), "X").is_none());
    }
}
