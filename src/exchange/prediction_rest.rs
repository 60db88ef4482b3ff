//! REST client for the prediction-market venue: slug-based market metadata
//! plus the authenticated CLOB order endpoints.
//!
//! Metadata arrays arrive stringified (`"[\"Up\",\"Down\"]"`) often enough
//! that the deserializers accept both spellings. Authenticated requests
//! carry an HMAC-SHA256 signature over `timestamp + method + path + body`.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;

use crate::domain::{OrderState, Side};

use super::{ExchangeError, ExchangeOrder, FeeAccounting};

type HmacSha256 = Hmac<Sha256>;

const MARKETS_API_BASE: &str = "https://gamma-api.polymarket.com";
const CLOB_API_BASE: &str = "https://clob.polymarket.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct MarketInfo {
    #[serde(rename = "conditionId", default, alias = "condition_id")]
    pub condition_id: Option<String>,
    #[serde(rename = "clobTokenIds", deserialize_with = "de_string_vec", default)]
    pub clob_token_ids: Vec<String>,
    #[serde(deserialize_with = "de_string_vec", default)]
    pub outcomes: Vec<String>,
}

impl MarketInfo {
    /// Token id whose outcome matches, falling back to the first token.
    pub fn token_for_outcome(&self, outcome: &str) -> Option<String> {
        self.outcomes
            .iter()
            .position(|o| o.eq_ignore_ascii_case(outcome))
            .and_then(|i| self.clob_token_ids.get(i))
            .or_else(|| self.clob_token_ids.first())
            .cloned()
    }
}

/// Some venue responses return JSON arrays as a string.
fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom),
        _ => Ok(Vec::new()),
    }
}

#[derive(Clone)]
pub struct PredictionRestClient {
    http: Client,
    markets_base: String,
    clob_base: String,
    /// Funder address, sent as the account identity header.
    api_key: String,
    api_secret: String,
}

impl PredictionRestClient {
    pub fn new(api_key: String, api_secret: String) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(Self {
            http,
            markets_base: MARKETS_API_BASE.to_string(),
            clob_base: CLOB_API_BASE.to_string(),
            api_key,
            api_secret,
        })
    }

    /// Look a market up by its period slug.
    pub async fn market_by_slug(&self, slug: &str) -> Result<Option<MarketInfo>, ExchangeError> {
        let url = format!("{}/events", self.markets_base);
        let response = self
            .http
            .get(&url)
            .query(&[("slug", slug)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExchangeError::MarketUnavailable(format!(
                "events lookup {} -> {}",
                slug,
                response.status()
            )));
        }

        let events: Vec<Value> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Venue(format!("events json: {e}")))?;
        let Some(event) = events.first() else {
            return Ok(None);
        };
        let Some(market_value) = event["markets"].as_array().and_then(|m| m.first()) else {
            return Ok(None);
        };

        let market: MarketInfo = serde_json::from_value(market_value.clone())
            .map_err(|e| ExchangeError::Venue(format!("market json: {e}")))?;
        debug!(slug, tokens = market.clob_token_ids.len(), "market resolved");
        Ok(Some(market))
    }

    pub async fn midpoint(&self, token_id: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/midpoint", self.clob_base);
        let value: Value = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| ExchangeError::Venue(format!("midpoint json: {e}")))?;

        let mid = value["mid"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| value["mid"].as_f64())
            .unwrap_or(0.0);
        if mid > 0.0 {
            Ok(mid)
        } else {
            Err(ExchangeError::Venue(format!("invalid midpoint: {value}")))
        }
    }

    pub async fn place_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size: f64,
        order_type: &str,
    ) -> Result<String, ExchangeError> {
        let body = json!({
            "order": {
                "token_id": token_id,
                "price": price,
                "size": size,
                "side": side.as_str().to_uppercase(),
            },
            "orderType": order_type,
        });
        let value = self.signed(Method::POST, "/order", Some(&body)).await?;

        value["orderID"]
            .as_str()
            .or_else(|| value["id"].as_str())
            .or_else(|| value["order_id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Venue(format!("order response missing id: {value}")))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let body = json!({ "orderID": order_id });
        self.signed(Method::DELETE, "/order", Some(&body)).await?;
        Ok(())
    }

    pub async fn get_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        let path = format!("/data/order/{order_id}");
        match self.signed(Method::GET, &path, None).await {
            Ok(value) => Ok(normalize_clob_order(&value, symbol)),
            Err(ExchangeError::OrderNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let value = self.signed(Method::GET, "/data/orders", None).await?;
        let orders = value
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|raw| normalize_clob_order(raw, symbol))
                    .filter(|o| o.is_active())
                    .collect()
            })
            .unwrap_or_default();
        Ok(orders)
    }

    pub async fn token_balance(&self, token_id: &str) -> Result<f64, ExchangeError> {
        let path = format!("/balance-allowance?asset_id={token_id}");
        let value = self.signed(Method::GET, &path, None).await?;
        Ok(value["balance"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| value["balance"].as_f64())
            .unwrap_or(0.0))
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let body_text = body.map(Value::to_string).unwrap_or_default();
        let message = format!("{timestamp}{method}{path}{body_text}");

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Venue(format!("bad api secret: {e}")))?;
        mac.update(message.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let url = format!("{}{path}", self.clob_base);
        let mut request = self
            .http
            .request(method, &url)
            .header("POLY-ADDRESS", &self.api_key)
            .header("POLY-SIGNATURE", signature)
            .header("POLY-TIMESTAMP", timestamp);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            if status.as_u16() == 404 || ExchangeError::text_means_not_found(&text) {
                return Err(ExchangeError::OrderNotFound(text));
            }
            if status.as_u16() == 429 {
                return Err(ExchangeError::RateLimited(text));
            }
            return Err(ExchangeError::Venue(format!("{status}: {text}")));
        }
        serde_json::from_str(&text).map_err(|e| ExchangeError::Venue(format!("bad json: {e}")))
    }
}

/// Normalize a CLOB order payload into the uniform shape.
pub fn normalize_clob_order(raw: &Value, symbol: &str) -> Option<ExchangeOrder> {
    let order_id = raw["id"]
        .as_str()
        .or_else(|| raw["order_id"].as_str())
        .or_else(|| raw["orderID"].as_str())?
        .to_string();

    let side = match raw["side"].as_str().unwrap_or("buy").to_lowercase().as_str() {
        "sell" => Side::Sell,
        _ => Side::Buy,
    };
    let price = str_or_f64(raw, &["price", "limit_price"]);
    let quantity = str_or_f64(raw, &["size", "original_size", "quantity"]);
    let filled = str_or_f64(raw, &["size_matched", "filled_size", "filled"]);
    let status = map_clob_status(raw["status"].as_str().unwrap_or("open"), filled, quantity);

    let token_id = raw["asset_id"]
        .as_str()
        .or_else(|| raw["token_id"].as_str())
        .map(str::to_string);

    Some(ExchangeOrder {
        order_id,
        symbol: symbol.to_string(),
        side,
        price,
        quantity,
        filled_quantity: filled,
        status,
        fee: None,
        // The venue settles fees outside the collateral leg.
        fee_accounting: FeeAccounting::ExternalToken,
        token_id,
        raw: Some(raw.clone()),
    })
}

fn map_clob_status(raw: &str, filled: f64, quantity: f64) -> OrderState {
    match raw.to_lowercase().as_str() {
        "filled" | "matched" | "complete" | "completed" => OrderState::Filled,
        "canceled" | "cancelled" | "expired" => OrderState::Cancelled,
        "rejected" | "failed" | "error" => OrderState::Failed,
        "partially_filled" | "partial" => OrderState::PartiallyFilled,
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

fn str_or_f64(value: &Value, keys: &[&str]) -> f64 {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringified_token_arrays_parse() {
        let market: MarketInfo = serde_json::from_value(json!({
            "conditionId": "0xabc",
            "clobTokenIds": "[\"111\", \"222\"]",
            "outcomes": "[\"Up\", \"Down\"]"
        }))
        .unwrap();
        assert_eq!(market.clob_token_ids, vec!["111", "222"]);
        assert_eq!(market.token_for_outcome("down"), Some("222".to_string()));
        // Unknown outcome falls back to the first token.
        assert_eq!(market.token_for_outcome("Maybe"), Some("111".to_string()));
    }

    #[test]
    fn plain_arrays_also_parse() {
        let market: MarketInfo = serde_json::from_value(json!({
            "clobTokenIds": ["1", "2"],
            "outcomes": ["Up", "Down"]
        }))
        .unwrap();
        assert_eq!(market.token_for_outcome("Up"), Some("1".to_string()));
    }

    #[test]
    fn clob_order_normalizes() {
        let raw = json!({
            "id": "0xorder",
            "side": "BUY",
            "price": "0.48",
            "original_size": "10",
            "size_matched": "10",
            "status": "matched",
            "asset_id": "tok-1"
        });
        let order = normalize_clob_order(&raw, "btc-Up").unwrap();
        assert_eq!(order.status, OrderState::Filled);
        assert_eq!(order.token_id.as_deref(), Some("tok-1"));
        assert_eq!(order.price, 0.48);
        assert!(matches!(order.fee_accounting, FeeAccounting::ExternalToken));
    }

    #[test]
    fn status_derived_from_fill_when_unknown() {
        assert_eq!(map_clob_status("open", 0.0, 10.0), OrderState::Placed);
        assert_eq!(map_clob_status("open", 4.0, 10.0), OrderState::PartiallyFilled);
        assert_eq!(map_clob_status("open", 10.0, 10.0), OrderState::Filled);
    }
}
