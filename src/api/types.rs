//! Wire types for the OpenAlgo-style broker REST API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of /api/v1/placeorder.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest<'a> {
    pub apikey: &'a str,
    pub strategy: &'a str,
    pub symbol: &'a str,
    pub action: &'a str,
    pub exchange: &'a str,
    pub pricetype: &'a str,
    pub product: &'a str,
    pub quantity: String,
}

/// Body of /api/v1/orderstatus and /api/v1/cancelorder.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest<'a> {
    pub apikey: &'a str,
    pub strategy: &'a str,
    pub orderid: &'a str,
}

/// Body of /api/v1/positionbook and /api/v1/funds.
#[derive(Debug, Clone, Serialize)]
pub struct AccountRequest<'a> {
    pub apikey: &'a str,
}

/// Common envelope: `{"status": "success"|"error", ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub orderid: Option<String>,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderStatusData {
    pub order_status: String,
    #[serde(default)]
    pub quantity: Option<Value>,
    #[serde(default, alias = "filledqty", alias = "filled_qty")]
    pub filled_quantity: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    pub symbol: String,
    #[serde(default)]
    pub exchange: String,
    pub quantity: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundsData {
    pub availablecash: Value,
}

/// Brokers disagree on whether numbers are strings; accept both.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

pub fn value_as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
