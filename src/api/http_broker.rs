//! REST client for an OpenAlgo-style broker gateway.
//!
//! Every endpoint is a JSON POST carrying the API key. Responses share the
//! `{"status": "success"|"error", ...}` envelope. Connection failures,
//! timeouts, HTTP 429 and 5xx are reported as transient; everything else is
//! a definitive rejection. Order placement is the exception: only failures
//! that prove the request never arrived (connect errors, 429) are transient,
//! and anything else after sending is `Ambiguous`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::types::*;
use super::{Broker, BrokerError, BrokerPosition, Funds, OrderSide, OrderState, OrderStatus};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the broker gateway.
pub struct HttpBroker {
    client: Client,
    base_url: String,
    api_key: String,
    strategy: String,
    exchange: String,
    product: String,
}

impl HttpBroker {
    pub fn new(base_url: &str, api_key: &str, strategy: &str, exchange: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            strategy: strategy.to_string(),
            exchange: exchange.to_string(),
            product: "NRML".to_string(),
        })
    }

    /// Build from `BROKER_BASE_URL`, `BROKER_API_KEY`, `BROKER_STRATEGY`
    /// and `BROKER_EXCHANGE`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("BROKER_BASE_URL").context("BROKER_BASE_URL not set")?;
        let api_key = std::env::var("BROKER_API_KEY").context("BROKER_API_KEY not set")?;
        let strategy =
            std::env::var("BROKER_STRATEGY").unwrap_or_else(|_| "synthbridge".to_string());
        let exchange = std::env::var("BROKER_EXCHANGE").unwrap_or_else(|_| "NFO".to_string());
        Self::new(&base_url, &api_key, &strategy, &exchange)
    }

    async fn post<B, T>(&self, path: &str, body: &B, resend_safe: bool) -> Result<Envelope<T>, BrokerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/api/v1/{}", self.base_url, path);
        debug!(url = %url, "Broker request");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let msg = format!("{}: {}", path, e);
                if resend_safe || e.is_connect() {
                    BrokerError::Transient(msg)
                } else {
                    BrokerError::Ambiguous(msg)
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Transient(format!("{} - {} - {}", path, status, text)));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            let msg = format!("{} - {} - {}", path, status, text);
            return Err(if resend_safe {
                BrokerError::Transient(msg)
            } else {
                BrokerError::Ambiguous(msg)
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected(format!("{} - {} - {}", path, status, text)));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(format!("{}: {}", path, e)))?;

        if !envelope.is_success() {
            return Err(BrokerError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| format!("{} returned status {}", path, envelope.status)),
            ));
        }
        Ok(envelope)
    }
}

fn map_order_state(raw: &str, filled: u32, quantity: u32) -> OrderState {
    match raw.trim().to_lowercase().as_str() {
        "complete" | "completed" | "filled" => OrderState::Filled,
        "rejected" => OrderState::Rejected,
        "cancelled" | "canceled" => OrderState::Cancelled,
        "open" | "trigger pending" if filled > 0 && filled < quantity => OrderState::PartiallyFilled,
        "open" => OrderState::Open,
        _ => OrderState::Pending,
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String, BrokerError> {
        let request = PlaceOrderRequest {
            apikey: &self.api_key,
            strategy: &self.strategy,
            symbol,
            action: side.as_str(),
            exchange: &self.exchange,
            pricetype: "MARKET",
            product: &self.product,
            quantity: quantity.to_string(),
        };
        let envelope: Envelope<Value> = self.post("placeorder", &request, false).await?;
        envelope
            .orderid
            .ok_or_else(|| BrokerError::InvalidResponse("placeorder: missing orderid".to_string()))
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        let request = OrderRequest {
            apikey: &self.api_key,
            strategy: &self.strategy,
            orderid: order_id,
        };
        let envelope: Envelope<OrderStatusData> = self.post("orderstatus", &request, true).await?;
        let data = envelope
            .data
            .ok_or_else(|| BrokerError::InvalidResponse("orderstatus: missing data".to_string()))?;

        let quantity = data
            .quantity
            .as_ref()
            .and_then(value_as_i64)
            .and_then(|q| u32::try_from(q).ok())
            .unwrap_or(0);
        let reported = data
            .filled_quantity
            .as_ref()
            .and_then(value_as_i64)
            .and_then(|q| u32::try_from(q).ok());
        let mut state = map_order_state(&data.order_status, reported.unwrap_or(0), quantity);
        // Gateways that omit the filled quantity only report it on completion.
        let filled_quantity = match (state, reported) {
            (_, Some(filled)) => filled,
            (OrderState::Filled, None) => quantity,
            _ => 0,
        };
        if state == OrderState::Open && filled_quantity > 0 {
            state = OrderState::PartiallyFilled;
        }

        Ok(OrderStatus {
            state,
            filled_quantity,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let request = OrderRequest {
            apikey: &self.api_key,
            strategy: &self.strategy,
            orderid: order_id,
        };
        let _: Envelope<Value> = self.post("cancelorder", &request, true).await?;
        Ok(())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let request = AccountRequest {
            apikey: &self.api_key,
        };
        let envelope: Envelope<Vec<PositionRow>> = self.post("positionbook", &request, true).await?;

        envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                let quantity = value_as_i64(&row.quantity).ok_or_else(|| {
                    BrokerError::InvalidResponse(format!("positionbook: bad quantity for {}", row.symbol))
                })?;
                Ok(BrokerPosition {
                    symbol: row.symbol,
                    quantity,
                })
            })
            .collect()
    }

    async fn get_funds(&self) -> Result<Funds, BrokerError> {
        let request = AccountRequest {
            apikey: &self.api_key,
        };
        let envelope: Envelope<FundsData> = self.post("funds", &request, true).await?;
        let data = envelope
            .data
            .ok_or_else(|| BrokerError::InvalidResponse("funds: missing data".to_string()))?;
        let available_cash = value_as_decimal(&data.availablecash)
            .ok_or_else(|| BrokerError::InvalidResponse("funds: bad availablecash".to_string()))?;
        Ok(Funds { available_cash })
    }
}
