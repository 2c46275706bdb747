//! Broker access: the client contract, the OpenAlgo-style REST client,
//! bounded retries, and the in-process paper broker.

mod http_broker;
mod paper;
mod retry;
#[cfg(test)]
pub(crate) mod scripted;
mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use http_broker::HttpBroker;
pub use paper::PaperBroker;
pub use retry::{RetryPolicy, RetryingBroker};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// The side that flattens a fill on this side.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-side order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderState {
    /// No further fills will arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected | OrderState::Cancelled
        )
    }
}

/// Result of an order status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_quantity: u32,
}

/// Net quantity held for one symbol (negative = short).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: i64,
}

/// Account funds snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funds {
    pub available_cash: Decimal,
}

/// Broker call failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Network-level failure worth retrying.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Definitive refusal; never retried.
    #[error("broker rejected request: {0}")]
    Rejected(String),

    #[error("unexpected broker response: {0}")]
    InvalidResponse(String),

    /// The request may have reached the broker. Resending could duplicate
    /// an order, so this is never retried.
    #[error("broker outcome unknown: {0}")]
    Ambiguous(String),

    #[error("broker unreachable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, BrokerError::Ambiguous(_))
    }
}

/// Everything the service needs from a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit a market order; returns the broker's order id.
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String, BrokerError>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError>;

    /// Best-effort cancel of a working order.
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Live net positions, one row per symbol.
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_funds(&self) -> Result<Funds, BrokerError>;
}
