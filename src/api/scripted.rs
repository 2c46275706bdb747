//! In-memory broker with per-symbol scripted behaviour, for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;

use super::{Broker, BrokerError, BrokerPosition, Funds, OrderSide, OrderState, OrderStatus};

/// How an order matching a rule behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Fill,
    Reject,
    /// Stays open with nothing filled
    NeverFill,
    /// Fills this many units, then stays open
    PartialFill(u32),
    /// Fills at the broker but the caller only sees `Ambiguous`
    FillUnacknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<(String, Option<OrderSide>, Behavior)>,
    orders: Vec<PlacedOrder>,
    statuses: HashMap<String, OrderStatus>,
    positions: HashMap<String, i64>,
    cash: Decimal,
    transient_failures: u32,
    funds_unavailable: bool,
    calls: u32,
}

impl State {
    fn behavior_for(&self, symbol: &str, side: OrderSide) -> Behavior {
        self.rules
            .iter()
            .rev()
            .find(|(pattern, rule_side, _)| {
                (symbol == pattern || symbol.ends_with(pattern.as_str()))
                    && rule_side.map_or(true, |s| s == side)
            })
            .map(|(_, _, b)| *b)
            .unwrap_or(Behavior::Fill)
    }

    fn enter(&mut self) -> Result<(), BrokerError> {
        self.calls += 1;
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(BrokerError::Transient("scripted outage".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedBroker {
    state: Arc<Mutex<State>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                cash: dec!(3000000),
                ..Default::default()
            })),
        }
    }

    /// Orders whose symbol equals or ends with `pattern` (and match `side`
    /// when given) behave as `behavior`. Later rules win.
    pub async fn set_behavior(&self, pattern: &str, side: Option<OrderSide>, behavior: Behavior) {
        self.state
            .lock()
            .await
            .rules
            .push((pattern.to_string(), side, behavior));
    }

    pub async fn clear_behaviors(&self) {
        self.state.lock().await.rules.clear();
    }

    pub async fn fail_next_calls(&self, n: u32) {
        self.state.lock().await.transient_failures = n;
    }

    pub async fn set_cash(&self, cash: Decimal) {
        self.state.lock().await.cash = cash;
    }

    pub async fn set_funds_unavailable(&self, unavailable: bool) {
        self.state.lock().await.funds_unavailable = unavailable;
    }

    pub async fn set_position(&self, symbol: &str, quantity: i64) {
        self.state
            .lock()
            .await
            .positions
            .insert(symbol.to_string(), quantity);
    }

    pub async fn orders(&self) -> Vec<PlacedOrder> {
        self.state.lock().await.orders.clone()
    }

    pub async fn call_count(&self) -> u32 {
        self.state.lock().await.calls
    }

    pub async fn net_quantity(&self, symbol: &str) -> i64 {
        self.state
            .lock()
            .await
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    /// True when no symbol has a non-zero net quantity.
    pub async fn is_flat(&self) -> bool {
        self.state.lock().await.positions.values().all(|q| *q == 0)
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String, BrokerError> {
        let mut state = self.state.lock().await;
        state.enter()?;

        let behavior = state.behavior_for(symbol, side);
        if behavior == Behavior::Reject {
            return Err(BrokerError::Rejected(format!("{} rejected by script", symbol)));
        }

        let id = format!("S{}", state.orders.len() + 1);
        let (order_state, filled) = match behavior {
            Behavior::Fill | Behavior::FillUnacknowledged => (OrderState::Filled, quantity),
            Behavior::NeverFill => (OrderState::Open, 0),
            Behavior::PartialFill(n) => (OrderState::PartiallyFilled, n.min(quantity)),
            Behavior::Reject => (OrderState::Rejected, 0),
        };
        *state.positions.entry(symbol.to_string()).or_insert(0) +=
            side.sign() * i64::from(filled);
        state.statuses.insert(
            id.clone(),
            OrderStatus {
                state: order_state,
                filled_quantity: filled,
            },
        );
        state.orders.push(PlacedOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
        });
        if behavior == Behavior::FillUnacknowledged {
            return Err(BrokerError::Ambiguous(format!("{}: response lost", symbol)));
        }
        Ok(id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        state
            .statuses
            .get(order_id)
            .copied()
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", order_id)))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        if let Some(status) = state.statuses.get_mut(order_id) {
            if !status.state.is_terminal() {
                status.state = OrderState::Cancelled;
            }
        }
        Ok(())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        let mut positions: Vec<BrokerPosition> = state
            .positions
            .iter()
            .map(|(symbol, quantity)| BrokerPosition {
                symbol: symbol.clone(),
                quantity: *quantity,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_funds(&self) -> Result<Funds, BrokerError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        if state.funds_unavailable {
            return Err(BrokerError::Rejected("funds unavailable".to_string()));
        }
        Ok(Funds {
            available_cash: state.cash,
        })
    }
}
