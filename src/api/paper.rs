//! Paper broker for dry runs: every order fills immediately in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{Broker, BrokerError, BrokerPosition, Funds, OrderSide, OrderState, OrderStatus};

#[derive(Debug, Default)]
struct PaperBook {
    positions: HashMap<String, i64>,
    orders: HashMap<String, OrderStatus>,
}

/// Simulated broker with a fixed cash balance.
pub struct PaperBroker {
    book: RwLock<PaperBook>,
    cash: Decimal,
}

impl PaperBroker {
    pub fn new(cash: Decimal) -> Self {
        Self {
            book: RwLock::new(PaperBook::default()),
            cash,
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String, BrokerError> {
        if quantity == 0 {
            return Err(BrokerError::Rejected("quantity must be positive".to_string()));
        }
        let id = format!("paper-{}", Uuid::new_v4());
        let mut book = self.book.write().await;
        *book.positions.entry(symbol.to_string()).or_insert(0) += side.sign() * i64::from(quantity);
        book.orders.insert(
            id.clone(),
            OrderStatus {
                state: OrderState::Filled,
                filled_quantity: quantity,
            },
        );
        info!(order_id = %id, symbol, side = %side, quantity, "[DRY RUN] Paper fill");
        Ok(id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        self.book
            .read()
            .await
            .orders
            .get(order_id)
            .copied()
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", order_id)))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        // Paper orders are filled on placement; nothing is ever working.
        Ok(())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let book = self.book.read().await;
        let mut positions: Vec<BrokerPosition> = book
            .positions
            .iter()
            .filter(|(_, q)| **q != 0)
            .map(|(symbol, quantity)| BrokerPosition {
                symbol: symbol.clone(),
                quantity: *quantity,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_funds(&self) -> Result<Funds, BrokerError> {
        Ok(Funds {
            available_cash: self.cash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_paper_orders_fill_and_net_out() {
        let broker = PaperBroker::new(dec!(1000000));
        let sell = broker
            .place_order("NIFTY24DEC24000PE", OrderSide::Sell, 75)
            .await
            .unwrap();
        assert_eq!(
            broker.get_order_status(&sell).await.unwrap(),
            OrderStatus { state: OrderState::Filled, filled_quantity: 75 }
        );
        assert_eq!(
            broker.get_positions().await.unwrap(),
            vec![BrokerPosition { symbol: "NIFTY24DEC24000PE".to_string(), quantity: -75 }]
        );

        broker
            .place_order("NIFTY24DEC24000PE", OrderSide::Buy, 75)
            .await
            .unwrap();
        assert!(broker.get_positions().await.unwrap().is_empty());
        assert_eq!(broker.get_funds().await.unwrap().available_cash, dec!(1000000));
    }
}
