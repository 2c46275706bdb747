//! Bounded exponential backoff around any broker.
//!
//! Only `BrokerError::Transient` is retried; an `Ambiguous` order placement
//! goes straight back to the caller. Retries stop at whichever comes
//! first: the attempt limit or the elapsed-time limit. A transient failure
//! that outlives both becomes `RetriesExhausted`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Broker, BrokerError, BrokerPosition, Funds, OrderSide, OrderStatus};

/// Limits for retrying a single broker call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval_ms: 250,
            max_interval_ms: 2_000,
            max_elapsed_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.max_elapsed_ms)))
            .build()
    }
}

/// Wraps a broker so every call retries transient failures.
pub struct RetryingBroker<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: Broker> RetryingBroker<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;

        let result = backoff::future::retry(self.policy.backoff(), || {
            attempts += 1;
            let attempt = attempts;
            let fut = f();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        warn!(operation, attempt, error = %e, "Transient broker failure, retrying");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await;

        result.map_err(|e| match e {
            BrokerError::Transient(last) => BrokerError::RetriesExhausted { attempts, last },
            other => other,
        })
    }
}

#[async_trait]
impl<B: Broker> Broker for RetryingBroker<B> {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String, BrokerError> {
        self.call("place_order", || self.inner.place_order(symbol, side, quantity))
            .await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, BrokerError> {
        self.call("get_order_status", || self.inner.get_order_status(order_id))
            .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.call("cancel_order", || self.inner.cancel_order(order_id))
            .await
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.call("get_positions", || self.inner.get_positions()).await
    }

    async fn get_funds(&self) -> Result<Funds, BrokerError> {
        self.call("get_funds", || self.inner.get_funds()).await
    }
}
