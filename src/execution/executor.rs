//! Synthetic executor: two option legs placed in strict order.
//!
//! Entry sells the ATM put (risk leg) and, only once that has filled, buys
//! the ATM call (completing leg). A completing-leg failure triggers an
//! emergency unwind of the risk leg. Exits close the exact symbols stored on
//! the position: every short put is bought back before any call is sold.
//!
//! Every step is written to the saga log so a crash mid-sequence is visible
//! at the next start.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{Broker, BrokerError, OrderSide, OrderState};
use crate::db::{AlertSeverity, PositionStore, SagaRecord, SagaState};
use crate::models::{Leg, Position, Signal, SignalKind};
use crate::trading::InstrumentConfig;

use super::contracts::resolve_contracts;

/// Fill-wait settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Longest wait for one leg to reach a terminal state
    pub fill_timeout_ms: u64,
    /// First status-poll interval; grows exponentially
    pub poll_initial_ms: u64,
    /// Cap on the status-poll interval
    pub poll_max_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fill_timeout_ms: 30_000,
            poll_initial_ms: 250,
            poll_max_ms: 2_000,
        }
    }
}

/// Why a leg did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{symbol}: no terminal fill within {timeout_ms} ms")]
    Timeout { symbol: String, timeout_ms: u64 },

    #[error("{symbol}: rejected: {reason}")]
    Rejected { symbol: String, reason: String },

    #[error("{symbol}: ended {state:?} with {filled}/{quantity} filled")]
    Incomplete {
        symbol: String,
        state: OrderState,
        filled: u32,
        quantity: u32,
    },

    #[error("{symbol}: {source}")]
    Broker {
        symbol: String,
        #[source]
        source: BrokerError,
    },

    #[error("no contract for price {0}")]
    NoContract(Decimal),
}

/// One order of an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
}

/// Everything needed to open one pyramid level.
#[derive(Debug, Clone)]
pub struct ExecutionIntent {
    pub sequence: u64,
    pub dedupe_hash: String,
    pub instrument: String,
    pub kind: SignalKind,
    pub lots: u32,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    /// Short put
    pub risk_leg: LegOrder,
    /// Long call
    pub completing_leg: LegOrder,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
}

impl ExecutionIntent {
    /// Build an entry intent for a sized signal; `today` is the exchange-local date.
    pub fn entry(
        sequence: u64,
        signal: &Signal,
        lots: u32,
        instrument: &InstrumentConfig,
        today: NaiveDate,
    ) -> Result<Self, ExecutionError> {
        let contracts = resolve_contracts(signal.price, instrument, today)
            .ok_or(ExecutionError::NoContract(signal.price))?;
        let quantity = lots * instrument.lot_size;

        Ok(Self {
            sequence,
            dedupe_hash: signal.dedupe_hash(),
            instrument: signal.instrument.clone(),
            kind: signal.kind,
            lots,
            strike: contracts.strike,
            expiry: contracts.expiry,
            risk_leg: LegOrder {
                symbol: contracts.pe_symbol,
                side: OrderSide::Sell,
                quantity,
            },
            completing_leg: LegOrder {
                symbol: contracts.ce_symbol,
                side: OrderSide::Buy,
                quantity,
            },
            entry_price: signal.price,
            stop_price: signal.stop.unwrap_or(Decimal::ZERO),
        })
    }
}

/// Close request for an open position.
#[derive(Debug, Clone)]
pub struct ExitIntent {
    pub sequence: u64,
    pub dedupe_hash: String,
    pub instrument: String,
    pub exit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Both legs filled and the position was stored
    Committed(Position),
    /// Risk leg never filled; nothing changed
    Aborted { reason: String },
    /// Completing leg failed after the risk leg filled
    PartiallyFailed { reason: String, unwound: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed { realized_pnl: Decimal },
    /// Nothing was closed; the position is unchanged
    Aborted { reason: String },
    /// Some legs were closed; instrument suspended for resync
    PartiallyFailed { reason: String },
}

/// Result of placing one order and waiting for it.
#[derive(Debug)]
struct LegFill {
    order_id: Option<String>,
    filled: u32,
    error: Option<ExecutionError>,
}

impl LegFill {
    fn failed(error: ExecutionError) -> Self {
        Self {
            order_id: None,
            filled: 0,
            error: Some(error),
        }
    }

    /// The order may exist at the broker even though placement failed.
    fn order_unknown(&self) -> bool {
        matches!(
            &self.error,
            Some(ExecutionError::Broker { source, .. }) if source.is_ambiguous()
        )
    }

    fn reason(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Places and supervises the option legs of a synthetic future.
pub struct SyntheticExecutor {
    broker: Arc<dyn Broker>,
    store: PositionStore,
    config: ExecutorConfig,
}

impl SyntheticExecutor {
    pub fn new(broker: Arc<dyn Broker>, store: PositionStore, config: ExecutorConfig) -> Self {
        Self {
            broker,
            store,
            config,
        }
    }

    /// Open a base entry or pyramid level on top of `current`.
    pub async fn execute_entry(
        &self,
        intent: &ExecutionIntent,
        current: &Position,
    ) -> Result<EntryOutcome> {
        let mut saga = SagaRecord::new(
            Uuid::new_v4().to_string(),
            intent.sequence,
            &intent.instrument,
            intent.kind.as_str(),
            &intent.dedupe_hash,
            intent.lots,
        );
        saga.leg1_symbol = Some(intent.risk_leg.symbol.clone());
        saga.leg2_symbol = Some(intent.completing_leg.symbol.clone());
        self.store.insert_saga(&saga).await?;

        info!(
            instrument = %intent.instrument,
            kind = %intent.kind,
            lots = intent.lots,
            strike = %intent.strike,
            expiry = %intent.expiry,
            sequence = intent.sequence,
            "Executing synthetic entry"
        );

        // Leg 1: short put
        let leg1 = self.place_and_wait(&intent.risk_leg).await;
        saga.leg1_order_id = leg1.order_id.clone();
        saga.leg1_filled = i64::from(leg1.filled);

        if leg1.order_unknown() {
            let reason = format!("leg1_unknown: {}", leg1.reason());
            self.order_unknown(&mut saga, &intent.instrument, &reason).await?;
            return Ok(EntryOutcome::PartiallyFailed {
                reason,
                unwound: false,
            });
        }

        if leg1.error.is_some() {
            let reason = format!("leg1_not_filled: {}", leg1.reason());
            warn!(instrument = %intent.instrument, reason = %reason, "EntryAborted");

            if leg1.filled > 0 {
                // Partial fill left exposure; flatten it before reporting
                let unwind = LegOrder {
                    symbol: intent.risk_leg.symbol.clone(),
                    side: intent.risk_leg.side.opposite(),
                    quantity: leg1.filled,
                };
                if let Err(e) = self.flatten(&unwind).await {
                    return self
                        .unwind_failed(&mut saga, &intent.instrument, &reason, &e)
                        .await
                        .map(|_| EntryOutcome::PartiallyFailed {
                            reason,
                            unwound: false,
                        });
                }
            }

            saga.set_state(SagaState::Aborted);
            saga.note = Some(reason.clone());
            self.store.update_saga(&saga).await?;
            return Ok(EntryOutcome::Aborted { reason });
        }

        saga.set_state(SagaState::Leg1Filled);
        self.store.update_saga(&saga).await?;

        // Leg 2: long call
        let leg2 = self.place_and_wait(&intent.completing_leg).await;
        saga.leg2_order_id = leg2.order_id.clone();
        saga.leg2_filled = i64::from(leg2.filled);

        if leg2.error.is_some() {
            let reason = format!("leg2_failed: {}", leg2.reason());
            error!(
                instrument = %intent.instrument,
                reason = %reason,
                "Completing leg failed, unwinding risk leg"
            );

            let mut unwinds = vec![LegOrder {
                symbol: intent.risk_leg.symbol.clone(),
                side: intent.risk_leg.side.opposite(),
                quantity: leg1.filled,
            }];
            if leg2.filled > 0 {
                unwinds.push(LegOrder {
                    symbol: intent.completing_leg.symbol.clone(),
                    side: intent.completing_leg.side.opposite(),
                    quantity: leg2.filled,
                });
            }

            for unwind in &unwinds {
                if let Err(e) = self.flatten(unwind).await {
                    self.unwind_failed(&mut saga, &intent.instrument, &reason, &e)
                        .await?;
                    return Ok(EntryOutcome::PartiallyFailed {
                        reason,
                        unwound: false,
                    });
                }
            }

            if leg2.order_unknown() {
                // Risk leg is flat again, but a long call may still be open
                self.order_unknown(&mut saga, &intent.instrument, &reason).await?;
                return Ok(EntryOutcome::PartiallyFailed {
                    reason,
                    unwound: false,
                });
            }

            saga.set_state(SagaState::Unwound);
            saga.note = Some(reason.clone());
            self.store.update_saga(&saga).await?;
            self.store
                .raise_alert(
                    Some(&intent.instrument),
                    AlertSeverity::Critical,
                    "partial_failure",
                    &format!("{}; risk leg unwound, broker flat for this attempt", reason),
                )
                .await;
            return Ok(EntryOutcome::PartiallyFailed {
                reason,
                unwound: true,
            });
        }

        // Both legs filled
        let mut position = current.clone();
        position.push_leg(Leg {
            entry_price: intent.entry_price,
            stop_price: intent.stop_price,
            strike: intent.strike,
            pe_symbol: intent.risk_leg.symbol.clone(),
            ce_symbol: intent.completing_leg.symbol.clone(),
            lots: intent.lots,
            opened_at: Utc::now(),
        });
        saga.set_state(SagaState::Committed);

        if let Err(e) = self.store.commit_entry(&position, &saga).await {
            // Broker holds the legs but the store does not; force a resync
            self.store.suspend(&intent.instrument, "store_commit_failed").await?;
            self.store
                .raise_alert(
                    Some(&intent.instrument),
                    AlertSeverity::Critical,
                    "store_commit_failed",
                    &format!("both legs filled but commit failed: {}", e),
                )
                .await;
            return Err(e);
        }

        info!(
            instrument = %intent.instrument,
            lots = intent.lots,
            pyramid_count = position.pyramid_count(),
            total_lots = position.total_lots(),
            "Synthetic entry committed"
        );
        Ok(EntryOutcome::Committed(position))
    }

    /// Close every leg of `position` using its stored symbols.
    pub async fn execute_exit(
        &self,
        intent: &ExitIntent,
        position: &Position,
        instrument: &InstrumentConfig,
    ) -> Result<ExitOutcome> {
        let mut puts: BTreeMap<&str, u32> = BTreeMap::new();
        let mut calls: BTreeMap<&str, u32> = BTreeMap::new();
        for leg in &position.legs {
            *puts.entry(leg.pe_symbol.as_str()).or_insert(0) += leg.lots * instrument.lot_size;
            *calls.entry(leg.ce_symbol.as_str()).or_insert(0) += leg.lots * instrument.lot_size;
        }

        let mut saga = SagaRecord::new(
            Uuid::new_v4().to_string(),
            intent.sequence,
            &intent.instrument,
            SignalKind::Exit.as_str(),
            &intent.dedupe_hash,
            position.total_lots(),
        );
        saga.leg1_symbol = Some(puts.keys().copied().collect::<Vec<_>>().join(","));
        saga.leg2_symbol = Some(calls.keys().copied().collect::<Vec<_>>().join(","));
        self.store.insert_saga(&saga).await?;

        info!(
            instrument = %intent.instrument,
            lots = position.total_lots(),
            levels = position.legs.len(),
            "Executing synthetic exit"
        );

        // Short puts first, so no step leaves a naked short
        let mut closed_any = false;
        for (symbol, quantity) in &puts {
            let order = LegOrder {
                symbol: symbol.to_string(),
                side: OrderSide::Buy,
                quantity: *quantity,
            };
            let fill = self.place_and_wait(&order).await;
            saga.leg1_filled += i64::from(fill.filled);
            if fill.error.is_some() {
                let reason = format!("pe_close_failed: {}", fill.reason());
                if !closed_any && fill.filled == 0 && !fill.order_unknown() {
                    warn!(instrument = %intent.instrument, reason = %reason, "Exit aborted, position unchanged");
                    saga.set_state(SagaState::Aborted);
                    saga.note = Some(reason.clone());
                    self.store.update_saga(&saga).await?;
                    return Ok(ExitOutcome::Aborted { reason });
                }
                self.exit_incomplete(&mut saga, &intent.instrument, &reason).await?;
                return Ok(ExitOutcome::PartiallyFailed { reason });
            }
            closed_any = true;
        }

        for (symbol, quantity) in &calls {
            let order = LegOrder {
                symbol: symbol.to_string(),
                side: OrderSide::Sell,
                quantity: *quantity,
            };
            let fill = self.place_and_wait(&order).await;
            saga.leg2_filled += i64::from(fill.filled);
            if fill.error.is_some() {
                let reason = format!("ce_close_failed: {}", fill.reason());
                self.exit_incomplete(&mut saga, &intent.instrument, &reason).await?;
                return Ok(ExitOutcome::PartiallyFailed { reason });
            }
        }

        let realized_pnl: Decimal = position
            .legs
            .iter()
            .map(|leg| (intent.exit_price - leg.entry_price) * Decimal::from(leg.lots) * instrument.point_value)
            .sum();

        saga.set_state(SagaState::Committed);
        self.store
            .commit_exit(&intent.instrument, &saga, realized_pnl)
            .await?;

        info!(
            instrument = %intent.instrument,
            realized_pnl = %realized_pnl,
            "Synthetic exit committed"
        );
        Ok(ExitOutcome::Closed { realized_pnl })
    }

    /// Place an order and poll it to a terminal state or the fill timeout.
    async fn place_and_wait(&self, order: &LegOrder) -> LegFill {
        let order_id = match self
            .broker
            .place_order(&order.symbol, order.side, order.quantity)
            .await
        {
            Ok(id) => id,
            Err(BrokerError::Rejected(reason)) => {
                return LegFill::failed(ExecutionError::Rejected {
                    symbol: order.symbol.clone(),
                    reason,
                })
            }
            Err(source) => {
                return LegFill::failed(ExecutionError::Broker {
                    symbol: order.symbol.clone(),
                    source,
                })
            }
        };
        debug!(symbol = %order.symbol, side = %order.side, quantity = order.quantity, order_id = %order_id, "Order placed");

        let timeout = Duration::from_millis(self.config.fill_timeout_ms);
        let status = match tokio::time::timeout(timeout, self.poll_until_terminal(&order_id)).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return LegFill {
                    order_id: Some(order_id),
                    filled: 0,
                    error: Some(ExecutionError::Broker {
                        symbol: order.symbol.clone(),
                        source,
                    }),
                }
            }
            Err(_) => {
                warn!(symbol = %order.symbol, order_id = %order_id, "Fill timeout, cancelling order");
                if let Err(e) = self.broker.cancel_order(&order_id).await {
                    warn!(order_id = %order_id, error = %e, "Cancel failed");
                }
                // Whatever filled before the cancel still has to be accounted for
                let filled = match self.broker.get_order_status(&order_id).await {
                    Ok(s) if s.state == OrderState::Filled && s.filled_quantity >= order.quantity => {
                        // Filled in the race with the cancel
                        return LegFill {
                            order_id: Some(order_id),
                            filled: s.filled_quantity,
                            error: None,
                        };
                    }
                    Ok(s) => s.filled_quantity,
                    Err(e) => {
                        error!(order_id = %order_id, error = %e, "Cannot read fill after timeout; assuming nothing filled");
                        0
                    }
                };
                return LegFill {
                    order_id: Some(order_id),
                    filled,
                    error: Some(ExecutionError::Timeout {
                        symbol: order.symbol.clone(),
                        timeout_ms: self.config.fill_timeout_ms,
                    }),
                };
            }
        };

        let error = match status.state {
            OrderState::Filled if status.filled_quantity >= order.quantity => None,
            OrderState::Rejected if status.filled_quantity == 0 => Some(ExecutionError::Rejected {
                symbol: order.symbol.clone(),
                reason: "rejected after placement".to_string(),
            }),
            state => Some(ExecutionError::Incomplete {
                symbol: order.symbol.clone(),
                state,
                filled: status.filled_quantity,
                quantity: order.quantity,
            }),
        };

        LegFill {
            order_id: Some(order_id),
            filled: status.filled_quantity,
            error,
        }
    }

    async fn poll_until_terminal(&self, order_id: &str) -> Result<crate::api::OrderStatus, BrokerError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.poll_initial_ms))
            .with_max_interval(Duration::from_millis(self.config.poll_max_ms))
            .with_max_elapsed_time(None)
            .build();

        loop {
            match self.broker.get_order_status(order_id).await {
                Ok(status) if status.state.is_terminal() => return Ok(status),
                Ok(status) => {
                    debug!(order_id, state = ?status.state, filled = status.filled_quantity, "Waiting for fill");
                }
                Err(BrokerError::Rejected(reason)) => return Err(BrokerError::Rejected(reason)),
                Err(e) => {
                    warn!(order_id, error = %e, "Order status unavailable, polling again");
                }
            }
            let wait = backoff
                .next_backoff()
                .unwrap_or(Duration::from_millis(self.config.poll_max_ms));
            tokio::time::sleep(wait).await;
        }
    }

    /// Place a flattening order and require a complete fill.
    async fn flatten(&self, order: &LegOrder) -> Result<(), ExecutionError> {
        warn!(symbol = %order.symbol, side = %order.side, quantity = order.quantity, "Emergency unwind");
        let fill = self.place_and_wait(order).await;
        match fill.error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn unwind_failed(
        &self,
        saga: &mut SagaRecord,
        instrument: &str,
        reason: &str,
        unwind_error: &ExecutionError,
    ) -> Result<()> {
        saga.set_state(SagaState::UnwindFailed);
        saga.note = Some(format!("{}; unwind failed: {}", reason, unwind_error));
        self.store.update_saga(saga).await?;
        self.store.suspend(instrument, "unwind_failed").await?;
        self.store
            .raise_alert(
                Some(instrument),
                AlertSeverity::Critical,
                "unwind_failed",
                &format!(
                    "{}; emergency unwind failed ({}); unhedged exposure left at broker",
                    reason, unwind_error
                ),
            )
            .await;
        Ok(())
    }

    async fn order_unknown(&self, saga: &mut SagaRecord, instrument: &str, reason: &str) -> Result<()> {
        saga.set_state(SagaState::OrderUnknown);
        saga.note = Some(reason.to_string());
        self.store.update_saga(saga).await?;
        self.store.suspend(instrument, "order_unknown").await?;
        self.store
            .raise_alert(
                Some(instrument),
                AlertSeverity::Critical,
                "order_unknown",
                &format!("{}; order not resent, check the broker and resync", reason),
            )
            .await;
        Ok(())
    }

    async fn exit_incomplete(&self, saga: &mut SagaRecord, instrument: &str, reason: &str) -> Result<()> {
        saga.set_state(SagaState::ExitIncomplete);
        saga.note = Some(reason.to_string());
        self.store.update_saga(saga).await?;
        self.store.suspend(instrument, "exit_incomplete").await?;
        self.store
            .raise_alert(
                Some(instrument),
                AlertSeverity::Critical,
                "exit_incomplete",
                &format!("{}; position kept, resync required", reason),
            )
            .await;
        Ok(())
    }
}
