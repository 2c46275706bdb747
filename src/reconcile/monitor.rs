//! Reconciliation monitor: per-instrument locks, EOD phases, and the
//! comparison of stored positions against broker truth.
//!
//! The store is authoritative for decisions; the broker is authoritative
//! for what is actually held. A mismatch suspends the instrument until an
//! operator (or auto-resync) rebuilds the position from the broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{Broker, BrokerPosition};
use crate::db::{AlertSeverity, PositionStore};
use crate::execution::{parse_option_symbol, OptionType};
use crate::models::{EodConditions, Leg, Position, PositionStatus, SignalKind};
use crate::trading::{InstrumentBook, InstrumentConfig};

/// Monitor timing and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay between the EOD conditions check and execution (seconds)
    pub eod_execution_delay_secs: u64,

    /// Periodic broker reconciliation interval (seconds)
    pub reconcile_interval_secs: u64,

    /// Rebuild diverged positions from the broker automatically
    pub auto_resync: bool,

    /// Longest a signal waits for its instrument's lock (seconds)
    pub lock_wait_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            eod_execution_delay_secs: 15,
            reconcile_interval_secs: 60,
            auto_resync: false,
            lock_wait_secs: 30,
        }
    }
}

/// Per-instrument EOD cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentPhase {
    NoSignal,
    ConditionsChecked,
    Executing,
    Settled,
}

/// One symbol where store and broker disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub symbol: String,
    pub expected: i64,
    pub actual: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileStatus {
    InSync,
    Diverged { divergences: Vec<Divergence> },
    /// Instrument was busy; try again next cycle
    Skipped,
}

/// Outcome of rebuilding one instrument from broker positions.
#[derive(Debug, Clone, Serialize)]
pub struct ResyncReport {
    pub instrument: String,
    pub levels: usize,
    pub total_lots: u32,
    /// Symbols whose leg had to be adopted or resized from the broker
    pub adopted: Vec<String>,
    /// Broker rows that do not form a hedged pair
    pub unpaired: Vec<BrokerPosition>,
    pub suspension_cleared: bool,
}

/// Held while an instrument's order sequence runs.
pub type InstrumentGuard = OwnedMutexGuard<()>;

/// Position-state authority for all instruments.
pub struct ReconciliationMonitor {
    broker: Arc<dyn Broker>,
    store: PositionStore,
    instruments: Arc<InstrumentBook>,
    config: MonitorConfig,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    phases: RwLock<HashMap<String, InstrumentPhase>>,
}

impl ReconciliationMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: PositionStore,
        instruments: Arc<InstrumentBook>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            broker,
            store,
            instruments,
            config,
            locks: RwLock::new(HashMap::new()),
            phases: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    async fn lock_for(&self, instrument: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(instrument) {
            return lock.clone();
        }
        self.locks
            .write()
            .await
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait up to the configured lock wait for exclusive use of `instrument`.
    pub async fn acquire(&self, instrument: &str) -> Option<InstrumentGuard> {
        let lock = self.lock_for(instrument).await;
        let wait = Duration::from_secs(self.config.lock_wait_secs);
        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(instrument, waited_secs = self.config.lock_wait_secs, "Instrument busy");
                None
            }
        }
    }

    /// Take the instrument lock only if it is free right now.
    pub async fn try_acquire(&self, instrument: &str) -> Option<InstrumentGuard> {
        self.lock_for(instrument).await.try_lock_owned().ok()
    }

    pub async fn phase(&self, instrument: &str) -> InstrumentPhase {
        self.phases
            .read()
            .await
            .get(instrument)
            .copied()
            .unwrap_or(InstrumentPhase::NoSignal)
    }

    pub async fn set_phase(&self, instrument: &str, phase: InstrumentPhase) {
        debug!(instrument, phase = ?phase, "Phase change");
        self.phases.write().await.insert(instrument.to_string(), phase);
    }

    /// Start an EOD cycle. Returns false when one is already in flight.
    pub async fn begin_eod(&self, instrument: &str) -> bool {
        let mut phases = self.phases.write().await;
        let current = phases
            .get(instrument)
            .copied()
            .unwrap_or(InstrumentPhase::NoSignal);
        if matches!(
            current,
            InstrumentPhase::ConditionsChecked | InstrumentPhase::Executing
        ) {
            return false;
        }
        phases.insert(instrument.to_string(), InstrumentPhase::ConditionsChecked);
        true
    }

    /// Broker quantities per symbol attributed to `instrument`.
    fn broker_quantities(&self, instrument: &str, positions: &[BrokerPosition]) -> BTreeMap<String, i64> {
        let mut actual = BTreeMap::new();
        for p in positions {
            if p.quantity != 0 && self.instruments.owner_of_symbol(&p.symbol) == Some(instrument) {
                *actual.entry(p.symbol.clone()).or_insert(0) += p.quantity;
            }
        }
        actual.retain(|_, q| *q != 0);
        actual
    }

    /// Compare one instrument against the given broker snapshot. Caller holds
    /// the instrument lock.
    pub async fn reconcile_instrument(
        &self,
        instrument: &str,
        positions: &[BrokerPosition],
    ) -> Result<ReconcileStatus> {
        let Some((_, cfg)) = self.instruments.get(instrument) else {
            return Ok(ReconcileStatus::Skipped);
        };
        let stored = self.store.load_position(instrument).await?;
        let expected = stored.expected_quantities(cfg.lot_size);
        let actual = self.broker_quantities(instrument, positions);

        let mut divergences: Vec<Divergence> = expected
            .keys()
            .chain(actual.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter_map(|symbol| {
                let e = expected.get(symbol).copied().unwrap_or(0);
                let a = actual.get(symbol).copied().unwrap_or(0);
                (e != a).then(|| Divergence {
                    symbol: symbol.clone(),
                    expected: e,
                    actual: a,
                })
            })
            .collect();

        if divergences.is_empty() {
            debug!(instrument, "Position in sync with broker");
            return Ok(ReconcileStatus::InSync);
        }
        divergences.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let summary = divergences
            .iter()
            .map(|d| format!("{} expected {} actual {}", d.symbol, d.expected, d.actual))
            .collect::<Vec<_>>()
            .join("; ");
        warn!(instrument, divergences = %summary, "StateDivergence");
        self.store.suspend(instrument, "state_divergence").await?;
        self.store
            .raise_alert(
                Some(instrument),
                AlertSeverity::Warning,
                "state_divergence",
                &summary,
            )
            .await;

        if self.config.auto_resync {
            let report = self.resync_with(instrument, cfg, positions).await?;
            info!(
                instrument,
                levels = report.levels,
                cleared = report.suspension_cleared,
                "Auto-resync applied"
            );
        }

        Ok(ReconcileStatus::Diverged { divergences })
    }

    /// Reconcile every configured instrument whose lock is free.
    ///
    /// The broker snapshot is taken after the lock is held, so an order
    /// sequence that committed just before cannot be compared against
    /// positions read before it ran.
    pub async fn reconcile_all(&self) -> Result<Vec<(String, ReconcileStatus)>> {
        let mut results = Vec::new();
        for name in self.instruments.names() {
            let Some(_guard) = self.try_acquire(&name).await else {
                debug!(instrument = %name, "Busy, skipping reconciliation");
                results.push((name, ReconcileStatus::Skipped));
                continue;
            };
            let positions = self.broker.get_positions().await?;
            let status = self.reconcile_instrument(&name, &positions).await?;
            results.push((name, status));
        }
        Ok(results)
    }

    /// Rebuild one instrument from a fresh broker snapshot (operator action).
    pub async fn resync_instrument(&self, instrument: &str) -> Result<ResyncReport> {
        let (name, cfg) = self
            .instruments
            .get(instrument)
            .ok_or_else(|| anyhow::anyhow!("Unknown instrument {}", instrument))?;
        let _guard = self
            .acquire(name)
            .await
            .ok_or_else(|| anyhow::anyhow!("{} is busy", name))?;
        let positions = self.broker.get_positions().await?;
        self.resync_with(name, cfg, &positions).await
    }

    /// Broker truth wins: hedged PE/CE pairs become legs, stored entry and
    /// stop are kept where the symbols match.
    async fn resync_with(
        &self,
        instrument: &str,
        cfg: &InstrumentConfig,
        positions: &[BrokerPosition],
    ) -> Result<ResyncReport> {
        let stored = self.store.load_position(instrument).await?;
        let actual = self.broker_quantities(instrument, positions);

        // (expiry tag, strike) -> (pe symbol/qty, ce symbol/qty)
        type Side = Option<(String, i64)>;
        let mut pairs: BTreeMap<(String, Decimal), (Side, Side)> = BTreeMap::new();
        let mut unpaired = Vec::new();
        for (symbol, quantity) in &actual {
            match parse_option_symbol(symbol, &cfg.symbol_root) {
                Some(parsed) => {
                    let slot = pairs.entry((parsed.expiry_tag, parsed.strike)).or_default();
                    match parsed.option_type {
                        OptionType::Put => slot.0 = Some((symbol.clone(), *quantity)),
                        OptionType::Call => slot.1 = Some((symbol.clone(), *quantity)),
                    }
                }
                None => unpaired.push(BrokerPosition {
                    symbol: symbol.clone(),
                    quantity: *quantity,
                }),
            }
        }

        let lot_size = i64::from(cfg.lot_size.max(1));
        let mut kept: Vec<(usize, Leg)> = Vec::new();
        let mut adopted_legs: Vec<Leg> = Vec::new();
        let mut adopted = Vec::new();

        for ((_, strike), (put, call)) in pairs {
            let (Some((pe_symbol, pe_qty)), Some((ce_symbol, ce_qty))) = (put.clone(), call.clone()) else {
                unpaired.extend(
                    put.into_iter()
                        .chain(call)
                        .map(|(symbol, quantity)| BrokerPosition { symbol, quantity }),
                );
                continue;
            };
            if pe_qty >= 0 || ce_qty <= 0 || -pe_qty != ce_qty || ce_qty % lot_size != 0 {
                unpaired.push(BrokerPosition { symbol: pe_symbol, quantity: pe_qty });
                unpaired.push(BrokerPosition { symbol: ce_symbol, quantity: ce_qty });
                continue;
            }
            let lots = u32::try_from(ce_qty / lot_size)?;

            let matching: Vec<(usize, &Leg)> = stored
                .legs
                .iter()
                .enumerate()
                .filter(|(_, l)| l.pe_symbol == pe_symbol && l.ce_symbol == ce_symbol)
                .collect();
            let stored_lots: u32 = matching.iter().map(|(_, l)| l.lots).sum();

            if !matching.is_empty() && stored_lots == lots {
                kept.extend(matching.into_iter().map(|(i, l)| (i, l.clone())));
            } else if let Some((level, first)) = matching.first() {
                // Same contracts, different size: keep the first level's prices
                let mut leg = (*first).clone();
                leg.lots = lots;
                kept.push((*level, leg));
                adopted.push(pe_symbol);
            } else {
                adopted_legs.push(Leg {
                    entry_price: strike,
                    stop_price: Decimal::ZERO,
                    strike,
                    pe_symbol: pe_symbol.clone(),
                    ce_symbol,
                    lots,
                    opened_at: chrono::Utc::now(),
                });
                adopted.push(pe_symbol);
            }
        }

        kept.sort_by_key(|(level, _)| *level);
        let mut legs: Vec<Leg> = kept.into_iter().map(|(_, l)| l).collect();
        legs.extend(adopted_legs);

        let position = Position {
            instrument: instrument.to_string(),
            status: if legs.is_empty() {
                PositionStatus::Flat
            } else {
                PositionStatus::Open
            },
            legs,
        };
        self.store.overwrite_position(&position).await?;
        let resolved = self
            .store
            .resolve_sagas(instrument, "resolved by broker resync")
            .await?;

        if !adopted.is_empty() {
            self.store
                .raise_alert(
                    Some(instrument),
                    AlertSeverity::Warning,
                    "resync_leg_adopted",
                    &format!(
                        "legs rebuilt from broker without stored prices: {}; check entry/stop",
                        adopted.join(", ")
                    ),
                )
                .await;
        }

        let suspension_cleared = if unpaired.is_empty() {
            self.store.clear_suspension(instrument).await?
        } else {
            let rows = unpaired
                .iter()
                .map(|p| format!("{} {}", p.symbol, p.quantity))
                .collect::<Vec<_>>()
                .join(", ");
            self.store.suspend(instrument, "unhedged_broker_leg").await?;
            self.store
                .raise_alert(
                    Some(instrument),
                    AlertSeverity::Critical,
                    "unhedged_broker_leg",
                    &format!("broker holds unpaired legs: {}", rows),
                )
                .await;
            false
        };

        info!(
            instrument,
            levels = position.legs.len(),
            total_lots = position.total_lots(),
            resolved_sagas = resolved,
            unpaired = unpaired.len(),
            "Position resynced from broker"
        );

        Ok(ResyncReport {
            instrument: instrument.to_string(),
            levels: position.legs.len(),
            total_lots: position.total_lots(),
            adopted,
            unpaired,
            suspension_cleared,
        })
    }

    /// Periodic reconciliation until `shutdown` is set.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        info!(
            interval_secs = self.config.reconcile_interval_secs,
            auto_resync = self.config.auto_resync,
            "Starting reconciliation loop"
        );
        let mut ticker = interval(Duration::from_secs(self.config.reconcile_interval_secs.max(1)));
        // First tick fires immediately; startup already reconciled
        ticker.tick().await;

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.reconcile_all().await {
                Ok(results) => {
                    let diverged = results
                        .iter()
                        .filter(|(_, s)| matches!(s, ReconcileStatus::Diverged { .. }))
                        .count();
                    debug!(instruments = results.len(), diverged, "Reconciliation pass complete");
                }
                Err(e) => error!(error = %e, "Reconciliation pass failed"),
            }
        }
        info!("Reconciliation loop stopped");
    }
}

/// EOD decision from stored state and the alert's conditions. Exit wins
/// over pyramid.
pub fn evaluate_eod(position: &Position, conditions: &EodConditions) -> Option<SignalKind> {
    if position.is_open() {
        if conditions.exit {
            Some(SignalKind::Exit)
        } else if conditions.pyramid {
            Some(SignalKind::Pyramid)
        } else {
            None
        }
    } else if conditions.entry {
        Some(SignalKind::BaseEntry)
    } else {
        None
    }
}
