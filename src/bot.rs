//! Bot runner: wires normalizer, sizer, executor and monitor together.
//!
//! Handles:
//! - Webhook signals (direct BASE_ENTRY / PYRAMID / EXIT and EOD_MONITOR)
//! - Startup recovery: incomplete sagas and broker reconciliation
//! - Periodic reconciliation and the health snapshot
//! - Persisting every outcome for duplicate replays

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::{Broker, HttpBroker, PaperBroker, RetryPolicy, RetryingBroker};
use crate::db::{AlertSeverity, PositionStore, SagaRecord, StoredSuspension};
use crate::execution::{
    EntryOutcome, ExecutionIntent, ExecutorConfig, ExitIntent, ExitOutcome, SyntheticExecutor,
};
use crate::models::{Position, Signal, SignalKind, SignalOutcome};
use crate::reconcile::{
    evaluate_eod, InstrumentPhase, MonitorConfig, ReconcileStatus, ReconciliationMonitor,
};
use crate::trading::{
    InstrumentBook, InstrumentConfig, Normalized, PortfolioState, PositionSizer, SignalNormalizer,
    TradingConfig,
};

/// Bot configuration.
#[derive(Debug, Clone, Serialize)]
pub struct BotConfig {
    /// Database URL
    pub database_url: String,

    /// Use the in-process paper broker instead of the REST gateway
    pub dry_run: bool,

    /// Cash the paper broker reports
    pub paper_cash: Decimal,

    pub trading_config: TradingConfig,
    pub executor_config: ExecutorConfig,
    pub monitor_config: MonitorConfig,
    pub retry_policy: RetryPolicy,
    pub instruments: InstrumentBook,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:synthbridge.db?mode=rwc".to_string(),
            dry_run: true,
            paper_cash: dec!(3000000),
            trading_config: TradingConfig::default(),
            executor_config: ExecutorConfig::default(),
            monitor_config: MonitorConfig::default(),
            retry_policy: RetryPolicy::default(),
            instruments: InstrumentBook::default(),
        }
    }
}

/// Margin part of the health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginReport {
    pub available_cash: Decimal,
    pub max_lots: u32,
}

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub open_positions: usize,
    pub market_hours_open: bool,
    pub margin: Option<MarginReport>,
    pub suspended: Vec<String>,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    store: PositionStore,
    broker: Arc<dyn Broker>,
    instruments: Arc<InstrumentBook>,
    normalizer: SignalNormalizer,
    sizer: PositionSizer,
    executor: SyntheticExecutor,
    monitor: Arc<ReconciliationMonitor>,

    // Saga sequence, seeded from the store
    sequence: AtomicU64,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    /// Create a bot with the broker chosen by `dry_run`.
    pub async fn new(config: BotConfig) -> Result<Self> {
        let broker: Arc<dyn Broker> = if config.dry_run {
            info!(cash = %config.paper_cash, "Using paper broker");
            Arc::new(PaperBroker::new(config.paper_cash))
        } else {
            let http = HttpBroker::from_env().context("Broker gateway not configured")?;
            Arc::new(RetryingBroker::new(http, config.retry_policy.clone()))
        };
        Self::with_broker(config, broker).await
    }

    /// Create a bot around an existing broker.
    pub async fn with_broker(config: BotConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let store = PositionStore::new(&config.database_url).await?;
        let instruments = Arc::new(config.instruments.clone());

        Ok(Self {
            normalizer: SignalNormalizer::new(config.trading_config.clone(), instruments.clone()),
            sizer: PositionSizer::new(config.trading_config.clone()),
            executor: SyntheticExecutor::new(
                broker.clone(),
                store.clone(),
                config.executor_config.clone(),
            ),
            monitor: Arc::new(ReconciliationMonitor::new(
                broker.clone(),
                store.clone(),
                instruments.clone(),
                config.monitor_config.clone(),
            )),
            sequence: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
            store,
            broker,
            instruments,
        })
    }

    pub fn monitor(&self) -> Arc<ReconciliationMonitor> {
        self.monitor.clone()
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn instruments(&self) -> &InstrumentBook {
        &self.instruments
    }

    pub fn base_equity(&self) -> Decimal {
        self.config.trading_config.base_equity
    }

    /// Recover from the previous run; must complete before serving.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing bot...");

        let last_sequence = self.store.max_sequence().await?;
        self.sequence.store(last_sequence, Ordering::SeqCst);

        // A saga left mid-flight means the broker may hold legs we never stored
        let incomplete = self.store.incomplete_sagas().await?;
        for saga in &incomplete {
            self.store.suspend(&saga.instrument, "incomplete_saga").await?;
            self.store
                .raise_alert(
                    Some(&saga.instrument),
                    AlertSeverity::Critical,
                    "incomplete_saga",
                    &format!(
                        "saga {} (#{}, {}) left in state {}",
                        saga.id, saga.sequence, saga.kind, saga.state
                    ),
                )
                .await;
        }

        let results = self
            .monitor
            .reconcile_all()
            .await
            .context("Startup reconciliation failed")?;

        for (instrument, status) in &results {
            if *status != ReconcileStatus::InSync {
                continue;
            }
            // Broker agrees with the store: a crashed saga left nothing behind
            if self.clears_incomplete_saga(instrument, &incomplete).await? {
                info!(instrument = %instrument, "Incomplete saga left no exposure; resuming");
            }
        }

        let open = self.store.load_open_positions().await?;
        let suspended = self.store.suspensions().await?;
        info!(
            open_positions = open.len(),
            suspended = suspended.len(),
            incomplete_sagas = incomplete.len(),
            last_sequence,
            dry_run = self.config.dry_run,
            "Bot initialized"
        );
        Ok(())
    }

    async fn clears_incomplete_saga(&self, instrument: &str, incomplete: &[SagaRecord]) -> Result<bool> {
        if !incomplete.iter().any(|s| s.instrument == instrument) {
            return Ok(false);
        }
        match self.store.suspension(instrument).await? {
            Some(s) if s.reason == "incomplete_saga" => {
                self.store
                    .resolve_sagas(instrument, "broker matched store at startup")
                    .await?;
                self.store.clear_suspension(instrument).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Handle one webhook body received now.
    pub async fn handle_webhook(&self, body: &[u8]) -> SignalOutcome {
        self.handle_webhook_at(body, Utc::now()).await
    }

    /// Handle one webhook body received at `now`.
    pub async fn handle_webhook_at(&self, body: &[u8], now: DateTime<Utc>) -> SignalOutcome {
        let signal = match self.normalizer.normalize(body, now) {
            Ok(Normalized::Accepted(signal)) => signal,
            Ok(Normalized::OutsideMarketHours(signal)) => {
                info!(instrument = %signal.instrument, kind = %signal.kind, "Signal outside market hours");
                return SignalOutcome::ignored("outside_market_hours");
            }
            Err(e) => {
                warn!(error = %e, "Signal rejected");
                return SignalOutcome::rejected(e.to_string());
            }
        };

        info!(
            instrument = %signal.instrument,
            kind = %signal.kind,
            price = %signal.price,
            "Signal received"
        );

        let result = match signal.kind {
            SignalKind::EodMonitor => self.process_eod(&signal, now).await,
            _ => self.process_direct(&signal, now).await,
        };

        match result {
            Ok(outcome) => {
                info!(
                    instrument = %signal.instrument,
                    kind = %signal.kind,
                    status = ?outcome.status,
                    reason = outcome.reason.as_deref().unwrap_or("-"),
                    duplicate = outcome.duplicate,
                    "Signal handled"
                );
                outcome
            }
            Err(e) => {
                error!(instrument = %signal.instrument, error = %e, "Signal processing failed");
                SignalOutcome::rejected(format!("internal_error: {}", e))
            }
        }
    }

    async fn suspension_outcome(&self, instrument: &str) -> Result<Option<SignalOutcome>> {
        Ok(self
            .store
            .suspension(instrument)
            .await?
            .map(|s: StoredSuspension| SignalOutcome::rejected(format!("instrument_suspended: {}", s.reason))))
    }

    /// BASE_ENTRY, PYRAMID and EXIT.
    async fn process_direct(&self, signal: &Signal, now: DateTime<Utc>) -> Result<SignalOutcome> {
        let Some(_guard) = self.monitor.acquire(&signal.instrument).await else {
            return Ok(SignalOutcome::rejected("instrument_busy"));
        };

        if let Some(prior) = self.normalizer.prior_outcome(&self.store, signal, now).await? {
            info!(instrument = %signal.instrument, kind = %signal.kind, "Duplicate signal");
            return Ok(prior);
        }
        if let Some(outcome) = self.suspension_outcome(&signal.instrument).await? {
            return Ok(outcome);
        }

        // A waiting EOD cycle owns the phase; it re-validates after this runs
        let eod_waiting =
            self.monitor.phase(&signal.instrument).await == InstrumentPhase::ConditionsChecked;
        if !eod_waiting {
            self.monitor
                .set_phase(&signal.instrument, InstrumentPhase::Executing)
                .await;
        }
        let outcome = self.execute_decision(signal, now).await;
        if !eod_waiting {
            self.monitor
                .set_phase(&signal.instrument, InstrumentPhase::Settled)
                .await;
        }
        let outcome = outcome?;

        self.normalizer
            .remember(&self.store, signal, &outcome, now)
            .await?;
        Ok(outcome)
    }

    /// EOD_MONITOR: decide from the store at T−Δ1, re-validate at T−Δ2.
    async fn process_eod(&self, signal: &Signal, now: DateTime<Utc>) -> Result<SignalOutcome> {
        if !self.monitor.begin_eod(&signal.instrument).await {
            return Ok(SignalOutcome::rejected("eod_cycle_in_progress"));
        }
        let result = self.run_eod_cycle(signal, now).await;
        self.monitor
            .set_phase(&signal.instrument, InstrumentPhase::Settled)
            .await;
        result
    }

    async fn run_eod_cycle(&self, signal: &Signal, now: DateTime<Utc>) -> Result<SignalOutcome> {
        let instrument = signal.instrument.as_str();

        if let Some(prior) = self.normalizer.prior_outcome(&self.store, signal, now).await? {
            return Ok(prior);
        }
        if let Some(outcome) = self.suspension_outcome(instrument).await? {
            return Ok(outcome);
        }

        // Conditions check: broker snapshot first, then the store decides
        let decision = {
            let Some(_guard) = self.monitor.acquire(instrument).await else {
                return Ok(SignalOutcome::rejected("instrument_busy"));
            };
            let broker_positions = self.broker.get_positions().await?;
            if let ReconcileStatus::Diverged { .. } = self
                .monitor
                .reconcile_instrument(instrument, &broker_positions)
                .await?
            {
                return Ok(SignalOutcome::rejected("state_divergence"));
            }
            let position = self.store.load_position(instrument).await?;
            let decision = evaluate_eod(&position, &signal.conditions);
            info!(
                instrument,
                in_position = position.is_open(),
                pyramid_count = position.pyramid_count(),
                decision = decision.map(|k| k.as_str()).unwrap_or("none"),
                "EOD conditions checked against store"
            );
            decision
        };

        let Some(kind) = decision else {
            let outcome = SignalOutcome::processed("no_action");
            self.normalizer
                .remember(&self.store, signal, &outcome, now)
                .await?;
            return Ok(outcome);
        };

        let delay = self.monitor.config().eod_execution_delay_secs;
        if delay > 0 {
            debug!(instrument, delay_secs = delay, "Waiting for EOD execution time");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        // Execution time: fresh read under the lock
        let Some(_guard) = self.monitor.acquire(instrument).await else {
            return Ok(SignalOutcome::rejected("instrument_busy"));
        };
        if let Some(outcome) = self.suspension_outcome(instrument).await? {
            return Ok(outcome);
        }
        let position = self.store.load_position(instrument).await?;
        if evaluate_eod(&position, &signal.conditions) != Some(kind) {
            warn!(instrument, planned = %kind, "Position changed between check and execution");
            return Ok(SignalOutcome::rejected("state_changed"));
        }

        self.monitor
            .set_phase(instrument, InstrumentPhase::Executing)
            .await;
        let outcome = self.execute_decision(&signal.with_kind(kind), now).await?;
        self.normalizer
            .remember(&self.store, signal, &outcome, now)
            .await?;
        Ok(outcome)
    }

    /// Gate, size and execute a signal. Caller holds the instrument lock.
    async fn execute_decision(&self, signal: &Signal, now: DateTime<Utc>) -> Result<SignalOutcome> {
        let (name, cfg) = self
            .instruments
            .get(&signal.instrument)
            .with_context(|| format!("Unknown instrument {}", signal.instrument))?;
        let mut position = self.store.load_position(name).await?;

        // Any stop on an open position ratchets the trailing stop
        if position.is_open() && signal.kind != SignalKind::Exit {
            if let Some(stop) = signal.stop {
                if position.trail_stop(stop) {
                    self.store.save_position(&position).await?;
                    info!(instrument = name, stop = %stop, "Trailing stop raised");
                }
            }
        }

        match signal.kind {
            SignalKind::BaseEntry => {
                if position.is_open() {
                    return Ok(SignalOutcome::rejected("already_in_position"));
                }
                self.enter(signal, position, cfg, now).await
            }
            SignalKind::Pyramid => {
                if !position.is_open() {
                    return Ok(SignalOutcome::rejected("not_in_position"));
                }
                if position.pyramid_count() >= self.config.trading_config.max_pyramids {
                    return Ok(SignalOutcome::rejected("max_pyramids_reached"));
                }
                if let (Some(last), Some(atr)) = (position.last_leg(), signal.atr) {
                    let gap = signal.price - last.entry_price;
                    if gap < atr * self.config.trading_config.pyramid_min_atr_gap {
                        debug!(instrument = name, gap = %gap, atr = %atr, "Pyramid too close to last entry");
                        return Ok(SignalOutcome::rejected("pyramid_gap_not_met"));
                    }
                }
                self.enter(signal, position, cfg, now).await
            }
            SignalKind::Exit => {
                if !position.is_open() {
                    return Ok(SignalOutcome::rejected("not_in_position"));
                }
                self.exit(signal, &position, cfg).await
            }
            SignalKind::EodMonitor => Ok(SignalOutcome::rejected("unsupported_signal_type")),
        }
    }

    async fn enter(
        &self,
        signal: &Signal,
        position: Position,
        cfg: &InstrumentConfig,
        now: DateTime<Utc>,
    ) -> Result<SignalOutcome> {
        // Funds are read fresh for every sizing decision
        let funds = match self.broker.get_funds().await {
            Ok(funds) => funds,
            Err(e) => {
                warn!(instrument = %signal.instrument, error = %e, "Funds unavailable");
                return Ok(SignalOutcome::rejected(format!("funds_unavailable: {}", e)));
            }
        };
        let realized = self.store.realized_pnl_total().await?;
        let portfolio = PortfolioState {
            equity: self.config.trading_config.base_equity + realized,
            available_margin: funds.available_cash,
            position: position.clone(),
        };

        let decision = match self.sizer.size(signal, &portfolio, cfg) {
            Ok(decision) => decision,
            Err(e) => return Ok(SignalOutcome::rejected(e.to_string())),
        };
        info!(
            instrument = %signal.instrument,
            lots = decision.lots,
            limiting_factor = %decision.limiting_factor,
            risk_lots = decision.constraints.risk_lots,
            volatility_lots = decision.constraints.volatility_lots,
            margin_lots = decision.constraints.margin_lots,
            "Position sized"
        );
        if let Some(suggested) = decision.suggested_lots {
            if suggested != decision.lots {
                info!(suggested, computed = decision.lots, "Ignoring suggested lot count");
            }
        }
        if decision.is_rejected() {
            return Ok(SignalOutcome::rejected(decision.limiting_factor.as_str()));
        }

        let today = now.with_timezone(&cfg.session.timezone).date_naive();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let intent = match ExecutionIntent::entry(sequence, signal, decision.lots, cfg, today) {
            Ok(intent) => intent,
            Err(e) => return Ok(SignalOutcome::rejected(e.to_string())),
        };

        Ok(match self.executor.execute_entry(&intent, &position).await? {
            EntryOutcome::Committed(_) => SignalOutcome::executed(decision.lots),
            EntryOutcome::Aborted { reason } => {
                SignalOutcome::rejected(format!("entry_aborted: {}", reason))
            }
            EntryOutcome::PartiallyFailed { reason, unwound } => SignalOutcome::rejected(format!(
                "partial_failure: {}{}",
                reason,
                if unwound { "" } else { " (exposure unresolved)" }
            )),
        })
    }

    async fn exit(
        &self,
        signal: &Signal,
        position: &Position,
        cfg: &InstrumentConfig,
    ) -> Result<SignalOutcome> {
        let intent = ExitIntent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            dedupe_hash: signal.dedupe_hash(),
            instrument: position.instrument.clone(),
            exit_price: signal.price,
        };

        Ok(match self.executor.execute_exit(&intent, position, cfg).await? {
            ExitOutcome::Closed { .. } => SignalOutcome::executed(position.total_lots()),
            ExitOutcome::Aborted { reason } => {
                SignalOutcome::rejected(format!("exit_aborted: {}", reason))
            }
            ExitOutcome::PartiallyFailed { reason } => {
                SignalOutcome::rejected(format!("partial_failure: {}", reason))
            }
        })
    }

    /// Health snapshot; a failing funds call degrades rather than errors.
    pub async fn health(&self) -> HealthReport {
        let now = Utc::now();
        let market_hours_open = self
            .instruments
            .iter()
            .any(|(_, cfg)| cfg.session.is_open(now));

        let mut degraded = false;
        let open_positions = match self.store.load_open_positions().await {
            Ok(p) => p.len(),
            Err(e) => {
                warn!(error = %e, "Health: store unavailable");
                degraded = true;
                0
            }
        };
        let suspended = match self.store.suspensions().await {
            Ok(s) => s.into_iter().map(|s| s.instrument).collect(),
            Err(_) => {
                degraded = true;
                Vec::new()
            }
        };
        let margin = match self.broker.get_funds().await {
            Ok(funds) => {
                let per_lot = self.instruments.max_margin_per_lot();
                let max_lots = if per_lot > Decimal::ZERO {
                    (funds.available_cash / per_lot)
                        .floor()
                        .to_u32()
                        .unwrap_or(0)
                } else {
                    0
                };
                Some(MarginReport {
                    available_cash: funds.available_cash,
                    max_lots,
                })
            }
            Err(e) => {
                warn!(error = %e, "Health: funds unavailable");
                degraded = true;
                None
            }
        };

        HealthReport {
            status: if degraded { "degraded" } else { "ok" }.to_string(),
            open_positions,
            market_hours_open,
            margin,
            suspended,
        }
    }

    /// Serve webhooks and reconcile periodically until Ctrl+C.
    pub async fn run(self: Arc<Self>, bind: std::net::SocketAddr) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            reconcile_interval = self.config.monitor_config.reconcile_interval_secs,
            "Starting bot run loop"
        );

        let reconciler = tokio::spawn(self.monitor.clone().run(self.shutdown.clone()));

        let shutdown = self.shutdown.clone();
        let result = crate::server::serve(self.clone(), bind, async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })
        .await;

        self.shutdown.store(true, Ordering::SeqCst);
        reconciler.abort();
        info!("Bot shutdown complete");
        result
    }
}

/// Snapshot for the `status` command.
#[derive(Debug, Clone)]
pub struct BotStatus {
    pub positions: Vec<Position>,
    pub suspensions: Vec<StoredSuspension>,
    pub incomplete_sagas: Vec<SagaRecord>,
    pub alerts: i64,
    pub realized_pnl: Decimal,
    pub equity: Decimal,
}

impl BotStatus {
    pub async fn load(store: &PositionStore, base_equity: Decimal) -> Result<Self> {
        let realized_pnl = store.realized_pnl_total().await?;
        Ok(Self {
            positions: store.load_open_positions().await?,
            suspensions: store.suspensions().await?,
            incomplete_sagas: store.incomplete_sagas().await?,
            alerts: store.alert_count().await?,
            realized_pnl,
            equity: base_equity + realized_pnl,
        })
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bridge Status ===")?;
        writeln!(f, "Equity:          {:.2}", self.equity)?;
        writeln!(f, "Realized P&L:    {:.2}", self.realized_pnl)?;
        writeln!(f, "Open Positions:  {}", self.positions.len())?;
        for p in &self.positions {
            writeln!(
                f,
                "  {:<12} {} lots, {} pyramid(s)",
                p.instrument,
                p.total_lots(),
                p.pyramid_count()
            )?;
            for (level, leg) in p.legs.iter().enumerate() {
                writeln!(
                    f,
                    "    L{} {} / {} x{} entry {} stop {}",
                    level, leg.pe_symbol, leg.ce_symbol, leg.lots, leg.entry_price, leg.stop_price
                )?;
            }
        }
        writeln!(f, "Suspended:       {}", self.suspensions.len())?;
        for s in &self.suspensions {
            writeln!(f, "  {:<12} {} (since {})", s.instrument, s.reason, s.since)?;
        }
        writeln!(f, "Incomplete Sagas: {}", self.incomplete_sagas.len())?;
        for s in &self.incomplete_sagas {
            writeln!(f, "  #{} {} {} {}", s.sequence, s.instrument, s.kind, s.state)?;
        }
        writeln!(f, "Alerts:          {}", self.alerts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scripted::{Behavior, ScriptedBroker};
    use crate::api::OrderSide;
    use crate::models::OutcomeStatus;
    use chrono::TimeZone;
    use serde_json::json;

    // Wed 2024-12-04 10:00 IST
    fn market_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 4, 4, 30, 0).unwrap()
    }

    fn test_config(dir: &tempfile::TempDir) -> BotConfig {
        BotConfig {
            database_url: format!("sqlite://{}?mode=rwc", dir.path().join("bot.db").display()),
            dry_run: true,
            trading_config: TradingConfig {
                vol_pct: dec!(0.5),
                ..Default::default()
            },
            executor_config: ExecutorConfig {
                fill_timeout_ms: 150,
                poll_initial_ms: 5,
                poll_max_ms: 20,
            },
            monitor_config: MonitorConfig {
                eod_execution_delay_secs: 0,
                lock_wait_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<Bot>, ScriptedBroker, tempfile::TempDir) {
        setup_with_eod_delay(0).await
    }

    async fn setup_with_eod_delay(delay_secs: u64) -> (Arc<Bot>, ScriptedBroker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let broker = ScriptedBroker::new();
        let mut config = test_config(&dir);
        config.monitor_config.eod_execution_delay_secs = delay_secs;
        let bot = Bot::with_broker(config, Arc::new(broker.clone()))
            .await
            .unwrap();
        bot.initialize().await.unwrap();
        (Arc::new(bot), broker, dir)
    }

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn base_entry(now: DateTime<Utc>) -> Vec<u8> {
        body(json!({
            "type": "BASE_ENTRY",
            "instrument": "BANK_NIFTY",
            "timestamp": now.to_rfc3339(),
            "price": 52000,
            "stop": 51650,
            "atr": 350,
            "efficiencyRatio": 0.82,
            "suggestedLots": 10
        }))
    }

    #[tokio::test]
    async fn test_base_entry_executes_and_stores() {
        let (bot, broker, _dir) = setup().await;
        let now = market_now();

        let outcome = bot.handle_webhook_at(&base_entry(now), now).await;
        // vol 0.5%: risk 1, vol 2, margin 11 -> 1 lot, suggested 10 ignored
        assert_eq!(outcome, SignalOutcome::executed(1));
        assert_eq!(broker.orders().await.len(), 2);

        let position = bot.store().load_position("BANK_NIFTY").await.unwrap();
        assert_eq!(position.total_lots(), 1);
        assert_eq!(position.legs[0].pe_symbol, "BANKNIFTY24DEC52000PE");
    }

    #[tokio::test]
    async fn test_duplicate_signal_places_no_orders() {
        let (bot, broker, _dir) = setup().await;
        let now = market_now();

        let first = bot.handle_webhook_at(&base_entry(now), now).await;
        let second = bot
            .handle_webhook_at(&base_entry(now), now + chrono::Duration::seconds(5))
            .await;

        assert_eq!(first.status, OutcomeStatus::Processed);
        assert!(second.duplicate);
        assert_eq!(second.lots, first.lots);
        assert_eq!(broker.orders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_volatility_bound_entry_is_rejected() {
        let (bot, broker, _dir) = setup().await;
        let now = market_now();
        let payload = body(json!({
            "type": "BASE_ENTRY",
            "instrument": "BANK_NIFTY",
            "timestamp": now.to_rfc3339(),
            "price": 52000,
            "stop": 51650,
            "atr": 1500,
            "efficiencyRatio": 0.82
        }));

        let outcome = bot.handle_webhook_at(&payload, now).await;
        assert_eq!(outcome, SignalOutcome::rejected("volatility"));
        assert!(broker.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_outside_hours_is_ignored() {
        let (bot, broker, _dir) = setup().await;
        let evening = Utc.with_ymd_and_hms(2024, 12, 4, 12, 0, 0).unwrap();
        let outcome = bot.handle_webhook_at(&base_entry(evening), evening).await;
        assert_eq!(outcome, SignalOutcome::ignored("outside_market_hours"));
        assert!(broker.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_leg2_failure_leaves_no_position() {
        let (bot, broker, _dir) = setup().await;
        broker.set_behavior("CE", None, Behavior::NeverFill).await;
        let now = market_now();

        let outcome = bot.handle_webhook_at(&base_entry(now), now).await;
        assert_eq!(outcome.status, OutcomeStatus::Rejected);
        assert!(outcome.reason.unwrap().starts_with("partial_failure"));
        assert!(broker.is_flat().await);
        assert!(!bot.store().load_position("BANK_NIFTY").await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_exit_closes_stored_legs_after_price_moves() {
        let (bot, broker, _dir) = setup().await;
        let now = market_now();
        bot.handle_webhook_at(&base_entry(now), now).await;

        let later = now + chrono::Duration::minutes(30);
        let exit = body(json!({
            "type": "EXIT",
            "instrument": "BANK_NIFTY",
            "timestamp": later.to_rfc3339(),
            "price": 53480
        }));
        let outcome = bot.handle_webhook_at(&exit, later).await;
        assert_eq!(outcome, SignalOutcome::executed(1));

        let orders = broker.orders().await;
        assert_eq!(orders[2].symbol, "BANKNIFTY24DEC52000PE");
        assert_eq!(orders[2].side, OrderSide::Buy);
        assert_eq!(orders[3].symbol, "BANKNIFTY24DEC52000CE");
        assert!(broker.is_flat().await);
        // (53480 - 52000) * 1 lot * 30
        assert_eq!(bot.store().realized_pnl_total().await.unwrap(), dec!(44400));
    }

    #[tokio::test]
    async fn test_pyramid_gates() {
        let (bot, _broker, _dir) = setup().await;
        let now = market_now();

        let pyramid = |ts: DateTime<Utc>, price: i64| {
            body(json!({
                "type": "PYRAMID",
                "instrument": "BANK_NIFTY",
                "timestamp": ts.to_rfc3339(),
                "price": price,
                "stop": price - 350,
                "atr": 350,
                "efficiencyRatio": 0.9
            }))
        };

        let early = bot.handle_webhook_at(&pyramid(now, 52400), now).await;
        assert_eq!(early, SignalOutcome::rejected("not_in_position"));

        bot.handle_webhook_at(&base_entry(now), now).await;
        let t = now + chrono::Duration::minutes(1);
        let close = bot.handle_webhook_at(&pyramid(t, 52100), t).await;
        assert_eq!(close, SignalOutcome::rejected("pyramid_gap_not_met"));
    }

    #[tokio::test]
    async fn test_trailing_stop_only_rises() {
        let (bot, _broker, _dir) = setup().await;
        let now = market_now();
        bot.handle_webhook_at(&base_entry(now), now).await;

        // A repeated BASE_ENTRY while open is rejected but still trails the stop
        let t = now + chrono::Duration::minutes(1);
        let raise = body(json!({
            "type": "BASE_ENTRY",
            "instrument": "BANK_NIFTY",
            "timestamp": t.to_rfc3339(),
            "price": 52600,
            "stop": 51900,
            "atr": 350,
            "efficiencyRatio": 0.8
        }));
        assert_eq!(
            bot.handle_webhook_at(&raise, t).await,
            SignalOutcome::rejected("already_in_position")
        );
        let stored = bot.store().load_position("BANK_NIFTY").await.unwrap();
        assert_eq!(stored.legs[0].stop_price, dec!(51900));

        let t2 = t + chrono::Duration::minutes(1);
        let lower = body(json!({
            "type": "BASE_ENTRY",
            "instrument": "BANK_NIFTY",
            "timestamp": t2.to_rfc3339(),
            "price": 52300,
            "stop": 51700,
            "atr": 350,
            "efficiencyRatio": 0.8
        }));
        bot.handle_webhook_at(&lower, t2).await;
        let stored = bot.store().load_position("BANK_NIFTY").await.unwrap();
        assert_eq!(stored.legs[0].stop_price, dec!(51900));
    }

    #[tokio::test]
    async fn test_eod_uses_store_not_payload() {
        let (bot, broker, _dir) = setup().await;
        let now = market_now();
        // Payload claims an open position; the store says flat
        let eod = body(json!({
            "type": "EOD_MONITOR",
            "instrument": "BANK_NIFTY",
            "timestamp": now.to_rfc3339(),
            "position_status": {"in_position": true, "pyramid_count": 2},
            "conditions": {"entry": true, "pyramid": true, "exit": false},
            "indicators": {"price": 52000, "stop": 51650, "atr": 350, "er": 0.82}
        }));

        let outcome = bot.handle_webhook_at(&eod, now).await;
        assert_eq!(outcome, SignalOutcome::executed(1));
        let orders = broker.orders().await;
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(bot.monitor().phase("BANK_NIFTY").await, InstrumentPhase::Settled);
    }

    #[tokio::test]
    async fn test_eod_without_conditions_is_no_action() {
        let (bot, broker, _dir) = setup().await;
        let now = market_now();
        let eod = body(json!({
            "type": "EOD_MONITOR",
            "instrument": "NIFTY",
            "timestamp": now.to_rfc3339(),
            "price": 24000,
            "conditions": {"entry": false, "pyramid": true, "exit": true}
        }));
        assert_eq!(
            bot.handle_webhook_at(&eod, now).await,
            SignalOutcome::processed("no_action")
        );
        assert!(broker.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_signals_serialize_per_instrument() {
        let (bot, broker, _dir) = setup().await;
        let now = market_now();
        let a = base_entry(now);
        let b = base_entry(now + chrono::Duration::seconds(1));

        let (ra, rb) = tokio::join!(
            bot.handle_webhook_at(&a, now),
            bot.handle_webhook_at(&b, now + chrono::Duration::seconds(1))
        );

        let executed = [&ra, &rb].iter().filter(|o| o.lots.is_some()).count();
        assert_eq!(executed, 1);
        assert!([&ra, &rb]
            .iter()
            .any(|o| o.reason.as_deref() == Some("already_in_position")));
        assert_eq!(broker.orders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_suspended_instrument_rejects_signals() {
        let (bot, broker, _dir) = setup().await;
        bot.store().suspend("BANK_NIFTY", "state_divergence").await.unwrap();
        let now = market_now();
        let outcome = bot.handle_webhook_at(&base_entry(now), now).await;
        assert_eq!(
            outcome,
            SignalOutcome::rejected("instrument_suspended: state_divergence")
        );
        assert!(broker.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_startup_with_unrecorded_broker_legs_suspends() {
        let dir = tempfile::tempdir().unwrap();
        let broker = ScriptedBroker::new();
        broker.set_position("NIFTY24DEC24000PE", -75).await;
        broker.set_position("NIFTY24DEC24000CE", 75).await;

        let bot = Bot::with_broker(test_config(&dir), Arc::new(broker.clone()))
            .await
            .unwrap();
        tokio_test::assert_ok!(bot.initialize().await);

        assert_eq!(
            bot.store().suspension("NIFTY").await.unwrap().unwrap().reason,
            "state_divergence"
        );
        let health = bot.health().await;
        assert_eq!(health.suspended, vec!["NIFTY".to_string()]);
    }

    #[tokio::test]
    async fn test_health_degrades_without_funds() {
        let (bot, broker, _dir) = setup().await;
        let health = bot.health().await;
        assert_eq!(health.status, "ok");
        // 3,000,000 / 270,000
        assert_eq!(health.margin.as_ref().unwrap().max_lots, 11);

        broker.set_funds_unavailable(true).await;
        let health = bot.health().await;
        assert_eq!(health.status, "degraded");
        assert!(health.margin.is_none());
    }

    // A direct EXIT lands while an EOD cycle waits for execution time. The
    // cycle stays in flight, so a second EOD is still refused, and the first
    // one sees the closed position and places nothing.
    #[tokio::test]
    async fn test_direct_signal_during_eod_wait_keeps_cycle_in_flight() {
        let (bot, broker, _dir) = setup_with_eod_delay(1).await;
        let now = market_now();
        assert_eq!(
            bot.handle_webhook_at(&base_entry(now), now).await,
            SignalOutcome::executed(1)
        );

        let eod = |at: DateTime<Utc>| {
            body(json!({
                "type": "EOD_MONITOR",
                "instrument": "BANK_NIFTY",
                "timestamp": at.to_rfc3339(),
                "price": 51500,
                "conditions": {"entry": false, "pyramid": false, "exit": true}
            }))
        };

        let first_at = now + chrono::Duration::seconds(1);
        let first = tokio::spawn({
            let bot = bot.clone();
            let payload = eod(first_at);
            async move { bot.handle_webhook_at(&payload, first_at).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let exit_at = now + chrono::Duration::seconds(2);
        let exit = body(json!({
            "type": "EXIT",
            "instrument": "BANK_NIFTY",
            "timestamp": exit_at.to_rfc3339(),
            "price": 51500
        }));
        assert_eq!(
            bot.handle_webhook_at(&exit, exit_at).await,
            SignalOutcome::executed(1)
        );
        assert_eq!(
            bot.monitor().phase("BANK_NIFTY").await,
            InstrumentPhase::ConditionsChecked
        );

        let second_at = now + chrono::Duration::seconds(3);
        assert_eq!(
            bot.handle_webhook_at(&eod(second_at), second_at).await,
            SignalOutcome::rejected("eod_cycle_in_progress")
        );

        assert_eq!(first.await.unwrap(), SignalOutcome::rejected("state_changed"));
        assert_eq!(broker.orders().await.len(), 4);
        assert!(broker.is_flat().await);
        assert_eq!(bot.monitor().phase("BANK_NIFTY").await, InstrumentPhase::Settled);
    }
}
