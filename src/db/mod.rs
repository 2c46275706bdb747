//! Position store: the single source of truth for what we hold.
//!
//! Stores everything needed to resume after restart:
//! - Positions and their legs (one row per pyramid level)
//! - Seen signals with their outcome (dedupe window)
//! - The saga log of every two-leg order sequence
//! - Per-instrument suspensions and operator alerts
//! - Realized P&L per exit (equity curve)
//!
//! Prices are stored as decimal TEXT and timestamps as RFC 3339 TEXT.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use tracing::{error, warn};

use crate::models::{Leg, Position, PositionStatus, SignalOutcome};

/// Persistent store handle; cheap to clone.
#[derive(Clone)]
pub struct PositionStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredLeg {
    entry_price: String,
    stop_price: String,
    strike: String,
    pe_symbol: String,
    ce_symbol: String,
    lots: i64,
    opened_at: String,
}

impl StoredLeg {
    fn into_leg(self) -> Result<Leg> {
        Ok(Leg {
            entry_price: parse_decimal(&self.entry_price)?,
            stop_price: parse_decimal(&self.stop_price)?,
            strike: parse_decimal(&self.strike)?,
            pe_symbol: self.pe_symbol,
            ce_symbol: self.ce_symbol,
            lots: u32::try_from(self.lots).context("Negative lot count in store")?,
            opened_at: parse_time(&self.opened_at)?,
        })
    }
}

/// Lifecycle of one two-leg order sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Started,
    Leg1Filled,
    Committed,
    Aborted,
    Unwound,
    UnwindFailed,
    ExitIncomplete,
    /// An order may or may not exist at the broker
    OrderUnknown,
    Resolved,
}

impl SagaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "started",
            SagaState::Leg1Filled => "leg1_filled",
            SagaState::Committed => "committed",
            SagaState::Aborted => "aborted",
            SagaState::Unwound => "unwound",
            SagaState::UnwindFailed => "unwind_failed",
            SagaState::ExitIncomplete => "exit_incomplete",
            SagaState::OrderUnknown => "order_unknown",
            SagaState::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "started" => SagaState::Started,
            "leg1_filled" => SagaState::Leg1Filled,
            "committed" => SagaState::Committed,
            "aborted" => SagaState::Aborted,
            "unwound" => SagaState::Unwound,
            "unwind_failed" => SagaState::UnwindFailed,
            "exit_incomplete" => SagaState::ExitIncomplete,
            "order_unknown" => SagaState::OrderUnknown,
            "resolved" => SagaState::Resolved,
            _ => return None,
        })
    }

    /// States that may leave broker exposure the store does not describe.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            SagaState::Started
                | SagaState::Leg1Filled
                | SagaState::UnwindFailed
                | SagaState::ExitIncomplete
                | SagaState::OrderUnknown
        )
    }
}

/// Saga log row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SagaRecord {
    pub id: String,
    pub sequence: i64,
    pub instrument: String,
    pub kind: String,
    pub dedupe_hash: String,
    pub state: String,
    pub lots: i64,
    pub leg1_symbol: Option<String>,
    pub leg1_order_id: Option<String>,
    pub leg1_filled: i64,
    pub leg2_symbol: Option<String>,
    pub leg2_order_id: Option<String>,
    pub leg2_filled: i64,
    pub note: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SagaRecord {
    pub fn new(
        id: impl Into<String>,
        sequence: u64,
        instrument: &str,
        kind: &str,
        dedupe_hash: &str,
        lots: u32,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            sequence: sequence as i64,
            instrument: instrument.to_string(),
            kind: kind.to_string(),
            dedupe_hash: dedupe_hash.to_string(),
            state: SagaState::Started.as_str().to_string(),
            lots: i64::from(lots),
            leg1_symbol: None,
            leg1_order_id: None,
            leg1_filled: 0,
            leg2_symbol: None,
            leg2_order_id: None,
            leg2_filled: 0,
            note: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn saga_state(&self) -> Option<SagaState> {
        SagaState::parse(&self.state)
    }

    pub fn set_state(&mut self, state: SagaState) {
        self.state = state.as_str().to_string();
    }
}

/// Why an instrument stopped accepting signals.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredSuspension {
    pub instrument: String,
    pub reason: String,
    pub since: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Operator-visible alert.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredAlert {
    pub id: i64,
    pub instrument: Option<String>,
    pub severity: String,
    pub kind: String,
    pub message: String,
    pub created_at: String,
}

/// Realized P&L of one exit.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub id: i64,
    pub timestamp: String,
    pub instrument: String,
    pub realized_pnl: String,
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal in store: {}", s))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in store: {}", s))?
        .with_timezone(&Utc))
}

impl PositionStore {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                instrument TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One row per pyramid level; level 0 is the base entry
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS legs (
                instrument TEXT NOT NULL,
                level INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                stop_price TEXT NOT NULL,
                strike TEXT NOT NULL,
                pe_symbol TEXT NOT NULL,
                ce_symbol TEXT NOT NULL,
                lots INTEGER NOT NULL,
                opened_at TEXT NOT NULL,
                PRIMARY KEY (instrument, level)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_signals (
                hash TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                outcome TEXT NOT NULL,
                seen_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagas (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                instrument TEXT NOT NULL,
                kind TEXT NOT NULL,
                dedupe_hash TEXT NOT NULL,
                state TEXT NOT NULL,
                lots INTEGER NOT NULL,
                leg1_symbol TEXT,
                leg1_order_id TEXT,
                leg1_filled INTEGER NOT NULL DEFAULT 0,
                leg2_symbol TEXT,
                leg2_order_id TEXT,
                leg2_filled INTEGER NOT NULL DEFAULT 0,
                note TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS suspensions (
                instrument TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                since TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT,
                severity TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                instrument TEXT NOT NULL,
                realized_pnl TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sagas_state ON sagas(state)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Positions ====================

    /// Current position for an instrument; FLAT when never traded.
    pub async fn load_position(&self, instrument: &str) -> Result<Position> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM positions WHERE instrument = ?")
                .bind(instrument)
                .fetch_optional(&self.pool)
                .await?;

        let Some((status,)) = status else {
            return Ok(Position::flat(instrument));
        };

        let rows: Vec<StoredLeg> = sqlx::query_as(
            r#"
            SELECT entry_price, stop_price, strike, pe_symbol, ce_symbol, lots, opened_at
            FROM legs WHERE instrument = ? ORDER BY level
            "#,
        )
        .bind(instrument)
        .fetch_all(&self.pool)
        .await?;

        let legs = rows
            .into_iter()
            .map(StoredLeg::into_leg)
            .collect::<Result<Vec<_>>>()?;

        Ok(Position {
            instrument: instrument.to_string(),
            legs,
            status: PositionStatus::parse(&status),
        })
    }

    /// All positions currently OPEN.
    pub async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let instruments: Vec<(String,)> =
            sqlx::query_as("SELECT instrument FROM positions WHERE status = 'OPEN' ORDER BY instrument")
                .fetch_all(&self.pool)
                .await?;

        let mut positions = Vec::with_capacity(instruments.len());
        for (instrument,) in instruments {
            positions.push(self.load_position(&instrument).await?);
        }
        Ok(positions)
    }

    /// Persist a position after checking it is a legal successor of the
    /// stored one (append-only legs, non-decreasing stops).
    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let previous = self.load_position(&position.instrument).await?;
        position
            .check_successor_of(&previous)
            .map_err(|e| anyhow!("Refusing to save {}: {}", position.instrument, e))?;

        let mut tx = self.pool.begin().await?;
        write_position(&mut tx, position).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the stored position without successor checks (broker resync).
    pub async fn overwrite_position(&self, position: &Position) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_position(&mut tx, position).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Commit an entry: new position state and the saga's final state together.
    pub async fn commit_entry(&self, position: &Position, saga: &SagaRecord) -> Result<()> {
        let previous = self.load_position(&position.instrument).await?;
        position
            .check_successor_of(&previous)
            .map_err(|e| anyhow!("Refusing to commit {}: {}", position.instrument, e))?;

        let mut tx = self.pool.begin().await?;
        write_position(&mut tx, position).await?;
        write_saga(&mut tx, saga).await?;
        tx.commit().await.context("Failed to commit entry")?;
        Ok(())
    }

    /// Commit an exit: flatten the position, close the saga and book P&L.
    pub async fn commit_exit(
        &self,
        instrument: &str,
        saga: &SagaRecord,
        realized_pnl: Decimal,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        write_position(&mut tx, &Position::flat(instrument)).await?;
        write_saga(&mut tx, saga).await?;
        sqlx::query(
            "INSERT INTO equity_curve (timestamp, instrument, realized_pnl) VALUES (?, ?, ?)",
        )
        .bind(&now)
        .bind(instrument)
        .bind(realized_pnl.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await.context("Failed to commit exit")?;
        Ok(())
    }

    // ==================== Sagas ====================

    pub async fn insert_saga(&self, saga: &SagaRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_saga(&mut tx, saga).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_saga(&self, saga: &SagaRecord) -> Result<()> {
        self.insert_saga(saga).await
    }

    /// Sagas whose outcome may not match the stored position.
    pub async fn incomplete_sagas(&self) -> Result<Vec<SagaRecord>> {
        let sagas = sqlx::query_as::<_, SagaRecord>(
            r#"
            SELECT * FROM sagas
            WHERE state IN ('started', 'leg1_filled', 'unwind_failed', 'exit_incomplete', 'order_unknown')
            ORDER BY sequence
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sagas)
    }

    pub async fn recent_sagas(&self, limit: i64) -> Result<Vec<SagaRecord>> {
        let sagas = sqlx::query_as::<_, SagaRecord>(
            "SELECT * FROM sagas ORDER BY sequence DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sagas)
    }

    /// Mark an instrument's incomplete sagas as settled by resync.
    pub async fn resolve_sagas(&self, instrument: &str, note: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sagas SET state = 'resolved', note = ?, updated_at = ?
            WHERE instrument = ?
              AND state IN ('started', 'leg1_filled', 'unwind_failed', 'exit_incomplete')
            "#,
        )
        .bind(note)
        .bind(Utc::now().to_rfc3339())
        .bind(instrument)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Highest saga sequence number issued so far.
    pub async fn max_sequence(&self) -> Result<u64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence) FROM sagas")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0).max(0) as u64)
    }

    // ==================== Seen signals ====================

    /// Stored outcome and first-seen time for a dedupe hash.
    pub async fn prior_outcome(
        &self,
        hash: &str,
    ) -> Result<Option<(SignalOutcome, DateTime<Utc>)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT outcome, seen_at FROM seen_signals WHERE hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((outcome, seen_at)) => {
                let outcome: SignalOutcome =
                    serde_json::from_str(&outcome).context("Corrupt stored outcome")?;
                Ok(Some((outcome, parse_time(&seen_at)?)))
            }
            None => Ok(None),
        }
    }

    /// Record (or refresh, once outside the window) a signal's outcome.
    pub async fn record_outcome(
        &self,
        hash: &str,
        instrument: &str,
        outcome: &SignalOutcome,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = serde_json::to_string(outcome)?;
        sqlx::query(
            r#"
            INSERT INTO seen_signals (hash, instrument, outcome, seen_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET outcome = excluded.outcome, seen_at = excluded.seen_at
            "#,
        )
        .bind(hash)
        .bind(instrument)
        .bind(outcome)
        .bind(seen_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop sightings older than `before`. Returns the number removed.
    pub async fn prune_seen_signals(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM seen_signals WHERE julianday(seen_at) < julianday(?)")
            .bind(before.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== Suspensions ====================

    /// Suspend an instrument. An existing suspension keeps its original reason.
    pub async fn suspend(&self, instrument: &str, reason: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO suspensions (instrument, reason, since) VALUES (?, ?, ?)")
            .bind(instrument)
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn suspension(&self, instrument: &str) -> Result<Option<StoredSuspension>> {
        let row = sqlx::query_as::<_, StoredSuspension>(
            "SELECT instrument, reason, since FROM suspensions WHERE instrument = ?",
        )
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn suspensions(&self) -> Result<Vec<StoredSuspension>> {
        let rows = sqlx::query_as::<_, StoredSuspension>(
            "SELECT instrument, reason, since FROM suspensions ORDER BY instrument",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn clear_suspension(&self, instrument: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM suspensions WHERE instrument = ?")
            .bind(instrument)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Alerts ====================

    pub async fn record_alert(
        &self,
        instrument: Option<&str>,
        severity: AlertSeverity,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (instrument, severity, kind, message, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(instrument)
        .bind(severity.as_str())
        .bind(kind)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Log an operator alert and persist it. Persistence failures are only logged.
    pub async fn raise_alert(
        &self,
        instrument: Option<&str>,
        severity: AlertSeverity,
        kind: &str,
        message: &str,
    ) {
        match severity {
            AlertSeverity::Critical => {
                error!(instrument = instrument.unwrap_or("-"), kind, "ALERT: {}", message)
            }
            AlertSeverity::Warning => {
                warn!(instrument = instrument.unwrap_or("-"), kind, "ALERT: {}", message)
            }
        }
        if let Err(e) = self.record_alert(instrument, severity, kind, message).await {
            error!(error = %e, "Failed to persist alert");
        }
    }

    /// Most recent alerts first.
    pub async fn recent_alerts(&self, limit: i64) -> Result<Vec<StoredAlert>> {
        let rows = sqlx::query_as::<_, StoredAlert>(
            "SELECT * FROM alerts ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn alert_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // ==================== Equity ====================

    /// Sum of realized P&L over all exits.
    pub async fn realized_pnl_total(&self) -> Result<Decimal> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT realized_pnl FROM equity_curve")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|(pnl,)| parse_decimal(pnl))
            .sum::<Result<Decimal>>()
    }

    pub async fn equity_curve(&self, limit: i64) -> Result<Vec<EquityPoint>> {
        let rows = sqlx::query_as::<_, EquityPoint>(
            "SELECT * FROM equity_curve ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn write_position(tx: &mut Transaction<'_, Sqlite>, position: &Position) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO positions (instrument, status, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(instrument) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at
        "#,
    )
    .bind(&position.instrument)
    .bind(position.status.as_str())
    .bind(&now)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM legs WHERE instrument = ?")
        .bind(&position.instrument)
        .execute(&mut **tx)
        .await?;

    for (level, leg) in position.legs.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO legs (instrument, level, entry_price, stop_price, strike,
                              pe_symbol, ce_symbol, lots, opened_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.instrument)
        .bind(level as i64)
        .bind(leg.entry_price.to_string())
        .bind(leg.stop_price.to_string())
        .bind(leg.strike.to_string())
        .bind(&leg.pe_symbol)
        .bind(&leg.ce_symbol)
        .bind(i64::from(leg.lots))
        .bind(leg.opened_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_saga(tx: &mut Transaction<'_, Sqlite>, saga: &SagaRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sagas (id, sequence, instrument, kind, dedupe_hash, state, lots,
                           leg1_symbol, leg1_order_id, leg1_filled,
                           leg2_symbol, leg2_order_id, leg2_filled,
                           note, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            leg1_symbol = excluded.leg1_symbol,
            leg1_order_id = excluded.leg1_order_id,
            leg1_filled = excluded.leg1_filled,
            leg2_symbol = excluded.leg2_symbol,
            leg2_order_id = excluded.leg2_order_id,
            leg2_filled = excluded.leg2_filled,
            note = excluded.note,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&saga.id)
    .bind(saga.sequence)
    .bind(&saga.instrument)
    .bind(&saga.kind)
    .bind(&saga.dedupe_hash)
    .bind(&saga.state)
    .bind(saga.lots)
    .bind(&saga.leg1_symbol)
    .bind(&saga.leg1_order_id)
    .bind(saga.leg1_filled)
    .bind(&saga.leg2_symbol)
    .bind(&saga.leg2_order_id)
    .bind(saga.leg2_filled)
    .bind(&saga.note)
    .bind(&saga.created_at)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::temp_store;
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(strike: Decimal, entry: Decimal, stop: Decimal, lots: u32) -> Leg {
        Leg {
            entry_price: entry,
            stop_price: stop,
            strike,
            pe_symbol: format!("BANKNIFTY24DEC{}PE", strike),
            ce_symbol: format!("BANKNIFTY24DEC{}CE", strike),
            lots,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unknown_instrument_is_flat() {
        let (store, _dir) = temp_store().await;
        let p = store.load_position("BANK_NIFTY").await.unwrap();
        assert!(!p.is_open());
        assert!(p.legs.is_empty());
    }

    #[tokio::test]
    async fn test_position_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("reopen.db").display());

        let mut p = Position::flat("BANK_NIFTY");
        p.push_leg(leg(dec!(52000), dec!(52010.5), dec!(51650), 2));
        p.push_leg(leg(dec!(52500), dec!(52480), dec!(52100), 1));
        {
            let store = PositionStore::new(&url).await.unwrap();
            store.save_position(&p).await.unwrap();
        }

        let store = PositionStore::new(&url).await.unwrap();
        let loaded = store.load_position("BANK_NIFTY").await.unwrap();
        assert_eq!(loaded.status, PositionStatus::Open);
        assert_eq!(loaded.legs.len(), 2);
        assert_eq!(loaded.legs[0].entry_price, dec!(52010.5));
        assert_eq!(loaded.legs[1].pe_symbol, "BANKNIFTY24DEC52500PE");
        assert_eq!(store.load_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_rejects_stop_regression() {
        let (store, _dir) = temp_store().await;
        let mut p = Position::flat("BANK_NIFTY");
        p.push_leg(leg(dec!(52000), dec!(52000), dec!(51650), 2));
        store.save_position(&p).await.unwrap();

        p.legs[0].stop_price = dec!(51500);
        assert!(store.save_position(&p).await.is_err());
        let stored = store.load_position("BANK_NIFTY").await.unwrap();
        assert_eq!(stored.legs[0].stop_price, dec!(51650));

        // resync bypasses the check
        store.overwrite_position(&p).await.unwrap();
        let stored = store.load_position("BANK_NIFTY").await.unwrap();
        assert_eq!(stored.legs[0].stop_price, dec!(51500));
    }

    #[tokio::test]
    async fn test_exit_books_pnl_and_flattens() {
        let (store, _dir) = temp_store().await;
        let mut p = Position::flat("NIFTY");
        p.push_leg(leg(dec!(24000), dec!(24000), dec!(23800), 1));
        store.save_position(&p).await.unwrap();

        let mut saga = SagaRecord::new("s1", 1, "NIFTY", "EXIT", "h1", 1);
        saga.set_state(SagaState::Committed);
        store.commit_exit("NIFTY", &saga, dec!(-1500.25)).await.unwrap();
        store.commit_exit("NIFTY", &saga, dec!(4000)).await.unwrap();

        assert!(!store.load_position("NIFTY").await.unwrap().is_open());
        assert_eq!(store.realized_pnl_total().await.unwrap(), dec!(2499.75));
        assert_eq!(store.equity_curve(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_saga_lifecycle() {
        let (store, _dir) = temp_store().await;
        let mut saga = SagaRecord::new("s7", 7, "BANK_NIFTY", "BASE_ENTRY", "h", 2);
        store.insert_saga(&saga).await.unwrap();
        saga.set_state(SagaState::Leg1Filled);
        saga.leg1_filled = 60;
        store.update_saga(&saga).await.unwrap();

        let incomplete = store.incomplete_sagas().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].saga_state(), Some(SagaState::Leg1Filled));
        assert_eq!(incomplete[0].leg1_filled, 60);
        assert_eq!(store.max_sequence().await.unwrap(), 7);

        assert_eq!(store.resolve_sagas("BANK_NIFTY", "resync").await.unwrap(), 1);
        assert!(store.incomplete_sagas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspension_keeps_first_reason() {
        let (store, _dir) = temp_store().await;
        store.suspend("NIFTY", "state_divergence").await.unwrap();
        store.suspend("NIFTY", "unwind_failed").await.unwrap();
        assert_eq!(
            store.suspension("NIFTY").await.unwrap().unwrap().reason,
            "state_divergence"
        );
        assert!(store.clear_suspension("NIFTY").await.unwrap());
        assert!(store.suspension("NIFTY").await.unwrap().is_none());
        assert!(!store.clear_suspension("NIFTY").await.unwrap());
    }

    #[tokio::test]
    async fn test_alerts_newest_first() {
        let (store, _dir) = temp_store().await;
        store
            .record_alert(Some("NIFTY"), AlertSeverity::Warning, "state_divergence", "first")
            .await
            .unwrap();
        store
            .record_alert(None, AlertSeverity::Critical, "unwind_failed", "second")
            .await
            .unwrap();
        let alerts = store.recent_alerts(10).await.unwrap();
        assert_eq!(alerts[0].message, "second");
        assert_eq!(alerts[0].severity, "critical");
        assert_eq!(store.alert_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_prune_removes_only_expired_sightings() {
        let (store, _dir) = temp_store().await;
        let cutoff = Utc::now();
        let old = cutoff - chrono::Duration::milliseconds(1500);
        let fresh = cutoff + chrono::Duration::milliseconds(250);
        let outcome = SignalOutcome::executed(1);
        store.record_outcome("old", "NIFTY", &outcome, old).await.unwrap();
        store.record_outcome("fresh", "NIFTY", &outcome, fresh).await.unwrap();

        assert_eq!(store.prune_seen_signals(cutoff).await.unwrap(), 1);
        assert!(store.prior_outcome("old").await.unwrap().is_none());
        assert!(store.prior_outcome("fresh").await.unwrap().is_some());
        assert_eq!(store.prune_seen_signals(cutoff).await.unwrap(), 0);
    }
}
