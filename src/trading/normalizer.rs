//! Signal normalizer: turns raw webhook bodies into validated signals.
//!
//! Responsibilities:
//! - Parse the fixed JSON shape sent by the charting platform
//! - Reject malformed, stale, future-dated and unauthorized payloads
//! - Ignore alerts that arrive outside the instrument's session
//! - Replay the stored outcome for signals already seen in the dedupe window

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::db::PositionStore;
use crate::models::{EodConditions, Signal, SignalKind, SignalOutcome};

use super::{InstrumentBook, TradingConfig};

/// Why a payload was refused before reaching the position logic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("invalid_payload: {0}")]
    InvalidPayload(String),

    #[error("missing_field: {0}")]
    MissingField(&'static str),

    #[error("unknown_signal_type: {0}")]
    UnknownKind(String),

    #[error("unknown_instrument: {0}")]
    UnknownInstrument(String),

    #[error("invalid_timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("stale_signal")]
    Stale,

    #[error("future_signal")]
    FutureDated,

    #[error("unauthorized")]
    Unauthorized,
}

/// Result of normalizing one payload.
#[derive(Debug, Clone)]
pub enum Normalized {
    Accepted(Signal),
    /// Valid, but outside trading hours
    OutsideMarketHours(Signal),
}

/// Raw webhook body. Anything not listed here (including any position
/// status the source believes in) is dropped by serde.
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    instrument: Option<String>,
    timestamp: Option<Value>,
    price: Option<Value>,
    stop: Option<Value>,
    atr: Option<Value>,
    #[serde(rename = "efficiencyRatio", alias = "er", alias = "efficiency_ratio")]
    efficiency_ratio: Option<Value>,
    #[serde(rename = "suggestedLots", alias = "suggested_lots", alias = "lots")]
    suggested_lots: Option<Value>,
    #[serde(default)]
    conditions: HashMap<String, Value>,
    #[serde(default)]
    indicators: HashMap<String, Value>,
    secret: Option<String>,
}

/// Validates and deduplicates incoming alerts.
pub struct SignalNormalizer {
    config: TradingConfig,
    instruments: Arc<InstrumentBook>,
}

impl SignalNormalizer {
    pub fn new(config: TradingConfig, instruments: Arc<InstrumentBook>) -> Self {
        Self { config, instruments }
    }

    /// Parse and validate a webhook body received at `now`.
    pub fn normalize(&self, body: &[u8], now: DateTime<Utc>) -> Result<Normalized, SignalError> {
        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| SignalError::InvalidPayload(e.to_string()))?;

        if let Some(expected) = &self.config.webhook_secret {
            if payload.secret.as_deref() != Some(expected.as_str()) {
                return Err(SignalError::Unauthorized);
            }
        }

        let raw_kind = payload.kind.ok_or(SignalError::MissingField("type"))?;
        let kind = SignalKind::parse(&raw_kind).ok_or(SignalError::UnknownKind(raw_kind))?;

        let raw_instrument = payload.instrument.ok_or(SignalError::MissingField("instrument"))?;
        let (instrument, instrument_cfg) = self
            .instruments
            .get(&raw_instrument)
            .ok_or_else(|| SignalError::UnknownInstrument(raw_instrument.clone()))?;

        let timestamp = parse_timestamp(
            payload
                .timestamp
                .as_ref()
                .ok_or(SignalError::MissingField("timestamp"))?,
        )?;
        if now - timestamp > Duration::seconds(self.config.max_signal_age_secs) {
            return Err(SignalError::Stale);
        }
        if timestamp - now > Duration::seconds(self.config.max_clock_skew_secs) {
            return Err(SignalError::FutureDated);
        }

        // EOD alerts may carry their numbers under `indicators`.
        let field = |top: &Option<Value>, key: &str| -> Result<Option<Decimal>, SignalError> {
            match top.as_ref().or_else(|| payload.indicators.get(key)) {
                Some(v) => parse_decimal(v, key).map(Some),
                None => Ok(None),
            }
        };
        let price = field(&payload.price, "price")?;
        let stop = field(&payload.stop, "stop")?;
        let atr = field(&payload.atr, "atr")?;
        let efficiency_ratio = match field(&payload.efficiency_ratio, "er")? {
            Some(er) => Some(er),
            None => field(&None, "efficiencyRatio")?,
        };
        let suggested_lots = payload
            .suggested_lots
            .as_ref()
            .and_then(|v| parse_decimal(v, "suggestedLots").ok())
            .filter(|d| d.fract().is_zero())
            .and_then(|d| d.to_u32());

        let price = price.ok_or(SignalError::MissingField("price"))?;
        if price <= Decimal::ZERO {
            return Err(SignalError::InvalidPayload("price must be positive".to_string()));
        }
        if kind.is_entry() {
            if stop.is_none() {
                return Err(SignalError::MissingField("stop"));
            }
            if atr.is_none() {
                return Err(SignalError::MissingField("atr"));
            }
            if efficiency_ratio.is_none() {
                return Err(SignalError::MissingField("efficiencyRatio"));
            }
        }

        let conditions = if kind == SignalKind::EodMonitor {
            EodConditions {
                entry: parse_flag(payload.conditions.get("entry")),
                pyramid: parse_flag(payload.conditions.get("pyramid")),
                exit: parse_flag(payload.conditions.get("exit")),
            }
        } else {
            EodConditions::default()
        };

        let signal = Signal {
            kind,
            instrument: instrument.to_string(),
            price,
            stop,
            atr,
            efficiency_ratio,
            timestamp,
            suggested_lots,
            conditions,
        };

        if instrument_cfg.session.is_open(now) {
            Ok(Normalized::Accepted(signal))
        } else {
            Ok(Normalized::OutsideMarketHours(signal))
        }
    }

    /// Outcome recorded for this signal inside the dedupe window, if any.
    pub async fn prior_outcome(
        &self,
        store: &PositionStore,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<Option<SignalOutcome>> {
        let hash = signal.dedupe_hash();
        let Some((outcome, seen_at)) = store.prior_outcome(&hash).await? else {
            return Ok(None);
        };
        if now - seen_at > Duration::seconds(self.config.dedupe_window_secs) {
            debug!(hash = %hash, "Previous sighting is outside the dedupe window");
            return Ok(None);
        }
        Ok(Some(outcome.as_duplicate()))
    }

    /// Record the outcome so replays within the window become no-ops.
    pub async fn remember(
        &self,
        store: &PositionStore,
        signal: &Signal,
        outcome: &SignalOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        store
            .record_outcome(&signal.dedupe_hash(), &signal.instrument, outcome, now)
            .await?;
        let pruned = store
            .prune_seen_signals(now - Duration::seconds(self.config.dedupe_window_secs))
            .await?;
        if pruned > 0 {
            debug!(pruned, "Expired signal sightings removed");
        }
        Ok(())
    }
}

fn parse_decimal(value: &Value, field: &str) -> Result<Decimal, SignalError> {
    let parsed = match value {
        Value::Number(n) => n
            .as_i64()
            .map(Decimal::from)
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| SignalError::InvalidPayload(format!("{} is not a number", field)))
}

fn parse_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, SignalError> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
                return Ok(dt.with_timezone(&Utc));
            }
            s.trim()
                .parse::<i64>()
                .ok()
                .and_then(epoch_to_utc)
                .ok_or_else(|| SignalError::InvalidTimestamp(s.clone()))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(epoch_to_utc)
            .ok_or_else(|| SignalError::InvalidTimestamp(n.to_string())),
        other => Err(SignalError::InvalidTimestamp(other.to_string())),
    }
}

/// Epoch seconds, or milliseconds when the value is too large for seconds.
fn epoch_to_utc(value: i64) -> Option<DateTime<Utc>> {
    if value > 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}
