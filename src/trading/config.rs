//! Trading configuration: sizing knobs and per-instrument contract specs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for signal handling and position sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Account equity before realized P&L, in account currency
    pub base_equity: Decimal,

    /// Percent of equity risked between entry and stop on a base entry
    pub risk_pct: Decimal,

    /// Percent of equity allowed per ATR of adverse movement
    pub vol_pct: Decimal,

    /// Percent of equity the whole position may have at risk, pyramids included
    pub max_position_risk_pct: Decimal,

    /// Pyramid size cap as a fraction of the base entry's lots
    pub pyramid_base_ratio: Decimal,

    /// Percent of available margin held back when sizing a pyramid
    pub pyramid_margin_reserve_pct: Decimal,

    /// Maximum number of pyramid levels on top of the base entry
    pub max_pyramids: u32,

    /// Minimum distance, in ATRs, between the last entry and a new pyramid
    pub pyramid_min_atr_gap: Decimal,

    /// Identical signals within this window replay the first outcome (seconds)
    pub dedupe_window_secs: i64,

    /// Signals older than this are treated as replays (seconds)
    pub max_signal_age_secs: i64,

    /// Tolerated clock skew for future-dated signals (seconds)
    pub max_clock_skew_secs: i64,

    /// Shared secret expected in the payload's `secret` field
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<String>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            base_equity: dec!(5000000),
            risk_pct: dec!(0.5),
            vol_pct: dec!(0.2),
            max_position_risk_pct: dec!(1.5),
            pyramid_base_ratio: dec!(0.5),
            pyramid_margin_reserve_pct: dec!(10),
            max_pyramids: 5,
            pyramid_min_atr_gap: dec!(0.5),
            dedupe_window_secs: 3600,
            max_signal_age_secs: 600,
            max_clock_skew_secs: 60,
            webhook_secret: None,
        }
    }
}

/// Trading session of an exchange segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSession {
    pub timezone: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub trading_days: Vec<Weekday>,
}

impl MarketSession {
    /// NSE cash/F&O hours.
    pub fn nse() -> Self {
        Self {
            timezone: chrono_tz::Asia::Kolkata,
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            trading_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
        }
    }

    /// Whether `at` falls inside the session (open inclusive, close inclusive).
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        if !self.trading_days.contains(&local.weekday()) {
            return false;
        }
        let time = local.time();
        time >= self.open && time <= self.close
    }
}

/// Contract specification for one tradable instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Option symbol root, e.g. BANKNIFTY
    pub symbol_root: String,

    /// Exchange segment the option legs trade on
    pub exchange: String,

    /// Units per lot; broker quantities are lots × lot_size
    pub lot_size: u32,

    /// Account currency per point of underlying movement per lot
    pub point_value: Decimal,

    /// Margin blocked per lot of synthetic futures
    pub margin_per_lot: Decimal,

    /// Distance between listed strikes
    pub strike_interval: Decimal,

    /// Weekday of the monthly expiry (last such weekday of the month)
    pub expiry_weekday: Weekday,

    /// Roll to next month when fewer calendar days remain to expiry
    pub rollover_days: i64,

    pub session: MarketSession,
}

impl InstrumentConfig {
    pub fn bank_nifty() -> Self {
        Self {
            symbol_root: "BANKNIFTY".to_string(),
            exchange: "NFO".to_string(),
            lot_size: 30,
            point_value: dec!(30),
            margin_per_lot: dec!(270000),
            strike_interval: dec!(100),
            expiry_weekday: Weekday::Thu,
            rollover_days: 7,
            session: MarketSession::nse(),
        }
    }

    pub fn nifty() -> Self {
        Self {
            symbol_root: "NIFTY".to_string(),
            exchange: "NFO".to_string(),
            lot_size: 75,
            point_value: dec!(75),
            margin_per_lot: dec!(180000),
            strike_interval: dec!(50),
            expiry_weekday: Weekday::Thu,
            rollover_days: 7,
            session: MarketSession::nse(),
        }
    }
}

/// The configured instruments, keyed by upper-case instrument name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentBook {
    instruments: BTreeMap<String, InstrumentConfig>,
}

impl Default for InstrumentBook {
    fn default() -> Self {
        let mut instruments = BTreeMap::new();
        instruments.insert("BANK_NIFTY".to_string(), InstrumentConfig::bank_nifty());
        instruments.insert("NIFTY".to_string(), InstrumentConfig::nifty());
        Self { instruments }
    }
}

impl InstrumentBook {
    pub fn new(instruments: impl IntoIterator<Item = (String, InstrumentConfig)>) -> Self {
        Self {
            instruments: instruments
                .into_iter()
                .map(|(name, cfg)| (name.to_uppercase(), cfg))
                .collect(),
        }
    }

    /// Load a JSON object of `{ "NAME": InstrumentConfig, ... }`.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read instruments file {}", path.display()))?;
        let book: Self = serde_json::from_str(&raw).context("Invalid instruments file")?;
        Ok(Self::new(book.instruments))
    }

    /// Case-insensitive lookup; returns the canonical key with the config.
    pub fn get(&self, name: &str) -> Option<(&str, &InstrumentConfig)> {
        let key = name.trim().to_uppercase();
        self.instruments
            .get_key_value(&key)
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InstrumentConfig)> {
        self.instruments.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> Vec<String> {
        self.instruments.keys().cloned().collect()
    }

    /// Instrument whose option symbols start with this broker symbol's root.
    ///
    /// Longest root wins so BANKNIFTY symbols are never attributed to NIFTY.
    pub fn owner_of_symbol(&self, symbol: &str) -> Option<&str> {
        self.instruments
            .iter()
            .filter(|(_, cfg)| symbol.starts_with(&cfg.symbol_root))
            .max_by_key(|(_, cfg)| cfg.symbol_root.len())
            .map(|(k, _)| k.as_str())
    }

    /// Largest per-lot margin across instruments.
    pub fn max_margin_per_lot(&self) -> Decimal {
        self.instruments
            .values()
            .map(|c| c.margin_per_lot)
            .max()
            .unwrap_or(Decimal::ZERO)
    }
}
