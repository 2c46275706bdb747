//! Position model: our synthetic long, one leg pair per pyramid level.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Flat,
    Open,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Flat => "FLAT",
            PositionStatus::Open => "OPEN",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("OPEN") {
            PositionStatus::Open
        } else {
            PositionStatus::Flat
        }
    }
}

/// One pyramid level: a short put and a long call at the same strike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub strike: Decimal,
    pub pe_symbol: String,
    pub ce_symbol: String,
    pub lots: u32,
    pub opened_at: DateTime<Utc>,
}

/// Invariant violations rejected by the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    #[error("stop for level {level} would move down from {previous} to {attempted}")]
    StopRegression {
        level: usize,
        previous: Decimal,
        attempted: Decimal,
    },

    #[error("level {level} differs from the stored leg; legs are append-only while open")]
    LegRewritten { level: usize },

    #[error("open position has no legs")]
    OpenWithoutLegs,
}

/// Current holdings for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub legs: Vec<Leg>,
    pub status: PositionStatus,
}

impl Position {
    pub fn flat(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            legs: Vec::new(),
            status: PositionStatus::Flat,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Number of layers added on top of the base entry.
    pub fn pyramid_count(&self) -> u32 {
        self.legs.len().saturating_sub(1) as u32
    }

    pub fn total_lots(&self) -> u32 {
        self.legs.iter().map(|l| l.lots).sum()
    }

    /// Lots of the base entry (level 0).
    pub fn base_lots(&self) -> u32 {
        self.legs.first().map(|l| l.lots).unwrap_or(0)
    }

    pub fn last_leg(&self) -> Option<&Leg> {
        self.legs.last()
    }

    /// Append a pyramid level and mark the position open.
    pub fn push_leg(&mut self, leg: Leg) {
        self.legs.push(leg);
        self.status = PositionStatus::Open;
    }

    /// Ratchet every leg's stop up to `stop`. Lower values are ignored.
    ///
    /// Returns true when any stop moved.
    pub fn trail_stop(&mut self, stop: Decimal) -> bool {
        let mut moved = false;
        for leg in &mut self.legs {
            if stop > leg.stop_price {
                leg.stop_price = stop;
                moved = true;
            }
        }
        moved
    }

    /// Clear all legs at once; returns what was held.
    pub fn close(&mut self) -> Vec<Leg> {
        self.status = PositionStatus::Flat;
        std::mem::take(&mut self.legs)
    }

    /// Money at risk if every leg were stopped out, in account currency.
    pub fn open_risk(&self, point_value: Decimal) -> Decimal {
        self.legs
            .iter()
            .map(|l| {
                let per_point = (l.entry_price - l.stop_price).max(Decimal::ZERO);
                per_point * Decimal::from(l.lots) * point_value
            })
            .sum()
    }

    /// Net quantity the broker should report per option symbol.
    pub fn expected_quantities(&self, lot_size: u32) -> BTreeMap<String, i64> {
        let mut expected = BTreeMap::new();
        if !self.is_open() {
            return expected;
        }
        for leg in &self.legs {
            let qty = i64::from(leg.lots) * i64::from(lot_size);
            *expected.entry(leg.pe_symbol.clone()).or_insert(0) -= qty;
            *expected.entry(leg.ce_symbol.clone()).or_insert(0) += qty;
        }
        expected.retain(|_, q| *q != 0);
        expected
    }

    /// Check that `self` is a legal successor of `previous`.
    ///
    /// While open, existing levels keep their symbols and lots and their
    /// stops never decrease; new levels may only be appended. Going flat is
    /// always legal.
    pub fn check_successor_of(&self, previous: &Position) -> Result<(), PositionError> {
        if self.is_open() && self.legs.is_empty() {
            return Err(PositionError::OpenWithoutLegs);
        }
        if !self.is_open() || !previous.is_open() {
            return Ok(());
        }
        for (level, old) in previous.legs.iter().enumerate() {
            let Some(new) = self.legs.get(level) else {
                return Err(PositionError::LegRewritten { level });
            };
            if new.pe_symbol != old.pe_symbol
                || new.ce_symbol != old.ce_symbol
                || new.lots != old.lots
                || new.entry_price != old.entry_price
            {
                return Err(PositionError::LegRewritten { level });
            }
            if new.stop_price < old.stop_price {
                return Err(PositionError::StopRegression {
                    level,
                    previous: old.stop_price,
                    attempted: new.stop_price,
                });
            }
        }
        Ok(())
    }
}
