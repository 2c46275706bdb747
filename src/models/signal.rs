//! Signal model: one normalized alert from the charting platform.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What the alert asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    BaseEntry,
    Pyramid,
    Exit,
    EodMonitor,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::BaseEntry => "BASE_ENTRY",
            SignalKind::Pyramid => "PYRAMID",
            SignalKind::Exit => "EXIT",
            SignalKind::EodMonitor => "EOD_MONITOR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BASE_ENTRY" => Some(Self::BaseEntry),
            "PYRAMID" => Some(Self::Pyramid),
            "EXIT" => Some(Self::Exit),
            "EOD_MONITOR" => Some(Self::EodMonitor),
            _ => None,
        }
    }

    /// Whether the kind opens exposure and therefore goes through the sizer.
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalKind::BaseEntry | SignalKind::Pyramid)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean conditions reported by an EOD_MONITOR alert.
///
/// The source never gets to say whether we are in a position; these only
/// describe what the chart would do if it were right about that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EodConditions {
    pub entry: bool,
    pub pyramid: bool,
    pub exit: bool,
}

/// Immutable, validated alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,

    /// Instrument key as configured (upper case)
    pub instrument: String,

    /// Bar close price at alert time
    pub price: Decimal,

    /// Trailing stop level
    pub stop: Option<Decimal>,

    /// Average true range
    pub atr: Option<Decimal>,

    /// Kaufman efficiency ratio (0..=1)
    pub efficiency_ratio: Option<Decimal>,

    /// Alert timestamp as sent by the source
    pub timestamp: DateTime<Utc>,

    /// Lot count the source would trade; advisory only
    pub suggested_lots: Option<u32>,

    /// Populated for EOD_MONITOR alerts only
    #[serde(default)]
    pub conditions: EodConditions,
}

impl Signal {
    /// Idempotency key over `instrument + kind + timestamp`.
    pub fn dedupe_hash(&self) -> String {
        let key = format!(
            "{}|{}|{}",
            self.instrument,
            self.kind.as_str(),
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        blake3::hash(key.as_bytes()).to_hex().to_string()
    }

    /// Same alert, re-labelled with the action the EOD cycle decided on.
    pub fn with_kind(&self, kind: SignalKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

/// Final disposition of a webhook call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Processed,
    Rejected,
    Ignored,
}

/// Webhook response body, also stored for duplicate replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub status: OutcomeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Lots placed on each leg, when an order sequence completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lots: Option<u32>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl SignalOutcome {
    pub fn processed(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Processed,
            reason: Some(reason.into()),
            lots: None,
            duplicate: false,
        }
    }

    pub fn executed(lots: u32) -> Self {
        Self {
            status: OutcomeStatus::Processed,
            reason: None,
            lots: Some(lots),
            duplicate: false,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            reason: Some(reason.into()),
            lots: None,
            duplicate: false,
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Ignored,
            reason: Some(reason.into()),
            lots: None,
            duplicate: false,
        }
    }

    pub fn as_duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn signal(kind: SignalKind, secs: i64) -> Signal {
        Signal {
            kind,
            instrument: "BANK_NIFTY".to_string(),
            price: dec!(52000),
            stop: Some(dec!(51650)),
            atr: Some(dec!(350)),
            efficiency_ratio: Some(dec!(0.82)),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            suggested_lots: None,
            conditions: EodConditions::default(),
        }
    }

    #[test]
    fn test_dedupe_hash_ignores_prices() {
        let a = signal(SignalKind::BaseEntry, 1_700_000_000);
        let mut b = a.clone();
        b.price = dec!(52100);
        b.suggested_lots = Some(4);
        assert_eq!(a.dedupe_hash(), b.dedupe_hash());
    }

    #[test]
    fn test_dedupe_hash_separates_kind_and_time() {
        let base = signal(SignalKind::BaseEntry, 1_700_000_000);
        assert_ne!(base.dedupe_hash(), signal(SignalKind::Pyramid, 1_700_000_000).dedupe_hash());
        assert_ne!(base.dedupe_hash(), signal(SignalKind::BaseEntry, 1_700_000_060).dedupe_hash());
    }

    #[test]
    fn test_kind_parse_is_case_insensitive() {
        assert_eq!(SignalKind::parse("eod_monitor"), Some(SignalKind::EodMonitor));
        assert_eq!(SignalKind::parse(" EXIT "), Some(SignalKind::Exit));
        assert_eq!(SignalKind::parse("REVERSE"), None);
    }

    #[test]
    fn test_outcome_serialization_skips_empty_fields() {
        let json = serde_json::to_value(SignalOutcome::executed(2)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "processed", "lots": 2}));

        let json = serde_json::to_value(SignalOutcome::rejected("volatility").as_duplicate()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "rejected", "reason": "volatility", "duplicate": true})
        );
    }
}
