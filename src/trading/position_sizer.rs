//! Position sizing: the triple constraint (risk, volatility, margin).
//!
//! Base entries are bounded by:
//!   risk       = floor(equity × risk% / ((entry − stop) × point value) × ER)
//!   volatility = floor(equity × vol% / (ATR × point value))
//!   margin     = floor(available margin / margin per lot)
//!
//! Pyramids replace the risk term with the minimum of three sub-constraints:
//! margin headroom after a reserve, a cap relative to the base entry, and the
//! risk budget the open position has not used yet.
//!
//! Everything here is a pure function of its inputs.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Position, Signal, SignalKind};

use super::{InstrumentConfig, TradingConfig};

/// Which constraint produced the final lot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitingFactor {
    Risk,
    Volatility,
    Margin,
    PyramidMarginHeadroom,
    PyramidBaseCap,
    PyramidRiskBudget,
}

impl LimitingFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitingFactor::Risk => "risk",
            LimitingFactor::Volatility => "volatility",
            LimitingFactor::Margin => "margin",
            LimitingFactor::PyramidMarginHeadroom => "pyramid_margin_headroom",
            LimitingFactor::PyramidBaseCap => "pyramid_base_cap",
            LimitingFactor::PyramidRiskBudget => "pyramid_risk_budget",
        }
    }
}

impl std::fmt::Display for LimitingFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs the sizer cannot work with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizingError {
    #[error("invalid_sizing_input: {0}")]
    InvalidSizingInput(String),
}

/// What the sizer needs to know about the account and current holdings.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    /// Equity used for risk and volatility budgets
    pub equity: Decimal,

    /// Margin the broker reports as free right now
    pub available_margin: Decimal,

    /// Current position for the signal's instrument
    pub position: Position,
}

/// Pyramid replacement for the risk constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PyramidConstraints {
    pub margin_headroom_lots: u32,
    pub base_cap_lots: u32,
    pub risk_budget_lots: u32,
}

/// The three constraints, each already floored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizingConstraintSet {
    pub risk_lots: u32,
    pub volatility_lots: u32,
    pub margin_lots: u32,
    pub pyramid: Option<PyramidConstraints>,
}

/// Result of sizing one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizingDecision {
    pub lots: u32,
    pub limiting_factor: LimitingFactor,
    pub constraints: SizingConstraintSet,

    /// Lot count the signal source suggested, kept for the log only
    pub suggested_lots: Option<u32>,
}

impl SizingDecision {
    pub fn is_rejected(&self) -> bool {
        self.lots == 0
    }
}

/// Calculator for lot counts.
pub struct PositionSizer {
    config: TradingConfig,
}

impl PositionSizer {
    /// Create a new position sizer with given config.
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Size a BASE_ENTRY or PYRAMID signal.
    ///
    /// # Arguments
    /// * `signal` - Entry signal carrying price, stop, ATR and efficiency ratio
    /// * `portfolio` - Equity, fresh margin figure, current position
    /// * `instrument` - Contract specification
    ///
    /// # Returns
    /// Lots per leg and the binding constraint; zero lots means reject.
    pub fn size(
        &self,
        signal: &Signal,
        portfolio: &PortfolioState,
        instrument: &InstrumentConfig,
    ) -> Result<SizingDecision, SizingError> {
        let inputs = self.validate(signal, portfolio, instrument)?;
        let equity = portfolio.equity;
        let pv = instrument.point_value;
        let risk_per_lot = (inputs.entry - inputs.stop) * pv;

        let volatility_lots =
            floor_lots(equity * self.config.vol_pct / Decimal::ONE_HUNDRED / (inputs.atr * pv));
        let margin_lots = floor_lots(portfolio.available_margin / instrument.margin_per_lot);

        let (risk_lots, risk_factor, pyramid) = match signal.kind {
            SignalKind::Pyramid => {
                let p = self.pyramid_constraints(portfolio, instrument, risk_per_lot);
                let (lots, factor) = min_with_factor(&[
                    (p.margin_headroom_lots, LimitingFactor::PyramidMarginHeadroom),
                    (p.base_cap_lots, LimitingFactor::PyramidBaseCap),
                    (p.risk_budget_lots, LimitingFactor::PyramidRiskBudget),
                ]);
                (lots, factor, Some(p))
            }
            _ => {
                let risk_amount = equity * self.config.risk_pct / Decimal::ONE_HUNDRED;
                let lots = floor_lots(risk_amount / risk_per_lot * inputs.efficiency_ratio);
                (lots, LimitingFactor::Risk, None)
            }
        };

        let (lots, limiting_factor) = min_with_factor(&[
            (risk_lots, risk_factor),
            (volatility_lots, LimitingFactor::Volatility),
            (margin_lots, LimitingFactor::Margin),
        ]);

        Ok(SizingDecision {
            lots,
            limiting_factor,
            constraints: SizingConstraintSet {
                risk_lots,
                volatility_lots,
                margin_lots,
                pyramid,
            },
            suggested_lots: signal.suggested_lots,
        })
    }

    fn pyramid_constraints(
        &self,
        portfolio: &PortfolioState,
        instrument: &InstrumentConfig,
        risk_per_lot: Decimal,
    ) -> PyramidConstraints {
        let reserve = Decimal::ONE - self.config.pyramid_margin_reserve_pct / Decimal::ONE_HUNDRED;
        let margin_headroom_lots =
            floor_lots(portfolio.available_margin * reserve / instrument.margin_per_lot);

        let base_cap_lots =
            floor_lots(Decimal::from(portfolio.position.base_lots()) * self.config.pyramid_base_ratio);

        let budget = portfolio.equity * self.config.max_position_risk_pct / Decimal::ONE_HUNDRED;
        let remaining = budget - portfolio.position.open_risk(instrument.point_value);
        let risk_budget_lots = floor_lots(remaining / risk_per_lot);

        PyramidConstraints {
            margin_headroom_lots,
            base_cap_lots,
            risk_budget_lots,
        }
    }

    fn validate(
        &self,
        signal: &Signal,
        portfolio: &PortfolioState,
        instrument: &InstrumentConfig,
    ) -> Result<ValidInputs, SizingError> {
        let invalid = |msg: String| Err(SizingError::InvalidSizingInput(msg));

        if !signal.kind.is_entry() {
            return invalid(format!("{} signals are not sized", signal.kind));
        }
        let Some(stop) = signal.stop else {
            return invalid("missing stop".to_string());
        };
        let Some(atr) = signal.atr else {
            return invalid("missing atr".to_string());
        };
        let efficiency_ratio = signal.efficiency_ratio.unwrap_or(Decimal::ONE);
        let entry = signal.price;

        if stop >= entry {
            return invalid(format!("stop {} is not below entry {} for a long", stop, entry));
        }
        if atr <= Decimal::ZERO {
            return invalid(format!("atr must be positive, got {}", atr));
        }
        if efficiency_ratio < Decimal::ZERO || efficiency_ratio > Decimal::ONE {
            return invalid(format!("efficiency ratio {} outside [0, 1]", efficiency_ratio));
        }
        if portfolio.equity <= Decimal::ZERO {
            return invalid(format!("equity must be positive, got {}", portfolio.equity));
        }
        if instrument.point_value <= Decimal::ZERO || instrument.margin_per_lot <= Decimal::ZERO {
            return invalid("instrument point value and margin per lot must be positive".to_string());
        }

        Ok(ValidInputs {
            entry,
            stop,
            atr,
            efficiency_ratio,
        })
    }
}

struct ValidInputs {
    entry: Decimal,
    stop: Decimal,
    atr: Decimal,
    efficiency_ratio: Decimal,
}

/// Floor to whole lots; negatives and overflow clamp to the u32 range.
fn floor_lots(value: Decimal) -> u32 {
    if value <= Decimal::ZERO {
        return 0;
    }
    value.floor().to_u32().unwrap_or(u32::MAX)
}

/// Minimum lot count; ties go to the earliest entry.
fn min_with_factor(candidates: &[(u32, LimitingFactor)]) -> (u32, LimitingFactor) {
    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        if candidate.0 < best.0 {
            best = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EodConditions, Leg};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn entry_signal(kind: SignalKind, price: Decimal, stop: Decimal, atr: Decimal) -> Signal {
        Signal {
            kind,
            instrument: "BANK_NIFTY".to_string(),
            price,
            stop: Some(stop),
            atr: Some(atr),
            efficiency_ratio: Some(dec!(0.82)),
            timestamp: Utc::now(),
            suggested_lots: None,
            conditions: EodConditions::default(),
        }
    }

    fn flat_portfolio(equity: Decimal, margin: Decimal) -> PortfolioState {
        PortfolioState {
            equity,
            available_margin: margin,
            position: Position::flat("BANK_NIFTY"),
        }
    }

    fn sizer(vol_pct: Decimal) -> PositionSizer {
        PositionSizer::new(TradingConfig {
            risk_pct: dec!(0.5),
            vol_pct,
            ..Default::default()
        })
    }

    #[test]
    fn test_scenario_a_volatility_binds_to_zero() {
        let signal = entry_signal(SignalKind::BaseEntry, dec!(52000), dec!(51650), dec!(350));
        let portfolio = flat_portfolio(dec!(5000000), dec!(3000000));

        // 5,000,000 × 0.17% / (350 × 30) ≈ 0.81
        let decision = sizer(dec!(0.17))
            .size(&signal, &portfolio, &InstrumentConfig::bank_nifty())
            .unwrap();

        assert_eq!(decision.constraints.risk_lots, 1);
        assert_eq!(decision.constraints.volatility_lots, 0);
        assert_eq!(decision.constraints.margin_lots, 11);
        assert_eq!(decision.lots, 0);
        assert_eq!(decision.limiting_factor, LimitingFactor::Volatility);
        assert!(decision.is_rejected());
    }

    #[test]
    fn test_scenario_b_risk_binds_to_one_lot() {
        let signal = entry_signal(SignalKind::BaseEntry, dec!(52000), dec!(51650), dec!(350));
        let portfolio = flat_portfolio(dec!(5000000), dec!(3000000));

        let decision = sizer(dec!(0.5))
            .size(&signal, &portfolio, &InstrumentConfig::bank_nifty())
            .unwrap();

        assert_eq!(decision.constraints.volatility_lots, 2);
        assert_eq!(decision.constraints.margin_lots, 11);
        assert_eq!(decision.lots, 1);
        assert_eq!(decision.limiting_factor, LimitingFactor::Risk);
    }

    #[test]
    fn test_margin_binds_when_cash_is_short() {
        let signal = entry_signal(SignalKind::BaseEntry, dec!(52000), dec!(51000), dec!(100));
        let portfolio = flat_portfolio(dec!(50000000), dec!(500000));

        let decision = sizer(dec!(0.5))
            .size(&signal, &portfolio, &InstrumentConfig::bank_nifty())
            .unwrap();

        assert_eq!(decision.constraints.margin_lots, 1);
        assert_eq!(decision.lots, 1);
        assert_eq!(decision.limiting_factor, LimitingFactor::Margin);
    }

    #[test]
    fn test_final_lots_is_min_of_constraints_across_inputs() {
        let instrument = InstrumentConfig::bank_nifty();
        let s = sizer(dec!(0.3));
        for equity in [dec!(1000000), dec!(5000000), dec!(12500000)] {
            for gap in [dec!(50), dec!(350), dec!(1200)] {
                for atr in [dec!(80), dec!(350), dec!(900)] {
                    for margin in [dec!(0), dec!(300000), dec!(4000000)] {
                        let signal =
                            entry_signal(SignalKind::BaseEntry, dec!(52000), dec!(52000) - gap, atr);
                        let d = s
                            .size(&signal, &flat_portfolio(equity, margin), &instrument)
                            .unwrap();
                        let c = d.constraints;
                        assert_eq!(d.lots, c.risk_lots.min(c.volatility_lots).min(c.margin_lots));
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let instrument = InstrumentConfig::bank_nifty();
        let portfolio = flat_portfolio(dec!(5000000), dec!(3000000));
        let s = sizer(dec!(0.5));

        let stop_above = entry_signal(SignalKind::BaseEntry, dec!(52000), dec!(52000), dec!(350));
        assert!(matches!(
            s.size(&stop_above, &portfolio, &instrument),
            Err(SizingError::InvalidSizingInput(_))
        ));

        let zero_atr = entry_signal(SignalKind::BaseEntry, dec!(52000), dec!(51650), dec!(0));
        assert!(s.size(&zero_atr, &portfolio, &instrument).is_err());

        let exit = entry_signal(SignalKind::Exit, dec!(52000), dec!(51650), dec!(350));
        assert!(s.size(&exit, &portfolio, &instrument).is_err());
    }

    #[test]
    fn test_suggested_lots_never_change_the_result() {
        let instrument = InstrumentConfig::bank_nifty();
        let portfolio = flat_portfolio(dec!(5000000), dec!(3000000));
        let mut signal = entry_signal(SignalKind::BaseEntry, dec!(52000), dec!(51650), dec!(350));
        signal.suggested_lots = Some(9);

        let d = sizer(dec!(0.5)).size(&signal, &portfolio, &instrument).unwrap();
        assert_eq!(d.lots, 1);
        assert_eq!(d.suggested_lots, Some(9));
    }

    fn open_portfolio(base_lots: u32, entry: Decimal, stop: Decimal) -> PortfolioState {
        let mut position = Position::flat("BANK_NIFTY");
        position.push_leg(Leg {
            entry_price: entry,
            stop_price: stop,
            strike: dec!(52000),
            pe_symbol: "BANKNIFTY24DEC52000PE".to_string(),
            ce_symbol: "BANKNIFTY24DEC52000CE".to_string(),
            lots: base_lots,
            opened_at: Utc::now(),
        });
        PortfolioState {
            equity: dec!(10000000),
            available_margin: dec!(3000000),
            position,
        }
    }

    #[test]
    fn test_pyramid_capped_at_half_of_base() {
        let s = PositionSizer::new(TradingConfig {
            vol_pct: dec!(2),
            max_position_risk_pct: dec!(10),
            ..Default::default()
        });
        // Base leg already protected by a stop above entry: no open risk.
        let portfolio = open_portfolio(5, dec!(52000), dec!(52100));
        let signal = entry_signal(SignalKind::Pyramid, dec!(52600), dec!(52300), dec!(300));

        let d = s.size(&signal, &portfolio, &InstrumentConfig::bank_nifty()).unwrap();
        let p = d.constraints.pyramid.unwrap();

        // 3,000,000 × 0.9 / 270,000 = 10
        assert_eq!(p.margin_headroom_lots, 10);
        assert_eq!(p.base_cap_lots, 2);
        assert_eq!(d.constraints.risk_lots, 2);
        assert_eq!(d.lots, 2);
        assert_eq!(d.limiting_factor, LimitingFactor::PyramidBaseCap);
    }

    #[test]
    fn test_pyramid_limited_by_remaining_risk_budget() {
        let s = PositionSizer::new(TradingConfig {
            vol_pct: dec!(2),
            max_position_risk_pct: dec!(0.5),
            ..Default::default()
        });
        // Budget 50,000; open risk (52000 - 51500) × 2 × 30 = 30,000; remaining 20,000.
        let portfolio = open_portfolio(2, dec!(52000), dec!(51500));
        // Risk per lot (52600 - 52300) × 30 = 9,000 → 2 lots
        let signal = entry_signal(SignalKind::Pyramid, dec!(52600), dec!(52300), dec!(300));

        let d = s.size(&signal, &portfolio, &InstrumentConfig::bank_nifty()).unwrap();
        let p = d.constraints.pyramid.unwrap();
        assert_eq!(p.risk_budget_lots, 2);
        assert_eq!(p.base_cap_lots, 1);
        assert_eq!(d.lots, 1);
    }

    #[test]
    fn test_pyramid_with_exhausted_budget_is_zero() {
        let s = PositionSizer::new(TradingConfig {
            vol_pct: dec!(2),
            max_position_risk_pct: dec!(0.1),
            ..Default::default()
        });
        let portfolio = open_portfolio(10, dec!(52000), dec!(51000));
        let signal = entry_signal(SignalKind::Pyramid, dec!(52600), dec!(52300), dec!(300));

        let d = s.size(&signal, &portfolio, &InstrumentConfig::bank_nifty()).unwrap();
        assert_eq!(d.constraints.pyramid.unwrap().risk_budget_lots, 0);
        assert_eq!(d.lots, 0);
        assert_eq!(d.limiting_factor, LimitingFactor::PyramidRiskBudget);
    }
}
