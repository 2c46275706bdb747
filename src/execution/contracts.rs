//! Option contract resolution: ATM strike, monthly expiry, broker symbols.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::trading::InstrumentConfig;

/// Put or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Put,
    Call,
}

impl OptionType {
    pub fn suffix(&self) -> &'static str {
        match self {
            OptionType::Put => "PE",
            OptionType::Call => "CE",
        }
    }
}

/// Both legs of one synthetic at a single strike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractPair {
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub pe_symbol: String,
    pub ce_symbol: String,
}

/// Pieces recovered from a broker option symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSymbol {
    /// `YYMON` part, e.g. `24DEC`
    pub expiry_tag: String,
    pub strike: Decimal,
    pub option_type: OptionType,
}

/// Nearest listed strike; exact midpoints round up.
pub fn atm_strike(price: Decimal, interval: Decimal) -> Decimal {
    if interval <= Decimal::ZERO {
        return price;
    }
    (price / interval).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * interval
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let mut day = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()?;
    while day.weekday() != weekday {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Monthly expiry to trade on `today`.
///
/// The last `weekday` of the current month, unless fewer than
/// `rollover_days` calendar days remain (or it has passed), in which case
/// next month's.
pub fn monthly_expiry(today: NaiveDate, weekday: Weekday, rollover_days: i64) -> Option<NaiveDate> {
    let current = last_weekday_of_month(today.year(), today.month(), weekday)?;
    if current - today >= Duration::days(rollover_days) {
        return Some(current);
    }
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    last_weekday_of_month(year, month, weekday)
}

/// `{ROOT}{YY}{MON}{STRIKE}{PE|CE}`, e.g. `BANKNIFTY24DEC52000PE`.
pub fn option_symbol(root: &str, expiry: NaiveDate, strike: Decimal, option_type: OptionType) -> String {
    format!(
        "{}{}{}{}",
        root,
        expiry.format("%y%b").to_string().to_uppercase(),
        strike.normalize(),
        option_type.suffix()
    )
}

/// Split a symbol built by [`option_symbol`] for the given root.
pub fn parse_option_symbol(symbol: &str, root: &str) -> Option<ParsedSymbol> {
    let rest = symbol.strip_prefix(root)?;
    if rest.len() < 8 || !rest.is_ascii() {
        return None;
    }
    let (body, suffix) = rest.split_at(rest.len() - 2);
    let option_type = match suffix {
        "PE" => OptionType::Put,
        "CE" => OptionType::Call,
        _ => return None,
    };
    let (expiry_tag, strike) = body.split_at(5);
    if !expiry_tag[..2].chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(ParsedSymbol {
        expiry_tag: expiry_tag.to_string(),
        strike: strike.parse().ok()?,
        option_type,
    })
}

/// ATM contract pair for `price` on `today` (exchange-local date).
pub fn resolve_contracts(
    price: Decimal,
    instrument: &InstrumentConfig,
    today: NaiveDate,
) -> Option<ContractPair> {
    let strike = atm_strike(price, instrument.strike_interval);
    let expiry = monthly_expiry(today, instrument.expiry_weekday, instrument.rollover_days)?;
    Some(ContractPair {
        strike,
        expiry,
        pe_symbol: option_symbol(&instrument.symbol_root, expiry, strike, OptionType::Put),
        ce_symbol: option_symbol(&instrument.symbol_root, expiry, strike, OptionType::Call),
    })
}
