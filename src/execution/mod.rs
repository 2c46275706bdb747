//! Order execution: option contract resolution and the two-leg executor.

mod contracts;
mod executor;

pub use contracts::{
    atm_strike, monthly_expiry, option_symbol, parse_option_symbol, resolve_contracts,
    ContractPair, OptionType, ParsedSymbol,
};
pub use executor::{
    EntryOutcome, ExecutionError, ExecutionIntent, ExecutorConfig, ExitIntent, ExitOutcome,
    LegOrder, SyntheticExecutor,
};
