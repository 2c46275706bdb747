//! Trading logic: configuration, signal normalization, position sizing.

mod config;
mod normalizer;
mod position_sizer;

pub use config::{InstrumentBook, InstrumentConfig, MarketSession, TradingConfig};
pub use normalizer::{Normalized, SignalError, SignalNormalizer};
pub use position_sizer::{
    LimitingFactor, PortfolioState, PositionSizer, PyramidConstraints, SizingConstraintSet,
    SizingDecision, SizingError,
};
