//! Position-state authority: instrument locks, EOD phases, broker reconciliation.

mod monitor;

pub use monitor::{
    evaluate_eod, Divergence, InstrumentGuard, InstrumentPhase, MonitorConfig, ReconcileStatus,
    ReconciliationMonitor, ResyncReport,
};
