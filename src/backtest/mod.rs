//! Backtesting engine for options-income strategies.
//!
//! This module provides:
//! - Position and trade records with a signed cash-flow convention
//! - The per-run position ledger (buying power, correlation slots)
//! - Management rules evaluated at session checkpoints
//! - The day-stepping simulation loop

pub mod engine;
pub mod ledger;
pub mod management;
pub mod trade;

pub use engine::{BacktestEngine, BacktestResult, DailyEquityRecord, EngineError};
pub use ledger::{Admission, PositionLedger, RejectionCounts, RejectionReason};
pub use management::{Checkpoint, ManagementAction, Observation};
pub use trade::{
    ExitReason, Position, PositionError, PositionLeg, PositionStatus, Structure, Trade,
    CONTRACT_MULTIPLIER,
};
