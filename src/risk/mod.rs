//! Risk management module.
//!
//! Provides:
//! - Account state and capital phases
//! - Buying-power ceiling (phase x volatility regime)
//! - Correlation groups and per-group position limits

pub mod account;
pub mod correlation;

pub use account::{AccountState, PhaseConfig};
pub use correlation::{default_groups, CorrelationGroupConfig, CorrelationTracker};
