//! Option pricing estimator.
//!
//! Approximate premiums for synthetic positions: one
//! implied volatility per underlying, no skew, no dividends.

pub mod black_scholes;

pub use black_scholes::{
    round_to_increment, PricingEstimator, DAYS_PER_YEAR, DEFAULT_RISK_FREE_RATE, MIN_CREDIT,
};
