//! Volatility regime classification module.
//!
//! Categorizes each trading day by VIX level. The regime decides how much of
//! the account may be committed as buying power:
//! - Very low (VIX < 12): 45%
//! - Low (12-15): 50%
//! - Normal (15-20): 55%
//! - Elevated (20-25): 65%
//! - High (25-30): 75%
//! - Extreme (30+): 80%

pub mod classifier;

pub use classifier::{RegimeClassifier, RegimeConfig, VolatilityRegime};
