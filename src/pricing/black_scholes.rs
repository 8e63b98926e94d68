//! Closed-form option value estimates.
//!
//! Black-Scholes without dividends and with a fixed risk-free rate. The
//! backtester only needs approximate premiums to size credits, place short
//! strikes by delta and mark positions, so there is no volatility surface:
//! every leg is priced off the underlying's single implied volatility.
//!
//! All functions are pure. Degenerate inputs (expired, zero or non-finite
//! volatility, non-positive prices) fall back to intrinsic value instead of
//! producing NaN.

use serde::{Deserialize, Serialize};
use statrs::function::erf::{erf_inv, erfc};

use crate::data::OptionType;

/// Default annual risk-free rate.
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.05;

/// Minimum synthetic credit per share for a vertical.
pub const MIN_CREDIT: f64 = 0.05;

/// Calendar days per year used to convert DTE to time.
pub const DAYS_PER_YEAR: f64 = 365.0;

/// Standard normal CDF.
fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Inverse standard normal CDF, `p` clamped away from 0 and 1.
fn norm_inv(p: f64) -> f64 {
    let p = p.clamp(1e-9, 1.0 - 1e-9);
    std::f64::consts::SQRT_2 * erf_inv(2.0 * p - 1.0)
}

/// Black-Scholes estimator for premiums and deltas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEstimator {
    /// Risk-free interest rate
    pub rate: f64,
    /// Floor for vertical credits, per share
    pub min_credit: f64,
}

impl Default for PricingEstimator {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RISK_FREE_RATE,
            min_credit: MIN_CREDIT,
        }
    }
}

impl PricingEstimator {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            ..Default::default()
        }
    }

    fn is_degenerate(spot: f64, strike: f64, years: f64, vol: f64) -> bool {
        !(spot.is_finite() && strike.is_finite() && vol.is_finite() && years.is_finite())
            || spot <= 0.0
            || strike <= 0.0
            || years <= 0.0
            || vol <= 0.0
    }

    fn d1(&self, spot: f64, strike: f64, years: f64, vol: f64) -> f64 {
        let numerator = (spot / strike).ln() + (self.rate + 0.5 * vol * vol) * years;
        numerator / (vol * years.sqrt())
    }

    /// Premium per share for one option. `dte` is in (possibly fractional)
    /// calendar days. Never negative.
    pub fn estimate_credit(
        &self,
        spot: f64,
        strike: f64,
        dte: f64,
        vol: f64,
        opt_type: OptionType,
    ) -> f64 {
        let years = dte / DAYS_PER_YEAR;
        if Self::is_degenerate(spot, strike, years, vol) {
            if !(spot.is_finite() && strike.is_finite()) {
                return 0.0;
            }
            return opt_type.intrinsic(spot, strike);
        }

        let d1 = self.d1(spot, strike, years, vol);
        let d2 = d1 - vol * years.sqrt();
        let discount = (-self.rate * years).exp();

        let value = match opt_type {
            OptionType::Call => spot * norm_cdf(d1) - strike * discount * norm_cdf(d2),
            OptionType::Put => strike * discount * norm_cdf(-d2) - spot * norm_cdf(-d1),
        };

        // Deep ITM puts can price fractionally under intrinsic with r > 0;
        // the floor at zero is what matters for credits.
        value.max(0.0)
    }

    /// Net premium of a vertical: short leg minus long leg, unfloored.
    pub fn vertical_value(
        &self,
        spot: f64,
        short_strike: f64,
        long_strike: f64,
        dte: f64,
        vol: f64,
        opt_type: OptionType,
    ) -> f64 {
        self.estimate_credit(spot, short_strike, dte, vol, opt_type)
            - self.estimate_credit(spot, long_strike, dte, vol, opt_type)
    }

    /// Credit for opening a vertical, floored at `min_credit`.
    pub fn vertical_credit(
        &self,
        spot: f64,
        short_strike: f64,
        long_strike: f64,
        dte: f64,
        vol: f64,
        opt_type: OptionType,
    ) -> f64 {
        self.vertical_value(spot, short_strike, long_strike, dte, vol, opt_type)
            .max(self.min_credit)
    }

    /// Option delta. Calls in [0, 1], puts in [-1, 0].
    pub fn delta(&self, spot: f64, strike: f64, dte: f64, vol: f64, opt_type: OptionType) -> f64 {
        let years = dte / DAYS_PER_YEAR;
        if Self::is_degenerate(spot, strike, years, vol) {
            return match opt_type {
                OptionType::Call if spot > strike => 1.0,
                OptionType::Put if spot < strike => -1.0,
                _ => 0.0,
            };
        }

        let d1 = self.d1(spot, strike, years, vol);
        match opt_type {
            OptionType::Call => norm_cdf(d1),
            OptionType::Put => norm_cdf(d1) - 1.0,
        }
    }

    /// Strike whose absolute delta equals `target_delta`, by inverting d1.
    ///
    /// Call: `d1 = N^-1(delta)`; put: `d1 = N^-1(1 - |delta|)`. Then
    /// `K = S * exp(-d1 * vol * sqrt(T) + (r + vol^2 / 2) * T)`.
    /// Falls back to the spot when the inputs are degenerate.
    pub fn strike_for_delta(
        &self,
        spot: f64,
        dte: f64,
        vol: f64,
        target_delta: f64,
        opt_type: OptionType,
    ) -> f64 {
        let years = dte.max(0.0) / DAYS_PER_YEAR;
        if Self::is_degenerate(spot, spot, years, vol) {
            return spot;
        }

        let delta = target_delta.abs().clamp(0.001, 0.999);
        let d1 = match opt_type {
            OptionType::Call => norm_inv(delta),
            OptionType::Put => norm_inv(1.0 - delta),
        };

        spot * (-d1 * vol * years.sqrt() + (self.rate + 0.5 * vol * vol) * years).exp()
    }
}

/// Round a strike to the nearest listed increment.
pub fn round_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 || !increment.is_finite() {
        return value;
    }
    (value / increment).round() * increment
}
