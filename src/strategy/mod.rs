//! Strategy rule set and entry analysis.
//!
//! Strategies:
//! - `zero_dte`: Friday same-day credit vertical, side picked from the opening gap
//! - `lt112`: 112-DTE put credit vertical, rolled or closed at 21 DTE
//! - `strangle`: 90-DTE short strangle, rolled or converted when tested
//! - `ipmcc`: long LEAP call financed by short weekly calls
//! - `leap_puts`: long-dated short puts for larger accounts

pub mod analyzer;
pub mod rules;
pub mod structures;

pub use analyzer::{Adjustment, EntrySignal, RuleAnalyzer, StrategyAnalyzer};
pub use rules::{
    EntryRules, ExitRules, IpmccRules, LeapPutRules, Lt112Rules, StrangleRules, StrategyKind,
    StrategyRules, ZeroDteRules,
};
pub use structures::{EvaluationError, StructureQuote};
