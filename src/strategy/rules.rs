//! Strategy rule tables.
//!
//! Each strategy is a variant of [`StrategyRules`] carrying its own
//! parameters, so a rule table can never be looked up under a misspelled
//! key: unknown identifiers fail when the configuration is parsed.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Strategy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Same-day vertical sold on Fridays.
    ZeroDte,
    /// 112-DTE put credit vertical.
    Lt112,
    /// 90-DTE short strangle.
    Strangle,
    /// Long LEAP call with short weekly calls against it.
    Ipmcc,
    /// Long-dated single-leg short puts.
    LeapPuts,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        Self::ZeroDte,
        Self::Lt112,
        Self::Strangle,
        Self::Ipmcc,
        Self::LeapPuts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZeroDte => "zero_dte",
            Self::Lt112 => "lt112",
            Self::Strangle => "strangle",
            Self::Ipmcc => "ipmcc",
            Self::LeapPuts => "leap_puts",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "zero_dte" | "0dte" | "friday_0dte" => Ok(Self::ZeroDte),
            "lt112" | "lt_112" => Ok(Self::Lt112),
            "strangle" | "futures_strangle" => Ok(Self::Strangle),
            "ipmcc" => Ok(Self::Ipmcc),
            "leap_puts" | "leap_put_ladder" => Ok(Self::LeapPuts),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Entry parameters shared by every strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryRules {
    /// Weekdays on which the strategy may open positions.
    pub weekdays: Vec<Weekday>,
    /// Calendar days to expiration of the (front) structure at entry.
    pub target_dte: i64,
    /// Lowest phase in which the strategy is permitted.
    pub min_phase: u8,
    /// Contracts per entry, indexed by phase - 1; later phases reuse the
    /// last entry.
    pub contracts_per_phase: Vec<u32>,
    /// Symbols the strategy trades; empty means every run symbol.
    pub symbols: Vec<String>,
    /// Listed strike spacing.
    pub strike_increment: f64,
}

impl Default for EntryRules {
    fn default() -> Self {
        Self {
            weekdays: vec![Weekday::Mon],
            target_dte: 45,
            min_phase: 1,
            contracts_per_phase: vec![1],
            symbols: vec![],
            strike_increment: 1.0,
        }
    }
}

/// Exit thresholds relative to the entry premium.
///
/// For credit structures the basis is the credit received, for debit
/// structures the debit paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitRules {
    /// Close once the gain reaches this fraction of the basis.
    pub profit_target: f64,
    /// Close once the loss reaches this multiple of the basis.
    pub stop_loss: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            profit_target: 0.5,
            stop_loss: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroDteRules {
    pub entry: EntryRules,
    pub exit: ExitRules,
    /// Absolute delta of the short strike.
    pub short_delta: f64,
    /// Distance between short and long strikes, in points.
    pub wing_width: f64,
    /// After this time an in-the-money short strike forces a close.
    pub defense_time: NaiveTime,
}

impl Default for ZeroDteRules {
    fn default() -> Self {
        Self {
            entry: EntryRules {
                weekdays: vec![Weekday::Fri],
                target_dte: 0,
                min_phase: 2,
                contracts_per_phase: vec![0, 1, 2, 3],
                ..Default::default()
            },
            exit: ExitRules {
                profit_target: 0.5,
                stop_loss: 2.0,
            },
            short_delta: 0.15,
            wing_width: 5.0,
            defense_time: NaiveTime::from_hms_opt(15, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lt112Rules {
    pub entry: EntryRules,
    pub exit: ExitRules,
    pub short_delta: f64,
    pub wing_width: f64,
    /// DTE at which the position is either rolled or closed.
    pub management_dte: i64,
    /// Spot within this fraction of the short strike counts as tested.
    pub tested_distance: f64,
}

impl Default for Lt112Rules {
    fn default() -> Self {
        Self {
            entry: EntryRules {
                weekdays: vec![Weekday::Wed],
                target_dte: 112,
                min_phase: 1,
                contracts_per_phase: vec![1, 1, 2, 2],
                ..Default::default()
            },
            exit: ExitRules {
                profit_target: 0.5,
                stop_loss: 2.0,
            },
            short_delta: 0.20,
            wing_width: 10.0,
            management_dte: 21,
            tested_distance: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrangleRules {
    pub entry: EntryRules,
    pub exit: ExitRules,
    pub put_delta: f64,
    pub call_delta: f64,
    pub management_dte: i64,
    pub tested_distance: f64,
    /// Width of the defined-risk vertical a tested strangle converts into.
    pub conversion_width: f64,
}

impl Default for StrangleRules {
    fn default() -> Self {
        Self {
            entry: EntryRules {
                weekdays: vec![Weekday::Tue],
                target_dte: 90,
                min_phase: 1,
                contracts_per_phase: vec![1, 1, 2, 3],
                ..Default::default()
            },
            exit: ExitRules {
                profit_target: 0.5,
                stop_loss: 2.0,
            },
            put_delta: 0.07,
            call_delta: 0.07,
            management_dte: 21,
            tested_distance: 0.02,
            conversion_width: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpmccRules {
    /// `entry.target_dte` is the DTE of the short weekly call.
    pub entry: EntryRules,
    pub exit: ExitRules,
    pub long_delta: f64,
    pub long_dte: i64,
    pub short_delta: f64,
}

impl Default for IpmccRules {
    fn default() -> Self {
        Self {
            entry: EntryRules {
                weekdays: vec![Weekday::Mon],
                target_dte: 7,
                min_phase: 2,
                contracts_per_phase: vec![0, 1, 1, 2],
                ..Default::default()
            },
            exit: ExitRules {
                profit_target: 0.25,
                stop_loss: 0.5,
            },
            long_delta: 0.80,
            long_dte: 365,
            short_delta: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeapPutRules {
    pub entry: EntryRules,
    pub exit: ExitRules,
    pub short_delta: f64,
}

impl Default for LeapPutRules {
    fn default() -> Self {
        Self {
            entry: EntryRules {
                weekdays: vec![Weekday::Wed],
                target_dte: 365,
                min_phase: 3,
                contracts_per_phase: vec![0, 0, 1, 2],
                ..Default::default()
            },
            exit: ExitRules {
                profit_target: 0.5,
                stop_loss: 2.0,
            },
            short_delta: 0.12,
        }
    }
}

/// Rule table for one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyRules {
    ZeroDte(ZeroDteRules),
    Lt112(Lt112Rules),
    Strangle(StrangleRules),
    Ipmcc(IpmccRules),
    LeapPuts(LeapPutRules),
}

impl StrategyRules {
    /// Default rule table for a strategy.
    pub fn defaults(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::ZeroDte => Self::ZeroDte(ZeroDteRules::default()),
            StrategyKind::Lt112 => Self::Lt112(Lt112Rules::default()),
            StrategyKind::Strangle => Self::Strangle(StrangleRules::default()),
            StrategyKind::Ipmcc => Self::Ipmcc(IpmccRules::default()),
            StrategyKind::LeapPuts => Self::LeapPuts(LeapPutRules::default()),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::ZeroDte(_) => StrategyKind::ZeroDte,
            Self::Lt112(_) => StrategyKind::Lt112,
            Self::Strangle(_) => StrategyKind::Strangle,
            Self::Ipmcc(_) => StrategyKind::Ipmcc,
            Self::LeapPuts(_) => StrategyKind::LeapPuts,
        }
    }

    pub fn entry(&self) -> &EntryRules {
        match self {
            Self::ZeroDte(r) => &r.entry,
            Self::Lt112(r) => &r.entry,
            Self::Strangle(r) => &r.entry,
            Self::Ipmcc(r) => &r.entry,
            Self::LeapPuts(r) => &r.entry,
        }
    }

    pub fn entry_mut(&mut self) -> &mut EntryRules {
        match self {
            Self::ZeroDte(r) => &mut r.entry,
            Self::Lt112(r) => &mut r.entry,
            Self::Strangle(r) => &mut r.entry,
            Self::Ipmcc(r) => &mut r.entry,
            Self::LeapPuts(r) => &mut r.entry,
        }
    }

    pub fn exit(&self) -> &ExitRules {
        match self {
            Self::ZeroDte(r) => &r.exit,
            Self::Lt112(r) => &r.exit,
            Self::Strangle(r) => &r.exit,
            Self::Ipmcc(r) => &r.exit,
            Self::LeapPuts(r) => &r.exit,
        }
    }

    pub fn trades_on(&self, weekday: Weekday) -> bool {
        self.entry().weekdays.contains(&weekday)
    }

    /// Contracts per entry in a phase; zero means not traded.
    pub fn contracts_for_phase(&self, phase: u8) -> u32 {
        let table = &self.entry().contracts_per_phase;
        let idx = (phase.max(1) - 1) as usize;
        table.get(idx).or_else(|| table.last()).copied().unwrap_or(0)
    }

    pub fn allowed_in_phase(&self, phase: u8) -> bool {
        phase >= self.entry().min_phase && self.contracts_for_phase(phase) > 0
    }

    /// Whether the strategy trades `symbol` given the run's symbol set.
    pub fn trades_symbol(&self, symbol: &str) -> bool {
        let symbols = &self.entry().symbols;
        symbols.is_empty() || symbols.iter().any(|s| s == symbol)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let entry = self.entry();
        let exit = self.exit();
        let name = self.kind();

        if entry.target_dte < 0 {
            return Err(ConfigError::Invalid(format!("{}: negative target_dte", name)));
        }
        if entry.contracts_per_phase.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: contracts_per_phase is empty",
                name
            )));
        }
        if !(exit.profit_target > 0.0 && exit.stop_loss > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "{}: exit thresholds must be positive",
                name
            )));
        }
        let deltas: Vec<f64> = match self {
            Self::ZeroDte(r) => vec![r.short_delta],
            Self::Lt112(r) => vec![r.short_delta],
            Self::Strangle(r) => vec![r.put_delta, r.call_delta],
            Self::Ipmcc(r) => vec![r.long_delta, r.short_delta],
            Self::LeapPuts(r) => vec![r.short_delta],
        };
        if deltas.iter().any(|d| !(*d > 0.0 && *d < 1.0)) {
            return Err(ConfigError::Invalid(format!(
                "{}: deltas must be in (0, 1)",
                name
            )));
        }
        Ok(())
    }
}
