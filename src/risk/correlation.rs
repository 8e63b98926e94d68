//! Correlation groups.
//!
//! Symbols that move together (equity indices, energy, metals, ...) share a
//! group, and each group may hold at most `limit` open positions.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// One named group of correlated symbols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationGroupConfig {
    pub name: String,
    pub symbols: Vec<String>,
}

impl CorrelationGroupConfig {
    pub fn new(name: &str, symbols: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Default grouping for the usual ETF and futures universe.
pub fn default_groups() -> Vec<CorrelationGroupConfig> {
    vec![
        CorrelationGroupConfig::new(
            "equities",
            &["SPY", "QQQ", "IWM", "DIA", "ES", "MES", "NQ", "MNQ", "RTY", "M2K"],
        ),
        CorrelationGroupConfig::new("energy", &["CL", "MCL", "NG", "XLE", "XOP", "USO"]),
        CorrelationGroupConfig::new("metals", &["GC", "MGC", "SI", "SIL", "GLD", "SLV"]),
        CorrelationGroupConfig::new("bonds", &["TLT", "IEF", "ZB", "ZN", "ZF"]),
        CorrelationGroupConfig::new("currencies", &["6E", "6J", "6B", "6A", "M6E", "FXE"]),
        CorrelationGroupConfig::new("agriculture", &["ZC", "ZS", "ZW"]),
    ]
}

/// Open-position counts per correlation group.
#[derive(Debug, Clone)]
pub struct CorrelationTracker {
    symbol_to_group: HashMap<String, String>,
    open_counts: BTreeMap<String, usize>,
    limit: usize,
}

impl CorrelationTracker {
    pub fn new(groups: &[CorrelationGroupConfig], limit: usize) -> Result<Self, ConfigError> {
        let mut symbol_to_group: HashMap<String, String> = HashMap::new();
        let mut open_counts = BTreeMap::new();

        for group in groups {
            open_counts.insert(group.name.clone(), 0);
            for symbol in &group.symbols {
                if let Some(first) = symbol_to_group.get(symbol) {
                    if *first != group.name {
                        return Err(ConfigError::DuplicateSymbol {
                            symbol: symbol.clone(),
                            first: first.clone(),
                            second: group.name.clone(),
                        });
                    }
                }
                symbol_to_group.insert(symbol.clone(), group.name.clone());
            }
        }

        Ok(Self {
            symbol_to_group,
            open_counts,
            limit,
        })
    }

    pub fn group_of(&self, symbol: &str) -> Option<&str> {
        self.symbol_to_group.get(symbol).map(|g| g.as_str())
    }

    /// Fail with `UnmappedSymbol` for the first symbol without a group.
    pub fn ensure_mapped<'a, I>(&self, symbols: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for symbol in symbols {
            if self.group_of(symbol).is_none() {
                return Err(ConfigError::UnmappedSymbol(symbol.clone()));
            }
        }
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn open_count(&self, group: &str) -> usize {
        self.open_counts.get(group).copied().unwrap_or(0)
    }

    pub fn has_capacity(&self, group: &str) -> bool {
        self.open_count(group) < self.limit
    }

    pub(crate) fn increment(&mut self, group: &str) {
        *self.open_counts.entry(group.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn decrement(&mut self, group: &str) {
        if let Some(count) = self.open_counts.get_mut(group) {
            *count = count.saturating_sub(1);
        }
    }
}
