//! Static symbol-to-sector and correlation table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Pairwise correlation between two symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationPair {
    /// First symbol.
    pub a: String,
    /// Second symbol.
    pub b: String,
    /// Correlation coefficient in `[-1, 1]`.
    pub rho: f64,
}

/// Sector membership and correlated pairs used by concentration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Symbol to sector.
    #[serde(default)]
    pub sectors: BTreeMap<String, String>,
    /// Known correlations.
    #[serde(default)]
    pub pairs: Vec<CorrelationPair>,
    /// `|rho|` at or above which two symbols count as correlated.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            sectors: BTreeMap::new(),
            pairs: Vec::new(),
            threshold: default_threshold(),
        }
    }
}

const fn default_threshold() -> f64 {
    0.7
}

impl CorrelationConfig {
    /// Sector of `symbol`, if mapped.
    #[must_use]
    pub fn sector(&self, symbol: &str) -> Option<&str> {
        self.sectors.get(symbol).map(String::as_str)
    }

    /// Symbols correlated with `symbol` at or above the threshold.
    #[must_use]
    pub fn correlated_with(&self, symbol: &str) -> Vec<&str> {
        let mut peers: Vec<&str> = self
            .pairs
            .iter()
            .filter(|pair| pair.rho.abs() >= self.threshold)
            .filter_map(|pair| {
                if pair.a == symbol {
                    Some(pair.b.as_str())
                } else if pair.b == symbol {
                    Some(pair.a.as_str())
                } else {
                    None
                }
            })
            .filter(|peer| *peer != symbol)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}
