//! Status-variable thresholds for `--max-load` and `--critical-load`
//!
//! A [`LoadMap`] maps a server status variable (e.g. `Threads_running`) to the
//! threshold at which the migration reacts. Input is a comma-delimited list of
//! `name=value` clauses:
//!
//! ```rust
//! use ghostcut_core::LoadMap;
//!
//! let load = LoadMap::parse("Threads_running=100,Threads_connected=500").unwrap();
//! assert_eq!(load.get("Threads_running"), Some(100));
//! assert_eq!(load.to_string(), "Threads_connected=500,Threads_running=100");
//! ```

use crate::error::{OscError, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Mapping of status variable to threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadMap {
    thresholds: HashMap<String, i64>,
}

impl LoadMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `name=value[,name=value...]` list.
    ///
    /// Empty input yields an empty map. Any malformed clause fails the whole
    /// parse; nothing is partially applied.
    pub fn parse(load_list: &str) -> Result<Self> {
        let mut result = Self::new();
        if load_list.is_empty() {
            return Ok(result);
        }

        for condition in load_list.split(',') {
            let tokens: Vec<&str> = condition.split('=').collect();
            if tokens.len() != 2 {
                return Err(OscError::load_map(format!(
                    "Error parsing load condition: {}",
                    condition
                )));
            }
            if tokens[0].is_empty() {
                return Err(OscError::load_map(format!(
                    "Error parsing status variable in load condition: {}",
                    condition
                )));
            }
            let threshold = tokens[1].parse::<i64>().map_err(|_| {
                OscError::load_map(format!(
                    "Error parsing numeric value in load condition: {}",
                    condition
                ))
            })?;
            result.thresholds.insert(tokens[0].to_string(), threshold);
        }

        Ok(result)
    }

    /// Independent copy of this map.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Threshold for a status variable.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.thresholds.get(name).copied()
    }

    /// Set a threshold, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, threshold: i64) -> Option<i64> {
        self.thresholds.insert(name.into(), threshold)
    }

    /// Iterate over `(name, threshold)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.thresholds.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of configured thresholds.
    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    /// True when no thresholds are configured.
    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }
}

impl fmt::Display for LoadMap {
    /// Renders `name=value` tokens sorted lexicographically by token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<String> = self
            .thresholds
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        tokens.sort();
        write!(f, "{}", tokens.join(","))
    }
}

impl FromStr for LoadMap {
    type Err = OscError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
