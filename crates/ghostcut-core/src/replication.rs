//! Replication positions and lag observations
//!
//! Values written into the control plane by the external binlog reader and
//! lag monitors.

use crate::error::{OscError, Result};
use crate::instance_key::InstanceKey;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// A position in the binary log stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    /// Binary log file name, e.g. `mysql-bin.000123`
    pub log_file: String,
    /// Byte offset within the file
    pub log_pos: u64,
}

impl BinlogCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
        }
    }

    /// Parse `file:pos`.
    pub fn parse(s: &str) -> Result<Self> {
        let (file, pos) = s
            .rsplit_once(':')
            .ok_or_else(|| OscError::other(format!("Cannot parse binlog coordinates: {}", s)))?;
        let log_pos = pos
            .parse::<u64>()
            .map_err(|_| OscError::other(format!("Invalid binlog position: {}", pos)))?;
        Ok(Self::new(file, log_pos))
    }

    /// True when no position has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.log_file.is_empty()
    }

    /// `file:pos`
    pub fn display_string(&self) -> String {
        self.to_string()
    }

    /// True when this position precedes `other`.
    pub fn smaller_than(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Less
    }
}

impl Ord for BinlogCoordinates {
    fn cmp(&self, other: &Self) -> Ordering {
        let (prefix, sequence) = file_sequence(&self.log_file);
        let (other_prefix, other_sequence) = file_sequence(&other.log_file);
        prefix
            .cmp(other_prefix)
            .then(sequence.cmp(&other_sequence))
            .then_with(|| self.log_file.cmp(&other.log_file))
            .then(self.log_pos.cmp(&other.log_pos))
    }
}

/// Split `mysql-bin.000123` into `("mysql-bin", Some(123))`.
///
/// The sequence widens past six digits once `999999` rolls over, so it is
/// compared as a number.
fn file_sequence(log_file: &str) -> (&str, Option<u64>) {
    match log_file.rsplit_once('.') {
        Some((prefix, suffix)) => match suffix.parse::<u64>() {
            Ok(sequence) => (prefix, Some(sequence)),
            Err(_) => (log_file, None),
        },
        None => (log_file, None),
    }
}

impl PartialOrd for BinlogCoordinates {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Result of measuring replication lag on one replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicationLagResult {
    /// Replica the lag was measured on
    pub key: InstanceKey,
    /// Measured lag
    pub lag: Duration,
    /// Measurement error, if the probe failed
    pub error: Option<String>,
}

impl ReplicationLagResult {
    /// A successful measurement.
    pub fn new(key: InstanceKey, lag: Duration) -> Self {
        Self {
            key,
            lag,
            error: None,
        }
    }

    /// A failed measurement.
    pub fn failed(key: InstanceKey, error: impl Into<String>) -> Self {
        Self {
            key,
            lag: Duration::ZERO,
            error: Some(error.into()),
        }
    }

    /// The "nothing to report" result.
    pub fn no_lag() -> Self {
        Self::default()
    }

    pub fn has_lag(&self) -> bool {
        !self.lag.is_zero()
    }
}
