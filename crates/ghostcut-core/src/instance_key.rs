//! Replica identities used for lag-based throttling
//!
//! An [`InstanceKey`] names one MySQL server by `(hostname, port)`. An
//! [`InstanceKeyMap`] is the set of replicas whose lag is checked by the
//! throttler (`--throttle-control-replicas`).

use crate::error::{OscError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Port assumed when a key is given without one.
pub const DEFAULT_INSTANCE_PORT: u16 = 3306;

/// Identifies a MySQL server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceKey {
    /// Host name or address
    pub hostname: String,
    /// TCP port
    pub port: u16,
}

impl InstanceKey {
    /// Create a key from its parts.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Parse a strict `host:port` string.
    pub fn parse(host_port: &str) -> Result<Self> {
        let (hostname, port) = split_host_port(host_port).ok_or_else(|| {
            OscError::instance_key(format!(
                "Cannot parse InstanceKey from {}. Expected format is host:port",
                host_port
            ))
        })?;
        Self::from_parts(hostname, port)
    }

    /// Parse `host[:port]`, defaulting the port to 3306.
    ///
    /// Bracketed IPv6 literals (`[::1]:3307`) are accepted.
    pub fn parse_loose(host_port: &str) -> Result<Self> {
        match split_host_port(host_port) {
            Some((hostname, port)) => Self::from_parts(hostname, port),
            None => {
                let hostname = host_port
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host_port);
                Self::from_parts(hostname, &DEFAULT_INSTANCE_PORT.to_string())
            }
        }
    }

    fn from_parts(hostname: &str, port: &str) -> Result<Self> {
        if hostname.is_empty() {
            return Err(OscError::instance_key(
                "Cannot parse InstanceKey: empty hostname",
            ));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| OscError::instance_key(format!("Invalid port: {}", port)))?;
        Ok(Self::new(hostname, port))
    }

    /// `host:port` rendering.
    pub fn display_string(&self) -> String {
        self.to_string()
    }

    /// True when a hostname is set.
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty()
    }
}

/// Split `host:port` / `[v6]:port`; `None` when no port separator exists.
fn split_host_port(host_port: &str) -> Option<(&str, &str)> {
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    if host_port.matches(':').count() != 1 {
        return None;
    }
    host_port.split_once(':')
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// A set of instance keys. Insertion is idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceKeyMap {
    keys: HashSet<InstanceKey>,
}

impl InstanceKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Add a single key.
    pub fn add_key(&mut self, key: InstanceKey) {
        self.keys.insert(key);
    }

    /// Add all given keys.
    pub fn add_keys(&mut self, keys: impl IntoIterator<Item = InstanceKey>) {
        self.keys.extend(keys);
    }

    /// Check membership.
    pub fn has_key(&self, key: &InstanceKey) -> bool {
        self.keys.contains(key)
    }

    /// Keys in sorted order.
    pub fn instance_keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<InstanceKey> = self.keys.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Comma-delimited `host:port` list, sorted.
    pub fn to_comma_delimited_list(&self) -> String {
        self.instance_keys()
            .iter()
            .map(InstanceKey::display_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// JSON array of `{"Hostname": .., "Port": ..}` objects.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.instance_keys())?)
    }

    /// Merge keys from a JSON array. Nothing is added if the JSON is invalid.
    pub fn read_json(&mut self, json: &str) -> Result<()> {
        let keys: Vec<InstanceKey> = serde_json::from_str(json)?;
        self.add_keys(keys);
        Ok(())
    }

    /// Merge keys from `host[:port][,host[:port]...]`.
    ///
    /// Every token is parsed before any is added, so a malformed token leaves
    /// this set untouched.
    pub fn read_comma_delimited_list(&mut self, list: &str) -> Result<()> {
        if list.is_empty() {
            return Ok(());
        }
        let parsed = list
            .split(',')
            .map(|token| InstanceKey::parse_loose(token.trim()))
            .collect::<Result<Vec<_>>>()?;
        self.add_keys(parsed);
        Ok(())
    }
}

impl FromIterator<InstanceKey> for InstanceKeyMap {
    fn from_iter<I: IntoIterator<Item = InstanceKey>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}
