//! Optional YAML configuration file
//!
//! ```yaml
//! client:
//!   user: ${OSC_USER}
//!   password: ${OSC_PASSWORD}
//! osc:
//!   chunk_size: 2000
//!   max_lag_millis: 2500
//!   max_load: Threads_running=30
//! ```
//!
//! `user` and `password` may name an environment variable as `${VAR}`; the
//! whole value is then replaced by the variable's content (empty when unset).
//! The file is re-read on SIGHUP.

use crate::error::{OscError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

/// Pattern: a value referring to `${VAR}`
static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub client: ClientSection,
    pub osc: OscSection,
}

/// Database credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for ClientSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSection")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Migration tunables that may be changed by editing the file and sending
/// SIGHUP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscSection {
    pub chunk_size: Option<i64>,
    pub max_lag_millis: Option<i64>,
    pub replication_lag_query: Option<String>,
    pub max_load: Option<String>,
}

impl FileConfig {
    /// Load and resolve a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OscError::config(format!(
                "Error reading config file {}. Details: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content).map_err(|e| {
            OscError::config(format!(
                "Error reading config file {}. Details: {}",
                path.display(),
                e
            ))
        })
    }

    /// Parse YAML content and resolve environment references in credentials.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.client.user = resolve_env_reference(&config.client.user);
        config.client.password = resolve_env_reference(&config.client.password);
        Ok(config)
    }
}

/// Replace a value that contains `${VAR}` with the content of `VAR`.
fn resolve_env_reference(value: &str) -> String {
    match ENV_VAR_REGEX.captures(value) {
        Some(caps) => std::env::var(&caps[1]).unwrap_or_default(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_parse_full() {
        let yaml = r#"
client:
  user: migrator
  password: secret
osc:
  chunk_size: 2000
  max_lag_millis: 2500
  replication_lag_query: "select lag from meta.heartbeat"
  max_load: Threads_running=30
"#;
        let config = FileConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.client.user, "migrator");
        assert_eq!(config.client.password, "secret");
        assert_eq!(config.osc.chunk_size, Some(2000));
        assert_eq!(config.osc.max_lag_millis, Some(2500));
        assert_eq!(config.osc.max_load.as_deref(), Some("Threads_running=30"));
    }

    #[test]
    fn test_parse_partial_and_empty() {
        let config = FileConfig::from_yaml_str("client:\n  user: u\n").unwrap();
        assert_eq!(config.client.user, "u");
        assert_eq!(config.osc, OscSection::default());

        assert_eq!(FileConfig::from_yaml_str("").unwrap(), FileConfig::default());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = FileConfig::from_yaml_str("osc:\n  chunk_size: [").unwrap_err();
        assert!(matches!(err, OscError::Yaml(_)));
    }

    #[test]
    #[serial]
    fn test_env_reference() {
        std::env::set_var("GHOSTCUT_TEST_USER", "from-env");
        std::env::remove_var("GHOSTCUT_TEST_MISSING");

        let yaml = "client:\n  user: ${GHOSTCUT_TEST_USER}\n  password: ${GHOSTCUT_TEST_MISSING}\n";
        let config = FileConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.client.user, "from-env");
        assert_eq!(config.client.password, "");

        std::env::remove_var("GHOSTCUT_TEST_USER");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "osc:\n  chunk_size: 500").unwrap();
        let config = FileConfig::from_file(file.path()).unwrap();
        assert_eq!(config.osc.chunk_size, Some(500));

        let err = FileConfig::from_file("/nonexistent/ghostcut.yaml").unwrap_err();
        assert!(err.to_string().contains("Error reading config file"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let section = ClientSection {
            user: "u".to_string(),
            password: "p@ss".to_string(),
        };
        assert!(!format!("{:?}", section).contains("p@ss"));
    }
}
