//! Connection identity and server validation
//!
//! The database driver is an external collaborator. This module only holds
//! the connection settings the control plane tracks and checks that a
//! freshly opened connection reached the server it was meant to reach.

use crate::error::{OscError, Result};
use crate::instance_key::InstanceKey;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

/// TLS options for connections to MySQL hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// CA certificate in PEM format
    pub ca_cert: Option<PathBuf>,
    /// Client certificate in PEM format
    pub client_cert: Option<PathBuf>,
    /// Client key in PEM format
    pub client_key: Option<PathBuf>,
    /// Skip verification of the server certificate chain and host name
    pub allow_insecure: bool,
}

/// Where and as whom to connect.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Configured endpoint
    pub key: InstanceKey,
    pub user: String,
    pub password: String,
    /// Endpoint the server reports about itself, once known
    pub implied_key: Option<InstanceKey>,
    /// `None` for plain connections
    pub tls: Option<TlsSettings>,
}

impl ConnectionConfig {
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    /// Same credentials and TLS settings, different endpoint.
    pub fn duplicate_credentials(&self, key: InstanceKey) -> Self {
        Self {
            key,
            user: self.user.clone(),
            password: self.password.clone(),
            implied_key: None,
            tls: self.tls.clone(),
        }
    }

    /// True when both configs point at the same server.
    pub fn equals(&self, other: &ConnectionConfig) -> bool {
        if self.key == other.key {
            return true;
        }
        matches!(
            (&self.implied_key, &other.implied_key),
            (Some(a), Some(b)) if a == b
        )
    }

    /// Hostname of the implied key, or empty.
    pub fn implied_hostname(&self) -> &str {
        self.implied_key
            .as_ref()
            .map(|k| k.hostname.as_str())
            .unwrap_or("")
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("key", &self.key)
            .field("user", &self.user)
            .field("password", &"***")
            .field("implied_key", &self.implied_key)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Server introspection needed to validate a connection.
///
/// Implemented by the database layer over `select @@global.version`,
/// `@@global.port` and `@@global.extra_port`.
#[async_trait]
pub trait ServerProbe: Send + Sync {
    async fn version(&self) -> Result<String>;

    async fn port(&self) -> Result<u16>;

    /// Secondary admin port; servers without one return an error.
    async fn extra_port(&self) -> Result<u16>;
}

/// Check that the connected server listens on the configured port.
///
/// Returns the server version on success. `cloud_port_override` is set for
/// managed services (Aliyun RDS, Google Cloud SQL) that do not report their
/// real port; the configured port is trusted there.
pub async fn validate_connection(
    probe: &dyn ServerProbe,
    config: &ConnectionConfig,
    cloud_port_override: bool,
) -> Result<String> {
    let version = probe.version().await?;

    let extra_port = match probe.extra_port().await {
        Ok(port) => port,
        Err(e) => {
            debug!(error = %e, "Server has no extra_port");
            0
        }
    };

    let port = if cloud_port_override {
        config.key.port
    } else {
        probe.port().await?
    };

    if config.key.port == port || (extra_port > 0 && config.key.port == extra_port) {
        info!(
            key = %config.key,
            version = %version,
            tls = config.tls.is_some(),
            "Connection validated"
        );
        return Ok(version);
    }

    if extra_port == 0 {
        Err(OscError::connection_validation(format!(
            "Unexpected database port reported: {}",
            port
        )))
    } else {
        Err(OscError::connection_validation(format!(
            "Unexpected database port reported: {} / extra_port: {}",
            port, extra_port
        )))
    }
}
