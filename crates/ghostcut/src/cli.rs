//! CLI argument parsing for ghostcut
//!
//! Flags cover the connection, the table and ALTER statement to migrate,
//! throttling and cut-over behavior. Most flags can also be given through
//! `GHOSTCUT_*` environment variables.

use clap::Parser;
use std::path::PathBuf;

/// ghostcut - Online schema migration for MySQL
///
/// Copies rows into a ghost table while replaying binlog changes, throttling
/// on replica lag and server load, then swaps the tables.
#[derive(Parser, Debug)]
#[command(name = "ghostcut")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // ============ Connection ============
    /// MySQL hostname (preferably a replica, not the master)
    #[arg(long, default_value = "127.0.0.1", env = "GHOSTCUT_HOST")]
    pub host: String,

    /// MySQL port (preferably a replica, not the master)
    #[arg(long, default_value = "3306", env = "GHOSTCUT_PORT")]
    pub port: u16,

    /// MySQL user
    #[arg(long, env = "GHOSTCUT_USER")]
    pub user: Option<String>,

    /// MySQL password
    #[arg(long, env = "GHOSTCUT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Explicit master identity, `host[:port]`
    #[arg(long, env = "GHOSTCUT_ASSUME_MASTER_HOST")]
    pub assume_master_host: Option<String>,

    /// MySQL user on master, if different from that on replica
    #[arg(long)]
    pub master_user: Option<String>,

    /// MySQL password on master, if different from that on replica
    #[arg(long, hide_env_values = true)]
    pub master_password: Option<String>,

    /// YAML config file, re-read on SIGHUP
    #[arg(long, env = "GHOSTCUT_CONF")]
    pub conf: Option<PathBuf>,

    /// Enable TLS connections to MySQL hosts
    #[arg(long)]
    pub ssl: bool,

    /// CA certificate in PEM format
    #[arg(long)]
    pub ssl_ca: Option<PathBuf>,

    /// Client certificate in PEM format
    #[arg(long)]
    pub ssl_cert: Option<PathBuf>,

    /// Client key in PEM format
    #[arg(long)]
    pub ssl_key: Option<PathBuf>,

    /// Skip verification of the server certificate chain and host name
    #[arg(long)]
    pub ssl_allow_insecure: bool,

    /// Running on Aliyun RDS (server does not report its real port)
    #[arg(long)]
    pub aliyun_rds: bool,

    /// Running on 1st generation Google Cloud SQL
    #[arg(long)]
    pub gcp: bool,

    // ============ Migration ============
    /// Database name (mandatory)
    #[arg(long, env = "GHOSTCUT_DATABASE")]
    pub database: Option<String>,

    /// Table name (mandatory)
    #[arg(long, env = "GHOSTCUT_TABLE")]
    pub table: Option<String>,

    /// ALTER clauses to apply, e.g. "ADD COLUMN c INT" (mandatory)
    #[arg(long)]
    pub alter: Option<String>,

    /// Base name for the ghost, old and changelog tables
    #[arg(long)]
    pub force_table_names: Option<String>,

    /// Allow the migration to run directly on the master
    #[arg(long)]
    pub allow_on_master: bool,

    /// Run on a replica, then swap and swap back for verification
    #[arg(long)]
    pub test_on_replica: bool,

    /// With --test-on-replica, do not stop replication
    #[arg(long)]
    pub test_on_replica_skip_replica_stop: bool,

    /// Run the full migration, including cut-over, on a replica
    #[arg(long)]
    pub migrate_on_replica: bool,

    /// Switch binlog format to ROW on the replica if needed
    #[arg(long)]
    pub switch_to_rbr: bool,

    /// The server is known to use ROW binlog format
    #[arg(long)]
    pub assume_rbr: bool,

    /// Confirm the detected column renames are intended
    #[arg(long)]
    pub approve_renamed_columns: bool,

    /// Treat detected renames as unrelated columns (data may be lost)
    #[arg(long)]
    pub skip_renamed_columns: bool,

    /// Embed a timestamp in the old table name
    #[arg(long)]
    pub timestamp_old_table: bool,

    // ============ Cut-over ============
    /// Cut-over type: default|atomic, two-step
    #[arg(long, default_value = "default")]
    pub cut_over: String,

    /// Max seconds to hold locks while attempting cut-over (1-10)
    #[arg(long, default_value = "3")]
    pub cut_over_lock_timeout_seconds: i64,

    /// Wait exponentially longer between failed cut-over attempts
    #[arg(long)]
    pub cut_over_exponential_backoff: bool,

    /// Max seconds between attempts with exponential backoff (>= 2)
    #[arg(long, default_value = "64")]
    pub exponential_backoff_max_interval: i64,

    /// Postpone cut-over while this file exists
    #[arg(long)]
    pub postpone_cut_over_flag_file: Option<PathBuf>,

    // ============ Throttling ============
    /// Rows per copy iteration (100-100000) [default: 1000]
    ///
    /// Overrides `osc.chunk_size` from --conf.
    #[arg(long)]
    pub chunk_size: Option<i64>,

    /// Binlog events applied per transaction (1-1000)
    #[arg(long, default_value = "10")]
    pub dml_batch_size: i64,

    /// Retries for various operations before aborting
    #[arg(long, default_value = "60")]
    pub default_retries: i64,

    /// Sleep time per copy time; 0 is aggressive, 1 doubles runtime (0-100)
    #[arg(long, default_value = "0")]
    pub nice_ratio: f64,

    /// Replication lag at which to throttle [default: 1500]
    ///
    /// Overrides `osc.max_lag_millis` from --conf.
    #[arg(long)]
    pub max_lag_millis: Option<i64>,

    /// Heartbeat injection interval (100-1000)
    #[arg(long, default_value = "100")]
    pub heartbeat_interval_millis: i64,

    /// Replicas to check for lag: myhost1.com:3306,myhost2.com
    #[arg(long, default_value = "")]
    pub throttle_control_replicas: String,

    /// Query returning >0 to throttle, 0 to proceed
    #[arg(long, default_value = "")]
    pub throttle_query: String,

    /// URL probed with HEAD; any status other than 200 throttles
    #[arg(long, default_value = "")]
    pub throttle_http: String,

    /// Ignore HTTP connection errors during the throttle check
    #[arg(long)]
    pub ignore_http_errors: bool,

    /// Throttle while this file exists
    #[arg(long)]
    pub throttle_flag_file: Option<PathBuf>,

    /// Throttle while this file exists; shared across migrations
    #[arg(long, default_value = "/tmp/ghostcut.throttle")]
    pub throttle_additional_flag_file: PathBuf,

    /// Terminate immediately, without cleanup, when this file is created
    #[arg(long)]
    pub panic_flag_file: Option<PathBuf>,

    /// Status thresholds that throttle: Threads_running=100,Threads_connected=500
    ///
    /// Overrides `osc.max_load` from --conf.
    #[arg(long)]
    pub max_load: Option<String>,

    /// Status thresholds that abort or hibernate, same format as --max-load
    #[arg(long, default_value = "")]
    pub critical_load: String,

    /// Re-check critical load after this delay before aborting; 0 aborts at once
    #[arg(long, default_value = "0")]
    pub critical_load_interval_millis: u64,

    /// Hibernate this long instead of aborting on critical load
    #[arg(long, default_value = "0")]
    pub critical_load_hibernate_seconds: i64,

    // ============ Logging ============
    /// Errors only
    #[arg(long)]
    pub quiet: bool,

    /// Informational output
    #[arg(long)]
    pub verbose: bool,

    /// Debug output (very verbose)
    #[arg(long)]
    pub debug: bool,

    /// Explicit tracing filter, overrides --quiet/--verbose/--debug
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Validate flag combinations.
    pub fn validate(&self) -> Result<(), String> {
        if self.database.as_deref().unwrap_or("").is_empty() {
            return Err("--database must be provided and database name must not be empty".into());
        }
        if self.table.as_deref().unwrap_or("").is_empty() {
            return Err("--table must be provided and table name must not be empty".into());
        }
        if self.alter.as_deref().unwrap_or("").is_empty() {
            return Err("--alter must be provided and statement must not be empty".into());
        }

        if self.allow_on_master && self.test_on_replica {
            return Err("--allow-on-master and --test-on-replica are mutually exclusive".into());
        }
        if self.allow_on_master && self.migrate_on_replica {
            return Err("--allow-on-master and --migrate-on-replica are mutually exclusive".into());
        }
        if self.migrate_on_replica && self.test_on_replica {
            return Err("--migrate-on-replica and --test-on-replica are mutually exclusive".into());
        }
        if self.switch_to_rbr && self.assume_rbr {
            return Err("--switch-to-rbr and --assume-rbr are mutually exclusive".into());
        }
        if self.test_on_replica_skip_replica_stop && !self.test_on_replica {
            return Err(
                "--test-on-replica-skip-replica-stop requires --test-on-replica to be enabled"
                    .into(),
            );
        }

        if self.assume_master_host.is_none() {
            if self.master_user.is_some() {
                return Err("--master-user requires --assume-master-host".into());
            }
            if self.master_password.is_some() {
                return Err("--master-password requires --assume-master-host".into());
            }
        }

        if !self.ssl {
            if self.ssl_ca.is_some() {
                return Err("--ssl-ca requires --ssl".into());
            }
            if self.ssl_cert.is_some() {
                return Err("--ssl-cert requires --ssl".into());
            }
            if self.ssl_key.is_some() {
                return Err("--ssl-key requires --ssl".into());
            }
            if self.ssl_allow_insecure {
                return Err("--ssl-allow-insecure requires --ssl".into());
            }
        }

        Ok(())
    }

    /// Tracing filter derived from the logging flags.
    pub fn log_filter(&self) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        let level = if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else if self.quiet {
            "error"
        } else {
            "warn"
        };
        level.to_string()
    }
}
