//! # Migration context
//!
//! The shared state of one migration, handed to every worker as
//! `Arc<MigrationContext>`.
//!
//! ## Layout
//!
//! - **Setup fields** (`pub`): identity, flag-file paths and operator choices.
//!   Assigned once before the context is shared; read-only afterwards.
//! - **Lock domains** (`parking_lot::Mutex`): throttle, HTTP throttle,
//!   configuration, point of interest. A method takes at most one of them and
//!   never while holding another.
//! - **Atomics**: tunables adjusted at runtime, progress counters and the
//!   cut-over critical-section flags.
//!
//! While the in-cut-over-critical-section flag is set, [`MigrationContext::is_throttled`]
//! reports `(false, "critical section", NoHint)` regardless of the stored
//! verdict, so the table swap is never stalled by a throttle poller.

use crate::abort::{abort_channel, AbortCoordinator, AbortHandle};
use crate::alter::AlterTableParser;
use crate::config::{FileConfig, OscSection};
use crate::connection::ConnectionConfig;
use crate::error::{OscError, Result};
use crate::instance_key::{InstanceKey, InstanceKeyMap};
use crate::load_map::LoadMap;
use crate::replication::{BinlogCoordinates, ReplicationLagResult};
use crate::throttle::{ThrottleCheckResult, ThrottleReasonHint};
use crate::utils::file_exists;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// MySQL identifier length limit.
pub const MAX_TABLE_NAME_LENGTH: usize = 64;

/// Upper bound for `dml_batch_size`.
pub const MAX_EVENTS_BATCH_SIZE: i64 = 1000;

pub const DEFAULT_NUM_RETRIES: i64 = 60;
pub const DEFAULT_CHUNK_SIZE: i64 = 1000;
pub const DEFAULT_MAX_LAG_MILLIS: i64 = 1500;
pub const DEFAULT_CUT_OVER_LOCK_TIMEOUT_SECONDS: i64 = 3;
pub const DEFAULT_DML_BATCH_SIZE: i64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MILLIS: i64 = 100;
pub const DEFAULT_EXPONENTIAL_BACKOFF_MAX_INTERVAL: i64 = 64;

/// How the final table swap is performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CutOverType {
    /// Single atomic `RENAME TABLE` under lock
    #[default]
    Atomic,
    /// Rename original away, then rename ghost into place
    TwoStep,
}

impl FromStr for CutOverType {
    type Err = OscError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "default" | "atomic" => Ok(Self::Atomic),
            "two-step" => Ok(Self::TwoStep),
            other => Err(OscError::config(format!("Unknown cut-over: {}", other))),
        }
    }
}

impl fmt::Display for CutOverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atomic => f.write_str("atomic"),
            Self::TwoStep => f.write_str("two-step"),
        }
    }
}

/// How the row count of the original table was estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsEstimateMethod {
    #[default]
    TableStatus,
    Explain,
    Count,
}

#[derive(Debug, Default)]
struct ThrottleState {
    is_throttled: bool,
    reason: String,
    reason_hint: ThrottleReasonHint,
    general_check_result: ThrottleCheckResult,
    throttle_query: String,
    default_num_retries: i64,
    nice_ratio: f64,
    max_load: LoadMap,
    critical_load: LoadMap,
    control_replica_keys: InstanceKeyMap,
    control_replicas_lag_result: ReplicationLagResult,
    recent_binlog_coordinates: BinlogCoordinates,
    row_copy_start: Option<Instant>,
    row_copy_end: Option<Instant>,
}

#[derive(Debug, Default)]
struct HttpThrottleState {
    url: String,
    ignore_http_errors: bool,
}

#[derive(Debug, Default)]
struct ConfigState {
    file: FileConfig,
    inspector: ConnectionConfig,
    applier: ConnectionConfig,
}

/// Shared state of one migration.
#[derive(Debug)]
pub struct MigrationContext {
    pub uuid: String,
    pub database_name: String,
    pub original_table_name: String,
    pub alter_statement: String,
    /// Base name for the ghost/old/changelog tables instead of the original
    pub force_tmp_table_name: Option<String>,
    /// Embed the start timestamp in the old table name
    pub timestamp_old_table: bool,
    pub cut_over_type: CutOverType,
    pub cut_over_exponential_backoff: bool,
    pub start_time: DateTime<Local>,

    pub table_engine: String,
    pub original_binlog_format: String,
    pub used_rows_estimate_method: RowsEstimateMethod,

    pub test_on_replica: bool,
    /// With `test_on_replica`, leave replication running at cut-over
    pub test_on_replica_skip_replica_stop: bool,
    pub migrate_on_replica: bool,
    pub allow_on_master: bool,
    pub switch_to_rbr: bool,
    pub assume_rbr: bool,
    pub aliyun_rds: bool,
    pub google_cloud_platform: bool,
    pub approve_renamed_columns: bool,
    pub skip_renamed_columns: bool,

    pub config_file: Option<PathBuf>,
    pub cli_user: Option<String>,
    pub cli_password: Option<String>,
    /// Explicit master identity; the applier connects here
    pub assume_master_host: Option<InstanceKey>,
    pub cli_master_user: Option<String>,
    pub cli_master_password: Option<String>,

    pub throttle_flag_file: Option<PathBuf>,
    pub throttle_additional_flag_file: Option<PathBuf>,
    pub postpone_cut_over_flag_file: Option<PathBuf>,
    pub panic_flag_file: Option<PathBuf>,
    /// Grace period before a repeated critical-load breach aborts; 0 aborts at once
    pub critical_load_interval_milliseconds: u64,
    /// Hibernate instead of aborting on critical load; 0 disables
    pub critical_load_hibernate_seconds: i64,

    /// Original column name to new name, from the ALTER analysis
    pub column_rename_map: HashMap<String, String>,
    pub dropped_columns: HashSet<String>,

    chunk_size: AtomicI64,
    dml_batch_size: AtomicI64,
    heartbeat_interval_milliseconds: AtomicI64,
    max_lag_milliseconds_throttle_threshold: AtomicI64,
    cut_over_lock_timeout_seconds: AtomicI64,
    exponential_backoff_max_interval: AtomicI64,

    throttle: Mutex<ThrottleState>,
    http_throttle: Mutex<HttpThrottleState>,
    config: Mutex<ConfigState>,
    point_of_interest: Mutex<Instant>,

    total_rows_copied: AtomicI64,
    iteration: AtomicI64,
    current_progress: AtomicU64,
    current_lag_nanos: AtomicI64,
    total_dml_events_applied: AtomicI64,
    rows_estimate: AtomicI64,
    rows_delta_estimate: AtomicI64,
    throttle_http_status_code: AtomicI64,
    throttle_commanded_by_user: AtomicBool,
    /// Unix seconds; 0 when not hibernating
    hibernate_until: AtomicI64,

    in_cut_over_critical_section: AtomicBool,
    cleanup_imminent: AtomicBool,
    cut_over_complete: AtomicBool,
    counting_rows: AtomicBool,
    all_events_up_to_lock_processed: AtomicBool,
    user_commanded_unpostpone: AtomicBool,
    is_postponing_cut_over: AtomicBool,

    abort: AbortHandle,
    abort_coordinator: Mutex<Option<AbortCoordinator>>,
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationContext {
    /// Context with default tunables, a fresh uuid and an unused abort channel.
    pub fn new() -> Self {
        let (abort, coordinator) = abort_channel();
        Self {
            uuid: Uuid::new_v4().to_string(),
            database_name: String::new(),
            original_table_name: String::new(),
            alter_statement: String::new(),
            force_tmp_table_name: None,
            timestamp_old_table: false,
            cut_over_type: CutOverType::Atomic,
            cut_over_exponential_backoff: false,
            start_time: Local::now(),
            table_engine: String::new(),
            original_binlog_format: String::new(),
            used_rows_estimate_method: RowsEstimateMethod::default(),
            test_on_replica: false,
            test_on_replica_skip_replica_stop: false,
            migrate_on_replica: false,
            allow_on_master: false,
            switch_to_rbr: false,
            assume_rbr: false,
            aliyun_rds: false,
            google_cloud_platform: false,
            approve_renamed_columns: false,
            skip_renamed_columns: false,
            config_file: None,
            cli_user: None,
            cli_password: None,
            assume_master_host: None,
            cli_master_user: None,
            cli_master_password: None,
            throttle_flag_file: None,
            throttle_additional_flag_file: None,
            postpone_cut_over_flag_file: None,
            panic_flag_file: None,
            critical_load_interval_milliseconds: 0,
            critical_load_hibernate_seconds: 0,
            column_rename_map: HashMap::new(),
            dropped_columns: HashSet::new(),
            chunk_size: AtomicI64::new(DEFAULT_CHUNK_SIZE),
            dml_batch_size: AtomicI64::new(DEFAULT_DML_BATCH_SIZE),
            heartbeat_interval_milliseconds: AtomicI64::new(DEFAULT_HEARTBEAT_INTERVAL_MILLIS),
            max_lag_milliseconds_throttle_threshold: AtomicI64::new(DEFAULT_MAX_LAG_MILLIS),
            cut_over_lock_timeout_seconds: AtomicI64::new(DEFAULT_CUT_OVER_LOCK_TIMEOUT_SECONDS),
            exponential_backoff_max_interval: AtomicI64::new(
                DEFAULT_EXPONENTIAL_BACKOFF_MAX_INTERVAL,
            ),
            throttle: Mutex::new(ThrottleState {
                default_num_retries: DEFAULT_NUM_RETRIES,
                ..Default::default()
            }),
            http_throttle: Mutex::new(HttpThrottleState::default()),
            config: Mutex::new(ConfigState::default()),
            point_of_interest: Mutex::new(Instant::now()),
            total_rows_copied: AtomicI64::new(0),
            iteration: AtomicI64::new(0),
            current_progress: AtomicU64::new(0f64.to_bits()),
            current_lag_nanos: AtomicI64::new(0),
            total_dml_events_applied: AtomicI64::new(0),
            rows_estimate: AtomicI64::new(0),
            rows_delta_estimate: AtomicI64::new(0),
            throttle_http_status_code: AtomicI64::new(0),
            throttle_commanded_by_user: AtomicBool::new(false),
            hibernate_until: AtomicI64::new(0),
            in_cut_over_critical_section: AtomicBool::new(false),
            cleanup_imminent: AtomicBool::new(false),
            cut_over_complete: AtomicBool::new(false),
            counting_rows: AtomicBool::new(false),
            all_events_up_to_lock_processed: AtomicBool::new(false),
            user_commanded_unpostpone: AtomicBool::new(false),
            is_postponing_cut_over: AtomicBool::new(false),
            abort,
            abort_coordinator: Mutex::new(Some(coordinator)),
        }
    }

    // ========================================================================
    // Table names
    // ========================================================================

    fn tmp_base_name(&self) -> &str {
        self.force_tmp_table_name
            .as_deref()
            .unwrap_or(&self.original_table_name)
    }

    /// Shadow table receiving copied rows: `_<table>_gho`.
    pub fn ghost_table_name(&self) -> String {
        safe_table_name(self.tmp_base_name(), "gho")
    }

    /// Name the original table is renamed to at cut-over.
    pub fn old_table_name(&self) -> String {
        if self.timestamp_old_table {
            let suffix = format!("{}_del", self.start_time.format("%Y%m%d%H%M%S"));
            return safe_table_name(self.tmp_base_name(), &suffix);
        }
        safe_table_name(self.tmp_base_name(), "del")
    }

    /// Heartbeat/state table: `_<table>_ghc`.
    pub fn changelog_table_name(&self) -> String {
        safe_table_name(self.tmp_base_name(), "ghc")
    }

    /// Name of the advisory lock held during cut-over.
    pub fn voluntary_lock_name(&self) -> String {
        format!("{}.{}.lock", self.database_name, self.original_table_name)
    }

    // ========================================================================
    // Environment checks
    // ========================================================================

    /// True unless the server already logs in `ROW` format.
    pub fn requires_binlog_format_change(&self) -> bool {
        self.original_binlog_format != "ROW"
    }

    /// InnoDB and TokuDB tables can be migrated; others cannot.
    pub fn is_transactional_table(&self) -> bool {
        matches!(
            self.table_engine.to_lowercase().as_str(),
            "innodb" | "tokudb"
        )
    }

    /// Fail unless the server logs in `ROW` format, or may be switched to it.
    pub fn check_binlog_format(&self) -> Result<()> {
        if self.assume_rbr || !self.requires_binlog_format_change() {
            return Ok(());
        }
        if !self.switch_to_rbr {
            return Err(OscError::validation(format!(
                "You must be using ROW binlog format. I can switch it for you, \
                 provided --switch-to-rbr and that {} doesn't have replicas",
                self.inspector_connection_config().key
            )));
        }
        debug!(format = %self.original_binlog_format, "Binlog format will be switched to ROW");
        Ok(())
    }

    /// Check the inspected server's role against the operator's choices.
    pub fn check_execution_host(&self, is_replica: bool) -> Result<()> {
        if is_replica {
            return Ok(());
        }
        if self.test_on_replica || self.migrate_on_replica {
            return Err(OscError::validation(format!(
                "--test-on-replica or --migrate-on-replica given but {} is not a replica",
                self.inspector_connection_config().key
            )));
        }
        if !self.allow_on_master {
            return Err(OscError::validation(
                "It seems like this migration attempt to run directly on master. \
                 Preferably it would be executed on a replica (and this reduces load \
                 from the master). To proceed please provide --allow-on-master.",
            ));
        }
        Ok(())
    }

    /// Whether replication on the test replica is stopped at cut-over.
    pub fn should_stop_replication(&self) -> bool {
        self.test_on_replica && !self.test_on_replica_skip_replica_stop
    }

    /// Record the ALTER analysis, refusing statements that cannot be migrated.
    ///
    /// Renaming the table is not supported. Renaming columns needs explicit
    /// approval (`approve_renamed_columns`) unless renamed columns are skipped.
    pub fn apply_alter_analysis(&mut self, parser: &AlterTableParser) -> Result<()> {
        if parser.is_rename_table() {
            return Err(OscError::validation(
                "ALTER statement seems to RENAME the table. This is not supported, \
                 and you should run your RENAME outside the migration.",
            ));
        }

        if parser.has_non_trivial_renames() && !self.skip_renamed_columns {
            let renames = parser.non_trivial_renames();
            let mut listed: Vec<String> = renames
                .iter()
                .map(|(old, new)| format!("{}->{}", old, new))
                .collect();
            listed.sort();

            if !self.approve_renamed_columns {
                return Err(OscError::validation(format!(
                    "The ALTER statement renames columns, as follows: [{}]; as precaution, \
                     confirm with --approve-renamed-columns, or skip renamed columns via \
                     --skip-renamed-columns, in which case column data may be lost",
                    listed.join(", ")
                )));
            }
            info!(renames = %listed.join(", "), "ALTER renames columns; approved");
            self.column_rename_map = renames;
        }

        self.dropped_columns = parser.dropped_columns().clone();
        Ok(())
    }

    // ========================================================================
    // Timing
    // ========================================================================

    /// Time since the migration started.
    pub fn elapsed_time(&self) -> Duration {
        (Local::now() - self.start_time)
            .to_std()
            .unwrap_or_default()
    }

    /// Record the start of row copy. Called once.
    pub fn mark_row_copy_start_time(&self) {
        self.throttle.lock().row_copy_start = Some(Instant::now());
    }

    pub fn mark_row_copy_end_time(&self) {
        self.throttle.lock().row_copy_end = Some(Instant::now());
    }

    /// Zero before row copy starts; live until the end is marked.
    pub fn elapsed_row_copy_time(&self) -> Duration {
        let state = self.throttle.lock();
        match (state.row_copy_start, state.row_copy_end) {
            (None, _) => Duration::ZERO,
            (Some(start), None) => start.elapsed(),
            (Some(start), Some(end)) => end.saturating_duration_since(start),
        }
    }

    /// Note that something happened worth reporting; returns the iteration.
    pub fn mark_point_of_interest(&self) -> i64 {
        *self.point_of_interest.lock() = Instant::now();
        self.iteration.load(Ordering::Relaxed)
    }

    /// Time since the last [`mark_point_of_interest`](Self::mark_point_of_interest).
    pub fn time_since_point_of_interest(&self) -> Duration {
        self.point_of_interest.lock().elapsed()
    }

    // ========================================================================
    // Clamped tunables
    // ========================================================================

    /// Rows per copy iteration.
    pub fn chunk_size(&self) -> i64 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// Rows per copy iteration, clamped to `[100, 100000]`.
    pub fn set_chunk_size(&self, chunk_size: i64) {
        self.chunk_size
            .store(chunk_size.clamp(100, 100_000), Ordering::Relaxed);
    }

    pub fn dml_batch_size(&self) -> i64 {
        self.dml_batch_size.load(Ordering::Relaxed)
    }

    /// Binlog events applied per transaction, clamped to `[1, 1000]`.
    pub fn set_dml_batch_size(&self, batch_size: i64) {
        self.dml_batch_size
            .store(batch_size.clamp(1, MAX_EVENTS_BATCH_SIZE), Ordering::Relaxed);
    }

    pub fn heartbeat_interval_milliseconds(&self) -> i64 {
        self.heartbeat_interval_milliseconds.load(Ordering::Relaxed)
    }

    /// Clamped to `[100, 1000]`.
    pub fn set_heartbeat_interval_milliseconds(&self, millis: i64) {
        self.heartbeat_interval_milliseconds
            .store(millis.clamp(100, 1000), Ordering::Relaxed);
    }

    /// Replication lag above which work throttles.
    pub fn max_lag_milliseconds_throttle_threshold(&self) -> i64 {
        self.max_lag_milliseconds_throttle_threshold
            .load(Ordering::Relaxed)
    }

    /// At least 100ms.
    pub fn set_max_lag_milliseconds_throttle_threshold(&self, millis: i64) {
        self.max_lag_milliseconds_throttle_threshold
            .store(millis.max(100), Ordering::Relaxed);
    }

    pub fn nice_ratio(&self) -> f64 {
        self.throttle.lock().nice_ratio
    }

    /// Sleep time relative to copy time, clamped to `[0, 100]`.
    pub fn set_nice_ratio(&self, ratio: f64) {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 100.0) };
        self.throttle.lock().nice_ratio = ratio;
    }

    // ========================================================================
    // Retry policy
    // ========================================================================

    /// Ignored unless `retries > 0`.
    pub fn set_default_num_retries(&self, retries: i64) {
        if retries > 0 {
            self.throttle.lock().default_num_retries = retries;
        }
    }

    /// Attempts granted to retried operations.
    pub fn max_retries(&self) -> i64 {
        self.throttle.lock().default_num_retries
    }

    /// Seconds to hold the cut-over lock before giving up on an attempt.
    pub fn cut_over_lock_timeout_seconds(&self) -> i64 {
        self.cut_over_lock_timeout_seconds.load(Ordering::Relaxed)
    }

    /// Accepts `[1, 10]`; otherwise the current value is kept.
    pub fn set_cut_over_lock_timeout_seconds(&self, timeout_seconds: i64) -> Result<()> {
        let current = self.cut_over_lock_timeout_seconds();
        if timeout_seconds < 1 {
            return Err(OscError::validation(format!(
                "Minimal timeout is 1sec. Timeout remains at {}",
                current
            )));
        }
        if timeout_seconds > 10 {
            return Err(OscError::validation(format!(
                "Maximal timeout is 10sec. Timeout remains at {}",
                current
            )));
        }
        self.cut_over_lock_timeout_seconds
            .store(timeout_seconds, Ordering::Relaxed);
        Ok(())
    }

    /// Upper bound, in seconds, for exponential backoff waits.
    pub fn exponential_backoff_max_interval(&self) -> i64 {
        self.exponential_backoff_max_interval.load(Ordering::Relaxed)
    }

    /// Accepts values `>= 2`; otherwise the current value is kept.
    pub fn set_exponential_backoff_max_interval(&self, interval_seconds: i64) -> Result<()> {
        if interval_seconds < 2 {
            return Err(OscError::validation(format!(
                "Minimal maximum interval is 2sec. Timeout remains at {}",
                self.exponential_backoff_max_interval()
            )));
        }
        self.exponential_backoff_max_interval
            .store(interval_seconds, Ordering::Relaxed);
        Ok(())
    }

    // ========================================================================
    // Throttle verdict
    // ========================================================================

    /// Store the final throttle verdict read by workers.
    pub fn set_throttled(&self, throttle: bool, reason: &str, hint: ThrottleReasonHint) {
        let mut state = self.throttle.lock();
        state.is_throttled = throttle;
        state.reason = reason.to_string();
        state.reason_hint = hint;
    }

    /// Current verdict as `(throttled, reason, hint)`.
    pub fn is_throttled(&self) -> (bool, String, ThrottleReasonHint) {
        if self.is_in_cut_over_critical_section() {
            return (false, "critical section".to_string(), ThrottleReasonHint::NoHint);
        }
        let state = self.throttle.lock();
        (state.is_throttled, state.reason.clone(), state.reason_hint)
    }

    pub fn set_throttle_general_check_result(&self, result: ThrottleCheckResult) {
        self.throttle.lock().general_check_result = result;
    }

    /// Last general check result, before lag checks.
    pub fn throttle_general_check_result(&self) -> ThrottleCheckResult {
        self.throttle.lock().general_check_result.clone()
    }

    /// Sleep until the verdict clears. Returns `false` if cancelled first.
    pub async fn wait_while_throttled(
        &self,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let (throttled, reason, _) = self.is_throttled();
            if !throttled {
                return true;
            }
            debug!(reason = %reason, "Waiting while throttled");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    pub fn throttle_commanded_by_user(&self) -> bool {
        self.throttle_commanded_by_user.load(Ordering::SeqCst)
    }

    pub fn set_throttle_commanded_by_user(&self, throttle: bool) {
        self.throttle_commanded_by_user
            .store(throttle, Ordering::SeqCst);
    }

    /// Unix seconds until which all work stops; 0 when not hibernating.
    pub fn hibernate_until(&self) -> i64 {
        self.hibernate_until.load(Ordering::SeqCst)
    }

    pub fn set_hibernate_until(&self, unix_seconds: i64) {
        self.hibernate_until.store(unix_seconds, Ordering::SeqCst);
    }

    pub fn throttle_query(&self) -> String {
        self.throttle.lock().throttle_query.clone()
    }

    pub fn set_throttle_query(&self, query: impl Into<String>) {
        self.throttle.lock().throttle_query = query.into();
    }

    pub fn throttle_http(&self) -> String {
        self.http_throttle.lock().url.clone()
    }

    pub fn set_throttle_http(&self, url: impl Into<String>) {
        self.http_throttle.lock().url = url.into();
    }

    pub fn ignore_http_errors(&self) -> bool {
        self.http_throttle.lock().ignore_http_errors
    }

    pub fn set_ignore_http_errors(&self, ignore: bool) {
        self.http_throttle.lock().ignore_http_errors = ignore;
    }

    /// Status of the last throttle HTTP probe; 0 after a transport error.
    pub fn throttle_http_status_code(&self) -> i64 {
        self.throttle_http_status_code.load(Ordering::Relaxed)
    }

    pub fn set_throttle_http_status_code(&self, code: i64) {
        self.throttle_http_status_code.store(code, Ordering::Relaxed);
    }

    // ========================================================================
    // Load and lag
    // ========================================================================

    /// Copy of the `--max-load` thresholds.
    pub fn max_load(&self) -> LoadMap {
        self.throttle.lock().max_load.duplicate()
    }

    /// Copy of the `--critical-load` thresholds.
    pub fn critical_load(&self) -> LoadMap {
        self.throttle.lock().critical_load.duplicate()
    }

    /// Replace the max-load thresholds; on parse error the current ones stay.
    pub fn read_max_load(&self, max_load_list: &str) -> Result<()> {
        let load_map = LoadMap::parse(max_load_list)?;
        self.throttle.lock().max_load = load_map;
        Ok(())
    }

    /// Replace the critical-load thresholds; on parse error the current ones stay.
    pub fn read_critical_load(&self, critical_load_list: &str) -> Result<()> {
        let load_map = LoadMap::parse(critical_load_list)?;
        self.throttle.lock().critical_load = load_map;
        Ok(())
    }

    /// Copy of the replicas whose lag is checked.
    pub fn throttle_control_replica_keys(&self) -> InstanceKeyMap {
        self.throttle.lock().control_replica_keys.clone()
    }

    /// Replace the control replicas; on parse error the current set stays.
    pub fn read_throttle_control_replica_keys(&self, replicas: &str) -> Result<()> {
        let mut keys = InstanceKeyMap::new();
        keys.read_comma_delimited_list(replicas)?;
        self.throttle.lock().control_replica_keys = keys;
        Ok(())
    }

    pub fn add_throttle_control_replica_key(&self, key: InstanceKey) {
        self.throttle.lock().control_replica_keys.add_key(key);
    }

    /// Last lag measurement stored for the control replicas.
    pub fn control_replicas_lag_result(&self) -> ReplicationLagResult {
        self.throttle.lock().control_replicas_lag_result.clone()
    }

    /// `None` stores the no-lag result.
    pub fn set_control_replicas_lag_result(&self, result: Option<ReplicationLagResult>) {
        self.throttle.lock().control_replicas_lag_result =
            result.unwrap_or_else(ReplicationLagResult::no_lag);
    }

    /// Heartbeat lag on the inspected server.
    pub fn current_lag(&self) -> Duration {
        let nanos = self.current_lag_nanos.load(Ordering::Relaxed);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(0))
    }

    pub fn set_current_lag(&self, lag: Duration) {
        let nanos = i64::try_from(lag.as_nanos()).unwrap_or(i64::MAX);
        self.current_lag_nanos.store(nanos, Ordering::Relaxed);
    }

    /// Latest position read by the binlog reader.
    pub fn recent_binlog_coordinates(&self) -> BinlogCoordinates {
        self.throttle.lock().recent_binlog_coordinates.clone()
    }

    pub fn set_recent_binlog_coordinates(&self, coordinates: BinlogCoordinates) {
        self.throttle.lock().recent_binlog_coordinates = coordinates;
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Rows copied so far.
    pub fn total_rows_copied(&self) -> i64 {
        self.total_rows_copied.load(Ordering::Relaxed)
    }

    /// Returns the new total.
    pub fn add_rows_copied(&self, rows: i64) -> i64 {
        self.total_rows_copied.fetch_add(rows, Ordering::Relaxed) + rows
    }

    pub fn iteration(&self) -> i64 {
        self.iteration.load(Ordering::Relaxed)
    }

    /// Returns the new iteration number.
    pub fn increment_iteration(&self) -> i64 {
        self.iteration.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Copy progress in `[0, 100]`.
    pub fn progress_pct(&self) -> f64 {
        f64::from_bits(self.current_progress.load(Ordering::Relaxed))
    }

    pub fn set_progress_pct(&self, pct: f64) {
        self.current_progress
            .store(pct.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
    }

    pub fn total_dml_events_applied(&self) -> i64 {
        self.total_dml_events_applied.load(Ordering::Relaxed)
    }

    pub fn add_dml_events_applied(&self, events: i64) -> i64 {
        self.total_dml_events_applied
            .fetch_add(events, Ordering::Relaxed)
            + events
    }

    pub fn rows_estimate(&self) -> i64 {
        self.rows_estimate.load(Ordering::Relaxed)
    }

    pub fn set_rows_estimate(&self, rows: i64) {
        self.rows_estimate.store(rows, Ordering::Relaxed);
    }

    /// Net rows added or removed by applied DML since the estimate.
    pub fn rows_delta_estimate(&self) -> i64 {
        self.rows_delta_estimate.load(Ordering::Relaxed)
    }

    pub fn add_rows_delta_estimate(&self, delta: i64) {
        self.rows_delta_estimate.fetch_add(delta, Ordering::Relaxed);
    }

    // ========================================================================
    // Cut-over flags
    // ========================================================================

    /// True while the tables are being swapped.
    pub fn is_in_cut_over_critical_section(&self) -> bool {
        self.in_cut_over_critical_section.load(Ordering::SeqCst)
    }

    pub fn set_in_cut_over_critical_section(&self, value: bool) {
        self.in_cut_over_critical_section
            .store(value, Ordering::SeqCst);
    }

    pub fn is_cleanup_imminent(&self) -> bool {
        self.cleanup_imminent.load(Ordering::SeqCst)
    }

    pub fn set_cleanup_imminent(&self, value: bool) {
        self.cleanup_imminent.store(value, Ordering::SeqCst);
    }

    pub fn is_cut_over_complete(&self) -> bool {
        self.cut_over_complete.load(Ordering::SeqCst)
    }

    pub fn set_cut_over_complete(&self, value: bool) {
        self.cut_over_complete.store(value, Ordering::SeqCst);
    }

    pub fn is_counting_rows(&self) -> bool {
        self.counting_rows.load(Ordering::SeqCst)
    }

    pub fn set_counting_rows(&self, value: bool) {
        self.counting_rows.store(value, Ordering::SeqCst);
    }

    /// True once the applier has caught up with the cut-over lock.
    pub fn is_all_events_up_to_lock_processed(&self) -> bool {
        self.all_events_up_to_lock_processed.load(Ordering::SeqCst)
    }

    pub fn set_all_events_up_to_lock_processed(&self, value: bool) {
        self.all_events_up_to_lock_processed
            .store(value, Ordering::SeqCst);
    }

    pub fn is_user_commanded_unpostpone(&self) -> bool {
        self.user_commanded_unpostpone.load(Ordering::SeqCst)
    }

    pub fn set_user_commanded_unpostpone(&self, value: bool) {
        self.user_commanded_unpostpone.store(value, Ordering::SeqCst);
    }

    pub fn is_postponing_cut_over(&self) -> bool {
        self.is_postponing_cut_over.load(Ordering::SeqCst)
    }

    pub fn set_postponing_cut_over(&self, value: bool) {
        self.is_postponing_cut_over.store(value, Ordering::SeqCst);
    }

    /// Cut-over waits while the postpone flag file exists, unless the
    /// operator has since commanded it to proceed.
    pub fn should_postpone_cut_over(&self) -> bool {
        if self.is_user_commanded_unpostpone() {
            return false;
        }
        self.postpone_cut_over_flag_file
            .as_ref()
            .is_some_and(|path| file_exists(path))
    }

    // ========================================================================
    // Configuration and credentials
    // ========================================================================

    /// Re-read the configuration file, if one is set.
    ///
    /// The `osc` section overrides chunk size, max lag and max load. A file
    /// that fails to read or parse changes nothing.
    pub fn read_config_file(&self) -> Result<()> {
        let Some(path) = &self.config_file else {
            return Ok(());
        };

        let file = FileConfig::from_file(path)?;
        let max_load = file
            .osc
            .max_load
            .as_deref()
            .map(LoadMap::parse)
            .transpose()?;
        let OscSection {
            chunk_size,
            max_lag_millis,
            ..
        } = file.osc.clone();

        self.config.lock().file = file;
        if let Some(chunk_size) = chunk_size {
            self.set_chunk_size(chunk_size);
        }
        if let Some(max_lag) = max_lag_millis {
            self.set_max_lag_milliseconds_throttle_threshold(max_lag);
        }
        if let Some(max_load) = max_load {
            self.throttle.lock().max_load = max_load;
        }

        info!(path = %path.display(), "Configuration file read");
        Ok(())
    }

    /// Replication lag query from the configuration file, if any.
    pub fn replication_lag_query(&self) -> Option<String> {
        self.config.lock().file.osc.replication_lag_query.clone()
    }

    /// Resolve inspector credentials: command line over file over current.
    pub fn apply_credentials(&self) {
        let mut config = self.config.lock();
        let ConfigState {
            file, inspector, ..
        } = &mut *config;

        if !file.client.user.is_empty() {
            inspector.user = file.client.user.clone();
        }
        if let Some(user) = self.cli_user.as_ref().filter(|u| !u.is_empty()) {
            inspector.user = user.clone();
        }
        if !file.client.password.is_empty() {
            inspector.password = file.client.password.clone();
        }
        if let Some(password) = self.cli_password.as_ref().filter(|p| !p.is_empty()) {
            inspector.password = password.clone();
        }
    }

    /// Point the applier at `assume_master_host`, if set.
    ///
    /// The applier inherits the inspector's credentials and TLS settings;
    /// non-empty master credentials override them.
    pub fn apply_assumed_master(&self) {
        let Some(master) = &self.assume_master_host else {
            return;
        };

        let mut config = self.config.lock();
        let mut applier = config.inspector.duplicate_credentials(master.clone());
        if let Some(user) = self.cli_master_user.as_ref().filter(|u| !u.is_empty()) {
            applier.user = user.clone();
        }
        if let Some(password) = self.cli_master_password.as_ref().filter(|p| !p.is_empty()) {
            applier.password = password.clone();
        }
        config.applier = applier;
        info!(master = %master, "Using assumed master host");
    }

    /// Where and as whom the inspector connects.
    pub fn inspector_connection_config(&self) -> ConnectionConfig {
        self.config.lock().inspector.clone()
    }

    pub fn set_inspector_connection_config(&self, config: ConnectionConfig) {
        self.config.lock().inspector = config;
    }

    /// Where and as whom the applier connects; the master unless migrating on a replica.
    pub fn applier_connection_config(&self) -> ConnectionConfig {
        self.config.lock().applier.clone()
    }

    pub fn set_applier_connection_config(&self, config: ConnectionConfig) {
        self.config.lock().applier = config;
    }

    /// True when inspector and applier reach the same server.
    pub fn inspector_is_also_applier(&self) -> bool {
        let config = self.config.lock();
        config.inspector.equals(&config.applier)
    }

    pub fn inspector_hostname(&self) -> String {
        self.config.lock().inspector.implied_hostname().to_string()
    }

    pub fn applier_hostname(&self) -> String {
        self.config.lock().applier.implied_hostname().to_string()
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Handle for publishing fatal errors.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Publish a fatal error.
    pub fn panic_abort(&self, err: OscError) {
        self.abort.abort(err);
    }

    /// The coordinator; `None` after the first call.
    pub fn take_abort_coordinator(&self) -> Option<AbortCoordinator> {
        self.abort_coordinator.lock().take()
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Point-in-time view for status reporting.
    pub fn status_snapshot(&self) -> MigrationStatus {
        let (is_throttled, throttle_reason, throttle_reason_hint) = self.is_throttled();
        MigrationStatus {
            uuid: self.uuid.clone(),
            database_name: self.database_name.clone(),
            original_table_name: self.original_table_name.clone(),
            ghost_table_name: self.ghost_table_name(),
            is_throttled,
            throttle_reason,
            throttle_reason_hint,
            total_rows_copied: self.total_rows_copied(),
            rows_estimate: self.rows_estimate() + self.rows_delta_estimate(),
            iteration: self.iteration(),
            progress_pct: self.progress_pct(),
            current_lag_millis: u64::try_from(self.current_lag().as_millis()).unwrap_or(u64::MAX),
            total_dml_events_applied: self.total_dml_events_applied(),
            elapsed_seconds: self.elapsed_time().as_secs(),
            row_copy_elapsed_seconds: self.elapsed_row_copy_time().as_secs(),
            chunk_size: self.chunk_size(),
            dml_batch_size: self.dml_batch_size(),
            max_lag_millis: self.max_lag_milliseconds_throttle_threshold(),
            nice_ratio: self.nice_ratio(),
            max_load: self.max_load().to_string(),
            critical_load: self.critical_load().to_string(),
            control_replicas: self.throttle_control_replica_keys().to_comma_delimited_list(),
            hibernate_until: self.hibernate_until(),
            in_cut_over_critical_section: self.is_in_cut_over_critical_section(),
            is_postponing_cut_over: self.is_postponing_cut_over(),
            cut_over_complete: self.is_cut_over_complete(),
            seconds_since_point_of_interest: self.time_since_point_of_interest().as_secs(),
        }
    }
}

/// Serializable status of a running migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub uuid: String,
    pub database_name: String,
    pub original_table_name: String,
    pub ghost_table_name: String,
    pub is_throttled: bool,
    pub throttle_reason: String,
    pub throttle_reason_hint: ThrottleReasonHint,
    pub total_rows_copied: i64,
    pub rows_estimate: i64,
    pub iteration: i64,
    pub progress_pct: f64,
    pub current_lag_millis: u64,
    pub total_dml_events_applied: i64,
    pub elapsed_seconds: u64,
    pub row_copy_elapsed_seconds: u64,
    pub chunk_size: i64,
    pub dml_batch_size: i64,
    pub max_lag_millis: i64,
    pub nice_ratio: f64,
    pub max_load: String,
    pub critical_load: String,
    pub control_replicas: String,
    pub hibernate_until: i64,
    pub in_cut_over_critical_section: bool,
    pub is_postponing_cut_over: bool,
    pub cut_over_complete: bool,
    pub seconds_since_point_of_interest: u64,
}

/// `_<base>_<suffix>`, trimming `base` so the result fits the identifier limit.
fn safe_table_name(base: &str, suffix: &str) -> String {
    let name = format!("_{}_{}", base, suffix);
    if name.len() <= MAX_TABLE_NAME_LENGTH {
        return name;
    }
    let mut keep = base.len().saturating_sub(name.len() - MAX_TABLE_NAME_LENGTH);
    while !base.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("_{}_{}", &base[..keep], suffix)
}
