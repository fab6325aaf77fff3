//! Building the migration context from the command line, and the
//! background tasks `main` runs next to the abort coordinator.

use crate::cli::Cli;
use anyhow::Context as _;
use ghostcut_core::{
    check_panic_flag_file, AlterTableParser, ConnectionConfig, InstanceKey, MigrationContext,
    TlsSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Build a fully configured [`MigrationContext`].
///
/// The configuration file is read first. Chunk size, max lag and max load
/// flags override its `osc` section only when given; a later reload lets the
/// file take over again.
pub fn build_context(cli: &Cli) -> anyhow::Result<MigrationContext> {
    let mut ctx = MigrationContext::new();

    ctx.database_name = cli.database.clone().unwrap_or_default();
    ctx.original_table_name = cli.table.clone().unwrap_or_default();
    ctx.alter_statement = cli.alter.clone().unwrap_or_default();
    ctx.force_tmp_table_name = cli.force_table_names.clone().filter(|n| !n.is_empty());
    ctx.timestamp_old_table = cli.timestamp_old_table;
    ctx.cut_over_type = cli.cut_over.parse()?;
    ctx.cut_over_exponential_backoff = cli.cut_over_exponential_backoff;

    ctx.test_on_replica = cli.test_on_replica;
    ctx.test_on_replica_skip_replica_stop = cli.test_on_replica_skip_replica_stop;
    ctx.migrate_on_replica = cli.migrate_on_replica;
    ctx.allow_on_master = cli.allow_on_master;
    ctx.switch_to_rbr = cli.switch_to_rbr;
    ctx.assume_rbr = cli.assume_rbr;
    ctx.aliyun_rds = cli.aliyun_rds;
    ctx.google_cloud_platform = cli.gcp;
    ctx.approve_renamed_columns = cli.approve_renamed_columns;
    ctx.skip_renamed_columns = cli.skip_renamed_columns;

    ctx.config_file = cli.conf.clone();
    ctx.cli_user = cli.user.clone();
    ctx.cli_password = cli.password.clone();
    ctx.assume_master_host = cli
        .assume_master_host
        .as_deref()
        .map(InstanceKey::parse)
        .transpose()
        .context("Invalid --assume-master-host")?;
    ctx.cli_master_user = cli.master_user.clone();
    ctx.cli_master_password = cli.master_password.clone();

    ctx.throttle_flag_file = cli.throttle_flag_file.clone();
    ctx.throttle_additional_flag_file = Some(cli.throttle_additional_flag_file.clone());
    ctx.postpone_cut_over_flag_file = cli.postpone_cut_over_flag_file.clone();
    ctx.panic_flag_file = cli.panic_flag_file.clone();
    ctx.critical_load_interval_milliseconds = cli.critical_load_interval_millis;
    ctx.critical_load_hibernate_seconds = cli.critical_load_hibernate_seconds;

    let mut inspector = ConnectionConfig::new(InstanceKey::new(cli.host.as_str(), cli.port));
    if cli.ssl {
        inspector.tls = Some(TlsSettings {
            ca_cert: cli.ssl_ca.clone(),
            client_cert: cli.ssl_cert.clone(),
            client_key: cli.ssl_key.clone(),
            allow_insecure: cli.ssl_allow_insecure,
        });
    }
    ctx.set_inspector_connection_config(inspector);

    ctx.read_config_file()?;
    ctx.read_throttle_control_replica_keys(&cli.throttle_control_replicas)?;
    if let Some(max_load) = &cli.max_load {
        ctx.read_max_load(max_load)?;
    }
    ctx.read_critical_load(&cli.critical_load)?;

    ctx.set_heartbeat_interval_milliseconds(cli.heartbeat_interval_millis);
    ctx.set_nice_ratio(cli.nice_ratio);
    if let Some(chunk_size) = cli.chunk_size {
        ctx.set_chunk_size(chunk_size);
    }
    ctx.set_dml_batch_size(cli.dml_batch_size);
    if let Some(max_lag) = cli.max_lag_millis {
        ctx.set_max_lag_milliseconds_throttle_threshold(max_lag);
    }
    ctx.set_throttle_query(cli.throttle_query.as_str());
    ctx.set_throttle_http(cli.throttle_http.as_str());
    ctx.set_ignore_http_errors(cli.ignore_http_errors);
    ctx.set_default_num_retries(cli.default_retries);
    ctx.apply_credentials();
    ctx.apply_assumed_master();

    if let Err(e) = ctx.set_cut_over_lock_timeout_seconds(cli.cut_over_lock_timeout_seconds) {
        warn!(error = %e, "Keeping default cut-over lock timeout");
    }
    if let Err(e) = ctx.set_exponential_backoff_max_interval(cli.exponential_backoff_max_interval)
    {
        warn!(error = %e, "Keeping default exponential backoff interval");
    }

    let parser = AlterTableParser::parse(&ctx.alter_statement);
    ctx.apply_alter_analysis(&parser)
        .context("ALTER statement rejected")?;

    Ok(ctx)
}

/// Re-read the configuration file and mark a point of interest.
pub fn reload_config(ctx: &MigrationContext) -> ghostcut_core::Result<i64> {
    ctx.read_config_file()?;
    Ok(ctx.mark_point_of_interest())
}

/// Poll the panic flag file until it appears or `shutdown` fires.
pub async fn watch_panic_flag_file(
    ctx: Arc<MigrationContext>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    if ctx.panic_flag_file.is_none() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = check_panic_flag_file(&ctx) {
            error!(error = %e, "Panic flag file detected");
            ctx.panic_abort(e);
            return;
        }
    }
}

/// Reload the configuration file on every SIGHUP.
#[cfg(unix)]
pub async fn reload_on_hangup(ctx: Arc<MigrationContext>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot install SIGHUP handler; config reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }
        debug!("Received SIGHUP");
        match reload_config(&ctx) {
            Ok(iteration) => info!(iteration, "Configuration reloaded"),
            Err(e) => error!(error = %e, "Configuration reload failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use ghostcut_core::CutOverType;
    use std::io::Write;

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec![
            "ghostcut",
            "--database",
            "shop",
            "--table",
            "orders",
            "--alter",
            "ADD COLUMN note TEXT",
        ];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    #[test]
    fn test_build_context_defaults() {
        let ctx = build_context(&cli(&[])).unwrap();
        assert_eq!(ctx.database_name, "shop");
        assert_eq!(ctx.ghost_table_name(), "_orders_gho");
        assert_eq!(ctx.cut_over_type, CutOverType::Atomic);
        assert_eq!(ctx.chunk_size(), 1000);
        assert_eq!(ctx.max_retries(), 60);
        assert_eq!(ctx.inspector_hostname(), "");
        assert_eq!(
            ctx.inspector_connection_config().key,
            InstanceKey::new("127.0.0.1", 3306)
        );
        assert!(ctx.max_load().is_empty());
    }

    #[test]
    fn test_build_context_clamps_and_parses() {
        let ctx = build_context(&cli(&[
            "--chunk-size",
            "50",
            "--dml-batch-size",
            "5000",
            "--max-load",
            "Threads_running=30",
            "--critical-load",
            "Threads_running=500",
            "--throttle-control-replicas",
            "r1:3307,r2",
            "--cut-over",
            "two-step",
        ]))
        .unwrap();

        assert_eq!(ctx.chunk_size(), 100);
        assert_eq!(ctx.dml_batch_size(), 1000);
        assert_eq!(ctx.max_load().get("Threads_running"), Some(30));
        assert_eq!(ctx.critical_load().get("Threads_running"), Some(500));
        assert_eq!(ctx.throttle_control_replica_keys().len(), 2);
        assert_eq!(ctx.cut_over_type, CutOverType::TwoStep);
    }

    #[test]
    fn test_out_of_range_timeouts_keep_defaults() {
        let ctx = build_context(&cli(&[
            "--cut-over-lock-timeout-seconds",
            "30",
            "--exponential-backoff-max-interval",
            "1",
        ]))
        .unwrap();
        assert_eq!(ctx.cut_over_lock_timeout_seconds(), 3);
        assert_eq!(ctx.exponential_backoff_max_interval(), 64);
    }

    #[test]
    fn test_build_context_rejects_bad_input() {
        assert!(build_context(&cli(&["--cut-over", "instant"])).is_err());
        assert!(build_context(&cli(&["--max-load", "Threads_running"])).is_err());

        let renaming = Cli::parse_from([
            "ghostcut",
            "--database",
            "shop",
            "--table",
            "orders",
            "--alter",
            "CHANGE COLUMN a b INT",
        ]);
        assert!(build_context(&renaming).is_err());
    }

    #[test]
    fn test_credentials_and_reload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "client:\n  user: file_user\n  password: file_pass\nosc:\n  chunk_size: 2000"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let ctx = build_context(&cli(&["--conf", &path, "--user", "cli_user"])).unwrap();
        let inspector = ctx.inspector_connection_config();
        assert_eq!(inspector.user, "cli_user");
        assert_eq!(inspector.password, "file_pass");
        assert_eq!(ctx.chunk_size(), 2000);
        assert_eq!(ctx.max_lag_milliseconds_throttle_threshold(), 1500);

        let before = ctx.iteration();
        reload_config(&ctx).unwrap();
        assert_eq!(ctx.chunk_size(), 2000);
        assert_eq!(ctx.iteration(), before);
    }

    #[test]
    fn test_explicit_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "osc:\n  chunk_size: 2000\n  max_lag_millis: 4000\n  max_load: Threads_running=40"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let ctx = build_context(&cli(&["--conf", &path])).unwrap();
        assert_eq!(ctx.chunk_size(), 2000);
        assert_eq!(ctx.max_lag_milliseconds_throttle_threshold(), 4000);
        assert_eq!(ctx.max_load().get("Threads_running"), Some(40));

        let ctx = build_context(&cli(&[
            "--conf",
            &path,
            "--chunk-size",
            "500",
            "--max-load",
            "Threads_running=25",
        ]))
        .unwrap();
        assert_eq!(ctx.chunk_size(), 500);
        assert_eq!(ctx.max_lag_milliseconds_throttle_threshold(), 4000);
        assert_eq!(ctx.max_load().get("Threads_running"), Some(25));
    }

    #[test]
    fn test_master_and_tls_flags() {
        let ctx = build_context(&cli(&[
            "--user",
            "osc",
            "--password",
            "replica-pass",
            "--assume-master-host",
            "master1:3307",
            "--master-password",
            "master-pass",
            "--ssl",
            "--ssl-ca",
            "/etc/mysql/ca.pem",
            "--allow-on-master",
            "--switch-to-rbr",
        ]))
        .unwrap();

        let applier = ctx.applier_connection_config();
        assert_eq!(applier.key, InstanceKey::new("master1", 3307));
        assert_eq!(applier.user, "osc");
        assert_eq!(applier.password, "master-pass");
        let tls = applier.tls.expect("tls settings");
        assert_eq!(tls.ca_cert.as_deref(), Some(std::path::Path::new("/etc/mysql/ca.pem")));
        assert!(ctx.check_execution_host(false).is_ok());
        assert!(ctx.check_binlog_format().is_ok());

        assert!(build_context(&cli(&["--assume-master-host", ":3306"])).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_flag_file_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("ghostcut.panic.flag");
        let flag_arg = flag.to_str().unwrap().to_string();

        let ctx = Arc::new(build_context(&cli(&["--panic-flag-file", &flag_arg])).unwrap());
        let token = ctx.abort_handle().cancellation_token();
        let watcher = tokio::spawn(watch_panic_flag_file(
            ctx.clone(),
            Duration::from_millis(100),
            token,
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!ctx.abort_handle().is_aborted());

        std::fs::File::create(&flag).unwrap();
        watcher.await.unwrap();
        assert!(ctx.abort_handle().is_aborted());
    }

    #[tokio::test]
    async fn test_watcher_without_flag_file_returns() {
        let ctx = Arc::new(build_context(&cli(&[])).unwrap());
        watch_panic_flag_file(ctx, Duration::from_millis(10), CancellationToken::new()).await;
    }
}
