//! ghostcut - Online schema migration for MySQL
//!
//! Usage:
//!   # Add a column, throttling on replica lag and load
//!   ghostcut --host replica1 --database shop --table orders \
//!     --alter "ADD COLUMN note TEXT" \
//!     --max-load Threads_running=25 \
//!     --throttle-control-replicas replica2,replica3
//!
//!   # Rename a column (must be approved)
//!   ghostcut --database shop --table orders \
//!     --alter "CHANGE COLUMN created created_at DATETIME" \
//!     --approve-renamed-columns
//!
//! Send SIGHUP to re-read the --conf file. Creating the --panic-flag-file
//! aborts immediately without cleanup.

use clap::Parser;
use ghostcut::{build_context, watch_panic_flag_file, Cli};
use ghostcut_core::utils::prettify_duration;
use ghostcut_core::{AbortOutcome, MigrationContext};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PANIC_FLAG_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let ctx = match build_context(&cli) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    };

    print_banner(&ctx);

    let coordinator = ctx
        .take_abort_coordinator()
        .ok_or_else(|| anyhow::anyhow!("abort coordinator already taken"))?;
    let shutdown = ctx.abort_handle().cancellation_token();

    tokio::spawn(watch_panic_flag_file(
        ctx.clone(),
        PANIC_FLAG_POLL_INTERVAL,
        shutdown.clone(),
    ));
    #[cfg(unix)]
    tokio::spawn(ghostcut::startup::reload_on_hangup(ctx.clone(), shutdown));

    let cleanup_ctx = ctx.clone();
    let outcome = coordinator
        .run(wait_for_shutdown_signal(), move || async move {
            report_final_status(&cleanup_ctx);
        })
        .await;

    match &outcome {
        AbortOutcome::Fatal(e) => {
            tracing::error!(error = %e, category = ?e.category(), "Migration aborted");
            std::process::exit(outcome.exit_code());
        }
        AbortOutcome::Shutdown => tracing::info!("Goodbye!"),
    }
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn report_final_status(ctx: &MigrationContext) {
    let status = ctx.status_snapshot();
    tracing::info!(
        uuid = %status.uuid,
        rows_copied = status.total_rows_copied,
        dml_events_applied = status.total_dml_events_applied,
        progress_pct = status.progress_pct,
        elapsed = %prettify_duration(ctx.elapsed_time()),
        row_copy = %prettify_duration(ctx.elapsed_row_copy_time()),
        throttled = status.is_throttled,
        "Final status"
    );
}

fn print_banner(ctx: &MigrationContext) {
    let inspector = ctx.inspector_connection_config();
    let replicas = ctx.throttle_control_replica_keys();

    eprintln!(
        r#"
ghostcut - online schema migration

  Migrating:    `{}`.`{}`
  Ghost table:  `{}`
  Alter:        {}
  Inspector:    {}
  Cut-over:     {}
  Chunk size:   {}
  Max lag:      {}ms
  Max load:     {}
  Replicas:     {}
"#,
        ctx.database_name,
        ctx.original_table_name,
        ctx.ghost_table_name(),
        ctx.alter_statement,
        inspector.key,
        ctx.cut_over_type,
        ctx.chunk_size(),
        ctx.max_lag_milliseconds_throttle_threshold(),
        ctx.max_load(),
        replicas.to_comma_delimited_list(),
    );
}
